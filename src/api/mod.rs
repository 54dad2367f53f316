//! Public API of the metering engine.
//!
//! [`MeteringEngine`] is the single entry point for the gateway: it records
//! request metrics, answers quota checks and exposes budget, billing and
//! analytics operations.

mod engine;

pub use engine::{EngineHealth, MeteringEngine, MeteringEngineBuilder};
