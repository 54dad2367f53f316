//! Swap-and-drain buffer.

use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

/// Append-only buffer drained by swapping in an empty vector.
///
/// The lock is held only for a push or a swap; flush I/O works on the
/// detached batch. A flag coalesces overflow flushes to one per buffer.
pub struct SwapBuffer<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    flush_pending: AtomicBool,
}

impl<T> SwapBuffer<T> {
    /// Create a buffer pre-sized for one batch.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            flush_pending: AtomicBool::new(false),
        }
    }

    /// Append an item and return the new length.
    pub fn push(&self, item: T) -> usize {
        let mut items = self.items.lock();
        items.push(item);
        items.len()
    }

    /// Detach everything buffered so far.
    pub fn take(&self) -> Vec<T> {
        let mut items = self.items.lock();
        mem::replace(&mut *items, Vec::with_capacity(self.capacity))
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the right to run the overflow flush. Only one claim succeeds
    /// until [`release_flush`](Self::release_flush) is called.
    pub fn try_claim_flush(&self) -> bool {
        self.flush_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up the overflow flush claim.
    pub fn release_flush(&self) {
        self.flush_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_and_take() {
        let buffer = SwapBuffer::new(4);
        assert_eq!(buffer.push(1), 1);
        assert_eq!(buffer.push(2), 2);

        assert_eq!(buffer.take(), vec![1, 2]);
        assert!(buffer.is_empty());
        assert!(buffer.take().is_empty());
    }

    #[test]
    fn test_single_flush_claim() {
        let buffer: SwapBuffer<u8> = SwapBuffer::new(1);
        assert!(buffer.try_claim_flush());
        assert!(!buffer.try_claim_flush());
        buffer.release_flush();
        assert!(buffer.try_claim_flush());
    }

    #[test]
    fn test_concurrent_pushes() {
        let buffer = Arc::new(SwapBuffer::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        buffer.push(t * 1_000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut items = buffer.take();
        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), 8_000);
    }
}
