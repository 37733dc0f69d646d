use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Monotone id sources for persistent requests and matches. Ids are handed
/// out inside the write transaction that persists the owning record, so they
/// are monotone across the store. The `saved` latch makes the per-block
/// snapshot write idempotent: it re-arms whenever an id is allocated.
#[derive(Debug)]
pub struct ExchangeNums {
    next_xreqnum: AtomicU64,
    next_xmatchnum: AtomicU64,
    saved: AtomicBool,
}

impl ExchangeNums {
    /// Restores the counters from their persisted snapshot; zero means the
    /// store is fresh and numbering starts at one.
    pub fn restore(next_xreqnum: u64, next_xmatchnum: u64) -> Self {
        ExchangeNums {
            next_xreqnum: AtomicU64::new(next_xreqnum.max(1)),
            next_xmatchnum: AtomicU64::new(next_xmatchnum.max(1)),
            saved: AtomicBool::new(false),
        }
    }

    pub fn next_xreqnum(&self) -> u64 {
        self.next_xreqnum.load(Ordering::SeqCst)
    }

    pub fn next_xmatchnum(&self) -> u64 {
        self.next_xmatchnum.load(Ordering::SeqCst)
    }

    pub fn alloc_xreqnum(&self) -> u64 {
        let n = self.next_xreqnum.fetch_add(1, Ordering::SeqCst);
        self.saved.store(false, Ordering::SeqCst);
        n
    }

    pub fn alloc_xmatchnum(&self) -> u64 {
        let n = self.next_xmatchnum.fetch_add(1, Ordering::SeqCst);
        self.saved.store(false, Ordering::SeqCst);
        n
    }

    /// True exactly once after any allocation, telling the caller the
    /// snapshot row must be written this block.
    pub fn take_unsaved(&self) -> bool {
        !self.saved.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_floors_at_one() {
        let nums = ExchangeNums::restore(0, 0);
        assert_eq!(nums.next_xreqnum(), 1);
        assert_eq!(nums.alloc_xreqnum(), 1);
        assert_eq!(nums.next_xreqnum(), 2);
    }

    #[test]
    fn save_latch_rearms_on_alloc() {
        let nums = ExchangeNums::restore(5, 7);
        assert!(nums.take_unsaved());
        assert!(!nums.take_unsaved());
        nums.alloc_xmatchnum();
        assert!(nums.take_unsaved());
        assert!(!nums.take_unsaved());
    }
}
