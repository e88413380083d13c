use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounded budget for diagnosis info objects
///
/// Every stored diagnosis info holds an [`InfoSlot`]; when the pool is
/// exhausted, recording degrades to "diagnosis unavailable" instead of
/// failing the connection. A capacity of 0 means unbounded.
#[derive(Debug, Default)]
pub struct DiagnosisInfoPool {
    capacity: usize,
    in_use: AtomicUsize,
}

impl DiagnosisInfoPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn unbounded() -> Arc<Self> {
        Self::new(0)
    }

    /// Take a slot, or `None` when the pool is exhausted
    pub fn try_acquire(self: &Arc<Self>) -> Option<InfoSlot> {
        let capacity = self.capacity;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                if capacity == 0 || used < capacity {
                    Some(used + 1)
                } else {
                    None
                }
            })
            .ok()?;
        Some(InfoSlot { pool: self.clone() })
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// RAII slot that returns to the pool when dropped
#[derive(Debug)]
pub struct InfoSlot {
    pool: Arc<DiagnosisInfoPool>,
}

impl Drop for InfoSlot {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_pool() {
        let pool = DiagnosisInfoPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_unbounded_pool() {
        let pool = DiagnosisInfoPool::unbounded();
        let slots: Vec<_> = (0..100).map(|_| pool.try_acquire().unwrap()).collect();
        assert_eq!(pool.in_use(), 100);
        drop(slots);
        assert_eq!(pool.in_use(), 0);
    }
}
