//! Correlation ids for outbound frames.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of ids used to correlate outbound frames with server replies.
pub trait IdGenerator: Send + Sync {
    /// Returns the next id. Every call yields a value never returned before.
    fn next(&self) -> u64;
}

/// Lock-free, strictly increasing id source.
#[derive(Debug)]
pub struct SafeId {
    next_id: AtomicU64,
}

impl SafeId {
    pub fn new(seed: u64) -> Self {
        Self {
            next_id: AtomicU64::new(seed),
        }
    }
}

impl Default for SafeId {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdGenerator for SafeId {
    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::{IdGenerator, SafeId};

    #[test]
    fn starts_at_seed() {
        assert_eq!(SafeId::default().next(), 1);

        let ids = SafeId::new(40);
        assert_eq!(ids.next(), 40);
        assert_eq!(ids.next(), 41);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_000;

        let ids = Arc::new(SafeId::default());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || {
                    let seen: Vec<u64> = (0..PER_THREAD).map(|_| ids.next()).collect();
                    assert!(
                        seen.windows(2).all(|pair| pair[0] < pair[1]),
                        "ids must increase within a single caller"
                    );
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("id thread") {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
    }
}
