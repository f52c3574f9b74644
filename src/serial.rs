use std::sync::{Mutex, PoisonError};

/// Hands out certificate serial numbers for one certificate authority context.
///
/// Serials start at 1 and are strictly increasing. They are unique within the
/// lifetime of the allocator only; nothing is persisted between runs.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    last: Mutex<u64>,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        // The critical section cannot panic, so a poisoned lock still holds a valid counter.
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last += 1;
        *last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    #[test]
    fn serials_start_above_zero_and_increase() {
        let serials = SerialAllocator::new();
        let issued: Vec<u64> = (0..5).map(|_| serials.next()).collect();
        assert_eq!(issued, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn concurrent_callers_never_share_a_serial() {
        let serials = SerialAllocator::new();
        let per_thread = 250;
        let threads = 8;

        let issued: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| s.spawn(|| (0..per_thread).map(|_| serials.next()).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let unique: BTreeSet<u64> = issued.iter().copied().collect();
        assert_eq!(unique.len(), threads * per_thread);
        assert!(unique.iter().all(|&s| s > 0));
        assert_eq!(unique.iter().next_back(), Some(&((threads * per_thread) as u64)));
    }

    #[test]
    fn each_thread_observes_increasing_serials() {
        let serials = SerialAllocator::new();
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let seen: Vec<u64> = (0..100).map(|_| serials.next()).collect();
                    assert!(seen.windows(2).all(|w| w[0] < w[1]));
                });
            }
        });
    }
}
