use std::sync::atomic::{AtomicU64, Ordering};

use iat_logger_common::{Direction, TIMESTAMP_UNSET};

/// Last-seen timestamps for one worker, one slot per direction.
///
/// Aligned to a cache line so neighbouring workers never share one.
#[repr(align(64))]
#[derive(Default)]
struct WorkerSlots {
    last_ns: [AtomicU64; Direction::COUNT],
}

/// Per-worker, per-direction timestamp of the last observed packet.
///
/// Every worker only ever touches its own `WorkerSlots`, so the atomics are
/// never contended; they only make the store shareable across threads.
pub struct TimingStateStore {
    workers: Box<[WorkerSlots]>,
}

impl TimingStateStore {
    pub fn new(workers: usize) -> Self {
        let workers = (0..workers).map(|_| WorkerSlots::default()).collect();
        Self { workers }
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stores `now_ns` in the slot and returns what it held before, or `None`
    /// if nothing had been observed there yet.
    ///
    /// # Panics
    ///
    /// Panics if `worker_id` is out of range.
    #[inline]
    pub fn read_and_update(&self, worker_id: usize, direction: Direction, now_ns: u64) -> Option<u64> {
        let slot = &self.workers[worker_id].last_ns[direction.index() as usize];
        match slot.swap(now_ns, Ordering::Relaxed) {
            TIMESTAMP_UNSET => None,
            prior => Some(prior),
        }
    }

    /// Puts every slot back to "no prior observation".
    pub fn reset(&self) {
        for worker in self.workers.iter() {
            for slot in &worker.last_ns {
                slot.store(TIMESTAMP_UNSET, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_read_reports_no_prior() {
        let store = TimingStateStore::new(2);
        assert_eq!(store.read_and_update(0, Direction::Ingress, 100), None);
        assert_eq!(store.read_and_update(0, Direction::Ingress, 150), Some(100));
        assert_eq!(store.read_and_update(0, Direction::Ingress, 225), Some(150));
    }

    #[test]
    fn directions_are_independent() {
        let store = TimingStateStore::new(1);
        assert_eq!(store.read_and_update(0, Direction::Ingress, 100), None);
        assert_eq!(store.read_and_update(0, Direction::Egress, 120), None);
        assert_eq!(store.read_and_update(0, Direction::Egress, 130), Some(120));
        assert_eq!(store.read_and_update(0, Direction::Ingress, 140), Some(100));
    }

    #[test]
    fn workers_are_independent() {
        let store = TimingStateStore::new(3);
        assert_eq!(store.workers(), 3);
        assert_eq!(store.read_and_update(0, Direction::Ingress, 10), None);
        assert_eq!(store.read_and_update(2, Direction::Ingress, 20), None);
        assert_eq!(store.read_and_update(1, Direction::Ingress, 30), None);
        assert_eq!(store.read_and_update(2, Direction::Ingress, 40), Some(20));
    }

    #[test]
    fn reset_clears_all_slots() {
        let store = TimingStateStore::new(2);
        store.read_and_update(0, Direction::Ingress, 10);
        store.read_and_update(1, Direction::Egress, 20);
        store.reset();
        assert_eq!(store.read_and_update(0, Direction::Ingress, 30), None);
        assert_eq!(store.read_and_update(1, Direction::Egress, 40), None);
    }

    #[test]
    fn concurrent_workers_keep_their_own_history() {
        let store = std::sync::Arc::new(TimingStateStore::new(4));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let base = (worker as u64 + 1) * 1_000_000;
                    let mut gaps = Vec::new();
                    for step in 0..1_000u64 {
                        let now = base + step * 10;
                        let prior = store.read_and_update(worker, Direction::Egress, now);
                        gaps.push(prior.map(|p| now - p));
                    }
                    gaps
                })
            })
            .collect();

        for handle in handles {
            let gaps = handle.join().expect("worker thread panicked");
            assert_eq!(gaps[0], None);
            assert!(gaps[1..].iter().all(|gap| *gap == Some(10)));
        }
    }
}
