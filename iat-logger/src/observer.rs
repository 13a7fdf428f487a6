use iat_logger_common::{Direction, PacketEvent, inter_arrival_ns};

use crate::timing::TimingStateStore;

/// Source of monotonic nanosecond timestamps.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC`, the same clock the kernel hands to eBPF programs.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC with a valid pointer cannot fail.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64)
            .wrapping_mul(1_000_000_000)
            .wrapping_add(ts.tv_nsec as u64)
    }
}

/// Builds the event for one packet and records its timestamp as the new
/// "last seen" for `(worker_id, direction)`. That slot update is the only
/// side effect.
#[inline]
pub fn observe<C: Clock + ?Sized>(
    timing: &TimingStateStore,
    clock: &C,
    worker_id: usize,
    direction: Direction,
    length_bytes: u64,
) -> PacketEvent {
    let now = clock.now_ns();
    let iat = match timing.read_and_update(worker_id, direction, now) {
        Some(prior) => inter_arrival_ns(prior, now),
        None => 0,
    };
    PacketEvent::new(now, iat, length_bytes, direction)
}

#[cfg(test)]
pub(crate) mod test_clock {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::Clock;

    /// Replays a fixed list of readings, one per call.
    pub struct ScriptedClock {
        readings: RefCell<VecDeque<u64>>,
    }

    impl ScriptedClock {
        pub fn new(readings: impl IntoIterator<Item = u64>) -> Self {
            Self {
                readings: RefCell::new(readings.into_iter().collect()),
            }
        }
    }

    impl Clock for ScriptedClock {
        fn now_ns(&self) -> u64 {
            self.readings
                .borrow_mut()
                .pop_front()
                .expect("scripted clock ran out of readings")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::ScriptedClock;
    use super::*;

    #[test]
    fn gaps_form_a_running_delta() {
        let timing = TimingStateStore::new(1);
        let clock = ScriptedClock::new([100, 150, 225, 1_000]);

        let iats: Vec<u64> = (0..4)
            .map(|_| observe(&timing, &clock, 0, Direction::Ingress, 64).iat_ns)
            .collect();
        assert_eq!(iats, vec![0, 50, 75, 775]);
    }

    #[test]
    fn event_carries_clock_length_and_direction() {
        let timing = TimingStateStore::new(1);
        let clock = ScriptedClock::new([42]);

        let event = observe(&timing, &clock, 0, Direction::Egress, 1500);
        assert_eq!(event, PacketEvent::new(42, 0, 1500, Direction::Egress));
    }

    #[test]
    fn stalled_clock_gives_zero_gap() {
        let timing = TimingStateStore::new(1);
        let clock = ScriptedClock::new([500, 500]);

        observe(&timing, &clock, 0, Direction::Ingress, 1);
        assert_eq!(observe(&timing, &clock, 0, Direction::Ingress, 1).iat_ns, 0);
    }

    #[test]
    fn clock_regression_clamps_and_rebases() {
        let timing = TimingStateStore::new(1);
        let clock = ScriptedClock::new([500, 400, 450]);

        observe(&timing, &clock, 0, Direction::Egress, 1);
        assert_eq!(observe(&timing, &clock, 0, Direction::Egress, 1).iat_ns, 0);
        assert_eq!(observe(&timing, &clock, 0, Direction::Egress, 1).iat_ns, 50);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock;
        let first = clock.now_ns();
        let second = clock.now_ns();
        assert!(first > 0);
        assert!(second >= first);
    }
}
