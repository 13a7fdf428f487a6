//! Bounded, drop-on-full conduit from packet workers to the event consumer.
//!
//! Each worker owns a private sub-queue, so producers never contend with
//! each other. The consumer merges the sub-queues when it drains them.
//! Every slot is allocated when the channel is created; submitting and
//! draining never touch the allocator.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crossbeam_queue::ArrayQueue;
use iat_logger_common::PacketEvent;

/// Outcome of a single [`EventSender::try_submit`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Submission {
    Delivered,
    Dropped,
}

struct SubQueue {
    events: ArrayQueue<PacketEvent>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Producer half for exactly one worker. Deliberately not `Clone`.
pub struct EventSender {
    queue: Arc<SubQueue>,
}

impl EventSender {
    /// Queues `event` without blocking. When the sub-queue is full, or the
    /// consumer is gone, the new event is discarded and counted.
    #[inline]
    pub fn try_submit(&self, event: PacketEvent) -> Submission {
        let queue = &*self.queue;
        if queue.closed.load(Ordering::Relaxed) || queue.events.push(event).is_err() {
            queue.dropped.fetch_add(1, Ordering::Relaxed);
            return Submission::Dropped;
        }
        Submission::Delivered
    }
}

pub struct EventReceiver {
    queues: Vec<Arc<SubQueue>>,
    capacity: usize,
    cursor: usize,
}

impl EventReceiver {
    /// Drains the sub-queues round-robin.
    ///
    /// The iterator yields at most one full channel's worth of events and
    /// ends as soon as every sub-queue is empty, so it always terminates even
    /// while producers keep submitting. Call it again to continue.
    pub fn poll_events(&mut self) -> PollEvents<'_> {
        let budget = self.capacity.saturating_mul(self.queues.len());
        PollEvents {
            receiver: self,
            budget,
        }
    }

    /// Events discarded by all workers since the channel was created.
    pub fn dropped(&self) -> u64 {
        self.queues
            .iter()
            .map(|queue| queue.dropped.load(Ordering::Relaxed))
            .fold(0u64, u64::wrapping_add)
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.closed.store(true, Ordering::Relaxed);
        }
    }
}

pub struct PollEvents<'a> {
    receiver: &'a mut EventReceiver,
    budget: usize,
}

impl Iterator for PollEvents<'_> {
    type Item = PacketEvent;

    fn next(&mut self) -> Option<PacketEvent> {
        if self.budget == 0 {
            return None;
        }
        let queues = self.receiver.queues.len();
        for _ in 0..queues {
            let idx = self.receiver.cursor;
            self.receiver.cursor = (idx + 1) % queues;
            if let Some(event) = self.receiver.queues[idx].events.pop() {
                self.budget -= 1;
                return Some(event);
            }
        }
        None
    }
}

/// Creates one sub-queue of `capacity` events per worker.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn emission_channel(workers: usize, capacity: usize) -> (Vec<EventSender>, EventReceiver) {
    let queues: Vec<Arc<SubQueue>> = (0..workers)
        .map(|_| {
            Arc::new(SubQueue {
                events: ArrayQueue::new(capacity),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            })
        })
        .collect();
    let senders = queues
        .iter()
        .map(|queue| EventSender {
            queue: queue.clone(),
        })
        .collect();

    let receiver = EventReceiver {
        queues,
        capacity,
        cursor: 0,
    };
    (senders, receiver)
}
