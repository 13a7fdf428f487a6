use std::sync::Arc;

use anyhow::{Result, anyhow, ensure};

use crate::channel::{EventReceiver, EventSender, emission_channel};
use crate::hooks::WorkerProbe;
use crate::observer::Clock;
use crate::timing::TimingStateStore;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Why a running capture stopped waiting.
#[derive(Debug)]
pub enum Stopped<T> {
    /// Ctrl-C, or the capture window elapsed.
    Requested,
    /// The consumer task ended on its own, carrying what it returned.
    ConsumerExited(T),
}

#[derive(Clone, Copy, Debug)]
pub struct InstrumentationConfig {
    pub workers: usize,
    /// Events each worker may have queued before new ones are dropped.
    pub channel_capacity: usize,
}

/// Timing state and event producers for one attach/detach cycle.
///
/// Created zeroed by [`Instrumentation::init`], handed out to workers one
/// probe at a time, and discarded by [`Instrumentation::teardown`].
pub struct Instrumentation {
    timing: Arc<TimingStateStore>,
    senders: Vec<Option<EventSender>>,
}

impl Instrumentation {
    pub fn init(cfg: InstrumentationConfig) -> Result<(Self, EventReceiver)> {
        ensure!(cfg.workers > 0, "workers must be at least 1");
        ensure!(
            cfg.channel_capacity > 0,
            "channel capacity must be greater than zero"
        );

        let timing = Arc::new(TimingStateStore::new(cfg.workers));
        let (senders, receiver) = emission_channel(cfg.workers, cfg.channel_capacity);
        tracing::debug!(
            workers = cfg.workers,
            channel_capacity = cfg.channel_capacity,
            "instrumentation initialised"
        );

        let instrumentation = Self {
            timing,
            senders: senders.into_iter().map(Some).collect(),
        };
        Ok((instrumentation, receiver))
    }

    pub fn workers(&self) -> usize {
        self.timing.workers()
    }

    /// Hands `worker_id` its probe. Each worker can claim one exactly once.
    pub fn take_probe<C: Clock>(&mut self, worker_id: usize, clock: C) -> Result<WorkerProbe<C>> {
        let workers = self.workers();
        let slot = self
            .senders
            .get_mut(worker_id)
            .ok_or_else(|| anyhow!("worker {worker_id} out of range (workers: {workers})"))?;
        let sender = slot
            .take()
            .ok_or_else(|| anyhow!("probe for worker {worker_id} already taken"))?;
        Ok(WorkerProbe::new(worker_id, self.timing.clone(), clock, sender))
    }

    /// Drops the timing state and any unclaimed producers. Events still queued
    /// stay with whoever holds the receiver; nothing guarantees they are read.
    pub fn teardown(self) {
        let unclaimed = self.senders.iter().filter(|s| s.is_some()).count();
        // Probes that outlive this cycle start over instead of carrying history.
        self.timing.reset();
        tracing::debug!(
            workers = self.timing.workers(),
            unclaimed,
            "instrumentation torn down"
        );
    }
}
