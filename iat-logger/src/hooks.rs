use std::sync::Arc;

use iat_logger_common::Direction;

use crate::channel::EventSender;
use crate::observer::{Clock, observe};
use crate::timing::TimingStateStore;

/// Forwarding decision returned to the packet path. Observation never
/// changes the fate of a packet, so there is only one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
}

/// Ingress packet as seen at the interface: the bounds of the received frame.
#[derive(Copy, Clone, Debug)]
pub struct IngressContext {
    data: usize,
    data_end: usize,
}

impl IngressContext {
    pub fn from_frame(frame: &[u8]) -> Self {
        let data = frame.as_ptr() as usize;
        Self {
            data,
            data_end: data + frame.len(),
        }
    }

    /// Frame of which only a prefix was captured. The extent still covers
    /// all `wire_len` bytes that crossed the interface.
    pub fn from_capture(captured: &[u8], wire_len: u32) -> Self {
        let mut ctx = Self::from_frame(captured);
        ctx.data_end = ctx.data + captured.len().max(wire_len as usize);
        ctx
    }

    pub fn len(&self) -> u64 {
        self.data_end.saturating_sub(self.data) as u64
    }
}

/// Egress packet as handed to the queueing layer: only its length metadata.
#[derive(Copy, Clone, Debug)]
pub struct EgressContext {
    len: u32,
}

impl EgressContext {
    pub fn new(len: u32) -> Self {
        Self { len }
    }

    pub fn len(&self) -> u64 {
        self.len as u64
    }
}

/// Everything one worker needs to run the hooks: its id, the shared timing
/// store (of which it only touches its own slots), a clock and its own
/// event queue.
pub struct WorkerProbe<C> {
    worker_id: usize,
    timing: Arc<TimingStateStore>,
    clock: C,
    events: EventSender,
}

impl<C: Clock> WorkerProbe<C> {
    pub(crate) fn new(
        worker_id: usize,
        timing: Arc<TimingStateStore>,
        clock: C,
        events: EventSender,
    ) -> Self {
        Self {
            worker_id,
            timing,
            clock,
            events,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn ingress_hook(&self, ctx: &IngressContext) -> Verdict {
        self.record(Direction::Ingress, ctx.len())
    }

    pub fn egress_hook(&self, ctx: &EgressContext) -> Verdict {
        self.record(Direction::Egress, ctx.len())
    }

    #[inline]
    fn record(&self, direction: Direction, length_bytes: u64) -> Verdict {
        let event = observe(
            &self.timing,
            &self.clock,
            self.worker_id,
            direction,
            length_bytes,
        );
        // A full queue only costs telemetry.
        let _ = self.events.try_submit(event);
        Verdict::Pass
    }
}
