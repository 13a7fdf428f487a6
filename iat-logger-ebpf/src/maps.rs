// Map definitions shared by the ingress and egress programs.
// Names are user-visible: the loader resizes, pins and reads them by name.

use aya_ebpf::macros::map;
use aya_ebpf::maps::{PerCpuArray, RingBuf};
use iat_logger_common::Direction;

/// Default size of the event ring; the loader may override it.
pub const EVENT_RING_BYTES: u32 = 256 * 1024;

pub const DROPPED_SLOT: u32 = 0;

/// Last packet timestamp per direction, one copy per CPU.
/// Index 0 is ingress, 1 is egress.
#[map(name = "last_timestamp")]
pub static LAST_TIMESTAMP: PerCpuArray<u64> =
    PerCpuArray::<u64>::with_max_entries(Direction::COUNT as u32, 0);

#[map(name = "packet_events")]
pub static PACKET_EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_RING_BYTES, 0);

/// Events the ring rejected because it was full.
#[map(name = "dropped_events")]
pub static DROPPED_EVENTS: PerCpuArray<u64> = PerCpuArray::<u64>::with_max_entries(1, 0);
