#![cfg_attr(not(test), no_std)]

// Types and arithmetic shared between the eBPF programs and the userspace agent.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

/// Stored in a timing slot until the first packet is seen in that direction.
pub const TIMESTAMP_UNSET: u64 = 0;

/// Side of the instrumented interface a packet was observed on.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Ingress = 0,
    Egress = 1,
}

impl Direction {
    pub const COUNT: usize = 2;

    pub const fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Direction::Ingress),
            1 => Some(Direction::Egress),
            _ => None,
        }
    }

    pub const fn index(self) -> u32 {
        self as u32
    }

    pub const fn label(self) -> &'static str {
        match self {
            Direction::Ingress => "Incoming",
            Direction::Egress => "Outgoing",
        }
    }
}

/// Nanoseconds between `prior_ns` and `now_ns`.
///
/// Returns 0 when there is no prior observation, and clamps to 0 when the
/// clock went backwards instead of wrapping.
#[inline(always)]
pub const fn inter_arrival_ns(prior_ns: u64, now_ns: u64) -> u64 {
    if prior_ns == TIMESTAMP_UNSET {
        0
    } else {
        now_ns.saturating_sub(prior_ns)
    }
}

/// One observed packet, as streamed to the consumer.
///
/// Field order and widths are fixed; `_pad` makes the trailing alignment
/// explicit so the record is always 32 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketEvent {
    pub timestamp_ns: u64,
    pub iat_ns: u64,
    pub packet_length: u64,
    pub direction: u8,
    pub _pad: [u8; 7],
}

impl PacketEvent {
    pub const SIZE: usize = core::mem::size_of::<PacketEvent>();

    #[inline(always)]
    pub const fn new(
        timestamp_ns: u64,
        iat_ns: u64,
        packet_length: u64,
        direction: Direction,
    ) -> Self {
        Self {
            timestamp_ns,
            iat_ns,
            packet_length,
            direction: direction as u8,
            _pad: [0; 7],
        }
    }

    pub const fn direction(&self) -> Option<Direction> {
        Direction::from_wire(self.direction)
    }

    /// Decodes a record from a raw ring/perf payload in host byte order.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        let timestamp_ns = u64::from_ne_bytes(raw[0..8].try_into().ok()?);
        let iat_ns = u64::from_ne_bytes(raw[8..16].try_into().ok()?);
        let packet_length = u64::from_ne_bytes(raw[16..24].try_into().ok()?);
        Some(Self {
            timestamp_ns,
            iat_ns,
            packet_length,
            direction: raw[24],
            _pad: [0; 7],
        })
    }
}

// Behind the `user` feature so the eBPF side does not pull in aya.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::PacketEvent;
    use aya::Pod;

    unsafe impl Pod for PacketEvent {}
}
