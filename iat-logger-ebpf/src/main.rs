#![no_std]
#![no_main]

mod maps;

use aya_ebpf::bindings::{TC_ACT_OK, xdp_action};
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::macros::{classifier, xdp};
use aya_ebpf::programs::{TcContext, XdpContext};
use iat_logger_common::{Direction, PacketEvent, TIMESTAMP_UNSET, inter_arrival_ns};

use maps::{DROPPED_EVENTS, DROPPED_SLOT, LAST_TIMESTAMP, PACKET_EVENTS};

#[xdp]
pub fn handle_ingress(ctx: XdpContext) -> u32 {
    let len = ctx.data_end().saturating_sub(ctx.data()) as u64;
    record_packet_event(Direction::Ingress, len);
    xdp_action::XDP_PASS
}

#[classifier]
pub fn handle_egress(ctx: TcContext) -> i32 {
    record_packet_event(Direction::Egress, ctx.len() as u64);
    TC_ACT_OK
}

#[inline(always)]
fn record_packet_event(direction: Direction, packet_length: u64) {
    let now = unsafe { bpf_ktime_get_ns() };

    // Per-CPU slot: only this CPU ever writes it, so a plain swap is enough.
    let prior = match LAST_TIMESTAMP.get_ptr_mut(direction.index()) {
        Some(slot) => unsafe { core::mem::replace(&mut *slot, now) },
        None => TIMESTAMP_UNSET,
    };

    let event = PacketEvent::new(now, inter_arrival_ns(prior, now), packet_length, direction);
    if PACKET_EVENTS.output(&event, 0).is_err() {
        record_drop();
    }
}

fn record_drop() {
    if let Some(ptr) = DROPPED_EVENTS.get_ptr_mut(DROPPED_SLOT) {
        unsafe {
            *ptr = (*ptr).wrapping_add(1);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
