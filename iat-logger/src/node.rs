//! AF_PACKET capture backend.
//!
//! Runs the userspace hooks on traffic read from TPACKET_V3 rings, one ring
//! per worker. Frames the kernel marks as `PACKET_OUTGOING` go through the
//! egress hook, everything else through the ingress hook.

use std::{
    ffi::CString,
    future::Future,
    io::{self, Write},
    mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
    ptr, slice,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering, fence},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::{
    io::unix::AsyncFd,
    signal,
    sync::Notify,
    task::{self, JoinError},
    time,
};
use tracing::{info, warn};

use crate::channel::EventReceiver;
use crate::hooks::{EgressContext, IngressContext, Verdict, WorkerProbe};
use crate::lifecycle::{Instrumentation, InstrumentationConfig, Stopped};
use crate::observer::{Clock, MonotonicClock};
use crate::sink::CsvSink;

pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 20; // 1 MiB
pub const DEFAULT_BLOCK_COUNT: u32 = 64;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u32 = 100;

#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
    pub block_timeout_ms: u32,
}

pub struct NodeOptions {
    pub iface: String,
    pub workers: usize,
    pub fanout_group: Option<u16>,
    pub report_interval: Duration,
    pub duration: Option<Duration>,
    pub channel_capacity: usize,
    pub ring: RingConfig,
    pub output: PathBuf,
}

fn validate_ring_config(cfg: &RingConfig) -> Result<()> {
    ensure!(
        cfg.block_size != 0 && cfg.block_count != 0 && cfg.frame_size != 0,
        "ring parameters must be non-zero"
    );
    ensure!(
        cfg.frame_size <= cfg.block_size,
        "frame size must be <= block size"
    );
    ensure!(
        cfg.block_size % cfg.frame_size == 0,
        "block size must be a multiple of frame size"
    );
    let alignment = libc::TPACKET_ALIGNMENT as u32;
    ensure!(
        cfg.block_size % alignment == 0 && cfg.frame_size % alignment == 0,
        "block and frame sizes must be aligned to {alignment} bytes"
    );
    Ok(())
}

fn validate_node_options(opts: &NodeOptions) -> Result<()> {
    ensure!(opts.workers > 0, "workers must be at least 1");
    ensure!(
        opts.workers == 1 || opts.fanout_group.is_some(),
        "more than one worker needs --fanout-group, otherwise every worker sees every packet"
    );
    ensure!(
        !opts.report_interval.is_zero(),
        "report interval must be greater than zero"
    );
    validate_ring_config(&opts.ring)
}

pub async fn run_packet_pipeline(opts: NodeOptions) -> Result<()> {
    validate_node_options(&opts)?;

    let sink = CsvSink::create(&opts.output)?;
    let (mut instrumentation, receiver) = Instrumentation::init(InstrumentationConfig {
        workers: opts.workers,
        channel_capacity: opts.channel_capacity,
    })?;

    let running = Arc::new(AtomicBool::new(true));

    let mut handles = Vec::with_capacity(opts.workers);
    for worker_id in 0..opts.workers {
        let probe = instrumentation.take_probe(worker_id, MonotonicClock)?;
        let iface = opts.iface.clone();
        let fanout = opts.fanout_group;
        let ring_cfg = opts.ring;
        let running_clone = running.clone();
        handles.push(task::spawn(async move {
            worker_loop(probe, &iface, fanout, ring_cfg, running_clone).await
        }));
    }
    info!(
        iface = %opts.iface,
        workers = opts.workers,
        output = %opts.output.display(),
        "capturing, press Ctrl+C to stop"
    );

    let producers_done = Arc::new(Notify::new());
    let reporter_done = producers_done.clone();
    let report_interval = opts.report_interval;
    let mut reporter = tokio::spawn(async move {
        report_loop(receiver, sink, report_interval, reporter_done).await
    });

    let stopped = wait_for_shutdown(opts.duration, &mut reporter).await;
    running.store(false, Ordering::Relaxed);

    let mut first_err = None;
    for handle in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("worker panicked: {err}")),
        };
        if let Err(err) = result {
            first_err.get_or_insert(err);
        }
    }

    let reported = match stopped {
        Ok(Stopped::ConsumerExited(joined)) => reporter_outcome(joined)
            .and_then(|_| Err(anyhow!("event reporter stopped before shutdown"))),
        other => {
            // Workers are gone; the reporter drains what they left behind.
            producers_done.notify_one();
            let joined = reporter_outcome(reporter.await);
            other.and(joined).map(|_| ())
        }
    };
    instrumentation.teardown();

    // Consumer errors take precedence over worker errors.
    reported?;
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn reporter_outcome<W: Write>(joined: Result<Result<CsvSink<W>>, JoinError>) -> Result<CsvSink<W>> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(anyhow!("reporter panicked: {err}")),
    }
}

/// Waits for Ctrl-C, the end of the capture window, or the consumer task
/// ending on its own, whichever comes first.
async fn wait_for_shutdown<F>(duration: Option<Duration>, consumer: &mut F) -> Result<Stopped<F::Output>>
where
    F: Future + Unpin,
{
    let window = async {
        match duration {
            Some(window) => time::sleep(window).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        res = signal::ctrl_c() => {
            res.context("failed to wait for ctrl-c")?;
            info!("received shutdown signal, draining...");
            Ok(Stopped::Requested)
        }
        _ = window => {
            info!("capture window elapsed, draining...");
            Ok(Stopped::Requested)
        }
        out = consumer => {
            warn!("event reporter stopped early, ending capture");
            Ok(Stopped::ConsumerExited(out))
        }
    }
}

async fn report_loop<W: Write>(
    mut receiver: EventReceiver,
    mut sink: CsvSink<W>,
    report_interval: Duration,
    producers_done: Arc<Notify>,
) -> Result<CsvSink<W>> {
    let mut ticker = time::interval(report_interval);
    let mut reported_drops = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = producers_done.notified() => break,
        }
        let written = sink.record_all(receiver.poll_events())?;
        sink.flush()?;

        let dropped = receiver.dropped();
        if dropped > reported_drops {
            warn!(
                dropped,
                new = dropped - reported_drops,
                "event queues full, events dropped"
            );
            reported_drops = dropped;
        }
        tracing::debug!(written, "drained event queues");
    }

    while sink.record_all(receiver.poll_events())? > 0 {}
    sink.flush()?;
    info!(
        written = sink.written(),
        skipped = sink.skipped(),
        dropped = receiver.dropped(),
        "event stream closed"
    );
    Ok(sink)
}

async fn worker_loop(
    probe: WorkerProbe<MonotonicClock>,
    iface: &str,
    fanout_group: Option<u16>,
    ring_cfg: RingConfig,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let worker_id = probe.worker_id();
    let mut socket = PacketSocket::bind(iface, fanout_group, ring_cfg)
        .with_context(|| format!("worker {worker_id}: failed to bind packet socket"))?;
    socket.pump(&running, &probe).await
}

struct PacketSocket {
    fd: AsyncFd<OwnedFd>,
    ring: PacketRing,
}

impl PacketSocket {
    fn bind(iface: &str, fanout_group: Option<u16>, ring_cfg: RingConfig) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error()).context("failed to create packet socket");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let version = libc::tpacket_versions::TPACKET_V3 as libc::c_int;
        set_packet_option(fd.as_raw_fd(), libc::PACKET_VERSION, &version)
            .context("failed to enable TPACKET_V3")?;

        bind_interface(fd.as_raw_fd(), iface, protocol)?;

        if let Some(group) = fanout_group {
            let fanout: u32 = (group as u32) | (libc::PACKET_FANOUT_HASH << 16);
            set_packet_option(fd.as_raw_fd(), libc::PACKET_FANOUT, &fanout)
                .context("failed to configure PACKET_FANOUT")?;
        }

        let ring = PacketRing::map(fd.as_raw_fd(), ring_cfg)?;
        let fd = AsyncFd::new(fd).context("failed to register packet socket")?;
        Ok(Self { fd, ring })
    }

    async fn pump(&mut self, running: &AtomicBool, probe: &WorkerProbe<MonotonicClock>) -> Result<()> {
        let blocks = self.ring.block_count();
        while running.load(Ordering::Relaxed) {
            let mut made_progress = false;
            for _ in 0..blocks {
                if self.ring.consume_next_block(probe) {
                    made_progress = true;
                }
            }

            if !made_progress {
                let idle = Duration::from_millis(self.ring.block_timeout_ms().max(1) as u64);
                wait_readable(&self.fd, idle).await?;
            }
        }
        Ok(())
    }
}

/// Waits until the kernel retires a block, or `idle` passes so that shutdown
/// is noticed on a quiet link.
async fn wait_readable(fd: &AsyncFd<OwnedFd>, idle: Duration) -> Result<()> {
    if let Ok(guard) = time::timeout(idle, fd.readable()).await {
        let mut guard = guard.context("failed to wait for socket readability")?;
        guard.clear_ready();
    }
    Ok(())
}

fn set_packet_option<T>(fd: RawFd, option: libc::c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            option,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn bind_interface(fd: RawFd, iface: &str, protocol: u16) -> Result<()> {
    let ifname = CString::new(iface)?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("failed to look up interface {iface}"));
    }

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("failed to bind packet socket");
    }
    Ok(())
}

/// Offset of the `sockaddr_ll` that follows every `tpacket3_hdr`.
const SOCKADDR_LL_OFFSET: usize = tpacket_align(mem::size_of::<libc::tpacket3_hdr>());

const fn tpacket_align(len: usize) -> usize {
    let align = libc::TPACKET_ALIGNMENT as usize;
    (len + align - 1) & !(align - 1)
}

/// Frames the kernel reports with this packet type left through the interface.
fn is_outgoing(pkttype: u8) -> bool {
    pkttype == libc::PACKET_OUTGOING as u8
}

struct PacketRing {
    base: *mut u8,
    len: usize,
    req: libc::tpacket_req3,
    current_block: u32,
}

// Each ring belongs to exactly one PacketSocket, which is driven by one task.
unsafe impl Send for PacketRing {}

impl PacketRing {
    fn map(fd: RawFd, cfg: RingConfig) -> Result<Self> {
        let frame_nr = (cfg.block_size / cfg.frame_size)
            .checked_mul(cfg.block_count)
            .ok_or_else(|| anyhow!("ring size overflow"))?;

        let req = libc::tpacket_req3 {
            tp_block_size: cfg.block_size,
            tp_block_nr: cfg.block_count,
            tp_frame_size: cfg.frame_size,
            tp_frame_nr: frame_nr,
            tp_retire_blk_tov: cfg.block_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        };
        set_packet_option(fd, libc::PACKET_RX_RING, &req)
            .context("failed to configure PACKET_RX_RING")?;

        let len = (req.tp_block_size as usize)
            .checked_mul(req.tp_block_nr as usize)
            .ok_or_else(|| anyhow!("ring mmap length overflow"))?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context("failed to mmap PACKET_RX_RING");
        }

        Ok(Self {
            base: base as *mut u8,
            len,
            req,
            current_block: 0,
        })
    }

    fn block_count(&self) -> u32 {
        self.req.tp_block_nr
    }

    fn block_size(&self) -> usize {
        self.req.tp_block_size as usize
    }

    fn block_timeout_ms(&self) -> u32 {
        self.req.tp_retire_blk_tov
    }

    fn consume_next_block(&mut self, probe: &WorkerProbe<MonotonicClock>) -> bool {
        let idx = self.current_block;
        let block_ptr = unsafe { self.base.add(idx as usize * self.block_size()) };
        let desc = block_ptr as *mut libc::tpacket_block_desc;
        if unsafe { (*desc).hdr.bh1.block_status } & libc::TP_STATUS_USER == 0 {
            return false;
        }

        fence(Ordering::Acquire);
        let (offset, remaining) = unsafe {
            let hdr = &(*desc).hdr.bh1;
            (hdr.offset_to_first_pkt as usize, hdr.num_pkts)
        };
        let block = unsafe { slice::from_raw_parts(block_ptr as *const u8, self.block_size()) };
        for frame in (BlockFrames {
            block,
            offset,
            remaining,
        }) {
            dispatch_frame(probe, &frame);
        }

        // Hand the block back only after every read of it is done.
        fence(Ordering::Release);
        unsafe {
            (*desc).hdr.bh1.block_status = libc::TP_STATUS_KERNEL;
        }

        self.current_block = (idx + 1) % self.block_count();
        true
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        if !self.base.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Routes a frame to the hook for its direction. Lengths are the on-wire
/// length, not the captured prefix.
fn dispatch_frame<C: Clock>(probe: &WorkerProbe<C>, frame: &Frame<'_>) -> Verdict {
    if frame.outgoing {
        probe.egress_hook(&EgressContext::new(frame.wire_len))
    } else {
        probe.ingress_hook(&IngressContext::from_capture(frame.data, frame.wire_len))
    }
}

/// One captured frame inside a retired block.
struct Frame<'a> {
    data: &'a [u8],
    wire_len: u32,
    outgoing: bool,
}

/// Walks the `tpacket3_hdr` chain of one block, bounds-checking every hop.
struct BlockFrames<'a> {
    block: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for BlockFrames<'a> {
    type Item = Frame<'a>;

    fn next(&mut self) -> Option<Frame<'a>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let header_end = self
            .offset
            .checked_add(SOCKADDR_LL_OFFSET + mem::size_of::<libc::sockaddr_ll>())?;
        if header_end > self.block.len() {
            self.remaining = 0;
            return None;
        }

        let (hdr, sll) = unsafe {
            let base = self.block.as_ptr().add(self.offset);
            (
                ptr::read_unaligned(base as *const libc::tpacket3_hdr),
                ptr::read_unaligned(base.add(SOCKADDR_LL_OFFSET) as *const libc::sockaddr_ll),
            )
        };

        let data_start = self.offset + hdr.tp_mac as usize;
        let data_end = data_start + hdr.tp_snaplen as usize;
        if data_end > self.block.len() {
            self.remaining = 0;
            return None;
        }

        let frame = Frame {
            data: &self.block[data_start..data_end],
            wire_len: hdr.tp_len,
            outgoing: is_outgoing(sll.sll_pkttype),
        };

        match hdr.tp_next_offset {
            0 => self.remaining = 0,
            next => self.offset += next as usize,
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use iat_logger_common::{Direction, PacketEvent};

    use super::*;
    use crate::channel::emission_channel;
    use crate::observer::test_clock::ScriptedClock;

    /// Accepts nothing, like a full disk.
    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn ring(block_size: u32, block_count: u32, frame_size: u32) -> RingConfig {
        RingConfig {
            block_size,
            block_count,
            frame_size,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
        }
    }

    fn options(workers: usize, fanout_group: Option<u16>) -> NodeOptions {
        NodeOptions {
            iface: "eth0".to_string(),
            workers,
            fanout_group,
            report_interval: Duration::from_secs(5),
            duration: None,
            channel_capacity: 1024,
            ring: ring(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_COUNT, DEFAULT_FRAME_SIZE),
            output: PathBuf::from("packet_data.csv"),
        }
    }

    /// Lays out one block holding `frames` as the kernel would. Each frame is
    /// its captured bytes, its packet type and its length on the wire.
    fn block_with(frames: &[(&[u8], u8, u32)]) -> (Vec<u8>, usize) {
        let first = 64;
        let mut block = vec![0u8; 4096];
        let mut offset = first;
        for (i, (payload, pkttype, wire_len)) in frames.iter().enumerate() {
            let mac = tpacket_align(SOCKADDR_LL_OFFSET + mem::size_of::<libc::sockaddr_ll>());
            let next = if i + 1 == frames.len() {
                0
            } else {
                tpacket_align(mac + payload.len())
            };

            let mut hdr: libc::tpacket3_hdr = unsafe { mem::zeroed() };
            hdr.tp_next_offset = next as u32;
            hdr.tp_snaplen = payload.len() as u32;
            hdr.tp_len = *wire_len;
            hdr.tp_mac = mac as u16;
            let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
            sll.sll_pkttype = *pkttype;

            unsafe {
                let base = block.as_mut_ptr().add(offset);
                ptr::write_unaligned(base as *mut libc::tpacket3_hdr, hdr);
                ptr::write_unaligned(base.add(SOCKADDR_LL_OFFSET) as *mut libc::sockaddr_ll, sll);
            }
            block[offset + mac..offset + mac + payload.len()].copy_from_slice(payload);
            offset += next;
        }
        (block, first)
    }

    #[test]
    fn default_ring_config_is_valid() {
        let cfg = ring(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_COUNT, DEFAULT_FRAME_SIZE);
        assert!(validate_ring_config(&cfg).is_ok());
    }

    #[test]
    fn ring_config_rejects_bad_geometry() {
        assert!(validate_ring_config(&ring(0, 1, 2048)).is_err());
        assert!(validate_ring_config(&ring(4096, 1, 8192)).is_err());
        assert!(validate_ring_config(&ring(4096, 1, 3000)).is_err());
    }

    #[test]
    fn several_workers_need_a_fanout_group() {
        assert!(validate_node_options(&options(1, None)).is_ok());
        assert!(validate_node_options(&options(4, None)).is_err());
        assert!(validate_node_options(&options(4, Some(7))).is_ok());
        assert!(validate_node_options(&options(0, None)).is_err());
    }

    #[test]
    fn block_frames_classify_direction() {
        let incoming = [0xaau8; 60];
        let outgoing = [0xbbu8; 98];
        let (block, first) = block_with(&[
            (&incoming[..], libc::PACKET_HOST as u8, 60),
            (&outgoing[..], libc::PACKET_OUTGOING as u8, 98),
        ]);

        let frames: Vec<(usize, u32, bool)> = BlockFrames {
            block: &block,
            offset: first,
            remaining: 2,
        }
        .map(|f| (f.data.len(), f.wire_len, f.outgoing))
        .collect();
        assert_eq!(frames, vec![(60, 60, false), (98, 98, true)]);
    }

    #[test]
    fn block_frames_stop_at_block_end() {
        let payload = [0u8; 60];
        let (block, _) = block_with(&[(&payload[..], libc::PACKET_HOST as u8, 60)]);

        let mut frames = BlockFrames {
            block: &block,
            offset: block.len() - 8,
            remaining: 3,
        };
        assert!(frames.next().is_none());
        assert!(frames.next().is_none());
    }

    #[test]
    fn truncated_frames_keep_their_wire_length() {
        // A 9000-byte frame cut down to what fit in the ring frame.
        let captured = [0xccu8; 1900];
        let reply = [0xddu8; 9000];
        let (block, first) = block_with(&[
            (&captured[..], libc::PACKET_HOST as u8, 9000),
            (&reply[..1900], libc::PACKET_OUTGOING as u8, 9000),
        ]);

        let (mut instrumentation, mut receiver) = Instrumentation::init(InstrumentationConfig {
            workers: 1,
            channel_capacity: 8,
        })
        .expect("init");
        let probe = instrumentation
            .take_probe(0, ScriptedClock::new([100, 200]))
            .expect("probe");

        let frames = BlockFrames {
            block: &block,
            offset: first,
            remaining: 2,
        };
        for frame in frames {
            assert_eq!(frame.data.len(), 1900);
            assert_eq!(dispatch_frame(&probe, &frame), Verdict::Pass);
        }

        let events: Vec<PacketEvent> = receiver.poll_events().collect();
        assert_eq!(
            events,
            vec![
                PacketEvent::new(100, 0, 9000, Direction::Ingress),
                PacketEvent::new(200, 0, 9000, Direction::Egress),
            ]
        );
    }

    #[tokio::test]
    async fn reporter_failure_ends_the_capture() {
        let (_senders, receiver) = emission_channel(1, 4);
        let sink = CsvSink::new(FailingWriter).expect("header is buffered");
        let mut reporter = tokio::spawn(report_loop(
            receiver,
            sink,
            Duration::from_millis(10),
            Arc::new(Notify::new()),
        ));

        let stopped = time::timeout(Duration::from_secs(5), wait_for_shutdown(None, &mut reporter))
            .await
            .expect("capture kept running after the reporter failed")
            .expect("wait for shutdown");
        let Stopped::ConsumerExited(joined) = stopped else {
            panic!("expected the reporter to end the capture");
        };
        let err = match reporter_outcome(joined) {
            Ok(_) => panic!("reporter should have failed"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("flush"), "{err:#}");
    }

    #[tokio::test]
    async fn reporter_drains_as_soon_as_producers_finish() {
        let (senders, receiver) = emission_channel(1, 4);
        let done = Arc::new(Notify::new());
        let reporter = tokio::spawn(report_loop(
            receiver,
            CsvSink::new(Vec::new()).expect("sink"),
            Duration::from_secs(3600),
            done.clone(),
        ));

        senders[0].try_submit(PacketEvent::new(7, 0, 60, Direction::Ingress));
        done.notify_one();

        let sink = time::timeout(Duration::from_secs(5), reporter)
            .await
            .expect("reporter waited for its next tick")
            .expect("reporter panicked")
            .expect("report");
        assert_eq!(sink.written(), 1);
    }
}
