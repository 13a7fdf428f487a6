use std::{
    fs,
    future::Future,
    io,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    maps::{Map, MapData, PerCpuArray, RingBuf},
};
use clap::ValueEnum;
use serde_json::{Value, json};
use tokio::{io::unix::AsyncFd, signal, task::JoinError, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use iat_logger_common::PacketEvent;

use crate::lifecycle::Stopped;
use crate::sink::CsvSink;

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/iat-logger"));
const MAP_PACKET_EVENTS: &str = "packet_events";
const MAP_DROPPED_EVENTS: &str = "dropped_events";
const INGRESS_PROGRAM: &str = "handle_ingress";
const EGRESS_PROGRAM: &str = "handle_egress";
const DROPPED_SLOT: u32 = 0;

pub const DEFAULT_DROPS_PIN: &str = "/sys/fs/bpf/iat_logger/dropped_events";

/// Reads the pinned per-CPU drop counter and sums it across CPUs.
///
/// Returns `{ "dropped_events": n, "per_cpu": [..] }`.
pub fn dropped_events_summary<P: AsRef<Path>>(pin_path: P) -> Result<Value> {
    let pin = pin_path.as_ref();

    let map_data =
        MapData::from_pin(pin).map_err(|e| anyhow!("failed to open pinned map: {}", e))?;
    let map_enum = Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type: {}", e))?;
    let drops = PerCpuArray::<_, u64>::try_from(map_enum)
        .map_err(|e| anyhow!("failed to convert to PerCpuArray: {}", e))?;
    let per_cpu = drops
        .get(&DROPPED_SLOT, 0)
        .map_err(|e| anyhow!("failed to read drop counter: {}", e))?;

    Ok(summarize_drops(&per_cpu))
}

/// Totals past `u64::MAX` are rendered as a decimal string.
fn summarize_drops(per_cpu: &[u64]) -> Value {
    let total = sum_per_cpu(per_cpu);
    let dropped_events = match u64::try_from(total) {
        Ok(total) => Value::from(total),
        Err(_) => Value::String(total.to_string()),
    };
    json!({
        "dropped_events": dropped_events,
        "per_cpu": per_cpu,
    })
}

fn sum_per_cpu<'a, I>(values: I) -> u128
where
    I: IntoIterator<Item = &'a u64>,
{
    values
        .into_iter()
        .fold(0u128, |total, v| total.wrapping_add(*v as u128))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    pub xdp_mode: XdpMode,
    /// Overrides the compiled-in event ring size.
    pub ring_bytes: Option<u32>,
    pub drops_pin_path: PathBuf,
    pub output: PathBuf,
    pub report_interval: Duration,
    /// Detach on its own after this long; otherwise wait for Ctrl-C.
    pub duration: Option<Duration>,
}

/// Loads both hooks onto `opts.iface`, streams events into the CSV output
/// until shutdown, then detaches.
pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts, page_size())?;

    let sink = CsvSink::create(&opts.output)?;

    let mut loader = EbpfLoader::new();
    if let Some(ring_bytes) = opts.ring_bytes {
        #[allow(deprecated)]
        {
            // `set_max_entries` is currently the only stable API across our Aya pin.
            loader.set_max_entries(MAP_PACKET_EVENTS, ring_bytes);
        }
    }

    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    pin_map(&mut bpf, MAP_DROPPED_EVENTS, &opts.drops_pin_path)?;

    let links = attach_hooks(&mut bpf, &opts.iface, opts.xdp_mode)?;
    info!(
        iface = %opts.iface,
        output = %opts.output.display(),
        "attached ingress (xdp) and egress (tc) hooks, press Ctrl+C to detach"
    );

    let ring_map = bpf
        .take_map(MAP_PACKET_EVENTS)
        .with_context(|| format!("map {MAP_PACKET_EVENTS} not found"))?;
    let ring = RingBuf::try_from(ring_map).context("event map has unexpected type")?;

    let cancel = CancellationToken::new();
    let mut reader = tokio::spawn(stream_events(ring, sink, cancel.clone()));

    let (watched, streamed) =
        match watch_drops(&bpf, opts.report_interval, opts.duration, &mut reader).await {
            Ok(Stopped::ConsumerExited(joined)) => (
                Ok(()),
                reader_outcome(joined)
                    .and_then(|_| Err(anyhow!("event reader stopped before shutdown"))),
            ),
            other => {
                cancel.cancel();
                (other.map(|_| ()), reader_outcome(reader.await))
            }
        };

    info!(iface = %opts.iface, "detaching hooks");
    detach_hooks(&mut bpf, links)?;

    let sink = streamed?;
    watched?;
    info!(
        written = sink.written(),
        skipped = sink.skipped(),
        "event stream closed"
    );
    Ok(())
}

fn reader_outcome(
    joined: Result<Result<CsvSink<fs::File>>, JoinError>,
) -> Result<CsvSink<fs::File>> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(anyhow!("event reader panicked: {err}")),
    }
}

fn validate_attach_options(opts: &AttachOptions, page_size: u32) -> Result<()> {
    ensure!(!opts.iface.is_empty(), "interface name must not be empty");
    ensure!(
        !opts.report_interval.is_zero(),
        "report interval must be greater than zero"
    );
    if let Some(ring_bytes) = opts.ring_bytes {
        ensure!(
            ring_bytes.is_power_of_two(),
            "ring size must be a power of two, got {ring_bytes}"
        );
        ensure!(
            ring_bytes >= page_size && ring_bytes % page_size == 0,
            "ring size must be a multiple of the page size ({page_size}), got {ring_bytes}"
        );
    }
    Ok(())
}

fn page_size() -> u32 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u32 } else { 4096 }
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    // A pin left by an earlier run points at that run's map.
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to remove stale pin {}", path.display()));
        }
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    map.pin(path)
        .map_err(|err| anyhow!("failed to pin map {map_name} at {}: {err}", path.display()))
}

struct HookLinks {
    iface: String,
    ingress: XdpLinkId,
    egress: SchedClassifierLinkId,
    /// The clsact qdisc was added by us and goes away on detach.
    owns_clsact: bool,
}

fn attach_hooks(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<HookLinks> {
    let ingress = attach_xdp(bpf, iface, mode)?;
    let (egress, owns_clsact) = match attach_tc_egress(bpf, iface) {
        Ok(attached) => attached,
        Err(err) => {
            // Do not leave a half-attached pair behind.
            if let Err(detach_err) = ingress_program(bpf).and_then(|p| {
                p.detach(ingress)
                    .context("failed to detach xdp program")
            }) {
                warn!(error = ?detach_err, "rollback of ingress hook failed");
            }
            return Err(err);
        }
    };
    Ok(HookLinks {
        iface: iface.to_string(),
        ingress,
        egress,
        owns_clsact,
    })
}

fn ingress_program(bpf: &mut Ebpf) -> Result<&mut Xdp> {
    bpf.program_mut(INGRESS_PROGRAM)
        .with_context(|| format!("program {INGRESS_PROGRAM} not found"))?
        .try_into()
        .context("ingress program has wrong type")
}

fn egress_program(bpf: &mut Ebpf) -> Result<&mut SchedClassifier> {
    bpf.program_mut(EGRESS_PROGRAM)
        .with_context(|| format!("program {EGRESS_PROGRAM} not found"))?
        .try_into()
        .context("egress program has wrong type")
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let program = ingress_program(bpf)?;
    program.load().context("failed to load xdp program")?;
    program
        .attach(iface, xdp_flags(mode))
        .with_context(|| format!("failed to attach xdp on {iface}"))
}

/// Returns the link and whether the clsact qdisc was created here.
fn attach_tc_egress(bpf: &mut Ebpf, iface: &str) -> Result<(SchedClassifierLinkId, bool)> {
    let owns_clsact = match tc::qdisc_add_clsact(iface) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => false,
        Err(err) => {
            return Err(err).with_context(|| format!("failed to add clsact qdisc on {iface}"));
        }
    };
    let attached = egress_program(bpf).and_then(|program| {
        program.load().context("failed to load tc program")?;
        program
            .attach(iface, TcAttachType::Egress)
            .with_context(|| format!("failed to attach tc egress on {iface}"))
    });
    match attached {
        Ok(link) => Ok((link, owns_clsact)),
        Err(err) => {
            if owns_clsact {
                remove_clsact(iface);
            }
            Err(err)
        }
    }
}

fn detach_hooks(bpf: &mut Ebpf, links: HookLinks) -> Result<()> {
    ingress_program(bpf)?
        .detach(links.ingress)
        .context("failed to detach xdp program")?;
    egress_program(bpf)?
        .detach(links.egress)
        .context("failed to detach tc program")?;
    if links.owns_clsact {
        remove_clsact(&links.iface);
    }
    Ok(())
}

fn clsact_delete_command(iface: &str) -> Command {
    let mut cmd = Command::new("tc");
    cmd.args(["qdisc", "del", "dev", iface, "clsact"]);
    cmd
}

/// Best effort: a leftover clsact qdisc is harmless, so failures only warn.
fn remove_clsact(iface: &str) {
    let mut cmd = clsact_delete_command(iface);
    match cmd.status() {
        Ok(status) if status.success() => info!(iface, "removed clsact qdisc"),
        Ok(status) => warn!(iface, %status, "failed to remove clsact qdisc"),
        Err(err) => warn!(iface, error = %err, "failed to run tc to remove clsact qdisc"),
    }
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

async fn stream_events(
    ring: RingBuf<MapData>,
    mut sink: CsvSink<fs::File>,
    cancel: CancellationToken,
) -> Result<CsvSink<fs::File>> {
    let mut ring = AsyncFd::new(ring).context("failed to register event ring")?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            guard = ring.readable_mut() => {
                let mut guard = guard.context("failed to wait for event ring")?;
                drain_ring(guard.get_inner_mut(), &mut sink)?;
                guard.clear_ready();
            }
        }
    }
    // Whatever was already in the ring at detach time.
    drain_ring(ring.get_mut(), &mut sink)?;
    sink.flush()?;
    Ok(sink)
}

fn drain_ring(ring: &mut RingBuf<MapData>, sink: &mut CsvSink<fs::File>) -> Result<()> {
    while let Some(item) = ring.next() {
        match PacketEvent::from_bytes(&item) {
            Some(event) => sink.record(&event)?,
            None => warn!(
                len = item.len(),
                expected = PacketEvent::SIZE,
                "event ring returned undersized payload"
            ),
        }
    }
    Ok(())
}

/// Waits for Ctrl-C, the end of the capture window, or the event reader
/// ending on its own, logging growth of the in-kernel drop counter every
/// `report_interval`.
async fn watch_drops<F>(
    bpf: &Ebpf,
    report_interval: Duration,
    duration: Option<Duration>,
    reader: &mut F,
) -> Result<Stopped<F::Output>>
where
    F: Future + Unpin,
{
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    let window = async {
        match duration {
            Some(d) => time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(window);

    let mut ticker = time::interval(report_interval);
    let mut reported = 0u128;
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to wait for shutdown signal")?;
                info!("received shutdown signal");
                return Ok(Stopped::Requested);
            }
            _ = &mut window => {
                info!("capture window elapsed");
                return Ok(Stopped::Requested);
            }
            out = &mut *reader => {
                warn!("event reader stopped early, detaching");
                return Ok(Stopped::ConsumerExited(out));
            }
            _ = ticker.tick() => {
                let dropped = live_dropped_events(bpf)?;
                if dropped > reported {
                    warn!(
                        dropped = %dropped,
                        new = %(dropped - reported),
                        "event ring full, events dropped"
                    );
                    reported = dropped;
                }
            }
        }
    }
}

fn live_dropped_events(bpf: &Ebpf) -> Result<u128> {
    let map = bpf
        .map(MAP_DROPPED_EVENTS)
        .with_context(|| format!("map {MAP_DROPPED_EVENTS} not found"))?;
    let drops =
        PerCpuArray::<_, u64>::try_from(map).context("drop counter map has unexpected type")?;
    let per_cpu = drops
        .get(&DROPPED_SLOT, 0)
        .context("failed to read drop counter")?;
    Ok(sum_per_cpu(per_cpu.iter()))
}
