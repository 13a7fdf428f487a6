use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod channel;
mod ebpf_loader;
mod hooks;
mod lifecycle;
mod node;
mod observer;
mod sink;
mod timing;

#[derive(Parser)]
#[command(name = "iat-logger")]
#[command(about = "Per-packet inter-arrival time and size logger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the XDP ingress and TC egress programs and stream their events
    Attach(AttachCommand),
    /// Run the userspace hooks on an AF_PACKET capture instead of eBPF
    Node(NodeCommand),
    /// Print the pinned in-kernel drop counter as JSON
    Stats(StatsCommand),
}

#[derive(Args)]
struct OutputArgs {
    /// CSV file receiving one row per packet
    #[arg(long, value_name = "PATH", default_value = sink::DEFAULT_OUTPUT)]
    output: PathBuf,
    /// Seconds between drop reports and queue drains
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
    /// Stop on its own after this many seconds
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,
}

#[derive(Args)]
struct AttachCommand {
    /// Network interface to instrument
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// XDP attach mode for the ingress hook
    #[arg(long, value_enum, default_value_t = ebpf_loader::XdpMode::Skb)]
    xdp_mode: ebpf_loader::XdpMode,
    /// Size of the event ring in bytes (power of two, page multiple)
    #[arg(long, value_name = "BYTES")]
    ring_bytes: Option<u32>,
    /// Where the drop counter map is pinned
    #[arg(long, value_name = "PATH", default_value = ebpf_loader::DEFAULT_DROPS_PIN)]
    drops_pin: PathBuf,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct NodeCommand {
    /// Network interface to join via AF_PACKET
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Number of worker tasks, each with its own ring and timing slots
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// PACKET_FANOUT group id, required with more than one worker
    #[arg(long, value_name = "GROUP")]
    fanout_group: Option<u16>,
    /// Events each worker may queue before new ones are dropped
    #[arg(long, value_name = "EVENTS", default_value_t = lifecycle::DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,
    /// Size of each tpacket block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    /// Number of blocks provisioned for the RX ring
    #[arg(long, value_name = "COUNT", default_value_t = node::DEFAULT_BLOCK_COUNT)]
    block_count: u32,
    /// Size of each frame within a block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_FRAME_SIZE)]
    frame_size: u32,
    /// Milliseconds before an idle block is recycled
    #[arg(long, value_name = "MILLIS", default_value_t = node::DEFAULT_BLOCK_TIMEOUT_MS)]
    block_timeout_ms: u32,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct StatsCommand {
    /// Pinned drop counter map written by `attach`
    #[arg(long, value_name = "PATH", default_value = ebpf_loader::DEFAULT_DROPS_PIN)]
    drops_pin: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(err) = run().await {
        tracing::error!("iat-logger error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = ebpf_loader::AttachOptions {
                iface: cmd.iface,
                xdp_mode: cmd.xdp_mode,
                ring_bytes: cmd.ring_bytes,
                drops_pin_path: cmd.drops_pin,
                output: cmd.output.output,
                report_interval: Duration::from_secs(cmd.output.report_interval_secs),
                duration: cmd.output.duration_secs.map(Duration::from_secs),
            };
            ebpf_loader::attach_program(opts).await?;
        }
        Some(Commands::Node(cmd)) => {
            let opts = node::NodeOptions {
                iface: cmd.iface,
                workers: cmd.workers,
                fanout_group: cmd.fanout_group,
                report_interval: Duration::from_secs(cmd.output.report_interval_secs),
                duration: cmd.output.duration_secs.map(Duration::from_secs),
                channel_capacity: cmd.channel_capacity,
                ring: node::RingConfig {
                    block_size: cmd.block_size,
                    block_count: cmd.block_count,
                    frame_size: cmd.frame_size,
                    block_timeout_ms: cmd.block_timeout_ms,
                },
                output: cmd.output.output,
            };
            node::run_packet_pipeline(opts).await?;
        }
        Some(Commands::Stats(cmd)) => {
            let summary = ebpf_loader::dropped_events_summary(&cmd.drops_pin)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn attach_defaults_write_packet_data_csv() {
        let cli = Cli::try_parse_from(["iat-logger", "attach", "--iface", "eth0"]).expect("parse");
        let Some(Commands::Attach(cmd)) = cli.command else {
            panic!("expected attach subcommand");
        };
        assert_eq!(cmd.output.output, PathBuf::from("packet_data.csv"));
        assert_eq!(cmd.xdp_mode, ebpf_loader::XdpMode::Skb);
        assert_eq!(cmd.output.duration_secs, None);
        assert_eq!(cmd.ring_bytes, None);
    }

    #[test]
    fn node_accepts_worker_and_window_options() {
        let cli = Cli::try_parse_from([
            "iat-logger",
            "node",
            "--iface",
            "eth0",
            "--workers",
            "4",
            "--fanout-group",
            "42",
            "--channel-capacity",
            "16",
            "--duration-secs",
            "65",
        ])
        .expect("parse");
        let Some(Commands::Node(cmd)) = cli.command else {
            panic!("expected node subcommand");
        };
        assert_eq!(cmd.workers, 4);
        assert_eq!(cmd.fanout_group, Some(42));
        assert_eq!(cmd.channel_capacity, 16);
        assert_eq!(cmd.output.duration_secs, Some(65));
    }
}
