use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use stride::MovementConfig;
use stride_sim::{LinkConfig, SimConfig, SimReport, Simulation};

#[derive(Parser)]
#[command(name = "stride-sim")]
#[command(about = "Runs bot clients against a movement server over a simulated network")]
struct Args {
    #[arg(short, long, default_value_t = 4)]
    clients: usize,

    #[arg(short, long, default_value_t = 10.0)]
    seconds: f64,

    #[arg(long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(long, default_value_t = 0.0, help = "Unreliable packet loss (0-1)")]
    loss: f64,

    #[arg(long, default_value_t = 0.0, help = "Reliable packet loss (0-1)")]
    reliable_loss: f64,

    #[arg(long, default_value_t = 40, help = "One-way latency in ms")]
    latency_ms: u32,

    #[arg(long, default_value_t = 10, help = "Jitter in ms")]
    jitter_ms: u32,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(long, help = "Movement config TOML")]
    config: Option<PathBuf>,

    #[arg(long, help = "Send a canary frame to every client at this interval (seconds)")]
    canary_every: Option<f64>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let movement = match &args.config {
        Some(path) => MovementConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MovementConfig::default(),
    };

    let link = LinkConfig {
        loss: args.loss.clamp(0.0, 1.0),
        reliable_loss: args.reliable_loss.clamp(0.0, 1.0),
        latency: f64::from(args.latency_ms) / 1000.0,
        jitter: f64::from(args.jitter_ms) / 1000.0,
    };
    let config = SimConfig {
        clients: args.clients,
        seconds: args.seconds.max(0.0),
        tick_rate: args.tick_rate.max(1),
        seed: args.seed,
        canary_interval: args.canary_every.filter(|s| *s > 0.0),
        movement,
        ..SimConfig::default()
    }
    .with_link(link);

    info!(
        "simulating {} clients for {:.1}s: loss {:.0}% latency {}ms jitter {}ms seed {}",
        config.clients,
        config.seconds,
        link.loss * 100.0,
        args.latency_ms,
        args.jitter_ms,
        config.seed
    );

    let mut sim = Simulation::new(config);
    let report = sim.run();
    sim.shutdown();
    log_report(&report);
    Ok(())
}

fn log_report(report: &SimReport) {
    info!(
        "{} steps ({:.1}s) with {} clients",
        report.steps, report.simulated_seconds, report.clients
    );
    info!(
        "owner error: mean {:.3}m max {:.3}m over {} samples",
        report.owner_error.mean, report.owner_error.max, report.owner_error.samples
    );
    info!(
        "remote error: mean {:.3}m max {:.3}m over {} samples",
        report.remote_error.mean, report.remote_error.max, report.remote_error.samples
    );
    info!(
        "uplink: {} sent, {} dropped, {} bytes",
        report.uplink.sent, report.uplink.dropped, report.uplink.bytes
    );
    info!(
        "downlink: {} sent, {} dropped, {} bytes",
        report.downlink.sent, report.downlink.dropped, report.downlink.bytes
    );
    for (key, value) in &report.counters {
        info!("  {key} = {value}");
    }
}
