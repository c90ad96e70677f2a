//! Per-client worker process.
//!
//! Reads credentials and scheduling parameters from the environment, dates
//! from the command line, and watches for an earlier slot until the target
//! date is reached. Progress goes to stdout one line per event; the process
//! exits 0 once the target is reached.

use chrono::NaiveDate;
use clap::Parser;

use slot_watcher::config::WorkerEnv;
use slot_watcher::watcher::{HttpSchedulingApi, NetworkClassifier, WatchConfig, WatchLoop};

/// Watch one client's schedule for an earlier appointment.
#[derive(Parser, Debug)]
#[command(name = "slot-worker")]
#[command(version)]
struct Args {
    /// Client this worker acts for.
    #[arg(long)]
    client_id: String,

    /// Currently booked date (YYYY-MM-DD).
    #[arg(short = 'c', long)]
    current: NaiveDate,

    /// Stop once booked on or before this date.
    #[arg(short = 't', long)]
    target: Option<NaiveDate>,

    /// Never book earlier than this date.
    #[arg(short = 'm', long)]
    min: Option<NaiveDate>,

    /// Log what would be booked without booking.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Plain lines on stdout; the manager reads them verbatim.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stdout)
        .init();

    let env = WorkerEnv::from_env()?;
    let api = HttpSchedulingApi::new(&env)?;

    let config = WatchConfig {
        current_date: args.current,
        target_date: args.target,
        min_date: args.min,
        refresh_delay: env.refresh_delay,
        cooldown: env.cooldown,
        dry_run: args.dry_run,
    };

    tracing::debug!(client_id = %args.client_id, "Worker starting");
    let mut watch = WatchLoop::new(api, NetworkClassifier, config);
    let booked = watch.run().await;
    tracing::info!("Finished with appointment on {booked}");
    Ok(())
}
