//! SHA-256d Miner - Main Application
//!
//! Replays upstream job events into the job coordinator, or mines a synthetic
//! job as a benchmark.

use sha256d_miner::{
    config::Config,
    events::{apply_event, UpstreamEvent},
    utils::{format_difficulty, format_duration, format_hash_rate, init_logging},
    worker::SubmissionSink,
    Error, JobCoordinator, JobNotification, MiningStats, Result, SubmissionRecord,
    APP_DESCRIPTION, APP_NAME, APP_VERSION,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await?;

    // Handle special commands
    if config.info {
        print_info();
        return Ok(());
    }

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _log_guard = init_logging(
        config.log_level.into(),
        config.log_format,
        config.log_file.as_deref(),
    )?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        software = !config.disable_software,
        accelerator = !config.disable_accelerator,
        pool_difficulty = config.pool_difficulty,
        benchmark = config.benchmark,
        "Configuration loaded"
    );

    let stats = Arc::new(MiningStats::new());
    let coordinator = Arc::new(JobCoordinator::from_config(&config, Arc::clone(&stats))?);

    let (submission_tx, submission_rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn SubmissionSink> = Arc::new(submission_tx);
    coordinator.spawn_engines(&config, sink)?;
    let submissions = tokio::spawn(print_submissions(submission_rx));

    let stop = coordinator.control().shutdown_token();
    let reporter = tokio::spawn(report_stats(
        Arc::clone(&stats),
        config.stats_interval_duration()?,
        stop.clone(),
    ));

    let run = async {
        if config.benchmark {
            run_benchmark(&coordinator, config.benchmark_duration()?).await
        } else {
            replay_events(&coordinator, &config).await?;
            info!("Event stream ended, mining the last job until interrupted");
            stop.cancelled().await;
            Ok(())
        }
    };

    let result = tokio::select! {
        result = run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    if let Err(e) = coordinator.shutdown().await {
        error!(error = %e, "Engine shutdown failed");
    }
    reporter.abort();
    // Engines own the only senders, so this completes once they are joined
    if let Err(e) = submissions.await {
        warn!(error = %e, "Submission printer failed");
    }

    log_stats(&stats);
    result
}

/// Feed newline-delimited events from the jobs file or stdin to the coordinator
async fn replay_events(coordinator: &JobCoordinator, config: &Config) -> Result<()> {
    match &config.jobs_file {
        Some(path) => {
            info!(path = %path.display(), "Replaying job events from file");
            let file = tokio::fs::File::open(path).await?;
            replay_from(coordinator, BufReader::new(file)).await
        }
        None => {
            info!("Replaying job events from stdin");
            replay_from(coordinator, BufReader::new(tokio::io::stdin())).await
        }
    }
}

async fn replay_from<R>(coordinator: &JobCoordinator, reader: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let event = match UpstreamEvent::parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping unparseable event");
                continue;
            }
        };

        match apply_event(coordinator, &event) {
            Ok(Some(pause)) => sleep(pause).await,
            Ok(None) => {}
            Err(Error::Cancelled { .. }) => break,
            // Dropped jobs are already logged by the coordinator
            Err(e @ Error::Job { .. }) | Err(e @ Error::Hex(_)) => {
                tracing::debug!(line = line_number, error = %e, "Event rejected");
            }
            Err(e) => {
                warn!(line = line_number, error = %e, category = e.category(), "Event rejected");
            }
        }
    }

    Ok(())
}

/// Mine a synthetic job for `duration` and report the hash rate
async fn run_benchmark(coordinator: &JobCoordinator, duration: Duration) -> Result<()> {
    info!(duration = %humantime::format_duration(duration), "Starting benchmark");
    coordinator.deliver_job(&benchmark_notification())?;

    sleep(duration).await;

    let snapshot = coordinator.stats().snapshot();
    let secs = duration.as_secs_f64().max(f64::EPSILON);
    info!(
        hashes_a = snapshot.hashes_a,
        hashes_b = snapshot.hashes_b,
        software_rate = %format_hash_rate(snapshot.hashes_a as f64 / secs),
        accelerator_rate = %format_hash_rate(snapshot.hashes_b as f64 / secs),
        total_rate = %format_hash_rate(snapshot.total_hashes as f64 / secs),
        "Benchmark complete"
    );
    println!(
        "{}",
        format_hash_rate(snapshot.total_hashes as f64 / secs)
    );
    Ok(())
}

/// Unsolvable job at the difficulty-one network target
fn benchmark_notification() -> JobNotification {
    let prev_hash: [u8; 32] = rand::random();
    JobNotification {
        job_id: "benchmark".to_string(),
        prev_hash: hex::encode(prev_hash),
        coinbase1: "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff2003a086010b2f62656e63682f".to_string(),
        coinbase2: "ffffffff0100f2052a01000000016a00000000".to_string(),
        merkle_branch: Vec::new(),
        version: "20000000".to_string(),
        nbits: "1d00ffff".to_string(),
        ntime: format!("{:08x}", sha256d_miner::utils::current_timestamp_secs() as u32),
        clean_jobs: true,
    }
}

/// Print every submission as a JSON line on stdout
async fn print_submissions(mut rx: mpsc::UnboundedReceiver<SubmissionRecord>) {
    while let Some(record) = rx.recv().await {
        match serde_json::to_string(&record) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize submission"),
        }
    }
}

async fn report_stats(stats: Arc<MiningStats>, every: Duration, stop: CancellationToken) {
    let mut ticker = interval(every);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&stats),
            _ = stop.cancelled() => break,
        }
    }
}

fn log_stats(stats: &MiningStats) {
    let snapshot = stats.snapshot();
    info!(
        uptime = %format_duration(snapshot.uptime_secs),
        hash_rate = %format_hash_rate(snapshot.hash_rate),
        total_hashes = snapshot.total_hashes,
        jobs = snapshot.total_jobs,
        dropped_jobs = snapshot.dropped_jobs,
        submissions = snapshot.pool_submissions,
        block_solutions = snapshot.block_solutions,
        best_difficulty = %format_difficulty(snapshot.best_difficulty),
        block_height = snapshot.block_height,
        accelerator_recoveries = snapshot.accelerator_recoveries,
        "Mining statistics"
    );
}

/// Print basic program information
fn print_info() {
    println!("{} v{}", APP_NAME, APP_VERSION);
    println!("{}", APP_DESCRIPTION);
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
