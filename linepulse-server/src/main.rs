// Linepulse Server - HTTP API and Prometheus exporter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Linepulse Server
//!
//! Runs the telemetry pipeline, serves live state and daily summaries over
//! HTTP and exports Prometheus metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Persist pulses to a journal
//! linepulse-server --journal pulses.journal
//!
//! # Replay a recorded shift ten times faster
//! linepulse-server --csv shift.csv --speed 10.0
//!
//! # Simulate a line with breakdowns
//! linepulse-server --simulate full_line --speed 60
//! ```

mod app;
mod error;
mod metrics;

#[cfg(feature = "replay")]
mod replay;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use linepulse::{
    JournalPulseStore, LinepulseConfig, MemoryAssignmentStore, MemoryPulseStore, PulseStore,
    RecvError, SystemClock, Telemetry,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use app::{router, AppState};
use metrics::{record_delta, record_reconcile, update_live_metrics, update_sweep_metrics};

#[cfg(feature = "replay")]
use linepulse_testdata::{generate_scenario, LineScenario, ShiftConfig};
#[cfg(feature = "replay")]
use replay::{ReplayConfig, ReplayEngine};

/// Linepulse production-line telemetry server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "9100")]
    port: u16,

    /// JSON configuration file
    #[arg(long)]
    config: Option<String>,

    /// Pulse journal file (in-memory store when omitted)
    #[arg(short, long)]
    journal: Option<String>,

    /// Pulse log CSV to replay
    #[arg(short, long)]
    csv: Option<String>,

    /// Simulate a line scenario (normal_shift, breakdown, changeover, full_line)
    #[arg(long)]
    simulate: Option<String>,

    /// Seed for --simulate
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Replay speed multiplier (1.0 = real-time)
    #[arg(short, long, default_value = "1.0")]
    speed: f64,

    /// Loop the replay when it reaches the end
    #[arg(short, long, default_value = "true")]
    loop_replay: bool,

    /// Period of live-state metrics refresh and day checks, in seconds
    #[arg(long, default_value = "5")]
    refresh_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(feature = "replay")]
fn parse_scenario(name: &str) -> Option<LineScenario> {
    [
        LineScenario::NormalShift,
        LineScenario::Breakdown,
        LineScenario::Changeover,
        LineScenario::FullLine,
    ]
    .into_iter()
    .find(|s| s.name() == name.to_lowercase())
}

fn load_config(path: Option<&str>) -> Result<LinepulseConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path);
            LinepulseConfig::from_json_file(path)?
        }
        None => LinepulseConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn open_store(journal: Option<&str>) -> Result<Arc<dyn PulseStore>, Box<dyn std::error::Error>> {
    match journal {
        Some(path) => {
            let store = JournalPulseStore::open(path)?;
            let stats = store.recovery();
            info!(
                "Journal {} opened: {} pulses, {} duplicates, {} corrupt lines",
                path, stats.loaded, stats.duplicates, stats.corrupt
            );
            Ok(Arc::new(store))
        }
        None => {
            info!("No journal specified, pulses are kept in memory");
            Ok(Arc::new(MemoryPulseStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::from_default_env().add_directive(parse_level(&args.log_level).into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Linepulse Server v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(args.config.as_deref())?;
    let telemetry = Arc::new(Telemetry::new(
        config.clone(),
        open_store(args.journal.as_deref())?,
        Arc::new(MemoryAssignmentStore::new()),
        Arc::new(SystemClock),
    )?);
    let machines = telemetry.start()?;
    info!("Live state initialised for {} machines", machines);

    let stop = Arc::new(AtomicBool::new(false));

    // Feed consumer
    let feed_task = {
        let telemetry = telemetry.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = telemetry.run_feed(&stop, Duration::from_millis(200)) {
                error!("Feed consumer stopped: {}", e);
            }
        })
    };

    // Delta counter
    let delta_task = {
        let deltas = telemetry.subscribe_live_state();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::Relaxed) {
                match deltas.recv_timeout(Duration::from_millis(200)) {
                    Ok(delta) => record_delta(delta.cause),
                    Err(RecvError::Timeout) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    // Staleness monitor
    let monitor = telemetry.monitor();
    let monitor_handle = monitor.clone().spawn()?;

    // Day rollover and gauge refresh
    {
        let telemetry = telemetry.clone();
        let period = Duration::from_secs(args.refresh_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let refresh = {
                    let telemetry = telemetry.clone();
                    tokio::task::spawn_blocking(move || telemetry.refresh_day()).await
                };
                match refresh {
                    Ok(Ok(true)) => info!("Local day changed to {}", telemetry.today()),
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => warn!("Day refresh failed: {}", e),
                    Err(e) => error!("Day refresh task panicked: {}", e),
                }
                update_live_metrics(&telemetry.live_state());
                update_sweep_metrics(&monitor);
            }
        });
    }

    // Periodic reconcile
    if let Some(period) = config.reconcile_interval() {
        let telemetry = telemetry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reconcile = {
                    let telemetry = telemetry.clone();
                    tokio::task::spawn_blocking(move || telemetry.reconcile()).await
                };
                match reconcile {
                    Ok(Ok(report)) => record_reconcile(&report),
                    Ok(Err(e)) => warn!("Reconcile failed: {}", e),
                    Err(e) => error!("Reconcile task panicked: {}", e),
                }
            }
        });
    }

    #[allow(unused_mut)]
    let mut state = AppState::new(telemetry.clone());
    #[cfg(feature = "replay")]
    let mut replay_state = None;

    #[cfg(feature = "replay")]
    {
        let replay_config = ReplayConfig {
            speed: args.speed,
            loop_replay: args.loop_replay,
            ..Default::default()
        };
        let engine = if let Some(csv_path) = args.csv.as_deref() {
            Some(ReplayEngine::from_csv(csv_path, replay_config))
        } else if let Some(name) = args.simulate.as_deref() {
            match parse_scenario(name) {
                Some(scenario) => {
                    let shift = ShiftConfig::new().with_seed(args.seed);
                    Some(ReplayEngine::from_log(generate_scenario(scenario, &shift), replay_config))
                }
                None => {
                    warn!("Unknown scenario '{}', not simulating", name);
                    None
                }
            }
        } else {
            None
        };

        match engine {
            Some(Ok(engine)) => {
                let info = engine.log_info();
                info!(
                    "Replaying {} rows from {} machines",
                    info.row_count, info.machine_count
                );
                replay_state = Some(engine.state());
                state.replay_state = Some(engine.state());
                state.log_info = Some(info);

                let telemetry = telemetry.clone();
                tokio::spawn(async move {
                    engine.run(telemetry).await;
                });
            }
            Some(Err(e)) => error!("Failed to load pulse log: {}", e),
            None => info!("No pulse log specified, serving ingested pulses only"),
        }
    }

    #[cfg(not(feature = "replay"))]
    if args.csv.is_some() || args.simulate.is_some() {
        warn!("Replay feature not enabled, ignoring --csv/--simulate");
    }

    let app = router(Arc::new(state));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down");
    stop.store(true, Ordering::Relaxed);
    #[cfg(feature = "replay")]
    if let Some(replay_state) = replay_state {
        replay_state.stop();
    }
    monitor_handle.stop();
    let _ = tokio::join!(feed_task, delta_task);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[cfg(feature = "replay")]
    #[test]
    fn test_parse_scenario() {
        assert_eq!(parse_scenario("full_line"), Some(LineScenario::FullLine));
        assert_eq!(parse_scenario("Breakdown"), Some(LineScenario::Breakdown));
        assert_eq!(parse_scenario("idle"), None);
    }

    #[test]
    fn test_default_config_loads() {
        let config = load_config(None).unwrap();
        assert_eq!(config, LinepulseConfig::default());
    }
}
