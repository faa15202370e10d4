//! Retire stale court slots that no active subscriber wants anymore.
use std::time::Duration;

use axum::Router;
use clap::{Parser, ValueEnum};
use config::Config;
use cron::Schedule;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use health::{HealthHandle, HealthRegistry};
use retention::RetentionWorker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use alert_common::metrics::setup_metrics_routes;
use alert_common::store::connect_pool;

mod config;
mod handlers;
mod retention;

#[derive(Parser)]
#[command(name = "alert-janitor", about = "Retention sweeper for the court-alert pipeline")]
struct Args {
    /// Run a single retention cycle and exit.
    #[arg(long)]
    run_once: bool,

    /// Identify deletions without performing them.
    #[arg(long)]
    dry_run: bool,

    /// Log filter, e.g. "info" or "alert_janitor=debug".
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(level: &str, format: LogFormat) -> Result<(), String> {
    let filter = EnvFilter::try_new(level).map_err(|e| e.to_string())?;
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
    Ok(())
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

/// The loop's liveness deadline: twice the schedule period, so one missed
/// fire flags the process without a lone slow cycle doing so.
fn liveness_deadline(schedule: &Schedule) -> Duration {
    let mut upcoming = schedule.upcoming(chrono::Utc);
    match (upcoming.next(), upcoming.next()) {
        (Some(first), Some(second)) => (second - first)
            .to_std()
            .map(|period| period * 2)
            .unwrap_or(Duration::from_secs(7200)),
        _ => Duration::from_secs(7200),
    }
}

async fn retention_loop(mut worker: RetentionWorker, schedule: Schedule, liveness: HealthHandle) {
    loop {
        let Some(next_fire) = schedule.upcoming(chrono::Utc).next() else {
            error!("retention schedule yields no future fire time");
            return;
        };
        liveness.report_healthy().await;

        let wait = (next_fire - chrono::Utc::now()).to_std().unwrap_or_default();
        info!("next retention cycle at {}", next_fire);
        tokio::time::sleep(wait).await;

        liveness.report_healthy().await;
        if let Err(e) = worker.run_cycle().await {
            // Fail fast for this cycle; the next scheduled one starts fresh.
            error!("retention cycle failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(&args.log_level, args.log_format) {
        eprintln!("invalid log level {}: {}", args.log_level, e);
        std::process::exit(1);
    }

    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let mut settings = match config.settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let schedule = match config.schedule() {
        Ok(schedule) => schedule,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    if args.dry_run {
        settings.dry_run = true;
    }

    let pool = match connect_pool(
        &config.database_url,
        config.max_pg_connections,
        Duration::from_millis(config.store_timeout_ms),
    )
    .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!("failed to connect to store: {}", e);
            std::process::exit(2);
        }
    };

    let mut worker = RetentionWorker::new(pool, settings);

    if args.run_once {
        if let Err(e) = worker.run_cycle().await {
            error!("retention cycle failed: {}", e);
            std::process::exit(2);
        }
        return;
    }

    let liveness = HealthRegistry::new("liveness");
    let cycle_liveness = liveness
        .register("retention_loop".to_string(), liveness_deadline(&schedule))
        .await;

    let app = setup_metrics_routes(handlers::app(liveness));
    let http_server = Box::pin(listen(app, config.bind()));
    let cycle_loop = Box::pin(retention_loop(worker, schedule, cycle_liveness));

    match select(http_server, cycle_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => error!("failed to start alert-janitor http server, {}", e),
        },
        Either::Right((_, _)) => {
            error!("alert-janitor retention loop exited")
        }
    };
}
