//! Consume slot events from the shared queue and send court alerts.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::{info, warn};

use alert_common::dedup::DedupStore;
use alert_common::email::{EmailSender, LogEmailSender, SmtpEmailSender};
use alert_common::history::AlertRecorder;
use alert_common::metrics::{serve, setup_metrics_routes};
use alert_common::queue::RedisSlotQueue;
use alert_common::store;
use alert_worker::coalescer::Coalescer;
use alert_worker::config::Config;
use alert_worker::consumer::SlotConsumer;
use alert_worker::dispatcher::{EmailDispatcher, SystemClock};
use alert_worker::error::WorkerError;
use health::HealthRegistry;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    let pool = store::connect_pool(
        &config.database_url,
        config.max_pg_connections,
        config.store_timeout.0,
    )
    .await?;

    let dedup = DedupStore::new(
        pool.clone(),
        Duration::from_secs(config.dedup_ttl_hours * 3600),
    );
    let recorder = AlertRecorder::new(pool.clone());

    let sender: Arc<dyn EmailSender + Send + Sync> = if config.print_email {
        Arc::new(LogEmailSender {})
    } else {
        Arc::new(SmtpEmailSender::new(
            &config.smtp.smtp_relay,
            config.smtp.smtp_username.clone(),
            config.smtp.smtp_password.clone(),
            &config.smtp.smtp_from,
            config.email_timeout.0,
        )?)
    };

    let dispatcher = Arc::new(EmailDispatcher::new(
        pool.clone(),
        dedup.clone(),
        recorder,
        sender,
        Arc::new(SystemClock {}),
    ));
    let coalescer = Arc::new(Coalescer::new(
        dispatcher,
        config.batch_debounce.0,
        config.subscriber_buffer_cap,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut consumers = Vec::with_capacity(config.consumer_count);
    for index in 0..config.consumer_count {
        let queue = RedisSlotQueue::new(
            &config.redis_url,
            config.queue_name.as_str(),
            Duration::from_secs(config.queue_pop_timeout_secs),
        )?;
        let consumer_liveness = liveness
            .register(format!("consumer-{index}"), Duration::from_secs(60))
            .await;
        let consumer = SlotConsumer::new(
            format!("{}-{}", config.worker_name, index),
            Arc::new(queue),
            pool.clone(),
            dedup.clone(),
            coalescer.clone(),
            consumer_liveness,
            shutdown_rx.clone(),
        );
        consumers.push(tokio::spawn(consumer.run()));
    }

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutdown signal received");

    shutdown_tx.send(true).ok();
    for consumer in consumers {
        consumer.await.ok();
    }

    // One last chance for buffered batches to go out before we drop them.
    if tokio::time::timeout(config.shutdown_grace.0, coalescer.flush_all())
        .await
        .is_err()
    {
        warn!("shutdown grace elapsed before all buffers flushed");
    }
    let discarded = coalescer.discard_remaining();
    if discarded > 0 {
        metrics::counter!("coalescer_slots_discarded_total").increment(discarded as u64);
        warn!("discarded {} buffered slots at shutdown", discarded);
    }

    Ok(())
}

pub async fn index() -> &'static str {
    "court-alert worker"
}
