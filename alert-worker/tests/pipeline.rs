//! End-to-end: a slot event through matching, coalescing and dispatch.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use alert_common::dedup::DedupStore;
use alert_common::email::MemoryEmailSender;
use alert_common::history::AlertRecorder;
use alert_common::preference::{Filters, NotificationSettings, TimeWindow};
use alert_common::queue::{MockSlotQueue, SlotQueue};
use alert_worker::coalescer::Coalescer;
use alert_worker::consumer::SlotConsumer;
use alert_worker::dispatcher::{EmailDispatcher, SystemClock};
use health::HealthRegistry;
use tokio::sync::watch;

const DEDUP_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

struct Pipeline {
    consumer: SlotConsumer,
    coalescer: Arc<Coalescer>,
    queue: MockSlotQueue,
    sender: MemoryEmailSender,
    dedup: DedupStore,
    recorder: AlertRecorder,
}

async fn pipeline(db: &PgPool) -> Pipeline {
    let queue = MockSlotQueue::new();
    let sender = MemoryEmailSender::new();
    let dedup = DedupStore::new(db.clone(), DEDUP_TTL);
    let recorder = AlertRecorder::new(db.clone());

    let dispatcher = Arc::new(EmailDispatcher::new(
        db.clone(),
        dedup.clone(),
        recorder.clone(),
        Arc::new(sender.clone()),
        Arc::new(SystemClock {}),
    ));
    let coalescer = Arc::new(Coalescer::new(dispatcher, Duration::from_secs(10), 200));

    let registry = HealthRegistry::new("liveness");
    let liveness = registry
        .register("consumer".to_string(), Duration::from_secs(60))
        .await;
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let consumer = SlotConsumer::new(
        "pipeline-test".to_owned(),
        Arc::new(queue.clone()),
        db.clone(),
        dedup.clone(),
        coalescer.clone(),
        liveness,
        shutdown_rx,
    );

    Pipeline {
        consumer,
        coalescer,
        queue,
        sender,
        dedup,
        recorder,
    }
}

async fn seed_preference(db: &PgPool) {
    let filters = Filters {
        preferred_venues: vec!["Central".to_owned()],
        weekday_windows: vec![TimeWindow::new("09:00", "12:00")],
        max_price: 30.0,
        ..Default::default()
    };
    sqlx::query(
        r#"
INSERT INTO user_preferences (subscriber_id, email, enabled, unsubscribed, filters, notification)
VALUES (1, 'player@example.com', TRUE, FALSE, $1, $2)
        "#,
    )
    .bind(sqlx::types::Json(filters))
    .bind(sqlx::types::Json(NotificationSettings::default()))
    .execute(db)
    .await
    .expect("failed to seed preference");
}

// Monday 2025-06-16, 10:00-11:00 at Central for £25: inside the window,
// under the cap.
const EVENT: &str = r#"{
    "venueId": "central",
    "venueName": "Central",
    "courtId": "court1",
    "courtName": "Court 1",
    "date": "2025-06-16",
    "startTime": "10:00",
    "endTime": "11:00",
    "price": 25.0,
    "currency": "GBP",
    "bookingUrl": "https://booking.example.com/central/court1"
}"#;

#[sqlx::test(migrations = "../migrations")]
async fn matched_event_becomes_one_recorded_email(db: PgPool) {
    seed_preference(&db).await;
    let pipeline = pipeline(&db).await;

    pipeline.queue.push(EVENT);
    let payload = pipeline.queue.pop().await.unwrap().unwrap();
    pipeline.consumer.process(&payload).await;

    assert_eq!(pipeline.coalescer.pending_slots(), 1);
    pipeline.coalescer.flush_all().await;

    let captured = pipeline.sender.captured();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].to, "player@example.com");
    assert_eq!(captured[0].subject, "Tennis Court Available");
    assert!(captured[0]
        .body
        .contains("https://booking.example.com/central/court1"));
    assert!(captured[0].body.contains("Court 1  10:00-11:00  £25.00"));

    // One dedup record under the canonical key.
    let (slot_key,): (String,) =
        sqlx::query_as("SELECT slot_key FROM deduplication_records WHERE subscriber_id = 1")
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(slot_key, "central|2025-06-16|10:00|court1");

    // One history row marked sent.
    let sent = pipeline
        .recorder
        .count_for_subscriber(1, chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(sent, 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn replayed_event_is_suppressed_as_exact(db: PgPool) {
    seed_preference(&db).await;
    let pipeline = pipeline(&db).await;

    pipeline.consumer.process(EVENT).await;
    pipeline.coalescer.flush_all().await;
    assert_eq!(pipeline.sender.captured().len(), 1);

    // The same event arrives again within the TTL window.
    pipeline.consumer.process(EVENT).await;
    assert_eq!(pipeline.coalescer.pending_slots(), 0);
    pipeline.coalescer.flush_all().await;
    assert_eq!(pipeline.sender.captured().len(), 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn republished_variant_is_suppressed_as_similar(db: PgPool) {
    seed_preference(&db).await;
    let pipeline = pipeline(&db).await;

    pipeline.consumer.process(EVENT).await;
    pipeline.coalescer.flush_all().await;

    // Same venue/court/date/start, cheaper price and a fresh URL.
    let variant = EVENT
        .replace("25.0", "20.0")
        .replace("central/court1", "central/court1?refresh=1");
    pipeline.consumer.process(&variant).await;

    assert_eq!(pipeline.coalescer.pending_slots(), 0);

    use alert_common::dedup::DuplicateReason;
    use alert_common::slot::RawSlotEvent;
    let slot = RawSlotEvent::from_json(&variant).unwrap();
    let check = pipeline.dedup.check_for_duplicate(1, &slot).await.unwrap();
    assert!(check.is_duplicate);
    assert_eq!(check.reason, Some(DuplicateReason::Similar));
}

#[sqlx::test(migrations = "../migrations")]
async fn out_of_window_event_sends_nothing(db: PgPool) {
    seed_preference(&db).await;
    let pipeline = pipeline(&db).await;

    // Same Monday, but 14:00 is outside the 09:00-12:00 window.
    let event = EVENT
        .replace("10:00", "14:00")
        .replace("11:00", "15:00");
    pipeline.consumer.process(&event).await;

    assert_eq!(pipeline.coalescer.pending_slots(), 0);
    pipeline.coalescer.flush_all().await;
    assert!(pipeline.sender.captured().is_empty());
}
