//! The retention cycle: delete stale slots nobody wants anymore.
//!
//! Safety rests on the shared matcher. A slot is only deleted when it is
//! older than the retention window, was never notified, and matches no
//! active preference at the instant of the check. Anything uncertain is
//! retained; disk is cheaper than a subscriber's lost alert.

use chrono::Utc;
use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RetentionSettings;
use alert_common::dedup::DedupStore;
use alert_common::history::AlertRecorder;
use alert_common::matcher;
use alert_common::preference;
use alert_common::slot::Slot;
use alert_common::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Loading,
    Matching,
    Deleting,
    Failed,
}

/// Metrics record emitted after every cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub candidates: u64,
    pub checked: u64,
    pub identified_for_deletion: u64,
    pub deleted: u64,
    pub active_preferences: u64,
    pub errors: u64,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub dedup_pruned: u64,
    pub history_pruned: u64,
}

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to load active preferences: {0}")]
    LoadPreferences(StoreError),
    #[error("failed to load deletion candidates: {0}")]
    LoadCandidates(StoreError),
    #[error("batch delete failed: {0}")]
    DeleteBatch(StoreError),
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: i64,
    venue_id: String,
    venue_name: String,
    court_id: String,
    court_name: String,
    date: String,
    start_time: String,
    end_time: String,
    price: f64,
    currency: String,
    booking_url: String,
    discovered_at: chrono::DateTime<Utc>,
}

impl CandidateRow {
    fn into_slot(self) -> (i64, Slot) {
        (
            self.id,
            Slot {
                venue_id: self.venue_id,
                venue_name: self.venue_name,
                court_id: self.court_id,
                court_name: self.court_name,
                date: self.date,
                start_time: self.start_time,
                end_time: self.end_time,
                price: self.price,
                currency: self.currency,
                booking_url: self.booking_url,
                discovered_at: self.discovered_at,
            },
        )
    }
}

pub struct RetentionWorker {
    pool: PgPool,
    settings: RetentionSettings,
    state: WorkerState,
}

impl RetentionWorker {
    pub fn new(pool: PgPool, settings: RetentionSettings) -> Self {
        Self {
            pool,
            settings,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Swap in new settings between cycles. Validation happened upstream in
    /// `Config::settings`; a rejected update never reaches this point, so the
    /// prior settings keep running.
    pub fn update_settings(&mut self, settings: RetentionSettings) {
        self.settings = settings;
    }

    /// One full sweep: load, match, delete, prune. Per-slot match errors are
    /// counted and the slot retained; a failed batch delete aborts the cycle
    /// so we stop hammering a broken store until the next scheduled run.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let cycle_start = std::time::Instant::now();
        let mut report = CycleReport {
            dry_run: self.settings.dry_run,
            ..Default::default()
        };

        self.state = WorkerState::Loading;
        let preferences = match preference::load_active(&self.pool).await {
            Ok(preferences) => preferences,
            Err(e) => {
                self.state = WorkerState::Failed;
                return Err(CycleError::LoadPreferences(e));
            }
        };
        report.active_preferences = preferences.len() as u64;

        let candidates = match self.load_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.state = WorkerState::Failed;
                return Err(CycleError::LoadCandidates(e));
            }
        };
        report.candidates = candidates.len() as u64;

        self.state = WorkerState::Matching;
        let mut delete_ids = Vec::new();
        for row in candidates {
            let (id, slot) = row.into_slot();
            report.checked += 1;
            match matcher::matches_any(&slot, preferences.iter().map(|p| &p.filters.0)) {
                Ok(true) => {}
                Ok(false) => delete_ids.push(id),
                Err(e) => {
                    report.errors += 1;
                    warn!(slot_id = id, "match failed, retaining slot: {}", e);
                }
            }
        }
        report.identified_for_deletion = delete_ids.len() as u64;

        self.state = WorkerState::Deleting;
        if !self.settings.dry_run {
            for chunk in delete_ids.chunks(self.settings.batch_size) {
                match self.delete_batch(chunk).await {
                    Ok(deleted) => report.deleted += deleted,
                    Err(e) => {
                        self.state = WorkerState::Failed;
                        return Err(CycleError::DeleteBatch(e));
                    }
                }
            }
        }

        // TTL sweeps for the notifier-owned collections ride along with the
        // cycle; failures here are worth an error count, not an abort.
        let dedup = DedupStore::new(self.pool.clone(), self.settings.dedup_ttl);
        match dedup.prune_expired().await {
            Ok(pruned) => report.dedup_pruned = pruned,
            Err(e) => {
                report.errors += 1;
                warn!("failed to prune expired dedup records: {}", e);
            }
        }
        let recorder = AlertRecorder::new(self.pool.clone());
        match recorder
            .prune_older_than(Utc::now() - self.settings.history_ttl)
            .await
        {
            Ok(pruned) => report.history_pruned = pruned,
            Err(e) => {
                report.errors += 1;
                warn!("failed to prune alert history: {}", e);
            }
        }

        report.duration_ms = cycle_start.elapsed().as_millis() as u64;
        self.state = WorkerState::Idle;

        info!(
            candidates = report.candidates,
            checked = report.checked,
            identified_for_deletion = report.identified_for_deletion,
            deleted = report.deleted,
            active_preferences = report.active_preferences,
            errors = report.errors,
            duration_ms = report.duration_ms,
            dry_run = report.dry_run,
            dedup_pruned = report.dedup_pruned,
            history_pruned = report.history_pruned,
            "retention cycle complete"
        );
        metrics::counter!("retention_slots_deleted_total").increment(report.deleted);
        metrics::counter!("retention_cycle_errors_total").increment(report.errors);

        Ok(report)
    }

    async fn load_candidates(&self) -> Result<Vec<CandidateRow>, StoreError> {
        let cutoff = Utc::now() - self.settings.window;

        sqlx::query_as(
            r#"
SELECT
    id, venue_id, venue_name, court_id, court_name, date, start_time, end_time,
    price, currency, booking_url, discovered_at
FROM
    court_slots
WHERE
    discovered_at < $1
    AND notified = FALSE
ORDER BY
    id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::query("SELECT", error))
    }

    /// One atomic bulk delete per batch.
    async fn delete_batch(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
DELETE FROM
    court_slots
WHERE
    id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }
}
