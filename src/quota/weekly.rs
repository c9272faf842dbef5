use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{QuotaError, QuotaResult};
use crate::models::{SearchRunEntry, WeeklyQuotaRecord, UNLIMITED};
use crate::storage::errors::StorageError;
use crate::storage::traits::QuotaStore;
use crate::utils::Clock;
use crate::window::WeekWindow;

/// Outcome of a weekly admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitResult {
    pub requested: i64,
    pub admitted: i64,
    pub consumed: i64,
    pub limit: i64,
    pub remaining: i64,
    pub limit_reached: bool,
    /// Week the admission was charged to; `None` when no window could be
    /// computed and the request was let through unrecorded.
    pub week_start: Option<DateTime<Utc>>,
}

impl AdmitResult {
    fn from_record(requested: i64, admitted: i64, record: &WeeklyQuotaRecord) -> Self {
        let remaining = record.remaining();
        let limit_reached = if record.is_unlimited() {
            false
        } else if requested > 0 && admitted <= 0 {
            true
        } else {
            remaining == 0
        };
        Self {
            requested,
            admitted,
            consumed: record.consumed,
            limit: record.limit,
            remaining,
            limit_reached,
            week_start: Some(record.week_start),
        }
    }

    /// Fallback used when the week window cannot be computed.
    fn permissive(requested: i64) -> Self {
        Self {
            requested,
            admitted: requested.max(0),
            consumed: 0,
            limit: UNLIMITED,
            remaining: UNLIMITED,
            limit_reached: false,
            week_start: None,
        }
    }

    pub fn dropped(&self) -> i64 {
        (self.requested - self.admitted).max(0)
    }
}

/// Read-only view of an account's discovery quota for one week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyStats {
    pub consumed: i64,
    pub limit: i64,
    pub remaining: i64,
    pub limit_reached: bool,
    /// `None` when the window could not be computed.
    pub window: Option<WeekWindow>,
    pub runs: Vec<SearchRunEntry>,
    /// Whether a record backs these numbers.
    pub persisted: bool,
}

impl WeeklyStats {
    fn from_record(record: WeeklyQuotaRecord) -> Self {
        let remaining = record.remaining();
        Self {
            consumed: record.consumed,
            limit: record.limit,
            remaining,
            limit_reached: !record.is_unlimited() && remaining == 0,
            window: Some(WeekWindow {
                week_start: record.week_start,
                week_end: record.week_end,
                week_year: record.week_year,
                week_number: record.week_number,
            }),
            runs: record.runs,
            persisted: true,
        }
    }

    fn empty(window: Option<WeekWindow>, limit: i64) -> Self {
        let remaining = if limit < 0 { UNLIMITED } else { limit };
        Self {
            consumed: 0,
            limit,
            remaining,
            limit_reached: limit == 0,
            window,
            runs: Vec::new(),
            persisted: false,
        }
    }

    pub fn visible_runs(&self) -> impl Iterator<Item = &SearchRunEntry> {
        self.runs.iter().filter(|run| !run.deleted)
    }
}

/// Weekly job discovery quota.
///
/// One record per account and week, created on first touch. Admissions are
/// clamped to what is left and anything over is dropped. Deleting a run only
/// hides it; the quantity it consumed stays consumed.
pub struct WeeklyQuota {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
}

impl WeeklyQuota {
    pub fn new(store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns this week's record, creating it with `limit` if absent.
    /// Concurrent creators race on the store's unique key; the loser reads
    /// back the winner's record.
    pub fn get_or_create(&self, account_id: &str, limit: i64) -> QuotaResult<WeeklyQuotaRecord> {
        let now = self.clock.now();
        let window = WeekWindow::for_instant(now)?;

        if let Some(record) = self.store.find_weekly(account_id, window.week_start)? {
            return Ok(record);
        }

        let record = WeeklyQuotaRecord::new(account_id, &window, limit, now);
        match self.store.create_weekly(record.clone()) {
            Ok(()) => {
                debug!(
                    "Created weekly quota for account {} week {}-{} (limit {})",
                    account_id, window.week_year, window.week_number, limit
                );
                Ok(record)
            }
            Err(StorageError::Conflict { key }) => {
                debug!("Weekly quota {} created concurrently, re-reading", key);
                self.store
                    .find_weekly(account_id, window.week_start)?
                    .ok_or_else(|| QuotaError::Storage(StorageError::NotFound { key }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Admits up to `requested` against this week's record, which must
    /// already exist. Excess beyond the remaining quota is dropped.
    pub fn admit(
        &self,
        account_id: &str,
        run_id: &str,
        requested: i64,
        label: &str,
    ) -> QuotaResult<AdmitResult> {
        let now = self.clock.now();
        let window = match WeekWindow::for_instant(now) {
            Ok(window) => window,
            Err(e) => {
                warn!(
                    "{}; admitting {} for account {} without a weekly record",
                    e, requested, account_id
                );
                return Ok(AdmitResult::permissive(requested));
            }
        };

        let entry = SearchRunEntry {
            run_id: run_id.to_string(),
            run_date: now,
            kept: requested,
            label: label.to_string(),
            deleted: false,
            deleted_at: None,
        };
        let outcome = self.store.admit_clamped(account_id, window.week_start, entry)?;
        let result = AdmitResult::from_record(requested, outcome.admitted, &outcome.record);

        if result.admitted <= 0 {
            info!(
                "Weekly quota exhausted for account {}: rejected {} from run {}",
                account_id, requested, run_id
            );
        } else if result.dropped() > 0 {
            info!(
                "Weekly quota for account {} admitted {} of {} from run {}, dropped {}",
                account_id,
                result.admitted,
                requested,
                run_id,
                result.dropped()
            );
        } else {
            debug!(
                "Weekly quota for account {} admitted {} from run {} ({} remaining)",
                account_id, result.admitted, run_id, result.remaining
            );
        }
        Ok(result)
    }

    /// `get_or_create` followed by `admit`, falling back to a permissive
    /// admission when the week window cannot be computed.
    pub fn admit_with_limit(
        &self,
        account_id: &str,
        limit: i64,
        run_id: &str,
        requested: i64,
        label: &str,
    ) -> QuotaResult<AdmitResult> {
        match self.get_or_create(account_id, limit) {
            Ok(_) => self.admit(account_id, run_id, requested, label),
            Err(QuotaError::Window(e)) => {
                warn!("{}; admitting {} for account {} unrecorded", e, requested, account_id);
                Ok(AdmitResult::permissive(requested))
            }
            Err(e) => Err(e),
        }
    }

    /// Hides a run from this week's record. Totals are unchanged. Returns
    /// `false` if the run is not in the current week.
    pub fn soft_delete_run(&self, account_id: &str, run_id: &str) -> QuotaResult<bool> {
        let now = self.clock.now();
        let window = match WeekWindow::for_instant(now) {
            Ok(window) => window,
            Err(e) => {
                warn!("{}; cannot locate run {} for deletion", e, run_id);
                return Ok(false);
            }
        };

        let deleted = self
            .store
            .mark_run_deleted(account_id, window.week_start, run_id, now)?;
        if deleted {
            info!("Soft-deleted run {} for account {}", run_id, account_id);
        } else {
            debug!("Run {} not found in current week for account {}", run_id, account_id);
        }
        Ok(deleted)
    }

    /// Snapshot of this week. Without a record, reports a zero state using
    /// `fallback_limit` and creates nothing.
    pub fn current_stats(&self, account_id: &str, fallback_limit: i64) -> QuotaResult<WeeklyStats> {
        let window = match WeekWindow::for_instant(self.clock.now()) {
            Ok(window) => window,
            Err(e) => {
                warn!("{}; reporting full weekly quota for account {}", e, account_id);
                return Ok(WeeklyStats::empty(None, fallback_limit));
            }
        };

        Ok(match self.store.find_weekly(account_id, window.week_start)? {
            Some(record) => WeeklyStats::from_record(record),
            None => WeeklyStats::empty(Some(window), fallback_limit),
        })
    }

    /// The `weeks` most recent records of an account, newest first.
    pub fn history(&self, account_id: &str, weeks: usize) -> QuotaResult<Vec<WeeklyStats>> {
        Ok(self
            .store
            .list_weekly(account_id)?
            .into_iter()
            .take(weeks)
            .map(WeeklyStats::from_record)
            .collect())
    }
}
