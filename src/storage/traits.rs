use chrono::{DateTime, Utc};

use crate::models::{ActionKind, SearchRunEntry, UsageLedgerRecord, WeeklyQuotaRecord};
use crate::storage::errors::StorageResult;

/// Result of a clamped weekly admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClampedAdmission {
    /// Quantity actually added to `consumed`; zero means nothing changed.
    pub admitted: i64,
    /// The record after the operation.
    pub record: WeeklyQuotaRecord,
}

/// Durable store behind the usage ledgers and weekly quota records.
///
/// Every mutating method is a single atomic operation at the store level.
/// Implementations must never split them into a read followed by a separate
/// write that another caller could interleave with.
pub trait QuotaStore: Send + Sync {
    /// Looks up the ledger of an account.
    fn find_ledger(&self, account_id: &str) -> StorageResult<Option<UsageLedgerRecord>>;

    /// Inserts a new ledger. Fails with `StorageError::Conflict` if one exists.
    fn create_ledger(&self, ledger: UsageLedgerRecord) -> StorageResult<()>;

    /// Adds `qty` to the current-period counter for `kind` and returns the new
    /// total. Negative quantities are treated as zero; counters never shrink
    /// within a period. Fails with `StorageError::NotFound` if the ledger is missing.
    fn increment_usage(
        &self,
        account_id: &str,
        kind: ActionKind,
        qty: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<i64>;

    /// Archives the current period and opens a new one starting at
    /// `new_period_start`, but only if the current period still starts at
    /// `expected_period_start`. Returns whether the rollover happened.
    fn rollover_ledger(
        &self,
        account_id: &str,
        expected_period_start: DateTime<Utc>,
        new_period_start: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Looks up the weekly record keyed by `(account_id, week_start)`.
    fn find_weekly(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
    ) -> StorageResult<Option<WeeklyQuotaRecord>>;

    /// Inserts a weekly record. `(account_id, week_start)` is unique; a
    /// duplicate fails with `StorageError::Conflict`.
    fn create_weekly(&self, record: WeeklyQuotaRecord) -> StorageResult<()>;

    /// Clamps `entry.kept` to the remaining quota, then appends the entry and
    /// increments `consumed` by the clamped amount. A clamp to zero leaves the
    /// record untouched.
    fn admit_clamped(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
        entry: SearchRunEntry,
    ) -> StorageResult<ClampedAdmission>;

    /// Flags every run with `run_id` as deleted. Returns `false` when the
    /// record or run does not exist.
    fn mark_run_deleted(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// All weekly records of an account, newest week first.
    fn list_weekly(&self, account_id: &str) -> StorageResult<Vec<WeeklyQuotaRecord>>;
}

/// Applies the clamped admission to an in-hand record. Shared by the store
/// implementations so they agree on the arithmetic.
pub(crate) fn apply_admission(record: &mut WeeklyQuotaRecord, mut entry: SearchRunEntry) -> i64 {
    let admitted = record.admissible(entry.kept);
    if admitted <= 0 {
        return 0;
    }
    entry.kept = admitted;
    entry.deleted = false;
    entry.deleted_at = None;
    record.runs.push(entry);
    record.consumed = record.consumed.saturating_add(admitted);
    admitted
}

/// Flags matching runs as deleted; already-deleted runs keep their timestamp.
pub(crate) fn apply_soft_delete(
    record: &mut WeeklyQuotaRecord,
    run_id: &str,
    at: DateTime<Utc>,
) -> bool {
    let mut found = false;
    for run in record.runs.iter_mut().filter(|run| run.run_id == run_id) {
        found = true;
        if !run.deleted {
            run.deleted = true;
            run.deleted_at = Some(at);
        }
    }
    found
}
