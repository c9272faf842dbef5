use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{ActionKind, SearchRunEntry, UsageLedgerRecord, WeeklyQuotaRecord};
use crate::storage::errors::{StorageError, StorageResult};
use crate::storage::traits::{apply_admission, apply_soft_delete, ClampedAdmission, QuotaStore};

type WeeklyKey = (String, DateTime<Utc>);

/// An in-memory implementation of the `QuotaStore` trait.
/// Suitable for testing and single-process deployments.
///
/// Each map sits behind its own mutex; every trait method holds the lock for
/// its whole read-modify-write, which is what makes the clamped updates
/// atomic.
#[derive(Default, Debug)]
pub struct InMemoryStorage {
    // Account ID -> ledger
    ledgers: Mutex<HashMap<String, UsageLedgerRecord>>,
    // (Account ID, week start) -> weekly record
    weekly: Mutex<HashMap<WeeklyKey, WeeklyQuotaRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper to render a weekly key for error messages
    fn make_weekly_key(account_id: &str, week_start: DateTime<Utc>) -> String {
        format!("weekly:{}:{}", account_id, week_start.date_naive())
    }

    fn ledgers(&self) -> StorageResult<MutexGuard<'_, HashMap<String, UsageLedgerRecord>>> {
        self.ledgers.lock().map_err(|e| StorageError::LockPoisoned {
            details: format!("ledgers: {}", e),
        })
    }

    fn weekly(&self) -> StorageResult<MutexGuard<'_, HashMap<WeeklyKey, WeeklyQuotaRecord>>> {
        self.weekly.lock().map_err(|e| StorageError::LockPoisoned {
            details: format!("weekly: {}", e),
        })
    }

    /// Number of weekly records held for an account.
    pub fn weekly_record_count(&self, account_id: &str) -> StorageResult<usize> {
        Ok(self
            .weekly()?
            .keys()
            .filter(|(account, _)| account == account_id)
            .count())
    }
}

impl QuotaStore for InMemoryStorage {
    fn find_ledger(&self, account_id: &str) -> StorageResult<Option<UsageLedgerRecord>> {
        Ok(self.ledgers()?.get(account_id).cloned())
    }

    fn create_ledger(&self, ledger: UsageLedgerRecord) -> StorageResult<()> {
        let mut ledgers = self.ledgers()?;
        if ledgers.contains_key(&ledger.account_id) {
            return Err(StorageError::Conflict {
                key: format!("ledger:{}", ledger.account_id),
            });
        }
        ledgers.insert(ledger.account_id.clone(), ledger);
        Ok(())
    }

    fn increment_usage(
        &self,
        account_id: &str,
        kind: ActionKind,
        qty: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let mut ledgers = self.ledgers()?;
        let ledger = ledgers.get_mut(account_id).ok_or_else(|| StorageError::NotFound {
            key: format!("ledger:{}", account_id),
        })?;
        let count = ledger.current_period.counts.entry(kind).or_insert(0);
        *count = count.saturating_add(qty.max(0));
        let total = *count;
        ledger.last_updated = at;
        Ok(total)
    }

    fn rollover_ledger(
        &self,
        account_id: &str,
        expected_period_start: DateTime<Utc>,
        new_period_start: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut ledgers = self.ledgers()?;
        match ledgers.get_mut(account_id) {
            Some(ledger) if ledger.current_period.period_start == expected_period_start => {
                ledger.roll_over(new_period_start, at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound {
                key: format!("ledger:{}", account_id),
            }),
        }
    }

    fn find_weekly(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
    ) -> StorageResult<Option<WeeklyQuotaRecord>> {
        Ok(self
            .weekly()?
            .get(&(account_id.to_string(), week_start))
            .cloned())
    }

    fn create_weekly(&self, record: WeeklyQuotaRecord) -> StorageResult<()> {
        let mut weekly = self.weekly()?;
        let key = (record.account_id.clone(), record.week_start);
        if weekly.contains_key(&key) {
            return Err(StorageError::Conflict {
                key: Self::make_weekly_key(&record.account_id, record.week_start),
            });
        }
        weekly.insert(key, record);
        Ok(())
    }

    fn admit_clamped(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
        entry: SearchRunEntry,
    ) -> StorageResult<ClampedAdmission> {
        let mut weekly = self.weekly()?;
        let record = weekly
            .get_mut(&(account_id.to_string(), week_start))
            .ok_or_else(|| StorageError::NotFound {
                key: Self::make_weekly_key(account_id, week_start),
            })?;
        let admitted = apply_admission(record, entry);
        Ok(ClampedAdmission {
            admitted,
            record: record.clone(),
        })
    }

    fn mark_run_deleted(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut weekly = self.weekly()?;
        Ok(match weekly.get_mut(&(account_id.to_string(), week_start)) {
            Some(record) => apply_soft_delete(record, run_id, at),
            None => false,
        })
    }

    fn list_weekly(&self, account_id: &str) -> StorageResult<Vec<WeeklyQuotaRecord>> {
        let mut records: Vec<WeeklyQuotaRecord> = self
            .weekly()?
            .values()
            .filter(|record| record.account_id == account_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.week_start.cmp(&a.week_start));
        Ok(records)
    }
}
