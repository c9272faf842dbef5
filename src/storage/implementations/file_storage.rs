use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, create_dir_all, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::models::{ActionKind, SearchRunEntry, UsageLedgerRecord, WeeklyQuotaRecord};
use crate::storage::errors::{io_to_storage_error, StorageError, StorageResult};
use crate::storage::traits::{apply_admission, apply_soft_delete, ClampedAdmission, QuotaStore};

/// File-based persistent storage.
///
/// Layout under the root directory:
/// - ledgers/{account}.json - usage ledger of each account
/// - weekly/{account}/{week start date}.json - weekly discovery records
/// - .lock - advisory lock file guarding every read-modify-write
///
/// Mutations hold an exclusive lock on `.lock` for their whole duration, so
/// concurrent processes sharing a directory see each operation atomically.
/// Records only appear on disk through a temp file and rename, so a failed
/// write never leaves a partial record behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Root path for all storage
    root_path: PathBuf,
}

/// Guard holding the advisory lock until dropped.
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            log::warn!("Failed to release storage lock: {}", e);
        }
    }
}

impl FileStorage {
    /// Creates a new FileStorage with the specified root directory
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root = root_path.as_ref().to_path_buf();

        create_dir_all(root.join("ledgers"))
            .map_err(|e| io_to_storage_error("create ledgers dir", e))?;
        create_dir_all(root.join("weekly"))
            .map_err(|e| io_to_storage_error("create weekly dir", e))?;

        Ok(FileStorage { root_path: root })
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    fn lock(&self, exclusive: bool) -> StorageResult<StoreLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.root_path.join(".lock"))
            .map_err(|e| io_to_storage_error("open lock file", e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| io_to_storage_error("acquire lock", e))?;
        Ok(StoreLock { file })
    }

    /// Rejects account ids that could escape the storage directory
    fn validate_key(key: &str) -> StorageResult<()> {
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@');
        if key.is_empty() || key == "." || key == ".." || !key.chars().all(allowed) {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                details: "account ids may only contain letters, digits, '-', '_', '.', '@'"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn ledger_path(&self, account_id: &str) -> StorageResult<PathBuf> {
        Self::validate_key(account_id)?;
        Ok(self.root_path.join("ledgers").join(format!("{}.json", account_id)))
    }

    fn weekly_dir(&self, account_id: &str) -> StorageResult<PathBuf> {
        Self::validate_key(account_id)?;
        Ok(self.root_path.join("weekly").join(account_id))
    }

    fn weekly_path(&self, account_id: &str, week_start: DateTime<Utc>) -> StorageResult<PathBuf> {
        Ok(self
            .weekly_dir(account_id)?
            .join(format!("{}.json", week_start.format("%Y-%m-%d"))))
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                StorageError::SerializationError {
                    details: format!("{}: {}", path.display(), e),
                }
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_to_storage_error("read record", e)),
        }
    }

    /// Writes through a temporary file and renames it into place
    fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent).map_err(|e| io_to_storage_error("create record dir", e))?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| io_to_storage_error("create temp file", e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_to_storage_error("write record", e))?;
        fs::rename(&tmp, path).map_err(|e| io_to_storage_error("commit record", e))
    }

    fn load_ledger(&self, account_id: &str) -> StorageResult<UsageLedgerRecord> {
        Self::read_json(&self.ledger_path(account_id)?)?.ok_or_else(|| StorageError::NotFound {
            key: format!("ledger:{}", account_id),
        })
    }

    fn load_weekly(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
    ) -> StorageResult<(PathBuf, WeeklyQuotaRecord)> {
        let path = self.weekly_path(account_id, week_start)?;
        let record = Self::read_json(&path)?.ok_or_else(|| StorageError::NotFound {
            key: format!("weekly:{}:{}", account_id, week_start.date_naive()),
        })?;
        Ok((path, record))
    }
}

impl QuotaStore for FileStorage {
    fn find_ledger(&self, account_id: &str) -> StorageResult<Option<UsageLedgerRecord>> {
        let path = self.ledger_path(account_id)?;
        let _lock = self.lock(false)?;
        Self::read_json(&path)
    }

    fn create_ledger(&self, ledger: UsageLedgerRecord) -> StorageResult<()> {
        let path = self.ledger_path(&ledger.account_id)?;
        let _lock = self.lock(true)?;
        if path.exists() {
            return Err(StorageError::Conflict {
                key: format!("ledger:{}", ledger.account_id),
            });
        }
        Self::write_json(&path, &ledger)
    }

    fn increment_usage(
        &self,
        account_id: &str,
        kind: ActionKind,
        qty: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let _lock = self.lock(true)?;
        let mut ledger = self.load_ledger(account_id)?;
        let count = ledger.current_period.counts.entry(kind).or_insert(0);
        *count = count.saturating_add(qty.max(0));
        let total = *count;
        ledger.last_updated = at;
        Self::write_json(&self.ledger_path(account_id)?, &ledger)?;
        Ok(total)
    }

    fn rollover_ledger(
        &self,
        account_id: &str,
        expected_period_start: DateTime<Utc>,
        new_period_start: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let _lock = self.lock(true)?;
        let mut ledger = self.load_ledger(account_id)?;
        if ledger.current_period.period_start != expected_period_start {
            return Ok(false);
        }
        ledger.roll_over(new_period_start, at);
        Self::write_json(&self.ledger_path(account_id)?, &ledger)?;
        Ok(true)
    }

    fn find_weekly(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
    ) -> StorageResult<Option<WeeklyQuotaRecord>> {
        let path = self.weekly_path(account_id, week_start)?;
        let _lock = self.lock(false)?;
        Self::read_json(&path)
    }

    fn create_weekly(&self, record: WeeklyQuotaRecord) -> StorageResult<()> {
        let path = self.weekly_path(&record.account_id, record.week_start)?;
        let _lock = self.lock(true)?;
        if path.exists() {
            return Err(StorageError::Conflict {
                key: format!("weekly:{}:{}", record.account_id, record.week_start.date_naive()),
            });
        }
        Self::write_json(&path, &record)
    }

    fn admit_clamped(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
        entry: SearchRunEntry,
    ) -> StorageResult<ClampedAdmission> {
        let _lock = self.lock(true)?;
        let (path, mut record) = self.load_weekly(account_id, week_start)?;
        let admitted = apply_admission(&mut record, entry);
        if admitted > 0 {
            Self::write_json(&path, &record)?;
        }
        Ok(ClampedAdmission { admitted, record })
    }

    fn mark_run_deleted(
        &self,
        account_id: &str,
        week_start: DateTime<Utc>,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let _lock = self.lock(true)?;
        let (path, mut record) = match self.load_weekly(account_id, week_start) {
            Ok(found) => found,
            Err(StorageError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let found = apply_soft_delete(&mut record, run_id, at);
        if found {
            Self::write_json(&path, &record)?;
        }
        Ok(found)
    }

    fn list_weekly(&self, account_id: &str) -> StorageResult<Vec<WeeklyQuotaRecord>> {
        let dir = self.weekly_dir(account_id)?;
        let _lock = self.lock(false)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_to_storage_error("list weekly records", e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_to_storage_error("list weekly records", e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_json::<WeeklyQuotaRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.week_start.cmp(&a.week_start));
        Ok(records)
    }
}
