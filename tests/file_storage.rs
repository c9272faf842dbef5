use chrono::{Duration, TimeZone, Utc};
use quota_engine::models::{ActionKind, SearchRunEntry, UsageLedgerRecord, WeeklyQuotaRecord};
use quota_engine::storage::errors::{StorageError, StorageResult};
use quota_engine::storage::traits::QuotaStore;
use quota_engine::storage::FileStorage;
use quota_engine::WeekWindow;
use tempfile::TempDir;

use test_helpers::wednesday_noon;

fn open_store() -> (TempDir, FileStorage) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStorage::new(dir.path()).unwrap();
    (dir, store)
}

fn run(run_id: &str, kept: i64) -> SearchRunEntry {
    SearchRunEntry {
        run_id: run_id.to_string(),
        run_date: wednesday_noon(),
        kept,
        label: format!("Run {}", run_id),
        deleted: false,
        deleted_at: None,
    }
}

#[test]
fn test_ledger_persists_across_instances() -> StorageResult<()> {
    let (dir, store) = open_store();
    let period = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    store.create_ledger(UsageLedgerRecord::new("alice", period, wednesday_noon()))?;
    assert_eq!(store.increment_usage("alice", ActionKind::JobImports, 4, wednesday_noon())?, 4);

    let reopened = FileStorage::new(dir.path())?;
    let ledger = reopened.find_ledger("alice")?.unwrap();
    assert_eq!(ledger.current_period.count(ActionKind::JobImports), 4);
    assert_eq!(ledger.current_period.period_start, period);
    Ok(())
}

#[test]
fn test_duplicate_ledger_conflicts() -> StorageResult<()> {
    let (_dir, store) = open_store();
    let period = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    store.create_ledger(UsageLedgerRecord::new("alice", period, wednesday_noon()))?;
    let err = store
        .create_ledger(UsageLedgerRecord::new("alice", period, wednesday_noon()))
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict { .. }));
    Ok(())
}

#[test]
fn test_increment_without_ledger_is_not_found() {
    let (_dir, store) = open_store();
    let err = store
        .increment_usage("ghost", ActionKind::JobImports, 1, wednesday_noon())
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[test]
fn test_rollover_only_matches_expected_period() -> StorageResult<()> {
    let (_dir, store) = open_store();
    let may = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    store.create_ledger(UsageLedgerRecord::new("alice", may, wednesday_noon()))?;
    store.increment_usage("alice", ActionKind::CoverLetters, 2, wednesday_noon())?;

    assert!(store.rollover_ledger("alice", may, june, june)?);
    assert!(!store.rollover_ledger("alice", may, june, june)?);

    let ledger = store.find_ledger("alice")?.unwrap();
    assert_eq!(ledger.history.len(), 1);
    assert_eq!(ledger.current_period.period_start, june);
    assert_eq!(ledger.current_period.count(ActionKind::CoverLetters), 0);
    Ok(())
}

#[test]
fn test_weekly_record_lifecycle_on_disk() -> StorageResult<()> {
    let (_dir, store) = open_store();
    let window = WeekWindow::for_instant(wednesday_noon()).unwrap();
    store.create_weekly(WeeklyQuotaRecord::new("alice", &window, 50, wednesday_noon()))?;

    let duplicate = store.create_weekly(WeeklyQuotaRecord::new("alice", &window, 300, wednesday_noon()));
    assert!(matches!(duplicate, Err(StorageError::Conflict { .. })));

    let first = store.admit_clamped("alice", window.week_start, run("a", 25))?;
    assert_eq!(first.admitted, 25);
    let second = store.admit_clamped("alice", window.week_start, run("b", 40))?;
    assert_eq!(second.admitted, 25);
    assert_eq!(second.record.runs[1].kept, 25);
    let third = store.admit_clamped("alice", window.week_start, run("c", 1))?;
    assert_eq!(third.admitted, 0);
    assert_eq!(third.record.runs.len(), 2);

    assert!(store.mark_run_deleted("alice", window.week_start, "a", wednesday_noon())?);
    let record = store.find_weekly("alice", window.week_start)?.unwrap();
    assert_eq!(record.consumed, 50);
    assert_eq!(record.limit, 50);
    assert_eq!(record.visible_runs().count(), 1);
    Ok(())
}

#[test]
fn test_admit_missing_record_is_not_found() {
    let (_dir, store) = open_store();
    let window = WeekWindow::for_instant(wednesday_noon()).unwrap();
    let err = store
        .admit_clamped("alice", window.week_start, run("a", 1))
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
    assert!(!store
        .mark_run_deleted("alice", window.week_start, "a", wednesday_noon())
        .unwrap());
}

#[test]
fn test_list_weekly_newest_first() -> StorageResult<()> {
    let (_dir, store) = open_store();
    for weeks_back in 0..3 {
        let instant = wednesday_noon() - Duration::weeks(weeks_back);
        let window = WeekWindow::for_instant(instant).unwrap();
        store.create_weekly(WeeklyQuotaRecord::new("alice", &window, 50, instant))?;
    }

    let records = store.list_weekly("alice")?;
    assert_eq!(records.len(), 3);
    assert!(records.windows(2).all(|pair| pair[0].week_start > pair[1].week_start));
    assert!(store.list_weekly("nobody")?.is_empty());
    Ok(())
}

#[test]
fn test_rejects_path_like_account_ids() {
    let (_dir, store) = open_store();
    for bad in ["", "..", "../etc", "a/b", "with space"] {
        let err = store.find_ledger(bad).unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }), "{:?} accepted", bad);
    }
    assert!(store.find_ledger("user.name@example.com").unwrap().is_none());
}

#[test]
fn test_failed_weekly_write_leaves_no_record() -> StorageResult<()> {
    let (dir, store) = open_store();
    let window = WeekWindow::for_instant(wednesday_noon()).unwrap();
    let blocker = dir.path().join("weekly").join("alice").join("2024-05-06.json.tmp");
    std::fs::create_dir_all(&blocker).unwrap();

    let failed = store.create_weekly(WeeklyQuotaRecord::new("alice", &window, 50, wednesday_noon()));
    assert!(matches!(failed, Err(StorageError::IOError { .. })));
    assert!(store.find_weekly("alice", window.week_start)?.is_none());

    std::fs::remove_dir(&blocker).unwrap();
    store.create_weekly(WeeklyQuotaRecord::new("alice", &window, 50, wednesday_noon()))?;
    let record = store.find_weekly("alice", window.week_start)?.unwrap();
    assert_eq!(record.limit, 50);
    assert_eq!(record.consumed, 0);
    Ok(())
}
