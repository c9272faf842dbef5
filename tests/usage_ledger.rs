use chrono::{TimeZone, Utc};
use quota_engine::config::QuotaConfig;
use quota_engine::error::QuotaResult;
use quota_engine::quota::{ActionMetadata, DenialReason, UsageLedger};
use quota_engine::storage::traits::QuotaStore;
use quota_engine::storage::InMemoryStorage;
use quota_engine::{AccountRef, ActionKind};
use std::sync::Arc;

use test_helpers::{manual_clock, FlakyStore};

fn ledger_with(store: Arc<dyn QuotaStore>, clock: Arc<quota_engine::ManualClock>) -> UsageLedger {
    UsageLedger::new(store, Arc::new(QuotaConfig::default()), clock)
}

#[test]
fn test_check_never_creates_a_ledger() -> QuotaResult<()> {
    let store = Arc::new(InMemoryStorage::new());
    let ledger = ledger_with(store.clone(), manual_clock());

    let check = ledger.check(&AccountRef::new("alice", "free"), ActionKind::CoverLetters, 2)?;
    assert!(check.allowed);
    assert_eq!(check.current, 0);
    assert_eq!(check.remaining, 5);
    assert!(store.find_ledger("alice")?.is_none());
    Ok(())
}

#[test]
fn test_commit_does_not_revalidate() -> QuotaResult<()> {
    let ledger = ledger_with(Arc::new(InMemoryStorage::new()), manual_clock());
    let account = AccountRef::new("alice", "free");

    let commit = ledger.commit(&account, ActionKind::ResumeUploads, 5, &ActionMetadata::new())?;
    assert_eq!(commit.new_total, 5);
    assert_eq!(commit.remaining, 0);

    let check = ledger.check(&account, ActionKind::ResumeUploads, 1)?;
    assert!(!check.allowed);
    assert_eq!(check.reason, Some(DenialReason::LimitReached));
    Ok(())
}

#[test]
fn test_rollover_is_idempotent() -> QuotaResult<()> {
    let clock = manual_clock();
    let ledger = ledger_with(Arc::new(InMemoryStorage::new()), clock.clone());
    let account = AccountRef::new("alice", "free");
    ledger.commit(&account, ActionKind::JobImports, 7, &ActionMetadata::new())?;

    clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    assert!(ledger.rollover_if_due("alice")?);
    assert!(!ledger.rollover_if_due("alice")?);

    let history = ledger.history("alice")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].count(ActionKind::JobImports), 7);
    assert_eq!(
        history[0].period_start,
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    );

    let summary = ledger.summary(&account)?;
    assert_eq!(summary.period_start, Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
    assert!(summary.items.iter().all(|item| item.current == 0));
    Ok(())
}

#[test]
fn test_rollover_not_due_within_month() -> QuotaResult<()> {
    let clock = manual_clock();
    let ledger = ledger_with(Arc::new(InMemoryStorage::new()), clock.clone());
    ledger.commit(&AccountRef::new("alice", "free"), ActionKind::JobImports, 1, &ActionMetadata::new())?;

    clock.set(Utc.with_ymd_and_hms(2024, 5, 31, 23, 59, 59).unwrap());
    assert!(!ledger.rollover_if_due("alice")?);
    assert!(ledger.history("alice")?.is_empty());
    Ok(())
}

#[test]
fn test_skipped_months_archive_once() -> QuotaResult<()> {
    let clock = manual_clock();
    let ledger = ledger_with(Arc::new(InMemoryStorage::new()), clock.clone());
    let account = AccountRef::new("alice", "free");
    ledger.commit(&account, ActionKind::AiConversations, 4, &ActionMetadata::new())?;

    clock.set(Utc.with_ymd_and_hms(2024, 9, 17, 8, 0, 0).unwrap());
    let commit = ledger.commit(&account, ActionKind::AiConversations, 1, &ActionMetadata::new())?;
    assert_eq!(commit.new_total, 1);

    let history = ledger.history("alice")?;
    assert_eq!(history.len(), 1);
    let summary = ledger.summary(&account)?;
    assert_eq!(summary.period_start, Some(Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap()));
    Ok(())
}

#[test]
fn test_unknown_tier_uses_default_limits() -> QuotaResult<()> {
    let ledger = ledger_with(Arc::new(InMemoryStorage::new()), manual_clock());
    let check = ledger.check(&AccountRef::new("alice", "enterprise"), ActionKind::ResumeUploads, 1)?;
    assert_eq!(check.limit, 3);
    Ok(())
}

#[test]
fn test_commit_surfaces_store_failure() {
    let store = Arc::new(FlakyStore::new());
    let ledger = ledger_with(store.clone(), manual_clock());
    let account = AccountRef::new("alice", "free");

    store.set_failing(true);
    assert!(ledger
        .commit(&account, ActionKind::JobImports, 1, &ActionMetadata::new())
        .is_err());

    store.set_failing(false);
    let commit = ledger
        .commit(&account, ActionKind::JobImports, 1, &ActionMetadata::new())
        .unwrap();
    assert_eq!(commit.new_total, 1);
}

#[test]
fn test_negative_commit_cannot_refund_usage() -> QuotaResult<()> {
    let store = Arc::new(InMemoryStorage::new());
    let ledger = ledger_with(store.clone(), manual_clock());
    let account = AccountRef::new("alice", "free");

    ledger.commit(&account, ActionKind::ResumeUploads, 3, &ActionMetadata::new())?;
    let refund = ledger.commit(&account, ActionKind::ResumeUploads, -3, &ActionMetadata::new())?;
    assert_eq!(refund.new_total, 3);
    assert_eq!(refund.remaining, 0);

    let check = ledger.check(&account, ActionKind::ResumeUploads, 1)?;
    assert!(!check.allowed);
    assert_eq!(check.reason, Some(DenialReason::LimitReached));

    // Storing a negative quantity directly is clamped too.
    let at = Utc.with_ymd_and_hms(2024, 5, 8, 12, 0, 0).unwrap();
    assert_eq!(store.increment_usage("alice", ActionKind::ResumeUploads, -3, at)?, 3);
    Ok(())
}

#[test]
fn test_zero_commit_on_fresh_account_creates_nothing() -> QuotaResult<()> {
    let store = Arc::new(InMemoryStorage::new());
    let ledger = ledger_with(store.clone(), manual_clock());

    let commit = ledger.commit(&AccountRef::new("bob", "free"), ActionKind::CoverLetters, 0, &ActionMetadata::new())?;
    assert_eq!(commit.new_total, 0);
    assert_eq!(commit.remaining, 5);
    assert!(store.find_ledger("bob")?.is_none());
    Ok(())
}

#[test]
fn test_huge_request_is_denied_without_overflow() -> QuotaResult<()> {
    let ledger = ledger_with(Arc::new(InMemoryStorage::new()), manual_clock());
    let account = AccountRef::new("alice", "free");
    ledger.commit(&account, ActionKind::JobImports, 1, &ActionMetadata::new())?;

    let check = ledger.check(&account, ActionKind::JobImports, i64::MAX)?;
    assert!(!check.allowed);
    assert_eq!(check.reason, Some(DenialReason::WouldExceed));
    Ok(())
}
