use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::config::TierLimitsProvider;
use crate::error::QuotaResult;
use crate::models::{AccountRef, ActionKind, QuotaWindow, UsageLedgerRecord, UsageSnapshot, UNLIMITED};
use crate::quota::ActionMetadata;
use crate::storage::errors::StorageError;
use crate::storage::traits::QuotaStore;
use crate::utils::time::{add_one_month, start_of_month};
use crate::utils::Clock;

/// Why a usage check was negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DenialReason {
    /// The counter already sits at the limit.
    LimitReached,
    /// The counter is below the limit but the request would pass it.
    WouldExceed,
}

/// Read-only answer to "may this account perform `qty` more of `kind`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCheck {
    pub kind: ActionKind,
    pub allowed: bool,
    pub current: i64,
    pub requested: i64,
    pub limit: i64,
    /// `UNLIMITED` when the limit is unlimited.
    pub remaining: i64,
    pub reason: Option<DenialReason>,
}

impl UsageCheck {
    pub fn evaluate(kind: ActionKind, current: i64, requested: i64, limit: i64) -> Self {
        let (allowed, reason) = if limit < 0 {
            (true, None)
        } else if current >= limit {
            (false, Some(DenialReason::LimitReached))
        } else if current.saturating_add(requested) > limit {
            (false, Some(DenialReason::WouldExceed))
        } else {
            (true, None)
        };

        Self {
            kind,
            allowed,
            current,
            requested,
            limit,
            remaining: remaining(current, limit),
            reason,
        }
    }
}

/// Result of recording usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCommit {
    pub kind: ActionKind,
    pub new_total: i64,
    pub remaining: i64,
}

/// One line of a usage dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummaryItem {
    pub kind: ActionKind,
    pub current: i64,
    pub limit: i64,
    pub remaining: i64,
    /// `None` for unlimited kinds.
    pub percent_used: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub account_id: String,
    pub period_start: Option<DateTime<Utc>>,
    pub items: Vec<UsageSummaryItem>,
}

fn remaining(current: i64, limit: i64) -> i64 {
    if limit < 0 {
        UNLIMITED
    } else {
        (limit - current).max(0)
    }
}

/// Share of `limit` that `current` represents, capped at 100.
pub fn percent_used(current: i64, limit: i64) -> Option<u8> {
    if limit < 0 {
        return None;
    }
    if limit == 0 {
        return Some(100);
    }
    let pct = (current.max(0) as f64 / limit as f64 * 100.0).floor();
    Some(pct.min(100.0) as u8)
}

/// Monthly usage counters per account and action kind.
///
/// Periods are calendar months in UTC. Rollover is lazy: it happens the first
/// time any operation observes that the current period has elapsed.
pub struct UsageLedger {
    store: Arc<dyn QuotaStore>,
    limits: Arc<dyn TierLimitsProvider>,
    clock: Arc<dyn Clock>,
}

impl UsageLedger {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        limits: Arc<dyn TierLimitsProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            limits,
            clock,
        }
    }

    /// Compares current usage plus `qty` against the tier limit. Never creates
    /// a ledger; an account without one has used nothing.
    pub fn check(&self, account: &AccountRef, kind: ActionKind, qty: i64) -> QuotaResult<UsageCheck> {
        self.rollover_if_due(&account.id)?;

        let current = self
            .store
            .find_ledger(&account.id)?
            .map(|ledger| ledger.current_period.count(kind))
            .unwrap_or(0);
        let limit = self.limits.limits_for(&account.tier).limit_for(kind);

        Ok(UsageCheck::evaluate(kind, current, qty, limit))
    }

    /// Adds `qty` to the counter without re-validating against the limit.
    /// Callers are expected to have run `check` first. A non-positive `qty`
    /// records nothing and reports the current total.
    pub fn commit(
        &self,
        account: &AccountRef,
        kind: ActionKind,
        qty: i64,
        metadata: &ActionMetadata,
    ) -> QuotaResult<UsageCommit> {
        if kind.window() != QuotaWindow::Monthly {
            debug!("Recording weekly kind {} in the monthly ledger", kind);
        }
        let limit = self.limits.limits_for(&account.tier).limit_for(kind);
        if qty <= 0 {
            debug!("Ignoring commit of {} {} for account {}", qty, kind, account.id);
            self.rollover_if_due(&account.id)?;
            let current = self
                .store
                .find_ledger(&account.id)?
                .map(|ledger| ledger.current_period.count(kind))
                .unwrap_or(0);
            return Ok(UsageCommit {
                kind,
                new_total: current,
                remaining: remaining(current, limit),
            });
        }

        let now = self.clock.now();
        self.ensure_ledger(&account.id, now)?;

        let new_total = self.store.increment_usage(&account.id, kind, qty, now)?;
        debug!(
            "Committed {} {} for account {} (total {}, metadata {:?})",
            qty, kind, account.id, new_total, metadata
        );

        Ok(UsageCommit {
            kind,
            new_total,
            remaining: remaining(new_total, limit),
        })
    }

    /// Archives the current period if a calendar month has passed since it
    /// started. Returns whether a rollover happened; a second call within the
    /// same period is a no-op.
    pub fn rollover_if_due(&self, account_id: &str) -> QuotaResult<bool> {
        let now = self.clock.now();
        let ledger = match self.store.find_ledger(account_id)? {
            Some(ledger) => ledger,
            None => return Ok(false),
        };

        let period_start = ledger.current_period.period_start;
        let due_at = match add_one_month(period_start) {
            Some(due_at) => due_at,
            None => {
                warn!(
                    "Cannot compute end of period starting {} for account {}; skipping rollover",
                    period_start, account_id
                );
                return Ok(false);
            }
        };
        if now < due_at {
            return Ok(false);
        }

        let new_start = start_of_month(now).unwrap_or(due_at);
        let rolled = self
            .store
            .rollover_ledger(account_id, period_start, new_start, now)?;
        if rolled {
            info!(
                "Rolled over usage ledger for account {}: {} -> {}",
                account_id, period_start, new_start
            );
        }
        Ok(rolled)
    }

    /// Current-period usage of every monthly kind.
    pub fn summary(&self, account: &AccountRef) -> QuotaResult<UsageSummary> {
        self.rollover_if_due(&account.id)?;

        let ledger = self.store.find_ledger(&account.id)?;
        let limits = self.limits.limits_for(&account.tier);
        let items = ActionKind::ALL
            .iter()
            .filter(|kind| kind.window() == QuotaWindow::Monthly)
            .map(|&kind| {
                let current = ledger
                    .as_ref()
                    .map(|l| l.current_period.count(kind))
                    .unwrap_or(0);
                let limit = limits.limit_for(kind);
                UsageSummaryItem {
                    kind,
                    current,
                    limit,
                    remaining: remaining(current, limit),
                    percent_used: percent_used(current, limit),
                }
            })
            .collect();

        Ok(UsageSummary {
            account_id: account.id.clone(),
            period_start: ledger.map(|l| l.current_period.period_start),
            items,
        })
    }

    /// Archived periods, oldest first.
    pub fn history(&self, account_id: &str) -> QuotaResult<Vec<UsageSnapshot>> {
        Ok(self
            .store
            .find_ledger(account_id)?
            .map(|ledger| ledger.history)
            .unwrap_or_default())
    }

    fn ensure_ledger(&self, account_id: &str, now: DateTime<Utc>) -> QuotaResult<()> {
        if self.store.find_ledger(account_id)?.is_some() {
            self.rollover_if_due(account_id)?;
            return Ok(());
        }

        let period_start = start_of_month(now).unwrap_or_else(|| {
            warn!("Cannot compute start of month for {}; period starts now", now);
            now
        });
        match self
            .store
            .create_ledger(UsageLedgerRecord::new(account_id, period_start, now))
        {
            Ok(()) => {
                debug!("Created usage ledger for account {}", account_id);
                Ok(())
            }
            // Another caller created it first.
            Err(StorageError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_unlimited_always_allows() {
        let check = UsageCheck::evaluate(ActionKind::JobImports, 10_000, 50, UNLIMITED);
        assert!(check.allowed);
        assert_eq!(check.remaining, UNLIMITED);
        assert_eq!(check.reason, None);
    }

    #[test]
    fn test_evaluate_reasons() {
        let at_limit = UsageCheck::evaluate(ActionKind::JobImports, 10, 1, 10);
        assert!(!at_limit.allowed);
        assert_eq!(at_limit.reason, Some(DenialReason::LimitReached));

        let over = UsageCheck::evaluate(ActionKind::JobImports, 8, 3, 10);
        assert!(!over.allowed);
        assert_eq!(over.reason, Some(DenialReason::WouldExceed));
        assert_eq!(over.remaining, 2);

        let exact = UsageCheck::evaluate(ActionKind::JobImports, 8, 2, 10);
        assert!(exact.allowed);
    }

    #[test]
    fn test_evaluate_saturates_huge_requests() {
        let check = UsageCheck::evaluate(ActionKind::JobImports, 1, i64::MAX, 10);
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(DenialReason::WouldExceed));
    }

    #[test]
    fn test_zero_limit_denies() {
        let check = UsageCheck::evaluate(ActionKind::CoverLetters, 0, 1, 0);
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(DenialReason::LimitReached));
    }

    #[test]
    fn test_percent_used() {
        assert_eq!(percent_used(5, UNLIMITED), None);
        assert_eq!(percent_used(0, 0), Some(100));
        assert_eq!(percent_used(8, 10), Some(80));
        assert_eq!(percent_used(30, 10), Some(100));
    }
}
