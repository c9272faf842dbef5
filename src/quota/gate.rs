use chrono::Duration;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{QuotaConfig, TierLimits, TierLimitsProvider};
use crate::error::QuotaResult;
use crate::models::{AccountRef, ActionKind, QuotaWindow};
use crate::quota::ledger::{percent_used, DenialReason, UsageLedger};
use crate::quota::rate_limit::{InMemoryRateLimiter, RateLimitWindow, RateLimiter};
use crate::quota::weekly::{AdmitResult, WeeklyQuota};
use crate::quota::ActionMetadata;
use crate::storage::traits::QuotaStore;
use crate::utils::Clock;

/// One entry of a batch check or track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub qty: i64,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, qty: i64) -> Self {
        Self { kind, qty }
    }
}

/// Answer to a pre-action check, ready to show to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub kind: ActionKind,
    pub window: QuotaWindow,
    pub allowed: bool,
    pub current: i64,
    pub requested: i64,
    pub limit: i64,
    pub remaining: i64,
    /// Usage after this action would sit at or above the warning threshold.
    pub warning: bool,
    pub reason: Option<String>,
    pub upgrade_hint: Option<String>,
}

/// Every decision of a batch check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiDecision {
    pub allowed: bool,
    pub decisions: Vec<Decision>,
}

impl MultiDecision {
    pub fn failures(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(|d| !d.allowed)
    }
}

/// Answer of the hourly request gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub reason: Option<String>,
}

/// What happened when usage was recorded.
///
/// Recording runs after the user's action already succeeded, so a store
/// failure is reported here as `Failed` and never as an error the caller
/// could propagate into the action's response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TrackOutcome {
    Recorded {
        kind: ActionKind,
        new_total: i64,
        remaining: i64,
    },
    Admitted {
        kind: ActionKind,
        result: AdmitResult,
    },
    Failed {
        kind: ActionKind,
        error: String,
    },
}

impl TrackOutcome {
    pub fn kind(&self) -> ActionKind {
        match self {
            TrackOutcome::Recorded { kind, .. }
            | TrackOutcome::Admitted { kind, .. }
            | TrackOutcome::Failed { kind, .. } => *kind,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TrackOutcome::Failed { .. })
    }
}

/// Check-then-track façade for request handlers.
///
/// `check_*` reads counters and never changes them. `track_*` records usage
/// after the gated action succeeded. Monthly kinds go to the usage ledger,
/// `jobDiscovery` to the weekly quota.
pub struct QuotaGate {
    ledger: UsageLedger,
    weekly: Arc<WeeklyQuota>,
    rate_limit: RateLimitWindow,
    limits: Arc<dyn TierLimitsProvider>,
    warning_threshold_percent: u8,
}

impl QuotaGate {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        limits: Arc<dyn TierLimitsProvider>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger: UsageLedger::new(store.clone(), limits.clone(), clock.clone()),
            weekly: Arc::new(WeeklyQuota::new(store, clock)),
            rate_limit: RateLimitWindow::new(limiter),
            limits,
            warning_threshold_percent: 80,
        }
    }

    /// Wires a gate from configuration with an in-process rate limiter.
    pub fn from_config(config: &QuotaConfig, store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>) -> Self {
        let limiter = InMemoryRateLimiter::new(clock.clone()).with_cleanup(
            config.rate_limit_cleanup_probability,
            Duration::hours(config.rate_limit_retention_hours),
        );
        Self::new(store, Arc::new(config.clone()), Arc::new(limiter), clock)
            .with_warning_threshold(config.warning_threshold_percent)
    }

    pub fn with_warning_threshold(mut self, percent: u8) -> Self {
        self.warning_threshold_percent = percent;
        self
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn weekly(&self) -> Arc<WeeklyQuota> {
        self.weekly.clone()
    }

    pub fn tier_limits(&self, account: &AccountRef) -> TierLimits {
        self.limits.limits_for(&account.tier)
    }

    /// Whether `account` may perform `qty` of `kind` right now.
    pub fn check_action(&self, account: &AccountRef, kind: ActionKind, qty: i64) -> QuotaResult<Decision> {
        let tier = self.tier_limits(account);
        match kind.window() {
            QuotaWindow::Monthly => {
                let check = self.ledger.check(account, kind, qty)?;
                let reason = check.reason.map(|reason| match reason {
                    DenialReason::LimitReached => format!(
                        "You've reached your monthly limit of {} {}.",
                        check.limit,
                        kind.label()
                    ),
                    DenialReason::WouldExceed => format!(
                        "This would exceed your monthly limit of {} {} ({} used, {} requested).",
                        check.limit,
                        kind.label(),
                        check.current,
                        qty
                    ),
                });
                Ok(self.decision(
                    &tier,
                    kind,
                    check.allowed,
                    check.current,
                    qty,
                    check.limit,
                    check.remaining,
                    reason,
                ))
            }
            QuotaWindow::Weekly => {
                let stats = self.weekly.current_stats(&account.id, tier.limit_for(kind))?;
                // Weekly admission is partial, so any room left allows the action.
                let allowed = !stats.limit_reached;
                let reason = if allowed {
                    None
                } else {
                    let resets = stats
                        .window
                        .map(|w| format!(" It resets on {}.", (w.week_end + Duration::milliseconds(1)).format("%A, %B %-d")))
                        .unwrap_or_default();
                    Some(format!(
                        "You've reached your weekly limit of {} {}.{}",
                        stats.limit,
                        kind.label(),
                        resets
                    ))
                };
                Ok(self.decision(
                    &tier,
                    kind,
                    allowed,
                    stats.consumed,
                    qty,
                    stats.limit,
                    stats.remaining,
                    reason,
                ))
            }
        }
    }

    /// Records usage of an action that already succeeded. Never fails.
    pub fn track_action(
        &self,
        account: &AccountRef,
        kind: ActionKind,
        qty: i64,
        metadata: &ActionMetadata,
    ) -> TrackOutcome {
        let outcome = match kind.window() {
            QuotaWindow::Monthly => self
                .ledger
                .commit(account, kind, qty, metadata)
                .map(|commit| TrackOutcome::Recorded {
                    kind,
                    new_total: commit.new_total,
                    remaining: commit.remaining,
                }),
            QuotaWindow::Weekly => {
                let run_id = metadata
                    .run_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let label = metadata.label.clone().unwrap_or_else(|| kind.label().to_string());
                let limit = self.tier_limits(account).limit_for(kind);
                self.weekly
                    .admit_with_limit(&account.id, limit, &run_id, qty, &label)
                    .map(|result| TrackOutcome::Admitted { kind, result })
            }
        };

        outcome.unwrap_or_else(|e| {
            error!(
                "Failed to track {} x{} for account {}: {}; action stands",
                kind, qty, account.id, e
            );
            TrackOutcome::Failed {
                kind,
                error: e.to_string(),
            }
        })
    }

    /// Checks every request and reports all failures, not just the first.
    pub fn check_multiple(&self, account: &AccountRef, requests: &[ActionRequest]) -> QuotaResult<MultiDecision> {
        let decisions = requests
            .iter()
            .map(|request| self.check_action(account, request.kind, request.qty))
            .collect::<QuotaResult<Vec<_>>>()?;
        let allowed = decisions.iter().all(|d| d.allowed);
        Ok(MultiDecision { allowed, decisions })
    }

    /// Tracks every request; one failing does not stop the others.
    pub fn track_multiple(
        &self,
        account: &AccountRef,
        requests: &[ActionRequest],
        metadata: &ActionMetadata,
    ) -> Vec<TrackOutcome> {
        requests
            .iter()
            .map(|request| self.track_action(account, request.kind, request.qty, metadata))
            .collect()
    }

    /// Counts one request against the tier's hourly budget.
    pub fn check_rate_limit(&self, account: &AccountRef) -> RateDecision {
        let limit = self.tier_limits(account).requests_per_hour;
        let allowed = self.rate_limit.allow(&account.id, limit);
        if !allowed {
            info!("Account {} exceeded {} requests per hour", account.id, limit);
        }
        RateDecision {
            allowed,
            limit,
            reason: (!allowed).then(|| {
                format!("Too many requests: limit is {} per hour. Try again later.", limit)
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        &self,
        tier: &TierLimits,
        kind: ActionKind,
        allowed: bool,
        current: i64,
        requested: i64,
        limit: i64,
        remaining: i64,
        reason: Option<String>,
    ) -> Decision {
        let warning = allowed
            && percent_used(current.saturating_add(requested.max(0)), limit)
                .map_or(false, |pct| pct >= self.warning_threshold_percent);
        let upgrade_hint = if allowed {
            None
        } else {
            tier.upgrade_to.as_ref().map(|next| {
                format!("Upgrade to {} for a higher {} limit.", next, kind.label())
            })
        };

        Decision {
            kind,
            window: kind.window(),
            allowed,
            current,
            requested,
            limit,
            remaining,
            warning,
            reason,
            upgrade_hint,
        }
    }
}
