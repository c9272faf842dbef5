use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::window::WeekWindow;

/// Limit value meaning "no cap".
pub const UNLIMITED: i64 = -1;

/// The account a quota operation is charged to. Owned by the subscription
/// system; this crate only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    pub id: String,
    pub tier: String,
}

impl AccountRef {
    pub fn new(id: &str, tier: &str) -> Self {
        Self {
            id: id.to_string(),
            tier: tier.to_string(),
        }
    }
}

/// Which counter scopes an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Monthly,
    Weekly,
}

/// Metered actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    ResumeUploads,
    JobImports,
    AiConversations,
    CoverLetters,
    ResumeTailoring,
    JobDiscovery,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::ResumeUploads,
        ActionKind::JobImports,
        ActionKind::AiConversations,
        ActionKind::CoverLetters,
        ActionKind::ResumeTailoring,
        ActionKind::JobDiscovery,
    ];

    pub fn window(&self) -> QuotaWindow {
        match self {
            ActionKind::JobDiscovery => QuotaWindow::Weekly,
            _ => QuotaWindow::Monthly,
        }
    }

    /// Stable identifier used in storage and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ResumeUploads => "resumeUploads",
            ActionKind::JobImports => "jobImports",
            ActionKind::AiConversations => "aiConversations",
            ActionKind::CoverLetters => "coverLetters",
            ActionKind::ResumeTailoring => "resumeTailoring",
            ActionKind::JobDiscovery => "jobDiscovery",
        }
    }

    /// Human-readable name for messages.
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::ResumeUploads => "resume uploads",
            ActionKind::JobImports => "job imports",
            ActionKind::AiConversations => "AI conversations",
            ActionKind::CoverLetters => "cover letters",
            ActionKind::ResumeTailoring => "resume tailoring",
            ActionKind::JobDiscovery => "discovered jobs",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseActionKindError(pub String);

impl fmt::Display for ParseActionKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown action kind '{}'", self.0)
    }
}

impl std::error::Error for ParseActionKindError {}

impl FromStr for ActionKind {
    type Err = ParseActionKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseActionKindError(s.to_string()))
    }
}

/// Per-kind counts for one period.
pub type UsageCounts = BTreeMap<ActionKind, i64>;

/// Counters of a single monthly period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub period_start: DateTime<Utc>,
    #[serde(default)]
    pub counts: UsageCounts,
}

impl UsageSnapshot {
    pub fn empty(period_start: DateTime<Utc>) -> Self {
        Self {
            period_start,
            counts: UsageCounts::new(),
        }
    }

    pub fn count(&self, kind: ActionKind) -> i64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

/// Monthly usage ledger of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLedgerRecord {
    pub account_id: String,
    pub current_period: UsageSnapshot,
    #[serde(default)]
    pub history: Vec<UsageSnapshot>,
    pub last_updated: DateTime<Utc>,
}

impl UsageLedgerRecord {
    pub fn new(account_id: &str, period_start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            current_period: UsageSnapshot::empty(period_start),
            history: Vec::new(),
            last_updated: now,
        }
    }

    /// Archives the current period and opens an empty one.
    pub fn roll_over(&mut self, new_period_start: DateTime<Utc>, now: DateTime<Utc>) {
        let finished = std::mem::replace(
            &mut self.current_period,
            UsageSnapshot::empty(new_period_start),
        );
        self.history.push(finished);
        self.last_updated = now;
    }
}

/// One contribution to a weekly discovery counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRunEntry {
    pub run_id: String,
    pub run_date: DateTime<Utc>,
    pub kept: i64,
    pub label: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Weekly job discovery counter of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyQuotaRecord {
    pub account_id: String,
    pub week_start: DateTime<Utc>,
    pub week_end: DateTime<Utc>,
    pub week_year: i32,
    pub week_number: u32,
    pub limit: i64,
    pub consumed: i64,
    #[serde(default)]
    pub runs: Vec<SearchRunEntry>,
    pub created_at: DateTime<Utc>,
}

impl WeeklyQuotaRecord {
    pub fn new(account_id: &str, window: &WeekWindow, limit: i64, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            week_start: window.week_start,
            week_end: window.week_end,
            week_year: window.week_year,
            week_number: window.week_number,
            limit,
            consumed: 0,
            runs: Vec::new(),
            created_at: now,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit < 0
    }

    /// Quota still available; `UNLIMITED` for uncapped records.
    pub fn remaining(&self) -> i64 {
        if self.is_unlimited() {
            UNLIMITED
        } else {
            (self.limit - self.consumed).max(0)
        }
    }

    /// How much of `requested` fits under the cap.
    pub fn admissible(&self, requested: i64) -> i64 {
        if self.is_unlimited() {
            requested.max(0)
        } else {
            requested.min(self.limit - self.consumed).max(0)
        }
    }

    /// Runs that have not been soft-deleted.
    pub fn visible_runs(&self) -> impl Iterator<Item = &SearchRunEntry> {
        self.runs.iter().filter(|run| !run.deleted)
    }

    /// Sum of `kept` over every run, deleted or not.
    pub fn kept_total(&self) -> i64 {
        self.runs.iter().map(|run| run.kept).sum()
    }
}
