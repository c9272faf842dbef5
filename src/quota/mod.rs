pub mod gate;
pub mod ledger;
pub mod rate_limit;
pub mod weekly;


pub use gate::{ActionRequest, Decision, MultiDecision, QuotaGate, RateDecision, TrackOutcome};
pub use ledger::{DenialReason, UsageCheck, UsageCommit, UsageLedger, UsageSummary, UsageSummaryItem};
pub use rate_limit::{InMemoryRateLimiter, RateLimitWindow, RateLimiter};
pub use weekly::{AdmitResult, WeeklyQuota, WeeklyStats};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Context attached to a tracked action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetadata {
    /// Run identifier for weekly admissions; generated when absent.
    pub run_id: Option<String>,
    /// Display label for the run entry.
    pub label: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ActionMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }
}
