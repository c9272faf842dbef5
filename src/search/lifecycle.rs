use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::TierLimits;
use crate::error::QuotaError;
use crate::models::{AccountRef, ActionKind};
use crate::quota::weekly::{AdmitResult, WeeklyQuota};
use crate::utils::Clock;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchState {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SearchState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SearchState::Completed | SearchState::Failed | SearchState::Cancelled
        )
    }
}

impl fmt::Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchState::Running => "running",
            SearchState::Paused => "paused",
            SearchState::Completed => "completed",
            SearchState::Failed => "failed",
            SearchState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SearchEvent {
    Pause,
    Resume,
    Cancel,
    ProgressReport,
    FatalError,
}

impl fmt::Display for SearchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchEvent::Pause => "pause",
            SearchEvent::Resume => "resume",
            SearchEvent::Cancel => "cancel",
            SearchEvent::ProgressReport => "progressReport",
            SearchEvent::FatalError => "fatalError",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Cannot {event} a search that is {from}")]
    IllegalTransition { from: SearchState, event: SearchEvent },

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),
}

/// Which cap cut a batch short.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClampSource {
    Daily,
    Weekly,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SearchPhase {
    Started,
    Paused,
    Resumed,
    Cancelled,
    Progress,
    DailyReset,
    Completed,
    Error,
}

/// One line of the search's audit trail.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningEntry {
    pub phase: SearchPhase,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated_by: Vec<ClampSource>,
}

/// The weekly record a search is currently charging.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WeekRef {
    pub account_id: String,
    pub week_start: DateTime<Utc>,
}

/// Persistent state of a background job search.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiJobSearch {
    pub id: String,
    pub account_id: String,
    pub label: String,
    pub state: SearchState,
    pub daily_limit: i64,
    pub weekly_limit: i64,
    pub jobs_found_today: i64,
    /// UTC day `jobs_found_today` counts.
    pub counted_day: NaiveDate,
    pub total_jobs_found: i64,
    pub total_dropped: i64,
    pub batches_admitted: u32,
    /// Set when the last admission found the weekly quota exhausted.
    pub weekly_limit_reached: bool,
    pub week_ref: Option<WeekRef>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub reasoning_log: Vec<ReasoningEntry>,
}

/// Result of one progress report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressOutcome {
    pub found: i64,
    pub kept: i64,
    pub dropped: i64,
    pub truncated_by: Vec<ClampSource>,
    pub state: SearchState,
    pub weekly: Option<AdmitResult>,
}

/// Drives an [`AiJobSearch`] through its states.
///
/// Each progress report is clamped by the daily cap first, then by the
/// weekly quota; whatever neither admits is dropped and logged.
pub struct SearchLifecycle {
    search: AiJobSearch,
    weekly: Arc<WeeklyQuota>,
    clock: Arc<dyn Clock>,
}

impl SearchLifecycle {
    /// Starts a new search in the `running` state.
    pub fn start(
        account: &AccountRef,
        label: &str,
        limits: &TierLimits,
        weekly: Arc<WeeklyQuota>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let search = AiJobSearch {
            id: Uuid::new_v4().to_string(),
            account_id: account.id.clone(),
            label: label.to_string(),
            state: SearchState::Running,
            daily_limit: limits.daily_job_discovery,
            weekly_limit: limits.limit_for(ActionKind::JobDiscovery),
            jobs_found_today: 0,
            counted_day: now.date_naive(),
            total_jobs_found: 0,
            total_dropped: 0,
            batches_admitted: 0,
            weekly_limit_reached: false,
            week_ref: None,
            created_at: now,
            last_updated: now,
            reasoning_log: Vec::new(),
        };
        let mut lifecycle = Self {
            search,
            weekly,
            clock,
        };
        lifecycle.log(
            SearchPhase::Started,
            true,
            format!(
                "Search started (daily limit {}, weekly limit {})",
                lifecycle.search.daily_limit, lifecycle.search.weekly_limit
            ),
            Vec::new(),
        );
        info!(
            "Started job search {} for account {}",
            lifecycle.search.id, lifecycle.search.account_id
        );
        lifecycle
    }

    /// Rebuilds a lifecycle around previously persisted state.
    pub fn restore(search: AiJobSearch, weekly: Arc<WeeklyQuota>, clock: Arc<dyn Clock>) -> Self {
        Self {
            search,
            weekly,
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.search.id
    }

    pub fn state(&self) -> SearchState {
        self.search.state
    }

    /// Read-only copy of the search state, counters and log.
    pub fn snapshot(&self) -> AiJobSearch {
        self.search.clone()
    }

    pub fn pause(&mut self) -> Result<(), LifecycleError> {
        self.require(SearchEvent::Pause, &[SearchState::Running])?;
        self.transition(SearchState::Paused, SearchPhase::Paused, "Search paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), LifecycleError> {
        self.require(SearchEvent::Resume, &[SearchState::Paused])?;
        self.transition(SearchState::Running, SearchPhase::Resumed, "Search resumed");
        Ok(())
    }

    /// Stops the search for good. Quota already admitted stays consumed.
    pub fn cancel(&mut self) -> Result<(), LifecycleError> {
        self.require(
            SearchEvent::Cancel,
            &[SearchState::Running, SearchState::Paused],
        )?;
        self.transition(SearchState::Cancelled, SearchPhase::Cancelled, "Search cancelled");
        Ok(())
    }

    pub fn fatal_error(&mut self, message: &str) -> Result<(), LifecycleError> {
        self.require(SearchEvent::FatalError, &[SearchState::Running])?;
        warn!("Job search {} failed: {}", self.search.id, message);
        self.search.state = SearchState::Failed;
        self.log(
            SearchPhase::Error,
            false,
            format!("Search failed: {}", message),
            Vec::new(),
        );
        Ok(())
    }

    /// Accounts for `found` newly discovered jobs.
    pub fn progress_report(&mut self, found: i64) -> Result<ProgressOutcome, LifecycleError> {
        self.require(SearchEvent::ProgressReport, &[SearchState::Running])?;

        let now = self.clock.now();
        self.reset_daily_if_new_day(now.date_naive());

        let found = found.max(0);
        let daily_room = if self.search.daily_limit < 0 {
            found
        } else {
            (self.search.daily_limit - self.search.jobs_found_today).max(0)
        };
        let requested = found.min(daily_room);

        let mut truncated_by = Vec::new();
        if requested < found {
            truncated_by.push(ClampSource::Daily);
        }

        let mut kept = 0;
        let mut weekly = None;
        if requested > 0 {
            let run_id = self.search.id.clone();
            let label = format!("{} #{}", self.search.label, self.search.batches_admitted + 1);
            let result = match self.weekly.admit_with_limit(
                &self.search.account_id,
                self.search.weekly_limit,
                &run_id,
                requested,
                &label,
            ) {
                Ok(result) => result,
                Err(e) => {
                    self.log(
                        SearchPhase::Error,
                        false,
                        format!("Could not admit {} jobs: {}", requested, e),
                        truncated_by,
                    );
                    return Err(e.into());
                }
            };

            if let Some(week_start) = result.week_start {
                self.search.week_ref = Some(WeekRef {
                    account_id: self.search.account_id.clone(),
                    week_start,
                });
            }
            if result.admitted < requested {
                truncated_by.push(ClampSource::Weekly);
            }
            if result.admitted > 0 {
                self.search.batches_admitted += 1;
            }
            self.search.weekly_limit_reached = result.limit_reached;
            kept = result.admitted;
            weekly = Some(result);
        }

        let dropped = found - kept;
        self.search.jobs_found_today += kept;
        self.search.total_jobs_found += kept;
        self.search.total_dropped += dropped;

        let message = self.progress_message(found, kept, &truncated_by, weekly.as_ref());
        self.log(SearchPhase::Progress, true, message, truncated_by.clone());
        debug!(
            "Search {} kept {} of {} ({} today, {} total)",
            self.search.id, kept, found, self.search.jobs_found_today, self.search.total_jobs_found
        );

        let daily_exhausted = self.search.daily_limit >= 0
            && self.search.jobs_found_today >= self.search.daily_limit;
        if daily_exhausted && self.search.weekly_limit_reached {
            self.transition(
                SearchState::Completed,
                SearchPhase::Completed,
                "Daily and weekly limits reached",
            );
        }

        Ok(ProgressOutcome {
            found,
            kept,
            dropped,
            truncated_by,
            state: self.search.state,
            weekly,
        })
    }

    fn progress_message(
        &self,
        found: i64,
        kept: i64,
        truncated_by: &[ClampSource],
        weekly: Option<&AdmitResult>,
    ) -> String {
        if found == 0 {
            return "No new jobs found".to_string();
        }
        let mut message = format!("Kept {} of {} jobs", kept, found);
        if truncated_by.contains(&ClampSource::Daily) {
            message.push_str(&format!("; daily limit of {} reached", self.search.daily_limit));
        }
        if truncated_by.contains(&ClampSource::Weekly) {
            if let Some(result) = weekly {
                message.push_str(&format!(
                    "; weekly limit of {} reached, {} dropped",
                    result.limit,
                    result.dropped()
                ));
            }
        }
        message
    }

    fn reset_daily_if_new_day(&mut self, today: NaiveDate) {
        if today == self.search.counted_day {
            return;
        }
        let previous = self.search.jobs_found_today;
        self.search.counted_day = today;
        self.search.jobs_found_today = 0;
        self.search.weekly_limit_reached = false;
        self.log(
            SearchPhase::DailyReset,
            true,
            format!("New day {}; daily count reset from {}", today, previous),
            Vec::new(),
        );
    }

    fn require(&self, event: SearchEvent, allowed_from: &[SearchState]) -> Result<(), LifecycleError> {
        if allowed_from.contains(&self.search.state) {
            Ok(())
        } else {
            debug!(
                "Rejected {} on search {} in state {}",
                event, self.search.id, self.search.state
            );
            Err(LifecycleError::IllegalTransition {
                from: self.search.state,
                event,
            })
        }
    }

    fn transition(&mut self, to: SearchState, phase: SearchPhase, message: &str) {
        info!(
            "Job search {}: {} -> {}",
            self.search.id, self.search.state, to
        );
        self.search.state = to;
        self.log(phase, true, message.to_string(), Vec::new());
    }

    fn log(
        &mut self,
        phase: SearchPhase,
        success: bool,
        message: String,
        truncated_by: Vec<ClampSource>,
    ) {
        let now = self.clock.now();
        self.search.last_updated = now;
        self.search.reasoning_log.push(ReasoningEntry {
            phase,
            timestamp: now,
            success,
            message,
            truncated_by,
        });
    }
}
