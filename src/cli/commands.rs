use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::debug;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::cli::output::Output;
use crate::config::{QuotaConfig, TierLimitsProvider};
use crate::error::QuotaError;
use crate::models::{AccountRef, ActionKind, UNLIMITED};
use crate::quota::{ActionMetadata, ActionRequest, QuotaGate, TrackOutcome, WeeklyQuota};
use crate::search::{LifecycleError, SearchLifecycle};
use crate::storage::traits::QuotaStore;
use crate::storage::InMemoryStorage;
use crate::utils::time::format_duration;
use crate::utils::{Clock, ManualClock};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Quota(#[from] QuotaError),

    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Everything a command needs to run.
pub struct CliContext {
    pub config: QuotaConfig,
    pub clock: Arc<dyn Clock>,
    pub gate: QuotaGate,
}

impl CliContext {
    pub fn new(config: QuotaConfig, store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>) -> Self {
        let gate = QuotaGate::from_config(&config, store, clock.clone());
        Self {
            config,
            clock,
            gate,
        }
    }
}

fn account_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("account")
            .short('a')
            .long("account")
            .value_name("ACCOUNT_ID")
            .help("Account to act on")
            .required(true),
    )
    .arg(
        Arg::new("tier")
            .short('t')
            .long("tier")
            .value_name("TIER")
            .help("Subscription tier (defaults to the configured default tier)"),
    )
}

fn kind_arg(multiple: bool) -> Arg {
    let arg = Arg::new("kind")
        .short('k')
        .long("kind")
        .value_name("KIND")
        .help("Action kind, e.g. resumeUploads or jobDiscovery")
        .required(true);
    if multiple {
        arg.action(ArgAction::Append)
    } else {
        arg
    }
}

fn qty_arg(default: &'static str) -> Arg {
    Arg::new("qty")
        .short('q')
        .long("qty")
        .value_name("N")
        .help("Quantity")
        .value_parser(value_parser!(i64))
        .default_value(default)
}

/// Subcommand tree of the quota CLI.
pub fn quota_commands(cmd: Command) -> Command {
    cmd.subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            account_args(Command::new("check").about("Check whether actions fit in the quota"))
                .arg(kind_arg(true))
                .arg(qty_arg("1")),
        )
        .subcommand(
            account_args(Command::new("track").about("Record usage of completed actions"))
                .arg(kind_arg(true))
                .arg(qty_arg("1"))
                .arg(
                    Arg::new("run-id")
                        .long("run-id")
                        .value_name("RUN_ID")
                        .help("Run identifier for job discovery"),
                )
                .arg(
                    Arg::new("label")
                        .long("label")
                        .value_name("LABEL")
                        .help("Label for the job discovery run"),
                ),
        )
        .subcommand(
            account_args(Command::new("stats").about("Show monthly usage and the weekly quota")).arg(
                Arg::new("weeks")
                    .long("weeks")
                    .value_name("N")
                    .help("Number of weeks of history to show")
                    .value_parser(value_parser!(usize))
                    .default_value("1"),
            ),
        )
        .subcommand(
            account_args(Command::new("admit").about("Admit discovered jobs against the weekly quota"))
                .arg(qty_arg("1"))
                .arg(
                    Arg::new("run-id")
                        .long("run-id")
                        .value_name("RUN_ID")
                        .help("Run identifier (generated when omitted)"),
                )
                .arg(
                    Arg::new("label")
                        .long("label")
                        .value_name("LABEL")
                        .help("Display label of the run")
                        .default_value("Manual run"),
                ),
        )
        .subcommand(
            Command::new("delete-run")
                .about("Hide a run from this week's list; its quota stays consumed")
                .arg(
                    Arg::new("account")
                        .short('a')
                        .long("account")
                        .value_name("ACCOUNT_ID")
                        .required(true),
                )
                .arg(
                    Arg::new("run-id")
                        .long("run-id")
                        .value_name("RUN_ID")
                        .required(true),
                ),
        )
        .subcommand(
            account_args(Command::new("rate").about("Count requests against the hourly budget")).arg(
                Arg::new("count")
                    .short('n')
                    .long("count")
                    .value_name("N")
                    .value_parser(value_parser!(u32))
                    .default_value("1"),
            ),
        )
        .subcommand(
            account_args(
                Command::new("simulate").about("Dry-run a job search against an in-memory quota"),
            )
            .arg(
                Arg::new("batches")
                    .short('b')
                    .long("batches")
                    .value_name("N,N,...")
                    .help("Jobs found per progress report")
                    .value_delimiter(',')
                    .value_parser(value_parser!(i64))
                    .required(true),
            )
            .arg(
                Arg::new("hours-between")
                    .long("hours-between")
                    .value_name("HOURS")
                    .value_parser(value_parser!(i64))
                    .default_value("6"),
            )
            .arg(
                Arg::new("label")
                    .long("label")
                    .value_name("LABEL")
                    .default_value("Simulated search"),
            ),
        )
}

pub fn execute(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    match matches.subcommand() {
        Some(("check", sub)) => check(sub, ctx),
        Some(("track", sub)) => track(sub, ctx),
        Some(("stats", sub)) => stats(sub, ctx),
        Some(("admit", sub)) => admit(sub, ctx),
        Some(("delete-run", sub)) => delete_run(sub, ctx),
        Some(("rate", sub)) => rate(sub, ctx),
        Some(("simulate", sub)) => simulate(sub, ctx),
        Some((other, _)) => Err(CliError::InvalidArgument(format!("unknown command '{}'", other))),
        None => Err(CliError::InvalidArgument("no command given".to_string())),
    }
}

fn account(matches: &ArgMatches, ctx: &CliContext) -> Result<AccountRef, CliError> {
    let id = matches
        .get_one::<String>("account")
        .ok_or_else(|| CliError::InvalidArgument("--account is required".to_string()))?;
    let tier = matches
        .get_one::<String>("tier")
        .cloned()
        .unwrap_or_else(|| ctx.config.default_tier.clone());
    Ok(AccountRef::new(id, &tier))
}

fn kinds(matches: &ArgMatches) -> Result<Vec<ActionKind>, CliError> {
    matches
        .get_many::<String>("kind")
        .into_iter()
        .flatten()
        .map(|raw| ActionKind::from_str(raw).map_err(|e| CliError::InvalidArgument(e.to_string())))
        .collect()
}

fn qty(matches: &ArgMatches) -> i64 {
    matches.get_one::<i64>("qty").copied().unwrap_or(1)
}

fn show_limit(limit: i64) -> String {
    if limit == UNLIMITED {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}

fn check(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    let account = account(matches, ctx)?;
    let qty = qty(matches);
    let requests: Vec<ActionRequest> = kinds(matches)?
        .into_iter()
        .map(|kind| ActionRequest::new(kind, qty))
        .collect();

    let result = ctx.gate.check_multiple(&account, &requests)?;
    let mut lines = Vec::new();
    for decision in &result.decisions {
        let verdict = if decision.allowed { "allowed" } else { "denied" };
        lines.push(format!(
            "{} {}: {} used of {} ({} requested)",
            decision.kind,
            verdict,
            decision.current,
            show_limit(decision.limit),
            decision.requested
        ));
        if let Some(reason) = &decision.reason {
            lines.push(format!("  {}", reason));
        }
        if let Some(hint) = &decision.upgrade_hint {
            lines.push(format!("  {}", hint));
        }
        if decision.warning {
            lines.push("  Approaching the limit.".to_string());
        }
    }

    let output = if result.allowed {
        Output::success(lines.join("\n"))
    } else {
        Output::warning(lines.join("\n"))
    };
    Ok(output.with_data(&result))
}

fn track(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    let account = account(matches, ctx)?;
    let qty = qty(matches);
    let requests: Vec<ActionRequest> = kinds(matches)?
        .into_iter()
        .map(|kind| ActionRequest::new(kind, qty))
        .collect();

    let mut metadata = ActionMetadata::new().with_attribute("source", "cli");
    if let Some(run_id) = matches.get_one::<String>("run-id") {
        metadata = metadata.with_run_id(run_id);
    }
    if let Some(label) = matches.get_one::<String>("label") {
        metadata = metadata.with_label(label);
    }

    let outcomes = ctx.gate.track_multiple(&account, &requests, &metadata);
    let lines: Vec<String> = outcomes
        .iter()
        .map(|outcome| match outcome {
            TrackOutcome::Recorded {
                kind,
                new_total,
                remaining,
            } => format!("{} recorded: total {}, {} remaining", kind, new_total, show_limit(*remaining)),
            TrackOutcome::Admitted { kind, result } => format!(
                "{} admitted {} of {} ({} remaining this week)",
                kind,
                result.admitted,
                result.requested,
                show_limit(result.remaining)
            ),
            TrackOutcome::Failed { kind, error } => format!("{} not recorded: {}", kind, error),
        })
        .collect();

    let output = if outcomes.iter().any(TrackOutcome::is_failed) {
        Output::warning(lines.join("\n"))
    } else {
        Output::success(lines.join("\n"))
    };
    Ok(output.with_data(&outcomes))
}

fn stats(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    let account = account(matches, ctx)?;
    let weeks = matches.get_one::<usize>("weeks").copied().unwrap_or(1);
    let limits = ctx.config.limits_for(&account.tier);

    let summary = ctx.gate.ledger().summary(&account)?;
    let weekly = ctx
        .gate
        .weekly()
        .current_stats(&account.id, limits.limit_for(ActionKind::JobDiscovery))?;
    let history = if weeks > 1 {
        ctx.gate.weekly().history(&account.id, weeks)?
    } else {
        Vec::new()
    };

    let mut lines = vec![format!("Usage for {} ({} tier)", account.id, account.tier)];
    for item in &summary.items {
        let pct = item
            .percent_used
            .map(|p| format!(" ({}%)", p))
            .unwrap_or_default();
        lines.push(format!(
            "  {:<18} {} / {}{}",
            item.kind.as_str(),
            item.current,
            show_limit(item.limit),
            pct
        ));
    }

    lines.push(format!(
        "  {:<18} {} / {} this week",
        ActionKind::JobDiscovery.as_str(),
        weekly.consumed,
        show_limit(weekly.limit)
    ));
    if let Some(window) = weekly.window {
        let resets_in = window.remaining_from(ctx.clock.now());
        lines.push(format!(
            "  Week {} of {} resets in {}",
            window.week_number,
            window.week_year,
            format_duration(resets_in)
        ));
    }
    for run in weekly.visible_runs() {
        lines.push(format!("    {} {} kept {}", run.run_id, run.label, run.kept));
    }
    for past in history.iter().skip(1) {
        if let Some(window) = past.window {
            lines.push(format!(
                "  Week {} of {}: {} / {}",
                window.week_number,
                window.week_year,
                past.consumed,
                show_limit(past.limit)
            ));
        }
    }

    Ok(Output::success(lines.join("\n")).with_data(&json!({
        "monthly": summary,
        "weekly": weekly,
        "history": history,
    })))
}

fn admit(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    let account = account(matches, ctx)?;
    let requested = qty(matches);
    let run_id = matches
        .get_one::<String>("run-id")
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let label = matches
        .get_one::<String>("label")
        .map(String::as_str)
        .unwrap_or("Manual run");
    let limit = ctx
        .config
        .limits_for(&account.tier)
        .limit_for(ActionKind::JobDiscovery);

    let result = ctx
        .gate
        .weekly()
        .admit_with_limit(&account.id, limit, &run_id, requested, label)?;
    let text = format!(
        "Run {}: admitted {} of {}, dropped {} ({} of {} used)",
        run_id,
        result.admitted,
        result.requested,
        result.dropped(),
        result.consumed,
        show_limit(result.limit)
    );
    let output = if result.limit_reached {
        Output::warning(format!("{}; weekly limit reached", text))
    } else {
        Output::success(text)
    };
    Ok(output.with_data(&json!({ "runId": run_id, "result": result })))
}

fn delete_run(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    let account_id = matches
        .get_one::<String>("account")
        .ok_or_else(|| CliError::InvalidArgument("--account is required".to_string()))?;
    let run_id = matches
        .get_one::<String>("run-id")
        .ok_or_else(|| CliError::InvalidArgument("--run-id is required".to_string()))?;

    let deleted = ctx.gate.weekly().soft_delete_run(account_id, run_id)?;
    let data = json!({ "runId": run_id, "deleted": deleted });
    if deleted {
        Ok(Output::success(format!("Run {} removed from this week's list", run_id)).with_data(&data))
    } else {
        Ok(Output::warning(format!("Run {} not found in this week", run_id)).with_data(&data))
    }
}

fn rate(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    let account = account(matches, ctx)?;
    let count = matches.get_one::<u32>("count").copied().unwrap_or(1);

    let mut allowed = 0u32;
    let mut last = None;
    for _ in 0..count {
        let decision = ctx.gate.check_rate_limit(&account);
        if decision.allowed {
            allowed += 1;
        }
        last = Some(decision);
    }
    let limit = last.as_ref().map(|d| d.limit).unwrap_or(0);
    let text = format!("{} of {} requests allowed (limit {} per hour)", allowed, count, limit);
    let data = json!({ "allowed": allowed, "rejected": count - allowed, "limit": limit });

    if allowed < count {
        Ok(Output::warning(text).with_data(&data))
    } else {
        Ok(Output::success(text).with_data(&data))
    }
}

fn simulate(matches: &ArgMatches, ctx: &CliContext) -> Result<Output, CliError> {
    let account = account(matches, ctx)?;
    let batches: Vec<i64> = matches
        .get_many::<i64>("batches")
        .into_iter()
        .flatten()
        .copied()
        .collect();
    let hours_between = matches.get_one::<i64>("hours-between").copied().unwrap_or(6);
    let label = matches
        .get_one::<String>("label")
        .map(String::as_str)
        .unwrap_or("Simulated search");
    if hours_between < 0 {
        return Err(CliError::InvalidArgument("--hours-between must not be negative".to_string()));
    }

    let clock = Arc::new(ManualClock::new(ctx.clock.now()));
    let weekly = Arc::new(WeeklyQuota::new(Arc::new(InMemoryStorage::new()), clock.clone()));
    let limits = ctx.config.limits_for(&account.tier);
    let mut lifecycle = SearchLifecycle::start(&account, label, &limits, weekly, clock.clone());
    debug!("Simulating {} batches for search {}", batches.len(), lifecycle.id());

    for found in batches {
        if lifecycle.state().is_terminal() {
            break;
        }
        lifecycle.progress_report(found)?;
        clock.advance(chrono::Duration::hours(hours_between));
    }

    let search = lifecycle.snapshot();
    let mut lines = vec![format!(
        "Search {} is {}: kept {}, dropped {}",
        search.label, search.state, search.total_jobs_found, search.total_dropped
    )];
    for entry in &search.reasoning_log {
        lines.push(format!(
            "  [{}] {}",
            entry.timestamp.format("%a %H:%M"),
            entry.message
        ));
    }
    Ok(Output::success(lines.join("\n")).with_data(&search))
}
