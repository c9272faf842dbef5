use clap::{Arg, ArgAction, Command};
use env_logger::Env;
use log::{debug, info};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use thiserror::Error;

use quota_engine::cli::{execute, quota_commands, CliContext, CliError};
use quota_engine::config::{self, ConfigError, QuotaConfig, CONFIG};
use quota_engine::storage::{FileStorage, StorageError};
use quota_engine::utils::SystemClock;

#[derive(Debug, Error)]
enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Cli(#[from] CliError),
}

fn build_cli() -> Command {
    let cmd = Command::new("quota-engine")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Usage quotas, weekly job discovery limits and search lifecycles")
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Directory holding quota records")
                .default_value(".quota-data")
                .global(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Tier limits file (JSON); overrides QUOTA_CONFIG_PATH")
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print results as JSON")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Display detailed logging")
                .action(ArgAction::SetTrue)
                .global(true),
        );
    quota_commands(cmd)
}

fn main() {
    let matches = build_cli().get_matches();

    let verbose = matches.get_flag("verbose");
    let json = matches.get_flag("json");
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    match run(&matches) {
        Ok(output) => {
            println!("{}", output.render(json));
            if output.is_error() {
                process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(1);
        }
    }
}

fn load_config(matches: &clap::ArgMatches) -> Result<QuotaConfig, AppError> {
    match matches.get_one::<String>("config") {
        Some(path) => {
            let mut loaded = QuotaConfig::from_file(path)?;
            loaded.environment = CONFIG.environment.clone();
            Ok(loaded)
        }
        None => {
            config::init();
            Ok(CONFIG.clone())
        }
    }
}

fn run(matches: &clap::ArgMatches) -> Result<quota_engine::cli::Output, AppError> {
    let config = load_config(matches)?;
    let data_dir = matches
        .get_one::<String>("data-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".quota-data"));

    if config.environment.is_prod() {
        info!("Running in production mode with data in {}", data_dir.display());
    } else {
        debug!("Using data directory {}", data_dir.display());
    }

    let store = Arc::new(FileStorage::new(&data_dir)?);
    let ctx = CliContext::new(config, store, Arc::new(SystemClock));
    Ok(execute(matches, &ctx)?)
}
