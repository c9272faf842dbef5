pub mod commands;
pub mod output;

// Re-export key components
pub use commands::{execute, quota_commands, CliContext, CliError};
pub use output::{Output, OutputKind};
