use thiserror::Error;

use crate::storage::errors::StorageError;
use crate::window::WindowError;

/// Errors surfaced by the quota services. A quota being exhausted is never
/// one of these; it is reported as a negative decision.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuotaError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Window error: {0}")]
    Window(#[from] WindowError),
}

pub type QuotaResult<T> = Result<T, QuotaError>;
