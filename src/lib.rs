pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod quota;
pub mod search;
pub mod storage;
pub mod utils;
pub mod window;

pub use crate::config::{QuotaConfig, TierLimits, TierLimitsProvider, CONFIG};
pub use crate::error::{QuotaError, QuotaResult};
pub use crate::models::{AccountRef, ActionKind, QuotaWindow, UNLIMITED};
pub use crate::quota::{ActionMetadata, QuotaGate, TrackOutcome, UsageLedger, WeeklyQuota};
pub use crate::search::{SearchLifecycle, SearchState};
pub use crate::storage::errors::{StorageError, StorageResult};
pub use crate::storage::traits::QuotaStore;
pub use crate::storage::{FileStorage, InMemoryStorage};
pub use crate::utils::{Clock, ManualClock, SystemClock};
pub use crate::window::{WeekWindow, WindowError};
