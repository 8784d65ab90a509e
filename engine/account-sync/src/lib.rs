//! Account synchronization
//!
//! The [`SnapshotFetcher`] reads one account through the terminal broker; the
//! [`SyncOrchestrator`] drives it for every active account and commits results
//! to the ledger; the [`SyncScheduler`] repeats that on a fixed interval.

pub mod config;
pub mod credentials;
pub mod error;
pub mod escalation;
pub mod fetcher;
pub mod orchestrator;
pub mod scheduler;

pub use config::{FetcherConfig, SyncConfig};
pub use credentials::{CredentialProvider, EnvCredentials, StaticCredentials};
pub use error::{FailureKind, FetchError, Result, SyncError};
pub use escalation::{Escalation, EscalationSink, LogEscalation};
pub use fetcher::{AccountSnapshot, SnapshotFetcher};
pub use orchestrator::{AccountOutcome, AccountSyncResult, SyncOrchestrator, SyncReport};
pub use scheduler::{PassListener, SyncScheduler};
