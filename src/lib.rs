//! # tablevault
//!
//! A single-node snapshot and restore engine for relational table data.
//!
//! ## Overview
//!
//! `tablevault` periodically snapshots a configured set of tables, verifies the
//! integrity of every snapshot, keeps snapshots according to a retention policy
//! and restores data from a snapshot on demand. The relational store itself is an
//! external collaborator reached only through the [`table::TableStore`] trait.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tablevault::config::EngineConfig;
//! use tablevault::engine::BackupEngine;
//! use tablevault::policy::{BackupKind, BackupPolicy};
//! use tablevault::table::MemoryTableStore;
//!
//! # async fn example() -> tablevault::Result<()> {
//! let tables = Arc::new(MemoryTableStore::new("id"));
//! let engine = BackupEngine::builder(EngineConfig::default())
//!     .table_store(tables)
//!     .build()
//!     .await?;
//!
//! engine.upsert_policy(BackupPolicy::new("nightly", "Nightly users", BackupKind::Full, ["users"]))?;
//! let run = engine.trigger_backup("nightly").await?;
//! let restore = engine.trigger_restore(&run.id, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`policy`]: backup policies and the configuration registry
//! - [`cadence`]: cadence expressions and next-fire-time evaluation
//! - [`scheduler`]: one timer task per enabled policy
//! - [`backup`]: the backup pipeline (export, serialize, compress, encrypt, store)
//! - [`restore`]: the restore pipeline (fetch, verify, decrypt, decompress, import)
//! - [`retention`]: the retention sweep
//! - [`ledger`]: run history, statistics and persistence
//! - [`codec`]: checksums, compression and authenticated encryption
//! - [`artifact`]: artifact storage backends
//! - [`table`]: the data store contract and an in-memory implementation
//! - [`engine`]: the administrative facade tying everything together

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Policy failed validation
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Policy id is not registered
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    /// Policy exists but is disabled
    #[error("Policy is disabled: {0}")]
    PolicyDisabled(String),

    /// Backup run id is unknown
    #[error("Backup run not found: {0}")]
    BackupNotFound(String),

    /// Backup run exists but did not succeed
    #[error("Backup run {run_id} is not restorable (status: {status})")]
    BackupNotRestorable {
        /// The backup run
        run_id: String,
        /// Its current status
        status: ledger::RunStatus,
    },

    /// Restore run id is unknown
    #[error("Restore run not found: {0}")]
    RestoreNotFound(String),

    /// Stored artifact bytes do not match the recorded checksum
    #[error("Integrity check failed for {artifact}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        /// Artifact reference
        artifact: String,
        /// Checksum recorded at backup time
        expected: String,
        /// Checksum of the fetched bytes
        actual: String,
    },

    /// Encryption was requested but no key is configured
    #[error("Encryption key missing: {0}")]
    EncryptionKeyMissing(String),

    /// Exporting a table failed
    #[error("Export of table '{table}' failed: {source}")]
    Export {
        /// Table name
        table: String,
        /// Underlying data store error
        #[source]
        source: table::TableError,
    },

    /// Importing a table failed
    #[error("Import of table '{table}' failed: {source}")]
    Import {
        /// Table name
        table: String,
        /// Underlying data store error
        #[source]
        source: table::TableError,
    },

    /// Codec error (compression, encryption)
    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    /// Artifact store error
    #[error("Artifact store error: {0}")]
    Store(#[from] artifact::StoreError),

    /// Run ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::LedgerError),

    /// A backup run started and was finalized as failed
    #[error("Backup run {run_id} failed: {source}")]
    BackupFailed {
        /// The failed run
        run_id: String,
        /// Why it failed
        #[source]
        source: Box<EngineError>,
    },

    /// Run was cancelled by an operator
    #[error("Run cancelled")]
    Cancelled,

    /// Run exceeded its deadline
    #[error("Run exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Join error from a worker task
    #[error("Worker join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-checkable error kind, recorded on failed runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidPolicy,
    PolicyNotFound,
    PolicyDisabled,
    BackupNotFound,
    BackupNotRestorable,
    RestoreNotFound,
    ArtifactMissing,
    OverlappingRun,
    IntegrityCheckFailed,
    AuthenticationFailed,
    DecompressionError,
    EncryptionKeyMissing,
    StoreUnavailable,
    ExportFailed,
    ImportFailed,
    RunAlreadyFinalized,
    Cancelled,
    Timeout,
    /// Run was left in progress by a process that stopped
    Interrupted,
    Serialization,
    Configuration,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse grouping of error kinds used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller input was invalid; fix and resubmit
    Configuration,
    /// Data corruption or tampering; never retried
    Integrity,
    /// Temporary I/O failure; eligible for bounded retry
    Transient,
    /// A requested guarantee cannot be honoured (e.g. encryption)
    PolicyViolation,
    /// Run lifecycle outcomes and internal failures
    Operational,
}

impl ErrorKind {
    /// Category of this kind
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidPolicy
            | ErrorKind::PolicyNotFound
            | ErrorKind::PolicyDisabled
            | ErrorKind::BackupNotFound
            | ErrorKind::BackupNotRestorable
            | ErrorKind::RestoreNotFound
            | ErrorKind::Configuration => ErrorCategory::Configuration,
            ErrorKind::IntegrityCheckFailed
            | ErrorKind::AuthenticationFailed
            | ErrorKind::DecompressionError => ErrorCategory::Integrity,
            ErrorKind::StoreUnavailable | ErrorKind::ExportFailed | ErrorKind::ImportFailed => {
                ErrorCategory::Transient
            }
            ErrorKind::EncryptionKeyMissing => ErrorCategory::PolicyViolation,
            _ => ErrorCategory::Operational,
        }
    }
}

impl EngineError {
    /// Machine-checkable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidPolicy(_) => ErrorKind::InvalidPolicy,
            EngineError::PolicyNotFound(_) => ErrorKind::PolicyNotFound,
            EngineError::PolicyDisabled(_) => ErrorKind::PolicyDisabled,
            EngineError::BackupNotFound(_) => ErrorKind::BackupNotFound,
            EngineError::BackupNotRestorable { .. } => ErrorKind::BackupNotRestorable,
            EngineError::RestoreNotFound(_) => ErrorKind::RestoreNotFound,
            EngineError::IntegrityCheckFailed { .. } => ErrorKind::IntegrityCheckFailed,
            EngineError::EncryptionKeyMissing(_) => ErrorKind::EncryptionKeyMissing,
            EngineError::Export { .. } => ErrorKind::ExportFailed,
            EngineError::Import { .. } => ErrorKind::ImportFailed,
            EngineError::Codec(e) => e.kind(),
            EngineError::Store(e) => e.kind(),
            EngineError::Ledger(e) => e.kind(),
            EngineError::BackupFailed { source, .. } => source.kind(),
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::Join(_) | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// Whether the caller supplied invalid input, as opposed to a system failure
    pub fn is_user_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// Whether a bounded retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Export { source, .. } | EngineError::Import { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }
}

/// Artifact storage backends
pub mod artifact;

/// Backup pipeline
pub mod backup;

/// Cadence expressions
pub mod cadence;

/// Run cancellation signals
pub mod cancel;

/// Checksums, compression and encryption
pub mod codec;

/// Engine configuration
pub mod config;

/// Administrative facade
pub mod engine;

/// Run history and statistics
pub mod ledger;

/// Prometheus metrics
pub mod metrics;

/// Backup policies and registry
pub mod policy;

/// Restore pipeline
pub mod restore;

/// Retention sweep
pub mod retention;

/// Bounded retry with backoff
pub mod retry;

/// Policy timers
pub mod scheduler;

/// Deterministic snapshot payloads
pub mod snapshot;

/// Data store contract
pub mod table;

/// Install a `tracing` subscriber honouring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
