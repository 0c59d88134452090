//! Engine configuration and secret resolution
//!
//! [`EngineConfig`] can be built in code, read from a JSON file, or taken
//! from `TABLEVAULT_*` environment variables. Encryption keys never live in
//! the config itself; a [`KeyProvider`] resolves them when a run needs one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::EncryptionKey;
use crate::policy::BackupPolicy;
use crate::retry::RetryConfig;
use crate::{EngineError, Result};

/// Environment variable holding the artifact root directory
pub const ENV_ARTIFACT_ROOT: &str = "TABLEVAULT_ARTIFACT_ROOT";
/// Environment variable holding the ledger file path
pub const ENV_LEDGER_PATH: &str = "TABLEVAULT_LEDGER_PATH";
/// Environment variable holding the run deadline in seconds
pub const ENV_RUN_TIMEOUT_SECS: &str = "TABLEVAULT_RUN_TIMEOUT_SECS";
/// Environment variable holding the fallback cadence
pub const ENV_DEFAULT_CADENCE: &str = "TABLEVAULT_DEFAULT_CADENCE";
/// Default environment variable holding the encryption key
pub const ENV_ENCRYPTION_KEY: &str = "TABLEVAULT_ENCRYPTION_KEY";

/// Configuration for a backup engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for the default file artifact store
    pub artifact_root: PathBuf,

    /// Where the run ledger is persisted; in-memory only when unset
    pub ledger_path: Option<PathBuf>,

    /// Cadence used when a policy's schedule cannot be parsed
    pub default_cadence: String,

    /// Deadline for a single backup or restore run, in milliseconds
    pub run_timeout_ms: u64,

    /// Retry policy for transient export, import and store failures
    pub retry: RetryConfig,

    /// Environment variable the default key provider reads
    pub encryption_key_env: String,

    /// Export the tables of one run concurrently
    pub parallel_table_export: bool,

    /// Policies registered when the engine is built
    pub policies: Vec<BackupPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("./backups"),
            ledger_path: None,
            default_cadence: "daily".to_string(),
            run_timeout_ms: 30 * 60 * 1000,
            retry: RetryConfig::default(),
            encryption_key_env: ENV_ENCRYPTION_KEY.to_string(),
            parallel_table_export: true,
            policies: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| EngineError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| EngineError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Defaults overridden by `TABLEVAULT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(root) = lookup(ENV_ARTIFACT_ROOT) {
            config.artifact_root = PathBuf::from(root);
        }
        if let Some(path) = lookup(ENV_LEDGER_PATH) {
            config.ledger_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = lookup(ENV_RUN_TIMEOUT_SECS) {
            config.run_timeout_ms = secs
                .trim()
                .parse::<u64>()
                .ok()
                .and_then(|secs| secs.checked_mul(1000))
                .ok_or_else(|| {
                    EngineError::Config(format!("{} must be a number of seconds, got '{}'", ENV_RUN_TIMEOUT_SECS, secs))
                })?;
        }
        if let Some(cadence) = lookup(ENV_DEFAULT_CADENCE) {
            config.default_cadence = cadence;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    pub fn with_default_cadence(mut self, cadence: impl Into<String>) -> Self {
        self.default_cadence = cadence.into();
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_parallel_table_export(mut self, enabled: bool) -> Self {
        self.parallel_table_export = enabled;
        self
    }

    pub fn with_policy(mut self, policy: BackupPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Run deadline
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Check values that would make the engine unusable
    pub fn validate(&self) -> Result<()> {
        if self.run_timeout_ms == 0 {
            return Err(EngineError::Config("run_timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".into()));
        }
        for policy in &self.policies {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Source of the key used for encrypted backups and restores
pub trait KeyProvider: Send + Sync {
    /// The current key, or [`EngineError::EncryptionKeyMissing`]
    fn encryption_key(&self) -> Result<EncryptionKey>;
}

/// Reads a base64 or hex key from an environment variable on every call
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl KeyProvider for EnvKeyProvider {
    fn encryption_key(&self) -> Result<EncryptionKey> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(EncryptionKey::parse(&value)?),
            _ => Err(EngineError::EncryptionKeyMissing(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

/// A fixed key held in memory
pub struct StaticKeyProvider {
    key: EncryptionKey,
}

impl StaticKeyProvider {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn encryption_key(&self) -> Result<EncryptionKey> {
        Ok(self.key.clone())
    }
}

/// No key configured
pub struct NoKeyProvider;

impl KeyProvider for NoKeyProvider {
    fn encryption_key(&self) -> Result<EncryptionKey> {
        Err(EngineError::EncryptionKeyMissing("no encryption key configured".into()))
    }
}
