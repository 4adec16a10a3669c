//! Engine configuration.
//!
//! Configuration is plain data: build it in code with the builder methods or
//! load it from a TOML file. Every key is optional.
//!
//! ```toml
//! locations = ["db/migrations"]
//! target = "latest"
//! out_of_order = false
//! ignore_migration_patterns = ["*:future", "repeatable:missing"]
//! installed_by = "${DEPLOY_USER}"
//!
//! [naming]
//! prefix = "V"
//! separator = "__"
//!
//! [lock]
//! initial_interval_ms = 500
//! retries = -1
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::file::check_location;
use crate::migration::MigrationNaming;
use crate::validate::ValidatePattern;
use crate::version::Version;

/// Default description of baseline marker rows.
pub const DEFAULT_BASELINE_DESCRIPTION: &str = "<< Baseline >>";

/// Configuration of the migration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Directories scanned for SQL migrations.
    pub locations: Vec<PathBuf>,
    /// Naming grammar of migration resources.
    pub naming: MigrationNaming,
    /// Highest version to migrate to.
    pub target: Version,
    /// Apply pending migrations older than the latest applied one.
    pub out_of_order: bool,
    /// Validate before migrating.
    pub validate_on_migrate: bool,
    /// Validation findings to ignore.
    pub ignore_migration_patterns: Vec<ValidatePattern>,
    /// Version written by `baseline`.
    pub baseline_version: Version,
    /// Description written by `baseline`.
    pub baseline_description: String,
    /// Baseline a non-empty schema without history when migrating.
    pub baseline_on_migrate: bool,
    /// Fail when `target` names a version that no migration has.
    pub fail_on_missing_target: bool,
    /// Principal recorded in the history; defaults to the OS user.
    pub installed_by: Option<String>,
    /// Only consider these versions or repeatable descriptions.
    pub cherry_pick: Vec<String>,
    /// Do not register the SQL file provider.
    pub skip_default_resolvers: bool,
    /// Abort resolution on malformed migration names instead of skipping them.
    pub validate_migration_naming: bool,
    /// Lock retry settings.
    pub lock: LockConfig,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            locations: vec![PathBuf::from("./migrations")],
            naming: MigrationNaming::default(),
            target: Version::LATEST,
            out_of_order: false,
            validate_on_migrate: true,
            ignore_migration_patterns: vec![ValidatePattern::future()],
            baseline_version: Version::parse("1").unwrap_or(Version::EMPTY),
            baseline_description: DEFAULT_BASELINE_DESCRIPTION.to_string(),
            baseline_on_migrate: false,
            fail_on_missing_target: true,
            installed_by: None,
            cherry_pick: Vec::new(),
            skip_default_resolvers: false,
            validate_migration_naming: false,
            lock: LockConfig::default(),
        }
    }
}

impl MigrateConfig {
    /// Create a configuration with no locations.
    pub fn new() -> Self {
        Self {
            locations: Vec::new(),
            ..Self::default()
        }
    }

    /// Parse a TOML document, expanding `${VAR}` references first.
    pub fn from_toml_str(content: &str) -> MigrateResult<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| MigrationError::config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> MigrateResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check the configuration for inconsistencies.
    pub fn check(&self) -> MigrateResult<()> {
        for location in &self.locations {
            check_location(location)?;
        }
        if self.naming.separator.is_empty() {
            return Err(MigrationError::config("naming.separator must not be empty"));
        }
        if self.naming.prefix.is_empty() {
            return Err(MigrationError::config("naming.prefix must not be empty"));
        }
        self.lock.check()
    }

    /// Add a migration location.
    pub fn location(mut self, dir: impl Into<PathBuf>) -> Self {
        self.locations.push(dir.into());
        self
    }

    /// Set the target version.
    pub fn target(mut self, target: Version) -> Self {
        self.target = target;
        self
    }

    /// Allow out-of-order migrations.
    pub fn out_of_order(mut self, allow: bool) -> Self {
        self.out_of_order = allow;
        self
    }

    /// Set whether migrate validates first.
    pub fn validate_on_migrate(mut self, validate: bool) -> Self {
        self.validate_on_migrate = validate;
        self
    }

    /// Replace the ignore patterns.
    pub fn ignore_migration_patterns(mut self, patterns: Vec<ValidatePattern>) -> Self {
        self.ignore_migration_patterns = patterns;
        self
    }

    /// Set the baseline version.
    pub fn baseline_version(mut self, version: Version) -> Self {
        self.baseline_version = version;
        self
    }

    /// Baseline automatically when migrating a non-empty schema.
    pub fn baseline_on_migrate(mut self, enable: bool) -> Self {
        self.baseline_on_migrate = enable;
        self
    }

    /// Set whether a missing target version is an error.
    pub fn fail_on_missing_target(mut self, fail: bool) -> Self {
        self.fail_on_missing_target = fail;
        self
    }

    /// Set the principal recorded in the history.
    pub fn installed_by(mut self, who: impl Into<String>) -> Self {
        self.installed_by = Some(who.into());
        self
    }

    /// Restrict to the given versions or repeatable descriptions.
    pub fn cherry_pick<I, S>(mut self, picks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cherry_pick = picks.into_iter().map(Into::into).collect();
        self
    }

    /// Skip the built-in SQL file provider.
    pub fn skip_default_resolvers(mut self, skip: bool) -> Self {
        self.skip_default_resolvers = skip;
        self
    }

    /// Abort on malformed migration names.
    pub fn validate_migration_naming(mut self, strict: bool) -> Self {
        self.validate_migration_naming = strict;
        self
    }

    /// Set the lock settings.
    pub fn lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Principal written to `installed_by`.
    pub fn resolve_installed_by(&self) -> String {
        self.installed_by
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Whether a migration is selected by `cherry_pick` (always true when empty).
    pub fn is_cherry_picked(&self, version: Option<&Version>, description: &str) -> bool {
        matches_cherry_pick(&self.cherry_pick, version, description)
    }
}

pub(crate) fn matches_cherry_pick(picks: &[String], version: Option<&Version>, description: &str) -> bool {
    if picks.is_empty() {
        return true;
    }
    picks.iter().any(|pick| match version {
        Some(v) => Version::parse(pick).is_ok_and(|p| &p == v),
        None => pick == description,
    })
}

/// Lock acquisition and liveness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// First wait between attempts.
    pub initial_interval_ms: u64,
    /// Factor applied to the wait after each attempt.
    pub backoff_exponent: f64,
    /// Upper bound of the wait.
    pub max_interval_ms: u64,
    /// Retry budget; `-1` retries forever.
    pub retries: i32,
    /// Age after which a lock without heartbeat is considered abandoned.
    pub lock_timeout_ms: u64,
    /// How often a lock holder refreshes its heartbeat.
    pub heartbeat_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_exponent: 2.0,
            max_interval_ms: 60_000,
            retries: 50,
            lock_timeout_ms: 600_000,
            heartbeat_interval_ms: 60_000,
        }
    }
}

impl LockConfig {
    /// Sentinel for an unlimited retry budget.
    pub const UNLIMITED: i32 = -1;

    /// Settings for tests and local tools: short waits.
    pub fn fast() -> Self {
        Self {
            initial_interval_ms: 5,
            backoff_exponent: 1.5,
            max_interval_ms: 50,
            retries: 400,
            ..Self::default()
        }
    }

    /// Set the retry budget.
    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the wait bounds.
    pub fn intervals(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_interval_ms = initial_ms;
        self.max_interval_ms = max_ms;
        self
    }

    /// Lock age after which it is considered abandoned.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    fn check(&self) -> MigrateResult<()> {
        if self.retries < Self::UNLIMITED {
            return Err(MigrationError::config(format!(
                "lock.retries must be -1 or greater, got {}",
                self.retries
            )));
        }
        if self.backoff_exponent.is_nan() || self.backoff_exponent < 1.0 {
            return Err(MigrationError::config("lock.backoff_exponent must be at least 1.0"));
        }
        if self.initial_interval_ms > self.max_interval_ms {
            return Err(MigrationError::config(
                "lock.initial_interval_ms must not exceed lock.max_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Replace `${VAR}` with the value of the environment variable `VAR`.
///
/// Unknown variables are left untouched.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
