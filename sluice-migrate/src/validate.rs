//! Validation findings and ignore patterns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::info::MigrationState;
use crate::version::Version;

/// Class of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Applied and resolved checksums differ.
    ChecksumMismatch,
    /// Applied and resolved types differ.
    TypeMismatch,
    /// Applied and resolved descriptions differ.
    DescriptionMismatch,
    /// A versioned row has no resolved migration.
    AppliedVersionedNotResolved,
    /// A repeatable row has no resolved migration.
    AppliedRepeatableNotResolved,
    /// A resolved versioned migration was skipped or is pending.
    ResolvedVersionedNotApplied,
    /// A resolved repeatable migration was skipped or is pending.
    ResolvedRepeatableNotApplied,
    /// A repeatable migration changed since it was last applied.
    OutdatedRepeatable,
    /// A versioned migration failed.
    FailedVersioned,
    /// A repeatable migration failed.
    FailedRepeatable,
}

/// One discrepancy between resolved migrations and the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Finding class.
    pub code: ErrorCode,
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Aggregated validation findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Findings in migration order.
    pub errors: Vec<ValidationError>,
    /// Number of migrations checked.
    pub validated: usize,
}

impl ValidationResult {
    /// Whether nothing was found.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Findings of one class.
    pub fn with_code(&self, code: ErrorCode) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter().filter(move |e| e.code == code)
    }

    /// Turn findings into an error.
    pub fn into_result(self) -> Result<Self, MigrationError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(MigrationError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "{} migrations validated", self.validated);
        }
        writeln!(f, "{} validation error(s)", self.errors.len())?;
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindFilter {
    Versioned,
    Repeatable,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateFilter {
    Missing,
    Pending,
    Ignored,
    Future,
    Any,
}

/// Suppresses findings by migration kind and state.
///
/// Written as `<kind>:<state>` where kind is `versioned`, `repeatable` or `*`
/// and state is `missing`, `pending`, `ignored`, `future` or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidatePattern {
    kind: KindFilter,
    state: StateFilter,
}

impl ValidatePattern {
    /// `*:future`, the default ignore pattern.
    pub fn future() -> Self {
        Self {
            kind: KindFilter::Any,
            state: StateFilter::Future,
        }
    }

    /// `*:pending`.
    pub fn pending() -> Self {
        Self {
            kind: KindFilter::Any,
            state: StateFilter::Pending,
        }
    }

    /// `*:missing`.
    pub fn missing() -> Self {
        Self {
            kind: KindFilter::Any,
            state: StateFilter::Missing,
        }
    }

    /// `*:ignored`.
    pub fn ignored() -> Self {
        Self {
            kind: KindFilter::Any,
            state: StateFilter::Ignored,
        }
    }

    /// Whether this pattern covers a migration of the given kind in the given state.
    pub fn matches(&self, versioned: bool, state: MigrationState) -> bool {
        let kind_ok = match self.kind {
            KindFilter::Any => true,
            KindFilter::Versioned => versioned,
            KindFilter::Repeatable => !versioned,
        };
        let state_ok = match self.state {
            StateFilter::Any => true,
            StateFilter::Missing => state == MigrationState::MissingSuccess,
            StateFilter::Pending => matches!(state, MigrationState::Pending | MigrationState::Outdated),
            StateFilter::Ignored => state == MigrationState::Ignored,
            StateFilter::Future => {
                matches!(state, MigrationState::FutureSuccess | MigrationState::FutureFailed)
            }
        };
        kind_ok && state_ok
    }

    /// Whether this pattern suppresses pending findings of any kind.
    pub(crate) fn allows_pending(&self) -> bool {
        self.kind == KindFilter::Any && matches!(self.state, StateFilter::Pending | StateFilter::Any)
    }
}

impl FromStr for ValidatePattern {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            MigrationError::config(format!(
                "invalid ignore pattern '{s}': expected '<versioned|repeatable|*>:<missing|pending|ignored|future|*>'"
            ))
        };
        let (kind, state) = s.trim().split_once(':').ok_or_else(invalid)?;
        let kind = match kind.trim().to_ascii_lowercase().as_str() {
            "*" => KindFilter::Any,
            "versioned" => KindFilter::Versioned,
            "repeatable" => KindFilter::Repeatable,
            _ => return Err(invalid()),
        };
        let state = match state.trim().to_ascii_lowercase().as_str() {
            "*" => StateFilter::Any,
            "missing" => StateFilter::Missing,
            "pending" => StateFilter::Pending,
            "ignored" => StateFilter::Ignored,
            "future" => StateFilter::Future,
            _ => return Err(invalid()),
        };
        Ok(Self { kind, state })
    }
}

impl TryFrom<String> for ValidatePattern {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ValidatePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            KindFilter::Any => "*",
            KindFilter::Versioned => "versioned",
            KindFilter::Repeatable => "repeatable",
        };
        let state = match self.state {
            StateFilter::Any => "*",
            StateFilter::Missing => "missing",
            StateFilter::Pending => "pending",
            StateFilter::Ignored => "ignored",
            StateFilter::Future => "future",
        };
        write!(f, "{kind}:{state}")
    }
}

impl From<ValidatePattern> for String {
    fn from(pattern: ValidatePattern) -> Self {
        pattern.to_string()
    }
}
