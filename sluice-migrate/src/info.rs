//! Reconciliation of resolved migrations with the schema history.
//!
//! [`reconcile`] pairs every resolved migration with its history rows by
//! natural key and classifies each pair into a [`MigrationState`]. The
//! result is a pure function of its inputs; calling it twice with the same
//! inputs yields the same [`MigrationInfoSet`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{MigrateConfig, matches_cherry_pick};
use crate::error::{MigrateResult, MigrationError};
use crate::history::AppliedMigration;
use crate::migration::{MigrationType, NaturalKey, ResolvedMigration};
use crate::validate::{ErrorCode, ValidatePattern, ValidationError, ValidationResult};
use crate::version::Version;

/// Classification of a migration against the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    /// Resolved, older than the baseline; never applied.
    BelowBaseline,
    /// Baseline marker row.
    Baseline,
    /// Resolved but skipped.
    Ignored,
    /// Resolved and waiting to be applied.
    Pending,
    /// Resolved, newer than the target.
    AboveTarget,
    /// Resolved, excluded by a cherry-pick selection.
    BelowTarget,
    /// Applied successfully by a newer version of the application.
    FutureSuccess,
    /// Failed while applied by a newer version of the application.
    FutureFailed,
    /// Applied successfully, no longer resolved.
    MissingSuccess,
    /// Failed, no longer resolved.
    MissingFailed,
    /// Applied after a higher version.
    OutOfOrder,
    /// Applied successfully.
    Success,
    /// Applied and failed.
    Failed,
    /// Repeatable whose checksum changed since it was applied.
    Outdated,
    /// Repeatable run replaced by a later run.
    Superseded,
}

impl MigrationState {
    /// Label shown by `info`.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::BelowBaseline => "Below Baseline",
            Self::Baseline => "Baseline",
            Self::Ignored => "Ignored",
            Self::Pending => "Pending",
            Self::AboveTarget => "Above Target",
            Self::BelowTarget => "Below Target",
            Self::FutureSuccess => "Future",
            Self::FutureFailed => "Failed (Future)",
            Self::MissingSuccess => "Missing",
            Self::MissingFailed => "Failed (Missing)",
            Self::OutOfOrder => "Out of Order",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Outdated => "Outdated",
            Self::Superseded => "Superseded",
        }
    }

    /// Whether a history row backs this state.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            Self::Baseline
                | Self::FutureSuccess
                | Self::FutureFailed
                | Self::MissingSuccess
                | Self::MissingFailed
                | Self::OutOfOrder
                | Self::Success
                | Self::Failed
                | Self::Outdated
                | Self::Superseded
        )
    }

    /// Whether a resolved migration backs this state.
    pub fn is_resolved(&self) -> bool {
        !matches!(
            self,
            Self::FutureSuccess | Self::FutureFailed | Self::MissingSuccess | Self::MissingFailed
        )
    }

    /// Whether this state represents a failed attempt.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::FutureFailed | Self::MissingFailed)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Inputs of reconciliation besides the two migration lists.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOptions {
    /// Highest version considered.
    pub target: Version,
    /// Whether pending migrations below the last applied version may run.
    pub out_of_order: bool,
    /// Fail when `target` matches no migration.
    pub fail_on_missing_target: bool,
    /// Versions or repeatable descriptions to restrict to.
    pub cherry_pick: Vec<String>,
}

impl ReconcileOptions {
    /// Options with a target and out-of-order flag, nothing else.
    pub fn new(target: Version, out_of_order: bool) -> Self {
        Self {
            target,
            out_of_order,
            fail_on_missing_target: false,
            cherry_pick: Vec::new(),
        }
    }

    /// Options taken from the engine configuration.
    pub fn from_config(config: &MigrateConfig) -> Self {
        Self {
            target: config.target.clone(),
            out_of_order: config.out_of_order,
            fail_on_missing_target: config.fail_on_missing_target,
            cherry_pick: config.cherry_pick.clone(),
        }
    }
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::new(Version::LATEST, false)
    }
}

/// Why a pending migration was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IgnoreReason {
    /// The executor declined to run in this environment.
    NotExecutable,
    /// A baseline migration covers it.
    CoveredByBaseline,
    /// Older than the last applied version while out-of-order is off.
    OutOfOrder,
}

/// Facts about the whole history shared by every pair.
#[derive(Debug, Clone)]
struct Context {
    target: Version,
    out_of_order: bool,
    cherry_pick: Vec<String>,
    baseline: Version,
    last_applied: Version,
    last_resolved: Version,
    latest_baseline_migration: Version,
    has_applied_versioned: bool,
    latest_repeatable_runs: HashMap<String, i32>,
}

/// A resolved migration, a history row, or both, with their state.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    resolved: Option<ResolvedMigration>,
    applied: Option<AppliedMigration>,
    state: MigrationState,
    ignore_reason: Option<IgnoreReason>,
}

impl MigrationInfo {
    /// Current state.
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Resolved side of the pair.
    pub fn resolved(&self) -> Option<&ResolvedMigration> {
        self.resolved.as_ref()
    }

    /// History side of the pair.
    pub fn applied(&self) -> Option<&AppliedMigration> {
        self.applied.as_ref()
    }

    /// Version; the history row wins when both sides exist.
    pub fn version(&self) -> Option<&Version> {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => a.version.as_ref(),
            (None, Some(r)) => r.version.as_ref(),
            (None, None) => None,
        }
    }

    /// Description; the history row wins when both sides exist.
    pub fn description(&self) -> &str {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => &a.description,
            (None, Some(r)) => &r.description,
            (None, None) => "",
        }
    }

    /// Type; the history row wins when both sides exist.
    pub fn migration_type(&self) -> MigrationType {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => a.migration_type,
            (None, Some(r)) => r.migration_type,
            (None, None) => MigrationType::Sql,
        }
    }

    /// Checksum; the history row wins when both sides exist.
    pub fn checksum(&self) -> Option<i32> {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => a.checksum,
            (None, Some(r)) => r.checksum,
            (None, None) => None,
        }
    }

    /// Script identifier.
    pub fn script(&self) -> &str {
        match (&self.applied, &self.resolved) {
            (Some(a), _) => &a.script,
            (None, Some(r)) => &r.script,
            (None, None) => "",
        }
    }

    /// Installed rank, if applied.
    pub fn installed_rank(&self) -> Option<i32> {
        self.applied.as_ref().map(|a| a.installed_rank)
    }

    /// When it was applied.
    pub fn installed_on(&self) -> Option<DateTime<Utc>> {
        self.applied.as_ref().map(|a| a.installed_on)
    }

    /// Who applied it.
    pub fn installed_by(&self) -> Option<&str> {
        self.applied.as_ref().map(|a| a.installed_by.as_str())
    }

    /// Execution time in milliseconds, if applied.
    pub fn execution_time_ms(&self) -> Option<i64> {
        self.applied.as_ref().map(|a| a.execution_time_ms)
    }

    /// Where the resolved migration was found.
    pub fn physical_location(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|r| r.physical_location.as_str())
            .unwrap_or("")
    }

    /// Whether the resolved migration may run in a transaction.
    pub fn can_execute_in_transaction(&self) -> bool {
        self.resolved
            .as_ref()
            .is_some_and(|r| r.executor.can_execute_in_transaction())
    }

    fn natural_key(&self) -> NaturalKey {
        match self.version() {
            Some(v) => NaturalKey::Versioned(v.clone()),
            None => NaturalKey::Repeatable(self.description().to_string()),
        }
    }

    fn sort_group(&self) -> u8 {
        if self.applied.is_some() {
            1
        } else if self.state == MigrationState::BelowBaseline {
            0
        } else {
            2
        }
    }

    fn ordering(&self, other: &Self) -> Ordering {
        self.sort_group()
            .cmp(&other.sort_group())
            .then_with(|| match (self.installed_rank(), other.installed_rank()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.natural_key().cmp(&other.natural_key()),
            })
    }

    /// The finding for this migration, if any.
    fn validate(
        &self,
        baseline: &Version,
        patterns: &[ValidatePattern],
        allow_pending: bool,
    ) -> Option<ValidationError> {
        let state = self.state;
        if matches!(state, MigrationState::AboveTarget | MigrationState::BelowTarget) {
            return None;
        }
        let versioned = self.version().is_some();
        if patterns.iter().any(|p| p.matches(versioned, state)) {
            return None;
        }

        let version = self.version().cloned();
        let description = self.description().to_string();
        let finding = |code: ErrorCode, message: String| {
            Some(ValidationError {
                code,
                version: version.clone(),
                description: description.clone(),
                message,
            })
        };

        if state.is_failed() {
            return match &version {
                Some(v) => finding(
                    ErrorCode::FailedVersioned,
                    format!(
                        "Detected failed migration to version {v} ({description}). \
                         Remove any half-completed changes then run repair."
                    ),
                ),
                None => finding(
                    ErrorCode::FailedRepeatable,
                    format!(
                        "Detected failed repeatable migration: {description}. \
                         Remove any half-completed changes then run repair."
                    ),
                ),
            };
        }

        if let (None, Some(applied)) = (&self.resolved, &self.applied) {
            if !applied.migration_type.is_synthetic() && state != MigrationState::Superseded {
                return match &version {
                    Some(v) => finding(
                        ErrorCode::AppliedVersionedNotResolved,
                        format!("Detected applied migration not resolved locally: {v}."),
                    ),
                    None => finding(
                        ErrorCode::AppliedRepeatableNotResolved,
                        format!("Detected applied migration not resolved locally: {description}."),
                    ),
                };
            }
        }

        if state == MigrationState::Ignored && self.ignore_reason == Some(IgnoreReason::OutOfOrder) {
            return match &version {
                Some(v) => finding(
                    ErrorCode::ResolvedVersionedNotApplied,
                    format!(
                        "Detected resolved migration not applied to database: {v}. \
                         Enable out_of_order to apply it."
                    ),
                ),
                None => finding(
                    ErrorCode::ResolvedRepeatableNotApplied,
                    format!("Detected resolved repeatable migration not applied to database: {description}."),
                ),
            };
        }

        if !allow_pending && state == MigrationState::Pending {
            return match &version {
                Some(v) => finding(
                    ErrorCode::ResolvedVersionedNotApplied,
                    format!("Detected resolved migration not applied to database: {v}. Run migrate to apply it."),
                ),
                None => finding(
                    ErrorCode::ResolvedRepeatableNotApplied,
                    format!(
                        "Detected resolved repeatable migration not applied to database: {description}. \
                         Run migrate to apply it."
                    ),
                ),
            };
        }

        if !allow_pending && state == MigrationState::Outdated {
            return finding(
                ErrorCode::OutdatedRepeatable,
                format!(
                    "Detected outdated resolved repeatable migration that should be re-applied: {description}. \
                     Run migrate to apply it."
                ),
            );
        }

        let (Some(resolved), Some(applied)) = (&self.resolved, &self.applied) else {
            return None;
        };
        if applied.migration_type == MigrationType::Delete {
            return None;
        }
        if applied.version.as_ref().is_some_and(|v| v <= baseline) {
            return None;
        }

        let identifier = match &applied.version {
            Some(v) => format!("version {v}"),
            None => applied.script.clone(),
        };
        if resolved.migration_type != applied.migration_type {
            return finding(
                ErrorCode::TypeMismatch,
                mismatch_message("type", &identifier, &applied.migration_type, &resolved.migration_type),
            );
        }
        let compare_checksum = resolved.version.is_some()
            || (allow_pending
                && !matches!(state, MigrationState::Outdated | MigrationState::Superseded));
        if compare_checksum && !resolved.checksum_matches(applied.checksum) {
            return finding(
                ErrorCode::ChecksumMismatch,
                mismatch_message(
                    "checksum",
                    &identifier,
                    &ChecksumText(applied.checksum),
                    &ChecksumText(resolved.checksum),
                ),
            );
        }
        if resolved.description != applied.description {
            return finding(
                ErrorCode::DescriptionMismatch,
                mismatch_message("description", &identifier, &applied.description, &resolved.description),
            );
        }
        None
    }
}

struct ChecksumText(Option<i32>);

impl fmt::Display for ChecksumText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(c) => write!(f, "{c}"),
            None => f.write_str("none"),
        }
    }
}

fn mismatch_message(
    what: &str,
    identifier: &str,
    applied: &dyn fmt::Display,
    resolved: &dyn fmt::Display,
) -> String {
    format!(
        "Migration {what} mismatch for migration {identifier}\n\
         -> Applied to database : {applied}\n\
         -> Resolved locally    : {resolved}\n\
         Either revert the changes to the migration, or run repair to update the schema history."
    )
}

/// All migrations known to this run, ordered for display and execution.
#[derive(Debug, Clone)]
pub struct MigrationInfoSet {
    infos: Vec<MigrationInfo>,
    baseline: Version,
    last_applied: Version,
}

impl MigrationInfoSet {
    /// Every migration.
    pub fn all(&self) -> &[MigrationInfo] {
        &self.infos
    }

    /// The highest applied versioned migration, or the latest applied
    /// repeatable one when no versioned migration has been applied.
    pub fn current(&self) -> Option<&MigrationInfo> {
        let applied = |i: &&MigrationInfo| {
            i.state.is_applied() && i.migration_type() != MigrationType::Delete
        };
        self.infos
            .iter()
            .filter(applied)
            .filter(|i| i.version().is_some())
            .max_by(|a, b| a.version().cmp(&b.version()))
            .or_else(|| self.infos.iter().rev().find(applied))
    }

    /// Migrations that migrate would apply.
    pub fn pending(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s == MigrationState::Pending)
    }

    /// Migrations with a history row.
    pub fn applied(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s.is_applied())
    }

    /// Migrations with a failed history row.
    pub fn failed(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s.is_failed())
    }

    /// Rows applied by a newer version of the application.
    pub fn future(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| matches!(s, MigrationState::FutureSuccess | MigrationState::FutureFailed))
    }

    /// Rows applied out of order.
    pub fn out_of_order(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s == MigrationState::OutOfOrder)
    }

    /// Migrations backed by a resolved migration.
    pub fn resolved(&self) -> Vec<&MigrationInfo> {
        self.with_state(|s| s.is_resolved())
    }

    /// Highest baseline version in the history, or [`Version::EMPTY`].
    pub fn baseline(&self) -> &Version {
        &self.baseline
    }

    /// Highest applied version, or [`Version::EMPTY`].
    pub fn last_applied(&self) -> &Version {
        &self.last_applied
    }

    /// Check the pairs for discrepancies.
    ///
    /// Findings matching one of `patterns` are dropped. Pending and outdated
    /// migrations are findings unless `allow_pending` is set or a pattern
    /// covers them.
    pub fn validate(&self, patterns: &[ValidatePattern], allow_pending: bool) -> ValidationResult {
        let allow_pending = allow_pending || patterns.iter().any(ValidatePattern::allows_pending);
        let errors = self
            .infos
            .iter()
            .filter_map(|info| info.validate(&self.baseline, patterns, allow_pending))
            .collect();
        ValidationResult {
            errors,
            validated: self.infos.iter().filter(|i| i.resolved.is_some()).count(),
        }
    }

    fn with_state(&self, pred: impl Fn(MigrationState) -> bool) -> Vec<&MigrationInfo> {
        self.infos.iter().filter(|i| pred(i.state)).collect()
    }
}

/// Classify resolved migrations against history rows.
///
/// `resolved` must be free of duplicates (see the resolver); `applied` must
/// be in installed-rank order.
pub fn reconcile(
    resolved: &[ResolvedMigration],
    applied: &[AppliedMigration],
    options: &ReconcileOptions,
) -> MigrateResult<MigrationInfoSet> {
    let mut resolved_versioned: BTreeMap<&Version, &ResolvedMigration> = BTreeMap::new();
    let mut resolved_repeatable: BTreeMap<&str, &ResolvedMigration> = BTreeMap::new();
    let mut last_resolved = Version::EMPTY;
    for migration in resolved {
        match &migration.version {
            Some(v) => {
                if *v > last_resolved {
                    last_resolved = v.clone();
                }
                resolved_versioned.insert(v, migration);
            }
            None => {
                resolved_repeatable.insert(migration.description.as_str(), migration);
            }
        }
    }

    let mut baseline = Version::EMPTY;
    let mut last_applied = Version::EMPTY;
    let mut has_applied_versioned = false;
    let mut applied_versioned = Vec::new();
    let mut applied_repeatable = Vec::new();
    let mut latest_repeatable_runs: HashMap<String, i32> = HashMap::new();

    for row in applied {
        let Some(version) = &row.version else {
            let latest = latest_repeatable_runs.entry(row.description.clone()).or_insert(row.installed_rank);
            *latest = (*latest).max(row.installed_rank);
            applied_repeatable.push(row);
            continue;
        };
        if row.migration_type.is_baseline() && *version > baseline {
            baseline = version.clone();
        }
        if !row.migration_type.is_synthetic() {
            has_applied_versioned = true;
        }
        let out_of_order = if *version > last_applied {
            if row.migration_type != MigrationType::Delete {
                last_applied = version.clone();
            }
            false
        } else {
            true
        };
        applied_versioned.push((row, out_of_order));
    }

    let applied_versions: HashSet<&Version> = applied_versioned
        .iter()
        .filter(|(row, _)| row.migration_type != MigrationType::Delete)
        .filter_map(|(row, _)| row.version.as_ref())
        .collect();

    let pending_baseline = resolved_versioned
        .iter()
        .filter(|(v, m)| m.migration_type.is_baseline() && !applied_versions.contains(*v) && **v <= &options.target)
        .map(|(v, _)| (*v).clone())
        .max()
        .unwrap_or(Version::EMPTY);
    let latest_baseline_migration = if has_applied_versioned {
        baseline.clone()
    } else {
        baseline.clone().max(pending_baseline)
    };

    let context = Context {
        target: options.target.clone(),
        out_of_order: options.out_of_order,
        cherry_pick: options.cherry_pick.clone(),
        baseline: baseline.clone(),
        last_applied: last_applied.clone(),
        last_resolved,
        latest_baseline_migration,
        has_applied_versioned,
        latest_repeatable_runs,
    };

    let mut infos = Vec::with_capacity(resolved.len() + applied.len());

    for (row, out_of_order) in &applied_versioned {
        let resolved = row.version.as_ref().and_then(|v| resolved_versioned.get(v)).copied();
        infos.push(applied_info(resolved, row, *out_of_order, &context));
    }
    for (version, migration) in &resolved_versioned {
        if !applied_versions.contains(version) {
            infos.push(pending_info(migration, &context));
        }
    }

    if options.fail_on_missing_target && !options.target.is_latest() {
        let found = infos.iter().any(|i| i.version() == Some(&options.target));
        if !found {
            return Err(MigrationError::MissingTarget(options.target.to_string()));
        }
    }

    for row in &applied_repeatable {
        let resolved = resolved_repeatable.get(row.description.as_str()).copied();
        infos.push(applied_info(resolved, row, false, &context));
    }
    for (description, migration) in &resolved_repeatable {
        let up_to_date = applied_repeatable.iter().any(|row| {
            row.description == *description
                && row.migration_type != MigrationType::Delete
                && context.latest_repeatable_runs.get(*description) == Some(&row.installed_rank)
                && migration.checksum_matches(row.checksum)
        });
        if !up_to_date {
            infos.push(pending_info(migration, &context));
        }
    }

    infos.sort_by(|a, b| a.ordering(b));

    Ok(MigrationInfoSet {
        infos,
        baseline,
        last_applied,
    })
}

fn pending_info(resolved: &ResolvedMigration, context: &Context) -> MigrationInfo {
    let (state, ignore_reason) = pending_state(resolved, context);
    MigrationInfo {
        resolved: Some(resolved.clone()),
        applied: None,
        state,
        ignore_reason,
    }
}

fn pending_state(resolved: &ResolvedMigration, context: &Context) -> (MigrationState, Option<IgnoreReason>) {
    if !resolved.executor.should_execute() {
        return (MigrationState::Ignored, Some(IgnoreReason::NotExecutable));
    }
    let picked = matches_cherry_pick(&context.cherry_pick, resolved.version.as_ref(), &resolved.description);

    let Some(version) = &resolved.version else {
        if !picked {
            return (MigrationState::BelowTarget, None);
        }
        return (MigrationState::Pending, None);
    };

    if *version < context.baseline {
        return (MigrationState::BelowBaseline, None);
    }
    if *version > context.target {
        return (MigrationState::AboveTarget, None);
    }
    if !picked {
        return (MigrationState::BelowTarget, None);
    }
    if *version < context.last_applied && !context.out_of_order {
        return (MigrationState::Ignored, Some(IgnoreReason::OutOfOrder));
    }
    if resolved.migration_type.is_baseline() && context.has_applied_versioned {
        return (MigrationState::Ignored, Some(IgnoreReason::CoveredByBaseline));
    }
    let latest = &context.latest_baseline_migration;
    if *version < *latest || (*version == *latest && !resolved.migration_type.is_baseline()) {
        return (MigrationState::Ignored, Some(IgnoreReason::CoveredByBaseline));
    }
    (MigrationState::Pending, None)
}

fn applied_info(
    resolved: Option<&ResolvedMigration>,
    applied: &AppliedMigration,
    out_of_order: bool,
    context: &Context,
) -> MigrationInfo {
    MigrationInfo {
        resolved: resolved.cloned(),
        applied: Some(applied.clone()),
        state: applied_state(resolved, applied, out_of_order, context),
        ignore_reason: None,
    }
}

fn applied_state(
    resolved: Option<&ResolvedMigration>,
    applied: &AppliedMigration,
    out_of_order: bool,
    context: &Context,
) -> MigrationState {
    match applied.migration_type {
        MigrationType::Delete => return MigrationState::Success,
        MigrationType::Baseline => return MigrationState::Baseline,
        _ => {}
    }

    let latest_run = context.latest_repeatable_runs.get(&applied.description).copied();
    let is_latest = applied.version.is_some() || latest_run.is_none_or(|r| r == applied.installed_rank);

    if resolved.is_none() && is_latest {
        if applied.migration_type == MigrationType::Schema {
            return MigrationState::Success;
        }
        let missing = applied.version.as_ref().is_none_or(|v| *v < context.last_resolved);
        return match (missing, applied.success) {
            (true, true) => MigrationState::MissingSuccess,
            (true, false) => MigrationState::MissingFailed,
            (false, true) => MigrationState::FutureSuccess,
            (false, false) => MigrationState::FutureFailed,
        };
    }

    if !applied.success {
        return MigrationState::Failed;
    }

    if applied.version.is_none() {
        if latest_run == Some(applied.installed_rank) {
            return match resolved {
                Some(r) if r.checksum_matches(applied.checksum) => MigrationState::Success,
                _ => MigrationState::Outdated,
            };
        }
        return MigrationState::Superseded;
    }

    if out_of_order {
        return MigrationState::OutOfOrder;
    }
    MigrationState::Success
}
