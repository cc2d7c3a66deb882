//! Incremental fix session
//!
//! Applies a batch of fixes for one diagnosed failure, one at a time:
//!
//! ```text
//! pending -> validating -> (failed | awaiting confirmation) -> backed up
//!         -> applying -> (failed | applied) -> verifying -> (verified | reverted)
//! ```
//!
//! Every filesystem effect goes through the rollback ledger first. Every
//! attempt is recorded in the fix history when one is attached.

use crate::collab::{
    BuildExecutor, BuildOptions, BuildResult, CollabError, PermissionProvider, ToolRegistry,
};
use crate::diagnose::{Catalog, Diagnoser, ErrorDiagnosis};
use crate::fix::{assess, FixAction, FixKind, FixValidator, RiskAssessment, RiskLevel, ValidationResult};
use crate::history::FixHistory;
use crate::project::ProjectContext;
use crate::rollback::{LedgerError, LedgerOp, RollbackLedger};
use crate::sandbox::{Sandbox, SandboxConfig, SandboxError};
use crate::util::{resolve_target, truncate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

/// Session policy. Also the `session` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_apply: bool,
    /// Highest risk applied without asking when `auto_apply` is on.
    pub max_auto_risk: RiskLevel,
    pub auto_rollback: bool,
    pub verify_each: bool,
    pub stop_on_failure: bool,
    /// Pause before the post-fix rebuild.
    pub settle_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_apply: false,
            max_auto_risk: RiskLevel::Low,
            auto_rollback: true,
            verify_each: true,
            stop_on_failure: false,
            settle_delay_ms: 500,
        }
    }
}

/// Whether `action` must be confirmed before it is applied.
pub fn needs_confirmation(action: &FixAction, risk: &RiskAssessment, config: &SessionConfig) -> bool {
    let flagged = action.requires_confirmation || risk.requires_confirmation;
    flagged && !(config.auto_apply && risk.level <= config.max_auto_risk)
}

#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub builder: &'a dyn BuildExecutor,
    pub permissions: &'a dyn PermissionProvider,
    pub tools: Option<&'a dyn ToolRegistry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixState {
    Pending,
    Validating,
    AwaitingConfirmation,
    BackedUp,
    Applying,
    Applied,
    Verifying,
    Verified,
    Reverted,
    Failed,
    Skipped,
}

impl fmt::Display for FixState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FixState::Pending => "pending",
            FixState::Validating => "validating",
            FixState::AwaitingConfirmation => "awaiting confirmation",
            FixState::BackedUp => "backed up",
            FixState::Applying => "applying",
            FixState::Applied => "applied",
            FixState::Verifying => "verifying",
            FixState::Verified => "verified",
            FixState::Reverted => "reverted",
            FixState::Failed => "failed",
            FixState::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixResult {
    Applied,
    Failed,
    Skipped,
}

/// Outcome of the rebuild after one fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyResult {
    Success,
    /// The original error is still there and nothing else improved.
    Failed,
    Partial,
    NewErrors,
    /// The rebuild itself could not run.
    BuildError,
    Skipped,
}

/// Compare error signatures before (`before`) and after (`after`) a fix.
///
/// A clean build is `Success`. If the primary error survives, the fix is
/// `Partial` when some other error disappeared and `Failed` otherwise. If
/// the primary error is gone, any signature not present before makes it
/// `NewErrors`; otherwise `Partial`.
pub fn classify_verification(
    build_succeeded: bool,
    primary: &str,
    before: &BTreeSet<String>,
    after: &BTreeSet<String>,
) -> VerifyResult {
    if build_succeeded {
        return VerifyResult::Success;
    }
    if after.contains(primary) {
        if before.iter().any(|sig| !after.contains(sig)) {
            VerifyResult::Partial
        } else {
            VerifyResult::Failed
        }
    } else if after.iter().any(|sig| !before.contains(sig)) {
        VerifyResult::NewErrors
    } else {
        VerifyResult::Partial
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixApplicationResult {
    pub action: FixAction,
    pub state: FixState,
    pub result: FixResult,
    pub verify: VerifyResult,
    pub risk: RiskAssessment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    pub message: String,
    pub duration_ms: u64,
    /// Ledger indices this fix created.
    #[serde(skip)]
    pub ledger_entries: Vec<usize>,
    pub rolled_back: bool,
}

impl FixApplicationResult {
    fn new(action: &FixAction, risk: RiskAssessment) -> Self {
        Self {
            action: action.clone(),
            state: FixState::Pending,
            result: FixResult::Skipped,
            verify: VerifyResult::Skipped,
            risk,
            validation: None,
            message: String::new(),
            duration_ms: 0,
            ledger_entries: Vec::new(),
            rolled_back: false,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.result == FixResult::Applied
    }

    /// Verified by a rebuild that fixed at least part of the failure.
    pub fn is_verified(&self) -> bool {
        self.state == FixState::Verified
            && matches!(self.verify, VerifyResult::Success | VerifyResult::Partial)
    }

    /// Applied and, if verified, not a regression.
    pub fn succeeded(&self) -> bool {
        self.is_applied() && !matches!(self.verify, VerifyResult::Failed | VerifyResult::BuildError)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    pub verified: usize,
    pub rolled_back: usize,
}

#[derive(Debug, Error)]
enum ApplyError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

struct EnvChange {
    result_index: usize,
    name: String,
    previous: Option<String>,
}

pub struct FixSession<'s> {
    project: &'s ProjectContext,
    diagnosis: &'s ErrorDiagnosis,
    catalog: &'s Catalog,
    ledger: &'s mut RollbackLedger,
    history: Option<&'s mut FixHistory>,
    collab: Collaborators<'s>,
    config: SessionConfig,
    sandbox: SandboxConfig,
    build: BuildOptions,
    before: BTreeSet<String>,
    results: Vec<FixApplicationResult>,
    env_changes: Vec<EnvChange>,
    last_build: Option<BuildResult>,
}

impl<'s> FixSession<'s> {
    pub fn new(
        project: &'s ProjectContext,
        diagnosis: &'s ErrorDiagnosis,
        catalog: &'s Catalog,
        ledger: &'s mut RollbackLedger,
        collab: Collaborators<'s>,
        config: SessionConfig,
    ) -> Self {
        let mut before = Diagnoser::new(catalog).signatures(&diagnosis.error_text);
        before.insert(diagnosis.signature.clone());
        Self {
            project,
            diagnosis,
            catalog,
            ledger,
            history: None,
            collab,
            config,
            sandbox: SandboxConfig::default(),
            build: BuildOptions::default(),
            before,
            results: Vec::new(),
            env_changes: Vec::new(),
            last_build: None,
        }
    }

    pub fn with_history(mut self, history: &'s mut FixHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Sandbox for command-type fixes.
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Build to run for verification. Environment fixes are layered onto it.
    pub fn with_build_options(mut self, build: BuildOptions) -> Self {
        self.build = build;
        self
    }

    pub fn results(&self) -> &[FixApplicationResult] {
        &self.results
    }

    pub fn build_options(&self) -> &BuildOptions {
        &self.build
    }

    /// The most recent verification build, if any ran.
    pub fn last_build(&self) -> Option<&BuildResult> {
        self.last_build.as_ref()
    }

    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary::default();
        for r in &self.results {
            match r.result {
                FixResult::Applied => summary.applied += 1,
                FixResult::Failed => summary.failed += 1,
                FixResult::Skipped => summary.skipped += 1,
            }
            if r.is_verified() {
                summary.verified += 1;
            }
            if r.rolled_back {
                summary.rolled_back += 1;
            }
        }
        summary
    }

    /// Apply `fixes` in order. Stops early on a clean verification build, or
    /// on the first skipped/failed fix when `stop_on_failure` is set.
    pub fn apply(
        &mut self,
        fixes: &[FixAction],
        verify_each: bool,
        stop_on_failure: bool,
    ) -> &[FixApplicationResult] {
        for action in fixes {
            let index = self.apply_one(action, verify_each);
            let outcome = &self.results[index];

            if outcome.verify == VerifyResult::Success {
                tracing::info!(fix = %action.kind, "build succeeded after fix");
                break;
            }
            if stop_on_failure && !outcome.succeeded() {
                tracing::info!(fix = %action.kind, state = %outcome.state, "stopping after unsuccessful fix");
                break;
            }
        }
        &self.results
    }

    fn transition(&mut self, index: usize, state: FixState) {
        let result = &mut self.results[index];
        tracing::debug!(fix = %result.action.kind, from = %result.state, to = %state, "fix state");
        result.state = state;
    }

    fn apply_one(&mut self, action: &FixAction, verify_each: bool) -> usize {
        let risk = assess(action);
        self.results.push(FixApplicationResult::new(action, risk.clone()));
        let index = self.results.len() - 1;

        self.transition(index, FixState::Validating);
        let mut validator = FixValidator::new().with_sandbox(&self.sandbox);
        if let Some(tools) = self.collab.tools {
            validator = validator.with_tools(tools);
        }
        let validation = validator.validate(Some(action), self.project);
        let can_proceed = validation.can_proceed;
        let message = validation.message.clone();
        self.results[index].validation = Some(validation);
        if !can_proceed {
            tracing::warn!(fix = %action.kind, reason = %message, "fix failed validation");
            self.finish_skipped(index, message);
            return index;
        }
        if action.kind == FixKind::None {
            self.finish_skipped(index, "Nothing to apply".to_string());
            return index;
        }

        if needs_confirmation(action, &risk, &self.config) {
            self.transition(index, FixState::AwaitingConfirmation);
            let decision = self.collab.permissions.confirm(
                &action.description,
                action.subject(),
                &format!("{} risk: {}", risk.level, risk.description),
            );
            if !decision.is_allowed() {
                self.finish_skipped(index, "Declined".to_string());
                return index;
            }
        }

        if risk.requires_backup && action.kind.touches_file() {
            let path = resolve_target(&self.project.root, action.subject());
            match self.ledger.backup_file(&path, LedgerOp::FileModified) {
                Ok(entry) => self.results[index].ledger_entries.push(entry),
                Err(err) => {
                    self.finish_failed(index, format!("Backup failed: {}", err), 0);
                    return index;
                }
            }
            self.transition(index, FixState::BackedUp);
        }

        self.transition(index, FixState::Applying);
        let start = Instant::now();
        let applied = self.apply_effect(index, action);
        let duration_ms = start.elapsed().as_millis() as u64;

        match applied {
            Ok(message) => {
                let result = &mut self.results[index];
                result.result = FixResult::Applied;
                result.message = message;
                result.duration_ms = duration_ms;
                self.transition(index, FixState::Applied);
            }
            Err(err) => {
                self.finish_failed(index, err.to_string(), duration_ms);
                return index;
            }
        }

        if verify_each {
            self.verify(index);
        } else if action.kind != FixKind::Retry {
            self.record(index, true);
        }
        index
    }

    fn finish_skipped(&mut self, index: usize, message: String) {
        self.transition(index, FixState::Skipped);
        let result = &mut self.results[index];
        result.result = FixResult::Skipped;
        result.message = message;
    }

    fn finish_failed(&mut self, index: usize, message: String, duration_ms: u64) {
        tracing::warn!(fix = %self.results[index].action.kind, error = %message, "fix failed");
        self.transition(index, FixState::Failed);
        {
            let result = &mut self.results[index];
            result.result = FixResult::Failed;
            result.message = message;
            result.duration_ms = duration_ms;
        }
        self.record(index, false);
        if self.config.auto_rollback {
            self.revert(index);
        }
    }

    fn record(&mut self, index: usize, success: bool) {
        if let Some(history) = self.history.as_deref_mut() {
            let result = &self.results[index];
            history.record_in(
                self.diagnosis,
                &result.action,
                success,
                result.duration_ms,
                Some(self.project),
            );
        }
    }

    fn verify(&mut self, index: usize) {
        self.transition(index, FixState::Verifying);
        let verify = match self.collab.builder.run_build(self.project, &self.build) {
            Ok(build) => {
                let after = if build.success {
                    BTreeSet::new()
                } else {
                    Diagnoser::new(self.catalog).signatures(&build.output())
                };
                let verdict = classify_verification(
                    build.success,
                    &self.diagnosis.signature,
                    &self.before,
                    &after,
                );
                self.last_build = Some(build);
                verdict
            }
            Err(err) => {
                tracing::warn!(error = %err, "verification build could not run");
                VerifyResult::BuildError
            }
        };

        self.results[index].verify = verify;
        let primary_resolved = !matches!(verify, VerifyResult::Failed | VerifyResult::BuildError)
            && !(verify == VerifyResult::Partial && self.still_has_primary());
        self.record(index, primary_resolved);

        match verify {
            VerifyResult::Failed | VerifyResult::BuildError if self.config.auto_rollback => {
                self.revert(index);
            }
            _ => self.transition(index, FixState::Verified),
        }
    }

    fn still_has_primary(&self) -> bool {
        self.last_build
            .as_ref()
            .map(|build| {
                Diagnoser::new(self.catalog)
                    .signatures(&build.output())
                    .contains(&self.diagnosis.signature)
            })
            .unwrap_or(false)
    }

    /// Undo one fix's ledger entries and environment changes.
    fn revert(&mut self, index: usize) {
        let mut entries = self.results[index].ledger_entries.clone();
        entries.sort_unstable_by(|a, b| b.cmp(a));
        let mut reverted = false;
        for entry in entries {
            if !self.ledger.entries().get(entry).is_some_and(|e| e.can_rollback) {
                continue;
            }
            match self.ledger.rollback_entry(entry) {
                Ok(()) => reverted = true,
                Err(err) => tracing::warn!(entry, error = %err, "failed to roll back fix"),
            }
        }
        reverted |= self.undo_env(|change| change.result_index == index);

        if reverted {
            self.results[index].rolled_back = true;
            self.transition(index, FixState::Reverted);
        }
    }

    fn undo_env(&mut self, select: impl Fn(&EnvChange) -> bool) -> bool {
        let mut undone = false;
        let mut kept = Vec::with_capacity(self.env_changes.len());
        for change in std::mem::take(&mut self.env_changes).into_iter().rev() {
            if !select(&change) {
                kept.push(change);
                continue;
            }
            match change.previous {
                Some(value) => self.build.env.insert(change.name, value),
                None => self.build.env.remove(&change.name),
            };
            undone = true;
        }
        kept.reverse();
        self.env_changes = kept;
        undone
    }

    /// Reverse every still-reversible ledger entry this session created,
    /// newest first, and restore the build environment.
    pub fn rollback_all(&mut self) -> usize {
        let mut owned: Vec<(usize, usize)> = self
            .results
            .iter()
            .enumerate()
            .flat_map(|(owner, r)| r.ledger_entries.iter().map(move |&entry| (entry, owner)))
            .collect();
        owned.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut reverted = BTreeSet::new();
        let mut reversed = 0;
        for (entry, owner) in owned {
            if !self.ledger.entries().get(entry).is_some_and(|e| e.can_rollback) {
                continue;
            }
            match self.ledger.rollback_entry(entry) {
                Ok(()) => {
                    reversed += 1;
                    reverted.insert(owner);
                }
                Err(err) => tracing::warn!(entry, error = %err, "rollback failed"),
            }
        }
        reverted.extend(self.env_changes.iter().map(|change| change.result_index));
        self.undo_env(|_| true);

        for owner in reverted {
            let result = &mut self.results[owner];
            if !result.rolled_back {
                result.rolled_back = true;
                result.state = FixState::Reverted;
            }
        }
        tracing::info!(reversed, "session rolled back");
        reversed
    }

    fn run_command(&mut self, index: usize, command: &str) -> Result<String, ApplyError> {
        let entry = self.ledger.record_command(command)?;
        self.results[index].ledger_entries.push(entry);

        let mut config = self.sandbox.clone();
        config
            .env
            .extend(self.build.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let result = Sandbox::new(config).run_shell(command, &self.project.root)?;
        if let Some(reason) = &result.kill_reason {
            return Err(ApplyError::Invalid(format!("`{}` was killed: {}", command, reason)));
        }
        if !result.success {
            return Err(ApplyError::Invalid(format!(
                "`{}` exited with {:?}: {}",
                command,
                result.exit_code,
                truncate(result.output().trim(), 500)
            )));
        }
        Ok(format!("Ran `{}`", command))
    }

    fn apply_effect(&mut self, index: usize, action: &FixAction) -> Result<String, ApplyError> {
        match action.kind {
            FixKind::InstallPackage => {
                let package = action.subject().to_string();
                if let Some(command) = &action.command {
                    return self.run_command(index, command);
                }
                let tools = self.collab.tools.ok_or_else(|| {
                    ApplyError::Invalid("No tool registry available to install packages".to_string())
                })?;
                let entry = self.ledger.record_command(&format!("install {}", package))?;
                self.results[index].ledger_entries.push(entry);
                tools.install_package(&package)?;
                Ok(format!("Installed {}", package))
            }
            FixKind::CreateFile | FixKind::ModifyFile => {
                let path = resolve_target(&self.project.root, action.subject());
                let content = action.value.as_deref().unwrap_or("");
                fs::write(&path, content).map_err(|source| ApplyError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(format!("Wrote {}", path.display()))
            }
            FixKind::SetEnvVar => {
                let name = action.subject().to_string();
                let value = action.value.clone().unwrap_or_default();
                let previous = self.build.env.insert(name.clone(), value.clone());
                self.env_changes.push(EnvChange {
                    result_index: index,
                    name: name.clone(),
                    previous,
                });
                Ok(format!("Set {}={}", name, value))
            }
            FixKind::RunCommand => {
                let command = action
                    .command
                    .clone()
                    .ok_or_else(|| ApplyError::Invalid("Command fix has no command".to_string()))?;
                self.run_command(index, &command)
            }
            FixKind::CleanBuild => match &action.command {
                Some(command) => self.run_command(index, command),
                None => self.remove_build_dir(index),
            },
            FixKind::FixBuildConfigVersion => {
                let path = resolve_target(&self.project.root, action.subject());
                let version = action
                    .value
                    .as_deref()
                    .ok_or_else(|| ApplyError::Invalid("No version given".to_string()))?;
                let content = fs::read_to_string(&path).map_err(|source| ApplyError::Io {
                    path: path.clone(),
                    source,
                })?;
                let updated = set_minimum_version(&content, version);
                fs::write(&path, updated).map_err(|source| ApplyError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(format!("Set minimum version {} in {}", version, path.display()))
            }
            // The verification rebuild is the retry.
            FixKind::Retry => Ok("Rebuilding".to_string()),
            FixKind::None => Ok(String::new()),
        }
    }

    fn remove_build_dir(&mut self, index: usize) -> Result<String, ApplyError> {
        let dir = self.project.build_dir.clone();
        if dir == self.project.root || !dir.starts_with(&self.project.root) {
            return Err(ApplyError::Invalid(format!(
                "Refusing to remove {} outside the project",
                dir.display()
            )));
        }
        if !dir.exists() {
            return Ok("Build directory already clean".to_string());
        }
        let entry = self.ledger.record_rmdir(&dir)?;
        self.results[index].ledger_entries.push(entry);
        fs::remove_dir_all(&dir).map_err(|source| ApplyError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(format!("Removed {}", dir.display()))
    }
}

/// Rewrite (or add) the `cmake_minimum_required` declaration.
pub fn set_minimum_version(content: &str, version: &str) -> String {
    let Ok(re) = Regex::new(r"(?i)cmake_minimum_required\s*\(\s*VERSION\s+[0-9][0-9.]*(?:\.\.\.[0-9.]+)?")
    else {
        return content.to_string();
    };
    let replacement = format!("cmake_minimum_required(VERSION {}", version);
    if re.is_match(content) {
        re.replace(content, regex::NoExpand(&replacement)).into_owned()
    } else {
        format!("{})\n{}", replacement, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{AutoApprove, DenyAll};
    use crate::project::{BuildSystem, Language};
    use crate::rollback::LedgerConfig;
    use std::cell::RefCell;
    use std::path::Path;
    use tempfile::tempdir;

    /// Returns canned build results in order, repeating the last one.
    struct ScriptedBuilder {
        results: RefCell<Vec<BuildResult>>,
        calls: RefCell<Vec<BuildOptions>>,
    }

    impl ScriptedBuilder {
        fn new(results: Vec<BuildResult>) -> Self {
            Self {
                results: RefCell::new(results),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl BuildExecutor for ScriptedBuilder {
        fn run_build(
            &self,
            _project: &ProjectContext,
            opts: &BuildOptions,
        ) -> Result<BuildResult, CollabError> {
            self.calls.borrow_mut().push(opts.clone());
            let mut results = self.results.borrow_mut();
            if results.len() > 1 {
                Ok(results.remove(0))
            } else {
                results
                    .first()
                    .cloned()
                    .ok_or_else(|| CollabError::Unavailable("no build".to_string()))
            }
        }
    }

    const HEADER_ERROR: &str = "main.c:1:10: fatal error: zlib.h: No such file or directory";

    fn setup(root: &Path) -> (ProjectContext, Catalog, ErrorDiagnosis, RollbackLedger) {
        let project = ProjectContext::new(root, Language::C, BuildSystem::Make);
        let catalog = Catalog::builtin();
        let diagnosis = Diagnoser::new(&catalog).diagnose(HEADER_ERROR, Some(&project));
        let ledger = RollbackLedger::new(LedgerConfig::for_project(root));
        (project, catalog, diagnosis, ledger)
    }

    #[test]
    fn test_verification_rule() {
        let before: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();

        assert_eq!(classify_verification(true, "a", &before, &set(&["a"])), VerifyResult::Success);
        assert_eq!(classify_verification(false, "a", &before, &set(&["a", "b"])), VerifyResult::Failed);
        assert_eq!(classify_verification(false, "a", &before, &set(&["a"])), VerifyResult::Partial);
        assert_eq!(classify_verification(false, "a", &before, &set(&["c"])), VerifyResult::NewErrors);
        assert_eq!(classify_verification(false, "a", &before, &set(&["b"])), VerifyResult::Partial);
    }

    #[test]
    fn test_confirmation_policy() {
        let install = FixAction::install_package("zlib1g-dev");
        let risk = assess(&install);
        let mut config = SessionConfig::default();
        assert!(needs_confirmation(&install, &risk, &config));

        config.auto_apply = true;
        config.max_auto_risk = RiskLevel::Medium;
        assert!(needs_confirmation(&install, &risk, &config));

        config.max_auto_risk = RiskLevel::High;
        assert!(!needs_confirmation(&install, &risk, &config));

        let retry = FixAction::retry();
        assert!(!needs_confirmation(&retry, &assess(&retry), &SessionConfig::default()));
    }

    #[test]
    fn test_denied_fix_is_skipped() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let builder = ScriptedBuilder::new(vec![BuildResult::success("ok", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &DenyAll,
            tools: None,
        };
        let mut session = FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default());
        let results = session.apply(&[FixAction::create_file("zlib.h", "")], true, false);
        assert_eq!(results[0].result, FixResult::Skipped);
        assert!(!dir.path().join("zlib.h").exists());
        assert!(builder.calls.borrow().is_empty());
    }

    #[test]
    fn test_file_fix_is_verified_and_recorded() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let mut history = FixHistory::in_memory(dir.path().join("h.json"));
        let builder = ScriptedBuilder::new(vec![BuildResult::success("ok", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        let fix = FixAction::create_file("zlib.h", "#pragma once\n");
        {
            let mut session =
                FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default())
                    .with_history(&mut history);
            let results = session.apply(&[fix.clone(), FixAction::retry()], true, false);
            assert_eq!(results.len(), 1, "stops after a clean build");
            assert_eq!(results[0].verify, VerifyResult::Success);
            assert_eq!(results[0].state, FixState::Verified);
            assert_eq!(session.summary().verified, 1);
        }
        assert_eq!(fs::read_to_string(dir.path().join("zlib.h")).unwrap(), "#pragma once\n");
        assert_eq!(history.suggest(&diagnosis), Some(fix));
    }

    #[test]
    fn test_failed_verification_rolls_back() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let config_file = dir.path().join("config.h");
        fs::write(&config_file, "original\n").unwrap();

        let builder = ScriptedBuilder::new(vec![BuildResult::failure(HEADER_ERROR, 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        let mut session = FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default());
        let results = session.apply(&[FixAction::modify_file("config.h", "broken\n")], true, false);

        assert_eq!(results[0].verify, VerifyResult::Failed);
        assert_eq!(results[0].state, FixState::Reverted);
        assert!(results[0].rolled_back);
        assert_eq!(fs::read_to_string(&config_file).unwrap(), "original\n");
    }

    #[test]
    fn test_env_fix_reaches_rebuild_and_rolls_back() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let builder = ScriptedBuilder::new(vec![BuildResult::failure("virtual memory exhausted", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        let mut session = FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default());
        session.apply(&[FixAction::set_env("MAKEFLAGS", "-j1")], true, false);

        let calls = builder.calls.borrow();
        assert_eq!(calls[0].env.get("MAKEFLAGS").map(String::as_str), Some("-j1"));
        assert_eq!(session.results()[0].verify, VerifyResult::NewErrors);

        session.rollback_all();
        assert!(session.build_options().env.get("MAKEFLAGS").is_none());
    }

    #[test]
    fn test_regressing_fix_is_not_counted_as_verified() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let builder = ScriptedBuilder::new(vec![BuildResult::failure("virtual memory exhausted", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        let mut session = FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default());
        session.apply(&[FixAction::set_env("MAKEFLAGS", "-j1")], true, false);

        let result = &session.results()[0];
        assert_eq!(result.verify, VerifyResult::NewErrors);
        assert_eq!(result.state, FixState::Verified);
        assert!(!result.is_verified());
        assert_eq!(session.summary().verified, 0);
        assert_eq!(session.summary().applied, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_rollback_all_marks_only_reversed_fixes() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let builder = ScriptedBuilder::new(vec![BuildResult::success("ok", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        let mut session = FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default());
        session.apply(
            &[
                FixAction::run_command("true", "no-op"),
                FixAction::create_file("zlib.h", "#pragma once\n"),
            ],
            false,
            false,
        );
        assert!(session.results().iter().all(|r| r.is_applied()));

        assert_eq!(session.rollback_all(), 1);
        let results = session.results();
        assert!(!results[0].rolled_back);
        assert_eq!(results[0].state, FixState::Applied);
        assert!(results[1].rolled_back);
        assert_eq!(results[1].state, FixState::Reverted);
        assert_eq!(session.summary().rolled_back, 1);
        assert!(!dir.path().join("zlib.h").exists());
    }

    #[test]
    fn test_invalid_fix_stops_when_requested() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let builder = ScriptedBuilder::new(vec![BuildResult::success("ok", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        let mut session = FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default());
        let results = session.apply(
            &[FixAction::create_file("no/such/dir/x.h", ""), FixAction::retry()],
            true,
            true,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result, FixResult::Skipped);
    }

    #[test]
    fn test_uninstallable_package_is_skipped_without_history() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let mut history = FixHistory::in_memory(dir.path().join("h.json"));
        let builder = ScriptedBuilder::new(vec![BuildResult::success("ok", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        {
            let mut session =
                FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default())
                    .with_history(&mut history);
            let results = session.apply(&[FixAction::install_package("zlib1g-dev")], true, false);
            assert_eq!(results[0].result, FixResult::Skipped);
            assert_eq!(results[0].state, FixState::Skipped);
            assert_eq!(session.summary().failed, 0);
        }
        assert!(history.entries().is_empty());
        assert!(ledger.entries().is_empty());
        assert!(builder.calls.borrow().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_is_recorded_as_failure() {
        let dir = tempdir().unwrap();
        let (project, catalog, diagnosis, mut ledger) = setup(dir.path());
        let mut history = FixHistory::in_memory(dir.path().join("h.json"));
        let builder = ScriptedBuilder::new(vec![BuildResult::success("ok", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        {
            let mut session =
                FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default())
                    .with_history(&mut history);
            let results = session.apply(&[FixAction::run_command("exit 3", "fail")], true, false);
            assert_eq!(results[0].result, FixResult::Failed);
            assert!(results[0].message.contains("exited"));
        }
        assert_eq!(history.entries()[0].failure_count, 1);
        assert_eq!(ledger.entries()[0].op, LedgerOp::Command);
    }

    #[test]
    fn test_clean_build_removes_build_dir() {
        let dir = tempdir().unwrap();
        let project = ProjectContext::new(dir.path(), Language::Cpp, BuildSystem::CMake);
        let catalog = Catalog::builtin();
        let diagnosis = Diagnoser::new(&catalog).diagnose("Error: could not load cache", Some(&project));
        let mut ledger = RollbackLedger::new(LedgerConfig::for_project(dir.path()));
        fs::create_dir_all(project.build_dir.join("CMakeFiles")).unwrap();

        let builder = ScriptedBuilder::new(vec![BuildResult::success("ok", 1)]);
        let collab = Collaborators {
            builder: &builder,
            permissions: &AutoApprove,
            tools: None,
        };
        let mut session = FixSession::new(&project, &diagnosis, &catalog, &mut ledger, collab, SessionConfig::default());
        let results = session.apply(&[FixAction::clean_build(None)], true, false);
        assert_eq!(results[0].verify, VerifyResult::Success);
        assert!(!project.build_dir.exists());
    }

    #[test]
    fn test_set_minimum_version() {
        let cmake = "cmake_minimum_required(VERSION 2.8.12)\nproject(demo)\n";
        assert_eq!(
            set_minimum_version(cmake, "3.5"),
            "cmake_minimum_required(VERSION 3.5)\nproject(demo)\n"
        );
        let ranged = "CMAKE_MINIMUM_REQUIRED(VERSION 3.1...3.20)\n";
        assert_eq!(set_minimum_version(ranged, "3.10"), "cmake_minimum_required(VERSION 3.10)\n");
        assert_eq!(
            set_minimum_version("cmake_minimum_required(VERSION 3.20)\n", "3.16.3"),
            "cmake_minimum_required(VERSION 3.16.3)\n"
        );
        assert_eq!(
            set_minimum_version("project(x)\n", "3.5"),
            "cmake_minimum_required(VERSION 3.5)\nproject(x)\n"
        );
    }
}
