//! Recovery orchestration
//!
//! The retry loop: build, diagnose, apply fixes through a one-shot
//! [`FixSession`], rebuild, and back off exponentially until the build
//! succeeds or the attempt budget runs out.

use crate::collab::{
    Advisor, BuildExecutor, BuildOptions, BuildResult, Decision, PermissionProvider, ToolRegistry,
};
use crate::diagnose::{Catalog, Diagnoser};
use crate::fix::RiskLevel;
use crate::history::FixHistory;
use crate::project::ProjectContext;
use crate::rollback::{LedgerConfig, RollbackLedger};
use crate::sandbox::SandboxConfig;
use crate::session::{
    Collaborators, FixApplicationResult, FixResult, FixSession, SessionConfig, SessionSummary,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use uuid::Uuid;


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryStrategy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub use_ai_analysis: bool,
    pub auto_apply_fixes: bool,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            use_ai_analysis: true,
            auto_apply_fixes: false,
        }
    }
}

/// `min(base * multiplier^attempt, max)` in milliseconds.
pub fn backoff_delay(attempt: u32, base_ms: u64, multiplier: f64, max_ms: u64) -> u64 {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay = base_ms as f64 * multiplier.powi(exponent);
    if !delay.is_finite() || delay >= max_ms as f64 {
        return max_ms;
    }
    delay.max(0.0) as u64
}

/// Per-run counters plus the optional collaborators diagnosis may use.
pub struct RecoveryContext<'a> {
    pub strategy: RecoveryStrategy,
    pub total_attempts: u32,
    pub successful_recoveries: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub advisor: Option<&'a dyn Advisor>,
    pub tools: Option<&'a dyn ToolRegistry>,
}

impl<'a> RecoveryContext<'a> {
    pub fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            total_attempts: 0,
            successful_recoveries: 0,
            last_attempt: None,
            advisor: None,
            tools: None,
        }
    }

    pub fn with_advisor(mut self, advisor: &'a dyn Advisor) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_tools(mut self, tools: &'a dyn ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub run_id: Uuid,
    pub success: bool,
    pub attempts: u32,
    pub recoveries: u32,
    pub summary: SessionSummary,
    pub fixes: Vec<FixApplicationResult>,
}

impl RecoveryReport {
    pub fn display(&self) -> String {
        let mut out = format!(
            "{} after {} attempt(s): {} applied, {} failed, {} skipped, {} rolled back (run {})",
            if self.success { "Build succeeded" } else { "Build still failing" },
            self.attempts,
            self.summary.applied,
            self.summary.failed,
            self.summary.skipped,
            self.summary.rolled_back,
            self.run_id,
        );
        for fix in &self.fixes {
            out.push_str(&format!(
                "\n  [{}] {} ({})",
                fix.state, fix.action.description, fix.risk.level
            ));
            if !fix.message.is_empty() {
                out.push_str(&format!(": {}", fix.message));
            }
        }
        out
    }
}

pub struct Recovery<'a> {
    run_id: Uuid,
    catalog: Catalog,
    ledger: RollbackLedger,
    history: Option<&'a mut FixHistory>,
    builder: &'a dyn BuildExecutor,
    permissions: &'a dyn PermissionProvider,
    session: SessionConfig,
    sandbox: SandboxConfig,
    build: BuildOptions,
    fixes: Vec<FixApplicationResult>,
}

impl<'a> Recovery<'a> {
    pub fn new(
        builder: &'a dyn BuildExecutor,
        permissions: &'a dyn PermissionProvider,
        ledger: LedgerConfig,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            catalog: Catalog::builtin(),
            ledger: RollbackLedger::new(ledger),
            history: None,
            builder,
            permissions,
            session: SessionConfig::default(),
            sandbox: SandboxConfig::default(),
            build: BuildOptions::default(),
            fixes: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: &'a mut FixHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Identifies this recovery run in logs and reports.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn ledger(&self) -> &RollbackLedger {
        &self.ledger
    }

    /// Build options as left by the last session, environment fixes included.
    pub fn build_options(&self) -> &BuildOptions {
        &self.build
    }

    /// Every fix result across all attempts so far.
    pub fn fix_results(&self) -> &[FixApplicationResult] {
        &self.fixes
    }

    /// Purge expired ledger entries. Only between sessions.
    pub fn cleanup(&mut self) -> usize {
        self.ledger.cleanup()
    }

    /// Undo everything the ledger can still undo, newest first.
    pub fn rollback_all(&mut self) -> usize {
        self.ledger.rollback_from(0)
    }

    fn run_build(&self, project: &ProjectContext) -> BuildResult {
        match self.builder.run_build(project, &self.build) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "build could not run");
                BuildResult::failure(format!("build could not run: {}", err), 0)
            }
        }
    }

    /// One diagnose-fix-rebuild cycle for `failed`.
    ///
    /// `None` when nothing was applied; the caller decides whether to
    /// rebuild anyway.
    pub fn attempt(
        &mut self,
        ctx: &mut RecoveryContext<'_>,
        failed: &BuildResult,
        project: &ProjectContext,
    ) -> Option<BuildResult> {
        ctx.total_attempts += 1;
        ctx.last_attempt = Some(Utc::now());

        let diagnosis = {
            let mut diagnoser = Diagnoser::new(&self.catalog);
            if ctx.strategy.use_ai_analysis {
                if let Some(advisor) = ctx.advisor {
                    diagnoser = diagnoser.with_advisor(advisor);
                }
            }
            if let Some(history) = self.history.as_deref() {
                diagnoser = diagnoser.with_history(history);
            }
            diagnoser.diagnose(&failed.output(), Some(project))
        };
        tracing::info!(
            run_id = %self.run_id,
            attempt = ctx.total_attempts,
            kind = %diagnosis.kind,
            confidence = diagnosis.confidence,
            fixes = diagnosis.fixes.len(),
            "diagnosed failure"
        );

        if diagnosis.fixes.is_empty() {
            tracing::info!(kind = %diagnosis.kind, "no automatic fix for this failure");
            return None;
        }

        let mut session_config = self.session.clone();
        if ctx.strategy.auto_apply_fixes {
            session_config.auto_apply = true;
        } else {
            let listing = diagnosis
                .fixes
                .iter()
                .map(|fix| format!("- {}", fix.description))
                .collect::<Vec<_>>()
                .join("\n");
            let decision = self.permissions.confirm(
                &format!("Apply {} fix(es) for: {}", diagnosis.fixes.len(), diagnosis.diagnosis),
                &listing,
                "Approving the batch covers every fix below critical risk",
            );
            if decision == Decision::Deny {
                tracing::info!("fix batch declined");
                return None;
            }
            session_config.auto_apply = true;
            session_config.max_auto_risk = RiskLevel::High;
        }

        let collab = Collaborators {
            builder: self.builder,
            permissions: self.permissions,
            tools: ctx.tools,
        };
        let (applied, verified_build, summary) = {
            let mut session = FixSession::new(
                project,
                &diagnosis,
                &self.catalog,
                &mut self.ledger,
                collab,
                session_config.clone(),
            )
            .with_sandbox(self.sandbox.clone())
            .with_build_options(self.build.clone());
            if let Some(history) = self.history.as_deref_mut() {
                session = session.with_history(history);
            }

            session.apply(
                &diagnosis.fixes,
                session_config.verify_each,
                session_config.stop_on_failure,
            );
            self.fixes.extend(session.results().iter().cloned());
            self.build = session.build_options().clone();
            let applied = session.results().iter().any(|r| r.is_applied() && !r.rolled_back);
            (applied, session.last_build().cloned(), session.summary())
        };
        tracing::debug!(?summary, "session finished");

        if !applied {
            return None;
        }

        let result = match verified_build {
            Some(build) if build.success => build,
            _ => {
                if session_config.settle_delay_ms > 0 {
                    thread::sleep(Duration::from_millis(session_config.settle_delay_ms));
                }
                self.run_build(project)
            }
        };
        if result.success {
            ctx.successful_recoveries += 1;
            tracing::info!(attempt = ctx.total_attempts, "build recovered");
        }
        Some(result)
    }

    /// Run the build, recovering with up to `ctx.strategy.max_retries`
    /// attempts. Returns the last observed result.
    pub fn build_with_retry(
        &mut self,
        ctx: &mut RecoveryContext<'_>,
        project: &ProjectContext,
        opts: &BuildOptions,
    ) -> BuildResult {
        self.build = opts.clone();
        let mut last = self.run_build(project);
        if last.success {
            return last;
        }

        for attempt in 0..ctx.strategy.max_retries {
            let delay = backoff_delay(
                attempt,
                ctx.strategy.base_delay_ms,
                ctx.strategy.backoff_multiplier,
                ctx.strategy.max_delay_ms,
            );
            tracing::info!(attempt = attempt + 1, delay_ms = delay, "build failed; retrying");
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }

            last = match self.attempt(ctx, &last, project) {
                Some(result) => result,
                None => self.run_build(project),
            };
            if last.success {
                break;
            }
        }
        last
    }

    pub fn report(&self, ctx: &RecoveryContext<'_>, success: bool) -> RecoveryReport {
        let mut summary = SessionSummary::default();
        for fix in &self.fixes {
            match fix.result {
                FixResult::Applied => summary.applied += 1,
                FixResult::Failed => summary.failed += 1,
                FixResult::Skipped => summary.skipped += 1,
            }
            if fix.is_verified() {
                summary.verified += 1;
            }
            if fix.rolled_back {
                summary.rolled_back += 1;
            }
        }
        RecoveryReport {
            run_id: self.run_id,
            success,
            attempts: ctx.total_attempts,
            recoveries: ctx.successful_recoveries,
            summary,
            fixes: self.fixes.clone(),
        }
    }
}
