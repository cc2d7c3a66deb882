//! Pre-flight feasibility checks
//!
//! Results are snapshots of the live environment and go stale as soon as the
//! filesystem changes; validate right before applying.

use super::{FixAction, FixKind};
use crate::collab::ToolRegistry;
use crate::project::ProjectContext;
use crate::sandbox::{path_allowed, SandboxConfig};
use crate::util::{is_dir_writable, resolve_target};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Passed,
    Warning,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub message: String,
    pub details: Vec<String>,
    pub can_proceed: bool,
    pub confidence: f64,
}

impl ValidationResult {
    pub fn passed(message: impl Into<String>, confidence: f64) -> Self {
        Self {
            status: ValidationStatus::Passed,
            message: message.into(),
            details: Vec::new(),
            can_proceed: true,
            confidence,
        }
    }

    pub fn warning(message: impl Into<String>, confidence: f64) -> Self {
        Self {
            status: ValidationStatus::Warning,
            can_proceed: true,
            ..Self::passed(message, confidence)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Failed,
            can_proceed: false,
            ..Self::passed(message, 0.0)
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Skipped,
            ..Self::passed(message, 0.5)
        }
    }

    /// Nothing could be checked and the fix cannot be carried out either.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Skipped,
            can_proceed: false,
            ..Self::passed(message, 0.0)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

/// Checks fix actions against the environment before they are attempted.
#[derive(Clone, Copy, Default)]
pub struct FixValidator<'a> {
    tools: Option<&'a dyn ToolRegistry>,
    sandbox: Option<&'a SandboxConfig>,
}

impl<'a> FixValidator<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(mut self, tools: &'a dyn ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Also reject file targets the sandbox would not allow writing.
    pub fn with_sandbox(mut self, sandbox: &'a SandboxConfig) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn validate(&self, action: Option<&FixAction>, project: &ProjectContext) -> ValidationResult {
        let Some(action) = action else {
            return ValidationResult::failed("No fix action provided");
        };

        match action.kind {
            FixKind::Retry => ValidationResult::passed("Retry needs no preparation", 1.0),
            FixKind::None => ValidationResult::skipped("Nothing to apply"),
            FixKind::SetEnvVar => validate_env_name(action),
            FixKind::CreateFile | FixKind::ModifyFile => self.validate_file_target(action, project),
            FixKind::FixBuildConfigVersion => {
                let file = self.validate_file_target(action, project);
                if !file.can_proceed {
                    return file;
                }
                let path = resolve_target(&project.root, action.subject());
                if !path.is_file() {
                    return ValidationResult::failed(format!(
                        "Build configuration {} does not exist",
                        path.display()
                    ));
                }
                self.validate_tool(action, project)
            }
            FixKind::InstallPackage if action.command.is_none() => self.validate_install(),
            FixKind::InstallPackage | FixKind::RunCommand => self.validate_tool(action, project),
            FixKind::CleanBuild => {
                if action.command.is_some() {
                    self.validate_tool(action, project)
                } else if project.build_dir.exists() {
                    ValidationResult::passed(
                        format!("Will remove {}", project.build_dir.display()),
                        0.9,
                    )
                } else {
                    ValidationResult::warning("Build directory does not exist; nothing to clean", 0.6)
                }
            }
        }
    }

    fn validate_file_target(&self, action: &FixAction, project: &ProjectContext) -> ValidationResult {
        let Some(target) = action.target.as_deref().filter(|t| !t.is_empty()) else {
            return ValidationResult::failed("File action has no target path");
        };
        let path = resolve_target(&project.root, target);

        if let Some(sandbox) = self.sandbox {
            if !path_allowed(sandbox, &path, true) {
                return ValidationResult::failed(format!(
                    "Sandbox does not allow writing {}",
                    path.display()
                ));
            }
        }

        let parent = path.parent().unwrap_or(Path::new("."));
        if !parent.is_dir() {
            return ValidationResult::failed(format!(
                "Parent directory {} does not exist",
                parent.display()
            ));
        }
        if !is_dir_writable(parent) {
            return ValidationResult::failed(format!(
                "Parent directory {} is not writable",
                parent.display()
            ));
        }
        if path.is_dir() {
            return ValidationResult::failed(format!("{} is a directory", path.display()));
        }

        ValidationResult::passed(format!("{} is writable", path.display()), 0.9)
    }

    /// A package fix without its own command needs a registry that can install.
    fn validate_install(&self) -> ValidationResult {
        match self.tools {
            Some(tools) if tools.can_install() => {
                ValidationResult::passed("Installation is delegated to the tool registry", 0.8)
            }
            Some(_) => ValidationResult::unavailable("No install command configured"),
            None => ValidationResult::unavailable("No tool registry available to install packages"),
        }
    }

    fn validate_tool(&self, action: &FixAction, project: &ProjectContext) -> ValidationResult {
        let Some(tool) = required_tool(action, project) else {
            return ValidationResult::failed("Fix has no command to run");
        };
        let Some(tools) = self.tools else {
            return ValidationResult::skipped(format!("No tool registry to look up {}", tool));
        };
        match tools.find_tool(&tool) {
            Some(info) => ValidationResult::passed(format!("{} found", tool), 0.9)
                .with_detail(info.path.display().to_string()),
            None => ValidationResult::warning(format!("{} not found on this system", tool), 0.4),
        }
    }
}

fn validate_env_name(action: &FixAction) -> ValidationResult {
    let name = action.target.as_deref().unwrap_or("");
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return ValidationResult::failed(format!("Invalid environment variable name {:?}", name));
    }
    ValidationResult::passed(format!("{} can be set", name), 1.0)
}

/// Executable an action depends on, if any.
fn required_tool(action: &FixAction, project: &ProjectContext) -> Option<String> {
    match action.kind {
        FixKind::FixBuildConfigVersion => {
            Some(project.build_system.tool().unwrap_or("cmake").to_string())
        }
        _ => action.command.as_deref().and_then(command_program),
    }
}

/// First word of a command line that is not a `VAR=value` assignment.
fn command_program(command: &str) -> Option<String> {
    command
        .split_whitespace()
        .find(|word| !word.contains('='))
        .map(|word| word.trim_matches(|c: char| c == '\'' || c == '"').to_string())
}
