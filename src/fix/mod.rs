//! Fix actions and the pipeline stages that reason about them
//!
//! A [`FixAction`] is one concrete remedial step. The generator proposes
//! them, the risk assessor and validator judge them, and the session applies
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod risk;
pub mod solutions;
pub mod validate;

pub use risk::{assess, RiskAssessment, RiskLevel};
pub use validate::{FixValidator, ValidationResult, ValidationStatus};

/// The closed set of effects a fix can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    InstallPackage,
    CreateFile,
    ModifyFile,
    SetEnvVar,
    RunCommand,
    CleanBuild,
    FixBuildConfigVersion,
    Retry,
    None,
}

impl FixKind {
    pub fn slug(&self) -> &'static str {
        match self {
            FixKind::InstallPackage => "install_package",
            FixKind::CreateFile => "create_file",
            FixKind::ModifyFile => "modify_file",
            FixKind::SetEnvVar => "set_env_var",
            FixKind::RunCommand => "run_command",
            FixKind::CleanBuild => "clean_build",
            FixKind::FixBuildConfigVersion => "fix_build_config_version",
            FixKind::Retry => "retry",
            FixKind::None => "none",
        }
    }

    /// Whether applying this kind writes to a single target file.
    pub fn touches_file(&self) -> bool {
        matches!(
            self,
            FixKind::CreateFile | FixKind::ModifyFile | FixKind::FixBuildConfigVersion
        )
    }
}

impl fmt::Display for FixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAction {
    pub kind: FixKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// File path, package name, or environment variable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// File content, variable value, or required version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl FixAction {
    fn base(kind: FixKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            command: None,
            target: None,
            value: None,
            requires_confirmation: false,
        }
    }

    pub fn install_package(package: &str) -> Self {
        Self {
            target: Some(package.to_string()),
            requires_confirmation: true,
            ..Self::base(FixKind::InstallPackage, format!("Install package {}", package))
        }
    }

    pub fn create_file(path: &str, content: &str) -> Self {
        Self {
            target: Some(path.to_string()),
            value: Some(content.to_string()),
            requires_confirmation: true,
            ..Self::base(FixKind::CreateFile, format!("Create {}", path))
        }
    }

    pub fn modify_file(path: &str, content: &str) -> Self {
        Self {
            target: Some(path.to_string()),
            value: Some(content.to_string()),
            requires_confirmation: true,
            ..Self::base(FixKind::ModifyFile, format!("Rewrite {}", path))
        }
    }

    pub fn set_env(name: &str, value: &str) -> Self {
        Self {
            target: Some(name.to_string()),
            value: Some(value.to_string()),
            ..Self::base(FixKind::SetEnvVar, format!("Set {}={}", name, value))
        }
    }

    pub fn run_command(command: &str, description: impl Into<String>) -> Self {
        Self {
            command: Some(command.to_string()),
            requires_confirmation: true,
            ..Self::base(FixKind::RunCommand, description)
        }
    }

    /// Clean build outputs, via the build tool's own command when it has one.
    pub fn clean_build(command: Option<&str>) -> Self {
        Self {
            command: command.map(str::to_string),
            ..Self::base(FixKind::CleanBuild, "Clean build artifacts and rebuild")
        }
    }

    pub fn fix_build_config_version(file: &str, version: &str) -> Self {
        Self {
            target: Some(file.to_string()),
            value: Some(version.to_string()),
            requires_confirmation: true,
            ..Self::base(
                FixKind::FixBuildConfigVersion,
                format!("Set minimum build tool version in {} to {}", file, version),
            )
        }
    }

    pub fn retry() -> Self {
        Self::base(FixKind::Retry, "Retry the build")
    }

    pub fn none(description: impl Into<String>) -> Self {
        Self::base(FixKind::None, description)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Two actions with the same kind, target and command do the same thing.
    pub fn same_effect(&self, other: &FixAction) -> bool {
        self.kind == other.kind && self.target == other.target && self.command == other.command
    }

    /// Target if present, otherwise command, otherwise empty.
    pub fn subject(&self) -> &str {
        self.target
            .as_deref()
            .or(self.command.as_deref())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_confirmation_defaults() {
        assert!(FixAction::install_package("libsdl2-dev").requires_confirmation);
        assert!(FixAction::create_file("a.txt", "").requires_confirmation);
        assert!(FixAction::run_command("make", "run make").requires_confirmation);
        assert!(!FixAction::set_env("CC", "gcc").requires_confirmation);
        assert!(!FixAction::retry().requires_confirmation);
        assert!(!FixAction::clean_build(None).requires_confirmation);
    }

    #[test]
    fn test_same_effect_ignores_description() {
        let a = FixAction::install_package("zlib1g-dev");
        let b = FixAction::install_package("zlib1g-dev").with_description("other words");
        let c = FixAction::install_package("libssl-dev");
        assert!(a.same_effect(&b));
        assert!(!a.same_effect(&c));
    }

    #[test]
    fn test_serializes_kind_as_snake_case() {
        let json = serde_json::to_string(&FixAction::retry()).unwrap();
        assert!(json.contains("\"kind\":\"retry\""));
        assert!(!json.contains("target"));
    }
}
