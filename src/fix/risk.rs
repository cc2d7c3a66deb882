//! Risk assessment for fix actions

use super::{FixAction, FixKind};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn label(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub description: String,
    pub requires_confirmation: bool,
    pub requires_backup: bool,
    pub is_reversible: bool,
    pub affected_files: Vec<String>,
}

impl RiskAssessment {
    fn new(level: RiskLevel, description: impl Into<String>) -> Self {
        Self {
            level,
            description: description.into(),
            requires_confirmation: false,
            requires_backup: false,
            is_reversible: false,
            affected_files: Vec::new(),
        }
    }
}

/// Substrings that mark a command as running with elevated privileges.
///
/// A heuristic for prompting, not a security boundary.
const PRIVILEGE_MARKERS: &[&str] = &["sudo", "su -c", "doas", "pkexec", "runas"];

pub fn escalates_privileges(command: &str) -> bool {
    let lowered = command.to_lowercase();
    PRIVILEGE_MARKERS.iter().any(|marker| {
        lowered.match_indices(marker).any(|(idx, _)| {
            let before = lowered[..idx].chars().next_back();
            let after = lowered[idx + marker.len()..].chars().next();
            is_boundary(before) && is_boundary(after)
        })
    })
}

fn is_boundary(ch: Option<char>) -> bool {
    match ch {
        None => true,
        Some(c) => !(c.is_alphanumeric() || c == '_' || c == '-'),
    }
}

/// Classify one action. Pure and deterministic.
pub fn assess(action: &FixAction) -> RiskAssessment {
    match action.kind {
        FixKind::Retry => RiskAssessment {
            is_reversible: true,
            ..RiskAssessment::new(RiskLevel::None, "Re-runs the build")
        },
        FixKind::None => RiskAssessment {
            is_reversible: true,
            ..RiskAssessment::new(RiskLevel::None, "No action taken")
        },
        FixKind::SetEnvVar => RiskAssessment {
            is_reversible: true,
            ..RiskAssessment::new(
                RiskLevel::Low,
                format!("Sets {} for subsequent builds", action.subject()),
            )
        },
        FixKind::CleanBuild => RiskAssessment::new(
            RiskLevel::Low,
            "Deletes build artifacts; they are regenerated by the next build",
        ),
        FixKind::CreateFile | FixKind::ModifyFile | FixKind::FixBuildConfigVersion => {
            RiskAssessment {
                requires_confirmation: true,
                requires_backup: true,
                is_reversible: true,
                affected_files: action.target.iter().cloned().collect(),
                ..RiskAssessment::new(
                    RiskLevel::Medium,
                    format!("Writes {}", action.subject()),
                )
            }
        }
        FixKind::InstallPackage => RiskAssessment {
            requires_confirmation: true,
            ..RiskAssessment::new(
                RiskLevel::High,
                format!("Installs system package {}", action.subject()),
            )
        },
        FixKind::RunCommand => {
            let command = action.command.as_deref().unwrap_or("");
            if escalates_privileges(command) {
                RiskAssessment {
                    requires_confirmation: true,
                    ..RiskAssessment::new(
                        RiskLevel::Critical,
                        format!("Runs `{}` with elevated privileges", command),
                    )
                }
            } else {
                RiskAssessment {
                    requires_confirmation: true,
                    ..RiskAssessment::new(RiskLevel::Medium, format!("Runs `{}`", command))
                }
            }
        }
    }
}
