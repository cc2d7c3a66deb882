//! Configuration management for buildmedic
//!
//! Stores settings in ~/.config/buildmedic/config.json

use crate::recovery::RecoveryStrategy;
use crate::rollback::LedgerConfig;
use crate::sandbox::{SandboxConfig, SandboxLevel};
use crate::session::SessionConfig;
use crate::util::write_atomic;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub strategy: RecoveryStrategy,
    pub session: SessionConfig,
    pub sandbox: SandboxSettings,
    pub ledger: LedgerSettings,
    /// Overrides `<data_dir>/buildmedic/fix_history.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_path: Option<PathBuf>,
    /// Package install template; `{package}` is substituted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,
    /// Command that receives advisory prompts on stdin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisor_command: Option<String>,
}

/// Level plus per-cap overrides; unset caps take the level's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub level: SandboxLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_open_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_network: Option<bool>,
}

impl SandboxSettings {
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::for_level(self.level);
        if self.max_cpu_secs.is_some() {
            config.max_cpu_secs = self.max_cpu_secs;
        }
        if self.max_memory_bytes.is_some() {
            config.max_memory_bytes = self.max_memory_bytes;
        }
        if self.max_open_files.is_some() {
            config.max_open_files = self.max_open_files;
        }
        if let Some(allow) = self.allow_network {
            config.allow_network = allow;
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub memory_threshold: usize,
    pub max_entries: usize,
    pub retention_days: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        let defaults = LedgerConfig::for_project(Path::new("."));
        Self {
            memory_threshold: defaults.memory_threshold,
            max_entries: defaults.max_entries,
            retention_days: defaults.retention_days,
        }
    }
}

impl LedgerSettings {
    pub fn for_project(&self, root: &Path) -> LedgerConfig {
        LedgerConfig {
            memory_threshold: self.memory_threshold,
            max_entries: self.max_entries,
            retention_days: self.retention_days,
            ..LedgerConfig::for_project(root)
        }
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("buildmedic"))
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load from the default location with environment overrides applied.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Load config from `path`, or return defaults.
    ///
    /// A file that fails to parse is moved aside to `*.json.corrupt`.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().context("Could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(error = %e, "failed to set config directory permissions");
                }
            }
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_atomic(path, content.as_bytes())
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// `BUILDMEDIC_HISTORY`, `BUILDMEDIC_MAX_RETRIES` and `BUILDMEDIC_AUTO_APPLY`
    /// take precedence over the file. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("BUILDMEDIC_HISTORY").filter(|v| !v.trim().is_empty()) {
            self.history_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = var("BUILDMEDIC_MAX_RETRIES") {
            match raw.trim().parse() {
                Ok(n) => self.strategy.max_retries = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid BUILDMEDIC_MAX_RETRIES"),
            }
        }
        if let Some(raw) = var("BUILDMEDIC_AUTO_APPLY") {
            match parse_flag(&raw) {
                Some(flag) => self.strategy.auto_apply_fixes = flag,
                None => tracing::warn!(value = %raw, "ignoring invalid BUILDMEDIC_AUTO_APPLY"),
            }
        }
    }

    /// Configured history path, else the platform data directory.
    pub fn history_file(&self) -> Option<PathBuf> {
        self.history_path
            .clone()
            .or_else(crate::history::FixHistory::default_path)
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/buildmedic/config.json".to_string())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::RiskLevel;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.strategy.max_retries, 3);
        assert!(!config.strategy.auto_apply_fixes);
        assert!(config.history_path.is_none());
        assert_eq!(config.sandbox.level, SandboxLevel::None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut config = Config::default();
        config.strategy.max_retries = 7;
        config.session.max_auto_risk = RiskLevel::Medium;
        config.install_command = Some("apt-get install -y {package}".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded.strategy.max_retries, 7);
        assert_eq!(loaded.session.max_auto_risk, RiskLevel::Medium);
        assert_eq!(loaded.install_command.as_deref(), Some("apt-get install -y {package}"));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        Config::default().save_to(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file_is_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded.strategy.max_retries, 3);
        assert!(!path.exists());
        let saved = fs::read_to_string(path.with_extension("json.corrupt")).unwrap();
        assert_eq!(saved, "{ not json");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"sandbox": {"level": "medium", "max_cpu_secs": 30}}"#).unwrap();

        let config = Config::load_from(&path);
        let sandbox = config.sandbox.to_sandbox_config();
        assert_eq!(sandbox.level, SandboxLevel::Medium);
        assert_eq!(sandbox.max_cpu_secs, Some(30));
        assert_eq!(
            sandbox.max_memory_bytes,
            SandboxConfig::for_level(SandboxLevel::Medium).max_memory_bytes
        );
        assert!(config.session.auto_rollback);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "BUILDMEDIC_HISTORY" => Some("/tmp/h.json".to_string()),
            "BUILDMEDIC_MAX_RETRIES" => Some("9".to_string()),
            "BUILDMEDIC_AUTO_APPLY" => Some("yes".to_string()),
            _ => None,
        });
        assert_eq!(config.history_path, Some(PathBuf::from("/tmp/h.json")));
        assert_eq!(config.strategy.max_retries, 9);
        assert!(config.strategy.auto_apply_fixes);

        config.apply_overrides(|name| match name {
            "BUILDMEDIC_MAX_RETRIES" => Some("lots".to_string()),
            "BUILDMEDIC_AUTO_APPLY" => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(config.strategy.max_retries, 9);
        assert!(config.strategy.auto_apply_fixes);
    }

    #[test]
    fn test_ledger_settings_target_project() {
        let settings = LedgerSettings {
            retention_days: 2,
            ..LedgerSettings::default()
        };
        let ledger = settings.for_project(Path::new("/work/app"));
        assert_eq!(ledger.retention_days, 2);
        assert!(ledger.backup_dir.starts_with("/work/app"));
    }
}
