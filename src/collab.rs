//! Collaborator contracts
//!
//! The engine never builds, prompts, installs or asks a model on its own; it
//! goes through these traits. Default adapters used by the CLI live here too.

use crate::project::ProjectContext;
use crate::sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxResult};
use crate::util::{combine_output, truncate};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Unavailable(String),
    #[error("`{command}` exited with {code:?}: {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

/// How to run the project's build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Shell command line; empty means "use the build system default".
    pub command: String,
    /// Environment layered over the inherited one. Fixes add to it.
    pub env: BTreeMap<String, String>,
}

impl BuildOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

/// Outcome of one build run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl BuildResult {
    pub fn success(stdout: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn failure(stderr: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            exit_code: Some(1),
            stderr: stderr.into(),
            duration_ms,
            ..Default::default()
        }
    }

    /// Combined output, the text the diagnoser reads.
    pub fn output(&self) -> String {
        combine_output(&self.stdout, &self.stderr)
    }
}

pub trait BuildExecutor {
    fn run_build(
        &self,
        project: &ProjectContext,
        opts: &BuildOptions,
    ) -> Result<BuildResult, CollabError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

pub trait PermissionProvider {
    fn confirm(&self, action: &str, target: &str, reason: &str) -> Decision;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub path: PathBuf,
    pub version: Option<String>,
}

pub trait ToolRegistry {
    fn find_tool(&self, name: &str) -> Option<ToolInfo>;
    fn install_package(&self, name: &str) -> Result<SandboxResult, CollabError>;

    /// Whether `install_package` has any way to succeed.
    fn can_install(&self) -> bool {
        true
    }
}

pub trait Advisor {
    fn query(&self, prompt: &str) -> Result<String, CollabError>;
}

/// Runs the configured build command in the sandbox.
#[derive(Debug, Clone, Default)]
pub struct CommandBuildExecutor {
    sandbox: SandboxConfig,
}

impl CommandBuildExecutor {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self { sandbox }
    }
}

/// Build command for a detected build system.
pub fn default_build_command(project: &ProjectContext) -> Option<String> {
    use crate::project::BuildSystem;

    let build_dir = project.build_dir.display();
    let cmd = match project.build_system {
        BuildSystem::CMake => format!("cmake -S . -B {0} && cmake --build {0}", build_dir),
        BuildSystem::Meson => format!("meson setup {0} --reconfigure && meson compile -C {0}", build_dir),
        BuildSystem::Make => "make".to_string(),
        BuildSystem::Cargo => "cargo build".to_string(),
        BuildSystem::Npm => "npm run build".to_string(),
        BuildSystem::Pip => "python3 -m pip install -e .".to_string(),
        BuildSystem::Go => "go build ./...".to_string(),
        BuildSystem::Unknown => return None,
    };
    Some(cmd)
}

impl BuildExecutor for CommandBuildExecutor {
    fn run_build(
        &self,
        project: &ProjectContext,
        opts: &BuildOptions,
    ) -> Result<BuildResult, CollabError> {
        let command = if opts.command.trim().is_empty() {
            default_build_command(project).ok_or_else(|| {
                CollabError::Unavailable(format!(
                    "no build command given and none known for {}",
                    project.build_system.name()
                ))
            })?
        } else {
            opts.command.clone()
        };

        let mut config = self.sandbox.clone();
        config
            .env
            .extend(opts.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::info!(command = %command, root = %project.root.display(), "running build");
        let start = Instant::now();
        let result = Sandbox::new(config).run_shell(&command, &project.root)?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut stderr = result.stderr;
        if let Some(reason) = &result.kill_reason {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("buildmedic: build killed: {}\n", reason));
        }

        Ok(BuildResult {
            success: result.success,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr,
            duration_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl PermissionProvider for AutoApprove {
    fn confirm(&self, action: &str, target: &str, _reason: &str) -> Decision {
        tracing::debug!(action, target, "auto-approved");
        Decision::Allow
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl PermissionProvider for DenyAll {
    fn confirm(&self, action: &str, target: &str, _reason: &str) -> Decision {
        tracing::debug!(action, target, "denied");
        Decision::Deny
    }
}

/// Interactive y/N prompt on stderr; anything but yes is a denial.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

impl PermissionProvider for StdinPrompt {
    fn confirm(&self, action: &str, target: &str, reason: &str) -> Decision {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\n{}", action);
        if !target.is_empty() {
            let _ = write!(stderr, " ({})", target);
        }
        if !reason.is_empty() {
            let _ = write!(stderr, "\n  {}", reason);
        }
        let _ = write!(stderr, "\nApply? [y/N] ");
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) if parse_yes(&line) => Decision::Allow,
            _ => Decision::Deny,
        }
    }
}

fn parse_yes(line: &str) -> bool {
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Finds tools on `PATH`; installs through a configured command template.
#[derive(Debug, Clone, Default)]
pub struct PathToolRegistry {
    /// e.g. `apt-get install -y {package}`.
    install_command: Option<String>,
    search_path: Option<Vec<PathBuf>>,
    sandbox: SandboxConfig,
}

impl PathToolRegistry {
    pub fn new(install_command: Option<String>) -> Self {
        Self {
            install_command,
            ..Default::default()
        }
    }

    /// Search these directories instead of `PATH`.
    pub fn with_search_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_path = Some(dirs);
        self
    }

    fn dirs(&self) -> Vec<PathBuf> {
        match &self.search_path {
            Some(dirs) => dirs.clone(),
            None => std::env::var_os("PATH")
                .map(|path| std::env::split_paths(&path).collect())
                .unwrap_or_default(),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Package names go into a shell command line, so keep them boring.
fn is_safe_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._+:@/-".contains(c))
}

impl ToolRegistry for PathToolRegistry {
    fn find_tool(&self, name: &str) -> Option<ToolInfo> {
        let candidates: Vec<String> = if cfg!(windows) {
            vec![format!("{}.exe", name), format!("{}.cmd", name), name.to_string()]
        } else {
            vec![name.to_string()]
        };
        self.dirs().into_iter().find_map(|dir| {
            candidates
                .iter()
                .map(|file| dir.join(file))
                .find(|path| is_executable(path))
                .map(|path| ToolInfo {
                    name: name.to_string(),
                    path,
                    version: None,
                })
        })
    }

    fn install_package(&self, name: &str) -> Result<SandboxResult, CollabError> {
        let template = self.install_command.as_deref().ok_or_else(|| {
            CollabError::Unavailable("no install command configured".to_string())
        })?;
        if !is_safe_package_name(name) {
            return Err(CollabError::Unavailable(format!(
                "refusing to install suspicious package name {:?}",
                name
            )));
        }
        let command = if template.contains("{package}") {
            template.replace("{package}", name)
        } else {
            format!("{} {}", template, name)
        };
        let cwd = std::env::current_dir()?;
        tracing::info!(command = %command, "installing package");
        let result = Sandbox::new(self.sandbox.clone()).run_shell(&command, &cwd)?;
        if !result.success {
            return Err(CollabError::CommandFailed {
                command,
                code: result.exit_code,
                output: truncate(&result.output(), 2000),
            });
        }
        Ok(result)
    }

    fn can_install(&self) -> bool {
        self.install_command.is_some()
    }
}

/// Pipes the prompt to an external command and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandAdvisor {
    command: String,
}

impl CommandAdvisor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Advisor for CommandAdvisor {
    fn query(&self, prompt: &str) -> Result<String, CollabError> {
        let (program, args) = crate::util::shell_invocation(&self.command);
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A closed pipe just means the advisor ignored its input.
            if let Err(err) = stdin.write_all(prompt.as_bytes()) {
                if err.kind() != io::ErrorKind::BrokenPipe {
                    return Err(err.into());
                }
            }
        }

        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(CollabError::CommandFailed {
                command: self.command.clone(),
                code: output.status.code(),
                output: truncate(&String::from_utf8_lossy(&output.stderr), 500),
            });
        }
        if stdout.is_empty() {
            return Err(CollabError::Unavailable("advisor returned nothing".to_string()));
        }
        Ok(stdout)
    }
}
