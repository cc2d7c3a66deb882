//! Project context detection
//!
//! Figures out language and build system from marker files so diagnosis and
//! fix generation can specialize (e.g. pip vs. apt package names).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Primary language of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Rust,
    Python,
    Node,
    Go,
    #[default]
    Unknown,
}

impl Language {
    pub fn name(&self) -> &'static str {
        match self {
            Language::C => "C",
            Language::Cpp => "C++",
            Language::Rust => "Rust",
            Language::Python => "Python",
            Language::Node => "Node.js",
            Language::Go => "Go",
            Language::Unknown => "Unknown",
        }
    }
}

/// Build system driving the project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    CMake,
    Make,
    Meson,
    Cargo,
    Npm,
    Pip,
    Go,
    #[default]
    Unknown,
}

impl BuildSystem {
    pub fn name(&self) -> &'static str {
        match self {
            BuildSystem::CMake => "cmake",
            BuildSystem::Make => "make",
            BuildSystem::Meson => "meson",
            BuildSystem::Cargo => "cargo",
            BuildSystem::Npm => "npm",
            BuildSystem::Pip => "pip",
            BuildSystem::Go => "go",
            BuildSystem::Unknown => "unknown",
        }
    }

    /// Executable the build system needs on PATH.
    pub fn tool(&self) -> Option<&'static str> {
        match self {
            BuildSystem::CMake => Some("cmake"),
            BuildSystem::Make => Some("make"),
            BuildSystem::Meson => Some("meson"),
            BuildSystem::Cargo => Some("cargo"),
            BuildSystem::Npm => Some("npm"),
            BuildSystem::Pip => Some("pip"),
            BuildSystem::Go => Some("go"),
            BuildSystem::Unknown => None,
        }
    }

    /// Command that wipes build outputs, when the tool has one.
    pub fn clean_command(&self) -> Option<&'static str> {
        match self {
            BuildSystem::Make => Some("make clean"),
            BuildSystem::Cargo => Some("cargo clean"),
            BuildSystem::Go => Some("go clean -cache"),
            _ => None,
        }
    }
}

/// Everything the engine knows about the project being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    pub root: PathBuf,
    pub language: Language,
    pub build_system: BuildSystem,
    /// Out-of-tree build directory (CMake/Meson); defaults to `<root>/build`.
    pub build_dir: PathBuf,
}

impl ProjectContext {
    pub fn new(root: impl Into<PathBuf>, language: Language, build_system: BuildSystem) -> Self {
        let root = root.into();
        let build_dir = root.join("build");
        Self {
            root,
            language,
            build_system,
            build_dir,
        }
    }

    /// Detect project context from marker files in `root`.
    pub fn detect(root: &Path) -> Self {
        let build_system = detect_build_system(root);
        let language = detect_language(root, build_system);
        Self::new(root, language, build_system)
    }

    pub fn with_build_dir(mut self, build_dir: impl Into<PathBuf>) -> Self {
        self.build_dir = build_dir.into();
        self
    }

    /// Short label stored alongside fix history entries.
    pub fn project_type(&self) -> &'static str {
        self.language.name()
    }
}

fn detect_build_system(root: &Path) -> BuildSystem {
    if root.join("CMakeLists.txt").exists() {
        BuildSystem::CMake
    } else if root.join("meson.build").exists() {
        BuildSystem::Meson
    } else if root.join("Cargo.toml").exists() {
        BuildSystem::Cargo
    } else if root.join("package.json").exists() {
        BuildSystem::Npm
    } else if root.join("go.mod").exists() {
        BuildSystem::Go
    } else if root.join("pyproject.toml").exists()
        || root.join("setup.py").exists()
        || root.join("requirements.txt").exists()
    {
        BuildSystem::Pip
    } else if root.join("Makefile").exists() || root.join("makefile").exists() {
        BuildSystem::Make
    } else {
        BuildSystem::Unknown
    }
}

fn detect_language(root: &Path, build_system: BuildSystem) -> Language {
    match build_system {
        BuildSystem::Cargo => Language::Rust,
        BuildSystem::Npm => Language::Node,
        BuildSystem::Go => Language::Go,
        BuildSystem::Pip => Language::Python,
        BuildSystem::CMake | BuildSystem::Make | BuildSystem::Meson | BuildSystem::Unknown => {
            detect_c_family(root)
        }
    }
}

fn detect_c_family(root: &Path) -> Language {
    const CPP_EXTS: &[&str] = &["cpp", "cc", "cxx", "hpp", "hh"];

    let mut saw_c = false;
    for dir in [root.to_path_buf(), root.join("src")] {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if CPP_EXTS.contains(&ext) {
                return Language::Cpp;
            }
            if ext == "c" {
                saw_c = true;
            }
        }
    }

    if saw_c {
        Language::C
    } else {
        Language::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_detect_cmake_cpp_project() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("CMakeLists.txt"), "project(demo)\n").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.cpp"), "int main() {}\n").unwrap();

        let ctx = ProjectContext::detect(dir.path());
        assert_eq!(ctx.build_system, BuildSystem::CMake);
        assert_eq!(ctx.language, Language::Cpp);
        assert_eq!(ctx.build_dir, dir.path().join("build"));
    }

    #[test]
    fn test_detect_make_c_project() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), "all:\n").unwrap();
        fs::write(dir.path().join("main.c"), "int main(void) { return 0; }\n").unwrap();

        let ctx = ProjectContext::detect(dir.path());
        assert_eq!(ctx.build_system, BuildSystem::Make);
        assert_eq!(ctx.language, Language::C);
    }

    #[test]
    fn test_detect_cargo_project() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        let ctx = ProjectContext::detect(dir.path());
        assert_eq!(ctx.build_system, BuildSystem::Cargo);
        assert_eq!(ctx.language, Language::Rust);
    }

    #[test]
    fn test_detect_empty_dir_is_unknown() {
        let dir = tempdir().unwrap();
        let ctx = ProjectContext::detect(dir.path());
        assert_eq!(ctx.build_system, BuildSystem::Unknown);
        assert_eq!(ctx.language, Language::Unknown);
    }
}
