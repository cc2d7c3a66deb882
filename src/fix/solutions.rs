//! Candidate fixes per diagnosed error kind
//!
//! Pure lookup: no I/O, no history. Order is priority, best guess first.

use super::FixAction;
use crate::diagnose::ErrorKind;
use crate::project::{BuildSystem, ProjectContext};

/// Development packages for well-known libraries, keyed by lowercase stem.
const KNOWN_PACKAGES: &[(&str, &str)] = &[
    ("sdl", "libsdl2-dev"),
    ("sdl2", "libsdl2-dev"),
    ("curl", "libcurl4-openssl-dev"),
    ("ssl", "libssl-dev"),
    ("openssl", "libssl-dev"),
    ("crypto", "libssl-dev"),
    ("z", "zlib1g-dev"),
    ("zlib", "zlib1g-dev"),
    ("gl", "libgl-dev"),
    ("opengl", "libgl-dev"),
    ("glfw", "libglfw3-dev"),
    ("glfw3", "libglfw3-dev"),
    ("png", "libpng-dev"),
    ("jpeg", "libjpeg-dev"),
    ("x11", "libx11-dev"),
    ("boost", "libboost-all-dev"),
    ("ffi", "libffi-dev"),
    ("sqlite3", "libsqlite3-dev"),
    ("xml2", "libxml2-dev"),
];

/// Python import names that differ from their distribution names.
const PYTHON_DISTRIBUTIONS: &[(&str, &str)] = &[
    ("yaml", "pyyaml"),
    ("cv2", "opencv-python"),
    ("PIL", "pillow"),
    ("sklearn", "scikit-learn"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
];

/// Packages providing common build tools.
const TOOL_PACKAGES: &[(&str, &str)] = &[
    ("cc", "gcc"),
    ("c++", "g++"),
    ("ninja", "ninja-build"),
    ("pkg-config", "pkg-config"),
    ("python", "python3"),
    ("pip", "python3-pip"),
];

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Package for a library stem, falling back to `lib<name>-dev`.
pub fn package_for_library(name: &str) -> String {
    let stem = name.to_lowercase();
    let stem = stem.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-');
    let full = name.to_lowercase();
    match lookup(KNOWN_PACKAGES, stem).or_else(|| lookup(KNOWN_PACKAGES, &full)) {
        Some(pkg) => pkg.to_string(),
        None => format!("lib{}-dev", full),
    }
}

/// `SDL2/SDL.h` -> `SDL2`, `zlib.h` -> `zlib`.
fn header_stem(header: &str) -> &str {
    let first = header.split(['/', '\\']).next().unwrap_or(header);
    first
        .strip_suffix(".hpp")
        .or_else(|| first.strip_suffix(".hh"))
        .or_else(|| first.strip_suffix(".h"))
        .unwrap_or(first)
}

/// Known package for a linker symbol, from its prefix (`SDL_Init` -> SDL).
fn package_for_symbol(symbol: &str) -> Option<&'static str> {
    let symbol = symbol.rsplit("::").next().unwrap_or(symbol);
    let prefix = symbol.split('_').next().unwrap_or(symbol);
    let candidates = [prefix.to_lowercase(), symbol.to_lowercase()];
    candidates
        .iter()
        .find_map(|candidate| lookup(KNOWN_PACKAGES, candidate))
        .or_else(|| {
            let lowered = symbol.to_lowercase();
            ["glfw", "curl", "png"]
                .iter()
                .find(|p| lowered.starts_with(*p))
                .and_then(|p| lookup(KNOWN_PACKAGES, p))
        })
}

fn clean(project: Option<&ProjectContext>) -> FixAction {
    FixAction::clean_build(project.and_then(|p| p.build_system.clean_command()))
}

/// Ordered candidate fixes for `kind`.
pub fn generate(
    kind: ErrorKind,
    detail: Option<&str>,
    project: Option<&ProjectContext>,
) -> Vec<FixAction> {
    match kind {
        ErrorKind::MissingHeader => {
            let package = detail
                .map(|header| package_for_library(header_stem(header)))
                .filter(|pkg| pkg != "lib-dev");
            let mut fixes = Vec::new();
            if let Some(package) = package {
                fixes.push(FixAction::install_package(&package));
            }
            fixes.push(clean(project));
            fixes.push(FixAction::retry());
            fixes
        }
        ErrorKind::MissingLibrary => {
            let mut fixes = Vec::new();
            if let Some(name) = detail {
                fixes.push(FixAction::install_package(&package_for_library(name)));
            }
            fixes.push(clean(project));
            fixes.push(FixAction::retry());
            fixes
        }
        ErrorKind::UndefinedReference => {
            let mut fixes = Vec::new();
            if let Some(package) = detail.and_then(package_for_symbol) {
                fixes.push(FixAction::install_package(package));
            }
            fixes.push(clean(project));
            fixes.push(FixAction::retry());
            fixes
        }
        ErrorKind::PackageNotFound => {
            let mut fixes = Vec::new();
            if let Some(name) = detail {
                fixes.push(FixAction::install_package(&package_for_library(name)));
            }
            fixes.push(FixAction::retry());
            fixes
        }
        ErrorKind::MissingTool => {
            let mut fixes = Vec::new();
            if let Some(tool) = detail {
                let package = lookup(TOOL_PACKAGES, tool).unwrap_or(tool);
                fixes.push(
                    FixAction::install_package(package)
                        .with_description(format!("Install {} (provides {})", package, tool)),
                );
            }
            fixes.push(FixAction::retry());
            fixes
        }
        ErrorKind::BuildConfigVersion => match detail {
            Some(version) => vec![
                FixAction::fix_build_config_version("CMakeLists.txt", version),
                clean(project),
                FixAction::retry(),
            ],
            None => vec![clean(project), FixAction::retry()],
        },
        ErrorKind::StaleBuildCache => vec![clean(project), FixAction::retry()],
        ErrorKind::DiskFull => vec![
            clean(project).with_description("Free disk space by removing build artifacts"),
            FixAction::retry(),
        ],
        ErrorKind::OutOfMemory => {
            let mut fixes = vec![
                FixAction::set_env("MAKEFLAGS", "-j1"),
                FixAction::set_env("CMAKE_BUILD_PARALLEL_LEVEL", "1"),
            ];
            if project.map(|p| p.build_system) == Some(BuildSystem::Cargo) {
                fixes.push(FixAction::set_env("CARGO_BUILD_JOBS", "1"));
            }
            fixes.push(FixAction::retry());
            fixes
        }
        ErrorKind::Network => {
            vec![FixAction::retry().with_description("Retry after network failure")]
        }
        ErrorKind::MissingPythonModule => match detail {
            Some(module) => {
                let dist = lookup(PYTHON_DISTRIBUTIONS, module).unwrap_or(module);
                vec![
                    FixAction::install_package(dist)
                        .with_command(format!("python3 -m pip install {}", dist))
                        .with_description(format!("Install Python package {}", dist)),
                    FixAction::retry(),
                ]
            }
            None => vec![FixAction::retry()],
        },
        ErrorKind::MissingNodeModule => match detail {
            Some(package) => vec![
                FixAction::install_package(package)
                    .with_command(format!("npm install {}", package))
                    .with_description(format!("Install npm package {}", package)),
                FixAction::retry(),
            ],
            None => vec![
                FixAction::run_command("npm install", "Reinstall project dependencies"),
                FixAction::retry(),
            ],
        },
        ErrorKind::PermissionDenied => {
            let mut fixes = Vec::new();
            if let Some(path) = detail {
                fixes.push(FixAction::run_command(
                    &format!("chmod u+rw '{}'", path.replace('\'', "")),
                    format!("Make {} readable and writable", path),
                ));
            }
            fixes.push(FixAction::retry());
            fixes
        }
        ErrorKind::MissingFile => match detail {
            Some(path) => vec![
                FixAction::create_file(path, "").with_description(format!("Create empty {}", path)),
                clean(project),
            ],
            None => vec![clean(project), FixAction::retry()],
        },
        // Source-level mistakes have no automatic remedy.
        ErrorKind::SyntaxError | ErrorKind::UndeclaredIdentifier | ErrorKind::LinkerError => {
            Vec::new()
        }
        ErrorKind::Unknown => vec![clean(project), FixAction::retry()],
    }
}
