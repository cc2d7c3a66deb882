//! Known error signatures
//!
//! The catalog is plain data: a priority-ordered table compiled once into a
//! [`Catalog`] value and handed to the diagnoser.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What went wrong, coarsely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DiskFull,
    MissingHeader,
    MissingLibrary,
    StaleBuildCache,
    BuildConfigVersion,
    PackageNotFound,
    MissingPythonModule,
    MissingNodeModule,
    MissingTool,
    UndefinedReference,
    OutOfMemory,
    PermissionDenied,
    Network,
    UndeclaredIdentifier,
    SyntaxError,
    MissingFile,
    LinkerError,
    Unknown,
}

impl ErrorKind {
    pub fn slug(&self) -> &'static str {
        match self {
            ErrorKind::DiskFull => "disk_full",
            ErrorKind::MissingHeader => "missing_header",
            ErrorKind::MissingLibrary => "missing_library",
            ErrorKind::StaleBuildCache => "stale_build_cache",
            ErrorKind::BuildConfigVersion => "build_config_version",
            ErrorKind::PackageNotFound => "package_not_found",
            ErrorKind::MissingPythonModule => "missing_python_module",
            ErrorKind::MissingNodeModule => "missing_node_module",
            ErrorKind::MissingTool => "missing_tool",
            ErrorKind::UndefinedReference => "undefined_reference",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Network => "network",
            ErrorKind::UndeclaredIdentifier => "undeclared_identifier",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::MissingFile => "missing_file",
            ErrorKind::LinkerError => "linker_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// One way of recognising a pattern in build output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    /// Case-insensitive substring.
    Contains(&'static str),
    /// Regular expression; capture group 1, when present, is the detail.
    Regex(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPattern {
    pub kind: ErrorKind,
    pub matchers: &'static [Matcher],
    pub description: &'static str,
    /// Higher is checked first; ties keep catalog order.
    pub priority: u8,
}

pub const BUILTIN_PATTERNS: &[ErrorPattern] = &[
    ErrorPattern {
        kind: ErrorKind::DiskFull,
        matchers: &[Matcher::Contains("No space left on device")],
        description: "The disk is full",
        priority: 10,
    },
    ErrorPattern {
        kind: ErrorKind::MissingHeader,
        matchers: &[
            Matcher::Regex(r"fatal error: ([^\s:]+): No such file or directory"),
            Matcher::Regex(r"fatal error: '([^']+)' file not found"),
            Matcher::Regex(r"Cannot open include file: '([^']+)'"),
        ],
        description: "Missing header file",
        priority: 10,
    },
    ErrorPattern {
        kind: ErrorKind::MissingLibrary,
        matchers: &[
            Matcher::Regex(r"cannot find -l([A-Za-z0-9_.+-]+)"),
            Matcher::Regex(r"library not found for -l([A-Za-z0-9_.+-]+)"),
            Matcher::Regex(r"error while loading shared libraries: ([^\s:]+):"),
        ],
        description: "Missing library",
        priority: 9,
    },
    ErrorPattern {
        kind: ErrorKind::StaleBuildCache,
        matchers: &[
            Matcher::Contains("is different than the directory"),
            Matcher::Contains("is different from the directory where CMakeCache.txt was created"),
            Matcher::Contains("does not match the source"),
            Matcher::Contains("Error: could not load cache"),
        ],
        description: "Stale build cache from a different configuration",
        priority: 9,
    },
    ErrorPattern {
        kind: ErrorKind::BuildConfigVersion,
        matchers: &[
            // The installed version is the one the declaration can drop to.
            Matcher::Regex(
                r"CMake \d+(?:\.\d+)* or higher is required\.\s*You are running version (\d+(?:\.\d+)*)",
            ),
            Matcher::Regex(r"Compatibility with CMake < (\d+(?:\.\d+)*) has been removed"),
            Matcher::Regex(r"CMake \d+(?:\.\d+)* or higher is required"),
        ],
        description: "Build configuration requires a different tool version",
        priority: 8,
    },
    ErrorPattern {
        kind: ErrorKind::PackageNotFound,
        matchers: &[
            Matcher::Regex(r#"Could not find a package configuration file provided by "([^"]+)""#),
            Matcher::Regex(r"No package '([^']+)' found"),
            Matcher::Regex(r"Could NOT find ([A-Za-z0-9_]+)"),
        ],
        description: "Build dependency package not found",
        priority: 8,
    },
    ErrorPattern {
        kind: ErrorKind::MissingPythonModule,
        matchers: &[
            Matcher::Regex(r"ModuleNotFoundError: No module named '([^']+)'"),
            Matcher::Regex(r"ImportError: No module named ([A-Za-z0-9_.]+)"),
        ],
        description: "Missing Python module",
        priority: 8,
    },
    ErrorPattern {
        kind: ErrorKind::MissingNodeModule,
        matchers: &[
            Matcher::Regex(r"Cannot find module '([^']+)'"),
            Matcher::Regex(r"Module not found: Error: Can't resolve '([^']+)'"),
        ],
        description: "Missing Node.js module",
        priority: 8,
    },
    ErrorPattern {
        kind: ErrorKind::MissingTool,
        matchers: &[
            Matcher::Regex(r"(?m)([A-Za-z0-9_.+-]+): command not found"),
            Matcher::Regex(r"sh: \d+: ([A-Za-z0-9_.+-]+): not found"),
            Matcher::Regex(r"'([^']+)' is not recognized as an internal or external command"),
            Matcher::Regex(r"No CMAKE_(C|CXX)_COMPILER could be found"),
        ],
        description: "Required tool is not installed",
        priority: 8,
    },
    ErrorPattern {
        kind: ErrorKind::UndefinedReference,
        matchers: &[
            Matcher::Regex(r#"undefined reference to [`'"]([^`'"]+)[`'"]"#),
            Matcher::Regex(r#"unresolved external symbol "?([A-Za-z_][A-Za-z0-9_@]*)"#),
            Matcher::Regex(r#"Undefined symbols for architecture \S+:\s*"_?([A-Za-z_][A-Za-z0-9_]*)""#),
        ],
        description: "Undefined symbol at link time",
        priority: 7,
    },
    ErrorPattern {
        kind: ErrorKind::OutOfMemory,
        matchers: &[
            Matcher::Contains("virtual memory exhausted"),
            Matcher::Contains("Killed signal terminated program"),
            Matcher::Contains("out of memory"),
            Matcher::Contains("Cannot allocate memory"),
        ],
        description: "The compiler ran out of memory",
        priority: 7,
    },
    ErrorPattern {
        kind: ErrorKind::PermissionDenied,
        matchers: &[
            Matcher::Regex(r"(?:cannot open|unable to open|failed to open|cannot create)[^'`]*['`]([^'`]+)['`].*Permission denied"),
            Matcher::Contains("Permission denied"),
        ],
        description: "Permission denied while building",
        priority: 6,
    },
    ErrorPattern {
        kind: ErrorKind::Network,
        matchers: &[
            Matcher::Contains("Could not resolve host"),
            Matcher::Contains("Temporary failure in name resolution"),
            Matcher::Contains("Connection timed out"),
            Matcher::Contains("Failed to connect to"),
            Matcher::Contains("Network is unreachable"),
        ],
        description: "Network failure while fetching dependencies",
        priority: 5,
    },
    ErrorPattern {
        kind: ErrorKind::UndeclaredIdentifier,
        matchers: &[
            Matcher::Regex(r"'([^']+)' was not declared in this scope"),
            Matcher::Regex(r"use of undeclared identifier '([^']+)'"),
            Matcher::Regex(r"cannot find (?:value|function|type) `([^`]+)` in this scope"),
        ],
        description: "Identifier used before declaration",
        priority: 5,
    },
    ErrorPattern {
        kind: ErrorKind::SyntaxError,
        matchers: &[
            Matcher::Regex(r"error: expected .+ before"),
            Matcher::Contains("syntax error"),
            Matcher::Contains("SyntaxError:"),
        ],
        description: "Syntax error in source code",
        priority: 4,
    },
    ErrorPattern {
        kind: ErrorKind::MissingFile,
        matchers: &[
            Matcher::Regex(r"(?m)([^\s:'`]+): No such file or directory"),
            Matcher::Contains("No such file or directory"),
        ],
        description: "Referenced file does not exist",
        priority: 3,
    },
    ErrorPattern {
        kind: ErrorKind::LinkerError,
        matchers: &[
            Matcher::Contains("ld returned 1 exit status"),
            Matcher::Contains("linker command failed"),
        ],
        description: "Linking failed",
        priority: 2,
    },
];

#[derive(Debug)]
enum CompiledMatcher {
    Contains(String),
    Regex(Regex),
}

/// A pattern with its matchers compiled.
#[derive(Debug)]
pub struct CompiledPattern {
    pub pattern: ErrorPattern,
    matchers: Vec<CompiledMatcher>,
}

impl CompiledPattern {
    fn compile(pattern: ErrorPattern) -> Result<Self, regex::Error> {
        let mut matchers = Vec::with_capacity(pattern.matchers.len());
        for matcher in pattern.matchers {
            matchers.push(match matcher {
                Matcher::Contains(needle) => CompiledMatcher::Contains(needle.to_lowercase()),
                Matcher::Regex(src) => CompiledMatcher::Regex(Regex::new(src)?),
            });
        }
        Ok(Self { pattern, matchers })
    }

    /// `lowered` must be `text.to_lowercase()`; callers share it across patterns.
    pub fn is_match(&self, text: &str, lowered: &str) -> bool {
        self.matchers.iter().any(|m| match m {
            CompiledMatcher::Contains(needle) => lowered.contains(needle.as_str()),
            CompiledMatcher::Regex(re) => re.is_match(text),
        })
    }

    /// First capture group of the first regex matcher that captures.
    pub fn capture<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.matchers.iter().find_map(|m| match m {
            CompiledMatcher::Regex(re) => re
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str()),
            CompiledMatcher::Contains(_) => None,
        })
    }
}

/// Priority-ordered, compiled pattern table.
#[derive(Debug)]
pub struct Catalog {
    patterns: Vec<CompiledPattern>,
}

impl Catalog {
    /// Compile `patterns`, ordering by descending priority (stable).
    pub fn new(patterns: impl IntoIterator<Item = ErrorPattern>) -> Result<Self, regex::Error> {
        let mut compiled = patterns
            .into_iter()
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>, _>>()?;
        compiled.sort_by(|a, b| b.pattern.priority.cmp(&a.pattern.priority));
        Ok(Self { patterns: compiled })
    }

    /// The built-in table. Patterns whose regex fails to compile are dropped.
    pub fn builtin() -> Self {
        let mut compiled = Vec::with_capacity(BUILTIN_PATTERNS.len());
        for pattern in BUILTIN_PATTERNS {
            match CompiledPattern::compile(*pattern) {
                Ok(p) => compiled.push(p),
                Err(err) => {
                    tracing::warn!(kind = %pattern.kind, error = %err, "dropping error pattern");
                }
            }
        }
        compiled.sort_by(|a, b| b.pattern.priority.cmp(&a.pattern.priority));
        Self { patterns: compiled }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledPattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern, in priority order, with any matcher hit.
    pub fn first_match(&self, text: &str) -> Option<&CompiledPattern> {
        let lowered = text.to_lowercase();
        self.patterns.iter().find(|p| p.is_match(text, &lowered))
    }

    /// Every pattern that hits anywhere in `text`, in priority order.
    pub fn all_matches(&self, text: &str) -> Vec<&CompiledPattern> {
        let lowered = text.to_lowercase();
        self.patterns
            .iter()
            .filter(|p| p.is_match(text, &lowered))
            .collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}
