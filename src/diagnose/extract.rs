//! Per-kind cleanup of the raw detail captured by a pattern.

use super::catalog::ErrorKind;
use crate::util::hash_str;

/// Turn a raw capture into the detail string fix generation keys on.
pub fn extract_detail(kind: ErrorKind, captured: Option<&str>) -> Option<String> {
    let raw = captured?.trim().trim_matches(|c: char| c == '\'' || c == '"' || c == '`');
    if raw.is_empty() {
        return None;
    }

    let detail = match kind {
        ErrorKind::MissingLibrary => library_name(raw),
        ErrorKind::MissingTool => match raw {
            "C" => "gcc".to_string(),
            "CXX" => "g++".to_string(),
            other => other.to_string(),
        },
        ErrorKind::MissingPythonModule => raw.split('.').next().unwrap_or(raw).to_string(),
        ErrorKind::MissingNodeModule => node_package(raw)?,
        ErrorKind::UndefinedReference => raw.split('(').next().unwrap_or(raw).trim().to_string(),
        _ => raw.to_string(),
    };

    if detail.is_empty() {
        None
    } else {
        Some(detail)
    }
}

/// `libSDL2-2.0.so.0` -> `SDL2-2.0`, `GL` -> `GL`.
fn library_name(raw: &str) -> String {
    let base = raw.rsplit('/').next().unwrap_or(raw);
    let base = base.strip_prefix("lib").unwrap_or(base);
    let base = match base.find(".so") {
        Some(idx) => &base[..idx],
        None => base,
    };
    let base = base
        .strip_suffix(".dylib")
        .or_else(|| base.strip_suffix(".a"))
        .unwrap_or(base);
    base.to_string()
}

/// Package part of a module specifier; relative imports have none.
fn node_package(raw: &str) -> Option<String> {
    if raw.starts_with('.') || raw.starts_with('/') {
        return None;
    }
    let mut parts = raw.split('/');
    let first = parts.next()?;
    if first.starts_with('@') {
        let second = parts.next()?;
        Some(format!("{}/{}", first, second))
    } else {
        Some(first.to_string())
    }
}

/// Stable key correlating an error across runs.
///
/// `kind:detail` when a detail exists, `kind` for detail-less kinds, and
/// `unknown:<hash>` of the normalized first error line otherwise.
pub fn signature(kind: ErrorKind, detail: Option<&str>, text: &str) -> String {
    match (kind, detail) {
        (_, Some(detail)) => format!("{}:{}", kind.slug(), detail.to_lowercase()),
        (ErrorKind::Unknown, None) => {
            format!("{}:{}", kind.slug(), hash_str(&normalized_error_line(text)))
        }
        (_, None) => kind.slug().to_string(),
    }
}

/// First line mentioning an error (or first non-empty line), with digits
/// collapsed so line/column numbers do not change the key.
pub fn normalized_error_line(text: &str) -> String {
    let line = text
        .lines()
        .find(|l| l.to_lowercase().contains("error"))
        .or_else(|| text.lines().find(|l| !l.trim().is_empty()))
        .unwrap_or("");

    let mut out = String::with_capacity(line.len());
    let mut last_was_digit = false;
    let mut last_was_space = false;
    for ch in line.trim().chars() {
        if ch.is_ascii_digit() {
            if !last_was_digit {
                out.push('#');
            }
            last_was_digit = true;
            last_was_space = false;
        } else if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
            last_was_digit = false;
        } else {
            out.extend(ch.to_lowercase());
            last_was_digit = false;
            last_was_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_name_strips_decorations() {
        assert_eq!(
            extract_detail(ErrorKind::MissingLibrary, Some("libSDL2-2.0.so.0")),
            Some("SDL2-2.0".to_string())
        );
        assert_eq!(
            extract_detail(ErrorKind::MissingLibrary, Some("GL")),
            Some("GL".to_string())
        );
    }

    #[test]
    fn test_compiler_capture_maps_to_tool() {
        assert_eq!(
            extract_detail(ErrorKind::MissingTool, Some("CXX")),
            Some("g++".to_string())
        );
    }

    #[test]
    fn test_python_module_keeps_top_level() {
        assert_eq!(
            extract_detail(ErrorKind::MissingPythonModule, Some("yaml.loader")),
            Some("yaml".to_string())
        );
    }

    #[test]
    fn test_node_module_handles_scopes_and_relative() {
        assert_eq!(
            extract_detail(ErrorKind::MissingNodeModule, Some("@babel/core/lib")),
            Some("@babel/core".to_string())
        );
        assert_eq!(extract_detail(ErrorKind::MissingNodeModule, Some("./local")), None);
    }

    #[test]
    fn test_undefined_reference_drops_signature() {
        assert_eq!(
            extract_detail(ErrorKind::UndefinedReference, Some("ns::run(int)")),
            Some("ns::run".to_string())
        );
    }

    #[test]
    fn test_signature_shapes() {
        assert_eq!(
            signature(ErrorKind::MissingHeader, Some("SDL2/SDL.h"), ""),
            "missing_header:sdl2/sdl.h"
        );
        assert_eq!(signature(ErrorKind::DiskFull, None, "whatever"), "disk_full");
        let a = signature(ErrorKind::Unknown, None, "foo.c:10:2: error: weird");
        let b = signature(ErrorKind::Unknown, None, "foo.c:99:7: error: weird");
        assert_eq!(a, b);
        assert!(a.starts_with("unknown:"));
    }

    #[test]
    fn test_normalized_error_line_prefers_error_lines() {
        let text = "building...\nfoo.c:12:3: ERROR   something\n";
        assert_eq!(normalized_error_line(text), "foo.c:#:#: error something");
    }
}
