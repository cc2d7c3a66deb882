use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Join captured stdout and stderr the way build logs are usually read.
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
    if !stdout.is_empty() {
        combined.push_str(stdout);
    }
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(stderr);
    }
    combined
}

/// Resolve a fix target against the project root. Absolute targets pass through.
pub fn resolve_target(root: &Path, target: &str) -> PathBuf {
    let candidate = Path::new(target);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}

/// Canonicalize the closest ancestor of `path` that exists.
pub fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Best-effort writability probe for a directory.
pub fn is_dir_writable(dir: &Path) -> bool {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        _ => return false,
    }
    if fs::metadata(dir)
        .map(|m| m.permissions().readonly())
        .unwrap_or(true)
    {
        return false;
    }

    // Permission bits lie for root and ACL setups, so probe with a real file.
    let probe = dir.join(format!(".buildmedic-probe-{}", std::process::id()));
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(err) => err.kind() == io::ErrorKind::AlreadyExists,
    }
}

/// Write via a sibling temp file and rename into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(&tmp_path, perms);
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}

/// Split a shell command line into the platform shell invocation.
pub fn shell_invocation(command: &str) -> (String, Vec<String>) {
    if cfg!(windows) {
        ("cmd".to_string(), vec!["/C".to_string(), command.to_string()])
    } else {
        ("sh".to_string(), vec!["-c".to_string(), command.to_string()])
    }
}

/// Compute a stable hash of file contents (FNV-1a 64-bit).
pub fn hash_bytes(content: &[u8]) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in content {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    format!("{:016x}", hash)
}

pub fn hash_str(content: &str) -> String {
    hash_bytes(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_truncate_keeps_char_boundaries() {
        let log = "error: ünresolved symbol";
        assert_eq!(truncate(log, 10), "error: ...");
        assert_eq!(truncate("ééé", 2), "éé");
        assert_eq!(truncate(log, 0), "");
        assert_eq!(truncate(log, 100), log);
    }

    #[test]
    fn test_hash_str_distinguishes_logs() {
        assert_eq!(hash_str("ld: cannot find -lz"), hash_str("ld: cannot find -lz"));
        assert_ne!(hash_str("ld: cannot find -lz"), hash_str("ld: cannot find -lm"));
        assert_eq!(hash_str("").len(), 16);
    }

    #[test]
    fn test_combine_output_inserts_separator() {
        assert_eq!(combine_output("out", "err"), "out\nerr");
        assert_eq!(combine_output("out\n", "err"), "out\nerr");
        assert_eq!(combine_output("", "err"), "err");
        assert_eq!(combine_output("out", ""), "out");
    }

    #[test]
    fn test_resolve_target_keeps_absolute_paths() {
        let root = Path::new("/project");
        assert_eq!(
            resolve_target(root, "src/main.c"),
            PathBuf::from("/project/src/main.c")
        );
        if cfg!(unix) {
            assert_eq!(resolve_target(root, "/etc/hosts"), PathBuf::from("/etc/hosts"));
        }
    }

    #[test]
    fn test_canonicalize_existing_parent_walks_up() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("a/b/c.txt");
        let resolved = canonicalize_existing_parent(&missing).unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_is_dir_writable_rejects_missing_dir() {
        let dir = tempdir().unwrap();
        assert!(is_dir_writable(dir.path()));
        assert!(!is_dir_writable(&dir.path().join("nope")));
    }
}
