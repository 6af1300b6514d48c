//! Path Resolver (C4): classifies a stored `path` and translates it to a
//! concrete blob location, enforcing traversal safety.
//!
//! Pure functions only — no I/O beyond what the caller of
//! [`resolve_for_read`] performs with the returned path. Every invalid
//! input fails with [`AppError::InvalidPath`]; callers must propagate,
//! never retry with a sanitized variant.

use std::path::{Component, Path, PathBuf};

use nimbus_common::{AppError, AppResult};
use nimbus_db::entities::file;

/// What kind of location a row's `path` column denotes (§3 "path
/// semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// `path` is `None` — a purely logical folder, no on-disk analogue.
    LogicalFolder,
    /// `path` is an absolute filesystem path (custom-drive entry).
    AbsoluteCustom,
    /// `path` is a relative storage key (local blob store or S3 key).
    StorageKey,
}

/// Classify a row's stored `path`.
#[must_use]
pub fn classify(path: Option<&str>) -> PathKind {
    match path {
        None => PathKind::LogicalFolder,
        Some(p) if Path::new(p).is_absolute() => PathKind::AbsoluteCustom,
        Some(_) => PathKind::StorageKey,
    }
}

/// Resolve a file row to the absolute path its bytes can be read from.
///
/// For storage-key rows this joins `upload_root`; absolute (custom-drive)
/// paths pass through unchanged. Fails with [`AppError::InvalidPath`] if
/// the row is a logical folder (no bytes) or the storage key itself is
/// unsafe relative to `upload_root`.
pub fn resolve_for_read(row: &file::Model, upload_root: &Path) -> AppResult<PathBuf> {
    match classify(row.path.as_deref()) {
        PathKind::LogicalFolder => Err(AppError::InvalidPath(
            "row has no on-disk location".to_string(),
        )),
        PathKind::AbsoluteCustom => Ok(PathBuf::from(row.path.as_ref().expect("checked above"))),
        PathKind::StorageKey => {
            let key = row.path.as_ref().expect("checked above");
            safe_join(upload_root, key)
        }
    }
}

/// True iff this path denotes a location whose bytes are encrypted at
/// rest (local-driver storage keys only; custom-drive and S3 paths are
/// stored as-is per §4.C5).
#[must_use]
pub fn is_encrypted(path: Option<&str>) -> bool {
    match classify(path) {
        PathKind::StorageKey => path.is_some_and(nimbus_common::encryption::is_encrypted_path),
        PathKind::LogicalFolder | PathKind::AbsoluteCustom => false,
    }
}

/// Windows-reserved device names, rejected even on non-Windows hosts
/// since custom-drive directories may be synced onto Windows clients.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Join `base` and `name`, rejecting traversal, null bytes, absolute
/// segments, reserved device names, and any result that escapes `base`.
pub fn safe_join(base: &Path, name: &str) -> AppResult<PathBuf> {
    if name.is_empty() {
        return Err(AppError::InvalidPath("empty path segment".to_string()));
    }
    if name.contains('\0') {
        return Err(AppError::InvalidPath("null byte in path".to_string()));
    }

    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return Err(AppError::InvalidPath(
            "absolute segment not allowed".to_string(),
        ));
    }

    for component in candidate.components() {
        match component {
            Component::Normal(segment) => {
                let segment_str = segment.to_str().ok_or_else(|| {
                    AppError::InvalidPath("non-utf8 path segment".to_string())
                })?;
                let stem = segment_str.split('.').next().unwrap_or(segment_str);
                if RESERVED_NAMES.contains(&stem.to_ascii_uppercase().as_str()) {
                    return Err(AppError::InvalidPath(format!(
                        "reserved name: {segment_str}"
                    )));
                }
            }
            Component::ParentDir => {
                return Err(AppError::InvalidPath("parent traversal (..) not allowed".to_string()));
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::InvalidPath(
                    "absolute segment not allowed".to_string(),
                ));
            }
        }
    }

    let joined = base.join(candidate);

    let normalized = normalize(&joined);
    let normalized_base = normalize(base);
    if !normalized.starts_with(&normalized_base) {
        return Err(AppError::InvalidPath(
            "resolved path escapes base directory".to_string(),
        ));
    }

    Ok(joined)
}

/// Lexical normalization (no filesystem access — the target need not
/// exist yet, e.g. for a not-yet-created upload destination).
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            other => result.push(other.as_os_str()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_distinguishes_all_three_kinds() {
        assert_eq!(classify(None), PathKind::LogicalFolder);
        assert_eq!(classify(Some("/home/user/drive/a.txt")), PathKind::AbsoluteCustom);
        assert_eq!(classify(Some("ab12cd34ef56gh78.bin")), PathKind::StorageKey);
    }

    #[test]
    fn safe_join_rejects_parent_traversal() {
        let base = Path::new("/var/nimbus/blobs");
        assert!(safe_join(base, "../../etc/passwd").is_err());
        assert!(safe_join(base, "a/../../b").is_err());
    }

    #[test]
    fn safe_join_rejects_absolute_segment() {
        let base = Path::new("/var/nimbus/blobs");
        assert!(safe_join(base, "/etc/passwd").is_err());
    }

    #[test]
    fn safe_join_rejects_null_byte() {
        let base = Path::new("/var/nimbus/blobs");
        assert!(safe_join(base, "foo\0bar").is_err());
    }

    #[test]
    fn safe_join_rejects_reserved_windows_names() {
        let base = Path::new("/var/nimbus/blobs");
        assert!(safe_join(base, "CON").is_err());
        assert!(safe_join(base, "con.txt").is_err());
        assert!(safe_join(base, "LPT1").is_err());
    }

    #[test]
    fn safe_join_accepts_ordinary_relative_name() {
        let base = Path::new("/var/nimbus/blobs");
        let joined = safe_join(base, "ab12cd34ef56gh78.bin").unwrap();
        assert_eq!(joined, Path::new("/var/nimbus/blobs/ab12cd34ef56gh78.bin"));
    }

    #[test]
    fn safe_join_accepts_nested_subdirectory() {
        let base = Path::new("/var/nimbus/blobs");
        let joined = safe_join(base, "ab/cd/ef.bin").unwrap();
        assert_eq!(joined, Path::new("/var/nimbus/blobs/ab/cd/ef.bin"));
    }

    #[test]
    fn is_encrypted_true_only_for_storage_keys() {
        assert!(!is_encrypted(None));
        assert!(!is_encrypted(Some("/home/user/drive/a.txt")));
    }
}
