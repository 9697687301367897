//! Path validation and conversion
//!
//! Archive entries carry `/`-separated paths relative to the source root.
//! Everything coming off the wire is validated here before it touches the
//! destination filesystem.

use crate::error::ProtocolError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};
use std::path::{Component, Path, PathBuf};

/// Resolve an archive path under a destination root.
///
/// Rejects NUL bytes, over-long paths and components, absolute paths,
/// `..`, and platform prefixes. Works on paths that do not exist yet and
/// never follows symlinks.
pub fn safe_path(base: &Path, relative: &str) -> Result<PathBuf, ProtocolError> {
    if relative.contains('\0') {
        return Err(ProtocolError::PathTraversal(
            "path contains null byte".into(),
        ));
    }

    if relative.len() > MAX_PATH_LEN {
        return Err(ProtocolError::PathTraversal(format!(
            "path too long: {} bytes (max {})",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    let relative_path = Path::new(relative);

    if relative_path.is_absolute() || relative.starts_with('/') {
        return Err(ProtocolError::PathTraversal(
            "absolute paths not allowed".into(),
        ));
    }

    let mut result = base.to_path_buf();

    for component in relative_path.components() {
        match component {
            Component::Normal(name) => {
                let name_str = name.to_string_lossy();
                if name_str.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::PathTraversal(format!(
                        "filename too long: {} bytes (max {})",
                        name_str.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
            }
            Component::ParentDir => {
                return Err(ProtocolError::PathTraversal(
                    "parent directory (..) not allowed".into(),
                ));
            }
            Component::CurDir => {}
            Component::Prefix(_) => {
                return Err(ProtocolError::PathTraversal(
                    "path prefixes not allowed".into(),
                ));
            }
            Component::RootDir => {
                return Err(ProtocolError::PathTraversal(
                    "root directory not allowed in relative path".into(),
                ));
            }
        }
    }

    if result == base {
        return Err(ProtocolError::PathTraversal("empty path".into()));
    }

    if !result.starts_with(base) {
        return Err(ProtocolError::PathTraversal(
            "path escapes base directory".into(),
        ));
    }

    Ok(result)
}

/// Validate a filename (single path component)
pub fn validate_filename(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::PathTraversal("empty filename".into()));
    }

    if name.contains('\0') {
        return Err(ProtocolError::PathTraversal(
            "filename contains null byte".into(),
        ));
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(ProtocolError::PathTraversal(format!(
            "filename too long: {} bytes (max {})",
            name.len(),
            MAX_FILENAME_LEN
        )));
    }

    if name == "." || name == ".." {
        return Err(ProtocolError::PathTraversal(
            "special directory names not allowed".into(),
        ));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(ProtocolError::PathTraversal(
            "filename contains path separator".into(),
        ));
    }

    Ok(())
}

/// Render a path relative to `root` in archive form (`/`-separated).
///
/// Returns `None` when `path` is not under `root`, is `root` itself, or has a
/// component that is not valid UTF-8.
pub fn to_wire_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts: Vec<&str> = Vec::new();
    for component in relative.components() {
        if let Component::Normal(name) = component {
            parts.push(name.to_str()?);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Last component of an archive path, used when flattening
pub fn flatten_name(wire_path: &str) -> &str {
    wire_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(wire_path)
}

/// Parent of an archive path, `None` at top level
pub fn wire_parent(wire_path: &str) -> Option<&str> {
    wire_path.rfind('/').map(|idx| &wire_path[..idx])
}
