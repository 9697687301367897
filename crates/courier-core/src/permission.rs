//! Restoring POSIX permission bits on extracted entries
//!
//! The native path calls `chmod(2)` directly. Some platforms ship a libc whose
//! `chmod` is a stub returning `ENOSYS`; on those the external `chmod`
//! command is used instead. Which one applies is detected once per process.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Once, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::MODE_MASK;

/// How permission bits are applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBackend {
    /// Native when it works, external command otherwise
    #[default]
    Auto,
    Native,
    External,
    /// Leave modes as created
    Disabled,
}

static NATIVE_AVAILABLE: OnceLock<bool> = OnceLock::new();
static FALLBACK_WARNING: Once = Once::new();
static FALLBACK_WARNINGS: AtomicUsize = AtomicUsize::new(0);

/// Applies the low nine mode bits to a path
#[derive(Clone, Copy, Debug, Default)]
pub struct PermissionApplier {
    backend: PermissionBackend,
    /// Overrides the detected backend for `Auto`
    native_override: Option<bool>,
}

impl PermissionApplier {
    pub fn new(backend: PermissionBackend) -> Self {
        Self {
            backend,
            native_override: None,
        }
    }

    /// Pretend the native primitive is (un)available instead of probing
    pub fn with_native_available(mut self, available: bool) -> Self {
        self.native_override = Some(available);
        self
    }

    pub fn backend(&self) -> PermissionBackend {
        self.backend
    }

    /// Set `mode & 0o777` on `path`. No-op where POSIX permissions don't exist.
    #[cfg(unix)]
    pub fn apply(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mode = mode & MODE_MASK;
        match self.backend {
            PermissionBackend::Disabled => Ok(()),
            PermissionBackend::Native => chmod_native(path, mode),
            PermissionBackend::External => chmod_external(path, mode),
            PermissionBackend::Auto => {
                let native = self.native_override.unwrap_or_else(native_available);
                if native {
                    chmod_native(path, mode)
                } else {
                    warn_fallback_once();
                    chmod_external(path, mode)
                }
            }
        }
    }

    #[cfg(not(unix))]
    pub fn apply(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Number of times the fallback warning was emitted in this process
pub fn fallback_warning_count() -> usize {
    FALLBACK_WARNINGS.load(Ordering::SeqCst)
}

fn warn_fallback_once() {
    FALLBACK_WARNING.call_once(|| {
        FALLBACK_WARNINGS.fetch_add(1, Ordering::SeqCst);
        warn!("native chmod is not available on this platform; using the external chmod command");
    });
}

#[cfg(unix)]
fn native_available() -> bool {
    *NATIVE_AVAILABLE.get_or_init(detect_native)
}

#[cfg(unix)]
fn detect_native() -> bool {
    let scratch = std::env::temp_dir().join(format!(".courier-chmod-check-{}", std::process::id()));
    if let Err(e) = std::fs::write(&scratch, b"") {
        debug!("chmod check could not create scratch file: {}", e);
        return true;
    }
    let available = match chmod_native(&scratch, 0o600) {
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => false,
        _ => true,
    };
    let _ = std::fs::remove_file(&scratch);
    debug!("native chmod available: {}", available);
    available
}

#[cfg(unix)]
fn chmod_native(path: &Path, mode: u32) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    // SAFETY: c_path is a NUL-terminated CString that outlives the call, and
    // chmod only reads the path during the syscall without retaining the pointer.
    let rc = unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn chmod_external(path: &Path, mode: u32) -> io::Result<()> {
    let status = std::process::Command::new("chmod")
        .arg(format!("{:o}", mode))
        .arg(path)
        .status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("chmod {:o} {} exited with {}", mode, path.display(), status),
        ));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & MODE_MASK
    }

    #[test]
    fn test_native_apply() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("run.sh");
        fs::write(&file, "#!/bin/sh").unwrap();

        PermissionApplier::new(PermissionBackend::Native)
            .apply(&file, 0o100751)
            .unwrap();
        assert_eq!(mode_of(&file), 0o751);
    }

    #[test]
    fn test_disabled_leaves_mode() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "a").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();

        PermissionApplier::new(PermissionBackend::Disabled)
            .apply(&file, 0o777)
            .unwrap();
        assert_eq!(mode_of(&file), 0o640);
    }

    #[test]
    fn test_fallback_warns_once() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::write(&first, "1").unwrap();
        fs::write(&second, "2").unwrap();

        let applier = PermissionApplier::new(PermissionBackend::Auto).with_native_available(false);
        applier.apply(&first, 0o700).unwrap();
        applier.apply(&second, 0o604).unwrap();

        assert_eq!(mode_of(&first), 0o700);
        assert_eq!(mode_of(&second), 0o604);
        assert_eq!(fallback_warning_count(), 1);
    }

    #[test]
    fn test_detects_native_chmod() {
        assert!(native_available());
    }

    #[test]
    fn test_missing_path_is_error() {
        let dir = tempdir().unwrap();
        let applier = PermissionApplier::new(PermissionBackend::Native);
        assert!(applier.apply(&dir.path().join("nope"), 0o644).is_err());
    }
}
