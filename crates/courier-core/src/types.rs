//! Core type definitions for Courier
//!
//! These types are shared by both crates and describe what moves between
//! the two ends of a transfer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Permission bits preserved across a transfer (rwx for user, group, other)
pub const MODE_MASK: u32 = 0o777;

/// Type of filesystem entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    File = 0,
    Directory = 1,
    Symlink = 2,
}

/// Metadata for one archived entry.
///
/// `path` is relative to the source root and always uses `/` separators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub kind: EntryKind,
    /// Low nine permission bits; zero means "unknown, leave as created"
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
    pub mtime_nsec: u32,
    /// Content length, zero for directories and symlinks
    pub size: u64,
    /// Target string for symlinks
    pub link_target: Option<String>,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, size: u64, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            mode: mode & MODE_MASK,
            mtime: 0,
            mtime_nsec: 0,
            size,
            link_target: None,
        }
    }

    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            mode: mode & MODE_MASK,
            mtime: 0,
            mtime_nsec: 0,
            size: 0,
            link_target: None,
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Symlink,
            mode: 0,
            mtime: 0,
            mtime_nsec: 0,
            size: 0,
            link_target: Some(target.into()),
        }
    }

    pub fn with_mtime(mut self, secs: i64, nanos: u32) -> Self {
        self.mtime = secs;
        self.mtime_nsec = nanos;
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// What to move: which paths are selected and how they land.
///
/// An empty `include` selects everything under the source root.
/// Construct through [`TransferSpec::builder`], which refuses a request that
/// never set an include pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSpec {
    pub include: String,
    pub exclude: String,
    pub flatten: bool,
    pub honor_default_excludes: bool,
}

impl TransferSpec {
    pub fn builder() -> TransferSpecBuilder {
        TransferSpecBuilder::default()
    }

    /// Select everything, no excludes, keep layout
    pub fn everything() -> Self {
        Self {
            include: String::new(),
            exclude: String::new(),
            flatten: false,
            honor_default_excludes: false,
        }
    }
}

/// Builder for [`TransferSpec`]
#[derive(Clone, Debug, Default)]
pub struct TransferSpecBuilder {
    include: Option<String>,
    exclude: Option<String>,
    flatten: bool,
    honor_default_excludes: Option<bool>,
}

impl TransferSpecBuilder {
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include = Some(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }

    pub fn flatten(mut self, flatten: bool) -> Self {
        self.flatten = flatten;
        self
    }

    pub fn honor_default_excludes(mut self, honor: bool) -> Self {
        self.honor_default_excludes = Some(honor);
        self
    }

    /// Finish the spec. Fails when no include pattern was given.
    pub fn build(self) -> Result<TransferSpec, MissingInclude> {
        let include = self.include.ok_or(MissingInclude)?;
        Ok(TransferSpec {
            include,
            exclude: self.exclude.unwrap_or_default(),
            flatten: self.flatten,
            honor_default_excludes: self.honor_default_excludes.unwrap_or(true),
        })
    }
}

/// A transfer request without an include pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("include pattern is required (use \"\" or \"**\" to select everything)")]
pub struct MissingInclude;

/// Correlates log lines for one transfer across both nodes
#[derive(Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransferId(pub [u8; 16]);

impl TransferId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        // An all-zero id is still usable for correlation if the OS RNG fails
        let _ = getrandom::fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self)
    }
}

/// Role a node plays in the build farm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Worker,
    Coordinator,
}
