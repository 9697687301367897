//! File selection under a source root
//!
//! Patterns are comma- or whitespace-separated Ant-style globs: `*` and `?` stay within one
//! path segment, `**` spans any number of segments. A pattern without a `/`
//! matches an entry name at any depth, and a trailing `/` selects a directory
//! together with everything below it.
//!
//! Archive paths are UTF-8. Entries whose name or symlink target is not are
//! skipped with a warning.
//!
//! The walk is synchronous; async callers run it in `spawn_blocking`.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SelectionError;
use crate::path::{to_wire_path, wire_parent};
use crate::types::{EntryKind, TransferSpec};

/// Noise that is skipped unless the caller opts out.
///
/// VCS metadata, editor backups and swap files, and OS bookkeeping files.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/*~",
    "**/#*#",
    "**/.#*",
    "**/%*%",
    "**/._*",
    "**/.*.swp",
    "**/CVS",
    "**/CVS/**",
    "**/.cvsignore",
    "**/SCCS",
    "**/SCCS/**",
    "**/vssver.scc",
    "**/.svn",
    "**/.svn/**",
    "**/.git",
    "**/.git/**",
    "**/.gitattributes",
    "**/.gitignore",
    "**/.gitmodules",
    "**/.hg",
    "**/.hg/**",
    "**/.hgignore",
    "**/.hgsub",
    "**/.hgsubstate",
    "**/.hgtags",
    "**/.bzr",
    "**/.bzr/**",
    "**/.bzrignore",
    "**/.DS_Store",
];

/// Decides membership of a relative (`/`-separated) path.
pub trait PathMatcher: Send + Sync {
    fn is_included(&self, path: &str) -> bool;
    fn is_excluded(&self, path: &str) -> bool;
}

/// Builds matchers from pattern strings.
pub trait MatcherFactory: Send + Sync {
    fn build(
        &self,
        include: &str,
        exclude: &str,
        honor_default_excludes: bool,
    ) -> Result<Box<dyn PathMatcher>, SelectionError>;
}

/// `globset`-backed matcher
pub struct GlobMatcher {
    /// `None` selects everything
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathMatcher for GlobMatcher {
    fn is_included(&self, path: &str) -> bool {
        match &self.include {
            Some(set) => set.is_match(path),
            None => true,
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.is_match(path)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GlobMatcherFactory;

impl MatcherFactory for GlobMatcherFactory {
    fn build(
        &self,
        include: &str,
        exclude: &str,
        honor_default_excludes: bool,
    ) -> Result<Box<dyn PathMatcher>, SelectionError> {
        let includes = split_patterns(include);
        let include = if includes.is_empty() {
            None
        } else {
            Some(compile(includes)?)
        };

        let mut excludes = split_patterns(exclude);
        if honor_default_excludes {
            excludes.extend(DEFAULT_EXCLUDES.iter().map(|p| p.to_string()));
        }
        let exclude = compile(excludes)?;

        Ok(Box::new(GlobMatcher { include, exclude }))
    }
}

/// Split a comma- or whitespace-separated list
pub fn split_patterns(list: &str) -> Vec<String> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Translate one Ant-style pattern into the globs that implement it.
pub fn expand_pattern(raw: &str) -> Vec<String> {
    let mut pattern = raw.trim().replace('\\', "/");
    loop {
        if let Some(rest) = pattern.strip_prefix("./") {
            pattern = rest.to_owned();
        } else if let Some(rest) = pattern.strip_prefix('/') {
            pattern = rest.to_owned();
        } else {
            break;
        }
    }
    if pattern.is_empty() {
        return Vec::new();
    }
    if pattern.ends_with('/') {
        pattern.push_str("**");
    }

    let mut globs = Vec::with_capacity(2);
    if !pattern.contains('/') && pattern != "**" {
        globs.push(format!("**/{}", pattern));
    } else {
        globs.push(pattern.clone());
    }

    // `dir/**` also names `dir` itself, which lets an exclude prune the walk
    if let Some(prefix) = globs[0].strip_suffix("/**") {
        if !prefix.is_empty() && prefix != "**" {
            globs.push(prefix.to_owned());
        }
    }
    globs
}

fn compile(patterns: Vec<String>) -> Result<GlobSet, SelectionError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in &patterns {
        for glob in expand_pattern(pattern) {
            let compiled = GlobBuilder::new(&glob)
                .literal_separator(true)
                .backslash_escape(false)
                .build()
                .map_err(|source| SelectionError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(compiled);
        }
    }
    builder.build().map_err(|source| SelectionError::Pattern {
        pattern: patterns.join(","),
        source,
    })
}

/// One selected path, relative to the source root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedPath {
    pub relative: String,
    pub kind: EntryKind,
}

/// Ordered result of a selection walk.
///
/// Files and symlinks appear in walk order. Directories appear only when
/// they matched and nothing below them was selected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub entries: Vec<SelectedPath>,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SelectedPath> {
        self.entries.iter()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.relative.as_str()).collect()
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.entries.iter().any(|e| e.relative == relative)
    }
}

/// Walks a root and picks out the paths a transfer moves
#[derive(Clone)]
pub struct GlobSelector {
    factory: Arc<dyn MatcherFactory>,
}

impl Default for GlobSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobSelector {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(GlobMatcherFactory))
    }

    pub fn with_factory(factory: Arc<dyn MatcherFactory>) -> Self {
        Self { factory }
    }

    pub fn select_spec(&self, root: &Path, spec: &TransferSpec) -> Result<Selection, SelectionError> {
        self.select(root, &spec.include, &spec.exclude, spec.honor_default_excludes)
    }

    /// Select paths under `root`.
    ///
    /// A missing root yields an empty selection. Symlinks are reported, never
    /// followed, and an excluded directory is not descended into.
    pub fn select(
        &self,
        root: &Path,
        include: &str,
        exclude: &str,
        honor_default_excludes: bool,
    ) -> Result<Selection, SelectionError> {
        if std::fs::symlink_metadata(root).is_err() {
            debug!("selection root {} does not exist", root.display());
            return Ok(Selection::default());
        }

        let matcher = if split_patterns(include).is_empty() && split_patterns(exclude).is_empty() {
            None
        } else {
            Some(self.factory.build(include, exclude, honor_default_excludes)?)
        };

        let mut picked: Vec<SelectedPath> = Vec::new();
        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = next.map_err(|e| walk_error(root, e))?;
            let file_type = entry.file_type();
            let Some(relative) = to_wire_path(root, entry.path()) else {
                warn!("skipping {}: name is not valid UTF-8", entry.path().display());
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            };

            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                debug!("skipping special file {}", relative);
                continue;
            };

            if let Some(m) = &matcher {
                if m.is_excluded(&relative) {
                    if kind == EntryKind::Directory {
                        walker.skip_current_dir();
                    }
                    continue;
                }
                if !m.is_included(&relative) {
                    continue;
                }
            }

            if kind == EntryKind::Symlink && !link_target_is_utf8(entry.path()) {
                warn!("skipping {}: link target is not valid UTF-8", relative);
                continue;
            }

            picked.push(SelectedPath { relative, kind });
        }

        // Drop directories that have something selected below them
        let mut ancestors = HashSet::new();
        for entry in &picked {
            let mut current = wire_parent(&entry.relative);
            while let Some(parent) = current {
                if !ancestors.insert(parent.to_owned()) {
                    break;
                }
                current = wire_parent(parent);
            }
        }
        picked.retain(|e| e.kind != EntryKind::Directory || !ancestors.contains(&e.relative));

        debug!("selected {} entries under {}", picked.len(), root.display());
        Ok(Selection { entries: picked })
    }
}

fn link_target_is_utf8(path: &Path) -> bool {
    match std::fs::read_link(path) {
        Ok(target) => target.to_str().is_some(),
        // gone or unreadable; the archiver reports it
        Err(_) => true,
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> SelectionError {
    let path = err
        .path()
        .and_then(|p| to_wire_path(root, p))
        .unwrap_or_else(|| root.display().to_string());
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
    SelectionError::Walk { path, source }
}
