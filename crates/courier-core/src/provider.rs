//! Copying named items out of a hierarchical byte-content provider
//!
//! A provider exposes nodes addressed by `/`-separated paths, each holding a
//! byte payload and a list of child names. Includes are resolved against a
//! base path; an include whose last segment contains `*` or `?` is expanded
//! against the children of its parent node.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::path::{flatten_name, safe_path};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("provider I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Addressable byte content
pub trait ContentProvider: Send + Sync {
    /// Payload stored at `path`
    fn read(&self, path: &str) -> Result<Vec<u8>, ProviderError>;

    /// Names of the direct children of `path`
    fn list_children(&self, path: &str) -> Result<Vec<String>, ProviderError>;
}

/// In-memory provider
#[derive(Debug, Default)]
pub struct MemoryProvider {
    nodes: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.nodes.write().insert(normalize_node(path), data.into());
    }
}

fn normalize_node(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}

impl ContentProvider for MemoryProvider {
    fn read(&self, path: &str) -> Result<Vec<u8>, ProviderError> {
        let key = normalize_node(path);
        self.nodes
            .read()
            .get(&key)
            .cloned()
            .ok_or(ProviderError::NotFound(key))
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>, ProviderError> {
        let key = normalize_node(path);
        let prefix = if key == "/" { key.clone() } else { format!("{}/", key) };

        let nodes = self.nodes.read();
        let children: BTreeSet<String> = nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();

        if children.is_empty() && key != "/" && !nodes.contains_key(&key) {
            return Err(ProviderError::NotFound(key));
        }
        Ok(children.into_iter().collect())
    }
}

/// Serves a local directory tree as a provider namespace
#[derive(Clone, Debug)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn locate(&self, path: &str) -> Result<PathBuf, ProviderError> {
        let relative = path.trim_matches('/');
        if relative.is_empty() {
            return Ok(self.root.clone());
        }
        safe_path(&self.root, relative).map_err(|e| ProviderError::InvalidPath {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }
}

impl ContentProvider for DirectoryProvider {
    fn read(&self, path: &str) -> Result<Vec<u8>, ProviderError> {
        let full = self.locate(path)?;
        std::fs::read(&full).map_err(|source| io_error(path, source))
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>, ProviderError> {
        let full = self.locate(path)?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&full).map_err(|source| io_error(path, source))? {
            let entry = entry.map_err(|source| io_error(path, source))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

fn io_error(path: &str, source: io::Error) -> ProviderError {
    if source.kind() == io::ErrorKind::NotFound {
        ProviderError::NotFound(path.to_owned())
    } else {
        ProviderError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// True when `name` matches `pattern`, where `*` matches any run of
/// characters and `?` exactly one.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    match_from(&pattern, &name)
}

fn match_from(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => (0..=name.len()).any(|skip| match_from(rest, &name[skip..])),
        Some(('?', rest)) => !name.is_empty() && match_from(rest, &name[1..]),
        Some((c, rest)) => name.first() == Some(c) && match_from(rest, &name[1..]),
    }
}

pub fn needs_wildcard(item: &str) -> bool {
    item.contains('*') || item.contains('?')
}

/// Resolves includes below a base node and copies them out
#[derive(Clone, Debug)]
pub struct ProviderSource {
    base_path: String,
}

impl ProviderSource {
    /// `/` is the namespace root and contributes nothing to node paths
    pub fn new(base_path: &str) -> Self {
        let base_path = if base_path == "/" {
            String::new()
        } else {
            base_path.trim_end_matches('/').to_owned()
        };
        Self { base_path }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Full node path of an include relative to the base
    pub fn node_path(&self, item: &str) -> String {
        format!("{}/{}", self.base_path, item.trim_start_matches('/'))
    }

    /// Expand a comma-separated include list into concrete item paths.
    ///
    /// A wildcard item whose parent cannot be listed contributes nothing.
    pub fn resolve(
        &self,
        provider: &dyn ContentProvider,
        includes: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let mut resolved = Vec::new();
        for item in includes.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let item = item.trim_start_matches('/');
            let (parent, last) = match item.rfind('/') {
                Some(idx) => (&item[..idx], &item[idx + 1..]),
                None => ("", item),
            };

            if !needs_wildcard(last) {
                resolved.push(item.to_owned());
                continue;
            }

            let children = match provider.list_children(&self.node_path(parent)) {
                Ok(children) => children,
                Err(e) => {
                    warn!("cannot expand {}: {}", item, e);
                    continue;
                }
            };
            for child in children.into_iter().filter(|c| wildcard_match(last, c)) {
                if parent.is_empty() {
                    resolved.push(child);
                } else {
                    resolved.push(format!("{}/{}", parent, child));
                }
            }
        }
        Ok(resolved)
    }

    /// Copy resolved items under `dest_root`. Returns the number of items written.
    pub fn copy_to(
        &self,
        provider: &dyn ContentProvider,
        includes: &str,
        dest_root: &Path,
        flatten: bool,
    ) -> Result<u64, ProviderError> {
        let mut copied = 0;
        for item in self.resolve(provider, includes)? {
            let data = provider.read(&self.node_path(&item))?;

            let relative = if flatten { flatten_name(&item) } else { item.as_str() };
            let target = safe_path(dest_root, relative).map_err(|e| ProviderError::InvalidPath {
                path: item.clone(),
                reason: e.to_string(),
            })?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| ProviderError::Write {
                    path: item.clone(),
                    source,
                })?;
            }
            std::fs::write(&target, &data).map_err(|source| ProviderError::Write {
                path: item.clone(),
                source,
            })?;
            debug!("fetched {} ({} bytes) to {}", item, data.len(), target.display());
            copied += 1;
        }
        Ok(copied)
    }
}

/// `ip:port[,ip:port...]` with dotted IPv4 and a port in 0..=65535
pub fn is_valid_service_address(address: &str) -> bool {
    address.split(',').all(|item| {
        let parts: Vec<&str> = item.split(':').collect();
        parts.len() == 2 && parts[0].parse::<Ipv4Addr>().is_ok() && is_valid_port(parts[1])
    })
}

fn is_valid_port(port: &str) -> bool {
    !port.is_empty()
        && port.bytes().all(|b| b.is_ascii_digit())
        && (port.len() == 1 || !port.starts_with('0'))
        && port.parse::<u16>().is_ok()
}

fn is_word_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// `/` or `/seg/seg...` of word characters
pub fn is_valid_base_path(path: &str) -> bool {
    path == "/" || is_word_path(path)
}

/// Anything from the first `/` on must be `/seg/seg...` of word characters
pub fn is_valid_include_path(include: &str) -> bool {
    match include.find('/') {
        Some(idx) => is_word_path(&include[idx..]),
        None => true,
    }
}
