//! Materializing archive entries under a destination root
//!
//! Every entry path is validated with [`safe_path`] and checked against
//! symlinked ancestors before anything is created. Extraction stops at the
//! first failure and does not roll back what was already written.

use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{ExtractionError, ProtocolError};
use crate::path::{flatten_name, safe_path, validate_filename};
use crate::permission::PermissionApplier;
use crate::protocol::{read_exact_or_truncated, read_frame, ArchiveRecord};
use crate::types::{EntryKind, FileEntry};
use crate::{COPY_BUFFER_SIZE, DIGEST_LEN};

/// What the destination filesystem can represent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub symlinks: bool,
}

impl Capabilities {
    pub fn detect() -> Self {
        Self {
            symlinks: cfg!(unix),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}

/// A root that entries are written under
#[derive(Clone, Debug)]
pub struct Destination {
    root: PathBuf,
    flatten: bool,
    capabilities: Capabilities,
    permissions: PermissionApplier,
}

impl Destination {
    pub fn new(root: impl Into<PathBuf>, flatten: bool) -> Self {
        Self {
            root: root.into(),
            flatten,
            capabilities: Capabilities::detect(),
            permissions: PermissionApplier::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionApplier) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flatten(&self) -> bool {
        self.flatten
    }

    /// Where an entry lands, or `None` when it is dropped (directories when
    /// flattening).
    pub fn resolve(&self, entry: &FileEntry) -> Result<Option<PathBuf>, ExtractionError> {
        let full = safe_path(&self.root, &entry.path).map_err(|e| traversal(entry, e))?;
        if !self.flatten {
            return Ok(Some(full));
        }
        if entry.is_dir() {
            return Ok(None);
        }
        let name = flatten_name(&entry.path);
        validate_filename(name).map_err(|e| traversal(entry, e))?;
        Ok(Some(self.root.join(name)))
    }

    /// Refuse to create anything below a symlinked directory
    async fn check_ancestors(&self, entry: &FileEntry, target: &Path) -> Result<(), ExtractionError> {
        let mut current = target.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match tokio::fs::symlink_metadata(dir).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ExtractionError::PathTraversal {
                        path: entry.path.clone(),
                        reason: format!("ancestor {} is a symlink", dir.display()),
                    });
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ExtractionError::write(&entry.path, e)),
            }
            current = dir.parent();
        }
        Ok(())
    }

    async fn prepare(&self, entry: &FileEntry) -> Result<Option<PathBuf>, ExtractionError> {
        let Some(target) = self.resolve(entry)? else {
            return Ok(None);
        };
        self.check_ancestors(entry, &target).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExtractionError::write(&entry.path, e))?;
        }
        Ok(Some(target))
    }

    /// Create a directory entry and restore its metadata
    pub async fn create_directory(&self, entry: &FileEntry) -> Result<(), ExtractionError> {
        let Some(target) = self.prepare(entry).await? else {
            debug!("flatten: dropping directory {}", entry.path);
            return Ok(());
        };
        // a link at the target would carry the metadata outside the root
        remove_existing_link(&target)
            .await
            .map_err(|e| ExtractionError::write(&entry.path, e))?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| ExtractionError::write(&entry.path, e))?;
        self.apply_metadata(&target, entry).await;
        Ok(())
    }

    /// Recreate a symlink, or skip it when the destination can't hold one
    pub async fn create_symlink(&self, entry: &FileEntry) -> Result<(), ExtractionError> {
        let link_target = entry.link_target.clone().unwrap_or_default();
        if !self.capabilities.symlinks {
            warn!(
                "destination does not support symlinks; skipping {} -> {}",
                entry.path, link_target
            );
            return Ok(());
        }
        let Some(target) = self.prepare(entry).await? else {
            return Ok(());
        };
        remove_existing(&target)
            .await
            .map_err(|e| ExtractionError::write(&entry.path, e))?;

        #[cfg(unix)]
        tokio::fs::symlink(&link_target, &target)
            .await
            .map_err(|e| ExtractionError::write(&entry.path, e))?;
        #[cfg(not(unix))]
        warn!("symlink creation not implemented here; skipping {}", entry.path);

        debug!("linked {} -> {}", entry.path, link_target);
        Ok(())
    }

    /// Write exactly `entry.size` bytes from `content` to the entry's target.
    ///
    /// Returns the target and the digest of what was written. Metadata is not
    /// applied yet; call [`Destination::apply_metadata`] once the content is
    /// known to be good.
    pub async fn write_file<R>(
        &self,
        entry: &FileEntry,
        content: &mut R,
    ) -> Result<(PathBuf, blake3::Hash), ExtractionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let target = self
            .prepare(entry)
            .await?
            .ok_or_else(|| ExtractionError::PathTraversal {
                path: entry.path.clone(),
                reason: "file entry has no target".into(),
            })?;

        // Never write through a link left at the target
        remove_existing_link(&target)
            .await
            .map_err(|e| ExtractionError::write(&entry.path, e))?;

        let mut file = File::create(&target)
            .await
            .map_err(|e| ExtractionError::write(&entry.path, e))?;

        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(entry.size.max(1) as usize)];
        let mut remaining = entry.size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = content
                .read(&mut buf[..want])
                .await
                .map_err(|e| ExtractionError::stream(Some(&entry.path), e.into()))?;
            if n == 0 {
                return Err(ExtractionError::stream(
                    Some(&entry.path),
                    ProtocolError::Truncated,
                ));
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| ExtractionError::write(&entry.path, e))?;
            remaining -= n as u64;
        }
        file.flush()
            .await
            .map_err(|e| ExtractionError::write(&entry.path, e))?;

        Ok((target, hasher.finalize()))
    }

    /// Set mtime, then mode. Failures here are warnings.
    pub async fn apply_metadata(&self, target: &Path, entry: &FileEntry) {
        let target = target.to_path_buf();
        let mtime = FileTime::from_unix_time(entry.mtime, entry.mtime_nsec);
        let mode = entry.mode;
        let permissions = self.permissions;
        let path = entry.path.clone();

        let result = tokio::task::spawn_blocking(move || {
            if let Err(e) = filetime::set_file_mtime(&target, mtime) {
                warn!("failed to set modification time on {}: {}", path, e);
            }
            if mode != 0 {
                if let Err(e) = permissions.apply(&target, mode) {
                    warn!("failed to set mode {:o} on {}: {}", mode, path, e);
                }
            }
        })
        .await;
        if let Err(e) = result {
            warn!("metadata task for {} failed: {}", entry.path, e);
        }
    }
}

fn traversal(entry: &FileEntry, err: ProtocolError) -> ExtractionError {
    let reason = match err {
        ProtocolError::PathTraversal(reason) => reason,
        other => other.to_string(),
    };
    ExtractionError::PathTraversal {
        path: entry.path.clone(),
        reason,
    }
}

async fn remove_existing(target: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(target).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(target).await,
        Ok(_) => tokio::fs::remove_file(target).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn remove_existing_link(target: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(target).await {
        Ok(meta) if meta.file_type().is_symlink() => tokio::fs::remove_file(target).await,
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reads an archive stream into a [`Destination`]
#[derive(Clone, Debug)]
pub struct Extractor {
    destination: Destination,
}

impl Extractor {
    pub fn new(destination: Destination) -> Self {
        Self { destination }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Consume records until the end marker. Returns the number of entries.
    pub async fn materialize<R>(&self, reader: &mut R) -> Result<u64, ExtractionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut count = 0u64;
        let mut last: Option<String> = None;

        loop {
            let record: Option<ArchiveRecord> = read_frame(reader)
                .await
                .map_err(|e| ExtractionError::stream(last.as_deref(), e))?;

            let entry = match record {
                None => {
                    return Err(ExtractionError::stream(
                        last.as_deref(),
                        ProtocolError::Truncated,
                    ))
                }
                Some(ArchiveRecord::End { entries }) => {
                    if entries != count {
                        return Err(ExtractionError::stream(
                            last.as_deref(),
                            ProtocolError::CountMismatch {
                                declared: entries,
                                actual: count,
                            },
                        ));
                    }
                    debug!(
                        "extracted {} entries into {}",
                        count,
                        self.destination.root.display()
                    );
                    return Ok(count);
                }
                Some(ArchiveRecord::Entry(entry)) => entry,
            };

            self.extract_entry(&entry, reader).await?;
            count += 1;
            last = Some(entry.path);
        }
    }

    async fn extract_entry<R>(&self, entry: &FileEntry, reader: &mut R) -> Result<(), ExtractionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        debug!("extracting {} ({:?})", entry.path, entry.kind);
        match entry.kind {
            EntryKind::Directory => self.destination.create_directory(entry).await,
            EntryKind::Symlink => self.destination.create_symlink(entry).await,
            EntryKind::File => {
                let (target, digest) = self.destination.write_file(entry, reader).await?;

                let mut trailer = [0u8; DIGEST_LEN];
                read_exact_or_truncated(reader, &mut trailer)
                    .await
                    .map_err(|e| ExtractionError::stream(Some(&entry.path), e))?;
                if digest.as_bytes() != &trailer {
                    return Err(ExtractionError::stream(
                        Some(&entry.path),
                        ProtocolError::ChecksumMismatch(entry.path.clone()),
                    ));
                }

                self.destination.apply_metadata(&target, entry).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archiver;
    use crate::protocol::write_frame;
    use crate::select::GlobSelector;
    use std::fs;
    use tempfile::tempdir;

    async fn archive(root: &Path, include: &str) -> Vec<u8> {
        let selection = GlobSelector::new().select(root, include, "", false).unwrap();
        let mut out = Vec::new();
        Archiver::new(root).serialize(&selection, &mut out).await.unwrap();
        out
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_preserves_metadata() {
        use std::os::unix::fs::{symlink, PermissionsExt};

        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("src")).unwrap();
        fs::create_dir_all(src.path().join("empty")).unwrap();
        fs::write(src.path().join("src/app.txt"), "application").unwrap();
        fs::set_permissions(src.path().join("src/app.txt"), fs::Permissions::from_mode(0o644))
            .unwrap();
        fs::write(src.path().join("tool"), vec![7u8; 300_000]).unwrap();
        fs::set_permissions(src.path().join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("/usr/bin/env", src.path().join("src/run.sh")).unwrap();
        filetime::set_file_mtime(
            src.path().join("src/app.txt"),
            FileTime::from_unix_time(1_600_000_000, 0),
        )
        .unwrap();

        let bytes = archive(src.path(), "**").await;
        let dst = tempdir().unwrap();
        let count = Extractor::new(Destination::new(dst.path(), false))
            .materialize(&mut &bytes[..])
            .await
            .unwrap();
        assert_eq!(count, 4);

        let app = dst.path().join("src/app.txt");
        assert_eq!(fs::read_to_string(&app).unwrap(), "application");
        assert_eq!(fs::metadata(&app).unwrap().permissions().mode() & 0o777, 0o644);
        assert_eq!(
            FileTime::from_last_modification_time(&fs::metadata(&app).unwrap()).unix_seconds(),
            1_600_000_000
        );
        let tool = dst.path().join("tool");
        assert_eq!(fs::metadata(&tool).unwrap().len(), 300_000);
        assert_eq!(fs::metadata(&tool).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(
            fs::read_link(dst.path().join("src/run.sh")).unwrap(),
            PathBuf::from("/usr/bin/env")
        );
        assert!(dst.path().join("empty").is_dir());
    }

    #[tokio::test]
    async fn test_flatten_later_entry_wins() {
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("a")).unwrap();
        fs::create_dir_all(src.path().join("b")).unwrap();
        fs::create_dir_all(src.path().join("c")).unwrap();
        fs::write(src.path().join("a/report.txt"), "first").unwrap();
        fs::write(src.path().join("b/report.txt"), "second").unwrap();

        let bytes = archive(src.path(), "").await;
        let dst = tempdir().unwrap();
        Extractor::new(Destination::new(dst.path(), true))
            .materialize(&mut &bytes[..])
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(dst.path().join("report.txt")).unwrap(),
            "second"
        );
        // empty directory markers are dropped when flattening
        assert!(!dst.path().join("c").exists());
        assert!(!dst.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &ArchiveRecord::Entry(FileEntry::file("../evil.txt", 0, 0o644)))
            .await
            .unwrap();
        bytes.extend_from_slice(blake3::hash(b"").as_bytes());
        write_frame(&mut bytes, &ArchiveRecord::End { entries: 1 })
            .await
            .unwrap();

        let dst = tempdir().unwrap();
        let err = Extractor::new(Destination::new(dst.path().join("out"), false))
            .materialize(&mut &bytes[..])
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::PathTraversal { ref path, .. } if path == "../evil.txt"));
        assert!(!dst.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refuses_symlinked_ancestor() {
        let outside = tempdir().unwrap();
        let dst = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dst.path().join("lib")).unwrap();

        let mut bytes = Vec::new();
        write_frame(&mut bytes, &ArchiveRecord::Entry(FileEntry::file("lib/x.so", 0, 0o644)))
            .await
            .unwrap();
        bytes.extend_from_slice(blake3::hash(b"").as_bytes());

        let err = Extractor::new(Destination::new(dst.path(), false))
            .materialize(&mut &bytes[..])
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::PathTraversal { .. }));
        assert!(!outside.path().join("x.so").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaces_existing_symlink_target() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("config.txt"), "fresh").unwrap();
        let bytes = archive(src.path(), "config.txt").await;

        let outside = tempdir().unwrap();
        fs::write(outside.path().join("victim"), "untouched").unwrap();
        let dst = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("victim"), dst.path().join("config.txt"))
            .unwrap();

        Extractor::new(Destination::new(dst.path(), false))
            .materialize(&mut &bytes[..])
            .await
            .unwrap();
        let meta = fs::symlink_metadata(dst.path().join("config.txt")).unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read_to_string(outside.path().join("victim")).unwrap(), "untouched");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_over_symlink_stays_inside() {
        use std::os::unix::fs::PermissionsExt;

        let outside = tempdir().unwrap();
        fs::set_permissions(outside.path(), fs::Permissions::from_mode(0o700)).unwrap();
        let outside_mtime =
            FileTime::from_last_modification_time(&fs::metadata(outside.path()).unwrap());
        let link_target = outside.path().to_string_lossy().into_owned();

        let mut bytes = Vec::new();
        write_frame(&mut bytes, &ArchiveRecord::Entry(FileEntry::symlink("d", link_target)))
            .await
            .unwrap();
        write_frame(
            &mut bytes,
            &ArchiveRecord::Entry(FileEntry::directory("d", 0o777).with_mtime(1_000_000_000, 0)),
        )
        .await
        .unwrap();
        write_frame(&mut bytes, &ArchiveRecord::End { entries: 2 })
            .await
            .unwrap();

        let dst = tempdir().unwrap();
        Extractor::new(Destination::new(dst.path(), false))
            .materialize(&mut &bytes[..])
            .await
            .unwrap();

        let outside_meta = fs::metadata(outside.path()).unwrap();
        assert_eq!(outside_meta.permissions().mode() & 0o777, 0o700);
        assert_eq!(FileTime::from_last_modification_time(&outside_meta), outside_mtime);
        let inside = fs::symlink_metadata(dst.path().join("d")).unwrap();
        assert!(inside.is_dir());
        assert_eq!(inside.permissions().mode() & 0o777, 0o777);
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("big.bin"), vec![1u8; 10_000]).unwrap();
        let bytes = archive(src.path(), "").await;

        let dst = tempdir().unwrap();
        let extractor = Extractor::new(Destination::new(dst.path(), false));

        let err = extractor.materialize(&mut &bytes[..5_000]).await.unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Stream { source: ProtocolError::Truncated, .. }
        ));

        // missing end marker
        let without_end = &bytes[..bytes.len() - 12];
        let err = extractor.materialize(&mut &without_end[..]).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Stream { .. }));
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("data.bin"), b"payload").unwrap();
        let mut bytes = archive(src.path(), "").await;

        let content_at = bytes
            .windows(7)
            .position(|w| w == b"payload")
            .unwrap();
        bytes[content_at] = b'P';

        let dst = tempdir().unwrap();
        let err = Extractor::new(Destination::new(dst.path(), false))
            .materialize(&mut &bytes[..])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Stream { source: ProtocolError::ChecksumMismatch(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_skips_symlinks_without_support() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &ArchiveRecord::Entry(FileEntry::symlink("run.sh", "/usr/bin/env")))
            .await
            .unwrap();
        write_frame(&mut bytes, &ArchiveRecord::End { entries: 1 })
            .await
            .unwrap();

        let dst = tempdir().unwrap();
        let destination =
            Destination::new(dst.path(), false).with_capabilities(Capabilities { symlinks: false });
        let count = Extractor::new(destination)
            .materialize(&mut &bytes[..])
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(fs::symlink_metadata(dst.path().join("run.sh")).is_err());
    }
}
