//! Streaming archive writer
//!
//! A selection is written as a sequence of length-prefixed records. A file
//! record is followed by its raw content and a BLAKE3 digest, and the stream
//! ends with an `End` record carrying the entry count:
//!
//! ```text
//! [Entry(dir)] [Entry(file)] <size bytes> <32-byte digest> [Entry(link)] ... [End{n}]
//! ```
//!
//! Nothing is buffered beyond one copy buffer, so the writer blocks whenever
//! the reader on the other side of the pipe falls behind.

use std::path::{Path, PathBuf};

use filetime::FileTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ArchiveError, ProtocolError};
use crate::protocol::{write_frame, ArchiveRecord};
use crate::select::{SelectedPath, Selection};
use crate::types::{EntryKind, FileEntry, MODE_MASK};
use crate::COPY_BUFFER_SIZE;

/// Serializes selected paths under a source root
#[derive(Clone, Debug)]
pub struct Archiver {
    root: PathBuf,
}

impl Archiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write every selected entry followed by the end marker.
    ///
    /// Returns the number of entries written. Stops at the first failure;
    /// the stream is then left without an end marker.
    pub async fn serialize<W>(&self, selection: &Selection, out: &mut W) -> Result<u64, ArchiveError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut count = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        for selected in selection.iter() {
            let entry = describe(&self.root, selected).await?;
            debug!("archiving {} ({:?}, {} bytes)", entry.path, entry.kind, entry.size);

            write_frame(out, &ArchiveRecord::Entry(entry.clone()))
                .await
                .map_err(ArchiveError::Stream)?;

            if entry.is_file() {
                let digest = self.write_content(&entry, out, &mut buf).await?;
                out.write_all(digest.as_bytes()).await?;
            }
            count += 1;
        }

        write_frame(out, &ArchiveRecord::End { entries: count })
            .await
            .map_err(ArchiveError::Stream)?;
        out.flush().await?;
        Ok(count)
    }

    async fn write_content<W>(
        &self,
        entry: &FileEntry,
        out: &mut W,
        buf: &mut [u8],
    ) -> Result<blake3::Hash, ArchiveError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let path = source_path(&self.root, &entry.path);
        let mut file = File::open(&path).await.map_err(|source| ArchiveError::Read {
            path: entry.path.clone(),
            source,
        })?;

        let mut hasher = blake3::Hasher::new();
        let mut remaining = entry.size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|source| ArchiveError::Read {
                    path: entry.path.clone(),
                    source,
                })?;
            if n == 0 {
                return Err(ArchiveError::Changed {
                    path: entry.path.clone(),
                    expected: entry.size,
                    actual: entry.size - remaining,
                });
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .await
                .map_err(|e| ArchiveError::Stream(ProtocolError::Io(e)))?;
            remaining -= n as u64;
        }
        Ok(hasher.finalize())
    }
}

/// Absolute location of an archive path under `root`
pub(crate) fn source_path(root: &Path, wire_path: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in wire_path.split('/').filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

/// Read the current metadata of a selected path into an entry header.
pub async fn describe(root: &Path, selected: &SelectedPath) -> Result<FileEntry, ArchiveError> {
    let path = source_path(root, &selected.relative);
    let read_err = |source| ArchiveError::Read {
        path: selected.relative.clone(),
        source,
    };

    let metadata = tokio::fs::symlink_metadata(&path).await.map_err(read_err)?;
    let actual = if metadata.file_type().is_symlink() {
        EntryKind::Symlink
    } else if metadata.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    if actual != selected.kind {
        return Err(ArchiveError::Read {
            path: selected.relative.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("changed from {:?} to {:?} during transfer", selected.kind, actual),
            ),
        });
    }

    let mtime = FileTime::from_last_modification_time(&metadata);
    let mode = mode_bits(&metadata);

    let entry = match actual {
        EntryKind::File => FileEntry::file(selected.relative.clone(), metadata.len(), mode),
        EntryKind::Directory => FileEntry::directory(selected.relative.clone(), mode),
        EntryKind::Symlink => {
            let target = tokio::fs::read_link(&path).await.map_err(read_err)?;
            let target = target.to_str().ok_or_else(|| ArchiveError::Read {
                path: selected.relative.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "link target is not valid UTF-8",
                ),
            })?;
            FileEntry::symlink(selected.relative.clone(), target)
        }
    };
    Ok(entry.with_mtime(mtime.unix_seconds(), mtime.nanoseconds()))
}

#[cfg(unix)]
fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
fn mode_bits(_metadata: &std::fs::Metadata) -> u32 {
    0
}
