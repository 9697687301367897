//! Copy between two roots on the same node
//!
//! No archive stream is involved: entries go straight from the source file to
//! the destination, through the same target resolution and metadata handling
//! the extractor uses.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::archive::{describe, source_path};
use crate::error::{ArchiveError, CopyError, CopyFailure};
use crate::extract::Destination;
use crate::select::Selection;
use crate::types::EntryKind;

/// Copy every selected entry under `source_root` into `destination`.
///
/// On failure the error carries the number of entries that were copied.
pub async fn copy_selection(
    source_root: &Path,
    selection: &Selection,
    destination: &Destination,
) -> Result<u64, CopyError> {
    let mut copied = 0u64;
    for selected in selection.iter() {
        copy_one(source_root, selected, destination)
            .await
            .map_err(|source| CopyError { copied, source })?;
        copied += 1;
    }
    debug!(
        "copied {} entries from {} to {}",
        copied,
        source_root.display(),
        destination.root().display()
    );
    Ok(copied)
}

async fn copy_one(
    source_root: &Path,
    selected: &crate::select::SelectedPath,
    destination: &Destination,
) -> Result<(), CopyFailure> {
    let entry = describe(source_root, selected).await?;
    match entry.kind {
        EntryKind::Directory => destination.create_directory(&entry).await?,
        EntryKind::Symlink => destination.create_symlink(&entry).await?,
        EntryKind::File => {
            let path = source_path(source_root, &entry.path);
            let file = File::open(&path).await.map_err(|source| ArchiveError::Read {
                path: entry.path.clone(),
                source,
            })?;
            let mut content = file.take(entry.size);
            let (target, _) = destination.write_file(&entry, &mut content).await?;
            destination.apply_metadata(&target, &entry).await;
        }
    }
    Ok(())
}
