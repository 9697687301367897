//! Courier Core - Selection, archive codec, and extraction for tree transfers
//!
//! This crate contains everything one side of a transfer needs on its own:
//! choosing files under a root, turning them into an archive stream, and
//! materializing that stream under a destination root.
//! It has no dependencies on networking code.

pub mod archive;
pub mod config;
pub mod copy;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod path;
pub mod permission;
pub mod protocol;
pub mod provider;
pub mod select;
pub mod types;

pub use archive::Archiver;
pub use config::{
    Config, NodeConfig, PermissionConfig, ProviderConfig, StageConfig, TransferConfig,
    WorkerConfig,
};
pub use copy::copy_selection;
pub use diagnostics::{Diagnostics, MemoryDiagnostics, TracingDiagnostics};
pub use error::*;
pub use extract::{Capabilities, Destination, Extractor};
pub use permission::{PermissionApplier, PermissionBackend};
pub use protocol::*;
pub use select::{GlobSelector, Selection, SelectedPath};
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Maximum framed record size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Buffer size for copying file content (128 KB)
pub const COPY_BUFFER_SIZE: usize = 128 * 1024;

/// Default capacity of an in-process pipe (64 KB)
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Length of the BLAKE3 digest trailing each file record
pub const DIGEST_LEN: usize = 32;
