//! The byte channel between the two halves of a transfer
//!
//! ```text
//!   local half                                   remote half
//! ┌──────────────┐  PipeWriter ──────▶ PipeReader ┌──────────────┐
//! │ Archiver     │  (duplex or QUIC stream)       │ Extractor    │
//! └──────────────┘                                └──────────────┘
//!         ▲                                              │
//!         └──────────── RemoteTask (result) ◀────────────┘
//! ```
//!
//! # Deadlock Prevention
//!
//! The pipe is bounded, so the remote half must be running before the local
//! half writes or reads its first byte. [`RemoteNode`] dispatch methods
//! therefore start the remote half and return immediately with a
//! [`RemoteTask`]; its result is awaited only after the local half is done.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

use courier_core::{FailureSide, NodeRole, ProtocolError, RemoteFailure, TransferId, TransferSpec};

/// Read end of a transfer pipe
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write end of a transfer pipe
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bounded in-process pipe. Dropping the writer is end-of-stream for the
/// reader; dropping the reader makes further writes fail.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (writer, reader) = tokio::io::duplex(capacity.max(1));
    (Box::new(writer), Box::new(reader))
}

/// Errors setting up or using the channel to a node
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to open stream: {0}")]
    StreamOpen(String),

    #[error("failed to accept stream: {0}")]
    StreamAccept(String),

    #[error("failed to send: {0}")]
    Send(String),

    #[error("failed to receive: {0}")]
    Receive(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("worker rejected job: {0}")]
    Rejected(RemoteFailure),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Why waiting on the remote half did not produce a count
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteTaskError {
    #[error("{0}")]
    Failed(RemoteFailure),

    #[error("remote half did not finish within {0:?}")]
    Timeout(Duration),

    #[error("remote half was aborted: {0}")]
    Aborted(String),
}

impl RemoteTaskError {
    pub fn side(&self) -> FailureSide {
        match self {
            RemoteTaskError::Failed(failure) => failure.side,
            RemoteTaskError::Timeout(_) | RemoteTaskError::Aborted(_) => FailureSide::Channel,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            RemoteTaskError::Failed(failure) => failure.path.as_deref(),
            _ => None,
        }
    }
}

/// Handle on the half of a transfer running elsewhere
pub struct RemoteTask {
    node: String,
    handle: JoinHandle<Result<u64, RemoteFailure>>,
}

impl RemoteTask {
    pub fn spawn<F>(node: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<u64, RemoteFailure>> + Send + 'static,
    {
        Self {
            node: node.into(),
            handle: tokio::spawn(fut),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Wait for the result, aborting the task once `limit` passes
    pub async fn wait(mut self, limit: Duration) -> Result<u64, RemoteTaskError> {
        match tokio::time::timeout(limit, &mut self.handle).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                self.handle.abort();
                Err(RemoteTaskError::Timeout(limit))
            }
        }
    }

    /// Wait up to `grace`; `None` if the task is still running
    pub async fn wait_within(&mut self, grace: Duration) -> Option<Result<u64, RemoteTaskError>> {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(joined) => Some(flatten(joined)),
            Err(_) => None,
        }
    }

    pub fn abort(self) {
        debug!("aborting remote half on {}", self.node);
        self.handle.abort();
    }
}

fn flatten(
    joined: Result<Result<u64, RemoteFailure>, tokio::task::JoinError>,
) -> Result<u64, RemoteTaskError> {
    match joined {
        Ok(Ok(entries)) => Ok(entries),
        Ok(Err(failure)) => Err(RemoteTaskError::Failed(failure)),
        Err(e) => Err(RemoteTaskError::Aborted(e.to_string())),
    }
}

/// A node that can run one half of a transfer
#[async_trait]
pub trait RemoteNode: Send + Sync {
    fn name(&self) -> &str;

    fn role(&self) -> NodeRole;

    /// Start extracting under `root`; archive bytes go into the returned writer
    async fn dispatch_extract(
        &self,
        id: TransferId,
        root: PathBuf,
        flatten: bool,
    ) -> Result<(PipeWriter, RemoteTask), ChannelError>;

    /// Start archiving `root`; archive bytes come out of the returned reader
    async fn dispatch_archive(
        &self,
        id: TransferId,
        root: PathBuf,
        spec: TransferSpec,
    ) -> Result<(PipeReader, RemoteTask), ChannelError>;

    /// Run a copy entirely on the node
    async fn dispatch_copy(
        &self,
        id: TransferId,
        source_root: PathBuf,
        destination_root: PathBuf,
        spec: TransferSpec,
    ) -> Result<RemoteTask, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_eof_on_writer_drop() {
        let (mut writer, mut reader) = pipe(16);
        let producer = tokio::spawn(async move {
            writer.write_all(&[9u8; 100]).await.unwrap();
        });
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        producer.await.unwrap();
        assert_eq!(received.len(), 100);
    }

    #[tokio::test]
    async fn test_pipe_write_fails_after_reader_drop() {
        let (mut writer, reader) = pipe(16);
        drop(reader);
        assert!(writer.write_all(b"lost").await.is_err());
    }

    #[tokio::test]
    async fn test_remote_task_outcomes() {
        let ok = RemoteTask::spawn("n1", async { Ok(4) });
        assert_eq!(ok.wait(Duration::from_secs(1)).await, Ok(4));

        let failed = RemoteTask::spawn("n1", async {
            Err(RemoteFailure::new(FailureSide::DestinationWrite, "disk full"))
        });
        let err = failed.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.side(), FailureSide::DestinationWrite);

        let hung = RemoteTask::spawn("n1", std::future::pending());
        assert_eq!(
            hung.wait(Duration::from_millis(20)).await,
            Err(RemoteTaskError::Timeout(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn test_wait_within_grace() {
        let mut hung = RemoteTask::spawn("n1", std::future::pending());
        assert!(hung.wait_within(Duration::from_millis(10)).await.is_none());
        hung.abort();

        let mut quick = RemoteTask::spawn("n1", async { Ok(1) });
        assert_eq!(quick.wait_within(Duration::from_secs(1)).await, Some(Ok(1)));
    }
}
