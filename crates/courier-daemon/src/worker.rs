//! Worker side of a transfer
//!
//! [`JobRunner`] runs one half of a transfer against any byte stream; the
//! in-process node feeds it a duplex pipe and [`WorkerServer`] feeds it QUIC
//! streams.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quinn::{Connection, Endpoint, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use courier_core::{
    check_version, copy_selection, read_frame, write_frame, Archiver, Capabilities, Destination,
    Extractor, FailureSide, GlobSelector, Job, JobEnvelope, JobStatus, PermissionApplier,
    RemoteFailure, Selection, SelectionError, TransferFailure, TransferId, TransferSpec,
    WorkerConfig,
};

use crate::channel::ChannelError;
use crate::net::{create_server_endpoint, IDLE_TIMEOUT};

/// QUIC application error code for an aborted stream
const ABORTED: u32 = 1;

/// Run a selection walk off the async runtime
pub async fn select_in_background(
    selector: &GlobSelector,
    root: &Path,
    spec: &TransferSpec,
) -> Result<Selection, SelectionError> {
    let selector = selector.clone();
    let root = root.to_path_buf();
    let spec = spec.clone();
    let walk_root = root.clone();
    tokio::task::spawn_blocking(move || selector.select_spec(&walk_root, &spec))
        .await
        .map_err(|e| SelectionError::Walk {
            path: root.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?
}

/// Runs the worker half of each job kind
#[derive(Clone)]
pub struct JobRunner {
    selector: GlobSelector,
    permissions: PermissionApplier,
    capabilities: Capabilities,
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new(PermissionApplier::default())
    }
}

impl JobRunner {
    pub fn new(permissions: PermissionApplier) -> Self {
        Self {
            selector: GlobSelector::new(),
            permissions,
            capabilities: Capabilities::detect(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn destination(&self, root: PathBuf, flatten: bool) -> Destination {
        Destination::new(root, flatten)
            .with_capabilities(self.capabilities)
            .with_permissions(self.permissions)
    }

    /// Materialize an archive read from `reader` under `root`
    pub async fn extract<R>(
        &self,
        id: TransferId,
        root: PathBuf,
        flatten: bool,
        reader: &mut R,
    ) -> Result<u64, RemoteFailure>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        debug!("[{}] extracting into {}", id, root.display());
        Extractor::new(self.destination(root, flatten))
            .materialize(reader)
            .await
            .map_err(|e| e.to_remote())
    }

    /// Select under `root` and archive into `writer`, closing it on success.
    ///
    /// On failure the writer is left open; dropping it is how the reader
    /// learns the stream is incomplete.
    pub async fn archive<W>(
        &self,
        id: TransferId,
        root: PathBuf,
        spec: TransferSpec,
        writer: &mut W,
    ) -> Result<u64, RemoteFailure>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        debug!("[{}] archiving {}", id, root.display());
        let selection = select_in_background(&self.selector, &root, &spec)
            .await
            .map_err(|e| e.to_remote())?;
        let count = Archiver::new(root)
            .serialize(&selection, writer)
            .await
            .map_err(|e| e.to_remote())?;
        writer
            .shutdown()
            .await
            .map_err(|e| RemoteFailure::new(FailureSide::Stream, e.to_string()))?;
        Ok(count)
    }

    /// Copy between two roots on this node
    pub async fn copy(
        &self,
        id: TransferId,
        source_root: PathBuf,
        destination_root: PathBuf,
        spec: TransferSpec,
    ) -> Result<u64, RemoteFailure> {
        debug!(
            "[{}] copying {} to {}",
            id,
            source_root.display(),
            destination_root.display()
        );
        let selection = select_in_background(&self.selector, &source_root, &spec)
            .await
            .map_err(|e| e.to_remote())?;
        copy_selection(
            &source_root,
            &selection,
            &self.destination(destination_root, spec.flatten),
        )
        .await
        .map_err(|e| e.to_remote())
    }
}

/// Serves transfer jobs over QUIC, one connection per job
pub struct WorkerServer {
    name: String,
    endpoint: Endpoint,
    runner: JobRunner,
    connection_semaphore: Arc<Semaphore>,
}

impl WorkerServer {
    /// Bind the worker endpoint. Port 0 picks a free port.
    pub fn bind(config: &WorkerConfig, runner: JobRunner) -> Result<Self, ChannelError> {
        let bind_addr = SocketAddr::new(config.bind, config.port);
        let (endpoint, _fingerprint) = create_server_endpoint(bind_addr)?;
        let name = config.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "courier-worker".into())
        });

        Ok(Self {
            name,
            endpoint,
            runner,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accept jobs until the endpoint is closed
    pub async fn serve(&self) -> Result<(), ChannelError> {
        info!(
            "Courier worker {} listening on {}",
            self.name,
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into())
        );

        while let Some(incoming) = self.endpoint.accept().await {
            let permit = match self.connection_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("connection limit reached");
                    continue;
                }
            };
            let runner = self.runner.clone();

            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        let remote = connection.remote_address();
                        debug!("job connection from {}", remote);
                        if let Err(e) = handle_connection(connection, runner).await {
                            error!("Job from {} failed: {}", remote, e);
                        }
                    }
                    Err(e) => {
                        warn!("Connection failed: {}", e);
                    }
                }
                drop(permit);
            });
        }

        Ok(())
    }

    /// Stop accepting jobs
    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

/// Run the single job carried by a connection
async fn handle_connection(connection: Connection, runner: JobRunner) -> Result<(), ChannelError> {
    let (mut send, mut recv) = connection
        .accept_bi()
        .await
        .map_err(|e| ChannelError::StreamAccept(e.to_string()))?;

    let envelope: JobEnvelope = read_frame(&mut recv)
        .await?
        .ok_or_else(|| ChannelError::Receive("stream closed before job envelope".into()))?;

    if let Err(e) = check_version(&envelope) {
        let status = JobStatus::Failed(RemoteFailure::new(FailureSide::Channel, e.to_string()));
        write_frame(&mut send, &status).await?;
        let _ = send.finish();
        // dropping the connection now could discard the status
        let _ = tokio::time::timeout(IDLE_TIMEOUT, connection.closed()).await;
        return Err(e.into());
    }

    let id = envelope.transfer_id;
    info!("[{}] running {} job", id, envelope.job.name());

    let result = match envelope.job {
        Job::Extract { root, flatten } => {
            let result = runner.extract(id, root, flatten, &mut recv).await;
            if result.is_err() {
                // unblock a sender still writing into a full window
                let _ = recv.stop(VarInt::from_u32(ABORTED));
            }
            result
        }
        Job::Archive { root, spec } => {
            let mut archive = connection
                .open_uni()
                .await
                .map_err(|e| ChannelError::StreamOpen(e.to_string()))?;
            let result = runner.archive(id, root, spec, &mut archive).await;
            if result.is_err() {
                let _ = archive.reset(VarInt::from_u32(ABORTED));
            }
            result
        }
        Job::Copy {
            source_root,
            destination_root,
            spec,
        } => runner.copy(id, source_root, destination_root, spec).await,
    };

    match &result {
        Ok(entries) => info!("[{}] job completed ({} entries)", id, entries),
        Err(failure) => warn!("[{}] job failed: {}", id, failure),
    }

    write_frame(&mut send, &JobStatus::from(result)).await?;
    send.finish()
        .map_err(|e| ChannelError::Send(e.to_string()))?;

    // the client drops the connection once it has everything it needs
    let _ = tokio::time::timeout(IDLE_TIMEOUT, connection.closed()).await;
    Ok(())
}
