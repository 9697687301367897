//! Client side of the worker protocol
//!
//! Each dispatch opens one QUIC connection:
//! - extract: the archive follows the job envelope on the bidirectional stream
//! - archive: the worker opens a unidirectional stream carrying the archive
//! - copy: nothing but the envelope and the status
//!
//! The final `JobStatus` always arrives on the bidirectional stream and is
//! read by the returned [`RemoteTask`]. A worker that rejects an archive job
//! sends its status without ever opening the archive stream.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use async_trait::async_trait;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tracing::debug;

use courier_core::{
    read_frame, write_frame, FailureSide, Job, JobEnvelope, JobStatus, NodeConfig, NodeRole,
    RemoteFailure, TransferId, TransferSpec,
};

use crate::channel::{
    ChannelError, PipeReader, PipeWriter, RemoteNode, RemoteTask, RemoteTaskError,
};
use crate::net::{connect, create_client_endpoint, IDLE_TIMEOUT};

/// A worker reached over QUIC
pub struct QuicNode {
    name: String,
    role: NodeRole,
    addr: SocketAddr,
    server_name: String,
    endpoint: Endpoint,
}

impl QuicNode {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        server_name: impl Into<String>,
        role: NodeRole,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            name: name.into(),
            role,
            addr,
            server_name: server_name.into(),
            endpoint: create_client_endpoint()?,
        })
    }

    pub fn from_config(config: &NodeConfig) -> Result<Self, ChannelError> {
        let address = config
            .address
            .as_deref()
            .ok_or_else(|| ChannelError::Connect(format!("node {} has no address", config.name)))?;
        let addr = address
            .to_socket_addrs()
            .map_err(|e| ChannelError::Connect(format!("{}: {}", address, e)))?
            .next()
            .ok_or_else(|| ChannelError::Connect(format!("{} did not resolve", address)))?;
        Self::new(config.name.clone(), addr, config.server_name.clone(), config.role)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn open(
        &self,
        envelope: JobEnvelope,
    ) -> Result<(Connection, SendStream, RecvStream), ChannelError> {
        let connection = connect(&self.endpoint, self.addr, &self.server_name).await?;
        let (mut send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| ChannelError::StreamOpen(e.to_string()))?;
        debug!(
            "[{}] sending {} job to {}",
            envelope.transfer_id,
            envelope.job.name(),
            self.name
        );
        write_frame(&mut send, &envelope).await?;
        Ok((connection, send, recv))
    }

    /// Send an archive job and wait for either the archive stream or an
    /// early status.
    async fn request_archive(
        &self,
        envelope: JobEnvelope,
    ) -> Result<(PipeReader, RemoteTask), ChannelError> {
        let (connection, mut send, recv) = self.open(envelope).await?;
        send.finish()
            .map_err(|e| ChannelError::Send(e.to_string()))?;

        let mut status = self.status_task(connection.clone(), recv);
        let first = tokio::select! {
            biased;
            accepted = connection.accept_uni() => Ok(accepted),
            finished = status.wait_within(IDLE_TIMEOUT) => Err(finished),
        };

        match first {
            Ok(accepted) => {
                let archive = accepted.map_err(|e| ChannelError::StreamAccept(e.to_string()))?;
                Ok((Box::new(archive), status))
            }
            Err(Some(Ok(entries))) => {
                // status won the race; the stream is still buffered
                let archive = connection
                    .accept_uni()
                    .await
                    .map_err(|e| ChannelError::StreamAccept(e.to_string()))?;
                let done = RemoteTask::spawn(self.name.clone(), async move { Ok(entries) });
                Ok((Box::new(archive), done))
            }
            Err(Some(Err(RemoteTaskError::Failed(failure)))) => Err(ChannelError::Rejected(failure)),
            Err(Some(Err(other))) => Err(ChannelError::Receive(other.to_string())),
            Err(None) => {
                status.abort();
                Err(ChannelError::StreamAccept(format!(
                    "no archive stream from {} within {:?}",
                    self.name, IDLE_TIMEOUT
                )))
            }
        }
    }

    /// Read the worker's status once it is sent
    fn status_task(&self, connection: Connection, mut recv: RecvStream) -> RemoteTask {
        RemoteTask::spawn(self.name.clone(), async move {
            let status: Option<JobStatus> = read_frame(&mut recv)
                .await
                .map_err(|e| RemoteFailure::new(FailureSide::Channel, e.to_string()))?;
            // streams still held by the caller keep the connection open
            drop(connection);
            match status {
                Some(status) => status.into_result(),
                None => Err(RemoteFailure::new(
                    FailureSide::Channel,
                    "worker closed the job stream without a status",
                )),
            }
        })
    }
}

#[async_trait]
impl RemoteNode for QuicNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> NodeRole {
        self.role
    }

    async fn dispatch_extract(
        &self,
        id: TransferId,
        root: PathBuf,
        flatten: bool,
    ) -> Result<(PipeWriter, RemoteTask), ChannelError> {
        let (connection, send, recv) = self
            .open(JobEnvelope::new(id, Job::Extract { root, flatten }))
            .await?;
        let task = self.status_task(connection, recv);
        Ok((Box::new(send), task))
    }

    async fn dispatch_archive(
        &self,
        id: TransferId,
        root: PathBuf,
        spec: TransferSpec,
    ) -> Result<(PipeReader, RemoteTask), ChannelError> {
        self.request_archive(JobEnvelope::new(id, Job::Archive { root, spec }))
            .await
    }

    async fn dispatch_copy(
        &self,
        id: TransferId,
        source_root: PathBuf,
        destination_root: PathBuf,
        spec: TransferSpec,
    ) -> Result<RemoteTask, ChannelError> {
        let job = Job::Copy {
            source_root,
            destination_root,
            spec,
        };
        let (connection, mut send, recv) = self.open(JobEnvelope::new(id, job)).await?;
        send.finish()
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        Ok(self.status_task(connection, recv))
    }
}
