//! Transfer orchestration
//!
//! Picks a topology from the two endpoints and drives the local half while
//! the remote half runs on its node:
//!
//! ```text
//! Init ──▶ Streaming ──▶ AwaitingRemote ──▶ Done
//!              │                │
//!              └──────┬─────────┘
//!                     ▼
//!          Failed (local, remote, or both)
//! ```
//!
//! When the local half fails, the remote result is given a short grace
//! period: a remote success means the local error stands alone, a remote
//! failure is reported together with it, and a remote half that is still
//! running is abandoned.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use courier_core::{
    copy_selection, ArchiveError, Archiver, Config, CopyError, Destination, Diagnostics,
    ExtractionError, Extractor, FailureSide, GlobSelector, PermissionApplier, PermissionBackend,
    SelectionError, TransferFailure, TransferId, TransferSpec, TracingDiagnostics,
};

use crate::channel::{ChannelError, RemoteNode, RemoteTask, RemoteTaskError};
use crate::node::NodeRegistry;
use crate::worker::select_in_background;

/// Where one end of a transfer runs
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    /// The calling process
    Local,
    /// A node from the registry
    Node(String),
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Local => write!(f, "local"),
            ExecutionContext::Node(name) => write!(f, "{}", name),
        }
    }
}

/// A root directory in an execution context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub context: ExecutionContext,
    pub root: PathBuf,
}

impl Endpoint {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            context: ExecutionContext::Local,
            root: root.into(),
        }
    }

    pub fn on(node: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            context: ExecutionContext::Node(node.into()),
            root: root.into(),
        }
    }

    /// Parse `node:path` when `node` is known, anything else as a local path
    pub fn parse(spec: &str, is_node: impl Fn(&str) -> bool) -> Self {
        if let Some((node, path)) = spec.split_once(':') {
            if is_node(node) {
                return Self::on(node, path);
            }
        }
        Self::local(spec)
    }

    pub fn is_colocated_with(&self, other: &Endpoint) -> bool {
        self.context == other.context
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context, self.root.display())
    }
}

/// How the bytes move
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    /// Both roots in one context; no stream involved
    CoLocated(ExecutionContext),
    /// Local source, remote destination
    Outbound { node: String },
    /// Remote source, local destination
    Inbound { node: String },
}

impl Topology {
    pub fn between(source: &Endpoint, destination: &Endpoint) -> Result<Self, TransferError> {
        if source.is_colocated_with(destination) {
            return Ok(Topology::CoLocated(source.context.clone()));
        }
        match (&source.context, &destination.context) {
            (ExecutionContext::Local, ExecutionContext::Node(node)) => {
                Ok(Topology::Outbound { node: node.clone() })
            }
            (ExecutionContext::Node(node), ExecutionContext::Local) => {
                Ok(Topology::Inbound { node: node.clone() })
            }
            _ => Err(TransferError::InvalidRequest(format!(
                "cannot transfer between two remote nodes ({} and {})",
                source.context, destination.context
            ))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::CoLocated(ctx) => write!(f, "co-located on {}", ctx),
            Topology::Outbound { node } => write!(f, "outbound to {}", node),
            Topology::Inbound { node } => write!(f, "inbound from {}", node),
        }
    }
}

/// Per-call transfer tuning
#[derive(Clone, Debug)]
pub struct TransferSettings {
    pub remote_timeout: Duration,
    pub failure_grace: Duration,
    pub permissions: PermissionBackend,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(3600),
            failure_grace: Duration::from_secs(3),
            permissions: PermissionBackend::Auto,
        }
    }
}

impl From<&Config> for TransferSettings {
    fn from(config: &Config) -> Self {
        Self {
            remote_timeout: Duration::from_secs(config.transfer.remote_timeout_secs),
            failure_grace: Duration::from_secs(config.transfer.failure_grace_secs),
            permissions: config.permissions.backend,
        }
    }
}

/// A completed transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferResult {
    pub entries: u64,
    pub topology: Topology,
    pub transfer_id: TransferId,
}

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("remote half failed: {0}")]
    Remote(#[from] RemoteTaskError),

    #[error("{local}; remote half also failed: {remote}")]
    Both {
        local: Box<TransferError>,
        remote: RemoteTaskError,
    },
}

impl TransferError {
    /// The side that failed first from the caller's point of view
    pub fn side(&self) -> FailureSide {
        match self {
            TransferError::InvalidRequest(_) => FailureSide::SourceScan,
            TransferError::Selection(e) => e.side(),
            TransferError::Archive(e) => e.side(),
            TransferError::Extraction(e) => e.side(),
            TransferError::Copy(e) => e.side(),
            TransferError::Channel(_) => FailureSide::Channel,
            TransferError::Remote(e) => e.side(),
            TransferError::Both { local, .. } => local.side(),
        }
    }

    /// Offending relative path, when one is known
    pub fn path(&self) -> Option<&str> {
        match self {
            TransferError::InvalidRequest(_) | TransferError::Channel(_) => None,
            TransferError::Selection(e) => e.path(),
            TransferError::Archive(e) => e.path(),
            TransferError::Extraction(e) => e.path(),
            TransferError::Copy(e) => e.path(),
            TransferError::Remote(e) => e.path(),
            TransferError::Both { local, remote } => local.path().or_else(|| remote.path()),
        }
    }

    /// Entries copied before a co-located copy failed
    pub fn copied(&self) -> Option<u64> {
        match self {
            TransferError::Copy(e) => Some(e.copied),
            _ => None,
        }
    }
}

/// Moves filtered trees between endpoints
pub struct TransferOrchestrator {
    nodes: Arc<NodeRegistry>,
    diagnostics: Arc<dyn Diagnostics>,
    selector: GlobSelector,
}

impl TransferOrchestrator {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        Self {
            nodes,
            diagnostics: Arc::new(TracingDiagnostics),
            selector: GlobSelector::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_selector(mut self, selector: GlobSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Copy the selected part of `source` into `destination`.
    pub async fn transfer(
        &self,
        source: &Endpoint,
        destination: &Endpoint,
        spec: &TransferSpec,
        settings: &TransferSettings,
    ) -> Result<TransferResult, TransferError> {
        let transfer_id = TransferId::generate();
        self.diagnostics.line(&format!(
            "[{}] copying {} to {}",
            transfer_id, source, destination
        ));

        let result = match Topology::between(source, destination) {
            Ok(topology) => self
                .run(transfer_id, &topology, source, destination, spec, settings)
                .await
                .map(|entries| TransferResult {
                    entries,
                    topology,
                    transfer_id,
                }),
            Err(e) => Err(e),
        };

        match &result {
            Ok(done) => info!(
                "[{}] transferred {} entries ({})",
                transfer_id, done.entries, done.topology
            ),
            Err(e) => self.diagnostics.line(&format!(
                "[{}] transfer failed ({}): {}",
                transfer_id,
                e.side(),
                e
            )),
        }
        result
    }

    async fn run(
        &self,
        id: TransferId,
        topology: &Topology,
        source: &Endpoint,
        destination: &Endpoint,
        spec: &TransferSpec,
        settings: &TransferSettings,
    ) -> Result<u64, TransferError> {
        match topology {
            Topology::CoLocated(ExecutionContext::Local) => {
                let selection = select_in_background(&self.selector, &source.root, spec).await?;
                let target = Destination::new(destination.root.clone(), spec.flatten)
                    .with_permissions(PermissionApplier::new(settings.permissions));
                Ok(copy_selection(&source.root, &selection, &target).await?)
            }
            Topology::CoLocated(ExecutionContext::Node(name)) => {
                let node = self.node(name)?;
                let task = node
                    .dispatch_copy(id, source.root.clone(), destination.root.clone(), spec.clone())
                    .await?;
                Ok(task.wait(settings.remote_timeout).await?)
            }
            Topology::Outbound { node } => {
                let node = self.node(node)?;
                self.outbound(id, node.as_ref(), source, destination, spec, settings)
                    .await
            }
            Topology::Inbound { node } => {
                let node = self.node(node)?;
                self.inbound(id, node.as_ref(), source, destination, spec, settings)
                    .await
            }
        }
    }

    fn node(&self, name: &str) -> Result<Arc<dyn RemoteNode>, TransferError> {
        Ok(self.nodes.get(name)?)
    }

    async fn outbound(
        &self,
        id: TransferId,
        node: &dyn RemoteNode,
        source: &Endpoint,
        destination: &Endpoint,
        spec: &TransferSpec,
        settings: &TransferSettings,
    ) -> Result<u64, TransferError> {
        let selection = select_in_background(&self.selector, &source.root, spec).await?;

        let (mut writer, task) = node
            .dispatch_extract(id, destination.root.clone(), spec.flatten)
            .await?;
        debug!("[{}] streaming {} entries to {}", id, selection.len(), node.name());

        let streamed = async {
            let count = Archiver::new(&source.root)
                .serialize(&selection, &mut writer)
                .await?;
            writer.shutdown().await.map_err(ArchiveError::from)?;
            Ok::<u64, ArchiveError>(count)
        }
        .await;

        match streamed {
            Ok(count) => {
                let remote = task.wait(settings.remote_timeout).await;
                drop(writer);
                remote?;
                Ok(count)
            }
            Err(e) => {
                drop(writer);
                Err(reconcile(id, e.into(), task, settings.failure_grace).await)
            }
        }
    }

    async fn inbound(
        &self,
        id: TransferId,
        node: &dyn RemoteNode,
        source: &Endpoint,
        destination: &Endpoint,
        spec: &TransferSpec,
        settings: &TransferSettings,
    ) -> Result<u64, TransferError> {
        let (mut reader, task) = node
            .dispatch_archive(id, source.root.clone(), spec.clone())
            .await?;
        debug!("[{}] receiving from {}", id, node.name());

        let target = Destination::new(destination.root.clone(), spec.flatten)
            .with_permissions(PermissionApplier::new(settings.permissions));
        let extracted = Extractor::new(target).materialize(&mut reader).await;

        match extracted {
            Ok(_) => {
                let archived = task.wait(settings.remote_timeout).await;
                drop(reader);
                Ok(archived?)
            }
            Err(e) => {
                drop(reader);
                Err(reconcile(id, e.into(), task, settings.failure_grace).await)
            }
        }
    }
}

/// Combine a local failure with whatever the remote half reports in time
async fn reconcile(
    id: TransferId,
    local: TransferError,
    mut task: RemoteTask,
    grace: Duration,
) -> TransferError {
    match task.wait_within(grace).await {
        Some(Ok(_)) => local,
        Some(Err(remote)) => TransferError::Both {
            local: Box::new(local),
            remote,
        },
        None => {
            warn!(
                "[{}] remote half on {} still running {:?} after local failure; abandoning it",
                id,
                task.node(),
                grace
            );
            task.abort();
            local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{pipe, PipeReader, PipeWriter};
    use crate::node::InProcessNode;
    use crate::worker::JobRunner;
    use async_trait::async_trait;
    use courier_core::{MemoryDiagnostics, NodeRole, RemoteFailure};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn orchestrator(nodes: Vec<Arc<dyn RemoteNode>>) -> (TransferOrchestrator, Arc<MemoryDiagnostics>) {
        let registry = Arc::new(NodeRegistry::new());
        for node in nodes {
            registry.register(node);
        }
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let orch = TransferOrchestrator::new(registry).with_diagnostics(diagnostics.clone());
        (orch, diagnostics)
    }

    fn settings() -> TransferSettings {
        TransferSettings {
            remote_timeout: Duration::from_secs(30),
            failure_grace: Duration::from_millis(200),
            permissions: PermissionBackend::Auto,
        }
    }

    fn fake(behavior: Remote) -> Arc<dyn RemoteNode> {
        Arc::new(FakeNode { behavior })
    }

    fn in_process(name: &str, capacity: usize) -> Arc<dyn RemoteNode> {
        Arc::new(InProcessNode::new(name, capacity))
    }

    fn everything() -> TransferSpec {
        TransferSpec::builder().include("**").build().unwrap()
    }

    fn workspace(root: &Path) {
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("src/app.txt"), "app").unwrap();
        fs::write(root.join(".git/HEAD"), "ref").unwrap();
    }

    /// How the fake remote half behaves
    #[derive(Clone, Copy)]
    enum Remote {
        /// Drain the pipe, then succeed
        Succeed,
        /// Stop reading immediately and fail
        Fail,
        /// Never finish
        Hang,
    }

    struct FakeNode {
        behavior: Remote,
    }

    #[async_trait]
    impl RemoteNode for FakeNode {
        fn name(&self) -> &str {
            "fake"
        }

        fn role(&self) -> NodeRole {
            NodeRole::Worker
        }

        async fn dispatch_extract(
            &self,
            _id: TransferId,
            _root: PathBuf,
            _flatten: bool,
        ) -> Result<(PipeWriter, RemoteTask), ChannelError> {
            let (writer, mut reader) = pipe(64);
            let behavior = self.behavior;
            let task = RemoteTask::spawn("fake", async move {
                match behavior {
                    Remote::Succeed => {
                        let mut sink = Vec::new();
                        let _ = reader.read_to_end(&mut sink).await;
                        Ok(0)
                    }
                    Remote::Fail => {
                        drop(reader);
                        Err(RemoteFailure::new(FailureSide::DestinationWrite, "disk full"))
                    }
                    Remote::Hang => {
                        let _keep = reader;
                        std::future::pending().await
                    }
                }
            });
            Ok((writer, task))
        }

        async fn dispatch_archive(
            &self,
            _id: TransferId,
            _root: PathBuf,
            _spec: TransferSpec,
        ) -> Result<(PipeReader, RemoteTask), ChannelError> {
            let (writer, reader) = pipe(64);
            let behavior = self.behavior;
            let task = RemoteTask::spawn("fake", async move {
                // a bare writer drop is a truncated archive
                drop(writer);
                match behavior {
                    Remote::Succeed => Ok(0),
                    Remote::Fail => Err(RemoteFailure::new(FailureSide::SourceScan, "walk failed")),
                    Remote::Hang => std::future::pending().await,
                }
            });
            Ok((reader, task))
        }

        async fn dispatch_copy(
            &self,
            _id: TransferId,
            _source_root: PathBuf,
            _destination_root: PathBuf,
            _spec: TransferSpec,
        ) -> Result<RemoteTask, ChannelError> {
            Ok(RemoteTask::spawn("fake", async { Ok(0) }))
        }
    }

    #[tokio::test]
    async fn test_colocated_local_copy() {
        let src = tempdir().unwrap();
        workspace(src.path());
        let dst = tempdir().unwrap();
        let (orch, diagnostics) = orchestrator(vec![]);

        let result = orch
            .transfer(
                &Endpoint::local(src.path()),
                &Endpoint::local(dst.path()),
                &everything(),
                &settings(),
            )
            .await
            .unwrap();

        assert_eq!(result.entries, 1);
        assert_eq!(result.topology, Topology::CoLocated(ExecutionContext::Local));
        assert!(dst.path().join("src/app.txt").exists());
        assert!(!dst.path().join(".git").exists());
        assert_eq!(diagnostics.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_outbound_larger_than_pipe() {
        let src = tempdir().unwrap();
        for i in 0..8 {
            fs::write(src.path().join(format!("blob{}.bin", i)), vec![i as u8; 100_000]).unwrap();
        }
        let dst = tempdir().unwrap();
        let (orch, _) = orchestrator(vec![in_process("builder", 4096)]);

        let result = tokio::time::timeout(
            Duration::from_secs(30),
            orch.transfer(
                &Endpoint::local(src.path()),
                &Endpoint::on("builder", dst.path()),
                &everything(),
                &settings(),
            ),
        )
        .await
        .expect("outbound transfer deadlocked")
        .unwrap();

        assert_eq!(result.entries, 8);
        assert_eq!(
            result.topology,
            Topology::Outbound {
                node: "builder".into()
            }
        );
        assert_eq!(
            fs::read(dst.path().join("blob7.bin")).unwrap(),
            vec![7u8; 100_000]
        );
    }

    #[tokio::test]
    async fn test_inbound_and_remote_copy() {
        let remote_ws = tempdir().unwrap();
        workspace(remote_ws.path());
        let local = tempdir().unwrap();
        let (orch, _) = orchestrator(vec![in_process("builder", 512)]);

        let result = orch
            .transfer(
                &Endpoint::on("builder", remote_ws.path()),
                &Endpoint::local(local.path()),
                &everything(),
                &settings(),
            )
            .await
            .unwrap();
        assert_eq!(result.entries, 1);
        assert_eq!(fs::read_to_string(local.path().join("src/app.txt")).unwrap(), "app");

        let copy = orch
            .transfer(
                &Endpoint::on("builder", remote_ws.path()),
                &Endpoint::on("builder", remote_ws.path().join("copy")),
                &TransferSpec::builder().include("src/").build().unwrap(),
                &settings(),
            )
            .await
            .unwrap();
        assert_eq!(copy.entries, 1);
        assert!(remote_ws.path().join("copy/src/app.txt").exists());
    }

    #[tokio::test]
    async fn test_local_failure_with_remote_success() {
        let (orch, diagnostics) = orchestrator(vec![fake(Remote::Succeed)]);
        let local = tempdir().unwrap();

        let err = orch
            .transfer(
                &Endpoint::on("fake", "/remote/ws"),
                &Endpoint::local(local.path()),
                &everything(),
                &settings(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Extraction(_)));
        assert_eq!(err.side(), FailureSide::Stream);
        let lines = diagnostics.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("transfer failed"));
    }

    #[tokio::test]
    async fn test_both_halves_fail() {
        let (orch, _) = orchestrator(vec![fake(Remote::Fail)]);
        let src = tempdir().unwrap();
        fs::write(src.path().join("data.bin"), vec![0u8; 10_000]).unwrap();

        let err = orch
            .transfer(
                &Endpoint::local(src.path()),
                &Endpoint::on("fake", "/remote/ws"),
                &everything(),
                &settings(),
            )
            .await
            .unwrap_err();

        match err {
            TransferError::Both { local, remote } => {
                assert!(matches!(*local, TransferError::Archive(ArchiveError::Stream(_))));
                assert_eq!(remote.side(), FailureSide::DestinationWrite);
            }
            other => panic!("expected both failures, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_hanging_remote_is_abandoned() {
        let (orch, _) = orchestrator(vec![fake(Remote::Hang)]);
        let local = tempdir().unwrap();

        let started = std::time::Instant::now();
        let err = orch
            .transfer(
                &Endpoint::on("fake", "/remote/ws"),
                &Endpoint::local(local.path()),
                &everything(),
                &settings(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Extraction(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (orch, diagnostics) = orchestrator(vec![in_process("a", 64), in_process("b", 64)]);

        let err = orch
            .transfer(
                &Endpoint::on("a", "/ws"),
                &Endpoint::on("b", "/ws"),
                &everything(),
                &settings(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));
        assert_eq!(diagnostics.lines().len(), 2);

        let err = orch
            .transfer(
                &Endpoint::local("/ws"),
                &Endpoint::on("nobody", "/ws"),
                &everything(),
                &settings(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Channel(ChannelError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_partial_local_copy_reports_count() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "a").unwrap();
        fs::write(src.path().join("b.txt"), "b").unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(dst.path().join("b.txt")).unwrap();
        let (orch, _) = orchestrator(vec![]);

        let err = orch
            .transfer(
                &Endpoint::local(src.path()),
                &Endpoint::local(dst.path()),
                &everything(),
                &settings(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.copied(), Some(1));
        assert_eq!(err.path(), Some("b.txt"));
        assert_eq!(err.side(), FailureSide::DestinationWrite);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_outbound_preserves_symlink_and_mode() {
        use std::os::unix::fs::{symlink, PermissionsExt};

        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("src")).unwrap();
        fs::write(src.path().join("src/app.txt"), "app").unwrap();
        fs::set_permissions(
            src.path().join("src/app.txt"),
            fs::Permissions::from_mode(0o644),
        )
        .unwrap();
        symlink("/usr/bin/env", src.path().join("src/run.sh")).unwrap();
        let dst = tempdir().unwrap();
        let (orch, _) = orchestrator(vec![in_process("builder", 256)]);

        let result = orch
            .transfer(
                &Endpoint::local(src.path()),
                &Endpoint::on("builder", dst.path()),
                &everything(),
                &settings(),
            )
            .await
            .unwrap();

        assert_eq!(result.entries, 2);
        let app = dst.path().join("src/app.txt");
        assert_eq!(fs::read_to_string(&app).unwrap(), "app");
        assert_eq!(fs::metadata(&app).unwrap().permissions().mode() & 0o777, 0o644);
        assert_eq!(
            fs::read_link(dst.path().join("src/run.sh")).unwrap(),
            PathBuf::from("/usr/bin/env")
        );
    }

    /// Extracts with a real runner; signals once `PREFIX` bytes have arrived
    /// and reports its result whether or not anyone still holds the task.
    struct GatedNode {
        reached: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
        results: tokio::sync::mpsc::UnboundedSender<Result<u64, RemoteFailure>>,
    }

    const PREFIX: usize = 200_000;

    #[async_trait]
    impl RemoteNode for GatedNode {
        fn name(&self) -> &str {
            "gated"
        }

        fn role(&self) -> NodeRole {
            NodeRole::Worker
        }

        async fn dispatch_extract(
            &self,
            id: TransferId,
            root: PathBuf,
            flatten: bool,
        ) -> Result<(PipeWriter, RemoteTask), ChannelError> {
            let (writer, mut reader) = pipe(256);
            let reached = self.reached.lock().unwrap().take();
            let results = self.results.clone();
            let task = RemoteTask::spawn("gated", async move {
                let mut prefix = vec![0u8; PREFIX];
                let result = match reader.read_exact(&mut prefix).await {
                    Ok(_) => {
                        if let Some(reached) = reached {
                            let _ = reached.send(());
                        }
                        let mut stream = (&prefix[..]).chain(reader);
                        JobRunner::default().extract(id, root, flatten, &mut stream).await
                    }
                    Err(e) => Err(RemoteFailure::new(FailureSide::Stream, e.to_string())),
                };
                let _ = results.send(result.clone());
                result
            });
            Ok((writer, task))
        }

        async fn dispatch_archive(
            &self,
            _id: TransferId,
            _root: PathBuf,
            _spec: TransferSpec,
        ) -> Result<(PipeReader, RemoteTask), ChannelError> {
            Err(ChannelError::StreamOpen("extract only".into()))
        }

        async fn dispatch_copy(
            &self,
            _id: TransferId,
            _source_root: PathBuf,
            _destination_root: PathBuf,
            _spec: TransferSpec,
        ) -> Result<RemoteTask, ChannelError> {
            Err(ChannelError::StreamOpen("extract only".into()))
        }
    }

    #[tokio::test]
    async fn test_cancelled_outbound_truncates_remote() {
        let src = tempdir().unwrap();
        for i in 0..40 {
            fs::write(src.path().join(format!("blob{:02}.bin", i)), vec![i as u8; 65_536]).unwrap();
        }
        let dst = tempdir().unwrap();

        let (reached_tx, reached_rx) = tokio::sync::oneshot::channel();
        let (results_tx, mut results_rx) = tokio::sync::mpsc::unbounded_channel();
        let node: Arc<dyn RemoteNode> = Arc::new(GatedNode {
            reached: std::sync::Mutex::new(Some(reached_tx)),
            results: results_tx,
        });
        let (orch, _) = orchestrator(vec![node]);

        let spec = everything();
        let settings = settings();
        let source = Endpoint::local(src.path());
        let destination = Endpoint::on("gated", dst.path());
        tokio::select! {
            biased;
            reached = reached_rx => reached.unwrap(),
            _ = orch.transfer(&source, &destination, &spec, &settings) => {
                panic!("transfer finished before it was cancelled")
            }
        }

        let result = tokio::time::timeout(Duration::from_secs(10), results_rx.recv())
            .await
            .expect("remote half did not notice the cancelled transfer")
            .unwrap();
        let failure = result.unwrap_err();
        assert_eq!(failure.side, FailureSide::Stream);
        assert!(failure.message.contains("end-of-archive"), "{}", failure.message);

        // entries finished before the cancel are left in place
        assert_eq!(fs::metadata(dst.path().join("blob00.bin")).unwrap().len(), 65_536);
        assert_eq!(fs::metadata(dst.path().join("blob01.bin")).unwrap().len(), 65_536);
        assert!(!dst.path().join("blob39.bin").exists());
    }

    #[test]
    fn test_endpoint_parse() {
        let known = |name: &str| name == "builder";
        assert_eq!(
            Endpoint::parse("builder:/ws", known),
            Endpoint::on("builder", "/ws")
        );
        assert_eq!(Endpoint::parse("/tmp/ws", known), Endpoint::local("/tmp/ws"));
        assert_eq!(
            Endpoint::parse("other:/ws", known),
            Endpoint::local("other:/ws")
        );
        assert_eq!(Endpoint::on("builder", "/ws").to_string(), "builder:/ws");
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.transfer.failure_grace_secs = 7;
        let settings = TransferSettings::from(&config);
        assert_eq!(settings.failure_grace, Duration::from_secs(7));
        assert_eq!(settings.remote_timeout, Duration::from_secs(3600));
    }
}
