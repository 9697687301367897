//! Nodes reachable from the coordinator

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use courier_core::{Config, NodeRole, PermissionApplier, TransferId, TransferSpec};

use crate::channel::{pipe, ChannelError, PipeReader, PipeWriter, RemoteNode, RemoteTask};
use crate::remote::QuicNode;
use crate::worker::JobRunner;

/// A node whose half of the transfer runs as a task in this process,
/// connected through a bounded duplex pipe.
pub struct InProcessNode {
    name: String,
    role: NodeRole,
    pipe_capacity: usize,
    runner: JobRunner,
}

impl InProcessNode {
    pub fn new(name: impl Into<String>, pipe_capacity: usize) -> Self {
        Self {
            name: name.into(),
            role: NodeRole::Worker,
            pipe_capacity,
            runner: JobRunner::default(),
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_runner(mut self, runner: JobRunner) -> Self {
        self.runner = runner;
        self
    }
}

#[async_trait]
impl RemoteNode for InProcessNode {
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
        let (writer, mut reader) = pipe(self.pipe_capacity);
        let runner = self.runner.clone();
        let task = RemoteTask::spawn(self.name.clone(), async move {
            runner.extract(id, root, flatten, &mut reader).await
        });
        Ok((writer, task))
    }

    async fn dispatch_archive(
        &self,
        id: TransferId,
        root: PathBuf,
        spec: TransferSpec,
    ) -> Result<(PipeReader, RemoteTask), ChannelError> {
        let (mut writer, reader) = pipe(self.pipe_capacity);
        let runner = self.runner.clone();
        let task = RemoteTask::spawn(self.name.clone(), async move {
            runner.archive(id, root, spec, &mut writer).await
        });
        Ok((reader, task))
    }

    async fn dispatch_copy(
        &self,
        id: TransferId,
        source_root: PathBuf,
        destination_root: PathBuf,
        spec: TransferSpec,
    ) -> Result<RemoteTask, ChannelError> {
        let runner = self.runner.clone();
        Ok(RemoteTask::spawn(self.name.clone(), async move {
            runner.copy(id, source_root, destination_root, spec).await
        }))
    }
}

/// Named nodes known to the coordinator
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<dyn RemoteNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build nodes from `[[nodes]]`; entries without an address run in-process
    pub fn from_config(config: &Config) -> Result<Self, ChannelError> {
        let registry = Self::new();
        let permissions = PermissionApplier::new(config.permissions.backend);
        for node in &config.nodes {
            let remote: Arc<dyn RemoteNode> = match &node.address {
                Some(_) => Arc::new(QuicNode::from_config(node)?),
                None => Arc::new(
                    InProcessNode::new(node.name.clone(), config.transfer.pipe_capacity)
                        .with_role(node.role)
                        .with_runner(JobRunner::new(permissions)),
                ),
            };
            debug!("registered node {}", node.name);
            registry.register(remote);
        }
        Ok(registry)
    }

    pub fn register(&self, node: Arc<dyn RemoteNode>) {
        self.nodes.insert(node.name().to_owned(), node);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RemoteNode>, ChannelError> {
        self.nodes
            .get(name)
            .map(|n| n.value().clone())
            .ok_or_else(|| ChannelError::UnknownNode(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
