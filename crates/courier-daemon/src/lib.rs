//! Courier Daemon - Worker server and transfer orchestrator
//!
//! This crate provides:
//! - The transfer orchestrator that moves a selected tree between endpoints
//! - In-process and QUIC remote nodes that run the far half of a transfer
//! - The worker server answering QUIC jobs
//! - Hook-stage planning for build workspaces
//!
//! # Architecture
//!
//! Every cross-node transfer has two halves joined by one byte stream:
//!
//! ```text
//! ┌──────────────────────────────┐           ┌──────────────────────────────┐
//! │  Orchestrator (local half)   │           │  Remote node (other half)    │
//! │  GlobSelector → Archiver     │ ──pipe──▶ │  Extractor                   │
//! │  Extractor                   │ ◀──pipe── │  GlobSelector → Archiver     │
//! └──────────────────────────────┘           └──────────────────────────────┘
//!                                  bounded
//!                   (duplex in-process, QUIC stream otherwise)
//! ```
//!
//! The remote half is always spawned before the local half starts touching
//! the pipe, so a full buffer can only make the writer wait for the reader.

pub mod channel;
pub mod hooks;
pub mod net;
pub mod node;
pub mod orchestrator;
pub mod remote;
pub mod worker;

pub use channel::{pipe, ChannelError, PipeReader, PipeWriter, RemoteNode, RemoteTask, RemoteTaskError};
pub use hooks::{plan, HookPlan, HookStage, WorkspaceLayout};
pub use node::{InProcessNode, NodeRegistry};
pub use orchestrator::{
    Endpoint, ExecutionContext, Topology, TransferError, TransferOrchestrator, TransferResult,
    TransferSettings,
};
pub use remote::QuicNode;
pub use worker::{JobRunner, WorkerServer};
