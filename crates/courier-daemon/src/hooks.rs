//! Build-stage hooks
//!
//! A job that runs on a worker gets the coordinator's workspace copied in
//! before the build and copied back after it finalizes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use courier_core::StageConfig;

use crate::orchestrator::{Endpoint, ExecutionContext};

/// When a hook copy runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HookStage {
    /// Coordinator workspace to worker workspace
    BeforeBuild,
    /// Worker workspace back to the coordinator
    AfterFinalize,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::BeforeBuild => write!(f, "before-build"),
            HookStage::AfterFinalize => write!(f, "after-finalize"),
        }
    }
}

impl FromStr for HookStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before-build" => Ok(HookStage::BeforeBuild),
            "after-finalize" => Ok(HookStage::AfterFinalize),
            other => Err(format!("unknown hook stage: {}", other)),
        }
    }
}

/// Where the coordinator keeps a project's workspace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub custom_workspace: Option<PathBuf>,
    pub project_root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            custom_workspace: None,
            project_root: project_root.into(),
        }
    }

    pub fn with_custom_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.custom_workspace = Some(workspace.into());
        self
    }

    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            custom_workspace: config.custom_workspace.clone(),
            project_root: config.project_root.clone(),
        }
    }

    /// The custom workspace when set, else `<project_root>/workspace`
    pub fn coordinator_workspace(&self) -> PathBuf {
        match &self.custom_workspace {
            Some(custom) => custom.clone(),
            None => self.project_root.join("workspace"),
        }
    }
}

/// The copy a hook performs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookPlan {
    pub stage: HookStage,
    pub source: Endpoint,
    pub destination: Endpoint,
}

/// Plan the hook copy for a job running in `job_context`.
///
/// Returns `None` when the job runs on the coordinator itself.
pub fn plan(
    stage: HookStage,
    job_context: &ExecutionContext,
    layout: &WorkspaceLayout,
    worker_workspace: &Path,
) -> Option<HookPlan> {
    let node = match job_context {
        ExecutionContext::Local => return None,
        ExecutionContext::Node(node) => node,
    };

    let coordinator = Endpoint::local(layout.coordinator_workspace());
    let worker = Endpoint::on(node.clone(), worker_workspace);
    let (source, destination) = match stage {
        HookStage::BeforeBuild => (coordinator, worker),
        HookStage::AfterFinalize => (worker, coordinator),
    };

    Some(HookPlan {
        stage,
        source,
        destination,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_before_build_pushes_to_worker() {
        let layout = WorkspaceLayout::new("/var/courier/jobs/app");
        let plan = plan(
            HookStage::BeforeBuild,
            &ExecutionContext::Node("builder".into()),
            &layout,
            Path::new("/home/build/ws"),
        )
        .unwrap();

        assert_eq!(
            plan.source,
            Endpoint::local("/var/courier/jobs/app/workspace")
        );
        assert_eq!(plan.destination, Endpoint::on("builder", "/home/build/ws"));
    }

    #[test]
    fn test_after_finalize_pulls_back() {
        let layout = WorkspaceLayout::new("/jobs/app").with_custom_workspace("/srv/ws");
        let plan = plan(
            HookStage::AfterFinalize,
            &ExecutionContext::Node("builder".into()),
            &layout,
            Path::new("/home/build/ws"),
        )
        .unwrap();

        assert_eq!(plan.source, Endpoint::on("builder", "/home/build/ws"));
        assert_eq!(plan.destination, Endpoint::local("/srv/ws"));
    }

    #[test]
    fn test_no_hook_on_coordinator() {
        let layout = WorkspaceLayout::new("/jobs/app");
        assert!(plan(
            HookStage::BeforeBuild,
            &ExecutionContext::Local,
            &layout,
            Path::new("/ws"),
        )
        .is_none());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!("after-finalize".parse::<HookStage>(), Ok(HookStage::AfterFinalize));
        assert_eq!(HookStage::BeforeBuild.to_string(), "before-build");
        assert!("during".parse::<HookStage>().is_err());
    }

    #[test]
    fn test_layout_from_config() {
        let config = StageConfig {
            custom_workspace: None,
            project_root: PathBuf::from("/jobs/lib"),
        };
        assert_eq!(
            WorkspaceLayout::from_config(&config).coordinator_workspace(),
            PathBuf::from("/jobs/lib/workspace")
        );
    }
}
