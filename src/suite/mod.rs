//! Suite-level hook chains
//!
//! A suite carries two chains of hooks:
//!
//! - [`SetupChain`]: ordered steps that are either leader-only (and may
//!   produce a [`Payload`]) or run on every node (and see the payload of the
//!   most recent leader-only step).
//! - [`TeardownChain`]: ordered steps that run on every node, plus at most one
//!   leader-only step that runs after every node finished its own teardown.
//!
//! The chains only describe what to run. Ordering across nodes is enforced by
//! [`crate::coordinator::SuiteCoordinator`].

pub mod fault;
pub mod payload;

pub use fault::{run_guarded, StepFault};
pub use payload::Payload;

use crate::node::NodeId;
use crate::output::NodeOutput;
use std::fmt;
use std::sync::Arc;

/// Hook that runs on the leader only and may produce a payload
pub type LeaderHook = Arc<dyn Fn(&StepContext<'_>) -> anyhow::Result<Option<Payload>> + Send + Sync>;

/// Hook that runs independently on a node
pub type NodeHook = Arc<dyn Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Errors raised while assembling chains
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("teardown chain already has a final leader step \"{existing}\", cannot add \"{rejected}\"")]
    DuplicateFinalStep { existing: String, rejected: String },
}

/// What a step sees while it runs
pub struct StepContext<'a> {
    node: NodeId,
    node_count: u32,
    payload: Option<&'a Payload>,
    output: &'a NodeOutput,
}

impl<'a> StepContext<'a> {
    pub fn new(node: NodeId, node_count: u32, payload: Option<&'a Payload>, output: &'a NodeOutput) -> Self {
        Self {
            node,
            node_count,
            payload,
            output,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    /// Payload from the most recent leader-only setup step, if any
    pub fn payload(&self) -> Option<&'a Payload> {
        self.payload
    }

    /// Write text to this node's output stream
    pub fn say(&self, text: impl AsRef<str>) {
        self.output.say(text.as_ref());
    }

    pub fn output(&self) -> &'a NodeOutput {
        self.output
    }
}

/// Where a setup step runs
#[derive(Clone)]
pub enum SetupKind {
    /// Runs on the leader only; its payload is broadcast to every node
    LeaderOnly(LeaderHook),
    /// Runs on every node with the latest broadcast payload
    AllNodes(NodeHook),
}

#[derive(Clone)]
pub struct SetupStep {
    pub name: String,
    pub kind: SetupKind,
}

impl SetupStep {
    pub fn is_leader_only(&self) -> bool {
        matches!(self.kind, SetupKind::LeaderOnly(_))
    }
}

impl fmt::Debug for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SetupKind::LeaderOnly(_) => "LeaderOnly",
            SetupKind::AllNodes(_) => "AllNodes",
        };
        f.debug_struct("SetupStep")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

/// Ordered setup steps
#[derive(Debug, Clone, Default)]
pub struct SetupChain {
    steps: Vec<SetupStep>,
}

impl SetupChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step that runs on the leader only
    pub fn leader_only<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<Option<Payload>> + Send + Sync + 'static,
    {
        self.steps.push(SetupStep {
            name: name.into(),
            kind: SetupKind::LeaderOnly(Arc::new(hook)),
        });
        self
    }

    /// Append a step that runs on every node
    pub fn all_nodes<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.steps.push(SetupStep {
            name: name.into(),
            kind: SetupKind::AllNodes(Arc::new(hook)),
        });
        self
    }

    pub fn steps(&self) -> &[SetupStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether any leader-only step exists at or after `index`
    pub fn has_leader_step_from(&self, index: usize) -> bool {
        self.steps.iter().skip(index).any(SetupStep::is_leader_only)
    }
}

#[derive(Clone)]
pub struct TeardownStep {
    pub name: String,
    /// Skip this step when the step before it on the same node failed or was skipped
    pub requires_previous: bool,
    pub hook: NodeHook,
}

impl fmt::Debug for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownStep")
            .field("name", &self.name)
            .field("requires_previous", &self.requires_previous)
            .finish()
    }
}

/// Teardown step that runs on the leader after every node finished teardown
#[derive(Clone)]
pub struct FinalStep {
    pub name: String,
    pub hook: NodeHook,
}

impl fmt::Debug for FinalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalStep").field("name", &self.name).finish()
    }
}

/// Teardown steps: per-node steps in order, then the optional final leader step
#[derive(Debug, Clone, Default)]
pub struct TeardownChain {
    steps: Vec<TeardownStep>,
    final_step: Option<FinalStep>,
}

impl TeardownChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step that runs on every node
    pub fn all_nodes<F>(self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(name.into(), false, Arc::new(hook))
    }

    /// Append a step that only runs when the previous step on the node succeeded
    pub fn all_nodes_after_previous<F>(self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(name.into(), true, Arc::new(hook))
    }

    fn push(mut self, name: String, requires_previous: bool, hook: NodeHook) -> Self {
        self.steps.push(TeardownStep {
            name,
            requires_previous,
            hook,
        });
        self
    }

    /// Set the leader step that runs after all nodes finished teardown
    ///
    /// A chain holds at most one such step.
    pub fn leader_after_all<F>(mut self, name: impl Into<String>, hook: F) -> Result<Self, ChainError>
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if let Some(existing) = &self.final_step {
            return Err(ChainError::DuplicateFinalStep {
                existing: existing.name.clone(),
                rejected: name,
            });
        }
        self.final_step = Some(FinalStep {
            name,
            hook: Arc::new(hook),
        });
        Ok(self)
    }

    pub fn steps(&self) -> &[TeardownStep] {
        &self.steps
    }

    pub fn final_step(&self) -> Option<&FinalStep> {
        self.final_step.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.final_step.is_none()
    }
}

/// The suite-level hooks of one test suite
#[derive(Debug, Clone, Default)]
pub struct Suite {
    pub name: String,
    pub setup: SetupChain,
    pub teardown: TeardownChain,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_setup(mut self, setup: SetupChain) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_teardown(mut self, teardown: TeardownChain) -> Self {
        self.teardown = teardown;
        self
    }
}
