//! Failure classification and run results
//!
//! [`FailureReporter`] is created once per node and sees every failure the
//! node hits. It records a typed [`FailureRecord`], writes a marker line to
//! the node's output, and answers whether the node's specs must be skipped.
//! [`NodeReport`] and [`RunSummary`] are what the reporting and process-exit
//! collaborators consume.

use crate::node::{join_nodes, NodeId};
use crate::output::NodeOutput;
use crate::suite::StepFault;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Marker written for failures caused by a runtime fault
pub const PANIC_MARKER: &str = "Test Panicked";

/// Phase a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Spec,
    Teardown,
}

/// Outcome of running one chain on one node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhaseResult {
    #[default]
    Success,
    Failed {
        step: String,
        cause: String,
        is_panic: bool,
    },
}

impl PhaseResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PhaseResult::Success)
    }

    pub fn is_failed(&self) -> bool {
        !self.is_success()
    }
}

impl From<StepFault> for PhaseResult {
    fn from(fault: StepFault) -> Self {
        PhaseResult::Failed {
            step: fault.step,
            cause: fault.cause,
            is_panic: fault.is_panic,
        }
    }
}

impl From<&StepFault> for PhaseResult {
    fn from(fault: &StepFault) -> Self {
        fault.clone().into()
    }
}

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Leader-only or all-nodes setup step failed; the node's specs are skipped
    SetupFailure,
    /// A teardown step failed
    TeardownFailure,
    /// Broadcast or signal delivery failed
    TransportError,
    /// Not every follower signalled teardown completion in time
    BarrierTimeout,
    /// A spec reported a failure
    SpecFailure,
    /// A spec panicked
    SpecPanic,
}

impl FailureKind {
    /// Classify a failed step by phase
    pub fn classify(phase: Phase, is_panic: bool) -> Self {
        match (phase, is_panic) {
            (Phase::Setup, _) => FailureKind::SetupFailure,
            (Phase::Teardown, _) => FailureKind::TeardownFailure,
            (Phase::Spec, true) => FailureKind::SpecPanic,
            (Phase::Spec, false) => FailureKind::SpecFailure,
        }
    }

    fn label(self) -> &'static str {
        match self {
            FailureKind::SetupFailure => "suite setup",
            FailureKind::TeardownFailure => "suite teardown",
            FailureKind::TransportError => "transport",
            FailureKind::BarrierTimeout => "teardown barrier",
            FailureKind::SpecFailure | FailureKind::SpecPanic => "spec",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::SetupFailure => "SetupFailure",
            FailureKind::TeardownFailure => "TeardownFailure",
            FailureKind::TransportError => "TransportError",
            FailureKind::BarrierTimeout => "BarrierTimeout",
            FailureKind::SpecFailure => "SpecFailure",
            FailureKind::SpecPanic => "SpecPanic",
        };
        write!(f, "{}", name)
    }
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub node: NodeId,
    pub kind: FailureKind,
    pub step: Option<String>,
    pub cause: String,
    pub is_panic: bool,
}

impl FailureRecord {
    /// The marker line written to the node's output
    pub fn marker(&self) -> String {
        let fault = if self.is_panic { PANIC_MARKER } else { "Failure" };
        match &self.step {
            Some(step) => format!(
                "[FAIL] {} \"{}\" on node {}: {}: {}",
                self.kind.label(),
                step,
                self.node,
                fault,
                self.cause
            ),
            None => format!(
                "[FAIL] {} on node {}: {}: {}",
                self.kind.label(),
                self.node,
                fault,
                self.cause
            ),
        }
    }
}

/// Result of one spec body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecOutcome {
    Passed,
    Failed { message: String },
    Panicked { message: String },
    Skipped,
    /// Never started because suite setup failed on the node
    NotRun,
}

impl SpecOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        SpecOutcome::Failed {
            message: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SpecOutcome::Failed { .. } | SpecOutcome::Panicked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecResult {
    pub name: String,
    pub outcome: SpecOutcome,
}

/// Records and announces failures for one node
#[derive(Debug)]
pub struct FailureReporter {
    node: NodeId,
    output: NodeOutput,
    failures: Vec<FailureRecord>,
    skipped_steps: Vec<String>,
}

impl FailureReporter {
    pub fn new(output: NodeOutput) -> Self {
        Self {
            node: output.node(),
            output,
            failures: Vec::new(),
            skipped_steps: Vec::new(),
        }
    }

    /// Record a failed step of the given phase
    pub fn record_step(&mut self, phase: Phase, fault: &StepFault) -> FailureKind {
        let kind = FailureKind::classify(phase, fault.is_panic);
        self.push(FailureRecord {
            node: self.node,
            kind,
            step: Some(fault.step.clone()),
            cause: fault.cause.clone(),
            is_panic: fault.is_panic,
        });
        kind
    }

    pub fn record_setup(&mut self, fault: &StepFault) {
        self.record_step(Phase::Setup, fault);
    }

    pub fn record_teardown(&mut self, fault: &StepFault) {
        self.record_step(Phase::Teardown, fault);
    }

    pub fn record_transport(&mut self, context: &str, error: impl fmt::Display) {
        self.push(FailureRecord {
            node: self.node,
            kind: FailureKind::TransportError,
            step: None,
            cause: format!("{}: {}", context, error),
            is_panic: false,
        });
    }

    pub fn record_barrier_timeout(&mut self, missing: &[NodeId]) {
        self.push(FailureRecord {
            node: self.node,
            kind: FailureKind::BarrierTimeout,
            step: None,
            cause: format!(
                "no teardown completion from node(s) {}; running final teardown anyway",
                join_nodes(missing)
            ),
            is_panic: false,
        });
    }

    /// Record a spec result; only failures produce a record
    pub fn record_spec(&mut self, result: &SpecResult) {
        let (message, is_panic) = match &result.outcome {
            SpecOutcome::Failed { message } => (message, false),
            SpecOutcome::Panicked { message } => (message, true),
            _ => return,
        };
        self.push(FailureRecord {
            node: self.node,
            kind: FailureKind::classify(Phase::Spec, is_panic),
            step: Some(result.name.clone()),
            cause: message.clone(),
            is_panic,
        });
    }

    /// Note a step that was not attempted
    pub fn record_skipped_step(&mut self, phase: Phase, step: &str, reason: &str) {
        let label = match phase {
            Phase::Setup => "suite setup",
            Phase::Spec => "spec",
            Phase::Teardown => "suite teardown",
        };
        self.output
            .say(&format!("[SKIP] {} \"{}\" on node {}: {}", label, step, self.node, reason));
        self.skipped_steps.push(step.to_string());
    }

    fn push(&mut self, record: FailureRecord) {
        tracing::warn!(node = self.node.get(), kind = %record.kind, cause = %record.cause, "failure recorded");
        self.output.say(&record.marker());
        self.failures.push(record);
    }

    /// Whether the node's specs must be skipped
    pub fn should_skip_specs(&self) -> bool {
        self.failures.iter().any(|f| f.kind == FailureKind::SetupFailure)
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    pub fn skipped_steps(&self) -> &[String] {
        &self.skipped_steps
    }

    pub fn into_failures(self) -> Vec<FailureRecord> {
        self.failures
    }
}

/// Everything one node reports at the end of the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub setup: PhaseResult,
    pub specs: Vec<SpecResult>,
    pub teardown: PhaseResult,
    pub failures: Vec<FailureRecord>,
    /// Followers the leader gave up waiting for (leader only)
    #[serde(default)]
    pub missing_followers: Vec<NodeId>,
}

impl NodeReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn count(&self, pred: impl Fn(&SpecOutcome) -> bool) -> usize {
        self.specs.iter().filter(|s| pred(&s.outcome)).count()
    }
}

/// Merged result of every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub node_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<NodeId, NodeReport>,
    /// Failures detected outside any node (missing reports, relay errors)
    #[serde(default)]
    pub run_failures: Vec<FailureRecord>,
}

impl RunSummary {
    pub fn new(node_count: u32) -> Self {
        Self {
            node_count,
            started_at: Utc::now(),
            finished_at: None,
            nodes: BTreeMap::new(),
            run_failures: Vec::new(),
        }
    }

    pub fn insert(&mut self, report: NodeReport) {
        self.nodes.insert(report.node, report);
    }

    pub fn record_run_failure(&mut self, record: FailureRecord) {
        tracing::warn!(node = record.node.get(), kind = %record.kind, cause = %record.cause, "run failure");
        self.run_failures.push(record);
    }

    /// Mark the run finished and record every node that never reported
    pub fn finish(&mut self) {
        for node in NodeId::all(self.node_count) {
            if !self.nodes.contains_key(&node) {
                self.run_failures.push(FailureRecord {
                    node,
                    kind: FailureKind::TransportError,
                    step: None,
                    cause: "node never reported its results".to_string(),
                    is_panic: false,
                });
            }
        }
        self.finished_at = Some(Utc::now());
    }

    pub fn missing_nodes(&self) -> Vec<NodeId> {
        NodeId::all(self.node_count)
            .filter(|n| !self.nodes.contains_key(n))
            .collect()
    }

    /// The run succeeded: every node reported and nobody failed
    pub fn succeeded(&self) -> bool {
        self.missing_nodes().is_empty()
            && self.run_failures.is_empty()
            && self.nodes.values().all(NodeReport::succeeded)
    }

    /// All failures across the run, in node order
    pub fn failures(&self) -> Vec<&FailureRecord> {
        self.nodes
            .values()
            .flat_map(|r| r.failures.iter())
            .chain(self.run_failures.iter())
            .collect()
    }

    pub fn count_failures(&self, kind: FailureKind) -> usize {
        self.failures().iter().filter(|f| f.kind == kind).count()
    }

    pub fn count_specs(&self, pred: impl Fn(&SpecOutcome) -> bool + Copy) -> usize {
        self.nodes.values().map(|r| r.count(pred)).sum()
    }
}
