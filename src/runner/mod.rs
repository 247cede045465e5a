//! Node lifecycle
//!
//! A [`NodeRunner`] drives one node through the whole run: suite setup, the
//! node's share of specs, suite teardown, and finally its [`NodeReport`].

use crate::coordinator::{CoordinatorSettings, SuiteCoordinator};
use crate::distributed::InterNodeChannel;
use crate::node::NodeId;
use crate::output::NodeOutput;
use crate::report::{FailureReporter, NodeReport, SpecOutcome, SpecResult};
use crate::suite::{run_guarded, StepContext, Suite};
use std::fmt;
use std::sync::Arc;

/// Body of one spec
pub type SpecBody = Arc<dyn Fn(&StepContext<'_>) -> SpecOutcome + Send + Sync>;

/// One runnable spec
#[derive(Clone)]
pub struct Spec {
    pub name: String,
    pub body: SpecBody,
}

impl Spec {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> SpecOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec").field("name", &self.name).finish()
    }
}

/// Supplies the ordered specs assigned to each node
pub trait SpecSource: Send + Sync {
    fn specs_for(&self, node: NodeId, node_count: u32) -> Vec<Spec>;
}

/// Deals specs out in turn: spec `i` goes to node `(i % count) + 1`
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    specs: Vec<Spec>,
}

impl RoundRobin {
    pub fn new(specs: Vec<Spec>) -> Self {
        Self { specs }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl SpecSource for RoundRobin {
    fn specs_for(&self, node: NodeId, node_count: u32) -> Vec<Spec> {
        let count = node_count.max(1) as usize;
        let slot = (node.get() as usize - 1) % count;
        self.specs
            .iter()
            .enumerate()
            .filter(|(i, _)| i % count == slot)
            .map(|(_, spec)| spec.clone())
            .collect()
    }
}

/// Runs one node from setup to report
pub struct NodeRunner<C: InterNodeChannel> {
    coordinator: SuiteCoordinator<C>,
    suite: Arc<Suite>,
    output: NodeOutput,
}

impl<C: InterNodeChannel> NodeRunner<C> {
    pub fn new(channel: C, suite: Arc<Suite>, output: NodeOutput, settings: CoordinatorSettings) -> Self {
        Self {
            coordinator: SuiteCoordinator::new(channel, settings),
            suite,
            output,
        }
    }

    /// Run the node and hand back its report and channel
    ///
    /// Teardown runs no matter how setup or the specs went.
    pub async fn run(self, specs: Vec<Spec>) -> (NodeReport, C) {
        let NodeRunner {
            mut coordinator,
            suite,
            output,
        } = self;
        let node = coordinator.node();
        let mut reporter = FailureReporter::new(output.clone());

        tracing::info!(node = node.get(), specs = specs.len(), suite = %suite.name, "node starting");

        let setup = coordinator.run_setup(&suite.setup, &output, &mut reporter).await;

        let mut results = Vec::with_capacity(specs.len());
        if reporter.should_skip_specs() {
            tracing::info!(node = node.get(), "suite setup failed, specs not run");
            results.extend(specs.iter().map(|spec| SpecResult {
                name: spec.name.clone(),
                outcome: SpecOutcome::NotRun,
            }));
        } else {
            for spec in &specs {
                let result = run_spec(spec, node, &coordinator, &output);
                reporter.record_spec(&result);
                results.push(result);
            }
        }

        let teardown = coordinator.run_teardown(&suite.teardown, &output, &mut reporter).await;

        let missing_followers = coordinator.missing_followers().to_vec();
        let report = NodeReport {
            node,
            setup,
            specs: results,
            teardown,
            failures: reporter.into_failures(),
            missing_followers,
        };
        tracing::info!(node = node.get(), succeeded = report.succeeded(), "node finished");

        (report, coordinator.into_channel())
    }
}

fn run_spec<C: InterNodeChannel>(
    spec: &Spec,
    node: NodeId,
    coordinator: &SuiteCoordinator<C>,
    output: &NodeOutput,
) -> SpecResult {
    let node_count = coordinator.node_count();
    let ctx = StepContext::new(node, node_count, coordinator.payload(), output);
    let outcome = match run_guarded(&spec.name, || Ok((spec.body)(&ctx))) {
        Ok(outcome) => outcome,
        Err(fault) => SpecOutcome::Panicked { message: fault.cause },
    };
    SpecResult {
        name: spec.name.clone(),
        outcome,
    }
}
