//! Suite-level coordinator
//!
//! One [`SuiteCoordinator`] exists per node. It owns the node's channel and
//! drives the setup and teardown chains through the cross-node protocol:
//!
//! ```text
//! Setup:    Idle → RunningLeaderStep → Broadcasting → RunningFollowerSteps → Done
//!                        │                   │                 │
//!                        └───────────────────┴─────────────────┴──→ Failed
//!
//! Teardown: per-node steps → followers signal done → leader waits at the
//!           barrier → leader runs the final step
//! ```
//!
//! Every step runs inside [`run_guarded`], so a failing or panicking hook
//! becomes a [`PhaseResult::Failed`] and a marker in the node's output.

use crate::distributed::{BroadcastSignal, ChannelError, InterNodeChannel};
use crate::node::NodeId;
use crate::output::NodeOutput;
use crate::report::{FailureReporter, Phase, PhaseResult};
use crate::suite::{run_guarded, Payload, SetupChain, SetupKind, StepContext, StepFault, TeardownChain};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Setup progress of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Idle,
    RunningLeaderStep,
    Broadcasting,
    RunningFollowerSteps,
    Done,
    Failed,
}

/// What happens to the remaining teardown steps of a node after one fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownPolicy {
    /// Keep going; only steps declared as depending on the previous one are skipped
    #[default]
    Continue,
    /// Skip every remaining per-node step
    Stop,
}

impl fmt::Display for TeardownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownPolicy::Continue => write!(f, "continue"),
            TeardownPolicy::Stop => write!(f, "stop"),
        }
    }
}

/// Timeouts and policies for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// How long a follower waits for each leader broadcast
    pub broadcast_timeout: Duration,
    /// How long the leader waits for followers to finish teardown
    pub barrier_timeout: Duration,
    pub teardown_policy: TeardownPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            broadcast_timeout: Duration::from_secs(300),
            barrier_timeout: Duration::from_secs(30),
            teardown_policy: TeardownPolicy::Continue,
        }
    }
}

/// Per-node driver of the setup and teardown chains
pub struct SuiteCoordinator<C: InterNodeChannel> {
    channel: C,
    settings: CoordinatorSettings,
    state: SetupState,
    payload: Option<Payload>,
    missing_followers: Vec<NodeId>,
}

impl<C: InterNodeChannel> SuiteCoordinator<C> {
    pub fn new(channel: C, settings: CoordinatorSettings) -> Self {
        Self {
            channel,
            settings,
            state: SetupState::Idle,
            payload: None,
            missing_followers: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.channel.node()
    }

    pub fn node_count(&self) -> u32 {
        self.channel.node_count()
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    /// Payload of the most recent leader-only setup step
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Followers the leader stopped waiting for at the teardown barrier
    pub fn missing_followers(&self) -> &[NodeId] {
        &self.missing_followers
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    fn is_multi_node(&self) -> bool {
        self.channel.node_count() > 1
    }

    /// Run the setup chain on this node
    ///
    /// Stops at the first failing step. On the leader, a failure while a
    /// leader-only step is still pending is broadcast as
    /// [`BroadcastSignal::SetupFailed`] so followers stop waiting.
    pub async fn run_setup(
        &mut self,
        chain: &SetupChain,
        output: &NodeOutput,
        reporter: &mut FailureReporter,
    ) -> PhaseResult {
        let node = self.channel.node();
        let node_count = self.channel.node_count();
        tracing::debug!(node = node.get(), steps = chain.steps().len(), "setup starting");

        for (index, step) in chain.steps().iter().enumerate() {
            match &step.kind {
                SetupKind::LeaderOnly(hook) if node.is_leader() => {
                    self.state = SetupState::RunningLeaderStep;
                    let result = {
                        let ctx = StepContext::new(node, node_count, self.payload.as_ref(), output);
                        run_guarded(&step.name, || hook(&ctx))
                    };
                    match result {
                        Ok(payload) => {
                            self.payload = payload;
                            self.state = SetupState::Broadcasting;
                            let signal = match &self.payload {
                                Some(payload) => BroadcastSignal::Payload(payload.clone()),
                                None => BroadcastSignal::NoPayload,
                            };
                            if !self.broadcast(signal, reporter).await {
                                // Nobody got the signal; release followers instead of letting them time out
                                let cause = format!("step \"{}\" could not be broadcast", step.name);
                                self.broadcast(BroadcastSignal::SetupFailed { cause }, reporter).await;
                            }
                        }
                        Err(fault) => return self.fail_setup(chain, index, fault, reporter).await,
                    }
                }
                SetupKind::LeaderOnly(_) => {
                    self.state = SetupState::Broadcasting;
                    match self.channel.receive_broadcast(self.settings.broadcast_timeout).await {
                        Ok(BroadcastSignal::Payload(payload)) => self.payload = Some(payload),
                        Ok(BroadcastSignal::NoPayload) => self.payload = None,
                        Ok(BroadcastSignal::SetupFailed { cause }) => {
                            let fault = StepFault::failure(&step.name, format!("leader setup failed: {}", cause));
                            return self.fail_setup(chain, index, fault, reporter).await;
                        }
                        Err(e) => {
                            let fault = StepFault::failure(&step.name, e.to_string());
                            return self.fail_setup(chain, index, fault, reporter).await;
                        }
                    }
                }
                SetupKind::AllNodes(hook) => {
                    self.state = SetupState::RunningFollowerSteps;
                    let result = {
                        let ctx = StepContext::new(node, node_count, self.payload.as_ref(), output);
                        run_guarded(&step.name, || hook(&ctx))
                    };
                    if let Err(fault) = result {
                        return self.fail_setup(chain, index, fault, reporter).await;
                    }
                }
            }
        }

        self.state = SetupState::Done;
        tracing::debug!(node = node.get(), "setup done");
        PhaseResult::Success
    }

    async fn fail_setup(
        &mut self,
        chain: &SetupChain,
        index: usize,
        fault: StepFault,
        reporter: &mut FailureReporter,
    ) -> PhaseResult {
        reporter.record_setup(&fault);
        self.state = SetupState::Failed;

        if self.channel.node().is_leader() && chain.has_leader_step_from(index) {
            let signal = BroadcastSignal::SetupFailed {
                cause: fault.to_string(),
            };
            self.broadcast(signal, reporter).await;
        }
        fault.into()
    }

    /// Send a signal to every follower, recording any failure
    ///
    /// Returns false when the signal reached no follower at all.
    async fn broadcast(&mut self, signal: BroadcastSignal, reporter: &mut FailureReporter) -> bool {
        if !self.is_multi_node() {
            return true;
        }
        match self.channel.broadcast(signal).await {
            Ok(()) => true,
            Err(e @ ChannelError::Delivery { .. }) => {
                reporter.record_transport("setup broadcast", e);
                true
            }
            Err(e) => {
                reporter.record_transport("setup broadcast", e);
                false
            }
        }
    }

    /// Run the teardown chain on this node
    ///
    /// Followers signal completion once their steps are over. The leader then
    /// waits at the barrier, bounded by the barrier timeout, and always runs
    /// the final step afterwards.
    pub async fn run_teardown(
        &mut self,
        chain: &TeardownChain,
        output: &NodeOutput,
        reporter: &mut FailureReporter,
    ) -> PhaseResult {
        let node = self.channel.node();
        let node_count = self.channel.node_count();
        let mut first_failure: Option<StepFault> = None;
        let mut previous_ok = true;

        for step in chain.steps() {
            let skip_reason = if first_failure.is_some() && self.settings.teardown_policy == TeardownPolicy::Stop {
                Some("an earlier teardown step failed")
            } else if step.requires_previous && !previous_ok {
                Some("the previous teardown step did not complete")
            } else {
                None
            };
            if let Some(reason) = skip_reason {
                reporter.record_skipped_step(Phase::Teardown, &step.name, reason);
                previous_ok = false;
                continue;
            }

            let result = {
                let ctx = StepContext::new(node, node_count, self.payload.as_ref(), output);
                run_guarded(&step.name, || (step.hook)(&ctx))
            };
            match result {
                Ok(()) => previous_ok = true,
                Err(fault) => {
                    reporter.record_teardown(&fault);
                    first_failure.get_or_insert(fault);
                    previous_ok = false;
                }
            }
        }

        if node.is_leader() {
            if self.is_multi_node() {
                match self.channel.await_all_teardown_done(self.settings.barrier_timeout).await {
                    Ok(missing) => {
                        if !missing.is_empty() {
                            reporter.record_barrier_timeout(&missing);
                        }
                        self.missing_followers = missing;
                    }
                    Err(e) => reporter.record_transport("teardown barrier", e),
                }
            }

            if let Some(final_step) = chain.final_step() {
                let result = {
                    let ctx = StepContext::new(node, node_count, self.payload.as_ref(), output);
                    run_guarded(&final_step.name, || (final_step.hook)(&ctx))
                };
                if let Err(fault) = result {
                    reporter.record_teardown(&fault);
                    first_failure.get_or_insert(fault);
                }
            }
        } else if let Err(e) = self.channel.signal_teardown_done(node).await {
            reporter.record_transport("teardown signal", e);
        }

        tracing::debug!(node = node.get(), failed = first_failure.is_some(), "teardown done");
        first_failure.map(PhaseResult::from).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{MemoryChannel, MemoryMesh};
    use crate::output::{OutputAggregator, OutputMode, SharedBuffer};
    use crate::report::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            broadcast_timeout: Duration::from_secs(5),
            barrier_timeout: Duration::from_secs(5),
            teardown_policy: TeardownPolicy::Continue,
        }
    }

    fn streamed() -> (Arc<OutputAggregator>, SharedBuffer) {
        let buffer = SharedBuffer::new();
        let agg = Arc::new(OutputAggregator::new(OutputMode::Streamed, Box::new(buffer.clone())));
        (agg, buffer)
    }

    async fn setup_node(
        channel: MemoryChannel,
        chain: SetupChain,
        agg: Arc<OutputAggregator>,
    ) -> (PhaseResult, SetupState, Option<Payload>, Vec<FailureKind>) {
        let output = agg.node_output(channel.node());
        let mut reporter = FailureReporter::new(output.clone());
        let mut coordinator = SuiteCoordinator::new(channel, settings());
        let result = coordinator.run_setup(&chain, &output, &mut reporter).await;
        let kinds = reporter.failures().iter().map(|f| f.kind).collect();
        (result, coordinator.state(), coordinator.payload().cloned(), kinds)
    }

    #[tokio::test]
    async fn test_single_node_setup_runs_every_step() {
        let (agg, buffer) = streamed();
        let chain = SetupChain::new()
            .leader_only("produce", |ctx| {
                ctx.say("produce");
                Ok(Some(Payload::from("DATA")))
            })
            .all_nodes("consume", |ctx| {
                ctx.say(format!("consume: {}", ctx.payload().and_then(Payload::as_str).unwrap_or("-")));
                Ok(())
            });

        let mut mesh = MemoryMesh::new(1);
        let (result, state, payload, kinds) = setup_node(mesh.remove(0), chain, agg).await;

        assert!(result.is_success());
        assert_eq!(state, SetupState::Done);
        assert_eq!(payload, Some(Payload::from("DATA")));
        assert!(kinds.is_empty());
        assert_eq!(buffer.contents(), "[1] produce\n[1] consume: DATA\n");
    }

    #[tokio::test]
    async fn test_payload_reaches_followers() {
        let (agg, buffer) = streamed();
        let chain = SetupChain::new()
            .leader_only("produce", |_| Ok(Some(Payload::from("DATA"))))
            .all_nodes("consume", |ctx| {
                ctx.say(format!("B:{}", ctx.payload().and_then(Payload::as_str).unwrap_or("-")));
                Ok(())
            });

        let handles: Vec<_> = MemoryMesh::new(3)
            .into_iter()
            .map(|channel| tokio::spawn(setup_node(channel, chain.clone(), agg.clone())))
            .collect();
        for handle in handles {
            let (result, state, payload, _) = handle.await.unwrap();
            assert!(result.is_success());
            assert_eq!(state, SetupState::Done);
            assert_eq!(payload, Some(Payload::from("DATA")));
        }

        for node in 1..=3 {
            assert!(buffer.contents().contains(&format!("[{}] B:DATA", node)));
        }
    }

    #[tokio::test]
    async fn test_leader_failure_releases_followers() {
        let (agg, buffer) = streamed();
        let consumed = Arc::new(AtomicUsize::new(0));
        let counter = consumed.clone();
        let chain = SetupChain::new()
            .leader_only("produce", |_| -> anyhow::Result<Option<Payload>> { panic!("BAM!") })
            .all_nodes("consume", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let handles: Vec<_> = MemoryMesh::new(2)
            .into_iter()
            .map(|channel| tokio::spawn(setup_node(channel, chain.clone(), agg.clone())))
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let (leader_result, leader_state, _, leader_kinds) = &results[0];
        assert!(matches!(leader_result, PhaseResult::Failed { is_panic: true, .. }));
        assert_eq!(*leader_state, SetupState::Failed);
        assert_eq!(leader_kinds, &vec![FailureKind::SetupFailure]);

        let (follower_result, follower_state, payload, _) = &results[1];
        assert!(matches!(follower_result, PhaseResult::Failed { is_panic: false, .. }));
        assert_eq!(*follower_state, SetupState::Failed);
        assert!(payload.is_none());

        assert_eq!(consumed.load(Ordering::SeqCst), 0);
        assert_eq!(buffer.contents().matches("Test Panicked").count(), 1);
    }

    #[tokio::test]
    async fn test_leader_all_nodes_failure_before_pending_leader_step() {
        let (agg, _buffer) = streamed();
        let chain = SetupChain::new()
            .all_nodes("prepare", |ctx| {
                if ctx.is_leader() {
                    anyhow::bail!("disk full");
                }
                Ok(())
            })
            .leader_only("produce", |_| Ok(None));

        let handles: Vec<_> = MemoryMesh::new(2)
            .into_iter()
            .map(|channel| tokio::spawn(setup_node(channel, chain.clone(), agg.clone())))
            .collect();

        for handle in handles {
            let (result, state, _, _) = handle.await.unwrap();
            assert!(result.is_failed());
            assert_eq!(state, SetupState::Failed);
        }
    }

    #[tokio::test]
    async fn test_follower_times_out_without_leader_signal() {
        let (agg, _buffer) = streamed();
        let chain = SetupChain::new().leader_only("produce", |_| Ok(None));

        let mut mesh = MemoryMesh::new(2);
        let follower = mesh.pop().unwrap();
        let _leader = mesh.pop().unwrap();

        let output = agg.node_output(follower.node());
        let mut reporter = FailureReporter::new(output.clone());
        let mut coordinator = SuiteCoordinator::new(
            follower,
            CoordinatorSettings {
                broadcast_timeout: Duration::from_millis(20),
                ..settings()
            },
        );

        let result = coordinator.run_setup(&chain, &output, &mut reporter).await;
        assert!(result.is_failed());
        assert_eq!(coordinator.state(), SetupState::Failed);
        assert!(reporter.should_skip_specs());
    }

    fn recording_teardown(log: Arc<std::sync::Mutex<Vec<String>>>, fail_first: bool) -> TeardownChain {
        let first = log.clone();
        let second = log.clone();
        let third = log;
        TeardownChain::new()
            .all_nodes("stop-server", move |ctx| {
                first.lock().unwrap().push(format!("stop-server@{}", ctx.node()));
                if fail_first {
                    anyhow::bail!("still running");
                }
                Ok(())
            })
            .all_nodes_after_previous("remove-socket", move |ctx| {
                second.lock().unwrap().push(format!("remove-socket@{}", ctx.node()));
                Ok(())
            })
            .all_nodes("flush-logs", move |ctx| {
                third.lock().unwrap().push(format!("flush-logs@{}", ctx.node()));
                Ok(())
            })
    }

    async fn teardown_single(chain: &TeardownChain, policy: TeardownPolicy) -> (PhaseResult, FailureReporter) {
        let (agg, _buffer) = streamed();
        let mut mesh = MemoryMesh::new(1);
        let output = agg.node_output(NodeId::LEADER);
        let mut reporter = FailureReporter::new(output.clone());
        let mut coordinator = SuiteCoordinator::new(
            mesh.remove(0),
            CoordinatorSettings {
                teardown_policy: policy,
                ..settings()
            },
        );
        let result = coordinator.run_teardown(chain, &output, &mut reporter).await;
        (result, reporter)
    }

    #[tokio::test]
    async fn test_teardown_continue_skips_dependent_step_only() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = recording_teardown(log.clone(), true);

        let (result, reporter) = teardown_single(&chain, TeardownPolicy::Continue).await;

        assert!(matches!(result, PhaseResult::Failed { ref step, .. } if step == "stop-server"));
        assert_eq!(*log.lock().unwrap(), vec!["stop-server@1", "flush-logs@1"]);
        assert_eq!(reporter.skipped_steps(), ["remove-socket".to_string()]);
        assert_eq!(reporter.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_stop_skips_remaining_steps() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = recording_teardown(log.clone(), true)
            .leader_after_all("final", |ctx| {
                ctx.say("final");
                Ok(())
            })
            .unwrap();

        let (result, reporter) = teardown_single(&chain, TeardownPolicy::Stop).await;

        assert!(result.is_failed());
        assert_eq!(*log.lock().unwrap(), vec!["stop-server@1"]);
        assert_eq!(reporter.skipped_steps().len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_success_runs_everything() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = recording_teardown(log.clone(), false);

        let (result, reporter) = teardown_single(&chain, TeardownPolicy::Stop).await;

        assert!(result.is_success());
        assert_eq!(log.lock().unwrap().len(), 3);
        assert!(reporter.skipped_steps().is_empty());
    }

    #[tokio::test]
    async fn test_final_step_runs_after_barrier_timeout() {
        let (agg, buffer) = streamed();
        let chain = TeardownChain::new()
            .leader_after_all("final", |ctx| {
                ctx.say("FINAL");
                Ok(())
            })
            .unwrap();

        let mut mesh = MemoryMesh::new(2);
        let _silent_follower = mesh.pop().unwrap();
        let leader = mesh.pop().unwrap();

        let output = agg.node_output(NodeId::LEADER);
        let mut reporter = FailureReporter::new(output.clone());
        let mut coordinator = SuiteCoordinator::new(
            leader,
            CoordinatorSettings {
                barrier_timeout: Duration::from_millis(30),
                ..settings()
            },
        );

        let result = coordinator.run_teardown(&chain, &output, &mut reporter).await;

        assert!(result.is_success());
        assert_eq!(coordinator.missing_followers(), [NodeId::new(2).unwrap()]);
        assert_eq!(reporter.failures()[0].kind, FailureKind::BarrierTimeout);
        let contents = buffer.contents();
        let barrier = contents.find("teardown barrier").unwrap();
        let final_line = contents.find("FINAL").unwrap();
        assert!(barrier < final_line);
    }

    /// Leader end that refuses the first broadcast outright
    struct RefusingLeader {
        refuse_next: bool,
        sent: Vec<BroadcastSignal>,
    }

    impl InterNodeChannel for RefusingLeader {
        fn node(&self) -> NodeId {
            NodeId::LEADER
        }

        fn node_count(&self) -> u32 {
            2
        }

        async fn broadcast(&mut self, signal: BroadcastSignal) -> Result<(), ChannelError> {
            if std::mem::take(&mut self.refuse_next) {
                return Err(ChannelError::Transport("Message too large".to_string()));
            }
            self.sent.push(signal);
            Ok(())
        }

        async fn receive_broadcast(&mut self, _timeout: Duration) -> Result<BroadcastSignal, ChannelError> {
            Err(ChannelError::Closed("leader end".to_string()))
        }

        async fn signal_teardown_done(&mut self, _node: NodeId) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn await_all_teardown_done(&mut self, _timeout: Duration) -> Result<Vec<NodeId>, ChannelError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_refused_broadcast_releases_followers() {
        let (agg, buffer) = streamed();
        let chain = SetupChain::new().leader_only("produce", |_| Ok(Some(Payload::from("DATA"))));
        let channel = RefusingLeader {
            refuse_next: true,
            sent: Vec::new(),
        };

        let output = agg.node_output(NodeId::LEADER);
        let mut reporter = FailureReporter::new(output.clone());
        let mut coordinator = SuiteCoordinator::new(channel, settings());
        let result = coordinator.run_setup(&chain, &output, &mut reporter).await;

        assert!(result.is_success());
        let kinds: Vec<FailureKind> = reporter.failures().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FailureKind::TransportError]);
        assert!(buffer.contents().contains("[FAIL] transport on node 1: Failure: setup broadcast"));

        let sent = coordinator.into_channel().sent;
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], BroadcastSignal::SetupFailed { cause } if cause.contains("produce")));
    }
}
