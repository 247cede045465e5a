//! Demo suites for the binary
//!
//! Each fixture is a small suite plus its specs. They exercise the suite
//! protocol end to end: a clean run, a panicking setup hook, a panicking
//! teardown hook, and a chain mixing leader-only and per-node steps.

use crate::report::SpecOutcome;
use crate::runner::{RoundRobin, Spec};
use crate::suite::{Payload, SetupChain, Suite, TeardownChain};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fixture {
    #[default]
    Passing,
    FailingBeforeSuite,
    FailingAfterSuite,
    Compound,
}

impl fmt::Display for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Fixture::Passing => "passing",
            Fixture::FailingBeforeSuite => "failing-before-suite",
            Fixture::FailingAfterSuite => "failing-after-suite",
            Fixture::Compound => "compound",
        };
        write!(f, "{}", name)
    }
}

impl Fixture {
    pub fn suite(self) -> anyhow::Result<Suite> {
        let suite = match self {
            Fixture::Passing => Suite::new("passing")
                .with_setup(SetupChain::new().all_nodes("before_suite", |ctx| {
                    ctx.say("BEFORE SUITE");
                    Ok(())
                }))
                .with_teardown(TeardownChain::new().all_nodes("after_suite", |ctx| {
                    ctx.say("AFTER SUITE");
                    Ok(())
                })),
            Fixture::FailingBeforeSuite => Suite::new("failing before suite")
                .with_setup(SetupChain::new().all_nodes("before_suite", |ctx| {
                    ctx.say("BEFORE SUITE");
                    panic!("BAM!");
                }))
                .with_teardown(TeardownChain::new().all_nodes("after_suite", |ctx| {
                    ctx.say("AFTER SUITE");
                    Ok(())
                })),
            Fixture::FailingAfterSuite => Suite::new("failing after suite")
                .with_setup(SetupChain::new().all_nodes("before_suite", |ctx| {
                    ctx.say("BEFORE SUITE");
                    Ok(())
                }))
                .with_teardown(TeardownChain::new().all_nodes("after_suite", |ctx| {
                    ctx.say("AFTER SUITE");
                    panic!("BAM!");
                })),
            Fixture::Compound => compound()?,
        };
        Ok(suite)
    }

    pub fn specs(self) -> RoundRobin {
        let specs = match self {
            Fixture::Passing | Fixture::FailingAfterSuite => vec![say_spec("first", "A TEST"), say_spec("second", "A TEST")],
            Fixture::FailingBeforeSuite => vec![say_spec("unreachable", "NEVER SEE THIS")],
            Fixture::Compound => vec![
                Spec::new("sees the payload", |ctx| match ctx.payload().and_then(Payload::as_str) {
                    Some("DATA") => SpecOutcome::Passed,
                    other => SpecOutcome::failed(format!("expected DATA, got {:?}", other)),
                }),
                Spec::new("runs", |_| SpecOutcome::Passed),
            ],
        };
        RoundRobin::new(specs)
    }
}

fn say_spec(name: &str, text: &'static str) -> Spec {
    Spec::new(name, move |ctx| {
        ctx.say(text);
        SpecOutcome::Passed
    })
}

fn compound() -> anyhow::Result<Suite> {
    let setup = SetupChain::new()
        .leader_only("before_a", |ctx| {
            ctx.say(format!("BEFORE_A_{}", ctx.node()));
            Ok(Some(Payload::from("DATA")))
        })
        .all_nodes("before_b", |ctx| {
            let payload = ctx.payload().context("before_a produced no payload")?;
            let data = payload.as_str().context("payload is not text")?;
            ctx.say(format!("BEFORE_B_{}: {}", ctx.node(), data));
            Ok(())
        });

    let teardown = TeardownChain::new()
        .all_nodes("after_a", |ctx| {
            ctx.say(format!("AFTER_A_{}", ctx.node()));
            Ok(())
        })
        .leader_after_all("after_b", |ctx| {
            ctx.say(format!("AFTER_B_{}", ctx.node()));
            Ok(())
        })?;

    Ok(Suite::new("compound").with_setup(setup).with_teardown(teardown))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_names() {
        assert_eq!(Fixture::FailingBeforeSuite.to_string(), "failing-before-suite");
        let parsed: Fixture = serde_json::from_str("\"failing-after-suite\"").unwrap();
        assert_eq!(parsed, Fixture::FailingAfterSuite);
    }

    #[test]
    fn test_compound_shape() {
        let suite = Fixture::Compound.suite().unwrap();
        assert_eq!(suite.setup.steps().len(), 2);
        assert!(suite.setup.steps()[0].is_leader_only());
        assert_eq!(suite.teardown.final_step().unwrap().name, "after_b");
    }

    #[test]
    fn test_spec_counts() {
        assert_eq!(Fixture::Passing.specs().len(), 2);
        assert_eq!(Fixture::FailingBeforeSuite.specs().len(), 1);
    }
}
