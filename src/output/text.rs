//! Human-readable text output

use crate::config::RunConfig;
use crate::report::{FailureKind, RunSummary, SpecOutcome};
use std::io::{self, Write};

/// Print the effective configuration
pub fn print_configuration(config: &RunConfig) {
    println!("Configuration:");
    println!("  Nodes: {}", config.nodes);
    println!("  Fixture: {}", config.fixture);
    println!("  Output: {}", config.output);
    println!("  Broadcast timeout: {}ms", config.broadcast_timeout_ms);
    println!("  Barrier timeout: {}ms", config.barrier_timeout_ms);
    println!("  Teardown policy: {}", config.teardown_policy);
}

/// Print the run summary to stdout
pub fn print_summary(summary: &RunSummary) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = write_summary(&mut out, summary) {
        tracing::warn!(error = %e, "failed to print run summary");
    }
}

/// Write the run summary
///
/// Displays:
/// - Per-node setup and teardown outcome with spec counts
/// - Every failure, node by node
/// - The overall verdict
pub fn write_summary<W: Write>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out, "                    RUN SUMMARY")?;
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out)?;

    if let Some(finished) = summary.finished_at {
        let elapsed = finished - summary.started_at;
        writeln!(out, "Elapsed Time: {:.3}s", elapsed.num_milliseconds() as f64 / 1000.0)?;
        writeln!(out)?;
    }

    writeln!(out, "Nodes:")?;
    for (node, report) in &summary.nodes {
        writeln!(
            out,
            "  Node {}: setup {}, teardown {}, {} passed, {} failed, {} skipped, {} not run",
            node,
            phase_label(report.setup.is_success()),
            phase_label(report.teardown.is_success()),
            report.count(|o| *o == SpecOutcome::Passed),
            report.count(SpecOutcome::is_failure),
            report.count(|o| *o == SpecOutcome::Skipped),
            report.count(|o| *o == SpecOutcome::NotRun),
        )?;
    }
    for node in summary.missing_nodes() {
        writeln!(out, "  Node {}: no report", node)?;
    }
    writeln!(out)?;

    let failures = summary.failures();
    if !failures.is_empty() {
        writeln!(out, "Failures:")?;
        for failure in &failures {
            writeln!(out, "  {}", failure.marker())?;
        }
        writeln!(out)?;

        let barrier = summary.count_failures(FailureKind::BarrierTimeout);
        if barrier > 0 {
            writeln!(out, "Warning: teardown barrier timed out {} time(s)", barrier)?;
            writeln!(out)?;
        }
    }

    if summary.succeeded() {
        writeln!(out, "Result: PASSED")?;
    } else {
        writeln!(out, "Result: FAILED ({} failure(s))", failures.len())?;
    }
    Ok(())
}

fn phase_label(success: bool) -> &'static str {
    if success {
        "ok"
    } else {
        "FAILED"
    }
}
