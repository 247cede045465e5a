//! JSON output formatting
//!
//! Serializes the [`RunSummary`] together with some information about the
//! tool and host that produced it.

use crate::report::RunSummary;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Top-level JSON document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    pub tool: JsonToolInfo,
    pub succeeded: bool,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonToolInfo {
    pub name: String,
    pub version: String,
    pub hostname: String,
}

pub fn build_json_report(summary: &RunSummary) -> JsonReport {
    JsonReport {
        tool: JsonToolInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: crate::distributed::tcp::local_hostname(),
        },
        succeeded: summary.succeeded(),
        summary: summary.clone(),
    }
}

/// Write the run summary as pretty-printed JSON
pub fn write_json_output(path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create JSON output: {}", path.display()))?;
    let report = build_json_report(summary);
    serde_json::to_writer_pretty(BufWriter::new(file), &report)
        .with_context(|| format!("Failed to write JSON output: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::report::{NodeReport, PhaseResult};

    #[test]
    fn test_write_and_read_back() {
        let mut summary = RunSummary::new(1);
        summary.insert(NodeReport {
            node: NodeId::LEADER,
            setup: PhaseResult::Success,
            specs: Vec::new(),
            teardown: PhaseResult::Failed {
                step: "after_suite".to_string(),
                cause: "BAM!".to_string(),
                is_panic: true,
            },
            failures: Vec::new(),
            missing_followers: Vec::new(),
        });
        summary.finish();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        write_json_output(&path, &summary).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: JsonReport = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.tool.name, "suitesync");
        assert!(parsed.succeeded);
        assert_eq!(parsed.summary, summary);

        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["summary"]["node_count"], 1);
    }
}
