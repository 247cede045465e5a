//! Output aggregation
//!
//! All text a node produces (hook output, spec output, failure markers) goes
//! through an [`OutputSink`]. The [`OutputAggregator`] is the sink that owns
//! the merged stream and works in one of two modes, fixed for the whole run:
//!
//! - **Batched**: lines are buffered per node and written in node-id order by
//!   [`OutputAggregator::flush`] once the run is over. Lines of different
//!   nodes never interleave.
//! - **Streamed**: lines are written as they arrive, each prefixed with
//!   `[<node>] `. Lines of one node keep their order; there is no ordering
//!   between nodes.

pub mod json;
pub mod text;

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// How node output is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Batched,
    Streamed,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Batched => write!(f, "batched"),
            OutputMode::Streamed => write!(f, "streamed"),
        }
    }
}

/// Destination for text emitted by a node
pub trait OutputSink: Send + Sync {
    fn emit(&self, node: NodeId, text: &str);
}

/// A node's handle to the output stream
#[derive(Clone)]
pub struct NodeOutput {
    node: NodeId,
    sink: Arc<dyn OutputSink>,
}

impl NodeOutput {
    pub fn new(node: NodeId, sink: Arc<dyn OutputSink>) -> Self {
        Self { node, sink }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn say(&self, text: &str) {
        self.sink.emit(self.node, text);
    }
}

impl fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeOutput").field("node", &self.node).finish()
    }
}

struct AggregatorState {
    writer: Box<dyn Write + Send>,
    buffers: BTreeMap<NodeId, Vec<String>>,
}

/// Merges per-node output into one stream
pub struct OutputAggregator {
    mode: OutputMode,
    state: Mutex<AggregatorState>,
}

impl OutputAggregator {
    pub fn new(mode: OutputMode, writer: Box<dyn Write + Send>) -> Self {
        Self {
            mode,
            state: Mutex::new(AggregatorState {
                writer,
                buffers: BTreeMap::new(),
            }),
        }
    }

    /// Aggregator writing to the process's stdout
    pub fn stdout(mode: OutputMode) -> Self {
        Self::new(mode, Box::new(io::stdout()))
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Handle for one node, sharing this aggregator
    pub fn node_output(self: &Arc<Self>, node: NodeId) -> NodeOutput {
        NodeOutput::new(node, self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        // A panicking writer must not silence every other node.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write all buffered lines in node-id order
    ///
    /// A no-op in streamed mode, where nothing is buffered.
    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.lock();
        let buffers = std::mem::take(&mut state.buffers);
        for lines in buffers.values() {
            for line in lines {
                writeln!(state.writer, "{}", line)?;
            }
        }
        state.writer.flush()
    }

    /// Number of lines buffered for a node (batched mode)
    pub fn buffered_lines(&self, node: NodeId) -> usize {
        self.lock().buffers.get(&node).map_or(0, Vec::len)
    }
}

impl OutputSink for OutputAggregator {
    fn emit(&self, node: NodeId, text: &str) {
        let mut state = self.lock();
        match self.mode {
            OutputMode::Batched => {
                let buffer = state.buffers.entry(node).or_default();
                buffer.extend(text.lines().map(str::to_string));
            }
            OutputMode::Streamed => {
                let mut result = Ok(());
                for line in text.lines() {
                    result = writeln!(state.writer, "[{}] {}", node, line);
                    if result.is_err() {
                        break;
                    }
                }
                if let Err(e) = result.and_then(|_| state.writer.flush()) {
                    tracing::warn!(node = node.get(), error = %e, "failed to write streamed output");
                }
            }
        }
    }
}

/// Cloneable in-memory writer, handy for capturing aggregated output
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded as UTF-8
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
