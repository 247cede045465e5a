//! Inter-node transport
//!
//! Nodes talk to each other only through an [`InterNodeChannel`]. Two
//! implementations exist:
//!
//! - [`MemoryMesh`]: every node is a task in the current process
//! - [`TcpChannel`] + [`Hub`]: every node is its own process and the launcher
//!   relays messages between them
//!
//! # Modules
//!
//! - `channel`: the channel contract and its error type
//! - `memory`: in-process mesh
//! - `protocol`: wire messages and framing
//! - `tcp`: node side of the TCP transport
//! - `hub`: launcher side of the TCP transport

pub mod channel;
pub mod hub;
pub mod memory;
pub mod protocol;
pub mod tcp;

pub use channel::{BroadcastSignal, ChannelError, InterNodeChannel};
pub use hub::Hub;
pub use memory::{MemoryChannel, MemoryMesh};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use tcp::TcpChannel;
