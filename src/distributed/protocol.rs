//! Node wire protocol
//!
//! Messages exchanged between node processes and the hub. The protocol uses
//! MessagePack (rmp-serde) for compact binary serialization with full serde
//! feature support.
//!
//! # Message Flow
//!
//! ```text
//! Leader (node 1)          Hub                Follower (node k)
//!     |--- HELLO ---------->|<-------- HELLO -------|
//!     |<-- WELCOME ---------|--------- WELCOME ---->|
//!     |                     |                       |
//!     |--- BROADCAST ------>|------- BROADCAST ---->|   (per leader-only step)
//!     |--- OUTPUT --------->|<-------- OUTPUT ------|   (any time)
//!     |                     |<------ TEARDOWN_DONE -|
//!     |<-- TEARDOWN_DONE ---|                       |
//!     |--- REPORT --------->|<-------- REPORT ------|
//! ```
//!
//! The hub relays messages of one connection in arrival order, so output a
//! follower wrote before signalling teardown completion is aggregated before
//! the leader hears about it.
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack-serialized message]
//! ```

use super::channel::BroadcastSignal;
use crate::node::NodeId;
use crate::report::NodeReport;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// The hub and every node must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Node → hub: identify this connection
    Hello(HelloMessage),

    /// Hub → node: registration accepted
    Welcome(WelcomeMessage),

    /// Leader → hub → followers: result of a leader-only setup step
    Broadcast(BroadcastSignal),

    /// Follower → hub → leader: teardown steps finished on `node_id`
    TeardownDone { node_id: NodeId },

    /// Node → hub: text for the output aggregator
    Output(OutputMessage),

    /// Node → hub: final results of the node
    Report(NodeReport),

    /// Either direction: fatal protocol problem
    Error(ErrorMessage),
}

/// Hello message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version (must match)
    pub protocol_version: u32,

    /// Node sending the hello
    pub node_id: NodeId,

    /// Node count the node was launched with (must match the hub)
    pub node_count: u32,

    /// Host the node runs on (diagnostics only)
    pub hostname: String,
}

/// Welcome message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub protocol_version: u32,
    pub node_count: u32,
}

/// Output message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub node_id: NodeId,
    pub text: String,
}

/// Error message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Node the error concerns, if known
    pub node_id: Option<NodeId>,

    /// Error description
    pub error: String,
}

/// Serialize a message to bytes
///
/// Prepends a 4-byte length field for framing. Messages over
/// [`MAX_MESSAGE_LEN`] are rejected here, before they reach the peer.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    if msg_bytes.len() > MAX_MESSAGE_LEN {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_bytes.len());
    }

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from bytes
///
/// Expects a 4-byte length prefix followed by a MessagePack-serialized message.
///
/// # Returns
///
/// Returns (message, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read one complete message from a stream
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }

    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_LEN {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")?;

    Ok(Some(msg))
}

/// Write a message to a stream and flush it
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;
    write_frame(writer, &framed).await
}

/// Write an already framed message and flush it
pub async fn write_frame<W>(writer: &mut W, framed: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(framed).await.context("Failed to write message")?;

    writer.flush().await.context("Failed to flush stream")?;

    Ok(())
}
