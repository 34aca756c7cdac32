//! TCPLS session facade.
//!
//! A [`Session`] owns the path lists, streams, option table and send
//! buffers of one TCPLS connection and bridges them to the TLS
//! collaborator. It is single-threaded: callers serialize access.

pub mod config;
#[allow(clippy::module_inception)]
pub mod session;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use session::Session;

use crate::core::error::ProtocolViolation;
use crate::options::OptionType;
use crate::paths::PathId;
use crate::stream::StreamId;

/// Something that happened while processing inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed.
    HandshakeComplete,
    /// Application data for a stream.
    Data {
        /// Stream the record belongs to.
        stream: StreamId,
        /// Decrypted bytes.
        bytes: Vec<u8>,
    },
    /// A complete option was received and applied.
    OptionReceived(OptionType),
    /// The peer attached a stream to the path.
    StreamAttached(StreamId),
    /// The peer closed a stream.
    StreamClosed(StreamId),
    /// A record was dropped; the session continues.
    Dropped(ProtocolViolation),
    /// The peer closed a path.
    PathClosed(PathId),
}

/// Result of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Bytes accepted; some may still be queued, see `pending_send_len`.
    Sent(usize),
    /// The peer closed the path; the stream has ended.
    PeerClosed,
}
