//! Error types for TCPLS.

use std::collections::TryReserveError;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::options::OptionType;
use crate::paths::{AddressFamily, PathId};
use crate::stream::StreamId;

/// Errors reported by the TLS collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlsError {
    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD encryption failed.
    #[error("record encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag, unknown epoch or replay).
    #[error("record decryption failed")]
    DecryptionFailed,

    /// No traffic key has been installed yet.
    #[error("no traffic key available")]
    NoTrafficKey,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Record length field exceeds the protocol maximum.
    #[error("record overflow: {0} bytes")]
    RecordOverflow(usize),

    /// A message arrived that the current state cannot accept.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Wire-level problems with a single inbound record.
///
/// The offending record is dropped; the session stays usable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Record too short for the fields it must contain.
    #[error("truncated record: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Payload length disagrees with the declared length.
    #[error("length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        /// Declared length.
        declared: usize,
        /// Bytes actually carried.
        actual: usize,
    },

    /// Declared option length exceeds the configured maximum.
    #[error("option too large: declared {declared}, max {max}")]
    OptionTooLarge {
        /// Declared length.
        declared: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Unknown option tag.
    #[error("unsupported option: 0x{0:02x}")]
    UnsupportedOption(u8),

    /// A second variable-length option arrived while another is incomplete.
    #[error("variable-length option {received:?} arrived while {in_flight:?} is incomplete")]
    ConcurrentVariableLength {
        /// Option currently being reassembled.
        in_flight: OptionType,
        /// Option that arrived.
        received: OptionType,
    },

    /// Continuation record with no matching option in flight.
    #[error("continuation of {0:?} without a first record")]
    UnexpectedContinuation(OptionType),

    /// Address advertisement does not match its count byte.
    #[error("malformed {family:?} address list: count {count}, {len} bytes")]
    MalformedAddressList {
        /// Address family of the advertisement.
        family: AddressFamily,
        /// Count byte.
        count: usize,
        /// Total payload length.
        len: usize,
    },

    /// Option payload has an invalid value.
    #[error("invalid {option:?} value")]
    InvalidValue {
        /// Option type.
        option: OptionType,
    },

    /// Option record received before the peer confirmed the extension.
    #[error("extension not negotiated")]
    ExtensionNotNegotiated,

    /// Record content type is not handled by this layer.
    #[error("unexpected content type {0}")]
    UnexpectedContentType(u8),
}

/// Top-level TCPLS errors.
#[derive(Debug, Error)]
pub enum TcplsError {
    /// Allocation failed.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(#[from] TryReserveError),

    /// Wire-level violation; the record was dropped.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// No option of this type is registered for the peer.
    #[error("option {0:?} not registered for the peer")]
    OptionNotFound(OptionType),

    /// This option type cannot be stored in the registry.
    #[error("option {0:?} cannot be set")]
    OptionNotSettable(OptionType),

    /// No send key exists yet.
    #[error("encryption unavailable")]
    EncryptionUnavailable,

    /// Handshake has not completed.
    #[error("handshake incomplete")]
    HandshakeIncomplete,

    /// Peer has not confirmed support for the extension.
    #[error("peer has not confirmed TCPLS support")]
    ExtensionNotNegotiated,

    /// No connected primary path.
    #[error("no connected primary path")]
    NoPrimaryPath,

    /// Unknown stream.
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    /// Unknown path.
    #[error("path {0} not found")]
    PathNotFound(PathId),

    /// No path to this address.
    #[error("no path to {0}")]
    AddressNotFound(SocketAddr),

    /// Path exists but has no connection.
    #[error("path {0} is not connected")]
    PathNotConnected(PathId),

    /// A stream is already bound to this path.
    #[error("path {0} already carries a stream")]
    PathBusy(PathId),

    /// Address list cannot grow further.
    #[error("too many {family:?} addresses (max {max})")]
    TooManyAddresses {
        /// Address family.
        family: AddressFamily,
        /// Maximum count.
        max: usize,
    },

    /// Peer reset the connection; unsent data was preserved for failover.
    #[error("connection reset by {addr} on path {path}")]
    PeerReset {
        /// Path that was reset.
        path: PathId,
        /// Peer address of the path.
        addr: SocketAddr,
    },

    /// The readiness wait of a connection race failed.
    #[error("connection race aborted: {0}")]
    RaceAborted(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// TLS collaborator error.
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TcplsError {
    /// Check if the error only dropped an inbound record.
    pub fn is_record_drop(&self) -> bool {
        matches!(self, TcplsError::Protocol(_))
    }

    /// Check if the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TcplsError::Tls(TlsError::DecryptionFailed)
                | TcplsError::Tls(TlsError::HandshakeFailed(_))
                | TcplsError::RaceAborted(_)
        )
    }
}

/// Result type for TCPLS operations.
pub type TcplsResult<T> = Result<T, TcplsError>;
