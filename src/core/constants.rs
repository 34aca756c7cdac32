//! Protocol constants for TCPLS.
//!
//! Wire values are fixed by the protocol and MUST NOT be changed; defaults
//! may be overridden through [`SessionConfig`](crate::session::SessionConfig).

use std::time::Duration;

// =============================================================================
// RECORD LAYER
// =============================================================================

/// TLS alert content type.
pub const CONTENT_TYPE_ALERT: u8 = 21;

/// TLS handshake content type.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// TLS application data content type.
pub const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;

/// Content type carrying TLV-framed TCPLS options and stream control messages.
pub const CONTENT_TYPE_TCPLS: u8 = 100;

/// Largest plaintext a single record may carry.
pub const MAX_PLAINTEXT_RECORD_SIZE: usize = 16384;

/// Record header size (content type + legacy version + length).
pub const RECORD_HEADER_SIZE: usize = 5;

/// Legacy record version written in every record header.
pub const RECORD_VERSION: [u8; 2] = [0x03, 0x03];

// =============================================================================
// OPTION FRAMING
// =============================================================================

/// Size of the option type tag.
pub const OPTION_TYPE_SIZE: usize = 1;

/// Size of the big-endian length prefix of variable-length options.
pub const OPTION_LENGTH_SIZE: usize = 4;

/// Payload bytes one record of a variable-length option can carry.
pub const VARLEN_CHUNK: usize = MAX_PLAINTEXT_RECORD_SIZE - OPTION_TYPE_SIZE - OPTION_LENGTH_SIZE;

/// Length-prefix bit marking a continuation record of a variable-length option.
pub const VARLEN_CONTINUATION_FLAG: u32 = 0x8000_0000;

/// Payload bytes a fixed-length option can carry.
pub const FIXED_OPTION_MAX_PAYLOAD: usize = MAX_PLAINTEXT_RECORD_SIZE - OPTION_TYPE_SIZE;

/// Default upper bound on a declared variable-length option.
pub const DEFAULT_MAX_OPTION_SIZE: usize = 1 << 20;

/// Stream identifier size in stream control messages.
pub const STREAM_ID_SIZE: usize = 4;

// =============================================================================
// USER TIMEOUT (RFC 5482)
// =============================================================================

/// Largest timeout value expressible in 15 bits.
pub const USER_TIMEOUT_MAX_VALUE: u16 = 0x7FFF;

/// Granularity bit: set for minutes, clear for seconds.
pub const USER_TIMEOUT_MINUTES_FLAG: u16 = 0x8000;

// =============================================================================
// MULTIHOMING
// =============================================================================

/// Raw size of an IPv4 address in an advertisement.
pub const IPV4_ADDRESS_SIZE: usize = 4;

/// Raw size of an IPv6 address in an advertisement.
pub const IPV6_ADDRESS_SIZE: usize = 16;

/// Largest address count an advertisement's count byte can express.
pub const MAX_ADVERTISED_ADDRESSES: usize = u8::MAX as usize;

/// Port assigned to peer-advertised addresses (advertisements carry none).
pub const DEFAULT_PEER_PORT: u16 = 443;

// =============================================================================
// CONNECTION RACING
// =============================================================================

/// Default budget shared by all paths of one race.
pub const DEFAULT_RACE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of bytes read from a path socket at once.
pub const DEFAULT_RECV_CHUNK_SIZE: usize = MAX_PLAINTEXT_RECORD_SIZE + 256;

// =============================================================================
// KEYS
// =============================================================================

/// Records protected under one traffic key before a key update is forced.
pub const KEY_USAGE_LIMIT: u64 = 1 << 24;

/// Stream id of the implicit stream that reuses the session key contexts.
pub const DEFAULT_STREAM_ID: u32 = 0;
