//! Collaborator traits for TCPLS.
//!
//! The session core never touches TLS internals or OS-level option
//! enforcement directly; both are reached through the traits below.

use crate::core::error::{TcplsResult, TlsError};
use crate::options::UserTimeout;

/// Result of feeding inbound bytes to a handshake step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeProgress {
    /// Bytes of the input consumed by this step.
    pub consumed: usize,
    /// Whether the handshake is complete after this step.
    pub complete: bool,
}

/// One decrypted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRecord {
    /// Inner content type.
    pub content_type: u8,
    /// Decrypted payload.
    pub payload: Vec<u8>,
}

/// TLS collaborator consumed by a TCPLS session.
///
/// Record protection always takes an explicit key context: `None` selects
/// the session's handshake-negotiated contexts, `Some` a dedicated stream
/// context obtained from [`derive_stream_keys`](TlsSession::derive_stream_keys).
/// No call swaps the session contexts behind the caller's back.
///
/// # Requirements
///
/// - `encrypt_record` MUST split plaintext larger than
///   [`MAX_PLAINTEXT_RECORD_SIZE`](crate::core::constants::MAX_PLAINTEXT_RECORD_SIZE)
///   into several records
/// - `decrypt_record` MUST NOT change any state when it fails, so the
///   caller may retry the same bytes under another context
/// - `decrypt_record` returns `Ok(None)` while the input holds no
///   complete record
pub trait TlsSession {
    /// Per-direction key context.
    type KeyContext;

    /// Perform one handshake step on inbound bytes.
    ///
    /// Messages to send are appended to `out`. An empty `input` starts the
    /// handshake on the initiating side.
    fn handshake(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<HandshakeProgress, TlsError>;

    /// Whether the handshake is complete.
    fn is_handshake_complete(&self) -> bool;

    /// Whether the peer confirmed support for the TCPLS extension.
    fn peer_supports_tcpls(&self) -> bool;

    /// Whether a session send key is installed.
    fn has_send_key(&self) -> bool;

    /// Whether the session send key reached its usage limit.
    fn send_key_exhausted(&self) -> bool;

    /// Replace the session send key, appending the key update message to `out`.
    fn update_send_key(&mut self, out: &mut Vec<u8>) -> Result<(), TlsError>;

    /// Derive the (encrypt, decrypt) contexts of a stream.
    fn derive_stream_keys(
        &mut self,
        stream_id: u32,
    ) -> Result<(Self::KeyContext, Self::KeyContext), TlsError>;

    /// Encrypt and frame `plaintext` as records of `content_type`, appended to `out`.
    fn encrypt_record(
        &mut self,
        key: Option<&mut Self::KeyContext>,
        content_type: u8,
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), TlsError>;

    /// Decrypt the first record of `input`.
    ///
    /// Returns the record and the number of bytes it occupied.
    fn decrypt_record(
        &mut self,
        key: Option<&mut Self::KeyContext>,
        input: &[u8],
    ) -> Result<Option<(DecryptedRecord, usize)>, TlsError>;
}

/// Local effects of options set with `setlocal` or received from the peer.
///
/// Both effects are opaque to the core: the congestion-control program is
/// handed over as bytes and never interpreted.
pub trait OptionHooks {
    /// Enforce a user timeout on the local connections.
    fn apply_user_timeout(&mut self, timeout: UserTimeout) -> TcplsResult<()>;

    /// Load a congestion-control program.
    fn load_congestion_control(&mut self, program: &[u8]) -> TcplsResult<()>;
}

/// Hooks that record nothing and only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl OptionHooks for NoopHooks {
    fn apply_user_timeout(&mut self, timeout: UserTimeout) -> TcplsResult<()> {
        tracing::debug!(?timeout, "user timeout hook not installed");
        Ok(())
    }

    fn load_congestion_control(&mut self, program: &[u8]) -> TcplsResult<()> {
        tracing::debug!(len = program.len(), "congestion control hook not installed");
        Ok(())
    }
}
