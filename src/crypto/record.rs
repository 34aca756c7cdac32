//! Pre-shared-key record layer.
//!
//! A minimal TLS-shaped collaborator for TCPLS sessions: a two-message
//! hello exchange derives traffic secrets from a pre-shared key, after
//! which records are protected with ChaCha20-Poly1305.
//!
//! Handshake record (plaintext):
//! ```text
//! +0   Content type 22 (1 byte)
//! +1   Version 0x0303 (2 bytes)
//! +3   Length (2 bytes BE) = 34
//! +5   Message type (1 = client hello, 2 = server hello)
//! +6   Random (32 bytes)
//! +38  Flags (bit 0: TCPLS supported)
//! ```
//!
//! Protected record:
//! ```text
//! +0   Content type 23 (1 byte)
//! +1   Version 0x0303 (2 bytes)
//! +3   Length (2 bytes BE)
//! +5   Epoch (2 bytes BE)
//! +7   Sequence (8 bytes BE)
//! +15  Ciphertext of (payload || inner content type) + 16-byte tag
//! ```
//!
//! The explicit epoch and sequence let records of one key context travel
//! over different paths.

use tracing::{debug, trace};
use zeroize::Zeroize;

use super::keys::{RANDOM_SIZE, TrafficSecret, derive_traffic_secrets, generate_random};
use super::rekey::{KeyContext, TAG_SIZE};
use crate::core::constants::{
    CONTENT_TYPE_APPLICATION_DATA, CONTENT_TYPE_HANDSHAKE, KEY_USAGE_LIMIT,
    MAX_PLAINTEXT_RECORD_SIZE, RECORD_HEADER_SIZE, RECORD_VERSION,
};
use crate::core::error::TlsError;
use crate::core::traits::{DecryptedRecord, HandshakeProgress, TlsSession};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const KEY_UPDATE: u8 = 24;
const HELLO_SIZE: usize = 1 + RANDOM_SIZE + 1;
const FLAG_TCPLS: u8 = 0x01;
const EXPLICIT_NONCE_SIZE: usize = 2 + 8;
const MAX_BODY_SIZE: usize = EXPLICIT_NONCE_SIZE + MAX_PLAINTEXT_RECORD_SIZE + 1 + TAG_SIZE;

/// Settings of the record layer.
#[derive(Clone)]
pub struct RecordLayerConfig {
    /// Pre-shared key.
    pub psk: Vec<u8>,
    /// Advertise TCPLS support in the hello.
    pub supports_tcpls: bool,
    /// Records per traffic key before a key update.
    pub key_usage_limit: u64,
}

impl RecordLayerConfig {
    /// Config with the given pre-shared key and TCPLS enabled.
    pub fn new(psk: impl Into<Vec<u8>>) -> Self {
        Self {
            psk: psk.into(),
            supports_tcpls: true,
            key_usage_limit: KEY_USAGE_LIMIT,
        }
    }

    /// Set TCPLS support.
    pub fn supports_tcpls(mut self, supported: bool) -> Self {
        self.supports_tcpls = supported;
        self
    }

    /// Set the key usage limit.
    pub fn key_usage_limit(mut self, limit: u64) -> Self {
        self.key_usage_limit = limit;
        self
    }
}

impl std::fmt::Debug for RecordLayerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLayerConfig")
            .field("supports_tcpls", &self.supports_tcpls)
            .field("key_usage_limit", &self.key_usage_limit)
            .finish_non_exhaustive()
    }
}

impl Drop for RecordLayerConfig {
    fn drop(&mut self) {
        self.psk.zeroize();
    }
}

/// Handshake role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the client hello.
    Client,
    /// Answers with the server hello.
    Server,
}

#[derive(Debug, Clone, Copy)]
enum HandshakeState {
    Start,
    WaitServerHello { client_random: [u8; RANDOM_SIZE] },
    Complete,
}

struct Installed {
    send: KeyContext,
    recv: KeyContext,
    send_base: TrafficSecret,
    recv_base: TrafficSecret,
}

/// Pre-shared-key record layer implementing [`TlsSession`].
pub struct PskRecordLayer {
    role: Role,
    config: RecordLayerConfig,
    state: HandshakeState,
    peer_tcpls: bool,
    keys: Option<Installed>,
}

impl std::fmt::Debug for PskRecordLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskRecordLayer")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_tcpls", &self.peer_tcpls)
            .finish_non_exhaustive()
    }
}

impl PskRecordLayer {
    /// Create the initiating side.
    pub fn client(config: RecordLayerConfig) -> Self {
        Self::new(Role::Client, config)
    }

    /// Create the responding side.
    pub fn server(config: RecordLayerConfig) -> Self {
        Self::new(Role::Server, config)
    }

    fn new(role: Role, config: RecordLayerConfig) -> Self {
        Self {
            role,
            config,
            state: HandshakeState::Start,
            peer_tcpls: false,
            keys: None,
        }
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Epoch of the session send key.
    pub fn send_epoch(&self) -> Option<u16> {
        self.keys.as_ref().map(|k| k.send.epoch())
    }

    fn hello(&self, msg_type: u8, random: &[u8; RANDOM_SIZE], out: &mut Vec<u8>) {
        out.push(CONTENT_TYPE_HANDSHAKE);
        out.extend_from_slice(&RECORD_VERSION);
        out.extend_from_slice(&(HELLO_SIZE as u16).to_be_bytes());
        out.push(msg_type);
        out.extend_from_slice(random);
        out.push(if self.config.supports_tcpls { FLAG_TCPLS } else { 0 });
    }

    fn install(
        &mut self,
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
    ) -> Result<(), TlsError> {
        let (client, server) = derive_traffic_secrets(&self.config.psk, client_random, server_random)?;
        let (send_base, recv_base) = match self.role {
            Role::Client => (client, server),
            Role::Server => (server, client),
        };
        let limit = self.config.key_usage_limit;
        self.keys = Some(Installed {
            send: KeyContext::new(send_base.clone(), limit)?,
            recv: KeyContext::new(recv_base.clone(), limit)?,
            send_base,
            recv_base,
        });
        self.state = HandshakeState::Complete;
        debug!(role = ?self.role, peer_tcpls = self.peer_tcpls, "handshake complete");
        Ok(())
    }
}

/// Split the first record off `input`.
///
/// Returns `(content type, header, body, total length)`.
fn split_record(input: &[u8]) -> Result<Option<(u8, &[u8], &[u8], usize)>, TlsError> {
    if input.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let len = u16::from_be_bytes([input[3], input[4]]) as usize;
    if len > MAX_BODY_SIZE {
        return Err(TlsError::RecordOverflow(len));
    }
    let total = RECORD_HEADER_SIZE + len;
    if input.len() < total {
        return Ok(None);
    }
    Ok(Some((
        input[0],
        &input[..RECORD_HEADER_SIZE],
        &input[RECORD_HEADER_SIZE..total],
        total,
    )))
}

fn parse_hello(content_type: u8, body: &[u8], expected: u8) -> Result<([u8; RANDOM_SIZE], bool), TlsError> {
    if content_type != CONTENT_TYPE_HANDSHAKE || body.len() != HELLO_SIZE || body[0] != expected {
        return Err(TlsError::HandshakeFailed(format!(
            "expected hello type {expected}, got content type {content_type} ({} bytes)",
            body.len()
        )));
    }
    let mut random = [0u8; RANDOM_SIZE];
    random.copy_from_slice(&body[1..1 + RANDOM_SIZE]);
    Ok((random, body[HELLO_SIZE - 1] & FLAG_TCPLS != 0))
}

/// Key selection for one outgoing record.
#[derive(Clone, Copy)]
enum Seal {
    /// Ratchet first when the key is exhausted.
    Rekeying,
    /// Stay on the current key.
    Current,
}

/// Protect one record of at most `MAX_PLAINTEXT_RECORD_SIZE` bytes into `out`.
fn write_record(
    ctx: &mut KeyContext,
    content_type: u8,
    chunk: &[u8],
    out: &mut Vec<u8>,
    seal: Seal,
) -> Result<(), TlsError> {
    let mut inner = Vec::with_capacity(chunk.len() + 1);
    inner.extend_from_slice(chunk);
    inner.push(content_type);

    let body_len = EXPLICIT_NONCE_SIZE + inner.len() + TAG_SIZE;
    let mut header = [0u8; RECORD_HEADER_SIZE];
    header[0] = CONTENT_TYPE_APPLICATION_DATA;
    header[1..3].copy_from_slice(&RECORD_VERSION);
    header[3..5].copy_from_slice(&(body_len as u16).to_be_bytes());

    let sealed = match seal {
        Seal::Rekeying => ctx.seal(&header, &inner),
        Seal::Current => ctx.seal_current(&header, &inner),
    };
    inner.zeroize();
    let (epoch, seq, ciphertext) = sealed?;

    out.extend_from_slice(&header);
    out.extend_from_slice(&epoch.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(())
}

impl TlsSession for PskRecordLayer {
    type KeyContext = KeyContext;

    fn handshake(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<HandshakeProgress, TlsError> {
        match (self.state, self.role) {
            (HandshakeState::Complete, _) => Ok(HandshakeProgress {
                consumed: 0,
                complete: true,
            }),
            (HandshakeState::Start, Role::Client) => {
                let client_random = generate_random();
                self.hello(CLIENT_HELLO, &client_random, out);
                self.state = HandshakeState::WaitServerHello { client_random };
                trace!("client hello sent");
                Ok(HandshakeProgress::default())
            }
            (HandshakeState::Start, Role::Server) => {
                let Some((ctype, _, body, total)) = split_record(input)? else {
                    return Ok(HandshakeProgress::default());
                };
                let (client_random, tcpls) = parse_hello(ctype, body, CLIENT_HELLO)?;
                let server_random = generate_random();
                self.hello(SERVER_HELLO, &server_random, out);
                self.peer_tcpls = tcpls;
                self.install(&client_random, &server_random)?;
                Ok(HandshakeProgress {
                    consumed: total,
                    complete: true,
                })
            }
            (HandshakeState::WaitServerHello { client_random }, _) => {
                let Some((ctype, _, body, total)) = split_record(input)? else {
                    return Ok(HandshakeProgress::default());
                };
                let (server_random, tcpls) = parse_hello(ctype, body, SERVER_HELLO)?;
                self.peer_tcpls = tcpls;
                self.install(&client_random, &server_random)?;
                Ok(HandshakeProgress {
                    consumed: total,
                    complete: true,
                })
            }
        }
    }

    fn is_handshake_complete(&self) -> bool {
        matches!(self.state, HandshakeState::Complete)
    }

    fn peer_supports_tcpls(&self) -> bool {
        self.config.supports_tcpls && self.peer_tcpls
    }

    fn has_send_key(&self) -> bool {
        self.keys.is_some()
    }

    fn send_key_exhausted(&self) -> bool {
        self.keys.as_ref().is_some_and(|k| k.send.is_exhausted())
    }

    fn update_send_key(&mut self, out: &mut Vec<u8>) -> Result<(), TlsError> {
        let keys = self.keys.as_mut().ok_or(TlsError::NoTrafficKey)?;
        write_record(&mut keys.send, CONTENT_TYPE_HANDSHAKE, &[KEY_UPDATE, 0], out, Seal::Current)?;
        keys.send.ratchet()
    }

    fn derive_stream_keys(&mut self, stream_id: u32) -> Result<(KeyContext, KeyContext), TlsError> {
        let keys = self.keys.as_ref().ok_or(TlsError::NoTrafficKey)?;
        let limit = self.config.key_usage_limit;
        Ok((
            KeyContext::new(keys.send_base.for_stream(stream_id)?, limit)?,
            KeyContext::new(keys.recv_base.for_stream(stream_id)?, limit)?,
        ))
    }

    fn encrypt_record(
        &mut self,
        key: Option<&mut KeyContext>,
        content_type: u8,
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), TlsError> {
        let ctx = match key {
            Some(ctx) => ctx,
            None => &mut self.keys.as_mut().ok_or(TlsError::NoTrafficKey)?.send,
        };

        let mut chunks: Vec<&[u8]> = plaintext.chunks(MAX_PLAINTEXT_RECORD_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        for chunk in chunks {
            write_record(ctx, content_type, chunk, out, Seal::Rekeying)?;
        }
        Ok(())
    }

    fn decrypt_record(
        &mut self,
        key: Option<&mut KeyContext>,
        input: &[u8],
    ) -> Result<Option<(DecryptedRecord, usize)>, TlsError> {
        let Some((ctype, header, body, total)) = split_record(input)? else {
            return Ok(None);
        };
        if ctype != CONTENT_TYPE_APPLICATION_DATA {
            return Err(TlsError::UnexpectedMessage(format!(
                "plaintext record of type {ctype} after handshake"
            )));
        }
        if body.len() < EXPLICIT_NONCE_SIZE + 1 + TAG_SIZE {
            return Err(TlsError::DecryptionFailed);
        }

        let ctx = match key {
            Some(ctx) => ctx,
            None => &mut self.keys.as_mut().ok_or(TlsError::NoTrafficKey)?.recv,
        };

        let epoch = u16::from_be_bytes([body[0], body[1]]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&body[2..EXPLICIT_NONCE_SIZE]);
        let seq = u64::from_be_bytes(seq_bytes);

        let mut payload = ctx.open(header, epoch, seq, &body[EXPLICIT_NONCE_SIZE..])?;
        let content_type = payload.pop().ok_or(TlsError::DecryptionFailed)?;

        if content_type == CONTENT_TYPE_HANDSHAKE && payload.first() == Some(&KEY_UPDATE) {
            debug!(epoch, "peer key update received");
        }
        Ok(Some((
            DecryptedRecord {
                content_type,
                payload,
            },
            total,
        )))
    }
}
