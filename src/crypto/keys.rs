//! Key schedule of the pre-shared-key record layer.
//!
//! ```text
//! prk            = HKDF-Extract(client_random || server_random, psk)
//! client_secret  = HKDF-Expand(prk, "tcpls c ap traffic", 32)
//! server_secret  = HKDF-Expand(prk, "tcpls s ap traffic", 32)
//! key            = HKDF-Expand(secret, "key", 32)
//! iv             = HKDF-Expand(secret, "iv", 12)
//! next_secret    = HKDF-Expand(secret, "traffic upd", 32)
//! stream_secret  = HKDF-Expand(secret, "tcpls stream" || BE32(id), 32)
//! ```

use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::error::TlsError;

/// Size of traffic secrets and AEAD keys.
pub const SECRET_SIZE: usize = 32;

/// Size of the AEAD nonce / static IV.
pub const IV_SIZE: usize = 12;

/// Size of hello randoms.
pub const RANDOM_SIZE: usize = 32;

const CLIENT_TRAFFIC_LABEL: &[u8] = b"tcpls c ap traffic";
const SERVER_TRAFFIC_LABEL: &[u8] = b"tcpls s ap traffic";
const KEY_LABEL: &[u8] = b"key";
const IV_LABEL: &[u8] = b"iv";
const UPDATE_LABEL: &[u8] = b"traffic upd";
const STREAM_LABEL: &[u8] = b"tcpls stream";

/// A traffic secret. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TrafficSecret([u8; SECRET_SIZE]);

impl TrafficSecret {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }

    /// Expand `label` into `out`.
    fn expand(&self, label: &[u8], out: &mut [u8]) -> Result<(), TlsError> {
        let hk = Hkdf::<Sha256>::from_prk(&self.0).map_err(|_| TlsError::KeyDerivationFailed)?;
        hk.expand(label, out)
            .map_err(|_| TlsError::KeyDerivationFailed)
    }

    /// Secret of the next key epoch.
    pub fn next(&self) -> Result<Self, TlsError> {
        let mut out = [0u8; SECRET_SIZE];
        self.expand(UPDATE_LABEL, &mut out)?;
        Ok(Self(out))
    }

    /// Secret of a dedicated stream context.
    pub fn for_stream(&self, stream_id: u32) -> Result<Self, TlsError> {
        let mut info = [0u8; STREAM_LABEL.len() + 4];
        info[..STREAM_LABEL.len()].copy_from_slice(STREAM_LABEL);
        info[STREAM_LABEL.len()..].copy_from_slice(&stream_id.to_be_bytes());

        let mut out = [0u8; SECRET_SIZE];
        self.expand(&info, &mut out)?;
        Ok(Self(out))
    }

    /// AEAD key and static IV.
    pub fn key_and_iv(&self) -> Result<([u8; SECRET_SIZE], [u8; IV_SIZE]), TlsError> {
        let mut key = [0u8; SECRET_SIZE];
        let mut iv = [0u8; IV_SIZE];
        self.expand(KEY_LABEL, &mut key)?;
        self.expand(IV_LABEL, &mut iv)?;
        Ok((key, iv))
    }
}

impl std::fmt::Debug for TrafficSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrafficSecret(..)")
    }
}

/// Derive the (client, server) traffic secrets.
pub fn derive_traffic_secrets(
    psk: &[u8],
    client_random: &[u8; RANDOM_SIZE],
    server_random: &[u8; RANDOM_SIZE],
) -> Result<(TrafficSecret, TrafficSecret), TlsError> {
    let mut salt = [0u8; RANDOM_SIZE * 2];
    salt[..RANDOM_SIZE].copy_from_slice(client_random);
    salt[RANDOM_SIZE..].copy_from_slice(server_random);

    let hk = Hkdf::<Sha256>::new(Some(&salt), psk);
    let mut client = [0u8; SECRET_SIZE];
    let mut server = [0u8; SECRET_SIZE];
    hk.expand(CLIENT_TRAFFIC_LABEL, &mut client)
        .map_err(|_| TlsError::KeyDerivationFailed)?;
    hk.expand(SERVER_TRAFFIC_LABEL, &mut server)
        .map_err(|_| TlsError::KeyDerivationFailed)?;

    Ok((TrafficSecret(client), TrafficSecret(server)))
}

/// Fresh hello random.
pub fn generate_random() -> [u8; RANDOM_SIZE] {
    let mut random = [0u8; RANDOM_SIZE];
    OsRng.fill_bytes(&mut random);
    random
}
