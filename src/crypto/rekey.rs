//! Per-direction key contexts with epoch ratcheting.
//!
//! A context protects records under `(epoch, sequence)` nonces. The sender
//! ratchets to the next epoch once a key has protected `usage_limit`
//! records. The receiver follows the sender forward by one epoch on demand
//! and keeps the previous epoch's key for records still in flight on
//! other paths.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use tracing::debug;
use zeroize::Zeroize;

use super::keys::{IV_SIZE, SECRET_SIZE, TrafficSecret};
use super::replay::ReplayWindow;
use crate::core::error::TlsError;

/// AEAD tag size.
pub const TAG_SIZE: usize = 16;

/// Keys of one epoch.
struct EpochKeys {
    epoch: u16,
    secret: TrafficSecret,
    key: [u8; SECRET_SIZE],
    iv: [u8; IV_SIZE],
    window: ReplayWindow,
}

impl EpochKeys {
    fn new(secret: TrafficSecret, epoch: u16) -> Result<Self, TlsError> {
        let (key, iv) = secret.key_and_iv()?;
        Ok(Self {
            epoch,
            secret,
            key,
            iv,
            window: ReplayWindow::new(),
        })
    }

    fn next(&self) -> Result<Self, TlsError> {
        let epoch = self
            .epoch
            .checked_add(1)
            .ok_or(TlsError::KeyDerivationFailed)?;
        Self::new(self.secret.next()?, epoch)
    }

    fn nonce(&self, seq: u64) -> [u8; IV_SIZE] {
        let mut nonce = self.iv;
        for (n, b) in nonce[2..4].iter_mut().zip(self.epoch.to_be_bytes()) {
            *n ^= b;
        }
        for (n, b) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
            *n ^= b;
        }
        nonce
    }

    fn seal(&self, seq: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TlsError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        cipher
            .encrypt(Nonce::from_slice(&self.nonce(seq)), Payload { msg: plaintext, aad })
            .map_err(|_| TlsError::EncryptionFailed)
    }

    fn open(&self, seq: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, TlsError> {
        if ciphertext.len() < TAG_SIZE || self.window.is_replay(seq) {
            return Err(TlsError::DecryptionFailed);
        }
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(Nonce::from_slice(&self.nonce(seq)), Payload { msg: ciphertext, aad })
            .map_err(|_| TlsError::DecryptionFailed)
    }
}

impl Drop for EpochKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

/// Key context for one direction of the session or of a stream.
pub struct KeyContext {
    current: EpochKeys,
    previous: Option<EpochKeys>,
    next_seq: u64,
    usage_limit: u64,
}

impl std::fmt::Debug for KeyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyContext")
            .field("epoch", &self.current.epoch)
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl KeyContext {
    /// Create a context at epoch 0.
    pub fn new(secret: TrafficSecret, usage_limit: u64) -> Result<Self, TlsError> {
        Ok(Self {
            current: EpochKeys::new(secret, 0)?,
            previous: None,
            next_seq: 0,
            usage_limit,
        })
    }

    /// Current epoch.
    pub fn epoch(&self) -> u16 {
        self.current.epoch
    }

    /// Records protected under the current key.
    pub fn usage(&self) -> u64 {
        self.next_seq
    }

    /// Whether the current send key reached its usage limit.
    pub fn is_exhausted(&self) -> bool {
        self.next_seq >= self.usage_limit
    }

    /// Move the send side to the next epoch.
    pub fn ratchet(&mut self) -> Result<(), TlsError> {
        let next = self.current.next()?;
        debug!(epoch = next.epoch, "send key updated");
        self.previous = Some(std::mem::replace(&mut self.current, next));
        self.next_seq = 0;
        Ok(())
    }

    /// Encrypt one record. The record header, epoch and sequence are
    /// authenticated as additional data.
    ///
    /// Returns `(epoch, seq, ciphertext)`.
    pub fn seal(
        &mut self,
        header: &[u8],
        plaintext: &[u8],
    ) -> Result<(u16, u64, Vec<u8>), TlsError> {
        if self.is_exhausted() {
            self.ratchet()?;
        }
        self.seal_current(header, plaintext)
    }

    /// Encrypt one record under the current key, even past its usage limit.
    ///
    /// Only for the key update message that retires this key.
    pub fn seal_current(
        &mut self,
        header: &[u8],
        plaintext: &[u8],
    ) -> Result<(u16, u64, Vec<u8>), TlsError> {
        let (epoch, seq) = (self.current.epoch, self.next_seq);
        let aad = record_aad(header, epoch, seq);
        let ciphertext = self.current.seal(seq, &aad, plaintext)?;
        self.next_seq += 1;
        Ok((epoch, seq, ciphertext))
    }

    /// Decrypt one record. Nothing changes unless the record authenticates.
    pub fn open(
        &mut self,
        header: &[u8],
        epoch: u16,
        seq: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        let aad = record_aad(header, epoch, seq);

        if epoch == self.current.epoch {
            let plaintext = self.current.open(seq, &aad, ciphertext)?;
            self.current.window.mark(seq);
            return Ok(plaintext);
        }

        if let Some(previous) = self.previous.as_mut().filter(|p| p.epoch == epoch) {
            let plaintext = previous.open(seq, &aad, ciphertext)?;
            previous.window.mark(seq);
            return Ok(plaintext);
        }

        if self.current.epoch.checked_add(1) == Some(epoch) {
            let mut next = self.current.next()?;
            let plaintext = next.open(seq, &aad, ciphertext)?;
            next.window.mark(seq);
            debug!(epoch, "receive key updated");
            self.previous = Some(std::mem::replace(&mut self.current, next));
            return Ok(plaintext);
        }

        Err(TlsError::DecryptionFailed)
    }
}

fn record_aad(header: &[u8], epoch: u16, seq: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + 10);
    aad.extend_from_slice(header);
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad.extend_from_slice(&seq.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &[u8] = &[23, 3, 3, 0, 42];

    fn pair(limit: u64) -> (KeyContext, KeyContext) {
        let secret = TrafficSecret::from_bytes([9u8; SECRET_SIZE]);
        (
            KeyContext::new(secret.clone(), limit).unwrap(),
            KeyContext::new(secret, limit).unwrap(),
        )
    }

    #[test]
    fn test_seal_open() {
        let (mut tx, mut rx) = pair(1 << 24);
        let (epoch, seq, ct) = tx.seal(HEADER, b"hello").unwrap();
        assert_eq!((epoch, seq), (0, 0));
        assert_eq!(rx.open(HEADER, epoch, seq, &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut tx, mut rx) = pair(1 << 24);
        let (epoch, seq, ct) = tx.seal(HEADER, b"once").unwrap();
        rx.open(HEADER, epoch, seq, &ct).unwrap();
        assert_eq!(
            rx.open(HEADER, epoch, seq, &ct),
            Err(TlsError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (mut tx, mut rx) = pair(1 << 24);
        let (epoch, seq, ct) = tx.seal(HEADER, b"data").unwrap();
        assert!(rx.open(&[23, 3, 3, 0, 43], epoch, seq, &ct).is_err());
        assert!(rx.open(HEADER, epoch, seq, &ct).is_ok());
    }

    #[test]
    fn test_usage_limit_ratchets() {
        let (mut tx, mut rx) = pair(2);
        let first = tx.seal(HEADER, b"a").unwrap();
        let second = tx.seal(HEADER, b"b").unwrap();
        assert!(tx.is_exhausted());
        let third = tx.seal(HEADER, b"c").unwrap();
        assert_eq!((third.0, third.1), (1, 0));

        // Receiver follows forward and still accepts the late old-epoch record.
        assert_eq!(rx.open(HEADER, third.0, third.1, &third.2).unwrap(), b"c");
        assert_eq!(rx.open(HEADER, first.0, first.1, &first.2).unwrap(), b"a");
        assert_eq!(rx.open(HEADER, second.0, second.1, &second.2).unwrap(), b"b");
        assert_eq!(rx.epoch(), 1);
    }

    #[test]
    fn test_seal_current_stays_in_epoch() {
        let (mut tx, _) = pair(1);
        tx.seal(HEADER, b"a").unwrap();
        assert!(tx.is_exhausted());

        let (epoch, seq, _) = tx.seal_current(HEADER, b"update").unwrap();
        assert_eq!((epoch, seq), (0, 1));
        tx.ratchet().unwrap();
        assert_eq!(tx.epoch(), 1);
    }

    #[test]
    fn test_failed_open_does_not_ratchet() {
        let (_, mut rx) = pair(1 << 24);
        assert!(rx.open(HEADER, 1, 0, &[0u8; 32]).is_err());
        assert_eq!(rx.epoch(), 0);
        assert!(rx.open(HEADER, 5, 0, &[0u8; 32]).is_err());
    }
}
