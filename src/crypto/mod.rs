//! Bundled pre-shared-key record layer.
//!
//! Implements [`TlsSession`](crate::core::TlsSession) so sessions can run
//! end to end without an external TLS stack:
//!
//! - **Key schedule** ([`keys`]): HKDF-SHA256 traffic secrets from a PSK
//! - **Key contexts** ([`rekey`]): ChaCha20-Poly1305 with epoch ratcheting
//! - **Anti-replay** ([`replay`]): sliding window per receive key
//! - **Record layer** ([`record`]): hello exchange and record framing

pub mod keys;
pub mod record;
pub mod rekey;
pub mod replay;

pub use record::{PskRecordLayer, RecordLayerConfig, Role};
pub use rekey::KeyContext;
pub use replay::ReplayWindow;
