//! # TCPLS Protocol
//!
//! TCPLS carries TCP-level options and multipath control inside the
//! encrypted records of a TLS session, so middleboxes cannot strip or
//! rewrite them. It provides:
//!
//! - **Options**: user timeout, failover and congestion-control programs
//!   exchanged as TLV records of content type 100
//! - **Multihoming**: local address advertisement and peer path lists
//! - **Racing**: connect to every peer address at once under one deadline
//!   and keep the fastest connection as primary
//! - **Streams**: data channels bound to paths, each with its own keys
//!
//! ## Feature Flags
//!
//! - `crypto` (default): bundled pre-shared-key record layer
//!   (HKDF-SHA256, ChaCha20-Poly1305)
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and the collaborator traits
//! - [`options`]: option tags, option table and record framing
//! - [`paths`]: address lists and advertisements
//! - [`transport`]: sockets and connection racing
//! - [`stream`]: streams and their key contexts
//! - [`session`]: the [`Session`] facade
//! - [`crypto`]: record layer (requires `crypto` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tcpls_protocol::prelude::*;
//!
//! # async fn run() -> TcplsResult<()> {
//! let tls = PskRecordLayer::client(RecordLayerConfig::new([7u8; 32]));
//! let mut session = Session::with_defaults(tls);
//!
//! session.add_peer_address("192.0.2.10:443".parse().unwrap(), true)?;
//! session.add_peer_address("[2001:db8::10]:443".parse().unwrap(), false)?;
//! let outcome = session.connect_all(Duration::from_secs(1)).await?;
//! if !outcome.is_usable() {
//!     return Err(TcplsError::NoPrimaryPath);
//! }
//!
//! session.set_user_timeout(UserTimeout::seconds(30).unwrap(), true, true)?;
//! session.handshake(Duration::from_secs(5)).await?;
//! session.send(None, b"hello").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod options;
pub mod paths;
pub mod session;
pub mod stream;
pub mod transport;

// Record layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        HandshakeProgress, NoopHooks, OptionHooks, ProtocolViolation, TcplsError, TcplsResult,
        TlsError, TlsSession,
    };
    pub use crate::options::{OptionType, OptionValue, TimeoutUnit, UserTimeout};
    pub use crate::paths::{AddressFamily, PathId, PathOrigin, PathState};
    pub use crate::session::{Event, SendStatus, Session, SessionConfig};
    pub use crate::stream::StreamId;
    pub use crate::transport::RaceOutcome;

    #[cfg(feature = "crypto")]
    pub use crate::crypto::{PskRecordLayer, RecordLayerConfig, Role};
}

// Re-export commonly used items at crate root
pub use core::{TcplsError, TcplsResult};
pub use session::{Event, SendStatus, Session, SessionConfig};
