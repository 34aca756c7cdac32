//! Core types shared by every TCPLS layer.

pub mod constants;
pub mod error;
pub mod traits;

pub use constants::*;
pub use error::{ProtocolViolation, TcplsError, TcplsResult, TlsError};
pub use traits::{DecryptedRecord, HandshakeProgress, NoopHooks, OptionHooks, TlsSession};
