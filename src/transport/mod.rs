//! TCPLS Protocol - Transport Layer
//!
//! This module owns the TCP side of a session:
//!
//! - **Socket creation**: non-blocking stream sockets via `socket2`, optionally
//!   bound to a local primary address
//! - **Connection racing**: [`race`] connects every unconnected peer path under
//!   one shared deadline and reports a [`RaceOutcome`]
//! - **Primary selection**: [`select_primary`] picks the lowest-latency path
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Session / Streams               │
//! ├─────────────────────────────────────────┤
//! │         TLS records + options           │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   sockets, racing, primary path         │
//! ├─────────────────────────────────────────┤
//! │         TCP (one per path)              │
//! └─────────────────────────────────────────┘
//! ```

pub mod racer;
pub mod socket;

pub use racer::{RaceOptions, RaceOutcome, race, select_primary};
pub use socket::SocketOptions;
