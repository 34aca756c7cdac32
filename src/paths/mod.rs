//! Multihoming: path lists and address advertisements.

pub mod advertise;
pub mod path;

pub use path::{AddressFamily, NetworkPath, PathId, PathOrigin, PathSet, PathState};
