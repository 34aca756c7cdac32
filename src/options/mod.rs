//! TCPLS options: tags, the option table and TLV framing.

pub mod codec;
pub mod registry;
pub mod types;

pub use codec::{CompleteOption, Reassembler, frame_option};
pub use registry::{OptionRegistry, OptionSlot};
pub use types::{OptionType, OptionValue, TimeoutUnit, UserTimeout};
