//! Option tags and typed option values.
//!
//! Wire format of a fixed-length option record:
//! ```text
//! +0   Type (1 byte)
//! +1   Payload (rest of the record)
//! ```
//!
//! Variable-length options carry a 4-byte big-endian length after the type;
//! see [`codec`](super::codec) for multi-record framing.

use std::net::IpAddr;
use std::time::Duration;

use crate::core::constants::{
    STREAM_ID_SIZE, USER_TIMEOUT_MAX_VALUE, USER_TIMEOUT_MINUTES_FLAG,
};
use crate::core::error::ProtocolViolation;
use crate::paths::{AddressFamily, advertise};
use crate::stream::StreamId;

/// Option type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionType {
    /// TCP user timeout (RFC 5482).
    UserTimeout = 0x01,
    /// IPv4 address advertisement.
    MultihomingV4 = 0x02,
    /// IPv6 address advertisement.
    MultihomingV6 = 0x03,
    /// Opaque congestion-control program.
    BpfCc = 0x04,
    /// Failover preference.
    Failover = 0x05,
    /// Stream attach control message.
    StreamAttach = 0x06,
    /// Stream close control message.
    StreamClose = 0x07,
}

impl OptionType {
    /// Number of option types.
    pub const COUNT: usize = 7;

    /// All option types in tag order.
    pub const ALL: [OptionType; Self::COUNT] = [
        OptionType::UserTimeout,
        OptionType::MultihomingV4,
        OptionType::MultihomingV6,
        OptionType::BpfCc,
        OptionType::Failover,
        OptionType::StreamAttach,
        OptionType::StreamClose,
    ];

    /// Decode a wire tag.
    pub fn from_u8(tag: u8) -> Result<Self, ProtocolViolation> {
        match tag {
            0x01 => Ok(OptionType::UserTimeout),
            0x02 => Ok(OptionType::MultihomingV4),
            0x03 => Ok(OptionType::MultihomingV6),
            0x04 => Ok(OptionType::BpfCc),
            0x05 => Ok(OptionType::Failover),
            0x06 => Ok(OptionType::StreamAttach),
            0x07 => Ok(OptionType::StreamClose),
            other => Err(ProtocolViolation::UnsupportedOption(other)),
        }
    }

    /// Wire tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Slot index in the option table.
    pub fn index(self) -> usize {
        match self {
            OptionType::UserTimeout => 0,
            OptionType::MultihomingV4 => 1,
            OptionType::MultihomingV6 => 2,
            OptionType::BpfCc => 3,
            OptionType::Failover => 4,
            OptionType::StreamAttach => 5,
            OptionType::StreamClose => 6,
        }
    }

    /// Whether the option carries a 4-byte length prefix.
    pub fn is_variable_length(self) -> bool {
        matches!(self, OptionType::BpfCc)
    }

    /// Whether the option is a stream control message rather than a stored option.
    pub fn is_stream_control(self) -> bool {
        matches!(self, OptionType::StreamAttach | OptionType::StreamClose)
    }

    /// Advertisement option for an address family.
    pub fn multihoming(family: AddressFamily) -> Self {
        match family {
            AddressFamily::V4 => OptionType::MultihomingV4,
            AddressFamily::V6 => OptionType::MultihomingV6,
        }
    }
}

/// Granularity of a user timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutUnit {
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
}

/// TCP user timeout: a 15-bit value plus a granularity bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTimeout {
    value: u16,
    unit: TimeoutUnit,
}

impl UserTimeout {
    /// Create a user timeout; `value` must fit in 15 bits.
    pub fn new(value: u16, unit: TimeoutUnit) -> Option<Self> {
        (value <= USER_TIMEOUT_MAX_VALUE).then_some(Self { value, unit })
    }

    /// Timeout in seconds.
    pub fn seconds(value: u16) -> Option<Self> {
        Self::new(value, TimeoutUnit::Seconds)
    }

    /// Timeout in minutes.
    pub fn minutes(value: u16) -> Option<Self> {
        Self::new(value, TimeoutUnit::Minutes)
    }

    /// Raw value.
    pub fn value(&self) -> u16 {
        self.value
    }

    /// Granularity.
    pub fn unit(&self) -> TimeoutUnit {
        self.unit
    }

    /// Timeout as a duration.
    pub fn as_duration(&self) -> Duration {
        match self.unit {
            TimeoutUnit::Seconds => Duration::from_secs(u64::from(self.value)),
            TimeoutUnit::Minutes => Duration::from_secs(u64::from(self.value) * 60),
        }
    }

    /// Encode as 2 big-endian bytes.
    pub fn encode(&self) -> [u8; 2] {
        let flag = match self.unit {
            TimeoutUnit::Seconds => 0,
            TimeoutUnit::Minutes => USER_TIMEOUT_MINUTES_FLAG,
        };
        (self.value | flag).to_be_bytes()
    }

    /// Decode from 2 big-endian bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolViolation> {
        let bytes: [u8; 2] = payload
            .try_into()
            .map_err(|_| ProtocolViolation::LengthMismatch {
                declared: 2,
                actual: payload.len(),
            })?;
        let raw = u16::from_be_bytes(bytes);
        let unit = if raw & USER_TIMEOUT_MINUTES_FLAG != 0 {
            TimeoutUnit::Minutes
        } else {
            TimeoutUnit::Seconds
        };
        Ok(Self {
            value: raw & USER_TIMEOUT_MAX_VALUE,
            unit,
        })
    }
}

/// A decoded option payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// User timeout.
    UserTimeout(UserTimeout),
    /// Advertised addresses of one family, in list order.
    Multihoming(AddressFamily, Vec<IpAddr>),
    /// Congestion-control program.
    BpfCc(Vec<u8>),
    /// Failover enabled.
    Failover(bool),
    /// Stream attached to the path the message arrived on.
    StreamAttach(StreamId),
    /// Stream closed.
    StreamClose(StreamId),
}

impl OptionValue {
    /// Option type of this value.
    pub fn option_type(&self) -> OptionType {
        match self {
            OptionValue::UserTimeout(_) => OptionType::UserTimeout,
            OptionValue::Multihoming(family, _) => OptionType::multihoming(*family),
            OptionValue::BpfCc(_) => OptionType::BpfCc,
            OptionValue::Failover(_) => OptionType::Failover,
            OptionValue::StreamAttach(_) => OptionType::StreamAttach,
            OptionValue::StreamClose(_) => OptionType::StreamClose,
        }
    }

    /// Decode a complete payload of the given type.
    pub fn decode(option_type: OptionType, payload: Vec<u8>) -> Result<Self, ProtocolViolation> {
        match option_type {
            OptionType::UserTimeout => UserTimeout::decode(&payload).map(OptionValue::UserTimeout),
            OptionType::MultihomingV4 => advertise::decode(AddressFamily::V4, &payload)
                .map(|addrs| OptionValue::Multihoming(AddressFamily::V4, addrs)),
            OptionType::MultihomingV6 => advertise::decode(AddressFamily::V6, &payload)
                .map(|addrs| OptionValue::Multihoming(AddressFamily::V6, addrs)),
            OptionType::BpfCc => Ok(OptionValue::BpfCc(payload)),
            OptionType::Failover => match payload.as_slice() {
                [0] => Ok(OptionValue::Failover(false)),
                [1] => Ok(OptionValue::Failover(true)),
                [_] => Err(ProtocolViolation::InvalidValue { option: option_type }),
                _ => Err(ProtocolViolation::LengthMismatch {
                    declared: 1,
                    actual: payload.len(),
                }),
            },
            OptionType::StreamAttach => decode_stream_id(&payload).map(OptionValue::StreamAttach),
            OptionType::StreamClose => decode_stream_id(&payload).map(OptionValue::StreamClose),
        }
    }
}

/// Encode a stream id for a stream control message.
pub fn encode_stream_id(id: StreamId) -> [u8; STREAM_ID_SIZE] {
    id.to_be_bytes()
}

fn decode_stream_id(payload: &[u8]) -> Result<StreamId, ProtocolViolation> {
    let bytes: [u8; STREAM_ID_SIZE] =
        payload
            .try_into()
            .map_err(|_| ProtocolViolation::LengthMismatch {
                declared: STREAM_ID_SIZE,
                actual: payload.len(),
            })?;
    Ok(StreamId::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for t in OptionType::ALL {
            assert_eq!(OptionType::from_u8(t.as_u8()).unwrap(), t);
        }
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            OptionType::from_u8(0x00),
            Err(ProtocolViolation::UnsupportedOption(0x00))
        );
        assert_eq!(
            OptionType::from_u8(0xff),
            Err(ProtocolViolation::UnsupportedOption(0xff))
        );
    }

    #[test]
    fn test_indices_unique() {
        let mut seen = [false; OptionType::COUNT];
        for t in OptionType::ALL {
            assert!(!seen[t.index()]);
            seen[t.index()] = true;
        }
    }

    #[test]
    fn test_only_bpf_cc_is_variable_length() {
        for t in OptionType::ALL {
            assert_eq!(t.is_variable_length(), t == OptionType::BpfCc);
        }
    }

    #[test]
    fn test_user_timeout_encoding() {
        let t = UserTimeout::seconds(30).unwrap();
        assert_eq!(t.encode(), [0x00, 0x1e]);

        let t = UserTimeout::minutes(5).unwrap();
        assert_eq!(t.encode(), [0x80, 0x05]);
        assert_eq!(t.as_duration(), Duration::from_secs(300));

        assert_eq!(UserTimeout::decode(&[0x80, 0x05]).unwrap(), t);
        assert!(UserTimeout::seconds(0x8000).is_none());
    }

    #[test]
    fn test_user_timeout_wrong_length() {
        assert!(matches!(
            UserTimeout::decode(&[0x01]),
            Err(ProtocolViolation::LengthMismatch { declared: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_decode_failover() {
        assert_eq!(
            OptionValue::decode(OptionType::Failover, vec![1]).unwrap(),
            OptionValue::Failover(true)
        );
        assert!(matches!(
            OptionValue::decode(OptionType::Failover, vec![7]),
            Err(ProtocolViolation::InvalidValue { .. })
        ));
        assert!(OptionValue::decode(OptionType::Failover, vec![]).is_err());
    }

    #[test]
    fn test_decode_stream_control() {
        assert_eq!(
            OptionValue::decode(OptionType::StreamAttach, vec![0, 0, 1, 2]).unwrap(),
            OptionValue::StreamAttach(0x0102)
        );
        assert!(OptionValue::decode(OptionType::StreamClose, vec![0, 1]).is_err());
    }
}
