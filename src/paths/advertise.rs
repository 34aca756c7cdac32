//! Address advertisement payloads.
//!
//! Wire format:
//! ```text
//! +0   Count (1 byte)
//! +1   Addresses (count * 4 bytes for IPv4, count * 16 bytes for IPv6)
//! ```
//!
//! Addresses are raw octets in network order; list order is preserved.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::path::AddressFamily;
use crate::core::constants::{IPV4_ADDRESS_SIZE, IPV6_ADDRESS_SIZE, MAX_ADVERTISED_ADDRESSES};
use crate::core::error::{ProtocolViolation, TcplsError, TcplsResult};

/// Serialize a family's address list.
///
/// Addresses of the other family are skipped.
pub fn encode<'a>(
    family: AddressFamily,
    addrs: impl IntoIterator<Item = &'a IpAddr>,
) -> TcplsResult<Vec<u8>> {
    let addrs: Vec<&IpAddr> = addrs
        .into_iter()
        .filter(|a| AddressFamily::of(a) == family)
        .collect();
    if addrs.len() > MAX_ADVERTISED_ADDRESSES {
        return Err(TcplsError::TooManyAddresses {
            family,
            max: MAX_ADVERTISED_ADDRESSES,
        });
    }

    let mut payload = Vec::new();
    payload.try_reserve_exact(1 + addrs.len() * family.address_size())?;
    payload.push(addrs.len() as u8);
    for addr in addrs {
        match addr {
            IpAddr::V4(v4) => payload.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => payload.extend_from_slice(&v6.octets()),
        }
    }
    Ok(payload)
}

/// Parse an advertisement payload.
pub fn decode(family: AddressFamily, payload: &[u8]) -> Result<Vec<IpAddr>, ProtocolViolation> {
    let Some((&count, body)) = payload.split_first() else {
        return Err(ProtocolViolation::Truncated {
            expected: 1,
            actual: 0,
        });
    };
    let count = count as usize;
    let size = family.address_size();
    if body.len() != count * size {
        return Err(ProtocolViolation::MalformedAddressList {
            family,
            count,
            len: payload.len(),
        });
    }

    let addrs = body
        .chunks_exact(size)
        .map(|raw| match family {
            AddressFamily::V4 => {
                let mut octets = [0u8; IPV4_ADDRESS_SIZE];
                octets.copy_from_slice(raw);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddressFamily::V6 => {
                let mut octets = [0u8; IPV6_ADDRESS_SIZE];
                octets.copy_from_slice(raw);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        })
        .collect();
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_v4_example() {
        let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let payload = encode(AddressFamily::V4, &addrs).unwrap();
        assert_eq!(hex::encode(&payload), "020a0000010a000002");
    }

    #[test]
    fn test_decode_preserves_order() {
        let payload = hex::decode("020a0000020a000001").unwrap();
        let addrs = decode(AddressFamily::V4, &payload).unwrap();
        assert_eq!(
            addrs,
            vec![
                "10.0.0.2".parse::<IpAddr>().unwrap(),
                "10.0.0.1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_v6_roundtrip() {
        let addrs: Vec<IpAddr> = vec!["2001:db8::1".parse().unwrap(), "fe80::2".parse().unwrap()];
        let payload = encode(AddressFamily::V6, &addrs).unwrap();
        assert_eq!(payload.len(), 1 + 2 * 16);
        assert_eq!(decode(AddressFamily::V6, &payload).unwrap(), addrs);
    }

    #[test]
    fn test_other_family_skipped() {
        let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        let payload = encode(AddressFamily::V4, &addrs).unwrap();
        assert_eq!(payload, vec![1, 10, 0, 0, 1]);
    }

    #[test]
    fn test_empty_list() {
        let payload = encode(AddressFamily::V6, std::iter::empty()).unwrap();
        assert_eq!(payload, vec![0]);
        assert!(decode(AddressFamily::V6, &payload).unwrap().is_empty());
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let err = decode(AddressFamily::V4, &[2, 10, 0, 0, 1]).unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::MalformedAddressList {
                family: AddressFamily::V4,
                count: 2,
                len: 5
            }
        );
        assert!(decode(AddressFamily::V4, &[]).is_err());
    }
}
