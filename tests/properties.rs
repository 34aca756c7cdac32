//! Property-based tests for address advertisements, path lists and option reassembly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use proptest::prelude::*;
use tcpls_protocol::options::{OptionType, Reassembler, frame_option};
use tcpls_protocol::paths::{AddressFamily, PathOrigin, PathSet, advertise};
use tcpls_protocol::Session;
use tcpls_protocol::crypto::{PskRecordLayer, RecordLayerConfig};

fn ipv4_strategy() -> impl Strategy<Value = IpAddr> {
    any::<[u8; 4]>().prop_map(|o| IpAddr::V4(Ipv4Addr::from(o)))
}

fn ipv6_strategy() -> impl Strategy<Value = IpAddr> {
    any::<[u8; 16]>().prop_map(|o| IpAddr::V6(Ipv6Addr::from(o)))
}

fn mixed_addrs() -> impl Strategy<Value = Vec<IpAddr>> {
    prop::collection::vec(prop_oneof![ipv4_strategy(), ipv6_strategy()], 0..64)
}

/// Build records for a variable-length option with caller-chosen chunk sizes.
fn split_records(tag: u8, payload: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut rest = payload;
    let mut first = true;
    let mut cuts = cuts.iter().copied();
    loop {
        let take = cuts.next().unwrap_or(rest.len()).min(rest.len());
        let (chunk, tail) = rest.split_at(take);
        let mut prefix = payload.len() as u32;
        if !first {
            prefix |= 0x8000_0000;
        }
        first = false;
        let mut record = vec![tag];
        record.extend_from_slice(&prefix.to_be_bytes());
        record.extend_from_slice(chunk);
        records.push(record);
        rest = tail;
        if rest.is_empty() {
            break;
        }
    }
    records
}

proptest! {
    #[test]
    fn advertisement_length_matches_count(addrs in mixed_addrs()) {
        for family in AddressFamily::ALL {
            let payload = advertise::encode(family, &addrs).unwrap();
            let count = addrs.iter().filter(|a| AddressFamily::of(a) == family).count();
            prop_assert_eq!(payload[0] as usize, count);
            prop_assert_eq!(payload.len(), 1 + count * family.address_size());
        }
    }

    #[test]
    fn advertisement_decodes_to_family_subset(addrs in mixed_addrs()) {
        for family in AddressFamily::ALL {
            let payload = advertise::encode(family, &addrs).unwrap();
            let decoded = advertise::decode(family, &payload).unwrap();
            let expected: Vec<IpAddr> = addrs
                .iter()
                .copied()
                .filter(|a| AddressFamily::of(a) == family)
                .collect();
            prop_assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn advertisement_rejects_wrong_length(addrs in prop::collection::vec(ipv4_strategy(), 1..16), extra in 1usize..4) {
        let mut payload = advertise::encode(AddressFamily::V4, &addrs).unwrap();
        payload.extend(std::iter::repeat_n(0u8, extra));
        prop_assert!(advertise::decode(AddressFamily::V4, &payload).is_err());
    }

    #[test]
    fn at_most_one_primary_per_list(
        adds in prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>(), any::<u16>()), 1..48)
    ) {
        let mut paths = PathSet::new();
        for (peer, v6, primary, port) in adds {
            let origin = if peer { PathOrigin::Peer } else { PathOrigin::Local };
            let ip = if v6 {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            } else {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            };
            let addr = SocketAddr::new(ip, port);
            let id = paths.add(origin, addr, primary, false).unwrap();

            let family = AddressFamily::of(&ip);
            if primary {
                prop_assert_eq!(paths.primary(origin, family).map(|p| p.id()), Some(id));
            }
            for origin in [PathOrigin::Local, PathOrigin::Peer] {
                for family in AddressFamily::ALL {
                    let primaries = paths.list(origin, family).iter().filter(|p| p.is_primary()).count();
                    prop_assert!(primaries <= 1);
                }
            }
        }
    }

    #[test]
    fn session_advertisement_tracks_local_list(
        adds in prop::collection::vec((prop_oneof![ipv4_strategy(), ipv6_strategy()], any::<bool>()), 1..48)
    ) {
        let tls = PskRecordLayer::client(RecordLayerConfig::new([1u8; 32]));
        let mut session = Session::with_defaults(tls);
        for (ip, advertise) in adds {
            let family = AddressFamily::of(&ip);
            session.add_local_address(SocketAddr::new(ip, 0), false, advertise).unwrap();
            if !advertise {
                continue;
            }

            let local = session.paths().addresses(PathOrigin::Local, family);
            let slot = session.options().get(OptionType::multihoming(family)).unwrap();
            prop_assert!(slot.settopeer);
            prop_assert_eq!(slot.payload[0] as usize, local.len());
            prop_assert_eq!(slot.payload.len(), 1 + local.len() * family.address_size());
            prop_assert_eq!(advertise::decode(family, &slot.payload).unwrap(), local);
        }
    }

    #[test]
    fn reassembly_survives_arbitrary_splits(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        cuts in prop::collection::vec(0usize..700, 0..16),
    ) {
        let tag = OptionType::BpfCc.as_u8();
        let records = split_records(tag, &payload, &cuts);
        let last = records.len() - 1;

        let mut reassembler = Reassembler::new(1 << 20);
        for (i, record) in records.iter().enumerate() {
            let complete = reassembler.push(record).unwrap();
            if i < last {
                prop_assert!(complete.is_none());
            } else {
                let complete = complete.unwrap();
                prop_assert_eq!(complete.option_type, OptionType::BpfCc);
                prop_assert_eq!(&complete.payload, &payload);
            }
        }
        prop_assert!(reassembler.in_flight().is_none());
    }

    #[test]
    fn framed_options_reassemble(payload in prop::collection::vec(any::<u8>(), 0..50_000)) {
        let mut reassembler = Reassembler::new(1 << 20);
        let mut complete = None;
        for record in frame_option(OptionType::BpfCc, &payload).unwrap() {
            prop_assert!(record.len() <= 16384);
            prop_assert!(complete.is_none());
            complete = reassembler.push(&record).unwrap();
        }
        prop_assert_eq!(complete.map(|c| c.payload), Some(payload));
    }
}
