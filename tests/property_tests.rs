//! Property-based tests for dnsd
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Query Layer Properties
// ============================================================================

mod query_properties {
    use super::*;
    use dnsd_core::wire::{CLASS_IN, rtype};
    use dnsd_core::{Arena, Layer, Name, PacketWriter, QueryHandler, QueryParams, handle_query};
    use dnsd_integration_tests::fixtures::example_zones;
    use std::sync::Arc;

    fn layer() -> Layer<QueryHandler> {
        Layer::new(
            QueryHandler::new(Arc::new(example_zones(1))),
            Arena::with_capacity(16 * 1024),
        )
    }

    fn params() -> QueryParams {
        QueryParams::udp("192.0.2.1:5353".parse().unwrap(), 0)
    }

    proptest! {
        /// Arbitrary datagrams never panic; any reply echoes the id, has QR
        /// set and fits the UDP payload limit.
        #[test]
        fn arbitrary_datagram(data in prop::collection::vec(any::<u8>(), 0..600)) {
            let mut layer = layer();
            let mut reply = vec![0u8; 65535];
            let len = handle_query(&mut layer, params(), &data, &mut reply);

            if len > 0 {
                prop_assert!(data.len() >= 12);
                prop_assert!(len >= 12);
                prop_assert!(len <= usize::from(dnsd_core::MAX_UDP_PAYLOAD));
                prop_assert_eq!(&reply[..2], &data[..2]);
                prop_assert_ne!(reply[2] & 0x80, 0);
            }
            prop_assert!(!layer.is_active());
            prop_assert_eq!(layer.arena().used(), 0);
        }

        /// Responses (QR set) are never answered.
        #[test]
        fn responses_ignored(id in any::<u16>(), label in "[a-z]{1,20}") {
            let mut buf = vec![0u8; 512];
            let mut w = PacketWriter::new(&mut buf);
            w.set_id(id);
            w.set_qr(true);
            let name = Name::from_ascii(&format!("{label}.example.com")).unwrap();
            w.put_question(name.as_wire(), CLASS_IN, rtype::A).unwrap();
            let query = w.wire().to_vec();

            let mut reply = vec![0u8; 65535];
            prop_assert_eq!(handle_query(&mut layer(), params(), &query, &mut reply), 0);
        }

        /// Every well-formed query under the apex gets NOERROR or NXDOMAIN.
        #[test]
        fn in_zone_queries_answered(
            id in any::<u16>(),
            label in "[a-z0-9]{1,30}",
            qtype in prop::sample::select(vec![rtype::A, rtype::AAAA, rtype::TXT, rtype::NS]),
        ) {
            let mut buf = vec![0u8; 512];
            let mut w = PacketWriter::new(&mut buf);
            w.set_id(id);
            let name = Name::from_ascii(&format!("{label}.example.com")).unwrap();
            w.put_question(name.as_wire(), CLASS_IN, qtype).unwrap();
            let query = w.wire().to_vec();

            let mut reply = vec![0u8; 65535];
            let len = handle_query(&mut layer(), params(), &query, &mut reply);
            prop_assert!(len >= query.len());
            let rcode = reply[3] & 0x0f;
            prop_assert!(rcode == 0 || rcode == 3, "rcode {}", rcode);
        }
    }
}

// ============================================================================
// Name Properties
// ============================================================================

mod name_properties {
    use super::*;
    use dnsd_core::Name;

    proptest! {
        /// Presentation form parses back to an equal name, case-insensitively.
        #[test]
        fn name_text_roundtrip(labels in prop::collection::vec("[a-zA-Z0-9-]{1,63}", 1..4)) {
            let text = labels.join(".");
            let name = Name::from_ascii(&text).unwrap();
            let again = Name::from_ascii(&name.to_string()).unwrap();
            prop_assert_eq!(&name, &again);
            prop_assert_eq!(name, Name::from_ascii(&text.to_uppercase()).unwrap());
        }

        /// Labels over 63 bytes are rejected.
        #[test]
        fn long_label_rejected(len in 64usize..200) {
            let label = "a".repeat(len);
            let text = format!("{label}.example");
            prop_assert!(Name::from_ascii(&text).is_err());
        }
    }
}

// ============================================================================
// Connection Table Properties
// ============================================================================

mod table_properties {
    use super::*;
    use dnsd_transport::quic::{ConnTable, ConnectionId, TableConfig, cid_hash};
    use std::collections::HashSet;
    use std::time::Instant;

    proptest! {
        /// Every added id is found until removed; the bucket never changes.
        #[test]
        fn add_find_remove(
            cids in prop::collection::hash_set(prop::collection::vec(any::<u8>(), 1..=20), 1..64),
            buckets in 1usize..32,
        ) {
            let mut table = ConnTable::new(TableConfig {
                buckets,
                ..TableConfig::default()
            }).unwrap();
            let now = Instant::now();

            for (i, cid) in cids.iter().enumerate() {
                let id = ConnectionId::new(cid).unwrap();
                table.add(id, i, now).unwrap();
                prop_assert!(table.bucket_of(cid) < buckets);
                prop_assert_eq!(table.bucket_of(cid), table.bucket_of(cid));
            }
            prop_assert_eq!(table.len(), cids.len());

            for cid in &cids {
                prop_assert!(table.find(cid).is_some());
            }

            let removed: HashSet<_> = cids.iter().step_by(2).cloned().collect();
            for cid in &removed {
                prop_assert!(table.remove(cid).is_some());
            }
            for cid in &cids {
                prop_assert_eq!(table.contains(cid), !removed.contains(cid));
            }
        }

        /// The hash depends only on the bytes.
        #[test]
        fn hash_deterministic(cid in prop::collection::vec(any::<u8>(), 0..=20)) {
            let copy = cid.clone();
            prop_assert_eq!(cid_hash(&cid), cid_hash(&copy));
        }
    }
}

// ============================================================================
// Header Decoder Properties
// ============================================================================

mod decoder_properties {
    use super::*;
    use dnsd_transport::quic::decode_version_cid;
    use dnsd_transport::xdp::frame::{header_len, parse_frame, write_headers};
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    proptest! {
        /// Arbitrary datagrams never panic the QUIC header decoder, and
        /// decoded ids lie within the datagram.
        #[test]
        fn quic_decode_total(data in prop::collection::vec(any::<u8>(), 0..1500), short in 0usize..=20) {
            if let Ok(hdr) = decode_version_cid(&data, short) {
                prop_assert!(hdr.dcid.len() < data.len());
                prop_assert!(hdr.scid.len() < data.len());
            }
        }

        /// Arbitrary frames never panic the frame parser.
        #[test]
        fn frame_parse_total(data in prop::collection::vec(any::<u8>(), 0..256)) {
            if let Ok(meta) = parse_frame(&data) {
                prop_assert!(meta.payload.end <= data.len());
            }
        }

        /// Headers written for a payload describe that payload.
        #[test]
        fn frame_headers_describe_payload(
            src in any::<u32>(),
            dst in any::<u32>(),
            sport in 1u16..=u16::MAX,
            dport in 1u16..=u16::MAX,
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let src = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(src), sport));
            let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(dst), dport));
            let hdr = header_len(&src);
            let mut frame = vec![0u8; hdr + payload.len()];
            frame[hdr..].copy_from_slice(&payload);
            write_headers(&mut frame, [2; 6], [4; 6], src, dst, payload.len()).unwrap();

            let meta = parse_frame(&frame).unwrap();
            prop_assert_eq!(meta.src, src);
            prop_assert_eq!(meta.dst, dst);
            prop_assert_eq!(&frame[meta.payload], &payload[..]);
        }
    }
}

// ============================================================================
// Worker Partition Properties
// ============================================================================

mod partition_properties {
    use super::*;
    use dnsd_transport::{Role, ThreadPartition};

    proptest! {
        /// Thread ids map to roles in UDP, XDP, QUIC order without gaps.
        #[test]
        fn roles_cover_all_threads(udp in 0usize..16, xdp in 0usize..16, quic in 0usize..16) {
            let p = ThreadPartition { udp, xdp, quic };
            let mut counts = [0usize; 3];
            for id in 0..p.total() {
                let role = p.role_of(id).unwrap();
                prop_assert!(p.range(role).contains(&id));
                counts[match role {
                    Role::Udp => 0,
                    Role::Xdp => 1,
                    Role::Quic => 2,
                }] += 1;
            }
            prop_assert_eq!(counts, [udp, xdp, quic]);
            prop_assert_eq!(p.role_of(p.total()), None);
        }
    }
}

// ============================================================================
// Configuration Properties
// ============================================================================

mod config_properties {
    use super::*;
    use dnsd_cli::Config;

    proptest! {
        /// Arbitrary text never panics the configuration loader.
        #[test]
        fn config_parse_total(text in "\\PC{0,200}") {
            if let Ok(config) = Config::parse(&text) {
                let _ = config.validate();
            }
        }

        /// Listen addresses round-trip into the server configuration.
        #[test]
        fn listen_ports_preserved(ports in prop::collection::vec(1u16..=u16::MAX, 1..4)) {
            let list: Vec<String> = ports.iter().map(|p| format!("\"127.0.0.1:{p}\"")).collect();
            let text = format!("[server]\nlisten = [{}]\n", list.join(", "));
            let config = Config::parse(&text).unwrap();
            config.validate().unwrap();
            let server = config.server_config().unwrap();
            let got: Vec<u16> = server.listen.iter().map(|a| a.port()).collect();
            prop_assert_eq!(got, ports);
        }
    }
}
