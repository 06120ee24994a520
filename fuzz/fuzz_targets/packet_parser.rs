//! Fuzz target for DNS message parsing
//!
//! Feeds arbitrary datagrams through the parser and the full query layer.
//! Neither may panic, and any reply must echo the query id.

#![no_main]

use dnsd_core::wire::{Record, Soa, rtype};
use dnsd_core::{Arena, Layer, Name, Packet, QueryHandler, QueryParams, Zone, ZoneSet, handle_query};
use libfuzzer_sys::fuzz_target;
use std::sync::{Arc, OnceLock};

fn zones() -> Arc<ZoneSet> {
    static ZONES: OnceLock<Arc<ZoneSet>> = OnceLock::new();
    ZONES
        .get_or_init(|| {
            let soa = Soa {
                mname: Name::from_ascii("ns1.fuzz.test").unwrap(),
                rname: Name::from_ascii("admin.fuzz.test").unwrap(),
                serial: 1,
                refresh: 3600,
                retry: 600,
                expire: 86400,
                minimum: 300,
            };
            let mut zone = Zone::new(Name::from_ascii("fuzz.test").unwrap(), soa, 3600);
            zone.add_record(Record::new(
                Name::from_ascii("a.fuzz.test").unwrap(),
                rtype::A,
                60,
                vec![192, 0, 2, 1],
            ))
            .unwrap();
            let mut set = ZoneSet::new();
            set.insert(Arc::new(zone));
            Arc::new(set)
        })
        .clone()
}

fuzz_target!(|data: &[u8]| {
    let mut arena = Arena::with_capacity(16 * 1024);
    let mut pkt = Packet::new(data);
    let _ = pkt.parse(&mut arena);
    assert!(pkt.parsed() <= data.len());

    let mut layer = Layer::new(QueryHandler::new(zones()), arena);
    let mut reply = vec![0u8; 65535];
    let params = QueryParams::udp("192.0.2.9:5353".parse().unwrap(), 0);
    let len = handle_query(&mut layer, params, data, &mut reply);
    if len > 0 {
        assert_eq!(&reply[..2], &data[..2]);
    }
});
