use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use dnsd_core::wire::{CLASS_IN, Soa, rtype};
use dnsd_core::zone::parse_record;
use dnsd_core::{
    Arena, Layer, Name, Opcode, Packet, PacketWriter, QueryHandler, QueryParams, Zone, ZoneSet,
    handle_query,
};
use std::sync::Arc;

fn zones() -> Arc<ZoneSet> {
    let soa = Soa {
        mname: Name::from_ascii("ns1.example.com").unwrap(),
        rname: Name::from_ascii("hostmaster.example.com").unwrap(),
        serial: 1,
        refresh: 3600,
        retry: 600,
        expire: 86400,
        minimum: 300,
    };
    let mut zone = Zone::new(Name::from_ascii("example.com").unwrap(), soa, 3600);
    for i in 0..100 {
        let owner = format!("host{i}.example.com");
        zone.add_record(parse_record(&owner, "A", 300, &format!("192.0.2.{}", i + 1)).unwrap())
            .unwrap();
    }
    let mut set = ZoneSet::new();
    set.insert(Arc::new(zone));
    Arc::new(set)
}

fn query(qname: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    let mut w = PacketWriter::new(&mut buf);
    w.set_id(0x1234);
    w.set_opcode(Opcode::Query);
    w.put_question(Name::from_ascii(qname).unwrap().as_wire(), CLASS_IN, rtype::A)
        .unwrap();
    w.wire().to_vec()
}

fn bench_packet_parse(c: &mut Criterion) {
    let wire = query("host42.example.com");
    let mut arena = Arena::with_capacity(4096);

    let mut group = c.benchmark_group("packet_parse");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("single_question", |b| {
        b.iter(|| {
            let mut pkt = Packet::new(black_box(&wire));
            let ok = pkt.parse(&mut arena).is_ok();
            arena.reset();
            ok
        })
    });
    group.finish();
}

fn bench_handle_query(c: &mut Criterion) {
    let mut layer = Layer::new(QueryHandler::new(zones()), Arena::for_worker());
    let params = QueryParams::udp("192.0.2.200:5300".parse().unwrap(), 0);
    let mut reply = vec![0u8; 65535];

    let mut group = c.benchmark_group("handle_query");
    group.throughput(Throughput::Elements(1));

    let hit = query("host42.example.com");
    group.bench_function("answer", |b| {
        b.iter(|| handle_query(&mut layer, params, black_box(&hit), &mut reply))
    });

    let miss = query("missing.example.com");
    group.bench_function("nxdomain", |b| {
        b.iter(|| handle_query(&mut layer, params, black_box(&miss), &mut reply))
    });

    let mut garbage = hit.clone();
    garbage.extend_from_slice(&[0xFF; 7]);
    group.bench_function("formerr", |b| {
        b.iter(|| handle_query(&mut layer, params, black_box(&garbage), &mut reply))
    });

    group.finish();
}

criterion_group!(benches, bench_packet_parse, bench_handle_query);
criterion_main!(benches);
