//! Per-thread datagram answering context.

use crate::worker::WorkerStats;
use dnsd_core::{Arena, Layer, QueryHandler, QueryParams, Responder, handle_query};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Query layer and counters owned by one worker thread.
///
/// Every backend funnels received datagrams through [`UdpContext::handle`],
/// which runs one complete exchange and resets the per-query arena.
pub struct UdpContext {
    layer: Layer<QueryHandler>,
    thread_id: usize,
    stats: Arc<WorkerStats>,
}

impl UdpContext {
    /// Create a context with a worker-sized arena
    pub fn new(
        responder: Arc<dyn Responder>,
        thread_id: usize,
        max_udp_payload: u16,
        stats: Arc<WorkerStats>,
    ) -> Self {
        let handler = QueryHandler::new(responder).with_max_udp_payload(max_udp_payload);
        Self {
            layer: Layer::new(handler, Arena::for_worker()),
            thread_id,
            stats,
        }
    }

    /// Worker thread id
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Counters shared with the server
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Answer one datagram.
    ///
    /// Writes the reply into `tx` and returns its length; zero means the
    /// query must not be answered.
    pub fn handle(
        &mut self,
        fd: Option<RawFd>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        rx: &[u8],
        tx: &mut [u8],
    ) -> usize {
        let params = QueryParams {
            local,
            socket: fd,
            ..QueryParams::udp(remote, self.thread_id)
        };

        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let len = handle_query(&mut self.layer, params, rx, tx);
        if len == 0 {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        len
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dnsd_core::wire::{CLASS_IN, Name, Record, Soa, rtype};
    use dnsd_core::{Zone, ZoneSet};

    pub(crate) fn test_zones() -> Arc<dyn Responder> {
        let soa = Soa {
            mname: Name::from_ascii("ns1.example.com.").unwrap(),
            rname: Name::from_ascii("admin.example.com.").unwrap(),
            serial: 2024010101,
            refresh: 3600,
            retry: 600,
            expire: 86400,
            minimum: 300,
        };
        let apex = Name::from_ascii("example.com.").unwrap();
        let mut zone = Zone::new(apex, soa, 3600);
        zone.add_record(Record::new(
            Name::from_ascii("www.example.com.").unwrap(),
            rtype::A,
            300,
            vec![192, 0, 2, 1],
        ))
        .unwrap();
        let mut zones = ZoneSet::new();
        zones.insert(Arc::new(zone));
        Arc::new(zones)
    }

    pub(crate) fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        pkt.extend_from_slice(Name::from_ascii(name).unwrap().as_wire());
        pkt.extend_from_slice(&qtype.to_be_bytes());
        pkt.extend_from_slice(&CLASS_IN.to_be_bytes());
        pkt
    }

    fn context() -> UdpContext {
        UdpContext::new(test_zones(), 3, 1232, Arc::new(WorkerStats::default()))
    }

    #[test]
    fn test_handle_answers() {
        let mut ctx = context();
        let mut tx = vec![0u8; 65535];
        let q = query(0x1234, "www.example.com.", rtype::A);
        let len = ctx.handle(None, "127.0.0.1:5300".parse().unwrap(), None, &q, &mut tx);

        assert!(len > q.len());
        assert_eq!(&tx[..2], &[0x12, 0x34]);
        assert_eq!(tx[2] & 0x80, 0x80);
        assert_eq!(ctx.stats().received.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.stats().dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_handle_drops_responses() {
        let mut ctx = context();
        let mut tx = vec![0u8; 65535];
        let mut q = query(1, "www.example.com.", rtype::A);
        q[2] |= 0x80;
        let len = ctx.handle(None, "127.0.0.1:5300".parse().unwrap(), None, &q, &mut tx);

        assert_eq!(len, 0);
        assert_eq!(ctx.stats().dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_handle_short_input() {
        let mut ctx = context();
        let mut tx = vec![0u8; 65535];
        let remote = "127.0.0.1:5300".parse().unwrap();
        assert_eq!(ctx.handle(None, remote, None, &[], &mut tx), 0);
        assert_eq!(ctx.handle(None, remote, None, &[0; 5], &mut tx), 0);
    }

    #[test]
    fn test_handle_reuses_arena() {
        let mut ctx = context();
        let mut tx = vec![0u8; 65535];
        let remote = "127.0.0.1:5300".parse().unwrap();
        let q = query(7, "www.example.com.", rtype::A);
        for _ in 0..1000 {
            assert!(ctx.handle(None, remote, None, &q, &mut tx) > 0);
        }
        assert_eq!(ctx.layer.arena().used(), 0);
    }
}
