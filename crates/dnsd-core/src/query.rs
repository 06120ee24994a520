//! Server-side query processing.
//!
//! [`QueryHandler`] is the [`LayerHandler`] that answers inbound queries. It
//! classifies the query on `consume`, and on `produce` either delegates to the
//! [`Responder`] (the zone database) or synthesizes an error reply. Malformed
//! input never escapes as an error: a short parse turns into FORMERR.

use crate::error::WireError;
use crate::layer::{Layer, LayerEnv, LayerFlags, LayerHandler, LayerState};
use crate::wire::{
    Edns, MAX_UDP_PAYLOAD, MIN_UDP_PAYLOAD, Opcode, Packet, PacketWriter, Question, Rcode,
    WIRE_HEADER_SIZE, name_to_string, rtype,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Transport the query arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain or batched UDP, or XDP
    Udp,
    /// TCP stream
    Tcp,
    /// QUIC stream
    Quic,
}

/// Addressing and flags for one inbound query
#[derive(Debug, Clone, Copy)]
pub struct QueryParams {
    /// Client address
    pub remote: SocketAddr,
    /// Local address the query was received on, when known
    pub local: Option<SocketAddr>,
    /// Per-exchange flags merged into the layer
    pub flags: LayerFlags,
    /// Receiving socket descriptor, when there is one
    pub socket: Option<i32>,
    /// Worker thread handling the query
    pub thread_id: usize,
    /// Transport the query arrived on
    pub transport: Transport,
}

impl QueryParams {
    /// Parameters for a datagram query: replies are size limited and zone
    /// transfers are refused
    pub fn udp(remote: SocketAddr, thread_id: usize) -> Self {
        Self {
            remote,
            local: None,
            flags: LayerFlags::new().with_limit_size().with_no_transfers(),
            socket: None,
            thread_id,
            transport: Transport::Udp,
        }
    }
}

/// Query classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Regular lookup
    Normal,
    /// Full zone transfer
    Axfr,
    /// Incremental zone transfer
    Ixfr,
    /// Zone change notification
    Notify,
    /// Dynamic update
    Update,
    /// Anything else
    Invalid,
}

impl QueryKind {
    /// Classify from opcode and question type
    #[must_use]
    pub fn classify(opcode: Opcode, qtype: Option<u16>) -> Self {
        match (opcode, qtype) {
            (Opcode::Query, Some(rtype::AXFR)) => Self::Axfr,
            (Opcode::Query, Some(rtype::IXFR)) => Self::Ixfr,
            (Opcode::Query, Some(_)) => Self::Normal,
            (Opcode::Notify, Some(_)) => Self::Notify,
            (Opcode::Update, _) => Self::Update,
            _ => Self::Invalid,
        }
    }
}

/// Question as seen by a [`Responder`]
#[derive(Debug, Clone, Copy)]
pub struct QuestionRef<'a> {
    /// Decompressed query name in wire form
    pub qname: &'a [u8],
    /// Query type
    pub qtype: u16,
    /// Query class
    pub qclass: u16,
}

/// Zone database boundary.
///
/// `answer` is called with the header and question already written to `out`
/// and appends answer, authority and additional records. Returning
/// [`WireError::NoSpace`] makes the caller send a truncated reply.
pub trait Responder: Send + Sync {
    /// Answer a regular query, returning the response code
    fn answer(&self, question: &QuestionRef<'_>, out: &mut PacketWriter<'_>)
    -> Result<Rcode, WireError>;

    /// Accept an incoming NOTIFY for a served zone
    fn notify_received(&self, _question: &QuestionRef<'_>, _remote: Option<SocketAddr>) -> Rcode {
        Rcode::NOTIMP
    }
}

#[derive(Debug, Clone, Copy)]
struct QueryData {
    id: u16,
    opcode: Opcode,
    rd: bool,
    question: Option<Question>,
    edns: Option<Edns>,
    size: usize,
    parsed: usize,
    kind: QueryKind,
}

/// Layer handler answering inbound queries
pub struct QueryHandler {
    responder: Arc<dyn Responder>,
    max_udp_payload: u16,
    params: Option<QueryParams>,
    query: Option<QueryData>,
    rcode: Rcode,
}

impl QueryHandler {
    /// Create a handler answering from `responder`
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self {
            responder,
            max_udp_payload: MAX_UDP_PAYLOAD,
            params: None,
            query: None,
            rcode: Rcode::NOERROR,
        }
    }

    /// Cap on size-limited replies and the payload advertised in replies
    #[must_use]
    pub fn with_max_udp_payload(mut self, payload: u16) -> Self {
        self.max_udp_payload = payload.max(MIN_UDP_PAYLOAD);
        self
    }

    /// Response code of the last reply
    pub fn rcode(&self) -> Rcode {
        self.rcode
    }

    /// Classification of the query being processed
    pub fn kind(&self) -> Option<QueryKind> {
        self.query.map(|q| q.kind)
    }

    fn reply_limit(&self, flags: LayerFlags, query: &QueryData, out: &PacketWriter<'_>) -> usize {
        if !flags.is_size_limited() {
            return usize::MAX;
        }
        let client = query
            .edns
            .map(|e| e.payload.max(MIN_UDP_PAYLOAD))
            .unwrap_or(MIN_UDP_PAYLOAD);
        usize::from(client.min(self.max_udp_payload)).max(out.size())
    }

    fn fail(&mut self, rcode: Rcode) -> LayerState {
        self.rcode = rcode;
        LayerState::Fail
    }

    fn answer(
        &mut self,
        env: &mut LayerEnv<'_>,
        query: &QueryData,
        out: &mut PacketWriter<'_>,
    ) -> LayerState {
        let Some(q) = query.question else {
            return self.fail(Rcode::FORMERR);
        };
        let Some(qname) = env.arena.get(q.qname) else {
            return self.fail(Rcode::SERVFAIL);
        };

        let limit = self.reply_limit(*env.flags, query, out);
        write_header(query, out);
        out.set_max_size(limit);
        if out.put_question(qname, q.qclass, q.qtype).is_err() {
            return self.fail(Rcode::SERVFAIL);
        }

        // Keep room for the OPT record
        if query.edns.is_some() {
            out.set_max_size(limit.saturating_sub(OPT_RR_SIZE));
        }

        let question = QuestionRef {
            qname,
            qtype: q.qtype,
            qclass: q.qclass,
        };
        match self.responder.answer(&question, out) {
            Ok(rcode) => {
                out.set_rcode(rcode);
                self.rcode = rcode;
                out.set_max_size(limit);
                self.finish_reply(query, out)
            }
            Err(WireError::NoSpace) => {
                out.set_max_size(limit);
                self.rcode = Rcode::NOERROR;
                truncate_reply(query, out, self.max_udp_payload)
            }
            Err(err) => {
                debug!(qname = %name_to_string(qname), error = %err, "answer failed");
                self.fail(Rcode::SERVFAIL)
            }
        }
    }

    fn notify(
        &mut self,
        env: &mut LayerEnv<'_>,
        query: &QueryData,
        out: &mut PacketWriter<'_>,
    ) -> LayerState {
        let Some(q) = query.question else {
            return self.fail(Rcode::FORMERR);
        };
        let Some(qname) = env.arena.get(q.qname) else {
            return self.fail(Rcode::SERVFAIL);
        };

        let remote = self.params.map(|p| p.remote);
        let question = QuestionRef {
            qname,
            qtype: q.qtype,
            qclass: q.qclass,
        };
        let rcode = self.responder.notify_received(&question, remote);
        debug!(
            zone = %name_to_string(qname),
            remote = ?remote,
            rcode = %rcode,
            "NOTIFY received"
        );
        if rcode != Rcode::NOERROR {
            return self.fail(rcode);
        }

        write_header(query, out);
        out.set_aa(true);
        if out.put_question(qname, q.qclass, q.qtype).is_err() {
            return self.fail(Rcode::SERVFAIL);
        }
        self.rcode = rcode;
        self.finish_reply(query, out)
    }

    fn finish_reply(&self, query: &QueryData, out: &mut PacketWriter<'_>) -> LayerState {
        if query.edns.is_some() && out.put_opt(&Edns::new(self.max_udp_payload)).is_err() {
            return truncate_reply(query, out, self.max_udp_payload);
        }
        LayerState::Done
    }

    fn error_reply(
        &self,
        env: &mut LayerEnv<'_>,
        query: &QueryData,
        out: &mut PacketWriter<'_>,
    ) -> LayerState {
        write_header(query, out);
        out.set_max_size(usize::MAX);
        if let Some(q) = query.question {
            if let Some(qname) = env.arena.get(q.qname) {
                // A question that does not fit is simply left out
                let _ = out.put_question(qname, q.qclass, q.qtype);
            }
        }
        out.set_rcode(self.rcode);
        if query.edns.is_some() {
            let _ = out.put_opt(&Edns::new(self.max_udp_payload));
        }
        LayerState::Done
    }
}

const OPT_RR_SIZE: usize = 11;

fn write_header(query: &QueryData, out: &mut PacketWriter<'_>) {
    out.clear();
    out.set_id(query.id);
    out.set_opcode(query.opcode);
    out.set_qr(true);
    out.set_rd(query.rd);
}

fn truncate_reply(query: &QueryData, out: &mut PacketWriter<'_>, payload: u16) -> LayerState {
    out.truncate_to_question();
    out.set_tc(true);
    out.set_rcode(Rcode::NOERROR);
    if query.edns.is_some() {
        let _ = out.put_opt(&Edns::new(payload));
    }
    LayerState::Done
}

impl LayerHandler for QueryHandler {
    type Params = QueryParams;

    fn begin(&mut self, env: &mut LayerEnv<'_>, params: QueryParams) -> LayerState {
        env.flags.insert(params.flags.bits());
        self.params = Some(params);
        self.query = None;
        self.rcode = Rcode::NOERROR;
        LayerState::Consume
    }

    fn consume(&mut self, _env: &mut LayerEnv<'_>, pkt: &Packet<'_>) -> LayerState {
        // Nothing can be echoed without a complete header
        if pkt.size() < WIRE_HEADER_SIZE {
            return LayerState::Noop;
        }
        // Never answer a response
        if pkt.qr() {
            return LayerState::Noop;
        }

        let question = pkt.question();
        let kind = QueryKind::classify(pkt.opcode(), question.map(|q| q.qtype));
        self.query = Some(QueryData {
            id: pkt.id(),
            opcode: pkt.opcode(),
            rd: pkt.rd(),
            question,
            edns: pkt.edns(),
            size: pkt.size(),
            parsed: pkt.parsed(),
            kind,
        });
        LayerState::Produce
    }

    fn produce(&mut self, env: &mut LayerEnv<'_>, out: &mut PacketWriter<'_>) -> LayerState {
        let Some(query) = self.query else {
            return LayerState::Noop;
        };

        if env.state == LayerState::Fail {
            return self.error_reply(env, &query, out);
        }
        if query.parsed < query.size {
            return self.fail(Rcode::FORMERR);
        }
        if query.edns.is_some_and(|e| e.version != 0) {
            return self.fail(Rcode::BADVERS);
        }

        match query.kind {
            QueryKind::Normal => self.answer(env, &query, out),
            QueryKind::Notify => self.notify(env, &query, out),
            QueryKind::Axfr | QueryKind::Ixfr => {
                let blocked = match query.kind {
                    QueryKind::Axfr => env.flags.contains(LayerFlags::NO_AXFR),
                    _ => env.flags.contains(LayerFlags::NO_IXFR),
                };
                trace!(kind = ?query.kind, blocked, "zone transfer not served");
                // Transports without transfers answer NOTIMP; elsewhere no
                // transfer is authorized.
                if blocked {
                    self.fail(Rcode::NOTIMP)
                } else {
                    self.fail(Rcode::NOTAUTH)
                }
            }
            QueryKind::Update => self.fail(Rcode::NOTIMP),
            QueryKind::Invalid => {
                let rcode = if query.question.is_none() && query.opcode == Opcode::Query {
                    Rcode::FORMERR
                } else {
                    Rcode::NOTIMP
                };
                self.fail(rcode)
            }
        }
    }

    fn finish(&mut self, _env: &mut LayerEnv<'_>) -> LayerState {
        self.params = None;
        self.query = None;
        LayerState::Noop
    }
}

/// Run one complete inbound exchange.
///
/// Parses `query`, drives the layer until it settles and returns the reply
/// length written to `reply` (zero when nothing must be sent). The layer's
/// arena is reset before returning.
pub fn handle_query(
    layer: &mut Layer<QueryHandler>,
    params: QueryParams,
    query: &[u8],
    reply: &mut [u8],
) -> usize {
    layer.begin(params);

    let mut pkt = Packet::new(query);
    if let Err(err) = pkt.parse(layer.arena_mut()) {
        trace!(remote = %params.remote, error = %err, "query parse failed");
        pkt.force_formerr();
    }
    layer.consume(&pkt);

    let mut out = PacketWriter::new(reply);
    while layer.is_active() {
        layer.produce(&mut out);
    }

    let len = if layer.state() == LayerState::Done {
        out.size()
    } else {
        0
    };
    layer.finish();
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::wire::{CLASS_IN, Name, Record, Section};
    use std::sync::Mutex;

    struct TestResponder {
        notified: Mutex<Vec<String>>,
    }

    impl Responder for TestResponder {
        fn answer(
            &self,
            question: &QuestionRef<'_>,
            out: &mut PacketWriter<'_>,
        ) -> Result<Rcode, WireError> {
            out.set_aa(true);
            let owner = Name::from_wire(question.qname)?;
            if owner == Name::from_ascii("www.example.com").unwrap() {
                out.put_record(&Record::new(owner, rtype::A, 300, vec![192, 0, 2, 1]))?;
                Ok(Rcode::NOERROR)
            } else if owner == Name::from_ascii("big.example.com").unwrap() {
                for _ in 0..10 {
                    out.put_record(&Record::new(owner.clone(), rtype::TXT, 300, vec![b'x'; 200]))?;
                }
                Ok(Rcode::NOERROR)
            } else {
                Ok(Rcode::NXDOMAIN)
            }
        }

        fn notify_received(&self, question: &QuestionRef<'_>, _remote: Option<SocketAddr>) -> Rcode {
            self.notified
                .lock()
                .unwrap()
                .push(name_to_string(question.qname));
            Rcode::NOERROR
        }
    }

    fn layer() -> (Layer<QueryHandler>, Arc<TestResponder>) {
        let responder = Arc::new(TestResponder {
            notified: Mutex::new(Vec::new()),
        });
        let handler = QueryHandler::new(responder.clone());
        (Layer::new(handler, Arena::with_capacity(4096)), responder)
    }

    fn params() -> QueryParams {
        QueryParams::udp("192.0.2.53:5353".parse().unwrap(), 0)
    }

    fn build(id: u16, opcode: Opcode, qname: &str, qtype: u16, edns: Option<Edns>) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut w = PacketWriter::new(&mut buf);
        w.set_id(id);
        w.set_opcode(opcode);
        w.set_rd(true);
        w.put_question(Name::from_ascii(qname).unwrap().as_wire(), CLASS_IN, qtype)
            .unwrap();
        if let Some(edns) = edns {
            w.put_opt(&edns).unwrap();
        }
        w.wire().to_vec()
    }

    fn run(layer: &mut Layer<QueryHandler>, query: &[u8]) -> Vec<u8> {
        let mut reply = vec![0u8; 65535];
        let len = handle_query(layer, params(), query, &mut reply);
        reply.truncate(len);
        reply
    }

    fn parse(reply: &[u8]) -> (u16, bool, Rcode, u16) {
        let mut arena = Arena::with_capacity(1024);
        let mut pkt = Packet::new(reply);
        pkt.parse(&mut arena).unwrap();
        (pkt.id(), pkt.qr(), pkt.ext_rcode(), pkt.ancount())
    }

    #[test]
    fn test_answer() {
        let (mut layer, _) = layer();
        let reply = run(&mut layer, &build(0xBEEF, Opcode::Query, "www.example.com", rtype::A, None));

        let (id, qr, rcode, ancount) = parse(&reply);
        assert_eq!(id, 0xBEEF);
        assert!(qr);
        assert_eq!(rcode, Rcode::NOERROR);
        assert_eq!(ancount, 1);
        assert_eq!(layer.arena().used(), 0);
    }

    #[test]
    fn test_nxdomain_with_edns() {
        let (mut layer, _) = layer();
        let query = build(1, Opcode::Query, "nope.example.com", rtype::A, Some(Edns::new(4096)));
        let reply = run(&mut layer, &query);

        let mut arena = Arena::with_capacity(1024);
        let mut pkt = Packet::new(&reply);
        pkt.parse(&mut arena).unwrap();
        assert_eq!(pkt.ext_rcode(), Rcode::NXDOMAIN);
        assert_eq!(pkt.edns().unwrap().payload, MAX_UDP_PAYLOAD);
    }

    #[test]
    fn test_response_is_dropped() {
        let (mut layer, _) = layer();
        let mut query = build(1, Opcode::Query, "www.example.com", rtype::A, None);
        query[2] |= 0x80;
        assert!(run(&mut layer, &query).is_empty());
        assert_eq!(layer.state(), LayerState::Noop);
    }

    #[test]
    fn test_short_input_is_dropped() {
        let (mut layer, _) = layer();
        assert!(run(&mut layer, &[]).is_empty());
        assert!(run(&mut layer, &[0x12, 0x34, 0x01]).is_empty());
        assert!(layer.state().is_terminal());
    }

    #[test]
    fn test_trailing_garbage_is_formerr() {
        let (mut layer, _) = layer();
        let mut query = build(7, Opcode::Query, "www.example.com", rtype::A, None);
        query.extend_from_slice(&[1, 2, 3]);
        let reply = run(&mut layer, &query);

        let (id, qr, rcode, ancount) = parse(&reply);
        assert_eq!(id, 7);
        assert!(qr);
        assert_eq!(rcode, Rcode::FORMERR);
        assert_eq!(ancount, 0);
    }

    #[test]
    fn test_bad_question_is_formerr() {
        let (mut layer, _) = layer();
        let mut query = vec![0u8; 12];
        query[0] = 0xAA;
        query[5] = 1;
        query.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        let reply = run(&mut layer, &query);

        let (id, _, rcode, _) = parse(&reply);
        assert_eq!(id, 0xAA00);
        assert_eq!(rcode, Rcode::FORMERR);
    }

    #[test]
    fn test_double_opt_is_formerr() {
        let (mut layer, _) = layer();
        let mut buf = vec![0u8; 512];
        let mut w = PacketWriter::new(&mut buf);
        w.set_id(9);
        w.put_question(Name::from_ascii("www.example.com").unwrap().as_wire(), CLASS_IN, rtype::A)
            .unwrap();
        w.begin(Section::Additional).unwrap();
        w.put_opt(&Edns::default()).unwrap();
        w.put_opt(&Edns::default()).unwrap();
        let query = w.wire().to_vec();

        let reply = run(&mut layer, &query);
        assert_eq!(reply[3] & 0x0F, Rcode::FORMERR.0 as u8);
    }

    #[test]
    fn test_transfers_not_implemented() {
        let (mut layer, _) = layer();
        for qtype in [rtype::AXFR, rtype::IXFR] {
            let reply = run(&mut layer, &build(3, Opcode::Query, "example.com", qtype, None));
            assert_eq!(parse(&reply).2, Rcode::NOTIMP);
        }
    }

    #[test]
    fn test_transfers_not_authorized_over_tcp() {
        let (mut layer, _) = layer();
        let mut params = params();
        params.flags = LayerFlags::new();
        params.transport = Transport::Tcp;
        for qtype in [rtype::AXFR, rtype::IXFR] {
            let query = build(4, Opcode::Query, "example.com", qtype, None);
            let mut reply = vec![0u8; 512];
            let len = handle_query(&mut layer, params, &query, &mut reply);
            assert_eq!(parse(&reply[..len]).2, Rcode::NOTAUTH);
        }

        // Only the blocked kind is refused at the transport level.
        params.flags = LayerFlags::from_bits(LayerFlags::NO_AXFR);
        let mut reply = vec![0u8; 512];
        let query = build(5, Opcode::Query, "example.com", rtype::AXFR, None);
        let len = handle_query(&mut layer, params, &query, &mut reply);
        assert_eq!(parse(&reply[..len]).2, Rcode::NOTIMP);
        let query = build(6, Opcode::Query, "example.com", rtype::IXFR, None);
        let len = handle_query(&mut layer, params, &query, &mut reply);
        assert_eq!(parse(&reply[..len]).2, Rcode::NOTAUTH);
    }

    #[test]
    fn test_update_not_implemented() {
        let (mut layer, _) = layer();
        let reply = run(&mut layer, &build(3, Opcode::Update, "example.com", rtype::SOA, None));
        assert_eq!(parse(&reply).2, Rcode::NOTIMP);
    }

    #[test]
    fn test_notify_acknowledged() {
        let (mut layer, responder) = layer();
        let reply = run(&mut layer, &build(11, Opcode::Notify, "example.com", rtype::SOA, None));

        let mut arena = Arena::with_capacity(1024);
        let mut pkt = Packet::new(&reply);
        pkt.parse(&mut arena).unwrap();
        assert_eq!(pkt.opcode(), Opcode::Notify);
        assert!(pkt.aa());
        assert_eq!(pkt.ext_rcode(), Rcode::NOERROR);
        assert_eq!(pkt.question().unwrap().qtype, rtype::SOA);
        assert_eq!(*responder.notified.lock().unwrap(), vec!["example.com.".to_string()]);
    }

    #[test]
    fn test_bad_edns_version() {
        let (mut layer, _) = layer();
        let edns = Edns {
            version: 1,
            ..Edns::default()
        };
        let reply = run(&mut layer, &build(5, Opcode::Query, "www.example.com", rtype::A, Some(edns)));
        assert_eq!(parse(&reply).2, Rcode::BADVERS);
    }

    #[test]
    fn test_oversize_answer_is_truncated() {
        let (mut layer, _) = layer();
        let query = build(5, Opcode::Query, "big.example.com", rtype::TXT, None);
        let reply = run(&mut layer, &query);

        assert!(reply.len() <= usize::from(MIN_UDP_PAYLOAD));
        assert_ne!(reply[2] & 0x02, 0, "TC must be set");
        let (_, _, rcode, ancount) = parse(&reply);
        assert_eq!(rcode, Rcode::NOERROR);
        assert_eq!(ancount, 0);
    }

    #[test]
    fn test_unlimited_size_over_tcp() {
        let (mut layer, _) = layer();
        let query = build(5, Opcode::Query, "big.example.com", rtype::TXT, None);
        let mut params = params();
        params.flags = LayerFlags::new();
        params.transport = Transport::Tcp;

        let mut reply = vec![0u8; 65535];
        let len = handle_query(&mut layer, params, &query, &mut reply);
        assert!(len > usize::from(MIN_UDP_PAYLOAD));
        assert_eq!(parse(&reply[..len]).3, 10);
    }

    #[test]
    fn test_classify() {
        assert_eq!(QueryKind::classify(Opcode::Query, Some(rtype::A)), QueryKind::Normal);
        assert_eq!(QueryKind::classify(Opcode::Query, None), QueryKind::Invalid);
        assert_eq!(QueryKind::classify(Opcode::Notify, Some(rtype::SOA)), QueryKind::Notify);
        assert_eq!(QueryKind::classify(Opcode::Status, Some(rtype::A)), QueryKind::Invalid);
    }
}
