//! In-memory zone data.
//!
//! A deliberately small authoritative responder used by the server binary and
//! the tests. Zones hold their SOA and a flat list of records; lookups are
//! exact-match only (no wildcards, no delegations).

use crate::error::{WireError, ZoneError};
use crate::query::{QuestionRef, Responder};
use crate::wire::{
    CLASS_IN, Name, PacketWriter, Rcode, Record, Section, Soa, name_ends_with, name_to_string,
    names_equal, rtype,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

// Bit set in `last_notified` once a serial has been recorded
const SERIAL_VALID: u64 = 1 << 32;

/// One authoritative zone
#[derive(Debug)]
pub struct Zone {
    name: Name,
    soa: Option<Soa>,
    soa_ttl: u32,
    records: Vec<Record>,
    last_notified: AtomicU64,
}

impl Zone {
    /// Create a zone with its SOA
    pub fn new(name: Name, soa: Soa, soa_ttl: u32) -> Self {
        Self {
            name,
            soa: Some(soa),
            soa_ttl,
            records: Vec::new(),
            last_notified: AtomicU64::new(0),
        }
    }

    /// Create a zone that has no contents yet
    pub fn empty(name: Name) -> Self {
        Self {
            name,
            soa: None,
            soa_ttl: 0,
            records: Vec::new(),
            last_notified: AtomicU64::new(0),
        }
    }

    /// Add a record at or below the apex
    pub fn add_record(&mut self, record: Record) -> Result<(), ZoneError> {
        if !record.owner.ends_with(&self.name) {
            return Err(ZoneError::OutOfZone {
                owner: record.owner.to_string(),
                zone: self.name.to_string(),
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Zone apex
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// SOA data, absent for an empty zone
    pub fn soa(&self) -> Option<&Soa> {
        self.soa.as_ref()
    }

    /// Current serial
    pub fn serial(&self) -> Option<u32> {
        self.soa.as_ref().map(|s| s.serial)
    }

    /// The SOA as a record at the apex
    pub fn soa_record(&self) -> Option<Record> {
        self.soa
            .as_ref()
            .map(|soa| soa.to_record(self.name.clone(), self.soa_ttl))
    }

    /// Remember the serial a remote acknowledged
    pub fn set_last_notified(&self, serial: u32) {
        self.last_notified
            .store(SERIAL_VALID | u64::from(serial), Ordering::Release);
    }

    /// Last acknowledged serial, if any
    pub fn last_notified(&self) -> Option<u32> {
        let value = self.last_notified.load(Ordering::Acquire);
        if value & SERIAL_VALID != 0 {
            Some(value as u32)
        } else {
            None
        }
    }

    /// Number of records excluding the SOA
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the zone has no contents
    pub fn is_empty(&self) -> bool {
        self.soa.is_none() && self.records.is_empty()
    }

    fn negative_soa(&self) -> Option<Record> {
        self.soa.as_ref().map(|soa| {
            let ttl = self.soa_ttl.min(soa.minimum);
            soa.to_record(self.name.clone(), ttl)
        })
    }

    fn answer(&self, question: &QuestionRef<'_>, out: &mut PacketWriter<'_>) -> Result<Rcode, WireError> {
        let Some(soa) = self.soa_record() else {
            return Ok(Rcode::SERVFAIL);
        };
        out.set_aa(true);

        let at_apex = names_equal(question.qname, self.name.as_wire());
        let wants = |t: u16| question.qtype == t || question.qtype == rtype::ANY;

        let mut answered = 0;
        if at_apex && wants(rtype::SOA) {
            out.put_record(&soa)?;
            answered += 1;
        }

        let mut exists = at_apex;
        for record in &self.records {
            if !names_equal(record.owner.as_wire(), question.qname) {
                continue;
            }
            exists = true;
            if wants(record.rtype) {
                out.put_record(record)?;
                answered += 1;
            }
        }

        if answered > 0 {
            return Ok(Rcode::NOERROR);
        }

        out.begin(Section::Authority)?;
        if let Some(negative) = self.negative_soa() {
            out.put_record(&negative)?;
        }
        Ok(if exists { Rcode::NOERROR } else { Rcode::NXDOMAIN })
    }
}

/// Set of served zones, answering by longest matching apex
#[derive(Debug, Default)]
pub struct ZoneSet {
    zones: Vec<Arc<Zone>>,
}

impl ZoneSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zone, replacing any zone with the same apex
    pub fn insert(&mut self, zone: Arc<Zone>) {
        self.zones.retain(|z| z.name() != zone.name());
        self.zones.push(zone);
    }

    /// Zone with exactly this apex
    pub fn get(&self, name: &Name) -> Option<&Arc<Zone>> {
        self.zones.iter().find(|z| z.name() == name)
    }

    /// Closest enclosing zone for a wire-form name
    pub fn find(&self, qname: &[u8]) -> Option<&Arc<Zone>> {
        self.zones
            .iter()
            .filter(|z| name_ends_with(qname, z.name().as_wire()))
            .max_by_key(|z| z.name().as_wire().len())
    }

    /// All zones
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Zone>> {
        self.zones.iter()
    }

    /// Number of zones
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Whether no zone is served
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

impl Responder for ZoneSet {
    fn answer(&self, question: &QuestionRef<'_>, out: &mut PacketWriter<'_>) -> Result<Rcode, WireError> {
        if question.qclass != CLASS_IN {
            return Ok(Rcode::REFUSED);
        }
        match self.find(question.qname) {
            Some(zone) => zone.answer(question, out),
            None => Ok(Rcode::REFUSED),
        }
    }

    fn notify_received(&self, question: &QuestionRef<'_>, remote: Option<SocketAddr>) -> Rcode {
        let served = self
            .zones
            .iter()
            .any(|z| names_equal(z.name().as_wire(), question.qname));
        if !served || question.qtype != rtype::SOA {
            return Rcode::NOTAUTH;
        }
        info!(
            zone = %name_to_string(question.qname),
            remote = ?remote,
            "NOTIFY accepted"
        );
        Rcode::NOERROR
    }
}

/// Build a record from presentation data (A, AAAA, NS and TXT)
pub fn parse_record(owner: &str, rtype_name: &str, ttl: u32, data: &str) -> Result<Record, ZoneError> {
    let invalid = |rtype: &'static str, reason: String| ZoneError::InvalidData { rtype, reason };
    let owner = Name::from_ascii(owner).map_err(|e| invalid("owner", e.to_string()))?;

    let (rtype, rdata) = match rtype_name.to_ascii_uppercase().as_str() {
        "A" => {
            let addr: Ipv4Addr = data
                .trim()
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("A", e.to_string()))?;
            (rtype::A, addr.octets().to_vec())
        }
        "AAAA" => {
            let addr: Ipv6Addr = data
                .trim()
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("AAAA", e.to_string()))?;
            (rtype::AAAA, addr.octets().to_vec())
        }
        "NS" => {
            let target = Name::from_ascii(data.trim()).map_err(|e| invalid("NS", e.to_string()))?;
            (rtype::NS, target.as_wire().to_vec())
        }
        "TXT" => {
            let mut rdata = Vec::with_capacity(data.len() + 1);
            for chunk in data.as_bytes().chunks(255) {
                rdata.push(chunk.len() as u8);
                rdata.extend_from_slice(chunk);
            }
            if rdata.is_empty() {
                rdata.push(0);
            }
            (rtype::TXT, rdata)
        }
        other => {
            return Err(ZoneError::InvalidData {
                rtype: "record",
                reason: format!("unsupported type {other}"),
            });
        }
    };

    Ok(Record::new(owner, rtype, ttl, rdata))
}
