//! Minimal DNS wire helpers.
//!
//! The full message codec lives outside the processing core. This module only
//! carries what the core must touch directly: header bits, the question
//! section, a record writer for answers and NOTIFY hints, and the EDNS OPT
//! pseudo-record. Parsing never panics on hostile input; it stops at the first
//! problem and records how far it got in [`Packet::parsed`].

use crate::arena::{Arena, Span};
use crate::error::WireError;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Fixed DNS header size
pub const WIRE_HEADER_SIZE: usize = 12;

/// Largest message that fits any transport
pub const MAX_PKTSIZE: usize = 65535;

/// Default EDNS payload advertised for both address families
pub const MAX_UDP_PAYLOAD: u16 = 1232;

/// Payload limit for clients without EDNS
pub const MIN_UDP_PAYLOAD: u16 = 512;

/// Largest domain name in wire form
pub const MAX_NAME_LEN: usize = 255;

const MAX_LABEL_LEN: usize = 63;

/// Class IN
pub const CLASS_IN: u16 = 1;

/// Resource record types used by the core
pub mod rtype {
    /// IPv4 address
    pub const A: u16 = 1;
    /// Authoritative name server
    pub const NS: u16 = 2;
    /// Start of authority
    pub const SOA: u16 = 6;
    /// Text strings
    pub const TXT: u16 = 16;
    /// IPv6 address
    pub const AAAA: u16 = 28;
    /// EDNS pseudo-record
    pub const OPT: u16 = 41;
    /// Incremental zone transfer
    pub const IXFR: u16 = 251;
    /// Full zone transfer
    pub const AXFR: u16 = 252;
    /// Any type
    pub const ANY: u16 = 255;
}

// Header flag bits (first flags byte)
const FLAG_QR: u8 = 0x80;
const FLAG_AA: u8 = 0x04;
const FLAG_TC: u8 = 0x02;
const FLAG_RD: u8 = 0x01;
const OPCODE_MASK: u8 = 0x78;
const RCODE_MASK: u8 = 0x0F;

/// Message operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Standard query
    Query,
    /// Inverse query (obsolete)
    IQuery,
    /// Server status
    Status,
    /// Zone change notification
    Notify,
    /// Dynamic update
    Update,
    /// Unassigned value
    Other(u8),
}

impl Opcode {
    /// Decode from the 4-bit header value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Query,
            1 => Self::IQuery,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            other => Self::Other(other & 0x0F),
        }
    }

    /// Encode to the 4-bit header value
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Query => 0,
            Self::IQuery => 1,
            Self::Status => 2,
            Self::Notify => 4,
            Self::Update => 5,
            Self::Other(v) => v & 0x0F,
        }
    }
}

/// Response code, including EDNS extended values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rcode(pub u16);

impl Rcode {
    /// No error
    pub const NOERROR: Self = Self(0);
    /// Format error
    pub const FORMERR: Self = Self(1);
    /// Server failure
    pub const SERVFAIL: Self = Self(2);
    /// Name does not exist
    pub const NXDOMAIN: Self = Self(3);
    /// Not implemented
    pub const NOTIMP: Self = Self(4);
    /// Refused
    pub const REFUSED: Self = Self(5);
    /// Not authoritative
    pub const NOTAUTH: Self = Self(9);
    /// Not within zone
    pub const NOTZONE: Self = Self(10);
    /// Unsupported EDNS version
    pub const BADVERS: Self = Self(16);

    /// Mnemonic used in logs
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "NOERROR",
            1 => "FORMERR",
            2 => "SERVFAIL",
            3 => "NXDOMAIN",
            4 => "NOTIMP",
            5 => "REFUSED",
            6 => "YXDOMAIN",
            7 => "YXRRSET",
            8 => "NXRRSET",
            9 => "NOTAUTH",
            10 => "NOTZONE",
            16 => "BADVERS",
            _ => "UNKNOWN",
        }
    }

    /// Low four bits stored in the header
    pub fn header_bits(self) -> u8 {
        (self.0 & 0x0F) as u8
    }

    /// High eight bits stored in the OPT record
    pub fn ext_bits(self) -> u8 {
        ((self.0 >> 4) & 0xFF) as u8
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Domain name in uncompressed wire form
#[derive(Clone, Debug)]
pub struct Name(Vec<u8>);

impl Name {
    /// The root name
    pub fn root() -> Self {
        Self(vec![0])
    }

    /// Parse presentation form, e.g. `example.com.` (trailing dot optional)
    pub fn from_ascii(text: &str) -> Result<Self, WireError> {
        let text = text.strip_suffix('.').unwrap_or(text);
        if text.is_empty() {
            return Ok(Self::root());
        }

        let mut wire = Vec::with_capacity(text.len() + 2);
        for label in text.split('.') {
            if label.is_empty() {
                return Err(WireError::MalformedName);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(WireError::LabelTooLong);
            }
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
        wire.push(0);

        if wire.len() > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        Ok(Self(wire))
    }

    /// Validate and copy an uncompressed wire-form name
    pub fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        let len = validate_wire_name(bytes)?;
        if len != bytes.len() {
            return Err(WireError::MalformedName);
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Wire-form bytes, including the root label
    pub fn as_wire(&self) -> &[u8] {
        &self.0
    }

    /// Number of labels, not counting the root
    pub fn label_count(&self) -> usize {
        labels(&self.0).count()
    }

    /// Whether this name equals or is below `zone`
    pub fn ends_with(&self, zone: &Name) -> bool {
        name_ends_with(&self.0, &zone.0)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        names_equal(&self.0, &other.0)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in &self.0 {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_presentation(f, &self.0)
    }
}

/// Render a wire-form name for logs
pub fn name_to_string(wire: &[u8]) -> String {
    struct Show<'a>(&'a [u8]);
    impl fmt::Display for Show<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write_presentation(f, self.0)
        }
    }
    Show(wire).to_string()
}

fn write_presentation(f: &mut fmt::Formatter<'_>, wire: &[u8]) -> fmt::Result {
    let mut any = false;
    for label in labels(wire) {
        for &b in label {
            match b {
                b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                0x21..=0x7E => write!(f, "{}", b as char)?,
                _ => write!(f, "\\{:03}", b)?,
            }
        }
        f.write_str(".")?;
        any = true;
    }
    if !any {
        f.write_str(".")?;
    }
    Ok(())
}

/// Iterate the labels of a well-formed wire name
fn labels(wire: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        let len = *wire.get(pos)? as usize;
        if len == 0 || pos + 1 + len > wire.len() {
            return None;
        }
        let label = &wire[pos + 1..pos + 1 + len];
        pos += 1 + len;
        Some(label)
    })
}

fn validate_wire_name(bytes: &[u8]) -> Result<usize, WireError> {
    let mut pos = 0;
    loop {
        let len = *bytes.get(pos).ok_or(WireError::Truncated(pos))? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong);
        }
        pos += 1 + len;
        if pos > bytes.len() {
            return Err(WireError::Truncated(bytes.len()));
        }
    }
    if pos > MAX_NAME_LEN {
        return Err(WireError::NameTooLong);
    }
    Ok(pos)
}

/// ASCII case-insensitive comparison of two wire names
pub fn names_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b)
}

/// Whether `name` equals or is a subdomain of `suffix` (both wire form)
pub fn name_ends_with(name: &[u8], suffix: &[u8]) -> bool {
    if suffix.len() > name.len() {
        return false;
    }
    let mut pos = 0;
    loop {
        if name.len() - pos == suffix.len() {
            return names_equal(&name[pos..], suffix);
        }
        match name.get(pos) {
            Some(&len) if len != 0 => pos += 1 + len as usize,
            _ => return false,
        }
        if pos > name.len() {
            return false;
        }
    }
}

/// Read a possibly compressed name starting at `pos`.
///
/// Returns the name length in `out` and the position after the name in the
/// original byte stream. Pointers must point strictly before the previously
/// followed position, which bounds the walk.
fn read_name(
    wire: &[u8],
    mut pos: usize,
    out: &mut [u8; MAX_NAME_LEN],
) -> Result<(usize, usize), WireError> {
    let mut len = 0;
    let mut next = None;
    let mut limit = pos;

    loop {
        let b = *wire.get(pos).ok_or(WireError::Truncated(pos))?;
        match b & 0xC0 {
            0x00 => {
                let label_len = b as usize;
                if label_len == 0 {
                    if len + 1 > MAX_NAME_LEN {
                        return Err(WireError::NameTooLong);
                    }
                    out[len] = 0;
                    len += 1;
                    return Ok((len, next.unwrap_or(pos + 1)));
                }
                let end = pos + 1 + label_len;
                if end > wire.len() {
                    return Err(WireError::Truncated(wire.len()));
                }
                if len + 1 + label_len + 1 > MAX_NAME_LEN {
                    return Err(WireError::NameTooLong);
                }
                out[len..len + 1 + label_len].copy_from_slice(&wire[pos..end]);
                len += 1 + label_len;
                pos = end;
            }
            0xC0 => {
                let lo = *wire.get(pos + 1).ok_or(WireError::Truncated(pos + 1))?;
                let target = (((b & 0x3F) as usize) << 8) | lo as usize;
                if target >= limit {
                    return Err(WireError::BadPointer);
                }
                if next.is_none() {
                    next = Some(pos + 2);
                }
                limit = target;
                pos = target;
            }
            _ => return Err(WireError::MalformedName),
        }
    }
}

fn read_u16(wire: &[u8], pos: usize) -> Result<u16, WireError> {
    match wire.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(WireError::Truncated(wire.len())),
    }
}

fn read_u32(wire: &[u8], pos: usize) -> Result<u32, WireError> {
    match wire.get(pos..pos + 4) {
        Some(b) => Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(WireError::Truncated(wire.len())),
    }
}

/// EDNS(0) parameters carried in the OPT pseudo-record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edns {
    /// Advertised UDP payload size
    pub payload: u16,
    /// Upper eight bits of the extended rcode
    pub ext_rcode: u8,
    /// EDNS version
    pub version: u8,
    /// DNSSEC OK bit
    pub do_bit: bool,
}

impl Edns {
    /// EDNS version 0 with the given payload
    pub fn new(payload: u16) -> Self {
        Self {
            payload,
            ext_rcode: 0,
            version: 0,
            do_bit: false,
        }
    }

    fn from_rr(class: u16, ttl: u32) -> Self {
        Self {
            payload: class,
            ext_rcode: (ttl >> 24) as u8,
            version: (ttl >> 16) as u8,
            do_bit: ttl & 0x8000 != 0,
        }
    }

    fn ttl(&self) -> u32 {
        (u32::from(self.ext_rcode) << 24)
            | (u32::from(self.version) << 16)
            | if self.do_bit { 0x8000 } else { 0 }
    }
}

impl Default for Edns {
    fn default() -> Self {
        Self::new(MAX_UDP_PAYLOAD)
    }
}

/// The question of a parsed message; the name lives in the exchange arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Question {
    /// Decompressed query name
    pub qname: Span,
    /// Query type
    pub qtype: u16,
    /// Query class
    pub qclass: u16,
}

/// Parsed view over a received message
pub struct Packet<'a> {
    wire: &'a [u8],
    parsed: usize,
    counts: [u16; 4],
    question: Option<Question>,
    opt: Option<Edns>,
}

impl<'a> Packet<'a> {
    /// Wrap received bytes; nothing is parsed yet
    pub fn new(wire: &'a [u8]) -> Self {
        Self {
            wire,
            parsed: 0,
            counts: [0; 4],
            question: None,
            opt: None,
        }
    }

    /// Parse header, question and record framing.
    ///
    /// On error everything up to [`Packet::parsed`] remains valid.
    pub fn parse(&mut self, arena: &mut Arena) -> Result<(), WireError> {
        self.parsed = 0;
        self.question = None;
        self.opt = None;

        let wire = self.wire;
        if wire.len() < WIRE_HEADER_SIZE {
            return Err(WireError::Truncated(wire.len()));
        }
        for (i, count) in self.counts.iter_mut().enumerate() {
            *count = u16::from_be_bytes([wire[4 + i * 2], wire[5 + i * 2]]);
        }
        self.parsed = WIRE_HEADER_SIZE;

        let mut pos = WIRE_HEADER_SIZE;
        let mut scratch = [0u8; MAX_NAME_LEN];

        match self.counts[0] {
            0 => {}
            1 => {
                let (len, next) = read_name(wire, pos, &mut scratch)?;
                let qtype = read_u16(wire, next)?;
                let qclass = read_u16(wire, next + 2)?;
                let qname = arena
                    .copy(&scratch[..len])
                    .map_err(|_| WireError::NoSpace)?;
                self.question = Some(Question {
                    qname,
                    qtype,
                    qclass,
                });
                pos = next + 4;
                self.parsed = pos;
            }
            n => return Err(WireError::QuestionCount(n)),
        }

        let answers = usize::from(self.counts[1]);
        let authority = usize::from(self.counts[2]);
        let total = answers + authority + usize::from(self.counts[3]);
        for index in 0..total {
            let (name_len, next) = read_name(wire, pos, &mut scratch)?;
            let rr_type = read_u16(wire, next)?;
            let class = read_u16(wire, next + 2)?;
            let ttl = read_u32(wire, next + 4)?;
            let rdlen = usize::from(read_u16(wire, next + 8)?);
            let end = next + 10 + rdlen;
            if end > wire.len() {
                return Err(WireError::Truncated(wire.len()));
            }

            if rr_type == rtype::OPT {
                let in_additional = index >= answers + authority;
                if !in_additional || self.opt.is_some() || name_len != 1 {
                    return Err(WireError::MalformedOpt);
                }
                self.opt = Some(Edns::from_rr(class, ttl));
            }

            pos = end;
            self.parsed = pos;
        }

        if pos < wire.len() {
            return Err(WireError::TrailingData);
        }
        Ok(())
    }

    /// Pull the parsed length back by one byte.
    ///
    /// A query whose parsed length is short of its size is answered with
    /// FORMERR, so this turns a parse failure into a protocol-level error reply.
    pub fn force_formerr(&mut self) {
        self.parsed = self.parsed.saturating_sub(1);
    }

    /// Raw message bytes
    pub fn wire(&self) -> &'a [u8] {
        self.wire
    }

    /// Message size in bytes
    pub fn size(&self) -> usize {
        self.wire.len()
    }

    /// Bytes parsed successfully
    pub fn parsed(&self) -> usize {
        self.parsed
    }

    fn flags1(&self) -> u8 {
        self.wire.get(2).copied().unwrap_or(0)
    }

    fn flags2(&self) -> u8 {
        self.wire.get(3).copied().unwrap_or(0)
    }

    /// Message ID
    pub fn id(&self) -> u16 {
        match self.wire.get(0..2) {
            Some(b) => u16::from_be_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    /// Response bit
    pub fn qr(&self) -> bool {
        self.flags1() & FLAG_QR != 0
    }

    /// Authoritative answer bit
    pub fn aa(&self) -> bool {
        self.flags1() & FLAG_AA != 0
    }

    /// Truncation bit
    pub fn tc(&self) -> bool {
        self.flags1() & FLAG_TC != 0
    }

    /// Recursion desired bit
    pub fn rd(&self) -> bool {
        self.flags1() & FLAG_RD != 0
    }

    /// Operation code
    pub fn opcode(&self) -> Opcode {
        Opcode::from_u8((self.flags1() & OPCODE_MASK) >> 3)
    }

    /// Response code combined with the EDNS extension bits
    pub fn ext_rcode(&self) -> Rcode {
        let low = u16::from(self.flags2() & RCODE_MASK);
        let high = self.opt.map(|o| u16::from(o.ext_rcode)).unwrap_or(0);
        Rcode((high << 4) | low)
    }

    /// Question, if one was parsed
    pub fn question(&self) -> Option<Question> {
        self.question
    }

    /// EDNS parameters, if an OPT record was parsed
    pub fn edns(&self) -> Option<Edns> {
        self.opt
    }

    /// Answer section record count
    pub fn ancount(&self) -> u16 {
        self.counts[1]
    }
}

/// Message sections in write order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    /// Question section
    Question,
    /// Answer section
    Answer,
    /// Authority section
    Authority,
    /// Additional section
    Additional,
}

/// Resource record owned by the zone data or a NOTIFY request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Owner name
    pub owner: Name,
    /// Record type
    pub rtype: u16,
    /// Record class
    pub rclass: u16,
    /// Time to live
    pub ttl: u32,
    /// Uncompressed record data
    pub rdata: Vec<u8>,
}

impl Record {
    /// Build an IN-class record
    pub fn new(owner: Name, rtype: u16, ttl: u32, rdata: Vec<u8>) -> Self {
        Self {
            owner,
            rtype,
            rclass: CLASS_IN,
            ttl,
            rdata,
        }
    }
}

/// SOA record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soa {
    /// Primary name server
    pub mname: Name,
    /// Responsible mailbox
    pub rname: Name,
    /// Zone serial
    pub serial: u32,
    /// Refresh interval
    pub refresh: u32,
    /// Retry interval
    pub retry: u32,
    /// Expiry
    pub expire: u32,
    /// Negative caching TTL
    pub minimum: u32,
}

impl Soa {
    /// Encode as record data
    pub fn to_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(self.mname.0.len() + self.rname.0.len() + 20);
        rdata.extend_from_slice(&self.mname.0);
        rdata.extend_from_slice(&self.rname.0);
        for v in [
            self.serial,
            self.refresh,
            self.retry,
            self.expire,
            self.minimum,
        ] {
            rdata.extend_from_slice(&v.to_be_bytes());
        }
        rdata
    }

    /// Decode from uncompressed record data
    pub fn from_rdata(rdata: &[u8]) -> Result<Self, WireError> {
        let mlen = validate_wire_name(rdata)?;
        let rlen = validate_wire_name(&rdata[mlen..])?;
        let fixed = mlen + rlen;
        if rdata.len() != fixed + 20 {
            return Err(WireError::Truncated(rdata.len()));
        }
        let field = |i: usize| read_u32(rdata, fixed + i * 4);
        Ok(Self {
            mname: Name(rdata[..mlen].to_vec()),
            rname: Name(rdata[mlen..fixed].to_vec()),
            serial: field(0)?,
            refresh: field(1)?,
            retry: field(2)?,
            expire: field(3)?,
            minimum: field(4)?,
        })
    }

    /// Build the SOA record for `owner`
    pub fn to_record(&self, owner: Name, ttl: u32) -> Record {
        Record::new(owner, rtype::SOA, ttl, self.to_rdata())
    }
}

/// Serial number stored in SOA record data
pub fn soa_serial(rdata: &[u8]) -> Option<u32> {
    let at = rdata.len().checked_sub(20)?;
    read_u32(rdata, at).ok()
}

/// Writes one message into a fixed caller-owned buffer.
///
/// Every write checks space up front, so a failed write leaves the message as
/// it was before the call.
pub struct PacketWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
    max: usize,
    section: Section,
    question_end: usize,
    ext_rcode: u8,
}

impl<'a> PacketWriter<'a> {
    /// Start an empty message (zeroed header) in `buf`
    pub fn new(buf: &'a mut [u8]) -> Self {
        let max = buf.len();
        let mut writer = Self {
            buf,
            len: 0,
            max,
            section: Section::Question,
            question_end: 0,
            ext_rcode: 0,
        };
        writer.clear();
        writer
    }

    /// Reset to an empty message with a zeroed header
    pub fn clear(&mut self) {
        let header = WIRE_HEADER_SIZE.min(self.buf.len());
        self.buf[..header].fill(0);
        self.len = header;
        self.question_end = header;
        self.section = Section::Question;
        self.ext_rcode = 0;
    }

    /// Limit the message size (e.g. to the UDP payload of the client)
    pub fn set_max_size(&mut self, max: usize) {
        self.max = max.clamp(self.len, self.buf.len());
    }

    /// Current size limit
    pub fn max_size(&self) -> usize {
        self.max
    }

    /// Bytes written
    pub fn size(&self) -> usize {
        self.len
    }

    /// Written message
    pub fn wire(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn has_header(&self) -> bool {
        self.buf.len() >= WIRE_HEADER_SIZE
    }

    fn set_flag1(&mut self, mask: u8, on: bool) {
        if self.has_header() {
            if on {
                self.buf[2] |= mask;
            } else {
                self.buf[2] &= !mask;
            }
        }
    }

    fn count(&self, section: Section) -> u16 {
        if !self.has_header() {
            return 0;
        }
        let at = 4 + 2 * section as usize;
        u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
    }

    fn set_count(&mut self, section: Section, value: u16) {
        if self.has_header() {
            let at = 4 + 2 * section as usize;
            self.buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
        }
    }

    /// Set the message ID
    pub fn set_id(&mut self, id: u16) {
        if self.has_header() {
            self.buf[0..2].copy_from_slice(&id.to_be_bytes());
        }
    }

    /// Message ID
    pub fn id(&self) -> u16 {
        if self.has_header() {
            u16::from_be_bytes([self.buf[0], self.buf[1]])
        } else {
            0
        }
    }

    /// Set or clear the response bit
    pub fn set_qr(&mut self, on: bool) {
        self.set_flag1(FLAG_QR, on);
    }

    /// Set or clear the authoritative bit
    pub fn set_aa(&mut self, on: bool) {
        self.set_flag1(FLAG_AA, on);
    }

    /// Set or clear the truncation bit
    pub fn set_tc(&mut self, on: bool) {
        self.set_flag1(FLAG_TC, on);
    }

    /// Set or clear the recursion desired bit
    pub fn set_rd(&mut self, on: bool) {
        self.set_flag1(FLAG_RD, on);
    }

    /// Set the operation code
    pub fn set_opcode(&mut self, opcode: Opcode) {
        if self.has_header() {
            self.buf[2] = (self.buf[2] & !OPCODE_MASK) | (opcode.to_u8() << 3);
        }
    }

    /// Set the response code; extension bits go out with the OPT record
    pub fn set_rcode(&mut self, rcode: Rcode) {
        if self.has_header() {
            self.buf[3] = (self.buf[3] & !RCODE_MASK) | rcode.header_bits();
        }
        self.ext_rcode = rcode.ext_bits();
    }

    fn reserve(&self, needed: usize) -> Result<(), WireError> {
        if self.len + needed > self.max {
            return Err(WireError::NoSpace);
        }
        Ok(())
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Write the question section
    pub fn put_question(&mut self, qname: &[u8], qclass: u16, qtype: u16) -> Result<(), WireError> {
        if !self.has_header() {
            return Err(WireError::NoSpace);
        }
        if self.section != Section::Question || self.count(Section::Question) != 0 {
            return Err(WireError::SectionOrder);
        }
        self.reserve(qname.len() + 4)?;
        self.push(qname);
        self.push(&qtype.to_be_bytes());
        self.push(&qclass.to_be_bytes());
        self.set_count(Section::Question, 1);
        self.question_end = self.len;
        Ok(())
    }

    /// Move on to `section`; sections cannot be revisited
    pub fn begin(&mut self, section: Section) -> Result<(), WireError> {
        if section < self.section {
            return Err(WireError::SectionOrder);
        }
        self.section = section;
        Ok(())
    }

    /// Append a record to the current section
    pub fn put_record(&mut self, record: &Record) -> Result<(), WireError> {
        if self.section == Section::Question {
            self.section = Section::Answer;
        }
        let rdlen = u16::try_from(record.rdata.len()).map_err(|_| WireError::NoSpace)?;
        let owner = record.owner.as_wire();
        self.reserve(owner.len() + 10 + record.rdata.len())?;

        self.push(owner);
        self.push(&record.rtype.to_be_bytes());
        self.push(&record.rclass.to_be_bytes());
        self.push(&record.ttl.to_be_bytes());
        self.push(&rdlen.to_be_bytes());
        self.push(&record.rdata);

        let section = self.section;
        let count = self.count(section).saturating_add(1);
        self.set_count(section, count);
        Ok(())
    }

    /// Append the OPT pseudo-record to the additional section
    pub fn put_opt(&mut self, edns: &Edns) -> Result<(), WireError> {
        self.begin(Section::Additional)?;
        self.reserve(11)?;

        let edns = Edns {
            ext_rcode: self.ext_rcode,
            ..*edns
        };
        self.push(&[0]);
        self.push(&rtype::OPT.to_be_bytes());
        self.push(&edns.payload.to_be_bytes());
        self.push(&edns.ttl().to_be_bytes());
        self.push(&0u16.to_be_bytes());

        let count = self.count(Section::Additional).saturating_add(1);
        self.set_count(Section::Additional, count);
        Ok(())
    }

    /// Drop everything after the question section
    pub fn truncate_to_question(&mut self) {
        if !self.has_header() {
            return;
        }
        self.len = self.question_end;
        self.section = Section::Question;
        self.set_count(Section::Answer, 0);
        self.set_count(Section::Authority, 0);
        self.set_count(Section::Additional, 0);
        if self.count(Section::Question) > 0 {
            self.section = Section::Answer;
        }
    }
}
