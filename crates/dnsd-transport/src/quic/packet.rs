//! QUIC header inspection without decryption.
//!
//! Only the invariant header fields are read: the form bit, the version and
//! the connection ids. That is enough to demultiplex a datagram, to answer
//! an unknown version with Version Negotiation and to gate new connections
//! on a well-formed Initial packet.

use crate::error::QuicError;
use crate::quic::table::MAX_CID_LEN;

/// QUIC version 1 (RFC 9000)
pub const QUIC_V1: u32 = 0x0000_0001;

/// QUIC version 2 (RFC 9369)
pub const QUIC_V2: u32 = 0x6b33_43cf;

/// Versions this server accepts
pub const SUPPORTED_VERSIONS: [u32; 2] = [QUIC_V1, QUIC_V2];

/// Smallest datagram allowed to carry a client Initial
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Smallest destination connection id a client may choose for an Initial
pub const MIN_INITIAL_DCID_LEN: usize = 8;

const LONG_HEADER: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// True for versions in [`SUPPORTED_VERSIONS`]
pub fn is_supported_version(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Long header packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    /// Initial
    Initial,
    /// 0-RTT
    ZeroRtt,
    /// Handshake
    Handshake,
    /// Retry
    Retry,
}

impl LongType {
    /// Decode the two type bits; version 2 rotates the code points
    pub fn from_bits(first: u8, version: u32) -> Self {
        let bits = (first >> 4) & 0x03;
        let bits = if version == QUIC_V2 {
            (bits + 3) & 0x03
        } else {
            bits
        };
        match bits {
            0 => Self::Initial,
            1 => Self::ZeroRtt,
            2 => Self::Handshake,
            _ => Self::Retry,
        }
    }
}

/// Invariant header fields of one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionCid<'a> {
    /// First byte
    pub first: u8,
    /// Version, `None` for short header packets
    pub version: Option<u32>,
    /// Destination connection id
    pub dcid: &'a [u8],
    /// Source connection id (empty for short headers)
    pub scid: &'a [u8],
}

impl VersionCid<'_> {
    /// True for long header packets
    pub fn is_long(&self) -> bool {
        self.version.is_some()
    }

    /// Long header packet with a version this server cannot speak
    pub fn needs_version_negotiation(&self) -> bool {
        matches!(self.version, Some(v) if v != 0 && !is_supported_version(v))
    }

    /// Long header type, `None` for short headers
    pub fn long_type(&self) -> Option<LongType> {
        self.version.map(|v| LongType::from_bits(self.first, v))
    }
}

/// Extract version and connection ids from `pkt`.
///
/// Short header packets carry no length for their destination id; the
/// server knows it because it chose it, so `short_dcid_len` is used.
pub fn decode_version_cid(pkt: &[u8], short_dcid_len: usize) -> Result<VersionCid<'_>, QuicError> {
    let first = *pkt.first().ok_or(QuicError::Truncated)?;

    if first & LONG_HEADER == 0 {
        let dcid = pkt.get(1..1 + short_dcid_len).ok_or(QuicError::Truncated)?;
        return Ok(VersionCid {
            first,
            version: None,
            dcid,
            scid: &[],
        });
    }

    let version_bytes = pkt.get(1..5).ok_or(QuicError::Truncated)?;
    let version = u32::from_be_bytes([
        version_bytes[0],
        version_bytes[1],
        version_bytes[2],
        version_bytes[3],
    ]);

    let mut pos = 5;
    let dcid_len = *pkt.get(pos).ok_or(QuicError::Truncated)? as usize;
    pos += 1;
    // Unknown versions may use longer ids; only the known ones are bounded.
    if is_supported_version(version) && dcid_len > MAX_CID_LEN {
        return Err(QuicError::CidTooLong(dcid_len));
    }
    let dcid = pkt.get(pos..pos + dcid_len).ok_or(QuicError::Truncated)?;
    pos += dcid_len;

    let scid_len = *pkt.get(pos).ok_or(QuicError::Truncated)? as usize;
    pos += 1;
    if is_supported_version(version) && scid_len > MAX_CID_LEN {
        return Err(QuicError::CidTooLong(scid_len));
    }
    let scid = pkt.get(pos..pos + scid_len).ok_or(QuicError::Truncated)?;

    Ok(VersionCid {
        first,
        version: Some(version),
        dcid,
        scid,
    })
}

/// Check that `pkt` may open a new connection.
///
/// The datagram must be a long header Initial of a supported version, with a
/// destination id of at least 8 bytes, padded to at least 1200 bytes.
pub fn accept_initial(pkt: &[u8], hdr: &VersionCid<'_>) -> Result<(), QuicError> {
    let version = hdr.version.ok_or(QuicError::NotLongHeader)?;
    if !is_supported_version(version) {
        return Err(QuicError::UnsupportedVersion(version));
    }
    if hdr.first & FIXED_BIT == 0 || hdr.long_type() != Some(LongType::Initial) {
        return Err(QuicError::NotInitial);
    }
    if hdr.dcid.len() < MIN_INITIAL_DCID_LEN {
        return Err(QuicError::ShortDcid(hdr.dcid.len()));
    }
    if pkt.len() < MIN_INITIAL_SIZE {
        return Err(QuicError::ShortDatagram(pkt.len()));
    }
    Ok(())
}

/// Write a Version Negotiation packet answering `hdr` into `out`.
///
/// The client's source id becomes the destination id and vice versa. The
/// unused bits of the first byte are random. Returns the packet length.
pub fn write_version_negotiation(out: &mut [u8], hdr: &VersionCid<'_>) -> Result<usize, QuicError> {
    let len = 1 + 4 + 1 + hdr.scid.len() + 1 + hdr.dcid.len() + 4 * SUPPORTED_VERSIONS.len();
    if out.len() < len {
        return Err(QuicError::NoSpace);
    }

    out[0] = LONG_HEADER | (rand::random::<u8>() & 0x7f);
    out[1..5].copy_from_slice(&0u32.to_be_bytes());
    let mut pos = 5;
    for cid in [hdr.scid, hdr.dcid] {
        out[pos] = cid.len() as u8;
        pos += 1;
        out[pos..pos + cid.len()].copy_from_slice(cid);
        pos += cid.len();
    }
    for version in SUPPORTED_VERSIONS {
        out[pos..pos + 4].copy_from_slice(&version.to_be_bytes());
        pos += 4;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial(version: u32, dcid: &[u8], scid: &[u8], size: usize) -> Vec<u8> {
        let type_bits = if version == QUIC_V2 { 0x10 } else { 0x00 };
        let mut pkt = vec![LONG_HEADER | FIXED_BIT | type_bits];
        pkt.extend_from_slice(&version.to_be_bytes());
        pkt.push(dcid.len() as u8);
        pkt.extend_from_slice(dcid);
        pkt.push(scid.len() as u8);
        pkt.extend_from_slice(scid);
        pkt.resize(size.max(pkt.len()), 0);
        pkt
    }

    #[test]
    fn test_decode_long_header() {
        let pkt = initial(QUIC_V1, &[1; 8], &[2; 4], 1200);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert!(hdr.is_long());
        assert_eq!(hdr.version, Some(QUIC_V1));
        assert_eq!(hdr.dcid, &[1; 8]);
        assert_eq!(hdr.scid, &[2; 4]);
        assert_eq!(hdr.long_type(), Some(LongType::Initial));
    }

    #[test]
    fn test_decode_short_header() {
        let mut pkt = vec![FIXED_BIT];
        pkt.extend_from_slice(&[9; 18]);
        pkt.extend_from_slice(&[0; 30]);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert!(!hdr.is_long());
        assert_eq!(hdr.dcid, &[9; 18]);
        assert!(hdr.scid.is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode_version_cid(&[], 18), Err(QuicError::Truncated));
        assert_eq!(decode_version_cid(&[0xc0, 0, 0], 18), Err(QuicError::Truncated));
        assert_eq!(decode_version_cid(&[0x40, 1, 2], 18), Err(QuicError::Truncated));

        let mut pkt = initial(QUIC_V1, &[1; 8], &[2; 4], 0);
        pkt.truncate(pkt.len() - 1);
        assert_eq!(decode_version_cid(&pkt, 18), Err(QuicError::Truncated));
    }

    #[test]
    fn test_decode_cid_too_long() {
        let pkt = initial(QUIC_V1, &[1; 21], &[], 1200);
        assert_eq!(decode_version_cid(&pkt, 18), Err(QuicError::CidTooLong(21)));

        // Unknown versions are not bound by the v1 limit.
        let pkt = initial(0x0a0a_0a0a, &[1; 21], &[], 1200);
        assert!(decode_version_cid(&pkt, 18).is_ok());
    }

    #[test]
    fn test_version_negotiation_needed() {
        let pkt = initial(0x0a0a_0a0a, &[1; 8], &[2; 8], 1200);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert!(hdr.needs_version_negotiation());

        let pkt = initial(QUIC_V1, &[1; 8], &[2; 8], 1200);
        assert!(!decode_version_cid(&pkt, 18).unwrap().needs_version_negotiation());

        // A Version Negotiation packet itself is never answered.
        let pkt = initial(0, &[1; 8], &[2; 8], 1200);
        assert!(!decode_version_cid(&pkt, 18).unwrap().needs_version_negotiation());
    }

    #[test]
    fn test_write_version_negotiation() {
        let pkt = initial(0x1a2a_3a4a, &[1; 8], &[2; 5], 1200);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        let mut out = [0u8; 128];
        let len = write_version_negotiation(&mut out, &hdr).unwrap();

        let vn = decode_version_cid(&out[..len], 18).unwrap();
        assert_eq!(vn.version, Some(0));
        assert_eq!(vn.dcid, &[2; 5]);
        assert_eq!(vn.scid, &[1; 8]);

        let versions = &out[len - 8..len];
        assert_eq!(&versions[..4], &QUIC_V1.to_be_bytes());
        assert_eq!(&versions[4..], &QUIC_V2.to_be_bytes());
    }

    #[test]
    fn test_write_version_negotiation_no_space() {
        let pkt = initial(0x1a2a_3a4a, &[1; 8], &[2; 5], 1200);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(write_version_negotiation(&mut out, &hdr), Err(QuicError::NoSpace));
    }

    #[test]
    fn test_accept_initial() {
        let pkt = initial(QUIC_V1, &[1; 8], &[2; 8], 1200);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert_eq!(accept_initial(&pkt, &hdr), Ok(()));

        let pkt = initial(QUIC_V2, &[1; 8], &[2; 8], 1300);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert_eq!(accept_initial(&pkt, &hdr), Ok(()));
    }

    #[test]
    fn test_accept_initial_gate() {
        let pkt = initial(QUIC_V1, &[1; 8], &[2; 8], 1199);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert_eq!(accept_initial(&pkt, &hdr), Err(QuicError::ShortDatagram(1199)));

        let pkt = initial(QUIC_V1, &[1; 7], &[2; 8], 1200);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert_eq!(accept_initial(&pkt, &hdr), Err(QuicError::ShortDcid(7)));

        let mut pkt = initial(QUIC_V1, &[1; 8], &[2; 8], 1200);
        pkt[0] |= 0x20; // Handshake
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert_eq!(accept_initial(&pkt, &hdr), Err(QuicError::NotInitial));

        let pkt = initial(0x0a0a_0a0a, &[1; 8], &[2; 8], 1200);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert_eq!(
            accept_initial(&pkt, &hdr),
            Err(QuicError::UnsupportedVersion(0x0a0a_0a0a))
        );

        let mut pkt = vec![FIXED_BIT];
        pkt.resize(1200, 0);
        let hdr = decode_version_cid(&pkt, 18).unwrap();
        assert_eq!(accept_initial(&pkt, &hdr), Err(QuicError::NotLongHeader));
    }

    #[test]
    fn test_long_type_v2_rotation() {
        assert_eq!(LongType::from_bits(0xd0, QUIC_V2), LongType::Initial);
        assert_eq!(LongType::from_bits(0xc0, QUIC_V2), LongType::Retry);
        assert_eq!(LongType::from_bits(0xc0, QUIC_V1), LongType::Initial);
        assert_eq!(LongType::from_bits(0xe0, QUIC_V1), LongType::Handshake);
    }
}
