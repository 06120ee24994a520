//! Ethernet/IP/UDP framing for the XDP path.
//!
//! Frames arriving on an XDP ring still carry their link, network and
//! transport headers. [`parse_frame`] locates the DNS payload and
//! [`write_headers`] builds the reply headers around a payload already
//! placed after them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use thiserror::Error;

/// Ethernet header length
pub const ETH_HDR_LEN: usize = 14;
/// IPv4 header length without options
pub const IPV4_HDR_LEN: usize = 20;
/// IPv6 fixed header length
pub const IPV6_HDR_LEN: usize = 40;
/// UDP header length
pub const UDP_HDR_LEN: usize = 8;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;

/// Frame parsing and building errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame ended inside a header
    #[error("Truncated frame")]
    Truncated,

    /// Not an IPv4 or IPv6 frame
    #[error("Unsupported ethertype {0:#06x}")]
    NotIp(u16),

    /// Not a UDP datagram
    #[error("Unsupported IP protocol {0}")]
    NotUdp(u8),

    /// IPv4 fragment
    #[error("Fragmented datagram")]
    Fragmented,

    /// Inconsistent length fields
    #[error("Inconsistent length fields")]
    BadLength,

    /// Source and destination of different address families
    #[error("Address family mismatch")]
    FamilyMismatch,

    /// Output buffer too small
    #[error("Frame buffer too small")]
    NoSpace,
}

/// Addressing and payload location of one UDP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMeta {
    /// Source MAC
    pub src_mac: [u8; 6],
    /// Destination MAC
    pub dst_mac: [u8; 6],
    /// Source address and port
    pub src: SocketAddr,
    /// Destination address and port
    pub dst: SocketAddr,
    /// Byte range of the UDP payload within the frame
    pub payload: Range<usize>,
}

impl FrameMeta {
    /// Header length of a reply to this frame
    pub fn reply_header_len(&self) -> usize {
        header_len(&self.dst)
    }
}

/// Header length of a UDP frame sent from `src`
pub fn header_len(src: &SocketAddr) -> usize {
    match src {
        SocketAddr::V4(_) => ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN,
        SocketAddr::V6(_) => ETH_HDR_LEN + IPV6_HDR_LEN + UDP_HDR_LEN,
    }
}

fn be16(buf: &[u8], at: usize) -> Result<u16, FrameError> {
    buf.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(FrameError::Truncated)
}

fn mac(buf: &[u8], at: usize) -> [u8; 6] {
    let mut out = [0u8; 6];
    out.copy_from_slice(&buf[at..at + 6]);
    out
}

/// Locate the UDP payload of an Ethernet frame
pub fn parse_frame(frame: &[u8]) -> Result<FrameMeta, FrameError> {
    if frame.len() < ETH_HDR_LEN {
        return Err(FrameError::Truncated);
    }
    let dst_mac = mac(frame, 0);
    let src_mac = mac(frame, 6);
    let ethertype = be16(frame, 12)?;

    let ip = ETH_HDR_LEN;
    let (src_ip, dst_ip, udp, ip_end) = match ethertype {
        ETHERTYPE_IPV4 => {
            let hdr = frame
                .get(ip..ip + IPV4_HDR_LEN)
                .ok_or(FrameError::Truncated)?;
            if hdr[0] >> 4 != 4 {
                return Err(FrameError::NotIp(ethertype));
            }
            let ihl = usize::from(hdr[0] & 0x0f) * 4;
            if ihl < IPV4_HDR_LEN {
                return Err(FrameError::BadLength);
            }
            let total = usize::from(be16(frame, ip + 2)?);
            if total < ihl || ip + total > frame.len() {
                return Err(FrameError::BadLength);
            }
            let frag = be16(frame, ip + 6)?;
            if frag & 0x3fff != 0 {
                return Err(FrameError::Fragmented);
            }
            if hdr[9] != IPPROTO_UDP {
                return Err(FrameError::NotUdp(hdr[9]));
            }
            let src = Ipv4Addr::new(hdr[12], hdr[13], hdr[14], hdr[15]);
            let dst = Ipv4Addr::new(hdr[16], hdr[17], hdr[18], hdr[19]);
            (IpAddr::V4(src), IpAddr::V4(dst), ip + ihl, ip + total)
        }
        ETHERTYPE_IPV6 => {
            let hdr = frame
                .get(ip..ip + IPV6_HDR_LEN)
                .ok_or(FrameError::Truncated)?;
            if hdr[0] >> 4 != 6 {
                return Err(FrameError::NotIp(ethertype));
            }
            let payload_len = usize::from(be16(frame, ip + 4)?);
            if ip + IPV6_HDR_LEN + payload_len > frame.len() {
                return Err(FrameError::BadLength);
            }
            if hdr[6] != IPPROTO_UDP {
                return Err(FrameError::NotUdp(hdr[6]));
            }
            let mut src = [0u8; 16];
            src.copy_from_slice(&hdr[8..24]);
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&hdr[24..40]);
            (
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                ip + IPV6_HDR_LEN,
                ip + IPV6_HDR_LEN + payload_len,
            )
        }
        other => return Err(FrameError::NotIp(other)),
    };

    if udp + UDP_HDR_LEN > ip_end {
        return Err(FrameError::Truncated);
    }
    let src_port = be16(frame, udp)?;
    let dst_port = be16(frame, udp + 2)?;
    let udp_len = usize::from(be16(frame, udp + 4)?);
    if udp_len < UDP_HDR_LEN || udp + udp_len > ip_end {
        return Err(FrameError::BadLength);
    }

    Ok(FrameMeta {
        src_mac,
        dst_mac,
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
        payload: udp + UDP_HDR_LEN..udp + udp_len,
    })
}

fn sum16(data: &[u8], mut acc: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        acc += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u32::from(*last) << 8;
    }
    acc
}

fn fold(mut acc: u32) -> u16 {
    while acc > 0xffff {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    !(acc as u16)
}

/// Internet checksum of `data`
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum16(data, 0))
}

fn udp_checksum(src: &IpAddr, dst: &IpAddr, udp: &[u8]) -> u16 {
    let mut acc = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => sum16(&d.octets(), sum16(&s.octets(), 0)),
        (IpAddr::V6(s), IpAddr::V6(d)) => sum16(&d.octets(), sum16(&s.octets(), 0)),
        _ => 0,
    };
    acc += u32::from(IPPROTO_UDP);
    acc += udp.len() as u32;
    match fold(sum16(udp, acc)) {
        0 => 0xffff,
        sum => sum,
    }
}

/// Write Ethernet, IP and UDP headers in front of a `payload_len` byte
/// payload already placed at `out[header_len(&src)..]`.
///
/// Returns the total frame length.
pub fn write_headers(
    out: &mut [u8],
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src: SocketAddr,
    dst: SocketAddr,
    payload_len: usize,
) -> Result<usize, FrameError> {
    let hdr_len = header_len(&src);
    let total = hdr_len + payload_len;
    if out.len() < total {
        return Err(FrameError::NoSpace);
    }
    let udp_len = UDP_HDR_LEN + payload_len;
    if udp_len > usize::from(u16::MAX) {
        return Err(FrameError::NoSpace);
    }

    out[0..6].copy_from_slice(&dst_mac);
    out[6..12].copy_from_slice(&src_mac);

    let udp = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
            let ip = &mut out[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN];
            ip[0] = 0x45;
            ip[1] = 0;
            ip[2..4].copy_from_slice(&((IPV4_HDR_LEN + udp_len) as u16).to_be_bytes());
            ip[4..6].copy_from_slice(&0u16.to_be_bytes());
            ip[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
            ip[8] = DEFAULT_TTL;
            ip[9] = IPPROTO_UDP;
            ip[10..12].copy_from_slice(&[0, 0]);
            ip[12..16].copy_from_slice(&s.octets());
            ip[16..20].copy_from_slice(&d.octets());
            let sum = checksum(ip);
            ip[10..12].copy_from_slice(&sum.to_be_bytes());
            ETH_HDR_LEN + IPV4_HDR_LEN
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            out[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
            let ip = &mut out[ETH_HDR_LEN..ETH_HDR_LEN + IPV6_HDR_LEN];
            ip[0..4].copy_from_slice(&[0x60, 0, 0, 0]);
            ip[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            ip[6] = IPPROTO_UDP;
            ip[7] = DEFAULT_TTL;
            ip[8..24].copy_from_slice(&s.octets());
            ip[24..40].copy_from_slice(&d.octets());
            ETH_HDR_LEN + IPV6_HDR_LEN
        }
        _ => return Err(FrameError::FamilyMismatch),
    };

    out[udp..udp + 2].copy_from_slice(&src.port().to_be_bytes());
    out[udp + 2..udp + 4].copy_from_slice(&dst.port().to_be_bytes());
    out[udp + 4..udp + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    out[udp + 6..udp + 8].copy_from_slice(&[0, 0]);
    let sum = udp_checksum(&src.ip(), &dst.ip(), &out[udp..udp + udp_len]);
    out[udp + 6..udp + 8].copy_from_slice(&sum.to_be_bytes());

    Ok(total)
}

/// Write reply headers for `meta`: MACs, addresses and ports swapped
pub fn write_reply(meta: &FrameMeta, out: &mut [u8], payload_len: usize) -> Result<usize, FrameError> {
    write_headers(out, meta.dst_mac, meta.src_mac, meta.dst, meta.src, payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    const SERVER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

    fn frame(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
        let src: SocketAddr = src.parse().unwrap();
        let dst: SocketAddr = dst.parse().unwrap();
        let hdr = header_len(&src);
        let mut out = vec![0u8; hdr + payload.len()];
        out[hdr..].copy_from_slice(payload);
        let len = write_headers(&mut out, CLIENT_MAC, SERVER_MAC, src, dst, payload.len()).unwrap();
        assert_eq!(len, out.len());
        out
    }

    #[test]
    fn test_parse_ipv4() {
        let f = frame("192.0.2.1:40000", "192.0.2.53:53", b"hello dns");
        let meta = parse_frame(&f).unwrap();
        assert_eq!(meta.src, "192.0.2.1:40000".parse().unwrap());
        assert_eq!(meta.dst, "192.0.2.53:53".parse().unwrap());
        assert_eq!(meta.src_mac, CLIENT_MAC);
        assert_eq!(meta.dst_mac, SERVER_MAC);
        assert_eq!(&f[meta.payload.clone()], b"hello dns");
        assert_eq!(checksum(&f[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN]), 0);
    }

    #[test]
    fn test_parse_ipv6() {
        let f = frame("[2001:db8::1]:40000", "[2001:db8::53]:53", b"payload");
        let meta = parse_frame(&f).unwrap();
        assert_eq!(meta.src, "[2001:db8::1]:40000".parse().unwrap());
        assert_eq!(meta.dst, "[2001:db8::53]:53".parse().unwrap());
        assert_eq!(&f[meta.payload], b"payload");
    }

    #[test]
    fn test_udp_checksum_verifies() {
        let f = frame("192.0.2.1:40000", "192.0.2.53:53", b"odd");
        let udp = ETH_HDR_LEN + IPV4_HDR_LEN;
        let mut acc = sum16(&[192, 0, 2, 1, 192, 0, 2, 53], 0);
        acc += u32::from(IPPROTO_UDP) + (f.len() - udp) as u32;
        assert_eq!(fold(sum16(&f[udp..], acc)), 0);
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let f = frame("192.0.2.1:40000", "192.0.2.53:53", b"query");
        let meta = parse_frame(&f).unwrap();

        let mut out = vec![0u8; 256];
        let hdr = meta.reply_header_len();
        out[hdr..hdr + 6].copy_from_slice(b"answer");
        let len = write_reply(&meta, &mut out, 6).unwrap();

        let reply = parse_frame(&out[..len]).unwrap();
        assert_eq!(reply.src, meta.dst);
        assert_eq!(reply.dst, meta.src);
        assert_eq!(reply.src_mac, SERVER_MAC);
        assert_eq!(reply.dst_mac, CLIENT_MAC);
        assert_eq!(&out[reply.payload], b"answer");
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(parse_frame(&[0u8; 10]), Err(FrameError::Truncated));

        let mut f = frame("192.0.2.1:40000", "192.0.2.53:53", b"x");
        f[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(parse_frame(&f), Err(FrameError::NotIp(0x0806)));

        let mut f = frame("192.0.2.1:40000", "192.0.2.53:53", b"x");
        f[ETH_HDR_LEN + 9] = 6;
        assert_eq!(parse_frame(&f), Err(FrameError::NotUdp(6)));

        let mut f = frame("192.0.2.1:40000", "192.0.2.53:53", b"x");
        f[ETH_HDR_LEN + 6] |= 0x20;
        assert_eq!(parse_frame(&f), Err(FrameError::Fragmented));

        let mut f = frame("192.0.2.1:40000", "192.0.2.53:53", b"xyz");
        let udp = ETH_HDR_LEN + IPV4_HDR_LEN;
        f[udp + 4..udp + 6].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(parse_frame(&f), Err(FrameError::BadLength));
    }

    #[test]
    fn test_write_headers_errors() {
        let mut small = [0u8; 20];
        let v4: SocketAddr = "192.0.2.1:1".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:1".parse().unwrap();
        assert_eq!(
            write_headers(&mut small, CLIENT_MAC, SERVER_MAC, v4, v4, 0),
            Err(FrameError::NoSpace)
        );
        let mut buf = [0u8; 128];
        assert_eq!(
            write_headers(&mut buf, CLIENT_MAC, SERVER_MAC, v4, v6, 0),
            Err(FrameError::FamilyMismatch)
        );
    }
}
