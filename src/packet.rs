use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PacketError, PacketResult};

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// Combined fixed IPv4 (no options) + UDP header length.
pub const HEADER_LEN: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Interface MTU class; the tunnel hands the MTU over as a signed 16-bit value.
pub const MAX_PACKET_SIZE: usize = i16::MAX as usize;

const VERSION_IHL: u8 = 0x45;
const DEFAULT_TTL: u8 = 64;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub dscp_ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Fresh header for a locally originated UDP datagram. Length and checksum
    /// are filled in by the encoder.
    pub fn udp(source: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self {
            dscp_ecn: 0,
            total_length: 0,
            identification: 0,
            flags_fragment: FLAG_DONT_FRAGMENT,
            ttl: DEFAULT_TTL,
            protocol: IPPROTO_UDP,
            checksum: 0,
            source,
            destination,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

/// Result of decoding one raw packet. `payload` indexes into the buffer that
/// was decoded; nothing is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub ip: Ipv4Header,
    /// Present only when the IPv4 protocol is UDP.
    pub udp: Option<UdpHeader>,
    pub payload: Range<usize>,
}

impl DecodedPacket {
    pub fn payload_offset(&self) -> usize {
        self.payload.start
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.payload.clone()]
    }

    /// UDP datagram addressed to the DNS port. Everything else is routine
    /// filtering, not an error.
    pub fn is_dns_query(&self, dns_port: u16) -> bool {
        self.ip.protocol == IPPROTO_UDP
            && self
                .udp
                .is_some_and(|udp| udp.destination_port == dns_port)
    }

    pub fn source(&self) -> Option<SocketAddrV4> {
        self.udp
            .map(|udp| SocketAddrV4::new(self.ip.source, udp.source_port))
    }

    pub fn destination(&self) -> Option<SocketAddrV4> {
        self.udp
            .map(|udp| SocketAddrV4::new(self.ip.destination, udp.destination_port))
    }
}

impl fmt::Display for DecodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.source(), self.destination()) {
            (Some(src), Some(dst)) => write!(
                f,
                "{} {} -> {} len={}",
                protocol_name(self.ip.protocol),
                src,
                dst,
                self.ip.total_length
            ),
            _ => write!(
                f,
                "{} {} -> {} len={}",
                protocol_name(self.ip.protocol),
                self.ip.source,
                self.ip.destination,
                self.ip.total_length
            ),
        }
    }
}

pub fn protocol_name(protocol: u8) -> String {
    match protocol {
        IPPROTO_TCP => "TCP".to_string(),
        IPPROTO_UDP => "UDP".to_string(),
        other => other.to_string(),
    }
}

#[inline]
fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn ipv4_at(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

/// Decode the fixed IPv4 header and, for UDP, the UDP header that follows it.
///
/// `buf` must be exactly the bytes returned by one tunnel read. Bytes past the
/// IPv4 total length are ignored. Header options are not supported and fail
/// closed.
pub fn decode_ipv4_udp(buf: &[u8]) -> PacketResult<DecodedPacket> {
    if buf.len() < HEADER_LEN {
        return Err(PacketError::MalformedHeader(
            "shorter than ipv4 + udp headers",
        ));
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::MalformedHeader("not an ipv4 packet"));
    }
    let header_len = (buf[0] & 0x0F) as usize * 4;
    if header_len != IPV4_HEADER_LEN {
        return Err(PacketError::MalformedHeader("ipv4 options are not supported"));
    }

    let ip = Ipv4Header {
        dscp_ecn: buf[1],
        total_length: be16(buf, 2),
        identification: be16(buf, 4),
        flags_fragment: be16(buf, 6),
        ttl: buf[8],
        protocol: buf[9],
        checksum: be16(buf, 10),
        source: ipv4_at(buf, 12),
        destination: ipv4_at(buf, 16),
    };

    let total = ip.total_length as usize;
    if total < IPV4_HEADER_LEN || total > buf.len() {
        return Err(PacketError::MalformedHeader(
            "ipv4 total length disagrees with packet",
        ));
    }

    if ip.protocol != IPPROTO_UDP {
        return Ok(DecodedPacket {
            ip,
            udp: None,
            payload: IPV4_HEADER_LEN..total,
        });
    }

    if total < HEADER_LEN {
        return Err(PacketError::MalformedHeader("udp header truncated"));
    }

    let udp = UdpHeader {
        source_port: be16(buf, 20),
        destination_port: be16(buf, 22),
        length: be16(buf, 24),
        checksum: be16(buf, 26),
    };

    let udp_len = udp.length as usize;
    if udp_len < UDP_HEADER_LEN || IPV4_HEADER_LEN + udp_len > total {
        return Err(PacketError::MalformedHeader(
            "udp length disagrees with packet",
        ));
    }

    Ok(DecodedPacket {
        ip,
        udp: Some(udp),
        payload: HEADER_LEN..IPV4_HEADER_LEN + udp_len,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub max_packet_size: usize,
    /// When false both checksum fields are written as zero.
    pub compute_checksums: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            compute_checksums: false,
        }
    }
}

/// Encode a 20-byte IPv4 header, an 8-byte UDP header and the payload.
///
/// Length fields are always recomputed from `payload`; the lengths and
/// checksums carried in `ip`/`udp` are ignored. The protocol is always UDP.
pub fn encode_ipv4_udp(
    ip: &Ipv4Header,
    udp: &UdpHeader,
    payload: &[u8],
    opts: EncodeOptions,
) -> PacketResult<Bytes> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total = IPV4_HEADER_LEN + udp_len;
    let limit = opts.max_packet_size.min(MAX_PACKET_SIZE);
    if total > limit {
        return Err(PacketError::PacketTooLarge { size: total, limit });
    }

    let mut out = BytesMut::with_capacity(total);
    out.put_u8(VERSION_IHL);
    out.put_u8(ip.dscp_ecn);
    out.put_u16(total as u16);
    out.put_u16(ip.identification);
    out.put_u16(ip.flags_fragment);
    out.put_u8(ip.ttl);
    out.put_u8(IPPROTO_UDP);
    out.put_u16(0);
    out.put_slice(&ip.source.octets());
    out.put_slice(&ip.destination.octets());

    out.put_u16(udp.source_port);
    out.put_u16(udp.destination_port);
    out.put_u16(udp_len as u16);
    out.put_u16(0);
    out.put_slice(payload);

    if opts.compute_checksums {
        let ip_sum = ipv4_header_checksum(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&ip_sum.to_be_bytes());
        let udp_sum = udp_checksum(ip.source, ip.destination, &out[IPV4_HEADER_LEN..]);
        out[26..28].copy_from_slice(&udp_sum.to_be_bytes());
    }

    Ok(out.freeze())
}

fn ones_complement_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// RFC 1071 checksum over a header whose checksum field is zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    !fold(ones_complement_add(0, header))
}

/// UDP checksum over the IPv4 pseudo-header and `segment` (UDP header with a
/// zero checksum field, followed by the payload).
pub fn udp_checksum(source: Ipv4Addr, destination: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = ones_complement_add(0, &source.octets());
    sum = ones_complement_add(sum, &destination.octets());
    sum = sum.wrapping_add(u32::from(IPPROTO_UDP));
    sum = sum.wrapping_add(segment.len() as u32);
    sum = ones_complement_add(sum, segment);
    match !fold(sum) {
        // zero means "no checksum" on the wire
        0 => 0xFFFF,
        v => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_bytes(payload: &[u8]) -> Vec<u8> {
        let total = (HEADER_LEN + payload.len()) as u16;
        let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
        let mut buf = vec![
            0x45, 0x00, 0, 0, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 10, 215, 173, 1, 10,
            215, 173, 2, 0xd4, 0x31, 0x00, 0x35, 0, 0, 0x00, 0x00,
        ];
        buf[2..4].copy_from_slice(&total.to_be_bytes());
        buf[24..26].copy_from_slice(&udp_len.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn decode_reads_every_header_field() {
        let buf = query_bytes(&[0xAB; 12]);
        let pkt = decode_ipv4_udp(&buf).expect("decode");

        assert_eq!(pkt.ip.total_length, 40);
        assert_eq!(pkt.ip.identification, 0x1c46);
        assert_eq!(pkt.ip.flags_fragment, 0x4000);
        assert_eq!(pkt.ip.ttl, 64);
        assert_eq!(pkt.ip.protocol, IPPROTO_UDP);
        assert_eq!(pkt.ip.source, Ipv4Addr::new(10, 215, 173, 1));
        assert_eq!(pkt.ip.destination, Ipv4Addr::new(10, 215, 173, 2));

        let udp = pkt.udp.expect("udp header");
        assert_eq!(udp.source_port, 0xd431);
        assert_eq!(udp.destination_port, 53);
        assert_eq!(udp.length, 20);
        assert_eq!(pkt.payload_offset(), 28);
        assert_eq!(pkt.payload_len(), 12);
        assert_eq!(pkt.payload(&buf), &[0xAB; 12]);
        assert!(pkt.is_dns_query(53));
    }

    #[test]
    fn decode_then_encode_reproduces_headers() {
        let addrs = [
            (Ipv4Addr::new(10, 215, 173, 1), Ipv4Addr::new(10, 215, 173, 2)),
            (Ipv4Addr::new(192, 168, 1, 254), Ipv4Addr::new(8, 8, 8, 8)),
            (Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST),
        ];
        let fields: [(u8, u16, u16, u8); 4] = [
            (0x00, 0x0000, 0x0000, 1),
            (0xb8, 0x1c46, 0x4000, 64),
            (0x03, 0xffff, 0x2001, 128),
            (0xff, 0x8000, 0x1fff, 255),
        ];
        let ports = [(1u16, 53u16), (0xd431, 53), (53, 65535), (65535, 5353)];
        let payloads: [&[u8]; 4] = [b"", b"x", b"hello resolver", &[0x5a; 513]];

        for (i, &(dscp_ecn, identification, flags_fragment, ttl)) in fields.iter().enumerate() {
            for &(source, destination) in &addrs {
                for &(source_port, destination_port) in &ports {
                    let payload = payloads[(i + usize::from(source_port)) % payloads.len()];
                    let total = HEADER_LEN + payload.len();
                    let mut buf = Vec::with_capacity(total);
                    buf.push(0x45);
                    buf.push(dscp_ecn);
                    buf.extend_from_slice(&(total as u16).to_be_bytes());
                    buf.extend_from_slice(&identification.to_be_bytes());
                    buf.extend_from_slice(&flags_fragment.to_be_bytes());
                    buf.push(ttl);
                    buf.push(IPPROTO_UDP);
                    buf.extend_from_slice(&[0, 0]);
                    buf.extend_from_slice(&source.octets());
                    buf.extend_from_slice(&destination.octets());
                    buf.extend_from_slice(&source_port.to_be_bytes());
                    buf.extend_from_slice(&destination_port.to_be_bytes());
                    buf.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
                    buf.extend_from_slice(&[0, 0]);
                    buf.extend_from_slice(payload);

                    let pkt = decode_ipv4_udp(&buf).expect("decode");
                    let udp = pkt.udp.expect("udp");
                    assert_eq!(pkt.payload(&buf), payload);

                    let out = encode_ipv4_udp(&pkt.ip, &udp, pkt.payload(&buf), EncodeOptions::default())
                        .expect("encode");
                    assert_eq!(&out[..], &buf[..], "{pkt}");
                }
            }
        }
    }

    #[test]
    fn every_truncated_prefix_is_rejected() {
        let buf = query_bytes(&[0u8; 12]);
        for len in 0..buf.len() {
            let err = decode_ipv4_udp(&buf[..len]).expect_err("prefix must not decode");
            assert!(matches!(err, PacketError::MalformedHeader(_)), "len {len}: {err}");
        }
    }

    #[test]
    fn trailing_garbage_past_total_length_is_ignored() {
        let mut buf = query_bytes(&[1, 2, 3, 4]);
        buf.extend_from_slice(&[0xEE; 64]);
        let pkt = decode_ipv4_udp(&buf).expect("decode");
        assert_eq!(pkt.payload(&buf), &[1, 2, 3, 4]);
    }

    #[test]
    fn options_and_other_versions_fail_closed() {
        let mut with_options = query_bytes(&[0u8; 8]);
        with_options[0] = 0x46;
        assert_eq!(
            decode_ipv4_udp(&with_options),
            Err(PacketError::MalformedHeader("ipv4 options are not supported"))
        );

        let mut v6 = query_bytes(&[0u8; 8]);
        v6[0] = 0x60;
        assert!(decode_ipv4_udp(&v6).is_err());
    }

    #[test]
    fn udp_length_larger_than_packet_is_rejected() {
        let mut buf = query_bytes(&[0u8; 4]);
        buf[24..26].copy_from_slice(&64u16.to_be_bytes());
        assert!(matches!(
            decode_ipv4_udp(&buf),
            Err(PacketError::MalformedHeader(_))
        ));
    }

    #[test]
    fn tcp_is_recognized_but_not_a_dns_query() {
        let mut buf = query_bytes(&[0u8; 12]);
        buf[9] = IPPROTO_TCP;
        let pkt = decode_ipv4_udp(&buf).expect("decode");
        assert!(pkt.udp.is_none());
        assert!(!pkt.is_dns_query(53));
        assert_eq!(pkt.payload_offset(), IPV4_HEADER_LEN);
        assert!(pkt.to_string().starts_with("TCP "));
    }

    #[test]
    fn udp_to_other_port_is_not_a_dns_query() {
        let mut buf = query_bytes(&[0u8; 12]);
        buf[22..24].copy_from_slice(&123u16.to_be_bytes());
        let pkt = decode_ipv4_udp(&buf).expect("decode");
        assert!(!pkt.is_dns_query(53));
    }

    #[test]
    fn encode_rejects_oversized_packets() {
        let ip = Ipv4Header::udp(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        let udp = UdpHeader {
            source_port: 53,
            destination_port: 4000,
            length: 0,
            checksum: 0,
        };
        let opts = EncodeOptions {
            max_packet_size: 512,
            compute_checksums: false,
        };
        let err = encode_ipv4_udp(&ip, &udp, &[0u8; 485], opts).expect_err("too large");
        assert_eq!(err, PacketError::PacketTooLarge { size: 513, limit: 512 });
        assert!(encode_ipv4_udp(&ip, &udp, &[0u8; 484], opts).is_ok());

        let huge = vec![0u8; MAX_PACKET_SIZE];
        assert!(matches!(
            encode_ipv4_udp(&ip, &udp, &huge, EncodeOptions::default()),
            Err(PacketError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn checksums_stay_zero_unless_requested() {
        let ip = Ipv4Header::udp(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1));
        let udp = UdpHeader {
            source_port: 53,
            destination_port: 40000,
            length: 0,
            checksum: 0,
        };
        let out = encode_ipv4_udp(&ip, &udp, b"abc", EncodeOptions::default()).expect("encode");
        assert_eq!(&out[10..12], &[0, 0]);
        assert_eq!(&out[26..28], &[0, 0]);
    }

    #[test]
    fn ipv4_checksum_matches_reference_header() {
        // 4500 0073 0000 4000 4011 b861 c0a8 0001 c0a8 00c7
        let ip = Ipv4Header {
            dscp_ecn: 0,
            total_length: 0,
            identification: 0,
            flags_fragment: 0x4000,
            ttl: 0x40,
            protocol: IPPROTO_UDP,
            checksum: 0,
            source: Ipv4Addr::new(192, 168, 0, 1),
            destination: Ipv4Addr::new(192, 168, 0, 199),
        };
        let udp = UdpHeader {
            source_port: 1,
            destination_port: 2,
            length: 0,
            checksum: 0,
        };
        let opts = EncodeOptions {
            compute_checksums: true,
            ..Default::default()
        };
        let out = encode_ipv4_udp(&ip, &udp, &[0u8; 0x73 - HEADER_LEN], opts).expect("encode");
        assert_eq!(&out[2..4], &[0x00, 0x73]);
        assert_eq!(&out[10..12], &[0xb8, 0x61]);
    }

    #[test]
    fn computed_udp_checksum_verifies() {
        let src = Ipv4Addr::new(10, 215, 173, 2);
        let dst = Ipv4Addr::new(10, 215, 173, 1);
        let ip = Ipv4Header::udp(src, dst);
        let udp = UdpHeader {
            source_port: 53,
            destination_port: 54321,
            length: 0,
            checksum: 0,
        };
        let opts = EncodeOptions {
            compute_checksums: true,
            ..Default::default()
        };
        let out = encode_ipv4_udp(&ip, &udp, b"odd-length", opts).expect("encode");

        assert_eq!(fold(ones_complement_add(0, &out[..IPV4_HEADER_LEN])), 0xFFFF);

        let segment = &out[IPV4_HEADER_LEN..];
        let mut sum = ones_complement_add(0, &src.octets());
        sum = ones_complement_add(sum, &dst.octets());
        sum = sum.wrapping_add(u32::from(IPPROTO_UDP));
        sum = sum.wrapping_add(segment.len() as u32);
        sum = ones_complement_add(sum, segment);
        assert_eq!(fold(sum), 0xFFFF);
    }
}
