use bytes::Bytes;

use crate::error::PacketResult;
use crate::packet::{EncodeOptions, Ipv4Header, UdpHeader, encode_ipv4_udp};

/// Build the packet written back into the tunnel for a relayed query.
///
/// Addresses and ports are swapped relative to the request, lengths are
/// recomputed from `resolver_payload`, and the payload is the resolver's
/// answer byte for byte.
pub fn build_reply(
    request_ip: &Ipv4Header,
    request_udp: &UdpHeader,
    resolver_payload: &[u8],
    opts: EncodeOptions,
) -> PacketResult<Bytes> {
    let ip = Ipv4Header::udp(request_ip.destination, request_ip.source);
    let udp = UdpHeader {
        source_port: request_udp.destination_port,
        destination_port: request_udp.source_port,
        length: 0,
        checksum: 0,
    };
    encode_ipv4_udp(&ip, &udp, resolver_payload, opts)
}
