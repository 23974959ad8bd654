use std::fmt;
use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::RelaySettings;
use crate::dns::{self, DomainRecord};
use crate::error::{PacketError, SessionError};
use crate::packet::{DecodedPacket, EncodeOptions, Ipv4Header, UdpHeader, decode_ipv4_udp};
use crate::relay::Relay;
use crate::reply::build_reply;

/// A tunnel packet that passed the DNS filter.
#[derive(Debug, Clone, Copy)]
pub struct DnsQuery<'a> {
    pub ip: Ipv4Header,
    pub udp: UdpHeader,
    pub payload: &'a [u8],
}

impl DnsQuery<'_> {
    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.source, self.udp.source_port)
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.destination, self.udp.destination_port)
    }
}

impl fmt::Display for DnsQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}

#[derive(Debug)]
pub enum Classified<'a> {
    Query(DnsQuery<'a>),
    /// Decoded fine but not UDP to the DNS port. Routine filtering.
    Ignored(DecodedPacket),
    Malformed(PacketError),
}

#[derive(Debug)]
pub enum Exchange {
    Reply {
        packet: Bytes,
        records: Vec<DomainRecord>,
    },
    /// Upstream answered but the reply could not be synthesized.
    Dropped(PacketError),
}

/// Per-packet pipeline: decode, filter, relay, inspect, synthesize.
pub struct Engine<R> {
    relay: R,
    dns_port: u16,
    encode: EncodeOptions,
}

impl<R: Relay> Engine<R> {
    pub fn new(relay: R, settings: &RelaySettings) -> Self {
        Self {
            relay,
            dns_port: settings.dns_port,
            encode: settings.encode_options(),
        }
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn max_packet_size(&self) -> usize {
        self.encode.max_packet_size
    }

    #[inline]
    pub fn classify<'a>(&self, raw: &'a [u8]) -> Classified<'a> {
        let pkt = match decode_ipv4_udp(raw) {
            Ok(pkt) => pkt,
            Err(err) => return Classified::Malformed(err),
        };
        match pkt.udp {
            Some(udp) if pkt.is_dns_query(self.dns_port) => Classified::Query(DnsQuery {
                ip: pkt.ip,
                udp,
                payload: pkt.payload(raw),
            }),
            _ => Classified::Ignored(pkt),
        }
    }

    /// Relay one query and build the tunnel reply. An upstream I/O error ends
    /// the session; everything after the upstream answered is per-packet.
    pub async fn exchange(&self, query: &DnsQuery<'_>) -> Result<Exchange, SessionError> {
        if let Ok(msg) = dns::parse(query.payload) {
            debug!(
                event = "dns_query",
                query = %query,
                id = msg.id(),
                qname = msg.qname().unwrap_or("-"),
                qtype = ?msg.question.as_ref().map(|q| q.record_type()),
                "relaying dns query"
            );
        }

        let answer = self
            .relay
            .forward(query.payload)
            .await
            .map_err(SessionError::RelayFailure)?;

        let records = match dns::parse(&answer) {
            Ok(msg) => {
                let records = msg.domain_records();
                debug!(
                    event = "dns_answer",
                    id = msg.id(),
                    rcode = ?msg.header.flags.response_code(),
                    answers = msg.answers.len(),
                    resolved = records.len(),
                    "upstream answered"
                );
                records
            }
            Err(err) => {
                trace!(error = %err, len = answer.len(), "upstream answer not inspectable");
                Vec::new()
            }
        };

        match build_reply(&query.ip, &query.udp, &answer, self.encode) {
            Ok(packet) => Ok(Exchange::Reply { packet, records }),
            Err(err) => Ok(Exchange::Dropped(err)),
        }
    }
}
