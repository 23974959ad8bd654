use std::collections::HashMap;
use std::net::Ipv4Addr;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

use crate::error::{DnsError, DnsResult};

const TYPE_A: u16 = 1;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DnsFlags {
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
}

impl DnsFlags {
    // Flags: QR(1) Opcode(4) AA(1) TC(1) RD(1) | RA(1) Z(3) RCODE(4)
    fn from_bytes(hi: u8, lo: u8) -> Self {
        Self {
            qr: hi & 0x80 != 0,
            opcode: (hi >> 3) & 0x0F,
            aa: hi & 0x04 != 0,
            tc: hi & 0x02 != 0,
            rd: hi & 0x01 != 0,
            ra: lo & 0x80 != 0,
            z: (lo >> 4) & 0x07,
            rcode: lo & 0x0F,
        }
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::from(0, self.rcode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: DnsFlags,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn record_type(&self) -> RecordType {
        RecordType::from(self.qtype)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    /// Anything that is not a 4-octet A record, kept uninterpreted.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdlength: u16,
    pub rdata: RecordData,
}

impl DnsResourceRecord {
    pub fn record_type(&self) -> RecordType {
        RecordType::from(self.rtype)
    }
}

/// A resolved address and the name that resolved to it. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainRecord {
    pub address: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    /// First question; additional questions are walked over but not kept.
    pub question: Option<DnsQuestion>,
    pub answers: Vec<DnsResourceRecord>,
}

impl DnsMessage {
    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn qname(&self) -> Option<&str> {
        self.question.as_ref().map(|q| q.name.as_str())
    }

    pub fn domain_records(&self) -> Vec<DomainRecord> {
        self.answers
            .iter()
            .filter_map(|rr| match rr.rdata {
                RecordData::A(addr) => Some(DomainRecord {
                    address: addr.to_string(),
                    domain: rr.name.clone(),
                }),
                RecordData::Raw(_) => None,
            })
            .collect()
    }

    /// Dotted-decimal address -> domain, built from the A answers.
    pub fn address_map(&self) -> HashMap<String, String> {
        self.domain_records()
            .into_iter()
            .map(|r| (r.address, r.domain))
            .collect()
    }
}

/// Cursor over an immutable message buffer. Every read is bounds-checked.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> DnsResult<&'a [u8]> {
        let bytes = slice_at(self.buf, self.pos, n)?;
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> DnsResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> DnsResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> DnsResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> DnsResult<String> {
        let (name, next) = read_name(self.buf, self.pos)?;
        self.pos = next;
        Ok(name)
    }
}

fn slice_at(buf: &[u8], offset: usize, n: usize) -> DnsResult<&[u8]> {
    offset
        .checked_add(n)
        .and_then(|end| buf.get(offset..end))
        .ok_or(DnsError::TruncatedMessage {
            offset,
            needed: n,
            len: buf.len(),
        })
}

/// Decode the name starting at `start`. Returns the dotted name and the offset
/// just past the name's in-place encoding (after the first pointer, if any).
///
/// A pointer must target an offset strictly before itself, so every chain
/// terminates.
pub fn read_name(buf: &[u8], start: usize) -> DnsResult<(String, usize)> {
    let mut name = String::new();
    let mut cursor = start;
    let mut resume_at: Option<usize> = None;
    let mut wire_len = 0usize;

    loop {
        let len = slice_at(buf, cursor, 1)?[0];
        match len & 0xC0 {
            0x00 if len == 0 => {
                cursor += 1;
                break;
            }
            0x00 => {
                let label = slice_at(buf, cursor + 1, len as usize)?;
                wire_len += 1 + label.len();
                if wire_len + 1 > MAX_NAME_LEN {
                    return Err(DnsError::NameTooLong);
                }
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
                cursor += 1 + label.len();
            }
            0xC0 => {
                let ptr = slice_at(buf, cursor, 2)?;
                let target = (usize::from(ptr[0] & 0x3F) << 8) | usize::from(ptr[1]);
                if target >= cursor {
                    return Err(DnsError::PointerLoop(cursor));
                }
                resume_at.get_or_insert(cursor + 2);
                cursor = target;
            }
            _ => return Err(DnsError::BadLabel(len)),
        }
    }

    if name.is_empty() {
        name.push('.');
    }
    Ok((name, resume_at.unwrap_or(cursor)))
}

/// Parse header, the question section and the answer section of a DNS
/// message. Authority and additional sections are left unread.
pub fn parse(payload: &[u8]) -> DnsResult<DnsMessage> {
    let mut r = Reader::new(payload);

    let id = r.u16()?;
    let hi = r.u8()?;
    let lo = r.u8()?;
    let header = DnsHeader {
        id,
        flags: DnsFlags::from_bytes(hi, lo),
        qd_count: r.u16()?,
        an_count: r.u16()?,
        ns_count: r.u16()?,
        ar_count: r.u16()?,
    };

    let mut question = None;
    for _ in 0..header.qd_count {
        let q = DnsQuestion {
            name: r.name()?,
            qtype: r.u16()?,
            qclass: r.u16()?,
        };
        question.get_or_insert(q);
    }

    let mut answers = Vec::new();
    for _ in 0..header.an_count {
        let name = r.name()?;
        let rtype = r.u16()?;
        let class = r.u16()?;
        let ttl = r.u32()?;
        let rdlength = r.u16()?;
        let raw = r.take(rdlength as usize)?;
        let rdata = match (rtype, raw) {
            (TYPE_A, &[a, b, c, d]) => RecordData::A(Ipv4Addr::new(a, b, c, d)),
            _ => RecordData::Raw(raw.to_vec()),
        };
        answers.push(DnsResourceRecord {
            name,
            rtype,
            class,
            ttl,
            rdlength,
            rdata,
        });
    }

    Ok(DnsMessage {
        header,
        question,
        answers,
    })
}
