//! Standard DNS message codec
//!
//! Covers the subset needed to answer A queries: the 12-byte header, the
//! question section and resource records. Names decode through compression
//! pointers; encoded answers for the first question use the `0xC00C` pointer.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use crate::{DnsError, Result};

pub const HEADER_LEN: usize = 12;
pub const TYPE_A: u16 = 1;
pub const TYPE_ANY: u16 = 255;
pub const CLASS_IN: u16 = 1;

pub const FLAG_QR: u16 = 0x8000;
pub const FLAG_AA: u16 = 0x0400;
pub const FLAG_RD: u16 = 0x0100;
pub const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

/// Top bit of the question class in mDNS asks for a unicast reply
pub const CLASS_UNICAST_RESPONSE: u16 = 0x8000;

/// Pointer to the first question name, right after the header
const QUESTION_NAME_POINTER: u16 = 0xC000 | HEADER_LEN as u16;
const MAX_POINTER_JUMPS: usize = 16;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    /// Class without the mDNS unicast-response bit
    pub fn class(&self) -> u16 {
        self.qclass & !CLASS_UNICAST_RESPONSE
    }

    pub fn wants_unicast(&self) -> bool {
        self.qclass & CLASS_UNICAST_RESPONSE != 0
    }

    pub fn asks_for_a(&self) -> bool {
        self.qtype == TYPE_A || self.qtype == TYPE_ANY
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub data: Vec<u8>,
}

impl ResourceRecord {
    pub fn a(name: impl Into<String>, ip: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.into(),
            rtype: TYPE_A,
            rclass: CLASS_IN,
            ttl,
            data: ip.octets().to_vec(),
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.data.as_slice().try_into().ok()?;
        (self.rtype == TYPE_A).then(|| Ipv4Addr::from(octets))
    }
}

/// A decoded DNS message. Authority and additional sections are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsMessage {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
}

impl DnsMessage {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(DnsError::Malformed(format!(
                "{} bytes is shorter than the header",
                buf.len()
            )));
        }
        let header = Header {
            id: read_u16(buf, 0)?,
            flags: read_u16(buf, 2)?,
            qdcount: read_u16(buf, 4)?,
            ancount: read_u16(buf, 6)?,
            nscount: read_u16(buf, 8)?,
            arcount: read_u16(buf, 10)?,
        };

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(header.qdcount.min(16) as usize);
        for _ in 0..header.qdcount {
            let (name, next) = read_name(buf, pos)?;
            questions.push(Question {
                name,
                qtype: read_u16(buf, next)?,
                qclass: read_u16(buf, next + 2)?,
            });
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(header.ancount.min(16) as usize);
        for _ in 0..header.ancount {
            let (name, next) = read_name(buf, pos)?;
            let rtype = read_u16(buf, next)?;
            let rclass = read_u16(buf, next + 2)?;
            let ttl = (read_u16(buf, next + 4)? as u32) << 16 | read_u16(buf, next + 6)? as u32;
            let len = read_u16(buf, next + 8)? as usize;
            let start = next + 10;
            let data = buf
                .get(start..start + len)
                .ok_or_else(|| DnsError::Malformed("record data truncated".to_string()))?
                .to_vec();
            answers.push(ResourceRecord { name, rtype, rclass, ttl, data });
            pos = start + len;
        }

        Ok(Self { header, questions, answers })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_u16(self.header.id);
        buf.put_u16(self.header.flags);
        buf.put_u16(self.questions.len() as u16);
        buf.put_u16(self.answers.len() as u16);
        buf.put_u16(0);
        buf.put_u16(0);

        for q in &self.questions {
            write_name(&mut buf, &q.name)?;
            buf.put_u16(q.qtype);
            buf.put_u16(q.qclass);
        }

        let first_question = self.questions.first().map(|q| q.name.as_str());
        for rr in &self.answers {
            if Some(rr.name.as_str()) == first_question {
                buf.put_u16(QUESTION_NAME_POINTER);
            } else {
                write_name(&mut buf, &rr.name)?;
            }
            buf.put_u16(rr.rtype);
            buf.put_u16(rr.rclass);
            buf.put_u32(rr.ttl);
            buf.put_u16(rr.data.len() as u16);
            buf.put_slice(&rr.data);
        }
        Ok(buf.to_vec())
    }

    /// Name asked about in the first question
    pub fn question_name(&self) -> Option<&str> {
        self.questions.first().map(|q| q.name.as_str())
    }

    /// Authoritative reply to `query`. A-type questions get `ip`; anything
    /// else gets an empty answer section (NODATA).
    pub fn answer(query: &DnsMessage, ip: Ipv4Addr, ttl: u32) -> Self {
        let flags = FLAG_QR
            | FLAG_AA
            | FLAG_RA
            | (query.header.flags & FLAG_RD)
            | (query.header.flags & OPCODE_MASK);
        let questions: Vec<Question> = query.questions.iter().take(1).cloned().collect();
        let answers = questions
            .iter()
            .filter(|q| q.asks_for_a())
            .map(|q| ResourceRecord::a(q.name.clone(), ip, ttl))
            .collect();
        Self {
            header: Header {
                id: query.header.id,
                flags,
                ..Default::default()
            },
            questions,
            answers,
        }
    }

    /// A standard recursive query for one A record
    pub fn query_a(id: u16, name: &str) -> Self {
        Self {
            header: Header {
                id,
                flags: FLAG_RD,
                ..Default::default()
            },
            questions: vec![Question {
                name: name.to_string(),
                qtype: TYPE_A,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
        }
    }
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| DnsError::Malformed(format!("truncated at offset {}", pos)))
}

/// Decode a name starting at `pos`. Returns the dotted name and the offset
/// just past it in the original position (after the first pointer, if any).
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut resume: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| DnsError::Malformed("name runs past end".to_string()))?;
        match len {
            0 => {
                pos += 1;
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let target = (read_u16(buf, pos)? & 0x3FFF) as usize;
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(DnsError::Malformed("compression loop".to_string()));
                }
                resume.get_or_insert(pos + 2);
                pos = target;
            }
            l if l as usize > MAX_LABEL_LEN => {
                return Err(DnsError::Malformed(format!("label length {}", l)));
            }
            l => {
                let start = pos + 1;
                let label = buf
                    .get(start..start + l as usize)
                    .ok_or_else(|| DnsError::Malformed("label truncated".to_string()))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos = start + l as usize;
            }
        }
    }
    Ok((labels.join("."), resume.unwrap_or(pos)))
}

fn write_name(buf: &mut BytesMut, name: &str) -> Result<()> {
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::Malformed(format!("label '{}' too long", label)));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // dig-style query for demo.n A, id 0x1234, RD set
    const DEMO_QUERY: [u8; 24] = [
        0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, b'd',
        b'e', b'm', b'o', 0x01, b'n', 0x00, 0x00, 0x01, 0x00, 0x01,
    ];

    #[test]
    fn test_decode_query() {
        let msg = DnsMessage::decode(&DEMO_QUERY).unwrap();
        assert_eq!(msg.header.id, 0x1234);
        assert!(!msg.header.is_response());
        assert_eq!(msg.question_name(), Some("demo.n"));
        assert_eq!(msg.questions[0].qtype, TYPE_A);
        assert!(msg.answers.is_empty());
    }

    #[test]
    fn test_encode_query_matches_wire() {
        let msg = DnsMessage::query_a(0x1234, "demo.n");
        assert_eq!(msg.encode().unwrap(), DEMO_QUERY.to_vec());
    }

    #[test]
    fn test_answer_layout() {
        let query = DnsMessage::decode(&DEMO_QUERY).unwrap();
        let reply = DnsMessage::answer(&query, Ipv4Addr::new(192, 168, 1, 10), 60);
        let bytes = reply.encode().unwrap();

        assert_eq!(&bytes[0..2], &[0x12, 0x34]);
        let flags = u16::from_be_bytes([bytes[2], bytes[3]]);
        assert_eq!(flags, FLAG_QR | FLAG_AA | FLAG_RD | FLAG_RA);
        // Answer name is a pointer back to the question
        assert_eq!(&bytes[24..26], &[0xC0, 0x0C]);
        assert_eq!(&bytes[bytes.len() - 4..], &[192, 168, 1, 10]);

        let decoded = DnsMessage::decode(&bytes).unwrap();
        assert!(decoded.header.is_response());
        assert_eq!(decoded.answers.len(), 1);
        assert_eq!(decoded.answers[0].name, "demo.n");
        assert_eq!(decoded.answers[0].ttl, 60);
        assert_eq!(decoded.answers[0].ipv4(), Some(Ipv4Addr::new(192, 168, 1, 10)));
    }

    #[test]
    fn test_non_a_query_gets_nodata() {
        let mut query = DnsMessage::query_a(7, "demo.nexa");
        query.questions[0].qtype = 28;
        let reply = DnsMessage::answer(&query, Ipv4Addr::LOCALHOST, 60);
        assert!(reply.answers.is_empty());
        assert_eq!(reply.questions.len(), 1);
        assert!(reply.header.flags & FLAG_AA != 0);
    }

    #[test]
    fn test_mdns_unicast_bit() {
        let q = Question {
            name: "demo.n".into(),
            qtype: TYPE_A,
            qclass: CLASS_IN | CLASS_UNICAST_RESPONSE,
        };
        assert!(q.wants_unicast());
        assert_eq!(q.class(), CLASS_IN);
    }

    #[test]
    fn test_trailing_dot_encodes_same() {
        let a = DnsMessage::query_a(1, "demo.n.").encode().unwrap();
        let b = DnsMessage::query_a(1, "demo.n").encode().unwrap();
        assert_eq!(a, b);
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_short_packet() {
        assert!(matches!(
            DnsMessage::decode(&[0u8; 5]),
            Err(DnsError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_question() {
        assert!(DnsMessage::decode(&DEMO_QUERY[..18]).is_err());
        assert!(DnsMessage::decode(&DEMO_QUERY[..21]).is_err());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let mut packet = DEMO_QUERY[..12].to_vec();
        packet.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
        assert!(matches!(
            DnsMessage::decode(&packet),
            Err(DnsError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_label_rejected() {
        let name = format!("{}.n", "a".repeat(64));
        assert!(DnsMessage::query_a(1, &name).encode().is_err());
    }
}
