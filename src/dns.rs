//! DNS/mDNS wire codec: queries, A/AAAA/SRV/TXT/PTR records, RFC-1035
//! name compression on decode. The encoder emits uncompressed names; the
//! per-record encoder is exposed so callers can budget packets against the
//! multicast MTU before committing to a message.

use std::io::{Cursor, Read};
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::MatterError;

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_ANY: u16 = 0xff;

pub const CLASS_IN: u16 = 1;
/// High bit of the class field: unicast-response-requested on queries
/// (RFC 6762 5.4), cache-flush on records (RFC 6762 10.2).
pub const CLASS_HIGH_BIT: u16 = 0x8000;

/// mDNS datagrams must fit the ethernet MTU (RFC 6762 17).
pub const MAX_MDNS_MESSAGE_SIZE: usize = 1500;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_TRUNCATED: u16 = 0x0200;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Query,
    TruncatedQuery,
    Response,
    TruncatedResponse,
}

impl MessageType {
    fn to_flags(self) -> u16 {
        match self {
            MessageType::Query => 0,
            MessageType::TruncatedQuery => FLAG_TRUNCATED,
            MessageType::Response => FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            MessageType::TruncatedResponse => FLAG_RESPONSE | FLAG_AUTHORITATIVE | FLAG_TRUNCATED,
        }
    }
    fn from_flags(flags: u16) -> Self {
        match (flags & FLAG_RESPONSE != 0, flags & FLAG_TRUNCATED != 0) {
            (false, false) => MessageType::Query,
            (false, true) => MessageType::TruncatedQuery,
            (true, false) => MessageType::Response,
            (true, true) => MessageType::TruncatedResponse,
        }
    }
    pub fn is_response(self) -> bool {
        matches!(self, MessageType::Response | MessageType::TruncatedResponse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsQuery {
    pub name: String,
    pub typ: u16,
    pub class: u16,
}

impl DnsQuery {
    pub fn new(name: &str, typ: u16) -> Self {
        Self {
            name: name.to_owned(),
            typ,
            class: CLASS_IN,
        }
    }
    pub fn unicast_response(&self) -> bool {
        self.class & CLASS_HIGH_BIT != 0
    }
}

/// Typed rdata payload of a resource record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordValue {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<String>),
    /// Unrecognized type, kept verbatim.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub typ: u16,
    pub class: u16,
    pub ttl: u32,
    pub value: RecordValue,
}

impl DnsRecord {
    pub fn cache_flush(&self) -> bool {
        self.class & CLASS_HIGH_BIT != 0
    }
    /// True when `other` would suppress this record as a known answer:
    /// same name/type/class and byte-identical rdata (the typed values
    /// encode canonically, so value equality is rdata equality).
    pub fn same_data(&self, other: &DnsRecord) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.typ == other.typ
            && (self.class & !CLASS_HIGH_BIT) == (other.class & !CLASS_HIGH_BIT)
            && self.value == other.value
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub transaction_id: u16,
    pub message_type: MessageType,
    pub queries: Vec<DnsQuery>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            transaction_id: 0,
            message_type,
            queries: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.len() + 1 > MAX_NAME_LEN {
        return Err(MatterError::Validation(format!("dns name too long: {}", name.len())).into());
    }
    for seg in name.split('.') {
        if seg.len() > MAX_LABEL_LEN {
            return Err(
                MatterError::Validation(format!("dns label too long: {}", seg.len())).into(),
            );
        }
    }
    Ok(())
}

pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    check_name(name)?;
    for seg in name.split('.') {
        if seg.is_empty() {
            continue;
        }
        out.write_u8(seg.len() as u8)?;
        out.extend_from_slice(seg.as_bytes());
    }
    out.write_u8(0)?;
    Ok(())
}

fn encode_rdata(value: &RecordValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        RecordValue::A(ip) => out.extend_from_slice(&ip.octets()),
        RecordValue::Aaaa(ip) => out.extend_from_slice(&ip.octets()),
        RecordValue::Ptr(target) => encode_name(target, out)?,
        RecordValue::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            out.write_u16::<BigEndian>(*priority)?;
            out.write_u16::<BigEndian>(*weight)?;
            out.write_u16::<BigEndian>(*port)?;
            encode_name(target, out)?;
        }
        RecordValue::Txt(entries) => {
            for e in entries {
                let bytes = e.as_bytes();
                if bytes.len() > 0xff {
                    return Err(
                        MatterError::Validation("txt entry longer than 255".into()).into()
                    );
                }
                out.write_u8(bytes.len() as u8)?;
                out.extend_from_slice(bytes);
            }
            if entries.is_empty() {
                // RFC 6763 6.1: empty TXT is a single zero-length string
                out.write_u8(0)?;
            }
        }
        RecordValue::Raw(bytes) => out.extend_from_slice(bytes),
    }
    Ok(())
}

/// Encode a single resource record to wire format.
pub fn encode_record(rr: &DnsRecord, out: &mut Vec<u8>) -> Result<()> {
    encode_name(&rr.name, out)?;
    out.write_u16::<BigEndian>(rr.typ)?;
    out.write_u16::<BigEndian>(rr.class)?;
    out.write_u32::<BigEndian>(rr.ttl)?;
    let mut rdata = Vec::new();
    encode_rdata(&rr.value, &mut rdata)?;
    out.write_u16::<BigEndian>(rdata.len() as u16)?;
    out.extend_from_slice(&rdata);
    Ok(())
}

/// Wire size of a record as `encode_record` would emit it.
pub fn record_size(rr: &DnsRecord) -> Result<usize> {
    let mut buf = Vec::new();
    encode_record(rr, &mut buf)?;
    Ok(buf.len())
}

pub fn encode_query(q: &DnsQuery, out: &mut Vec<u8>) -> Result<()> {
    encode_name(&q.name, out)?;
    out.write_u16::<BigEndian>(q.typ)?;
    out.write_u16::<BigEndian>(q.class)?;
    Ok(())
}

pub fn encode_message(msg: &DnsMessage) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    out.write_u16::<BigEndian>(msg.transaction_id)?;
    out.write_u16::<BigEndian>(msg.message_type.to_flags())?;
    out.write_u16::<BigEndian>(msg.queries.len() as u16)?;
    out.write_u16::<BigEndian>(msg.answers.len() as u16)?;
    out.write_u16::<BigEndian>(msg.authorities.len() as u16)?;
    out.write_u16::<BigEndian>(msg.additionals.len() as u16)?;
    for q in &msg.queries {
        encode_query(q, &mut out)?;
    }
    for rr in msg
        .answers
        .iter()
        .chain(msg.authorities.iter())
        .chain(msg.additionals.iter())
    {
        encode_record(rr, &mut out)?;
    }
    Ok(out)
}

fn decode_name(data: &[u8], cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<String> {
    if depth > MAX_POINTER_DEPTH {
        return Err(MatterError::MalformedMessage("compression pointer loop".into()).into());
    }
    let mut labels: Vec<String> = Vec::new();
    let mut total = 0usize;
    loop {
        let n = cursor.read_u8()?;
        if n == 0 {
            break;
        } else if n & 0xc0 == 0xc0 {
            let off = (((n & 0x3f) as usize) << 8) | cursor.read_u8()? as usize;
            if off >= data.len() {
                return Err(
                    MatterError::MalformedMessage("compression pointer out of range".into()).into(),
                );
            }
            let frag = decode_name(data, &mut Cursor::new(&data[off..]), depth + 1)?;
            if !frag.is_empty() {
                labels.push(frag);
            }
            break;
        } else {
            let n = n as usize;
            if n > MAX_LABEL_LEN {
                return Err(MatterError::MalformedMessage("label too long".into()).into());
            }
            total += n + 1;
            if total > MAX_NAME_LEN {
                return Err(MatterError::MalformedMessage("name too long".into()).into());
            }
            let mut b = vec![0; n];
            cursor.read_exact(&mut b)?;
            labels.push(
                std::str::from_utf8(&b)
                    .map_err(|_| MatterError::MalformedMessage("label not utf8".into()))?
                    .to_owned(),
            );
        }
    }
    Ok(labels.join("."))
}

fn decode_rdata(
    typ: u16,
    rdata: &[u8],
    message: &[u8],
    rdata_offset: usize,
) -> Result<RecordValue> {
    match typ {
        TYPE_A => {
            let arr: [u8; 4] = rdata
                .try_into()
                .map_err(|_| MatterError::MalformedMessage("A rdata length".into()))?;
            Ok(RecordValue::A(Ipv4Addr::from(arr)))
        }
        TYPE_AAAA => {
            let arr: [u8; 16] = rdata
                .try_into()
                .map_err(|_| MatterError::MalformedMessage("AAAA rdata length".into()))?;
            Ok(RecordValue::Aaaa(Ipv6Addr::from(arr)))
        }
        TYPE_PTR => {
            // target may point back into the full message
            let mut cursor = Cursor::new(message);
            cursor.set_position(rdata_offset as u64);
            Ok(RecordValue::Ptr(decode_name(message, &mut cursor, 0)?))
        }
        TYPE_SRV => {
            if rdata.len() < 6 {
                return Err(MatterError::MalformedMessage("SRV rdata too short".into()).into());
            }
            let mut cursor = Cursor::new(message);
            cursor.set_position(rdata_offset as u64);
            let priority = cursor.read_u16::<BigEndian>()?;
            let weight = cursor.read_u16::<BigEndian>()?;
            let port = cursor.read_u16::<BigEndian>()?;
            let target = decode_name(message, &mut cursor, 0)?;
            Ok(RecordValue::Srv {
                priority,
                weight,
                port,
                target,
            })
        }
        TYPE_TXT => {
            let mut entries = Vec::new();
            let mut cursor = Cursor::new(rdata);
            while cursor.position() < rdata.len() as u64 {
                let len = cursor.read_u8()? as usize;
                let mut b = vec![0; len];
                cursor.read_exact(&mut b)?;
                if b.is_empty() {
                    continue;
                }
                match String::from_utf8(b) {
                    Ok(s) => entries.push(s),
                    Err(_) => continue, // non-utf8 txt entries are dropped
                }
            }
            Ok(RecordValue::Txt(entries))
        }
        _ => Ok(RecordValue::Raw(rdata.to_vec())),
    }
}

fn decode_record(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<DnsRecord> {
    let name = decode_name(data, cursor, 0)?;
    let typ = cursor.read_u16::<BigEndian>()?;
    let class = cursor.read_u16::<BigEndian>()?;
    let ttl = cursor.read_u32::<BigEndian>()?;
    let dlen = cursor.read_u16::<BigEndian>()? as usize;
    let rdata_offset = cursor.position() as usize;
    if rdata_offset + dlen > data.len() {
        return Err(MatterError::MalformedMessage("rdata length exceeds message".into()).into());
    }
    let mut rdata = vec![0; dlen];
    cursor.read_exact(&mut rdata)?;
    let value = decode_rdata(typ, &rdata, data, rdata_offset)?;
    Ok(DnsRecord {
        name,
        typ,
        class,
        ttl,
        value,
    })
}

fn decode_query(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<DnsQuery> {
    let name = decode_name(data, cursor, 0)?;
    let typ = cursor.read_u16::<BigEndian>()?;
    let class = cursor.read_u16::<BigEndian>()?;
    Ok(DnsQuery { name, typ, class })
}

pub fn decode_message(data: &[u8]) -> Result<DnsMessage> {
    let mut cursor = Cursor::new(data);
    let transaction_id = cursor.read_u16::<BigEndian>()?;
    let flags = cursor.read_u16::<BigEndian>()?;
    let nqueries = cursor.read_u16::<BigEndian>()?;
    let nanswers = cursor.read_u16::<BigEndian>()?;
    let nauthorities = cursor.read_u16::<BigEndian>()?;
    let nadditionals = cursor.read_u16::<BigEndian>()?;

    let mut msg = DnsMessage {
        transaction_id,
        message_type: MessageType::from_flags(flags),
        queries: Vec::with_capacity(nqueries as usize),
        answers: Vec::with_capacity(nanswers as usize),
        authorities: Vec::new(),
        additionals: Vec::new(),
    };
    for _ in 0..nqueries {
        msg.queries.push(decode_query(data, &mut cursor)?);
    }
    for _ in 0..nanswers {
        msg.answers.push(decode_record(data, &mut cursor)?);
    }
    for _ in 0..nauthorities {
        msg.authorities.push(decode_record(data, &mut cursor)?);
    }
    for _ in 0..nadditionals {
        msg.additionals.push(decode_record(data, &mut cursor)?);
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srv(name: &str, target: &str, port: u16, ttl: u32) -> DnsRecord {
        DnsRecord {
            name: name.to_owned(),
            typ: TYPE_SRV,
            class: CLASS_IN,
            ttl,
            value: RecordValue::Srv {
                priority: 0,
                weight: 0,
                port,
                target: target.to_owned(),
            },
        }
    }

    #[test]
    fn test_query_roundtrip() {
        let mut msg = DnsMessage::new(MessageType::Query);
        msg.queries
            .push(DnsQuery::new("_matter._tcp.local", TYPE_PTR));
        let bytes = encode_message(&msg).unwrap();
        let back = decode_message(&bytes).unwrap();
        assert_eq!(back.message_type, MessageType::Query);
        assert_eq!(back.queries.len(), 1);
        assert_eq!(back.queries[0].name, "_matter._tcp.local");
        assert_eq!(back.queries[0].typ, TYPE_PTR);
        assert!(!back.queries[0].unicast_response());
    }

    #[test]
    fn test_truncated_flag_roundtrip() {
        let msg = DnsMessage::new(MessageType::TruncatedQuery);
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(
            decode_message(&bytes).unwrap().message_type,
            MessageType::TruncatedQuery
        );
        let msg = DnsMessage::new(MessageType::TruncatedResponse);
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(
            decode_message(&bytes).unwrap().message_type,
            MessageType::TruncatedResponse
        );
    }

    #[test]
    fn test_records_roundtrip() {
        let mut msg = DnsMessage::new(MessageType::Response);
        msg.answers.push(DnsRecord {
            name: "_matterc._udp.local".to_owned(),
            typ: TYPE_PTR,
            class: CLASS_IN,
            ttl: 4500,
            value: RecordValue::Ptr("inst1._matterc._udp.local".to_owned()),
        });
        msg.answers.push(DnsRecord {
            name: "inst1._matterc._udp.local".to_owned(),
            typ: TYPE_TXT,
            class: CLASS_IN,
            ttl: 4500,
            value: RecordValue::Txt(vec!["D=3840".to_owned(), "CM=1".to_owned()]),
        });
        msg.answers.push(srv(
            "inst1._matterc._udp.local",
            "host1.local",
            5540,
            120,
        ));
        msg.additionals.push(DnsRecord {
            name: "host1.local".to_owned(),
            typ: TYPE_AAAA,
            class: CLASS_IN | CLASS_HIGH_BIT,
            ttl: 120,
            value: RecordValue::Aaaa("fd00::2".parse().unwrap()),
        });

        let bytes = encode_message(&msg).unwrap();
        let back = decode_message(&bytes).unwrap();
        assert_eq!(back.answers, msg.answers);
        assert_eq!(back.additionals.len(), 1);
        assert!(back.additionals[0].cache_flush());
        assert_eq!(
            back.additionals[0].value,
            RecordValue::Aaaa("fd00::2".parse().unwrap())
        );
    }

    #[test]
    fn test_name_compression_pointer_decode() {
        // header + one answer whose PTR rdata points back at the query name
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0, 0, 0x84, 0, 0, 1, 0, 1, 0, 0, 0, 0]);
        let name_offset = bytes.len() as u8;
        encode_name("svc.local", &mut bytes).unwrap();
        bytes.extend_from_slice(&TYPE_PTR.to_be_bytes());
        bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
        // answer: name = pointer to query name
        bytes.extend_from_slice(&[0xc0, name_offset]);
        bytes.extend_from_slice(&TYPE_PTR.to_be_bytes());
        bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
        bytes.extend_from_slice(&120u32.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes()); // rdlen
        bytes.extend_from_slice(&[0xc0, name_offset]); // rdata = same pointer

        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.answers[0].name, "svc.local");
        assert_eq!(
            msg.answers[0].value,
            RecordValue::Ptr("svc.local".to_owned())
        );
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        // query name is a pointer to itself
        bytes.extend_from_slice(&[0xc0, 12]);
        bytes.extend_from_slice(&TYPE_PTR.to_be_bytes());
        bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
        assert!(decode_message(&bytes).is_err());
    }

    #[test]
    fn test_name_limits() {
        let long_label = "a".repeat(64);
        let mut out = Vec::new();
        assert!(encode_name(&format!("{}.local", long_label), &mut out).is_err());
        let long_name = vec!["abcdefg"; 40].join(".");
        assert!(encode_name(&long_name, &mut out).is_err());
    }

    #[test]
    fn test_record_size_matches_encoding() {
        let rr = srv("inst._matter._tcp.local", "node.local", 5540, 120);
        let mut buf = Vec::new();
        encode_record(&rr, &mut buf).unwrap();
        assert_eq!(record_size(&rr).unwrap(), buf.len());
    }

    #[test]
    fn test_same_data_suppression_match() {
        let a = srv("i._matterc._udp.local", "h.local", 5540, 120);
        let mut b = a.clone();
        b.ttl = 4500; // ttl does not participate
        assert!(a.same_data(&b));
        let mut c = a.clone();
        c.value = RecordValue::Srv {
            priority: 0,
            weight: 0,
            port: 5541,
            target: "h.local".to_owned(),
        };
        assert!(!a.same_data(&c));
    }

    #[test]
    fn test_empty_txt_encodes_single_zero() {
        let rr = DnsRecord {
            name: "x.local".to_owned(),
            typ: TYPE_TXT,
            class: CLASS_IN,
            ttl: 10,
            value: RecordValue::Txt(vec![]),
        };
        let mut buf = Vec::new();
        encode_record(&rr, &mut buf).unwrap();
        // last two bytes: rdlen=1, single zero byte
        assert_eq!(&buf[buf.len() - 3..], &[0, 1, 0]);
    }
}
