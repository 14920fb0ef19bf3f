//! Minimal DER encoder, just enough to rebuild the X.509 TBSCertificate a
//! matter certificate signature covers.

use std::io::Result;

use byteorder::WriteBytesExt;

fn write_tag(buf: &mut Vec<u8>, tag: u8) -> Result<()> {
    buf.write_u8(tag)
}

fn write_len(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    if len < 0x80 {
        buf.write_u8(len as u8)
    } else if len <= 0xff {
        buf.write_u8(0x81)?;
        buf.write_u8(len as u8)
    } else {
        buf.write_u8(0x82)?;
        buf.write_u8((len >> 8) as u8)?;
        buf.write_u8(len as u8)
    }
}

/// Base-128 encoding of a dotted oid string, e.g. "1.2.840.10045.4.3.2".
fn oid_bytes(oid: &str) -> Result<Vec<u8>> {
    let arcs: Vec<u64> = oid
        .split('.')
        .map(|s| s.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if arcs.len() < 2 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oid needs at least two arcs",
        ));
    }
    let mut out = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for arc in &arcs[2..] {
        let mut tmp = *arc;
        let mut chunk = vec![(tmp & 0x7f) as u8];
        tmp >>= 7;
        while tmp > 0 {
            chunk.push(((tmp & 0x7f) | 0x80) as u8);
            tmp >>= 7;
        }
        chunk.reverse();
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
struct StackEntry {
    pos: usize,
}

/// DER encoder with deferred sequence lengths: start_seq reserves a length
/// byte, end_seq patches it (and shifts when the body ran past 127 bytes).
#[derive(Debug, Clone)]
pub struct Encoder {
    buffer: Vec<u8>,
    stack: Vec<StackEntry>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            stack: Vec::new(),
        }
    }
    pub fn start_seq(&mut self, tag: u8) -> Result<()> {
        write_tag(&mut self.buffer, tag)?;
        self.stack.push(StackEntry {
            pos: self.buffer.len() - 1,
        });
        self.buffer.write_u8(0)
    }
    pub fn end_seq(&mut self) {
        if let Some(a) = self.stack.pop() {
            let s = self.buffer.len() - a.pos - 2;
            if s < 0x80 {
                self.buffer[a.pos + 1] = s as u8;
            } else if s <= 0xff {
                self.buffer[a.pos + 1] = 0x81;
                self.buffer.insert(a.pos + 2, s as u8);
            } else {
                self.buffer[a.pos + 1] = 0x82;
                self.buffer.insert(a.pos + 2, (s >> 8) as u8);
                self.buffer.insert(a.pos + 3, s as u8);
            }
        }
    }
    fn fix(&mut self) {
        while !self.stack.is_empty() {
            self.end_seq()
        }
    }
    pub fn write_octet_string(&mut self, val: &[u8]) -> Result<()> {
        self.write_octet_string_with_tag(0x4, val)
    }
    pub fn write_octet_string_with_tag(&mut self, tag: u8, val: &[u8]) -> Result<()> {
        write_tag(&mut self.buffer, tag)?;
        write_len(&mut self.buffer, val.len())?;
        self.buffer.extend_from_slice(val);
        Ok(())
    }
    pub fn write_string(&mut self, val: &str) -> Result<()> {
        self.write_octet_string_with_tag(0xc, val.as_bytes())
    }
    pub fn write_string_with_tag(&mut self, tag: u8, val: &str) -> Result<()> {
        self.write_octet_string_with_tag(tag, val.as_bytes())
    }
    pub fn write_bool(&mut self, val: bool) -> Result<()> {
        write_tag(&mut self.buffer, 0x1)?;
        write_len(&mut self.buffer, 1)?;
        self.buffer.write_u8(if val { 0xff } else { 0 })
    }
    pub fn write_int(&mut self, val: u32) -> Result<()> {
        let bytes = val.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
        self.write_int_bytes(&bytes[skip..])
    }
    /// INTEGER from a big-endian magnitude, inserting the leading zero DER
    /// requires when the top bit is set.
    pub fn write_int_bytes(&mut self, magnitude: &[u8]) -> Result<()> {
        let trimmed = {
            let skip = magnitude
                .iter()
                .take_while(|b| **b == 0)
                .count()
                .min(magnitude.len().saturating_sub(1));
            &magnitude[skip..]
        };
        write_tag(&mut self.buffer, 0x2)?;
        if trimmed.is_empty() || trimmed[0] & 0x80 != 0 {
            write_len(&mut self.buffer, trimmed.len() + 1)?;
            self.buffer.write_u8(0)?;
        } else {
            write_len(&mut self.buffer, trimmed.len())?;
        }
        self.buffer.extend_from_slice(trimmed);
        Ok(())
    }
    pub fn write_oid(&mut self, val: &str) -> Result<()> {
        let bytes = oid_bytes(val)?;
        self.write_octet_string_with_tag(0x6, &bytes)
    }
    /// BIT STRING with zero unused bits.
    pub fn write_bit_string(&mut self, val: &[u8]) -> Result<()> {
        let mut b = Vec::with_capacity(val.len() + 1);
        b.push(0);
        b.extend_from_slice(val);
        self.write_octet_string_with_tag(0x3, &b)
    }

    pub fn encode(mut self) -> Vec<u8> {
        self.fix();
        self.buffer
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_encoding() {
        let mut e = Encoder::new();
        e.write_int(127).unwrap();
        assert_eq!(e.encode(), vec![0x02, 0x01, 0x7f]);

        let mut e = Encoder::new();
        e.write_int(128).unwrap();
        assert_eq!(e.encode(), vec![0x02, 0x02, 0x00, 0x80]);

        let mut e = Encoder::new();
        e.write_int(256).unwrap();
        assert_eq!(e.encode(), vec![0x02, 0x02, 0x01, 0x00]);

        let mut e = Encoder::new();
        e.write_int_bytes(&[0x00, 0x00, 0x9a]).unwrap();
        assert_eq!(e.encode(), vec![0x02, 0x02, 0x00, 0x9a]);
    }

    #[test]
    fn test_oid_encoding() {
        // ecdsa-with-SHA256
        let mut e = Encoder::new();
        e.write_oid("1.2.840.10045.4.3.2").unwrap();
        assert_eq!(
            e.encode(),
            vec![0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02]
        );
        // matter node-id DN attribute
        let mut e = Encoder::new();
        e.write_oid("1.3.6.1.4.1.37244.1.1").unwrap();
        assert_eq!(
            e.encode(),
            vec![0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0xa2, 0x7c, 0x01, 0x01]
        );
    }

    #[test]
    fn test_sequence_length_fixup() {
        let mut e = Encoder::new();
        e.start_seq(0x30).unwrap();
        e.write_octet_string(&[0xab; 200]).unwrap();
        e.end_seq();
        let out = e.encode();
        // long-form length: 30 81 cb 04 81 c8 ...
        assert_eq!(&out[..3], &[0x30, 0x81, 0xcb]);
        assert_eq!(out.len(), 3 + 3 + 200);
    }

    #[test]
    fn test_bool_and_bitstring() {
        let mut e = Encoder::new();
        e.write_bool(true).unwrap();
        e.write_bit_string(&[0x07, 0x80]).unwrap();
        assert_eq!(
            e.encode(),
            vec![0x01, 0x01, 0xff, 0x03, 0x03, 0x00, 0x07, 0x80]
        );
    }
}
