//! Encoder/decoder for matter tlv.
//!
//! Two layers are provided. [TlvBuffer] is a streaming writer used when the
//! shape of the payload is known up front (all the sigma messages are built
//! this way). [decode_tlv] turns raw bytes into a [TlvItem] tree which can be
//! navigated with tag paths, patched with [TlvItem::inject_field] /
//! [TlvItem::remove_field] and re-encoded.

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use std::io::{Cursor, Read, Write};

use crate::error::MatterError;

const TYPE_INT_1: u8 = 0;
const TYPE_INT_2: u8 = 1;
const TYPE_INT_4: u8 = 2;
const TYPE_INT_8: u8 = 3;
const TYPE_UINT_1: u8 = 4;
const TYPE_UINT_2: u8 = 5;
const TYPE_UINT_4: u8 = 6;
const TYPE_UINT_8: u8 = 7;
const TYPE_BOOL_FALSE: u8 = 8;
const TYPE_BOOL_TRUE: u8 = 9;
const TYPE_UTF8_L1: u8 = 0xC;
const TYPE_UTF8_L2: u8 = 0xD;
const TYPE_OCTET_STRING_L1: u8 = 0x10;
const TYPE_OCTET_STRING_L2: u8 = 0x11;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END_CONTAINER: u8 = 0x18;

const CTRL_CTX_L1: u8 = 1 << 5;

/// Buffer to encode matter tlv. Create buffer, write elements, then use the
/// data member which contains the encoded tlv.
pub struct TlvBuffer {
    pub data: Vec<u8>,
}

impl TlvBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(1024),
        }
    }
    pub fn from_vec(v: Vec<u8>) -> Self {
        Self { data: v }
    }
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.data.write_all(data)?;
        Ok(())
    }
    pub fn write_anon_struct(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_STRUCT)?;
        Ok(())
    }
    pub fn write_struct(&mut self, tag: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_STRUCT)?;
        self.data.write_u8(tag)?;
        Ok(())
    }
    pub fn write_array(&mut self, tag: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_ARRAY)?;
        self.data.write_u8(tag)?;
        Ok(())
    }
    pub fn write_list(&mut self, tag: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_LIST)?;
        self.data.write_u8(tag)?;
        Ok(())
    }
    pub fn write_struct_end(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_END_CONTAINER)?;
        Ok(())
    }
    pub fn write_string(&mut self, tag: u8, data: &str) -> Result<()> {
        let bytes = data.as_bytes();
        if bytes.len() > 0xff {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_UTF8_L2)?;
            self.data.write_u8(tag)?;
            self.data.write_u16::<LittleEndian>(bytes.len() as u16)?;
        } else {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_UTF8_L1)?;
            self.data.write_u8(tag)?;
            self.data.write_u8(bytes.len() as u8)?;
        }
        self.data.write_all(bytes)?;
        Ok(())
    }
    pub fn write_octetstring(&mut self, tag: u8, data: &[u8]) -> Result<()> {
        if data.len() > 0xff {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_OCTET_STRING_L2)?;
            self.data.write_u8(tag)?;
            self.data.write_u16::<LittleEndian>(data.len() as u16)?;
        } else {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_OCTET_STRING_L1)?;
            self.data.write_u8(tag)?;
            self.data.write_u8(data.len() as u8)?;
        }
        self.data.write_all(data)?;
        Ok(())
    }
    pub fn write_null(&mut self, tag: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_NULL)?;
        self.data.write_u8(tag)?;
        Ok(())
    }
    pub fn write_int8(&mut self, tag: u8, value: i8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_INT_1)?;
        self.data.write_u8(tag)?;
        self.data.write_i8(value)?;
        Ok(())
    }
    pub fn write_int16(&mut self, tag: u8, value: i16) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_INT_2)?;
        self.data.write_u8(tag)?;
        self.data.write_i16::<LittleEndian>(value)?;
        Ok(())
    }
    pub fn write_uint8(&mut self, tag: u8, value: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_UINT_1)?;
        self.data.write_u8(tag)?;
        self.data.write_u8(value)?;
        Ok(())
    }
    pub fn write_uint8_notag(&mut self, value: u8) -> Result<()> {
        self.data.write_u8(TYPE_UINT_1)?;
        self.data.write_u8(value)?;
        Ok(())
    }
    pub fn write_uint16(&mut self, tag: u8, value: u16) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_UINT_2)?;
        self.data.write_u8(tag)?;
        self.data.write_u16::<LittleEndian>(value)?;
        Ok(())
    }
    pub fn write_uint32(&mut self, tag: u8, value: u32) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_UINT_4)?;
        self.data.write_u8(tag)?;
        self.data.write_u32::<LittleEndian>(value)?;
        Ok(())
    }
    pub fn write_uint64(&mut self, tag: u8, value: u64) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | TYPE_UINT_8)?;
        self.data.write_u8(tag)?;
        self.data.write_u64::<LittleEndian>(value)?;
        Ok(())
    }
    pub fn write_bool(&mut self, tag: u8, value: bool) -> Result<()> {
        if value {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_BOOL_TRUE)?;
        } else {
            self.data.write_u8(CTRL_CTX_L1 | TYPE_BOOL_FALSE)?;
        }
        self.data.write_u8(tag)?;
        Ok(())
    }
}

impl Default for TlvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Value of a decoded tlv element.
#[derive(Clone, PartialEq)]
pub enum TlvItemValue {
    Int(u64),
    SignedInt(i64),
    Bool(bool),
    String(String),
    OctetString(Vec<u8>),
    /// Structures, arrays and lists all decode into an ordered list of
    /// children; no consumer here needs the distinction.
    List(Vec<TlvItem>),
    Nil(),
}

/// Decoded tlv element returned by [decode_tlv].
#[derive(Debug, Clone, PartialEq)]
pub struct TlvItem {
    pub tag: u8,
    pub value: TlvItemValue,
}

impl fmt::Debug for TlvItemValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(arg0) => f.debug_tuple("Int").field(arg0).finish(),
            Self::SignedInt(arg0) => f.debug_tuple("SignedInt").field(arg0).finish(),
            Self::Bool(arg0) => f.debug_tuple("Bool").field(arg0).finish(),
            Self::String(arg0) => f.debug_tuple("String").field(arg0).finish(),
            Self::OctetString(arg0) => f
                .debug_tuple("OctetString")
                .field(&hex::encode(arg0))
                .finish(),
            Self::List(arg0) => f.debug_tuple("List").field(arg0).finish(),
            Self::Nil() => f.debug_tuple("Nil").finish(),
        }
    }
}

impl TlvItem {
    pub fn get(&self, tag: &[u8]) -> Option<&TlvItemValue> {
        if !tag.is_empty() {
            if let TlvItemValue::List(lst) = &self.value {
                for l in lst {
                    if l.tag == tag[0] {
                        return l.get(&tag[1..]);
                    };
                }
            }
            None
        } else {
            Some(&self.value)
        }
    }
    pub fn get_item(&self, tag: &[u8]) -> Option<&TlvItem> {
        if !tag.is_empty() {
            if let TlvItemValue::List(lst) = &self.value {
                for l in lst {
                    if l.tag == tag[0] {
                        return l.get_item(&tag[1..]);
                    };
                }
            }
            None
        } else {
            Some(self)
        }
    }
    pub fn get_int(&self, tag: &[u8]) -> Option<u64> {
        match self.get(tag) {
            Some(TlvItemValue::Int(i)) => Some(*i),
            _ => None,
        }
    }
    pub fn get_bool(&self, tag: &[u8]) -> Option<bool> {
        match self.get(tag) {
            Some(TlvItemValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
    pub fn get_u8(&self, tag: &[u8]) -> Option<u8> {
        self.get_int(tag).map(|i| i as u8)
    }
    pub fn get_u16(&self, tag: &[u8]) -> Option<u16> {
        self.get_int(tag).map(|i| i as u16)
    }
    pub fn get_u32(&self, tag: &[u8]) -> Option<u32> {
        self.get_int(tag).map(|i| i as u32)
    }
    pub fn get_u64(&self, tag: &[u8]) -> Option<u64> {
        self.get_int(tag)
    }
    pub fn get_octet_string(&self, tag: &[u8]) -> Option<&[u8]> {
        match self.get(tag) {
            Some(TlvItemValue::OctetString(o)) => Some(o),
            _ => None,
        }
    }
    pub fn get_octet_string_owned(&self, tag: &[u8]) -> Option<Vec<u8>> {
        self.get_octet_string(tag).map(|o| o.to_vec())
    }
    pub fn get_string_owned(&self, tag: &[u8]) -> Option<String> {
        match self.get(tag) {
            Some(TlvItemValue::String(o)) => Some(o.clone()),
            _ => None,
        }
    }

    /// Insert or replace a context-tagged field in the container addressed by
    /// `path` (empty path patches this item). Replaces an existing child with
    /// the same tag in place, otherwise appends; insertion order of untouched
    /// fields is preserved.
    pub fn inject_field(&mut self, path: &[u8], item: TlvItem) -> Result<()> {
        let target = self.get_item_mut(path).ok_or_else(|| {
            MatterError::Validation(format!("inject_field: no container at {:?}", path))
        })?;
        match &mut target.value {
            TlvItemValue::List(children) => {
                if let Some(existing) = children.iter_mut().find(|c| c.tag == item.tag) {
                    *existing = item;
                } else {
                    children.push(item);
                }
                Ok(())
            }
            _ => Err(MatterError::Validation(format!(
                "inject_field: element at {:?} is not a container",
                path
            ))
            .into()),
        }
    }

    /// Remove the field with the final tag of `path`. Returns true when a
    /// field was actually removed.
    pub fn remove_field(&mut self, path: &[u8]) -> bool {
        let Some((last, parent_path)) = path.split_last() else {
            return false;
        };
        let Some(parent) = self.get_item_mut(parent_path) else {
            return false;
        };
        if let TlvItemValue::List(children) = &mut parent.value {
            let before = children.len();
            children.retain(|c| c.tag != *last);
            return children.len() != before;
        }
        false
    }

    fn get_item_mut(&mut self, tag: &[u8]) -> Option<&mut TlvItem> {
        if !tag.is_empty() {
            if let TlvItemValue::List(lst) = &mut self.value {
                for l in lst {
                    if l.tag == tag[0] {
                        return l.get_item_mut(&tag[1..]);
                    };
                }
            }
            None
        } else {
            Some(self)
        }
    }

    /// Re-encode a decoded tree. Containers come back as structures;
    /// integers are emitted in their smallest width, so the output is
    /// deterministic but not necessarily byte-identical to the input.
    pub fn encode(&self, buf: &mut TlvBuffer) -> Result<()> {
        match &self.value {
            TlvItemValue::Int(i) => {
                if *i <= u8::MAX as u64 {
                    buf.write_uint8(self.tag, *i as u8)
                } else if *i <= u16::MAX as u64 {
                    buf.write_uint16(self.tag, *i as u16)
                } else if *i <= u32::MAX as u64 {
                    buf.write_uint32(self.tag, *i as u32)
                } else {
                    buf.write_uint64(self.tag, *i)
                }
            }
            TlvItemValue::SignedInt(i) => {
                if *i >= i8::MIN as i64 && *i <= i8::MAX as i64 {
                    buf.write_int8(self.tag, *i as i8)
                } else {
                    buf.write_int16(self.tag, *i as i16)
                }
            }
            TlvItemValue::Bool(b) => buf.write_bool(self.tag, *b),
            TlvItemValue::String(s) => buf.write_string(self.tag, s),
            TlvItemValue::OctetString(o) => buf.write_octetstring(self.tag, o),
            TlvItemValue::List(children) => {
                buf.write_struct(self.tag)?;
                for c in children {
                    c.encode(buf)?;
                }
                buf.write_struct_end()
            }
            TlvItemValue::Nil() => buf.write_null(self.tag),
        }
    }
}

fn read_tag(tagctrl: u8, cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    match tagctrl {
        0 => Ok(0),
        1 => Ok(cursor.read_u8()?),
        other => {
            Err(MatterError::UnexpectedData(format!("unsupported tag control {}", other)).into())
        }
    }
}

fn decode(cursor: &mut Cursor<&[u8]>, container: &mut Vec<TlvItem>) -> Result<()> {
    while cursor.position() < cursor.get_ref().len() as u64 {
        let fb = cursor.read_u8()?;
        let tp = fb & 0x1f;
        let tagctrl = fb >> 5;
        let tag = read_tag(tagctrl, cursor)?;
        let value = match tp {
            TYPE_INT_1 => TlvItemValue::SignedInt(cursor.read_i8()? as i64),
            TYPE_INT_2 => TlvItemValue::SignedInt(cursor.read_i16::<LittleEndian>()? as i64),
            TYPE_INT_4 => TlvItemValue::SignedInt(cursor.read_i32::<LittleEndian>()? as i64),
            TYPE_INT_8 => TlvItemValue::SignedInt(cursor.read_i64::<LittleEndian>()?),
            TYPE_UINT_1 => TlvItemValue::Int(cursor.read_u8()? as u64),
            TYPE_UINT_2 => TlvItemValue::Int(cursor.read_u16::<LittleEndian>()? as u64),
            TYPE_UINT_4 => TlvItemValue::Int(cursor.read_u32::<LittleEndian>()? as u64),
            TYPE_UINT_8 => TlvItemValue::Int(cursor.read_u64::<LittleEndian>()?),
            TYPE_BOOL_FALSE => TlvItemValue::Bool(false),
            TYPE_BOOL_TRUE => TlvItemValue::Bool(true),
            TYPE_UTF8_L1 | TYPE_UTF8_L2 => {
                let size = if tp == TYPE_UTF8_L1 {
                    cursor.read_u8()? as usize
                } else {
                    cursor.read_u16::<LittleEndian>()? as usize
                };
                let mut value = vec![0; size];
                cursor.read_exact(&mut value)?;
                match String::from_utf8(value) {
                    Ok(s) => TlvItemValue::String(s),
                    Err(_) => {
                        return Err(
                            MatterError::UnexpectedData("utf8 string not valid".into()).into()
                        )
                    }
                }
            }
            TYPE_OCTET_STRING_L1 | TYPE_OCTET_STRING_L2 => {
                let size = if tp == TYPE_OCTET_STRING_L1 {
                    cursor.read_u8()? as usize
                } else {
                    cursor.read_u16::<LittleEndian>()? as usize
                };
                if size as u64 > cursor.get_ref().len() as u64 - cursor.position() {
                    return Err(MatterError::UnexpectedData(format!(
                        "octet string length {} exceeds input",
                        size
                    ))
                    .into());
                }
                let mut value = vec![0; size];
                cursor.read_exact(&mut value)?;
                TlvItemValue::OctetString(value)
            }
            TYPE_NULL => TlvItemValue::Nil(),
            TYPE_STRUCT | TYPE_ARRAY | TYPE_LIST => {
                let mut c2 = Vec::new();
                decode(cursor, &mut c2)?;
                TlvItemValue::List(c2)
            }
            TYPE_END_CONTAINER => return Ok(()),
            _ => {
                return Err(
                    MatterError::UnexpectedData(format!("unknown tlv type 0x{:x}", tp)).into(),
                )
            }
        };
        container.push(TlvItem { tag, value });
    }
    Ok(())
}

/// Decode a raw buffer with tlv data.
pub fn decode_tlv(data: &[u8]) -> Result<TlvItem> {
    let mut container = Vec::new();
    let mut cursor = std::io::Cursor::new(data);
    decode(&mut cursor, &mut container)?;
    if container.len() == 1 {
        match container.pop() {
            Some(i) => Ok(i),
            None => Err(MatterError::UnexpectedData("no tlv data found".into()).into()),
        }
    } else {
        Ok(TlvItem {
            tag: 0,
            value: TlvItemValue::List(container),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_tlv, TlvBuffer, TlvItem, TlvItemValue};

    #[test]
    fn test_encode_reference_bytes() {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_uint8(0, 6).unwrap();
        tlv.write_uint8(1, 7).unwrap();
        tlv.write_struct_end().unwrap();
        assert_eq!(hex::encode(&tlv.data), "1524000624010718");

        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_octetstring(0x1, &[1, 2, 3]).unwrap();
        tlv.write_struct_end().unwrap();
        assert_eq!(hex::encode(&tlv.data), "1530010301020318");
    }

    #[test]
    fn test_integers_roundtrip() {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_uint8(1, 42).unwrap();
        tlv.write_uint16(2, 1000).unwrap();
        tlv.write_uint32(3, 100000).unwrap();
        tlv.write_uint64(4, 1000000000000).unwrap();
        tlv.write_int8(5, -5).unwrap();
        tlv.write_int16(6, -3000).unwrap();
        tlv.write_struct_end().unwrap();

        let decoded = decode_tlv(&tlv.data).unwrap();
        assert_eq!(decoded.get_u8(&[1]), Some(42));
        assert_eq!(decoded.get_u16(&[2]), Some(1000));
        assert_eq!(decoded.get_u32(&[3]), Some(100000));
        assert_eq!(decoded.get_u64(&[4]), Some(1000000000000));
        assert_eq!(decoded.get(&[5]), Some(&TlvItemValue::SignedInt(-5)));
        assert_eq!(decoded.get(&[6]), Some(&TlvItemValue::SignedInt(-3000)));
    }

    #[test]
    fn test_strings_and_bools() {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_string(1, "hello world").unwrap();
        tlv.write_bool(2, true).unwrap();
        tlv.write_bool(3, false).unwrap();
        tlv.write_null(4).unwrap();
        tlv.write_struct_end().unwrap();

        let decoded = decode_tlv(&tlv.data).unwrap();
        assert_eq!(
            decoded.get_string_owned(&[1]),
            Some("hello world".to_string())
        );
        assert_eq!(decoded.get_bool(&[2]), Some(true));
        assert_eq!(decoded.get_bool(&[3]), Some(false));
        assert_eq!(decoded.get(&[4]), Some(&TlvItemValue::Nil()));
    }

    #[test]
    fn test_large_octet_string() {
        let mut tlv = TlvBuffer::new();
        let large = vec![0xaa; 300];
        tlv.write_octetstring(2, &large).unwrap();
        let decoded = decode_tlv(&tlv.data).unwrap();
        assert_eq!(decoded.get_octet_string(&[]), Some(large.as_slice()));
    }

    #[test]
    fn test_nested_structures() {
        let mut tlv = TlvBuffer::new();
        tlv.write_struct(1).unwrap();
        tlv.write_struct(2).unwrap();
        tlv.write_uint8(3, 42).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_string(4, "outer").unwrap();
        tlv.write_struct_end().unwrap();

        let decoded = decode_tlv(&tlv.data).unwrap();
        assert_eq!(decoded.get_u8(&[2, 3]), Some(42));
        assert_eq!(decoded.get_string_owned(&[4]), Some("outer".to_string()));
        let item = decoded.get_item(&[2]).unwrap();
        assert_eq!(item.tag, 2);
    }

    #[test]
    fn test_malformed_input_rejected() {
        // unknown element type 0x1f
        assert!(decode_tlv(&[0x1f, 0x00]).is_err());
        // declared length way past the end of input
        assert!(decode_tlv(&[0x31, 0x01, 0xff, 0xff, 0x00]).is_err());
        // fully-qualified tag form is not supported
        assert!(decode_tlv(&[0xe4, 0, 0, 0, 0, 0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_tree_reencode_roundtrip() {
        let mut tlv = TlvBuffer::new();
        tlv.write_struct(0).unwrap();
        tlv.write_uint16(1, 500).unwrap();
        tlv.write_string(2, "abc").unwrap();
        tlv.write_struct(3).unwrap();
        tlv.write_bool(1, true).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();

        let decoded = decode_tlv(&tlv.data).unwrap();
        let mut out = TlvBuffer::new();
        decoded.encode(&mut out).unwrap();
        let redecoded = decode_tlv(&out.data).unwrap();
        assert_eq!(decoded, redecoded);
    }

    #[test]
    fn test_inject_and_remove_field() {
        let mut tlv = TlvBuffer::new();
        tlv.write_struct(0).unwrap();
        tlv.write_struct(1).unwrap();
        tlv.write_uint8(2, 10).unwrap();
        tlv.write_struct_end().unwrap();
        tlv.write_struct_end().unwrap();
        let mut decoded = decode_tlv(&tlv.data).unwrap();

        // inject a new field one level down
        decoded
            .inject_field(
                &[1],
                TlvItem {
                    tag: 0xfe,
                    value: TlvItemValue::Int(3),
                },
            )
            .unwrap();
        assert_eq!(decoded.get_u8(&[1, 0xfe]), Some(3));

        // replacing keeps a single field with that tag
        decoded
            .inject_field(
                &[1],
                TlvItem {
                    tag: 0xfe,
                    value: TlvItemValue::Int(4),
                },
            )
            .unwrap();
        assert_eq!(decoded.get_u8(&[1, 0xfe]), Some(4));

        assert!(decoded.remove_field(&[1, 0xfe]));
        assert_eq!(decoded.get(&[1, 0xfe]), None);
        assert!(!decoded.remove_field(&[1, 0xfe]));

        // injecting into a scalar is a validation error
        assert!(decoded
            .inject_field(
                &[1, 2],
                TlvItem {
                    tag: 0,
                    value: TlvItemValue::Int(1)
                }
            )
            .is_err());
    }

    #[test]
    fn test_unknown_context_fields_are_preserved() {
        // readers skip unknown tags, the tree keeps them
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_uint8(1, 1).unwrap();
        tlv.write_uint8(77, 9).unwrap();
        tlv.write_struct_end().unwrap();
        let decoded = decode_tlv(&tlv.data).unwrap();
        assert_eq!(decoded.get_u8(&[1]), Some(1));
        assert_eq!(decoded.get_u8(&[77]), Some(9));
    }
}
