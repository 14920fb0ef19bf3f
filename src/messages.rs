//! Matter message and protocol header codec plus secure-channel payload
//! builders for the CASE exchange (sigma messages, acks, status reports).

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use std::io::{Read, Write};

use crate::tlv::{self, TlvItem};

#[derive(Debug)]
pub struct MessageHeader {
    pub flags: u8,
    pub security_flags: u8,
    pub session_id: u16,
    pub message_counter: u32,
    pub source_node_id: Option<Vec<u8>>,
    pub destination_node_id: Option<Vec<u8>>,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        if self.source_node_id.as_ref().is_some_and(|x| x.len() == 8) {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        if let Some(destination_node_id) = &self.destination_node_id {
            if destination_node_id.len() == 2 {
                flags |= Self::DSIZ_16
            } else if destination_node_id.len() == 8 {
                flags |= Self::DSIZ_64
            }
        }
        let mut out = Vec::with_capacity(64);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if let Some(sn) = &self.source_node_id {
            if sn.len() == 8 {
                out.write_all(sn)?;
            }
        }
        if let Some(destination_node_id) = &self.destination_node_id {
            out.write_all(destination_node_id)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let flags = cursor.read_u8()?;
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let source_node_id = if (flags & Self::FLAG_SRC_PRESENT) != 0 {
            let mut sn = vec![0; 8];
            cursor.read_exact(sn.as_mut())?;
            Some(sn)
        } else {
            None
        };
        let destination_node_id = match flags & 3 {
            Self::DSIZ_64 => {
                let mut dn = vec![0; 8];
                cursor.read_exact(dn.as_mut())?;
                Some(dn)
            }
            Self::DSIZ_16 => {
                let mut dn = vec![0; 2];
                cursor.read_exact(dn.as_mut())?;
                Some(dn)
            }
            _ => None,
        };
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                flags,
                security_flags,
                session_id,
                message_counter,
                source_node_id,
                destination_node_id,
            },
            rest,
        ))
    }
}

#[derive(Debug)]
pub struct ProtocolMessageHeader {
    pub exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub protocol_id: u16,
    pub ack_counter: u32,
}

impl ProtocolMessageHeader {
    pub const FLAG_INITIATOR: u8 = 1;
    pub const FLAG_ACK: u8 = 2;
    pub const FLAG_RELIABILITY: u8 = 4;

    pub const OPCODE_ACK: u8 = 0x10;
    pub const OPCODE_CASE_SIGMA1: u8 = 0x30;
    pub const OPCODE_CASE_SIGMA2: u8 = 0x31;
    pub const OPCODE_CASE_SIGMA3: u8 = 0x32;
    pub const OPCODE_CASE_SIGMA2_RESUME: u8 = 0x33;
    pub const OPCODE_STATUS: u8 = 0x40;

    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16);
        out.write_u8(self.exchange_flags)?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if (self.exchange_flags & Self::FLAG_ACK) != 0 {
            out.write_u32::<LittleEndian>(self.ack_counter)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let exchange_flags = cursor.read_u8()?;
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let mut ack_counter = 0;
        if (exchange_flags & Self::FLAG_ACK) != 0 {
            ack_counter = cursor.read_u32::<LittleEndian>()?;
        }
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                protocol_id,
                ack_counter,
            },
            rest,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    OutOfRange = 3,
    BadRequest = 4,
    Unsupported = 5,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    Continue = 10,
    Aborted = 11,
    InvalidArgument = 12,
    NotFound = 13,
    AlreadyExists = 14,
    PermissionDenied = 15,
    DataLoss = 16,
    MessageTooLarge = 17,
    Unknown = 0xffff,
}

impl From<u16> for GeneralCode {
    fn from(value: u16) -> Self {
        match value {
            0 => GeneralCode::Success,
            1 => GeneralCode::Failure,
            2 => GeneralCode::BadPrecondition,
            3 => GeneralCode::OutOfRange,
            4 => GeneralCode::BadRequest,
            5 => GeneralCode::Unsupported,
            6 => GeneralCode::Unexpected,
            7 => GeneralCode::ResourceExhausted,
            8 => GeneralCode::Busy,
            9 => GeneralCode::Timeout,
            10 => GeneralCode::Continue,
            11 => GeneralCode::Aborted,
            12 => GeneralCode::InvalidArgument,
            13 => GeneralCode::NotFound,
            14 => GeneralCode::AlreadyExists,
            15 => GeneralCode::PermissionDenied,
            16 => GeneralCode::DataLoss,
            17 => GeneralCode::MessageTooLarge,
            _ => GeneralCode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureChannelStatus {
    SessionEstablishmentSuccess = 0,
    NoSharedTrustRoots = 1,
    InvalidParameter = 2,
    CloseSession = 3,
    Busy = 4,
    Unknown = 0xffff,
}

impl From<u16> for SecureChannelStatus {
    fn from(value: u16) -> Self {
        match value {
            0 => SecureChannelStatus::SessionEstablishmentSuccess,
            1 => SecureChannelStatus::NoSharedTrustRoots,
            2 => SecureChannelStatus::InvalidParameter,
            3 => SecureChannelStatus::CloseSession,
            4 => SecureChannelStatus::Busy,
            _ => SecureChannelStatus::Unknown,
        }
    }
}

impl fmt::Display for SecureChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecureChannelStatus::SessionEstablishmentSuccess => {
                write!(f, "SESSION_ESTABLISHMENT_SUCCESS")
            }
            SecureChannelStatus::NoSharedTrustRoots => write!(f, "NO_SHARED_TRUST_ROOTS"),
            SecureChannelStatus::InvalidParameter => write!(f, "INVALID_PARAMETER"),
            SecureChannelStatus::CloseSession => write!(f, "CLOSE_SESSION"),
            SecureChannelStatus::Busy => write!(f, "BUSY"),
            SecureChannelStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusReportInfo {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl StatusReportInfo {
    pub fn success() -> Self {
        Self {
            general_code: GeneralCode::Success as u16,
            protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32,
            protocol_code: SecureChannelStatus::SessionEstablishmentSuccess as u16,
        }
    }
    pub fn error(status: SecureChannelStatus) -> Self {
        Self {
            general_code: GeneralCode::Failure as u16,
            protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32,
            protocol_code: status as u16,
        }
    }
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let general_code = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u32::<LittleEndian>()?;
        let protocol_code = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8);
        out.write_u16::<LittleEndian>(self.general_code)?;
        out.write_u32::<LittleEndian>(self.protocol_id)?;
        out.write_u16::<LittleEndian>(self.protocol_code)?;
        Ok(out)
    }
    pub fn is_ok(&self) -> bool {
        self.general_code == GeneralCode::Success as u16
    }
    pub fn secure_channel_status(&self) -> SecureChannelStatus {
        SecureChannelStatus::from(self.protocol_code)
    }
}

impl fmt::Display for StatusReportInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ok() {
            return write!(f, "StatusReport: OK");
        }
        write!(
            f,
            "StatusReport: general={:?} protocol_id={} code={}",
            GeneralCode::from(self.general_code),
            self.protocol_id,
            self.secure_channel_status()
        )
    }
}

/// Decoded matter message as seen by the exchange layer.
pub struct Message {
    pub message_header: MessageHeader,
    pub protocol_header: ProtocolMessageHeader,
    pub payload: Vec<u8>,
    pub tlv: Option<TlvItem>,
    pub status_report_info: Option<StatusReportInfo>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_header", &self.message_header)
            .field("protocol_header", &self.protocol_header)
            .field("payload", &hex::encode(&self.payload))
            .field("status_report_info", &self.status_report_info)
            .finish()
    }
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (message_header, rest) = MessageHeader::decode(data)?;
        let (protocol_header, rest) = ProtocolMessageHeader::decode(&rest)?;
        if (protocol_header.protocol_id == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL)
            && (protocol_header.opcode == ProtocolMessageHeader::OPCODE_STATUS)
        {
            let status_report_info = StatusReportInfo::parse(&rest)?;
            return Ok(Self {
                message_header,
                protocol_header,
                payload: rest,
                tlv: None,
                status_report_info: Some(status_report_info),
            });
        }
        // acks carry no payload; everything else on the secure channel is tlv
        let tlv = if rest.is_empty() {
            None
        } else {
            Some(tlv::decode_tlv(&rest)?)
        };
        Ok(Self {
            message_header,
            protocol_header,
            payload: rest,
            tlv,
            status_report_info: None,
        })
    }
}

fn secure_channel_message(
    opcode: u8,
    exchange: u16,
    payload: &[u8],
    initiator: bool,
    ack: Option<u32>,
) -> Result<Vec<u8>> {
    let mut flags = ProtocolMessageHeader::FLAG_RELIABILITY;
    if initiator {
        flags |= ProtocolMessageHeader::FLAG_INITIATOR;
    }
    if ack.is_some() {
        flags |= ProtocolMessageHeader::FLAG_ACK;
    }
    let mut b = ProtocolMessageHeader {
        exchange_flags: flags,
        opcode,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: ack.unwrap_or(0),
    }
    .encode()?;
    b.write_all(payload)?;
    Ok(b)
}

pub fn ack(exchange: u16, initiator: bool, ack_counter: u32) -> Result<Vec<u8>> {
    let mut flags = ProtocolMessageHeader::FLAG_ACK;
    if initiator {
        flags |= ProtocolMessageHeader::FLAG_INITIATOR;
    }
    ProtocolMessageHeader {
        exchange_flags: flags,
        opcode: ProtocolMessageHeader::OPCODE_ACK,
        exchange_id: exchange,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter,
    }
    .encode()
}

pub fn sigma1(exchange: u16, payload: &[u8]) -> Result<Vec<u8>> {
    secure_channel_message(
        ProtocolMessageHeader::OPCODE_CASE_SIGMA1,
        exchange,
        payload,
        true,
        None,
    )
}

pub fn sigma2(exchange: u16, payload: &[u8], ack: u32) -> Result<Vec<u8>> {
    secure_channel_message(
        ProtocolMessageHeader::OPCODE_CASE_SIGMA2,
        exchange,
        payload,
        false,
        Some(ack),
    )
}

pub fn sigma2_resume(exchange: u16, payload: &[u8], ack: u32) -> Result<Vec<u8>> {
    secure_channel_message(
        ProtocolMessageHeader::OPCODE_CASE_SIGMA2_RESUME,
        exchange,
        payload,
        false,
        Some(ack),
    )
}

pub fn sigma3(exchange: u16, payload: &[u8], ack: u32) -> Result<Vec<u8>> {
    secure_channel_message(
        ProtocolMessageHeader::OPCODE_CASE_SIGMA3,
        exchange,
        payload,
        true,
        Some(ack),
    )
}

pub fn status_report(
    exchange: u16,
    info: &StatusReportInfo,
    initiator: bool,
    ack: Option<u32>,
) -> Result<Vec<u8>> {
    secure_channel_message(
        ProtocolMessageHeader::OPCODE_STATUS,
        exchange,
        &info.encode()?,
        initiator,
        ack,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_header_roundtrip() {
        let h = MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: 0x1234,
            message_counter: 77,
            source_node_id: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            destination_node_id: Some(vec![8, 7, 6, 5, 4, 3, 2, 1]),
        };
        let bytes = h.encode().unwrap();
        let (back, rest) = MessageHeader::decode(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(back.session_id, 0x1234);
        assert_eq!(back.message_counter, 77);
        assert_eq!(back.source_node_id, h.source_node_id);
        assert_eq!(back.destination_node_id, h.destination_node_id);
    }

    #[test]
    fn test_decode_reference_message() {
        // unsecured sigma-style frame captured from a real exchange
        let msg = "04000000a5a0b90d3320764c7d52ef86052060d5000015300120cabe444262d4e5dd568c755ed77e0829b9983c4d62b480b579811ec383eb69c625020837240300280418";
        let msg = hex::decode(msg).unwrap();
        let m = Message::decode(&msg).unwrap();
        assert_eq!(
            m.protocol_header.protocol_id,
            ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
        );
        assert!(m.tlv.is_some());
    }

    #[test]
    fn test_status_report_roundtrip() {
        let info = StatusReportInfo::error(SecureChannelStatus::NoSharedTrustRoots);
        let bytes = status_report(9, &info, false, Some(5)).unwrap();
        let mut framed = MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: 0,
            message_counter: 1,
            source_node_id: None,
            destination_node_id: None,
        }
        .encode()
        .unwrap();
        framed.extend_from_slice(&bytes);
        let m = Message::decode(&framed).unwrap();
        let sri = m.status_report_info.unwrap();
        assert!(!sri.is_ok());
        assert_eq!(
            sri.secure_channel_status(),
            SecureChannelStatus::NoSharedTrustRoots
        );
        assert_eq!(m.protocol_header.ack_counter, 5);

        let ok = StatusReportInfo::success();
        assert!(ok.is_ok());
        assert_eq!(hex::encode(ok.encode().unwrap()), "0000000000000000");
    }

    #[test]
    fn test_sigma_builders_set_flags() {
        let s1 = sigma1(0x42, &[0x15, 0x18]).unwrap();
        let (h, rest) = ProtocolMessageHeader::decode(&s1).unwrap();
        assert_eq!(h.opcode, ProtocolMessageHeader::OPCODE_CASE_SIGMA1);
        assert_ne!(h.exchange_flags & ProtocolMessageHeader::FLAG_INITIATOR, 0);
        assert_eq!(rest, vec![0x15, 0x18]);

        let s2 = sigma2_resume(0x42, &[0x15, 0x18], 3).unwrap();
        let (h, _) = ProtocolMessageHeader::decode(&s2).unwrap();
        assert_eq!(h.opcode, ProtocolMessageHeader::OPCODE_CASE_SIGMA2_RESUME);
        assert_eq!(h.exchange_flags & ProtocolMessageHeader::FLAG_INITIATOR, 0);
        assert_eq!(h.ack_counter, 3);
    }
}
