//! Handling of certificates in matter format.
//!
//! Matter carries operational certificates as tlv. The signature inside a
//! matter certificate covers the DER TBSCertificate of the equivalent X.509
//! certificate, so verification reconstructs that TBS byte-exactly from the
//! tlv fields before checking the ECDSA signature. The same DER profile is
//! used to generate chains for fabrics created in tests.

use anyhow::{Context, Result};

use crate::error::MatterError;
use crate::tlv::{self, TlvBuffer, TlvItemValue};
use crate::util::{asn1, cryptoutil};

/// Offset between the matter epoch (2000-01-01) and the unix epoch.
pub const MATTER_EPOCH_OFFSET: u64 = 946684800;

const TAG_SERIAL: u8 = 1;
const TAG_SIG_ALGO: u8 = 2;
const TAG_ISSUER: u8 = 3;
const TAG_NOT_BEFORE: u8 = 4;
const TAG_NOT_AFTER: u8 = 5;
const TAG_SUBJECT: u8 = 6;
const TAG_PUBKEY_ALGO: u8 = 7;
const TAG_CURVE: u8 = 8;
const TAG_PUBLIC_KEY: u8 = 9;
const TAG_EXTENSIONS: u8 = 10;
const TAG_SIGNATURE: u8 = 11;

const EXT_TAG_BASIC_CONSTRAINTS: u8 = 1;
const EXT_TAG_KEY_USAGE: u8 = 2;
const EXT_TAG_EXT_KEY_USAGE: u8 = 3;
const EXT_TAG_SUBJECT_KEY_ID: u8 = 4;
const EXT_TAG_AUTHORITY_KEY_ID: u8 = 5;

// dn attribute tags inside issuer/subject lists
const DN_TAG_NODE_ID: u8 = 17;
const DN_TAG_CA_ID: u8 = 20;
const DN_TAG_FABRIC_ID: u8 = 21;

const OID_MATTER_DN_NODE: &str = "1.3.6.1.4.1.37244.1.1";
const OID_MATTER_DN_CA: &str = "1.3.6.1.4.1.37244.1.4";
const OID_MATTER_DN_FABRIC: &str = "1.3.6.1.4.1.37244.1.5";
const OID_SIG_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_EC_P256: &str = "1.2.840.10045.3.1.7";
const OID_KP_SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";
const OID_KP_CLIENT_AUTH: &str = "1.3.6.1.5.5.7.3.2";
const OID_CE_SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
const OID_CE_KEY_USAGE: &str = "2.5.29.15";
const OID_CE_BASIC_CONSTRAINTS: &str = "2.5.29.19";
const OID_CE_EXT_KEY_USAGE: &str = "2.5.29.37";
const OID_CE_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";

pub const KEY_USAGE_DIGITAL_SIGNATURE: u8 = 0x01;
pub const KEY_USAGE_KEY_CERT_SIGN: u8 = 0x20;
pub const KEY_USAGE_CRL_SIGN: u8 = 0x40;

/// One attribute of a matter distinguished name, in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnValue {
    NodeId(u64),
    CaId(u64),
    FabricId(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatterCert {
    pub serial: Vec<u8>,
    pub issuer: Vec<DnValue>,
    pub subject: Vec<DnValue>,
    /// Seconds since the matter epoch.
    pub not_before: u32,
    /// Seconds since the matter epoch; 0 means no expiry.
    pub not_after: u32,
    /// Uncompressed SEC1 point, 65 bytes.
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    pub key_usage: u8,
    /// 1 = server auth, 2 = client auth, in list order.
    pub ext_key_usage: Vec<u8>,
    pub subject_key_id: Vec<u8>,
    pub authority_key_id: Vec<u8>,
    /// Raw r||s, 64 bytes.
    pub signature: Vec<u8>,
}

impl MatterCert {
    pub fn subject_node_id(&self) -> Option<u64> {
        self.subject.iter().find_map(|d| match d {
            DnValue::NodeId(id) => Some(*id),
            _ => None,
        })
    }
    pub fn subject_fabric_id(&self) -> Option<u64> {
        self.subject.iter().find_map(|d| match d {
            DnValue::FabricId(id) => Some(*id),
            _ => None,
        })
    }
    /// Timeliness per the certificate validity window. `not_after == 0`
    /// means the certificate never expires.
    pub fn is_time_valid(&self, unix_now: u64) -> bool {
        let now = unix_now.saturating_sub(MATTER_EPOCH_OFFSET);
        if now < self.not_before as u64 {
            return false;
        }
        self.not_after == 0 || now <= self.not_after as u64
    }
}

fn decode_dn_list(item: &tlv::TlvItem) -> Result<Vec<DnValue>> {
    let TlvItemValue::List(entries) = &item.value else {
        return Err(MatterError::UnexpectedData("certificate dn is not a list".into()).into());
    };
    let mut out = Vec::new();
    for e in entries {
        let TlvItemValue::Int(v) = e.value else {
            continue;
        };
        match e.tag {
            DN_TAG_NODE_ID => out.push(DnValue::NodeId(v)),
            DN_TAG_CA_ID => out.push(DnValue::CaId(v)),
            DN_TAG_FABRIC_ID => out.push(DnValue::FabricId(v)),
            _ => {} // unknown dn attributes are skipped
        }
    }
    Ok(out)
}

/// Decode a certificate from its matter tlv form.
pub fn decode(data: &[u8]) -> Result<MatterCert> {
    let root = tlv::decode_tlv(data)?;
    let serial = root
        .get_octet_string_owned(&[TAG_SERIAL])
        .context("certificate serial missing")?;
    let issuer = decode_dn_list(
        root.get_item(&[TAG_ISSUER])
            .context("certificate issuer missing")?,
    )?;
    let subject = decode_dn_list(
        root.get_item(&[TAG_SUBJECT])
            .context("certificate subject missing")?,
    )?;
    let not_before = root
        .get_u32(&[TAG_NOT_BEFORE])
        .context("certificate notBefore missing")?;
    let not_after = root
        .get_u32(&[TAG_NOT_AFTER])
        .context("certificate notAfter missing")?;
    let public_key = root
        .get_octet_string_owned(&[TAG_PUBLIC_KEY])
        .context("certificate public key missing")?;
    if public_key.len() != 65 {
        return Err(MatterError::Validation(format!(
            "certificate public key length {}",
            public_key.len()
        ))
        .into());
    }
    let is_ca = root
        .get_bool(&[TAG_EXTENSIONS, EXT_TAG_BASIC_CONSTRAINTS, 1])
        .unwrap_or(false);
    let key_usage = root
        .get_u8(&[TAG_EXTENSIONS, EXT_TAG_KEY_USAGE])
        .context("certificate key usage missing")?;
    let ext_key_usage = match root.get(&[TAG_EXTENSIONS, EXT_TAG_EXT_KEY_USAGE]) {
        Some(TlvItemValue::List(items)) => items
            .iter()
            .filter_map(|i| match i.value {
                TlvItemValue::Int(v) => Some(v as u8),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let subject_key_id = root
        .get_octet_string_owned(&[TAG_EXTENSIONS, EXT_TAG_SUBJECT_KEY_ID])
        .context("certificate subject key id missing")?;
    let authority_key_id = root
        .get_octet_string_owned(&[TAG_EXTENSIONS, EXT_TAG_AUTHORITY_KEY_ID])
        .context("certificate authority key id missing")?;
    let signature = root
        .get_octet_string_owned(&[TAG_SIGNATURE])
        .context("certificate signature missing")?;
    if signature.len() != 64 {
        return Err(MatterError::Validation(format!(
            "certificate signature length {}",
            signature.len()
        ))
        .into());
    }
    Ok(MatterCert {
        serial,
        issuer,
        subject,
        not_before,
        not_after,
        public_key,
        is_ca,
        key_usage,
        ext_key_usage,
        subject_key_id,
        authority_key_id,
        signature,
    })
}

/// Encode a certificate into its matter tlv form.
pub fn encode(cert: &MatterCert) -> Result<Vec<u8>> {
    let mut enc = TlvBuffer::new();
    enc.write_anon_struct()?;
    enc.write_octetstring(TAG_SERIAL, &cert.serial)?;
    enc.write_uint8(TAG_SIG_ALGO, 1)?;
    enc.write_list(TAG_ISSUER)?;
    write_dn_list(&mut enc, &cert.issuer)?;
    enc.write_struct_end()?;
    enc.write_uint32(TAG_NOT_BEFORE, cert.not_before)?;
    enc.write_uint32(TAG_NOT_AFTER, cert.not_after)?;
    enc.write_list(TAG_SUBJECT)?;
    write_dn_list(&mut enc, &cert.subject)?;
    enc.write_struct_end()?;
    enc.write_uint8(TAG_PUBKEY_ALGO, 1)?;
    enc.write_uint8(TAG_CURVE, 1)?;
    enc.write_octetstring(TAG_PUBLIC_KEY, &cert.public_key)?;
    enc.write_list(TAG_EXTENSIONS)?;
    enc.write_struct(EXT_TAG_BASIC_CONSTRAINTS)?;
    enc.write_bool(1, cert.is_ca)?;
    enc.write_struct_end()?;
    enc.write_uint8(EXT_TAG_KEY_USAGE, cert.key_usage)?;
    if !cert.ext_key_usage.is_empty() {
        enc.write_array(EXT_TAG_EXT_KEY_USAGE)?;
        for u in &cert.ext_key_usage {
            enc.write_uint8_notag(*u)?;
        }
        enc.write_struct_end()?;
    }
    enc.write_octetstring(EXT_TAG_SUBJECT_KEY_ID, &cert.subject_key_id)?;
    enc.write_octetstring(EXT_TAG_AUTHORITY_KEY_ID, &cert.authority_key_id)?;
    enc.write_struct_end()?;
    enc.write_octetstring(TAG_SIGNATURE, &cert.signature)?;
    enc.write_struct_end()?;
    Ok(enc.data)
}

fn write_dn_list(enc: &mut TlvBuffer, dns: &[DnValue]) -> Result<()> {
    for dn in dns {
        match dn {
            DnValue::NodeId(id) => enc.write_uint64(DN_TAG_NODE_ID, *id)?,
            DnValue::CaId(id) => enc.write_uint64(DN_TAG_CA_ID, *id)?,
            DnValue::FabricId(id) => enc.write_uint64(DN_TAG_FABRIC_ID, *id)?,
        }
    }
    Ok(())
}

fn encode_dn_hex(id: u64) -> String {
    format!("{:0>16X}", id)
}

fn add_rdn(encoder: &mut asn1::Encoder, oid: &str, id: u64) -> Result<()> {
    encoder.start_seq(0x31)?; // rdn set
    encoder.start_seq(0x30)?; // attribute
    encoder.write_oid(oid)?;
    encoder.write_string(&encode_dn_hex(id))?;
    encoder.end_seq();
    encoder.end_seq();
    Ok(())
}

fn add_name(encoder: &mut asn1::Encoder, dns: &[DnValue]) -> Result<()> {
    encoder.start_seq(0x30)?;
    for dn in dns {
        match dn {
            DnValue::NodeId(id) => add_rdn(encoder, OID_MATTER_DN_NODE, *id)?,
            DnValue::CaId(id) => add_rdn(encoder, OID_MATTER_DN_CA, *id)?,
            DnValue::FabricId(id) => add_rdn(encoder, OID_MATTER_DN_FABRIC, *id)?,
        }
    }
    encoder.end_seq();
    Ok(())
}

fn add_ext(encoder: &mut asn1::Encoder, oid: &str, critical: bool, value: &[u8]) -> Result<()> {
    encoder.start_seq(0x30)?;
    encoder.write_oid(oid)?;
    if critical {
        encoder.write_bool(true)?;
    }
    encoder.write_octet_string(value)?;
    encoder.end_seq();
    Ok(())
}

// days-to-civil conversion (Gregorian, proleptic)
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn x509_time(unix_secs: u64) -> String {
    let days = (unix_secs / 86400) as i64;
    let rem = unix_secs % 86400;
    let (year, month, day) = civil_from_days(days);
    let (h, mi, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    if (1950..2050).contains(&year) {
        format!(
            "{:02}{:02}{:02}{:02}{:02}{:02}Z",
            year % 100,
            month,
            day,
            h,
            mi,
            s
        )
    } else {
        format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}Z",
            year, month, day, h, mi, s
        )
    }
}

fn add_time(encoder: &mut asn1::Encoder, matter_secs: u32, no_expiry_hint: bool) -> Result<()> {
    if no_expiry_hint && matter_secs == 0 {
        // X.509 convention for "no well-defined expiry"
        encoder.write_string_with_tag(0x18, "99991231235959Z")?;
        return Ok(());
    }
    let unix = matter_secs as u64 + MATTER_EPOCH_OFFSET;
    let s = x509_time(unix);
    let tag = if s.len() == 13 { 0x17 } else { 0x18 };
    encoder.write_string_with_tag(tag, &s)?;
    Ok(())
}

/// Rebuild the DER TBSCertificate the certificate signature covers.
pub fn to_x509_tbs(cert: &MatterCert) -> Result<Vec<u8>> {
    let mut encoder = asn1::Encoder::new();
    encoder.start_seq(0x30)?;

    encoder.start_seq(0xa0)?;
    encoder.write_int(2)?; // version 3
    encoder.end_seq();

    encoder.write_int_bytes(&cert.serial)?;

    encoder.start_seq(0x30)?;
    encoder.write_oid(OID_SIG_ECDSA_WITH_SHA256)?;
    encoder.end_seq();

    add_name(&mut encoder, &cert.issuer)?;

    encoder.start_seq(0x30)?;
    add_time(&mut encoder, cert.not_before, false)?;
    add_time(&mut encoder, cert.not_after, true)?;
    encoder.end_seq();

    add_name(&mut encoder, &cert.subject)?;

    encoder.start_seq(0x30)?; // subject public key info
    encoder.start_seq(0x30)?;
    encoder.write_oid(OID_EC_PUBLIC_KEY)?;
    encoder.write_oid(OID_EC_P256)?;
    encoder.end_seq();
    encoder.write_bit_string(&cert.public_key)?;
    encoder.end_seq();

    encoder.start_seq(0xa3)?;
    encoder.start_seq(0x30)?;
    if cert.is_ca {
        add_ext(
            &mut encoder,
            OID_CE_BASIC_CONSTRAINTS,
            true,
            &[0x30, 0x03, 0x01, 0x01, 0xff],
        )?;
    } else {
        add_ext(&mut encoder, OID_CE_BASIC_CONSTRAINTS, true, &[0x30, 0x00])?;
    }
    {
        // DER BIT STRING bit i (msb first) carries key-usage flag bit i
        let der_byte = cert.key_usage.reverse_bits();
        let unused = der_byte.trailing_zeros().min(7) as u8;
        add_ext(
            &mut encoder,
            OID_CE_KEY_USAGE,
            true,
            &[0x03, 0x02, unused, der_byte],
        )?;
    }
    if !cert.ext_key_usage.is_empty() {
        let mut eku = asn1::Encoder::new();
        eku.start_seq(0x30)?;
        for u in &cert.ext_key_usage {
            match u {
                1 => eku.write_oid(OID_KP_SERVER_AUTH)?,
                2 => eku.write_oid(OID_KP_CLIENT_AUTH)?,
                other => {
                    return Err(MatterError::Validation(format!(
                        "unsupported extended key usage {}",
                        other
                    ))
                    .into())
                }
            }
        }
        eku.end_seq();
        add_ext(&mut encoder, OID_CE_EXT_KEY_USAGE, true, &eku.encode())?;
    }
    {
        let mut ski = asn1::Encoder::new();
        ski.write_octet_string(&cert.subject_key_id)?;
        add_ext(
            &mut encoder,
            OID_CE_SUBJECT_KEY_IDENTIFIER,
            false,
            &ski.encode(),
        )?;
    }
    {
        let mut aki = asn1::Encoder::new();
        aki.start_seq(0x30)?;
        aki.write_octet_string_with_tag(0x80, &cert.authority_key_id)?;
        aki.end_seq();
        add_ext(
            &mut encoder,
            OID_CE_AUTHORITY_KEY_IDENTIFIER,
            false,
            &aki.encode(),
        )?;
    }
    encoder.end_seq();
    encoder.end_seq();

    encoder.end_seq();
    Ok(encoder.encode())
}

/// Verify `cert`'s signature against its issuer's public key.
pub fn verify_signature(cert: &MatterCert, issuer_public_key: &[u8]) -> Result<()> {
    let tbs = to_x509_tbs(cert)?;
    cryptoutil::verify(issuer_public_key, &tbs, &cert.signature)
        .map_err(|_| MatterError::CertChainInvalid("certificate signature".into()))?;
    Ok(())
}

fn key_id(public_key: &[u8]) -> Vec<u8> {
    cryptoutil::sha256(public_key)[..20].to_vec()
}

fn sign_cert(cert: &mut MatterCert, issuer_key: &p256::SecretKey) -> Result<()> {
    let tbs = to_x509_tbs(cert)?;
    cert.signature = cryptoutil::sign(issuer_key, &tbs)?;
    Ok(())
}

/// Build a self-signed root certificate (test chains and fabric bootstrap).
pub fn generate_root(ca_id: u64, ca_key: &p256::SecretKey) -> Result<MatterCert> {
    let public_key = ca_key.public_key().to_sec1_bytes().to_vec();
    let skid = key_id(&public_key);
    let mut cert = MatterCert {
        serial: vec![0x27, 0x11],
        issuer: vec![DnValue::CaId(ca_id)],
        subject: vec![DnValue::CaId(ca_id)],
        not_before: 1,
        not_after: 0,
        public_key,
        is_ca: true,
        key_usage: KEY_USAGE_KEY_CERT_SIGN | KEY_USAGE_CRL_SIGN,
        ext_key_usage: Vec::new(),
        subject_key_id: skid.clone(),
        authority_key_id: skid,
        signature: Vec::new(),
    };
    sign_cert(&mut cert, ca_key)?;
    Ok(cert)
}

/// Build a node operational certificate signed by `issuer_key`.
pub fn generate_noc(
    node_id: u64,
    fabric_id: u64,
    node_public_key: &[u8],
    issuer: &MatterCert,
    issuer_key: &p256::SecretKey,
) -> Result<MatterCert> {
    let issuer_ca_id = issuer
        .subject
        .iter()
        .find_map(|d| match d {
            DnValue::CaId(id) => Some(*id),
            _ => None,
        })
        .context("issuer certificate has no ca id")?;
    let mut cert = MatterCert {
        serial: vec![0x27, 0x12],
        issuer: vec![DnValue::CaId(issuer_ca_id)],
        subject: vec![DnValue::NodeId(node_id), DnValue::FabricId(fabric_id)],
        not_before: 1,
        not_after: 0,
        public_key: node_public_key.to_vec(),
        is_ca: false,
        key_usage: KEY_USAGE_DIGITAL_SIGNATURE,
        ext_key_usage: vec![2, 1],
        subject_key_id: key_id(node_public_key),
        authority_key_id: issuer.subject_key_id.clone(),
        signature: Vec::new(),
    };
    sign_cert(&mut cert, issuer_key)?;
    Ok(cert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_formatting() {
        // 2020-06-15 12:30:45 UTC
        assert_eq!(x509_time(1592224245), "200615123045Z");
        // 2050 rolls over to generalized time
        assert_eq!(x509_time(2524608000), "20500101000000Z");
    }

    #[test]
    fn test_tlv_roundtrip() {
        let ca_key = p256::SecretKey::random(&mut rand::thread_rng());
        let root = generate_root(1, &ca_key).unwrap();
        let bytes = encode(&root).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back, root);
        assert!(back.is_ca);
        assert_eq!(back.subject, vec![DnValue::CaId(1)]);
    }

    #[test]
    fn test_chain_verifies() {
        let ca_key = p256::SecretKey::random(&mut rand::thread_rng());
        let root = generate_root(1, &ca_key).unwrap();
        // root is self-signed
        verify_signature(&root, &root.public_key).unwrap();

        let node_key = p256::SecretKey::random(&mut rand::thread_rng());
        let noc = generate_noc(
            0xDEADBEEF,
            0x1000,
            &node_key.public_key().to_sec1_bytes(),
            &root,
            &ca_key,
        )
        .unwrap();
        verify_signature(&noc, &root.public_key).unwrap();
        assert_eq!(noc.subject_node_id(), Some(0xDEADBEEF));
        assert_eq!(noc.subject_fabric_id(), Some(0x1000));
        assert!(!noc.is_ca);
    }

    #[test]
    fn test_tampered_cert_rejected() {
        let ca_key = p256::SecretKey::random(&mut rand::thread_rng());
        let root = generate_root(1, &ca_key).unwrap();
        let node_key = p256::SecretKey::random(&mut rand::thread_rng());
        let mut noc = generate_noc(
            77,
            0x1000,
            &node_key.public_key().to_sec1_bytes(),
            &root,
            &ca_key,
        )
        .unwrap();
        // claim a different node id after signing
        noc.subject = vec![DnValue::NodeId(78), DnValue::FabricId(0x1000)];
        assert!(verify_signature(&noc, &root.public_key).is_err());
        // wrong trust anchor
        let other = p256::SecretKey::random(&mut rand::thread_rng());
        let noc2 = generate_noc(
            77,
            0x1000,
            &node_key.public_key().to_sec1_bytes(),
            &root,
            &ca_key,
        )
        .unwrap();
        assert!(
            verify_signature(&noc2, &other.public_key().to_sec1_bytes()).is_err()
        );
    }

    #[test]
    fn test_time_validity_window() {
        let ca_key = p256::SecretKey::random(&mut rand::thread_rng());
        let mut root = generate_root(1, &ca_key).unwrap();
        root.not_before = 100;
        root.not_after = 200;
        assert!(!root.is_time_valid(MATTER_EPOCH_OFFSET + 50));
        assert!(root.is_time_valid(MATTER_EPOCH_OFFSET + 150));
        assert!(!root.is_time_valid(MATTER_EPOCH_OFFSET + 250));
        root.not_after = 0;
        assert!(root.is_time_valid(MATTER_EPOCH_OFFSET + 1_000_000_000));
    }
}
