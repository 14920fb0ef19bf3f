//! Secure session records, AES-CCM message protection, session-id
//! allocation and the durable resumption-record store.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::MatterError;
use crate::messages::MessageHeader;
use crate::timer;
use crate::util::cryptoutil;

pub const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";
pub const SESSION_RESUMPTION_KEYS_INFO: &[u8] = b"SessionResumptionKeys";

pub const RESUMPTION_ID_LEN: usize = 16;

/// MRP session parameters. Defaults are the well-known values used when the
/// peer does not negotiate its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParameters {
    pub idle_interval_ms: u32,
    pub active_interval_ms: u32,
    pub active_threshold_ms: u32,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            idle_interval_ms: 500,
            active_interval_ms: 300,
            active_threshold_ms: 4000,
        }
    }
}

/// Established secure session with both traffic keys and the attestation
/// challenge derived from the handshake transcript.
pub struct SecureSession {
    pub local_session_id: u16,
    pub peer_session_id: u16,
    pub fabric_index: u8,
    pub local_node_id: u64,
    pub peer_node_id: u64,
    pub shared_secret: Vec<u8>,
    encrypt_key: Vec<u8>,
    decrypt_key: Vec<u8>,
    pub attestation_challenge: Vec<u8>,
    pub is_initiator: bool,
    pub is_resumption: bool,
    pub session_parameters: SessionParameters,
    pub created_at_ms: u64,
    last_activity_ms: AtomicU64,
    counter: AtomicU32,
}

pub struct SessionKeyMaterial {
    pub salt: Vec<u8>,
    pub shared_secret: Vec<u8>,
    /// [SESSION_KEYS_INFO] for the full handshake,
    /// [SESSION_RESUMPTION_KEYS_INFO] on the resumption branch.
    pub info: &'static [u8],
}

impl SecureSession {
    /// Derive i2r/r2i keys and the attestation challenge (48 bytes split
    /// 16/16/16) and assemble the session record.
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        material: &SessionKeyMaterial,
        local_session_id: u16,
        peer_session_id: u16,
        fabric_index: u8,
        local_node_id: u64,
        peer_node_id: u64,
        is_initiator: bool,
        is_resumption: bool,
        session_parameters: SessionParameters,
    ) -> Result<Self> {
        let keypack = cryptoutil::hkdf_sha256(
            &material.salt,
            &material.shared_secret,
            material.info,
            48,
        )?;
        let i2r = keypack[0..16].to_vec();
        let r2i = keypack[16..32].to_vec();
        let attestation_challenge = keypack[32..48].to_vec();
        let (encrypt_key, decrypt_key) = if is_initiator { (i2r, r2i) } else { (r2i, i2r) };
        let now = timer::now_ms();
        Ok(Self {
            local_session_id,
            peer_session_id,
            fabric_index,
            local_node_id,
            peer_node_id,
            shared_secret: material.shared_secret.clone(),
            encrypt_key,
            decrypt_key,
            attestation_challenge,
            is_initiator,
            is_resumption,
            session_parameters,
            created_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
            counter: AtomicU32::new(rand::random()),
        })
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(timer::now_ms(), Ordering::Relaxed);
    }

    fn make_nonce(counter: u32, node_id: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(13);
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(counter)?;
        out.write_u64::<LittleEndian>(node_id)?;
        Ok(out)
    }

    /// Frame and encrypt an application payload for the peer.
    pub fn encode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let header = MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: self.peer_session_id,
            message_counter: counter,
            source_node_id: None,
            destination_node_id: None,
        };
        let mut out = header.encode()?;
        let nonce = Self::make_nonce(counter, self.local_node_id)?;
        let encrypted = cryptoutil::aes128_ccm_encrypt(&self.encrypt_key, &nonce, &out, data)?;
        out.extend_from_slice(&encrypted);
        self.touch();
        Ok(out)
    }

    /// Decrypt an inbound frame addressed to this session. Returns header
    /// bytes plus plaintext, matching what [encode_message] consumed.
    pub fn decode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (header, rest) = MessageHeader::decode(data)?;
        if header.session_id != self.local_session_id {
            return Err(MatterError::UnexpectedData(format!(
                "session id mismatch: expected {} got {}",
                self.local_session_id, header.session_id
            ))
            .into());
        }
        let nonce = Self::make_nonce(header.message_counter, self.peer_node_id)?;
        let aad = &data[..data.len() - rest.len()];
        let decoded = cryptoutil::aes128_ccm_decrypt(&self.decrypt_key, &nonce, aad, &rest)?;
        let mut out = Vec::with_capacity(aad.len() + decoded.len());
        out.extend_from_slice(aad);
        out.extend_from_slice(&decoded);
        self.touch();
        Ok(out)
    }
}

/// Owns the table of active secure sessions and hands out local session ids.
pub struct SessionManager {
    sessions: Mutex<HashMap<u16, Arc<SecureSession>>>,
    next_id: AtomicU32,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    /// Allocate a session id that is non-zero and not used by any active
    /// session.
    pub fn next_available_session_id(&self) -> u16 {
        let sessions = self.sessions.lock().unwrap();
        loop {
            let candidate = (self.next_id.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16;
            if candidate == 0 {
                continue;
            }
            if !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn add(&self, session: Arc<SecureSession>) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.local_session_id, session);
    }

    pub fn get(&self, local_session_id: u16) -> Option<Arc<SecureSession>> {
        self.sessions.lock().unwrap().get(&local_session_id).cloned()
    }

    pub fn remove(&self, local_session_id: u16) -> Option<Arc<SecureSession>> {
        self.sessions.lock().unwrap().remove(&local_session_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

/// Material allowing a short sigma1/sigma2-resume exchange to re-derive a
/// session without re-signing certificates. Rotated on every reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionRecord {
    pub resumption_id: Vec<u8>,
    pub shared_secret: Vec<u8>,
    pub fabric_index: u8,
    pub peer_node_id: u64,
    pub session_parameters: SessionParameters,
}

/// Durable storage for resumption records. Writes are serialized by the
/// store; at most one record is kept per (fabric, peer node).
pub trait ResumptionStore: Send + Sync {
    fn save(&self, record: ResumptionRecord) -> Result<()>;
    fn find_by_resumption_id(&self, resumption_id: &[u8]) -> Result<Option<ResumptionRecord>>;
    fn find_by_node(&self, fabric_index: u8, peer_node_id: u64) -> Result<Option<ResumptionRecord>>;
    /// Lazy GC when a fabric is removed.
    fn remove_fabric(&self, fabric_index: u8) -> Result<()>;
}

pub struct MemResumptionStore {
    records: Mutex<Vec<ResumptionRecord>>,
}

impl MemResumptionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }
}

impl ResumptionStore for MemResumptionStore {
    fn save(&self, record: ResumptionRecord) -> Result<()> {
        if record.resumption_id.len() != RESUMPTION_ID_LEN {
            return Err(MatterError::Validation("resumption id must be 16 bytes".into()).into());
        }
        let mut records = self.records.lock().unwrap();
        records.retain(|r| {
            !(r.fabric_index == record.fabric_index && r.peer_node_id == record.peer_node_id)
        });
        records.push(record);
        Ok(())
    }
    fn find_by_resumption_id(&self, resumption_id: &[u8]) -> Result<Option<ResumptionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| cryptoutil::ct_equal(&r.resumption_id, resumption_id))
            .cloned())
    }
    fn find_by_node(&self, fabric_index: u8, peer_node_id: u64) -> Result<Option<ResumptionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.fabric_index == fabric_index && r.peer_node_id == peer_node_id)
            .cloned())
    }
    fn remove_fabric(&self, fabric_index: u8) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .retain(|r| r.fabric_index != fabric_index);
        Ok(())
    }
}

const RESUMPTION_FILE_VERSION: u8 = 1;

/// File-backed store: versioned binary records, rewritten atomically on each
/// save.
pub struct FileResumptionStore {
    path: String,
    records: Mutex<Vec<ResumptionRecord>>,
}

impl FileResumptionStore {
    pub fn open(path: &str) -> Result<Arc<Self>> {
        let records = match std::fs::read(path) {
            Ok(data) => Self::parse(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context(format!("reading resumption store {}", path)),
        };
        Ok(Arc::new(Self {
            path: path.to_owned(),
            records: Mutex::new(records),
        }))
    }

    fn parse(data: &[u8]) -> Result<Vec<ResumptionRecord>> {
        let mut cursor = std::io::Cursor::new(data);
        let version = cursor.read_u8()?;
        if version != RESUMPTION_FILE_VERSION {
            return Err(MatterError::Validation(format!(
                "resumption store version {} not supported",
                version
            ))
            .into());
        }
        let count = cursor.read_u16::<LittleEndian>()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let fabric_index = cursor.read_u8()?;
            let peer_node_id = cursor.read_u64::<LittleEndian>()?;
            let mut resumption_id = vec![0; RESUMPTION_ID_LEN];
            cursor.read_exact(&mut resumption_id)?;
            let secret_len = cursor.read_u8()? as usize;
            let mut shared_secret = vec![0; secret_len];
            cursor.read_exact(&mut shared_secret)?;
            let session_parameters = SessionParameters {
                idle_interval_ms: cursor.read_u32::<LittleEndian>()?,
                active_interval_ms: cursor.read_u32::<LittleEndian>()?,
                active_threshold_ms: cursor.read_u32::<LittleEndian>()?,
            };
            out.push(ResumptionRecord {
                resumption_id,
                shared_secret,
                fabric_index,
                peer_node_id,
                session_parameters,
            });
        }
        Ok(out)
    }

    fn persist(&self, records: &[ResumptionRecord]) -> Result<()> {
        let mut out = Vec::new();
        out.write_u8(RESUMPTION_FILE_VERSION)?;
        out.write_u16::<LittleEndian>(records.len() as u16)?;
        for r in records {
            out.write_u8(r.fabric_index)?;
            out.write_u64::<LittleEndian>(r.peer_node_id)?;
            out.write_all(&r.resumption_id)?;
            out.write_u8(r.shared_secret.len() as u8)?;
            out.write_all(&r.shared_secret)?;
            out.write_u32::<LittleEndian>(r.session_parameters.idle_interval_ms)?;
            out.write_u32::<LittleEndian>(r.session_parameters.active_interval_ms)?;
            out.write_u32::<LittleEndian>(r.session_parameters.active_threshold_ms)?;
        }
        let tmp = format!("{}.tmp", self.path);
        std::fs::write(&tmp, &out).context("writing resumption store")?;
        std::fs::rename(&tmp, &self.path).context("replacing resumption store")?;
        Ok(())
    }
}

impl ResumptionStore for FileResumptionStore {
    fn save(&self, record: ResumptionRecord) -> Result<()> {
        if record.resumption_id.len() != RESUMPTION_ID_LEN {
            return Err(MatterError::Validation("resumption id must be 16 bytes".into()).into());
        }
        let mut records = self.records.lock().unwrap();
        records.retain(|r| {
            !(r.fabric_index == record.fabric_index && r.peer_node_id == record.peer_node_id)
        });
        records.push(record);
        self.persist(&records)
    }
    fn find_by_resumption_id(&self, resumption_id: &[u8]) -> Result<Option<ResumptionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| cryptoutil::ct_equal(&r.resumption_id, resumption_id))
            .cloned())
    }
    fn find_by_node(&self, fabric_index: u8, peer_node_id: u64) -> Result<Option<ResumptionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.fabric_index == fabric_index && r.peer_node_id == peer_node_id)
            .cloned())
    }
    fn remove_fabric(&self, fabric_index: u8) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.fabric_index != fabric_index);
        self.persist(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_material() -> SessionKeyMaterial {
        SessionKeyMaterial {
            salt: vec![1; 32],
            shared_secret: vec![2; 32],
            info: SESSION_KEYS_INFO,
        }
    }

    fn pair() -> (SecureSession, SecureSession) {
        let m = test_material();
        let initiator =
            SecureSession::derive(&m, 10, 20, 1, 100, 200, true, false, Default::default())
                .unwrap();
        let responder =
            SecureSession::derive(&m, 20, 10, 1, 200, 100, false, false, Default::default())
                .unwrap();
        (initiator, responder)
    }

    #[test]
    fn test_key_split_is_directional() {
        let (i, r) = pair();
        assert_eq!(i.encrypt_key, r.decrypt_key);
        assert_eq!(i.decrypt_key, r.encrypt_key);
        assert_eq!(i.attestation_challenge, r.attestation_challenge);
        assert_eq!(i.attestation_challenge.len(), 16);
        assert!(!i.is_resumption);
    }

    #[test]
    fn test_protected_message_roundtrip() {
        let (i, r) = pair();
        let framed = i.encode_message(b"hello matter").unwrap();
        let opened = r.decode_message(&framed).unwrap();
        assert!(opened.ends_with(b"hello matter"));

        // wrong session id is rejected before decryption
        let m = test_material();
        let stranger =
            SecureSession::derive(&m, 77, 10, 1, 200, 100, false, false, Default::default())
                .unwrap();
        let err = stranger.decode_message(&framed).unwrap_err();
        assert!(matches!(
            MatterError::of(&err),
            Some(MatterError::UnexpectedData(_))
        ));
    }

    #[test]
    fn test_tampered_message_fails_tag() {
        let (i, r) = pair();
        let mut framed = i.encode_message(b"payload").unwrap();
        let n = framed.len();
        framed[n - 1] ^= 0xff;
        let err = r.decode_message(&framed).unwrap_err();
        assert!(matches!(
            MatterError::of(&err),
            Some(MatterError::Crypto(_))
        ));
    }

    #[test]
    fn test_session_id_allocation() {
        let mgr = SessionManager::new();
        let id1 = mgr.next_available_session_id();
        assert_ne!(id1, 0);
        let m = test_material();
        let s = SecureSession::derive(&m, id1, 1, 1, 1, 2, false, false, Default::default())
            .unwrap();
        mgr.add(Arc::new(s));
        let id2 = mgr.next_available_session_id();
        assert_ne!(id2, 0);
        assert_ne!(id2, id1);
        assert_eq!(mgr.active_count(), 1);
        assert!(mgr.remove(id1).is_some());
        assert_eq!(mgr.active_count(), 0);
    }

    fn record(fabric: u8, node: u64, id_byte: u8) -> ResumptionRecord {
        ResumptionRecord {
            resumption_id: vec![id_byte; RESUMPTION_ID_LEN],
            shared_secret: vec![9; 32],
            fabric_index: fabric,
            peer_node_id: node,
            session_parameters: Default::default(),
        }
    }

    #[test]
    fn test_mem_store_rotation() {
        let store = MemResumptionStore::new();
        store.save(record(1, 55, 0xa)).unwrap();
        assert!(store
            .find_by_resumption_id(&[0xa; 16])
            .unwrap()
            .is_some());
        // same peer: old id replaced
        store.save(record(1, 55, 0xb)).unwrap();
        assert!(store.find_by_resumption_id(&[0xa; 16]).unwrap().is_none());
        assert!(store.find_by_resumption_id(&[0xb; 16]).unwrap().is_some());
        assert_eq!(
            store.find_by_node(1, 55).unwrap().unwrap().resumption_id,
            vec![0xb; 16]
        );
        store.remove_fabric(1).unwrap();
        assert!(store.find_by_node(1, 55).unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("matn-resumption-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("resumption.bin");
        let path = path.to_str().unwrap().to_owned();

        let store = FileResumptionStore::open(&path).unwrap();
        store.save(record(2, 77, 0xc)).unwrap();
        drop(store);

        let store = FileResumptionStore::open(&path).unwrap();
        let rec = store.find_by_node(2, 77).unwrap().unwrap();
        assert_eq!(rec.resumption_id, vec![0xc; 16]);
        assert_eq!(rec.shared_secret.len(), 32);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_store_rejects_bad_resumption_id() {
        let store = MemResumptionStore::new();
        let mut r = record(1, 1, 1);
        r.resumption_id.truncate(8);
        assert!(store.save(r).is_err());
    }
}
