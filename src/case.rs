//! CASE session establishment: the sigma1/sigma2/sigma3 exchange between
//! two nodes holding operational certificates, including the short
//! sigma1/sigma2-resume path.
//!
//! The machines themselves ([CaseResponder], [CaseInitiator]) are pure over
//! byte payloads so they can be tested back to back; [respond] and
//! [establish] couple them to a [MessageExchange] and implement the
//! status-report policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;

use crate::error::MatterError;
use crate::exchange::MessageExchange;
use crate::fabric::{Fabric, FabricStore};
use crate::messages::{self, ProtocolMessageHeader, SecureChannelStatus, StatusReportInfo};
use crate::session::{
    ResumptionRecord, ResumptionStore, SecureSession, SessionKeyMaterial, SessionManager,
    SessionParameters, RESUMPTION_ID_LEN, SESSION_KEYS_INFO, SESSION_RESUMPTION_KEYS_INFO,
};
use crate::tlv::{self, TlvBuffer};
use crate::util::cryptoutil;

const KDF_INFO_SIGMA2: &[u8] = b"Sigma2";
const KDF_INFO_SIGMA3: &[u8] = b"Sigma3";
const KDF_INFO_SIGMA1_RESUME: &[u8] = b"Sigma1_Resume";
const KDF_INFO_SIGMA2_RESUME: &[u8] = b"Sigma2_Resume";

const NONCE_SIGMA2: &[u8] = b"NCASE_Sigma2N";
const NONCE_SIGMA3: &[u8] = b"NCASE_Sigma3N";
const NONCE_SIGMA1_RESUME: &[u8] = b"NCASE_SigmaS1";
const NONCE_SIGMA2_RESUME: &[u8] = b"NCASE_SigmaS2";

// sigma1 field tags
const S1_TAG_RANDOM: u8 = 1;
const S1_TAG_SESSION_ID: u8 = 2;
const S1_TAG_DESTINATION_ID: u8 = 3;
const S1_TAG_ECDH_PUBLIC_KEY: u8 = 4;
const S1_TAG_SESSION_PARAMS: u8 = 5;
const S1_TAG_RESUMPTION_ID: u8 = 6;
const S1_TAG_RESUME_MIC: u8 = 7;

// sigma2 field tags
const S2_TAG_RANDOM: u8 = 1;
const S2_TAG_SESSION_ID: u8 = 2;
const S2_TAG_ECDH_PUBLIC_KEY: u8 = 3;
const S2_TAG_ENCRYPTED: u8 = 4;
const S2_TAG_SESSION_PARAMS: u8 = 5;

// sigma2-resume field tags
const S2R_TAG_RESUMPTION_ID: u8 = 1;
const S2R_TAG_RESUME_MIC: u8 = 2;
const S2R_TAG_SESSION_ID: u8 = 3;
const S2R_TAG_SESSION_PARAMS: u8 = 4;

const S3_TAG_ENCRYPTED: u8 = 1;

// tbs/tbe field tags
const TAG_NOC: u8 = 1;
const TAG_ICAC: u8 = 2;
const TAG_TBS_SENDER_PUBKEY: u8 = 3;
const TAG_TBS_RECEIVER_PUBKEY: u8 = 4;
const TAG_TBE_SIGNATURE: u8 = 3;
const TAG_TBE_RESUMPTION_ID: u8 = 4;

fn write_session_params(tlv: &mut TlvBuffer, tag: u8, params: &SessionParameters) -> Result<()> {
    tlv.write_struct(tag)?;
    tlv.write_uint32(1, params.idle_interval_ms)?;
    tlv.write_uint32(2, params.active_interval_ms)?;
    tlv.write_uint32(3, params.active_threshold_ms)?;
    tlv.write_struct_end()?;
    Ok(())
}

fn read_session_params(item: &tlv::TlvItem, tag: u8) -> SessionParameters {
    let defaults = SessionParameters::default();
    SessionParameters {
        idle_interval_ms: item
            .get_u32(&[tag, 1])
            .unwrap_or(defaults.idle_interval_ms),
        active_interval_ms: item
            .get_u32(&[tag, 2])
            .unwrap_or(defaults.active_interval_ms),
        active_threshold_ms: item
            .get_u32(&[tag, 3])
            .unwrap_or(defaults.active_threshold_ms),
    }
}

fn build_tbs(noc: &[u8], icac: Option<&[u8]>, sender_pub: &[u8], receiver_pub: &[u8]) -> Result<Vec<u8>> {
    let mut tlv = TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_octetstring(TAG_NOC, noc)?;
    if let Some(icac) = icac {
        tlv.write_octetstring(TAG_ICAC, icac)?;
    }
    tlv.write_octetstring(TAG_TBS_SENDER_PUBKEY, sender_pub)?;
    tlv.write_octetstring(TAG_TBS_RECEIVER_PUBKEY, receiver_pub)?;
    tlv.write_struct_end()?;
    Ok(tlv.data)
}

fn get_fixed_octets(item: &tlv::TlvItem, tag: u8, len: usize, what: &str) -> Result<Vec<u8>> {
    let v = item
        .get_octet_string_owned(&[tag])
        .ok_or_else(|| MatterError::UnexpectedData(format!("{} missing", what)))?;
    if v.len() != len {
        return Err(
            MatterError::UnexpectedData(format!("{} has length {}", what, v.len())).into(),
        );
    }
    Ok(v)
}

/// Status report to answer a failed handshake with.
pub fn status_for_error(err: &anyhow::Error) -> SecureChannelStatus {
    match MatterError::of(err) {
        Some(MatterError::FabricNotFound) => SecureChannelStatus::NoSharedTrustRoots,
        _ => SecureChannelStatus::InvalidParameter,
    }
}

/// Payload the responder answers a sigma1 with.
#[derive(Debug)]
pub enum Sigma1Outcome {
    Sigma2(Vec<u8>),
    Sigma2Resume(Vec<u8>),
}

struct FullState {
    fabric: Arc<Fabric>,
    local_session_id: u16,
    peer_session_id: u16,
    shared_secret: Vec<u8>,
    sigma1_bytes: Vec<u8>,
    sigma2_bytes: Vec<u8>,
    our_eph_public: Vec<u8>,
    peer_eph_public: Vec<u8>,
    resumption_id: Vec<u8>,
    peer_session_params: SessionParameters,
}

struct ResumeState {
    session: Arc<SecureSession>,
    new_record: ResumptionRecord,
}

enum ResponderState {
    AwaitSigma1,
    AwaitSigma3(Box<FullState>),
    AwaitSuccess(Box<ResumeState>),
    Done,
}

/// Responder side of the CASE handshake.
pub struct CaseResponder {
    fabrics: Arc<FabricStore>,
    sessions: Arc<SessionManager>,
    resumptions: Arc<dyn ResumptionStore>,
    state: ResponderState,
}

impl CaseResponder {
    pub fn new(
        fabrics: Arc<FabricStore>,
        sessions: Arc<SessionManager>,
        resumptions: Arc<dyn ResumptionStore>,
    ) -> Self {
        Self {
            fabrics,
            sessions,
            resumptions,
            state: ResponderState::AwaitSigma1,
        }
    }

    /// Process a sigma1 payload and produce either sigma2 (full handshake)
    /// or sigma2-resume.
    pub fn on_sigma1(&mut self, sigma1_bytes: &[u8]) -> Result<Sigma1Outcome> {
        if !matches!(self.state, ResponderState::AwaitSigma1) {
            return Err(MatterError::Implementation("sigma1 out of order".into()).into());
        }
        let s1 = tlv::decode_tlv(sigma1_bytes)?;
        let initiator_random = get_fixed_octets(&s1, S1_TAG_RANDOM, 32, "initiator random")?;
        let peer_session_id = s1
            .get_u16(&[S1_TAG_SESSION_ID])
            .ok_or_else(|| MatterError::UnexpectedData("initiator session id missing".into()))?;
        let destination_id = get_fixed_octets(&s1, S1_TAG_DESTINATION_ID, 32, "destination id")?;
        let peer_eph_public =
            get_fixed_octets(&s1, S1_TAG_ECDH_PUBLIC_KEY, 65, "initiator ecdh key")?;
        let peer_session_params = read_session_params(&s1, S1_TAG_SESSION_PARAMS);
        let resumption_id = s1.get_octet_string_owned(&[S1_TAG_RESUMPTION_ID]);
        let resume_mic = s1.get_octet_string_owned(&[S1_TAG_RESUME_MIC]);

        match (&resumption_id, &resume_mic) {
            (Some(rid), Some(mic)) => {
                if rid.len() != RESUMPTION_ID_LEN || mic.len() != 16 {
                    return Err(MatterError::UnexpectedData(
                        "Invalid resumption ID or resume MIC".into(),
                    )
                    .into());
                }
                if let Some(record) = self.resumptions.find_by_resumption_id(rid)? {
                    let mut salt = initiator_random.clone();
                    salt.extend_from_slice(rid);
                    let resume_key = cryptoutil::hkdf_sha256(
                        &salt,
                        &record.shared_secret,
                        KDF_INFO_SIGMA1_RESUME,
                        16,
                    )?;
                    if cryptoutil::aes128_ccm_decrypt(&resume_key, NONCE_SIGMA1_RESUME, &[], mic)
                        .is_ok()
                    {
                        return self.resume(
                            record,
                            &initiator_random,
                            rid,
                            peer_session_id,
                            peer_session_params,
                        );
                    }
                    debug!("sigma1 resume mic did not verify, taking full branch");
                } else {
                    debug!("sigma1 carries unknown resumption id, taking full branch");
                }
            }
            (None, None) => {}
            _ => {
                return Err(MatterError::UnexpectedData(
                    "Invalid resumption ID or resume MIC".into(),
                )
                .into())
            }
        }

        self.full_handshake(
            sigma1_bytes,
            &initiator_random,
            &destination_id,
            peer_eph_public,
            peer_session_id,
            peer_session_params,
        )
    }

    fn resume(
        &mut self,
        record: ResumptionRecord,
        initiator_random: &[u8],
        peer_resumption_id: &[u8],
        peer_session_id: u16,
        peer_session_params: SessionParameters,
    ) -> Result<Sigma1Outcome> {
        let fabric = self
            .fabrics
            .by_index(record.fabric_index)
            .ok_or(MatterError::FabricNotFound)?;
        let local_session_id = self.sessions.next_available_session_id();

        let mut session_salt = initiator_random.to_vec();
        session_salt.extend_from_slice(peer_resumption_id);
        let session = SecureSession::derive(
            &SessionKeyMaterial {
                salt: session_salt,
                shared_secret: record.shared_secret.clone(),
                info: SESSION_RESUMPTION_KEYS_INFO,
            },
            local_session_id,
            peer_session_id,
            fabric.index,
            fabric.node_id,
            record.peer_node_id,
            false,
            true,
            peer_session_params,
        )?;

        let new_resumption_id = cryptoutil::random_bytes(RESUMPTION_ID_LEN);
        let mut salt = initiator_random.to_vec();
        salt.extend_from_slice(&new_resumption_id);
        let resume_key =
            cryptoutil::hkdf_sha256(&salt, &record.shared_secret, KDF_INFO_SIGMA2_RESUME, 16)?;
        let resume_mic =
            cryptoutil::aes128_ccm_encrypt(&resume_key, NONCE_SIGMA2_RESUME, &[], &[])?;

        let mut out = TlvBuffer::new();
        out.write_anon_struct()?;
        out.write_octetstring(S2R_TAG_RESUMPTION_ID, &new_resumption_id)?;
        out.write_octetstring(S2R_TAG_RESUME_MIC, &resume_mic)?;
        out.write_uint16(S2R_TAG_SESSION_ID, local_session_id)?;
        write_session_params(&mut out, S2R_TAG_SESSION_PARAMS, &SessionParameters::default())?;
        out.write_struct_end()?;

        let new_record = ResumptionRecord {
            resumption_id: new_resumption_id,
            shared_secret: record.shared_secret,
            fabric_index: record.fabric_index,
            peer_node_id: record.peer_node_id,
            session_parameters: peer_session_params,
        };
        self.state = ResponderState::AwaitSuccess(Box::new(ResumeState {
            session: Arc::new(session),
            new_record,
        }));
        Ok(Sigma1Outcome::Sigma2Resume(out.data))
    }

    fn full_handshake(
        &mut self,
        sigma1_bytes: &[u8],
        initiator_random: &[u8],
        destination_id: &[u8],
        peer_eph_public: Vec<u8>,
        peer_session_id: u16,
        peer_session_params: SessionParameters,
    ) -> Result<Sigma1Outcome> {
        let fabric = self
            .fabrics
            .find_by_destination_id(destination_id, initiator_random)?;
        let ipk = fabric.operational_ipk()?;

        let eph_key = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
        let our_eph_public = eph_key.public_key().to_sec1_bytes().to_vec();
        let peer_public = p256::PublicKey::from_sec1_bytes(&peer_eph_public)
            .map_err(|e| MatterError::UnexpectedData(format!("initiator ecdh key: {:?}", e)))?;
        let shared_secret = eph_key
            .diffie_hellman(&peer_public)
            .raw_secret_bytes()
            .to_vec();

        let local_session_id = self.sessions.next_available_session_id();
        let responder_random = cryptoutil::random_bytes(32);
        let resumption_id = cryptoutil::random_bytes(RESUMPTION_ID_LEN);

        let tbs = build_tbs(
            &fabric.noc,
            fabric.icac.as_deref(),
            &our_eph_public,
            &peer_eph_public,
        )?;
        let signature = fabric.sign(&tbs)?;

        let mut tbe = TlvBuffer::new();
        tbe.write_anon_struct()?;
        tbe.write_octetstring(TAG_NOC, &fabric.noc)?;
        if let Some(icac) = &fabric.icac {
            tbe.write_octetstring(TAG_ICAC, icac)?;
        }
        tbe.write_octetstring(TAG_TBE_SIGNATURE, &signature)?;
        tbe.write_octetstring(TAG_TBE_RESUMPTION_ID, &resumption_id)?;
        tbe.write_struct_end()?;

        let mut sigma2_salt = ipk.clone();
        sigma2_salt.extend_from_slice(&responder_random);
        sigma2_salt.extend_from_slice(&our_eph_public);
        sigma2_salt.extend_from_slice(&cryptoutil::sha256(sigma1_bytes));
        let sigma2_key =
            cryptoutil::hkdf_sha256(&sigma2_salt, &shared_secret, KDF_INFO_SIGMA2, 16)?;
        let encrypted2 = cryptoutil::aes128_ccm_encrypt(&sigma2_key, NONCE_SIGMA2, &[], &tbe.data)?;

        let mut out = TlvBuffer::new();
        out.write_anon_struct()?;
        out.write_octetstring(S2_TAG_RANDOM, &responder_random)?;
        out.write_uint16(S2_TAG_SESSION_ID, local_session_id)?;
        out.write_octetstring(S2_TAG_ECDH_PUBLIC_KEY, &our_eph_public)?;
        out.write_octetstring(S2_TAG_ENCRYPTED, &encrypted2)?;
        write_session_params(&mut out, S2_TAG_SESSION_PARAMS, &SessionParameters::default())?;
        out.write_struct_end()?;

        self.state = ResponderState::AwaitSigma3(Box::new(FullState {
            fabric,
            local_session_id,
            peer_session_id,
            shared_secret,
            sigma1_bytes: sigma1_bytes.to_vec(),
            sigma2_bytes: out.data.clone(),
            our_eph_public,
            peer_eph_public,
            resumption_id,
            peer_session_params,
        }));
        Ok(Sigma1Outcome::Sigma2(out.data))
    }

    /// Process sigma3, validate the peer credentials and signature, derive
    /// the secure session and persist the new resumption record.
    pub fn on_sigma3(&mut self, sigma3_bytes: &[u8]) -> Result<Arc<SecureSession>> {
        let ResponderState::AwaitSigma3(st) = std::mem::replace(&mut self.state, ResponderState::Done)
        else {
            return Err(MatterError::Implementation("sigma3 out of order".into()).into());
        };
        let s3 = tlv::decode_tlv(sigma3_bytes)?;
        let encrypted = s3
            .get_octet_string(&[S3_TAG_ENCRYPTED])
            .ok_or_else(|| MatterError::UnexpectedData("sigma3 encrypted blob missing".into()))?;

        let ipk = st.fabric.operational_ipk()?;
        let mut sigma3_salt = ipk.clone();
        sigma3_salt.extend_from_slice(&cryptoutil::sha256_many(&[
            &st.sigma1_bytes,
            &st.sigma2_bytes,
        ]));
        let sigma3_key =
            cryptoutil::hkdf_sha256(&sigma3_salt, &st.shared_secret, KDF_INFO_SIGMA3, 16)?;
        let tbe_bytes =
            cryptoutil::aes128_ccm_decrypt(&sigma3_key, NONCE_SIGMA3, &[], encrypted)?;

        let tbe = tlv::decode_tlv(&tbe_bytes)?;
        let peer_noc = tbe
            .get_octet_string(&[TAG_NOC])
            .ok_or_else(|| MatterError::UnexpectedData("sigma3 noc missing".into()))?;
        let peer_icac = tbe.get_octet_string(&[TAG_ICAC]);
        let peer_signature = tbe
            .get_octet_string(&[TAG_TBE_SIGNATURE])
            .ok_or_else(|| MatterError::UnexpectedData("sigma3 signature missing".into()))?;

        let peer_cert = st.fabric.verify_credentials(peer_noc, peer_icac)?;
        let peer_tbs = build_tbs(
            peer_noc,
            peer_icac,
            &st.peer_eph_public,
            &st.our_eph_public,
        )?;
        cryptoutil::verify(&peer_cert.public_key, &peer_tbs, peer_signature)?;
        let peer_node_id = peer_cert
            .subject_node_id()
            .context("peer noc carries no node id")?;

        let mut session_salt = ipk;
        session_salt.extend_from_slice(&cryptoutil::sha256_many(&[
            &st.sigma1_bytes,
            &st.sigma2_bytes,
            sigma3_bytes,
        ]));
        let session = Arc::new(SecureSession::derive(
            &SessionKeyMaterial {
                salt: session_salt,
                shared_secret: st.shared_secret.clone(),
                info: SESSION_KEYS_INFO,
            },
            st.local_session_id,
            st.peer_session_id,
            st.fabric.index,
            st.fabric.node_id,
            peer_node_id,
            false,
            false,
            st.peer_session_params,
        )?);
        self.sessions.add(session.clone());
        self.resumptions.save(ResumptionRecord {
            resumption_id: st.resumption_id,
            shared_secret: st.shared_secret,
            fabric_index: st.fabric.index,
            peer_node_id,
            session_parameters: st.peer_session_params,
        })?;
        Ok(session)
    }

    /// The initiator acknowledged a sigma2-resume: activate the session and
    /// persist the rotated resumption record.
    pub fn on_resume_success(&mut self) -> Result<Arc<SecureSession>> {
        let ResponderState::AwaitSuccess(st) =
            std::mem::replace(&mut self.state, ResponderState::Done)
        else {
            return Err(MatterError::Implementation("status report out of order".into()).into());
        };
        self.sessions.add(st.session.clone());
        self.resumptions.save(st.new_record)?;
        Ok(st.session)
    }

    pub fn awaiting_success(&self) -> bool {
        matches!(self.state, ResponderState::AwaitSuccess(_))
    }
}

struct InitiatorPending {
    peer_session_id: u16,
    shared_secret: Vec<u8>,
    /// sigma1 ‖ sigma2 ‖ sigma3 bytes.
    transcript: Vec<u8>,
    /// Resumption id the responder announced in its tbe.
    resumption_id: Vec<u8>,
    peer_session_params: SessionParameters,
}

enum InitiatorState {
    AwaitSigma2,
    AwaitStatus(Box<InitiatorPending>),
    Done,
}

/// Initiator side of the CASE handshake. Attempts resumption when the store
/// holds a record for the target peer.
pub struct CaseInitiator {
    fabric: Arc<Fabric>,
    sessions: Arc<SessionManager>,
    resumptions: Arc<dyn ResumptionStore>,
    peer_node_id: u64,
    local_session_id: u16,
    eph_key: p256::ecdh::EphemeralSecret,
    our_eph_public: Vec<u8>,
    initiator_random: Vec<u8>,
    sigma1_bytes: Vec<u8>,
    attempted_resumption: Option<ResumptionRecord>,
    state: InitiatorState,
}

impl CaseInitiator {
    /// Build the machine and the sigma1 payload to send.
    pub fn start(
        fabric: Arc<Fabric>,
        sessions: Arc<SessionManager>,
        resumptions: Arc<dyn ResumptionStore>,
        peer_node_id: u64,
    ) -> Result<(Self, Vec<u8>)> {
        let eph_key = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
        let our_eph_public = eph_key.public_key().to_sec1_bytes().to_vec();
        let initiator_random = cryptoutil::random_bytes(32);
        let local_session_id = sessions.next_available_session_id();
        let destination_id = fabric.destination_id(&initiator_random, peer_node_id)?;
        let attempted_resumption = resumptions.find_by_node(fabric.index, peer_node_id)?;

        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct()?;
        tlv.write_octetstring(S1_TAG_RANDOM, &initiator_random)?;
        tlv.write_uint16(S1_TAG_SESSION_ID, local_session_id)?;
        tlv.write_octetstring(S1_TAG_DESTINATION_ID, &destination_id)?;
        tlv.write_octetstring(S1_TAG_ECDH_PUBLIC_KEY, &our_eph_public)?;
        write_session_params(&mut tlv, S1_TAG_SESSION_PARAMS, &SessionParameters::default())?;
        if let Some(record) = &attempted_resumption {
            let mut salt = initiator_random.clone();
            salt.extend_from_slice(&record.resumption_id);
            let resume_key = cryptoutil::hkdf_sha256(
                &salt,
                &record.shared_secret,
                KDF_INFO_SIGMA1_RESUME,
                16,
            )?;
            let mic =
                cryptoutil::aes128_ccm_encrypt(&resume_key, NONCE_SIGMA1_RESUME, &[], &[])?;
            tlv.write_octetstring(S1_TAG_RESUMPTION_ID, &record.resumption_id)?;
            tlv.write_octetstring(S1_TAG_RESUME_MIC, &mic)?;
        }
        tlv.write_struct_end()?;

        let sigma1_bytes = tlv.data;
        Ok((
            Self {
                fabric,
                sessions,
                resumptions,
                peer_node_id,
                local_session_id,
                eph_key,
                our_eph_public,
                initiator_random,
                sigma1_bytes: sigma1_bytes.clone(),
                attempted_resumption,
                state: InitiatorState::AwaitSigma2,
            },
            sigma1_bytes,
        ))
    }

    /// Process sigma2, verify the responder and produce the sigma3 payload.
    pub fn on_sigma2(&mut self, sigma2_bytes: &[u8]) -> Result<Vec<u8>> {
        if !matches!(self.state, InitiatorState::AwaitSigma2) {
            return Err(MatterError::Implementation("sigma2 out of order".into()).into());
        }
        let s2 = tlv::decode_tlv(sigma2_bytes)?;
        let responder_random = get_fixed_octets(&s2, S2_TAG_RANDOM, 32, "responder random")?;
        let peer_session_id = s2
            .get_u16(&[S2_TAG_SESSION_ID])
            .ok_or_else(|| MatterError::UnexpectedData("responder session id missing".into()))?;
        let peer_eph_public =
            get_fixed_octets(&s2, S2_TAG_ECDH_PUBLIC_KEY, 65, "responder ecdh key")?;
        let encrypted2 = s2
            .get_octet_string(&[S2_TAG_ENCRYPTED])
            .ok_or_else(|| MatterError::UnexpectedData("sigma2 encrypted blob missing".into()))?;
        let peer_session_params = read_session_params(&s2, S2_TAG_SESSION_PARAMS);

        let peer_public = p256::PublicKey::from_sec1_bytes(&peer_eph_public)
            .map_err(|e| MatterError::UnexpectedData(format!("responder ecdh key: {:?}", e)))?;
        let shared_secret = self
            .eph_key
            .diffie_hellman(&peer_public)
            .raw_secret_bytes()
            .to_vec();
        let ipk = self.fabric.operational_ipk()?;

        let mut sigma2_salt = ipk.clone();
        sigma2_salt.extend_from_slice(&responder_random);
        sigma2_salt.extend_from_slice(&peer_eph_public);
        sigma2_salt.extend_from_slice(&cryptoutil::sha256(&self.sigma1_bytes));
        let sigma2_key =
            cryptoutil::hkdf_sha256(&sigma2_salt, &shared_secret, KDF_INFO_SIGMA2, 16)?;
        let tbe_bytes =
            cryptoutil::aes128_ccm_decrypt(&sigma2_key, NONCE_SIGMA2, &[], encrypted2)?;
        let tbe = tlv::decode_tlv(&tbe_bytes)?;
        let peer_noc = tbe
            .get_octet_string(&[TAG_NOC])
            .ok_or_else(|| MatterError::UnexpectedData("sigma2 noc missing".into()))?;
        let peer_icac = tbe.get_octet_string(&[TAG_ICAC]);
        let peer_signature = tbe
            .get_octet_string(&[TAG_TBE_SIGNATURE])
            .ok_or_else(|| MatterError::UnexpectedData("sigma2 signature missing".into()))?;
        let peer_resumption_id = tbe
            .get_octet_string_owned(&[TAG_TBE_RESUMPTION_ID])
            .ok_or_else(|| MatterError::UnexpectedData("sigma2 resumption id missing".into()))?;

        let peer_cert = self.fabric.verify_credentials(peer_noc, peer_icac)?;
        let peer_tbs = build_tbs(
            peer_noc,
            peer_icac,
            &peer_eph_public,
            &self.our_eph_public,
        )?;
        cryptoutil::verify(&peer_cert.public_key, &peer_tbs, peer_signature)?;
        let responder_node_id = peer_cert
            .subject_node_id()
            .context("responder noc carries no node id")?;
        if responder_node_id != self.peer_node_id {
            return Err(MatterError::UnexpectedData(format!(
                "responder node id {:#x}, expected {:#x}",
                responder_node_id, self.peer_node_id
            ))
            .into());
        }

        // our own sigma3 signature over the mirrored tbs
        let tbs = build_tbs(
            &self.fabric.noc,
            self.fabric.icac.as_deref(),
            &self.our_eph_public,
            &peer_eph_public,
        )?;
        let signature = self.fabric.sign(&tbs)?;
        let mut tbe3 = TlvBuffer::new();
        tbe3.write_anon_struct()?;
        tbe3.write_octetstring(TAG_NOC, &self.fabric.noc)?;
        if let Some(icac) = &self.fabric.icac {
            tbe3.write_octetstring(TAG_ICAC, icac)?;
        }
        tbe3.write_octetstring(TAG_TBE_SIGNATURE, &signature)?;
        tbe3.write_struct_end()?;

        let mut transcript = self.sigma1_bytes.clone();
        transcript.extend_from_slice(sigma2_bytes);
        let mut sigma3_salt = ipk;
        sigma3_salt.extend_from_slice(&cryptoutil::sha256(&transcript));
        let sigma3_key =
            cryptoutil::hkdf_sha256(&sigma3_salt, &shared_secret, KDF_INFO_SIGMA3, 16)?;
        let encrypted3 =
            cryptoutil::aes128_ccm_encrypt(&sigma3_key, NONCE_SIGMA3, &[], &tbe3.data)?;

        let mut out = TlvBuffer::new();
        out.write_anon_struct()?;
        out.write_octetstring(S3_TAG_ENCRYPTED, &encrypted3)?;
        out.write_struct_end()?;

        transcript.extend_from_slice(&out.data);
        self.state = InitiatorState::AwaitStatus(Box::new(InitiatorPending {
            peer_session_id,
            shared_secret,
            transcript,
            resumption_id: peer_resumption_id,
            peer_session_params,
        }));
        Ok(out.data)
    }

    /// The responder reported success for the full handshake: derive keys,
    /// register the session and persist the responder's resumption id.
    pub fn on_success(&mut self) -> Result<Arc<SecureSession>> {
        let InitiatorState::AwaitStatus(st) =
            std::mem::replace(&mut self.state, InitiatorState::Done)
        else {
            return Err(MatterError::Implementation("status report out of order".into()).into());
        };
        let mut session_salt = self.fabric.operational_ipk()?;
        session_salt.extend_from_slice(&cryptoutil::sha256(&st.transcript));
        let session = Arc::new(SecureSession::derive(
            &SessionKeyMaterial {
                salt: session_salt,
                shared_secret: st.shared_secret.clone(),
                info: SESSION_KEYS_INFO,
            },
            self.local_session_id,
            st.peer_session_id,
            self.fabric.index,
            self.fabric.node_id,
            self.peer_node_id,
            true,
            false,
            st.peer_session_params,
        )?);
        self.sessions.add(session.clone());
        self.resumptions.save(ResumptionRecord {
            resumption_id: st.resumption_id,
            shared_secret: st.shared_secret,
            fabric_index: self.fabric.index,
            peer_node_id: self.peer_node_id,
            session_parameters: st.peer_session_params,
        })?;
        Ok(session)
    }

    /// Process a sigma2-resume answer to a sigma1 that attempted resumption.
    pub fn on_sigma2_resume(&mut self, payload: &[u8]) -> Result<Arc<SecureSession>> {
        if !matches!(self.state, InitiatorState::AwaitSigma2) {
            return Err(MatterError::Implementation("sigma2-resume out of order".into()).into());
        }
        let record = self
            .attempted_resumption
            .clone()
            .ok_or_else(|| {
                MatterError::UnexpectedData("sigma2-resume without resumption attempt".into())
            })?;
        let s2r = tlv::decode_tlv(payload)?;
        let new_resumption_id =
            get_fixed_octets(&s2r, S2R_TAG_RESUMPTION_ID, RESUMPTION_ID_LEN, "resumption id")?;
        let resume_mic = get_fixed_octets(&s2r, S2R_TAG_RESUME_MIC, 16, "resume mic")?;
        let peer_session_id = s2r
            .get_u16(&[S2R_TAG_SESSION_ID])
            .ok_or_else(|| MatterError::UnexpectedData("responder session id missing".into()))?;

        let mut salt = self.initiator_random.clone();
        salt.extend_from_slice(&new_resumption_id);
        let resume_key =
            cryptoutil::hkdf_sha256(&salt, &record.shared_secret, KDF_INFO_SIGMA2_RESUME, 16)?;
        cryptoutil::aes128_ccm_decrypt(&resume_key, NONCE_SIGMA2_RESUME, &[], &resume_mic)?;

        let mut session_salt = self.initiator_random.clone();
        session_salt.extend_from_slice(&record.resumption_id);
        let session = Arc::new(SecureSession::derive(
            &SessionKeyMaterial {
                salt: session_salt,
                shared_secret: record.shared_secret.clone(),
                info: SESSION_RESUMPTION_KEYS_INFO,
            },
            self.local_session_id,
            peer_session_id,
            self.fabric.index,
            self.fabric.node_id,
            self.peer_node_id,
            true,
            true,
            record.session_parameters,
        )?);
        self.sessions.add(session.clone());
        self.resumptions.save(ResumptionRecord {
            resumption_id: new_resumption_id,
            shared_secret: record.shared_secret,
            fabric_index: record.fabric_index,
            peer_node_id: record.peer_node_id,
            session_parameters: record.session_parameters,
        })?;
        self.state = InitiatorState::Done;
        Ok(session)
    }
}

const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Drive the responder over an unsecured exchange. Sends the appropriate
/// status report on failure and never answers a received error status.
pub async fn respond(
    fabrics: Arc<FabricStore>,
    sessions: Arc<SessionManager>,
    resumptions: Arc<dyn ResumptionStore>,
    exchange: &MessageExchange,
) -> Result<Arc<SecureSession>> {
    let mut responder = CaseResponder::new(fabrics, sessions, resumptions);

    let msg = exchange.next_message(HANDSHAKE_STEP_TIMEOUT).await?;
    if let Some(sri) = msg.status_report_info {
        // never answer a status report, that invites ping-pong
        return Err(
            MatterError::UnexpectedData(format!("peer opened with a status report: {}", sri))
                .into(),
        );
    }
    if msg.protocol_header.opcode != ProtocolMessageHeader::OPCODE_CASE_SIGMA1 {
        send_error_status(exchange, SecureChannelStatus::InvalidParameter).await;
        return Err(MatterError::UnexpectedData(format!(
            "expected sigma1, got opcode {:#x}",
            msg.protocol_header.opcode
        ))
        .into());
    }
    let outcome = match responder.on_sigma1(&msg.payload) {
        Ok(o) => o,
        Err(e) => {
            send_error_status(exchange, status_for_error(&e)).await;
            return Err(e);
        }
    };

    match outcome {
        Sigma1Outcome::Sigma2Resume(payload) => {
            debug!("case: resumption branch, sending sigma2-resume");
            let out = messages::sigma2_resume(
                exchange.exchange_id(),
                &payload,
                exchange.last_received_counter(),
            )?;
            exchange.send(&out).await?;
            let msg = exchange.next_message(HANDSHAKE_STEP_TIMEOUT).await?;
            match msg.status_report_info {
                Some(sri) if sri.is_ok() => responder.on_resume_success(),
                // error status from the peer: abort without answering
                _ => Err(MatterError::UnexpectedData(
                    "sigma2-resume was not acknowledged".into(),
                )
                .into()),
            }
        }
        Sigma1Outcome::Sigma2(payload) => {
            debug!("case: full branch, sending sigma2");
            let out = messages::sigma2(
                exchange.exchange_id(),
                &payload,
                exchange.last_received_counter(),
            )?;
            exchange.send(&out).await?;
            let msg = exchange.next_message(HANDSHAKE_STEP_TIMEOUT).await?;
            if msg.status_report_info.is_some() {
                // peer aborted; do not answer an error status
                return Err(MatterError::UnexpectedData("peer aborted after sigma2".into()).into());
            }
            if msg.protocol_header.opcode != ProtocolMessageHeader::OPCODE_CASE_SIGMA3 {
                send_error_status(exchange, SecureChannelStatus::InvalidParameter).await;
                return Err(MatterError::UnexpectedData(format!(
                    "expected sigma3, got opcode {:#x}",
                    msg.protocol_header.opcode
                ))
                .into());
            }
            match responder.on_sigma3(&msg.payload) {
                Ok(session) => {
                    let status = messages::status_report(
                        exchange.exchange_id(),
                        &StatusReportInfo::success(),
                        false,
                        Some(exchange.last_received_counter()),
                    )?;
                    exchange.send_untracked(&status).await?;
                    Ok(session)
                }
                Err(e) => {
                    send_error_status(exchange, status_for_error(&e)).await;
                    Err(e)
                }
            }
        }
    }
}

/// Drive the initiator over an unsecured exchange.
pub async fn establish(
    fabric: Arc<Fabric>,
    sessions: Arc<SessionManager>,
    resumptions: Arc<dyn ResumptionStore>,
    peer_node_id: u64,
    exchange: &MessageExchange,
) -> Result<Arc<SecureSession>> {
    let (mut initiator, sigma1_payload) =
        CaseInitiator::start(fabric, sessions, resumptions, peer_node_id)?;
    let out = messages::sigma1(exchange.exchange_id(), &sigma1_payload)?;
    exchange.send(&out).await?;

    let msg = exchange.next_message(HANDSHAKE_STEP_TIMEOUT).await?;
    if let Some(sri) = msg.status_report_info {
        // responder refused; abort without answering
        return Err(MatterError::UnexpectedData(format!(
            "peer refused sigma1: {}",
            sri
        ))
        .into());
    }
    match msg.protocol_header.opcode {
        ProtocolMessageHeader::OPCODE_CASE_SIGMA2_RESUME => {
            let session = initiator.on_sigma2_resume(&msg.payload)?;
            let status = messages::status_report(
                exchange.exchange_id(),
                &StatusReportInfo::success(),
                true,
                Some(exchange.last_received_counter()),
            )?;
            exchange.send_untracked(&status).await?;
            Ok(session)
        }
        ProtocolMessageHeader::OPCODE_CASE_SIGMA2 => {
            let sigma3_payload = match initiator.on_sigma2(&msg.payload) {
                Ok(p) => p,
                Err(e) => {
                    send_error_status_as(exchange, status_for_error(&e), true).await;
                    return Err(e);
                }
            };
            let out = messages::sigma3(
                exchange.exchange_id(),
                &sigma3_payload,
                exchange.last_received_counter(),
            )?;
            exchange.send(&out).await?;
            let msg = exchange.next_message(HANDSHAKE_STEP_TIMEOUT).await?;
            match msg.status_report_info {
                Some(sri) if sri.is_ok() => initiator.on_success(),
                _ => Err(MatterError::UnexpectedData(
                    "sigma3 was not acknowledged with success".into(),
                )
                .into()),
            }
        }
        other => {
            send_error_status_as(exchange, SecureChannelStatus::InvalidParameter, true).await;
            Err(MatterError::UnexpectedData(format!(
                "expected sigma2, got opcode {:#x}",
                other
            ))
            .into())
        }
    }
}

async fn send_error_status(exchange: &MessageExchange, status: SecureChannelStatus) {
    send_error_status_as(exchange, status, false).await
}

async fn send_error_status_as(
    exchange: &MessageExchange,
    status: SecureChannelStatus,
    initiator: bool,
) {
    let Ok(payload) = messages::status_report(
        exchange.exchange_id(),
        &StatusReportInfo::error(status),
        initiator,
        Some(exchange.last_received_counter()),
    ) else {
        return;
    };
    if let Err(e) = exchange.send_untracked(&payload).await {
        log::debug!("failed to send error status report: {:?}", e);
    }
}
