//! Fabric records and the read-only fabric store consulted by CASE.
//!
//! A fabric bundles the operational credentials of one commissioned
//! administrative domain: ids, the root CA public key, NOC/ICAC, the IPK
//! epoch key and the operational keypair used for signing.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use crate::cert_matter::{self, MatterCert};
use crate::error::MatterError;
use crate::util::cryptoutil;

/// Operational node ids live in this range; everything else is reserved
/// (groups, PAKE, temporary ids).
pub fn is_operational_node_id(id: u64) -> bool {
    (1..=0xFFFF_FFEF_FFFF_FFFF).contains(&id)
}

#[derive(Debug)]
pub struct Fabric {
    /// Local fabric table slot, 1..=254.
    pub index: u8,
    pub id: u64,
    /// Our operational node id on this fabric.
    pub node_id: u64,
    pub ipk_epoch_key: Vec<u8>,
    root_public_key: Vec<u8>,
    pub noc: Vec<u8>,
    pub icac: Option<Vec<u8>>,
    keypair: p256::SecretKey,
}

impl Fabric {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: u8,
        id: u64,
        node_id: u64,
        ipk_epoch_key: Vec<u8>,
        root_public_key: Vec<u8>,
        noc: Vec<u8>,
        icac: Option<Vec<u8>>,
        keypair: p256::SecretKey,
    ) -> Result<Self> {
        if !(1..=254).contains(&index) {
            return Err(MatterError::Validation(format!("fabric index {}", index)).into());
        }
        if !is_operational_node_id(node_id) {
            return Err(
                MatterError::Validation(format!("node id {:#x} not operational", node_id)).into(),
            );
        }
        if ipk_epoch_key.len() != 16 {
            return Err(MatterError::Validation("ipk epoch key must be 16 bytes".into()).into());
        }
        Ok(Self {
            index,
            id,
            node_id,
            ipk_epoch_key,
            root_public_key,
            noc,
            icac,
            keypair,
        })
    }

    /// Build a complete single-fabric credential set with a fresh root CA.
    /// Used by tests and demo setups; real commissioning is done elsewhere.
    pub fn generate(index: u8, fabric_id: u64, node_id: u64) -> Result<Self> {
        let ca_key = p256::SecretKey::random(&mut rand::thread_rng());
        let root = cert_matter::generate_root(1, &ca_key)?;
        Self::generate_with_ca(
            index,
            fabric_id,
            node_id,
            &ca_key,
            &root,
            cryptoutil::random_bytes(16),
        )
    }

    /// Like [Fabric::generate] but on an existing CA, so several nodes can be
    /// placed on the same fabric (they must also share the IPK epoch key).
    pub fn generate_with_ca(
        index: u8,
        fabric_id: u64,
        node_id: u64,
        ca_key: &p256::SecretKey,
        root: &MatterCert,
        ipk_epoch_key: Vec<u8>,
    ) -> Result<Self> {
        let node_key = p256::SecretKey::random(&mut rand::thread_rng());
        let noc = cert_matter::generate_noc(
            node_id,
            fabric_id,
            &node_key.public_key().to_sec1_bytes(),
            root,
            ca_key,
        )?;
        Self::new(
            index,
            fabric_id,
            node_id,
            ipk_epoch_key,
            root.public_key.clone(),
            cert_matter::encode(&noc)?,
            None,
            node_key,
        )
    }

    pub fn root_public_key(&self) -> &[u8] {
        &self.root_public_key
    }

    /// Compressed fabric identifier, also the operational id used in the
    /// mdns instance name.
    pub fn operational_id(&self) -> Result<Vec<u8>> {
        let mut buf_id = Vec::new();
        buf_id.write_u64::<BigEndian>(self.id)?;
        cryptoutil::hkdf_sha256(
            &buf_id,
            &self.root_public_key[1..],
            b"CompressedFabric",
            8,
        )
    }

    /// Operational group key derived from the IPK epoch key.
    pub fn operational_ipk(&self) -> Result<Vec<u8>> {
        cryptoutil::hkdf_sha256(
            &self.operational_id()?,
            &self.ipk_epoch_key,
            b"GroupKey v1.0",
            16,
        )
    }

    /// Destination id a peer would compute for `node_id` on this fabric.
    pub fn destination_id(&self, initiator_random: &[u8], node_id: u64) -> Result<Vec<u8>> {
        let mut dst = Vec::new();
        dst.write_all(initiator_random)?;
        dst.write_all(&self.root_public_key)?;
        dst.write_u64::<LittleEndian>(self.id)?;
        dst.write_u64::<LittleEndian>(node_id)?;
        cryptoutil::hmac_sha256(&dst, &self.operational_ipk()?)
    }

    /// Sign with the operational keypair, raw r||s.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        cryptoutil::sign(&self.keypair, data)
    }

    /// Validate a peer's credential chain against this fabric's trust root.
    /// Returns the decoded NOC on success.
    pub fn verify_credentials(
        &self,
        peer_noc: &[u8],
        peer_icac: Option<&[u8]>,
    ) -> Result<MatterCert> {
        let noc = cert_matter::decode(peer_noc)?;
        let signer_public_key = match peer_icac {
            Some(icac_bytes) => {
                let icac = cert_matter::decode(icac_bytes)?;
                if !icac.is_ca {
                    return Err(
                        MatterError::CertChainInvalid("intermediate is not a ca".into()).into(),
                    );
                }
                cert_matter::verify_signature(&icac, &self.root_public_key)?;
                check_timeliness(&icac)?;
                icac.public_key.clone()
            }
            None => self.root_public_key.clone(),
        };
        cert_matter::verify_signature(&noc, &signer_public_key)?;
        check_timeliness(&noc)?;
        if noc.subject_node_id().is_none() {
            return Err(MatterError::CertChainInvalid("noc carries no node id".into()).into());
        }
        if let Some(fabric_id) = noc.subject_fabric_id() {
            if fabric_id != self.id {
                return Err(MatterError::CertChainInvalid(format!(
                    "noc fabric id {:#x} does not match {:#x}",
                    fabric_id, self.id
                ))
                .into());
            }
        }
        Ok(noc)
    }
}

fn check_timeliness(cert: &MatterCert) -> Result<()> {
    // clock may be absent on constrained targets; skip the check then
    let Ok(now) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) else {
        return Ok(());
    };
    if !cert.is_time_valid(now.as_secs()) {
        return Err(MatterError::CertChainInvalid("certificate outside validity".into()).into());
    }
    Ok(())
}

/// Read-only lookup over the commissioned fabrics of this node.
pub struct FabricStore {
    fabrics: Vec<Arc<Fabric>>,
}

impl FabricStore {
    pub fn new(fabrics: Vec<Arc<Fabric>>) -> Self {
        Self { fabrics }
    }

    pub fn by_index(&self, index: u8) -> Option<Arc<Fabric>> {
        self.fabrics.iter().find(|f| f.index == index).cloned()
    }

    pub fn fabrics(&self) -> &[Arc<Fabric>] {
        &self.fabrics
    }

    /// Locate the fabric a sigma1 destination id addresses. The candidate id
    /// is recomputed per fabric from the initiator random; comparison does
    /// not early-exit.
    pub fn find_by_destination_id(
        &self,
        destination_id: &[u8],
        initiator_random: &[u8],
    ) -> Result<Arc<Fabric>> {
        for fabric in &self.fabrics {
            let candidate = fabric.destination_id(initiator_random, fabric.node_id)?;
            if cryptoutil::ct_equal(&candidate, destination_id) {
                return Ok(fabric.clone());
            }
        }
        Err(MatterError::FabricNotFound.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_ids() {
        let fabric = Fabric::generate(1, 0x2906, 0x55).unwrap();
        assert_eq!(fabric.operational_id().unwrap().len(), 8);
        assert_eq!(fabric.operational_ipk().unwrap().len(), 16);
        // stable per fabric
        assert_eq!(
            fabric.operational_id().unwrap(),
            fabric.operational_id().unwrap()
        );
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(Fabric::generate(0, 1, 1).is_err());
        assert!(Fabric::generate(255, 1, 1).is_err());
        assert!(Fabric::generate(1, 1, 0).is_err());
        assert!(Fabric::generate(1, 1, 0xFFFF_FFFF_FFFF_FFFF).is_err());
    }

    #[test]
    fn test_destination_id_lookup() {
        let f1 = Arc::new(Fabric::generate(1, 0x1000, 0x11).unwrap());
        let f2 = Arc::new(Fabric::generate(2, 0x2000, 0x22).unwrap());
        let store = FabricStore::new(vec![f1.clone(), f2.clone()]);

        let random = cryptoutil::random_bytes(32);
        let dst = f2.destination_id(&random, 0x22).unwrap();
        let found = store.find_by_destination_id(&dst, &random).unwrap();
        assert_eq!(found.index, 2);

        // same destination id with a different random matches nothing
        let other_random = cryptoutil::random_bytes(32);
        let err = store
            .find_by_destination_id(&dst, &other_random)
            .unwrap_err();
        assert_eq!(MatterError::of(&err), Some(&MatterError::FabricNotFound));
    }

    #[test]
    fn test_sign_verifies_with_noc_key() {
        let fabric = Fabric::generate(1, 0x1000, 0x11).unwrap();
        let sig = fabric.sign(b"to be signed").unwrap();
        let noc = cert_matter::decode(&fabric.noc).unwrap();
        cryptoutil::verify(&noc.public_key, b"to be signed", &sig).unwrap();
    }

    #[test]
    fn test_verify_credentials() {
        let fabric = Fabric::generate(1, 0x1000, 0x11).unwrap();
        // a second node on the same fabric presents its noc
        let peer = {
            let ca_key = p256::SecretKey::random(&mut rand::thread_rng());
            let root = cert_matter::generate_root(1, &ca_key).unwrap();
            let node_key = p256::SecretKey::random(&mut rand::thread_rng());
            let noc = cert_matter::generate_noc(
                0x99,
                0x1000,
                &node_key.public_key().to_sec1_bytes(),
                &root,
                &ca_key,
            )
            .unwrap();
            cert_matter::encode(&noc).unwrap()
        };
        // signed by a different root: chain must fail
        assert!(fabric.verify_credentials(&peer, None).is_err());

        // our own noc verifies against our root
        let noc = fabric.verify_credentials(&fabric.noc.clone(), None).unwrap();
        assert_eq!(noc.subject_node_id(), Some(0x11));
    }
}
