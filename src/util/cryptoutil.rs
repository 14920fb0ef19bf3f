//! Crypto primitive set: SHA-256, HKDF, HMAC, AES-128-CCM, P-256 ECDH and
//! ECDSA, randomness. All operations are synchronous; AEAD and signature
//! failures surface as [MatterError::Crypto] / [MatterError::SignatureInvalid]
//! so callers can branch without parsing messages.

use aes::cipher::crypto_common;
use anyhow::Result;
use ecdsa::signature::{Signer, Verifier};
use hmac::Mac;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::MatterError;

pub(crate) type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// SHA-256 over the concatenation of several chunks.
pub fn sha256_many(chunks: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for c in chunks {
        hasher.update(c);
    }
    hasher.finalize().to_vec()
}

pub fn hkdf_sha256(salt: &[u8], secret: &[u8], info: &[u8], size: usize) -> Result<Vec<u8>> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; size];
    match hk.expand(info, &mut okm) {
        Ok(()) => Ok(okm),
        Err(e) => Err(MatterError::Crypto(format!("hkdf expand: {:?}", e)).into()),
    }
}

pub fn hmac_sha256(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    match hmac::Hmac::<Sha256>::new_from_slice(key) {
        Ok(mut hm) => {
            hm.update(data);
            Ok(hm.finalize().into_bytes().to_vec())
        }
        Err(e) => Err(MatterError::Crypto(format!("hmac key: {:?}", e)).into()),
    }
}

fn ccm_cipher(key: &[u8]) -> Result<Aes128Ccm> {
    if key.len() != 16 {
        return Err(MatterError::Crypto(format!("aes key length {}", key.len())).into());
    }
    let key = crypto_common::Key::<Aes128Ccm>::from_slice(key);
    Ok(<Aes128Ccm as ccm::KeyInit>::new(key))
}

pub fn aes128_ccm_encrypt(key: &[u8], nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = ccm_cipher(key)?;
    match ccm::aead::Aead::encrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(MatterError::Crypto(format!("encrypt: {:?}", e)).into()),
    }
}

pub fn aes128_ccm_decrypt(key: &[u8], nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = ccm_cipher(key)?;
    match ccm::aead::Aead::decrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(_) => Err(MatterError::Crypto("decrypt: tag mismatch".into()).into()),
    }
}

/// ECDSA P-256 signature as raw r||s (64 bytes).
pub fn sign(key: &p256::SecretKey, data: &[u8]) -> Result<Vec<u8>> {
    let signing = ecdsa::SigningKey::from(key.clone());
    let sig: ecdsa::Signature<p256::NistP256> = signing.sign(data);
    Ok(sig.to_bytes().to_vec())
}

/// Verify a raw r||s signature against an uncompressed SEC1 public key.
pub fn verify(pubkey_sec1: &[u8], data: &[u8], sig: &[u8]) -> Result<()> {
    let vk = ecdsa::VerifyingKey::<p256::NistP256>::from_sec1_bytes(pubkey_sec1)
        .map_err(|e| MatterError::Crypto(format!("public key: {:?}", e)))?;
    let sig = ecdsa::Signature::<p256::NistP256>::from_slice(sig)
        .map_err(|e| MatterError::Crypto(format!("signature form: {:?}", e)))?;
    vk.verify(data, &sig)
        .map_err(|_| MatterError::SignatureInvalid)?;
    Ok(())
}

/// ECDH shared secret from a static secret key and a peer SEC1 public key.
pub fn ecdh_shared_secret(secret: &p256::SecretKey, peer_pub_sec1: &[u8]) -> Result<Vec<u8>> {
    let peer = p256::PublicKey::from_sec1_bytes(peer_pub_sec1)
        .map_err(|e| MatterError::Crypto(format!("peer public key: {:?}", e)))?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Ok(shared.raw_secret_bytes().to_vec())
}

/// Constant-time byte comparison (no early exit on first mismatch).
pub fn ct_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
