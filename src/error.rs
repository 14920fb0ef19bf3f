//! Typed error kinds for the protocol decision points.
//!
//! Most of the crate returns [`anyhow::Result`]; these kinds are attached
//! where a caller has to branch on the failure class (status-report
//! selection in CASE, post-close scanner calls, crypto tag mismatches).
//! Recover them with [`anyhow::Error::downcast_ref`].

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatterError {
    /// The peer sent bytes the protocol forbids.
    #[error("unexpected data: {0}")]
    UnexpectedData(String),
    /// A schema constraint was violated (missing mandatory field, bad range).
    #[error("validation failed: {0}")]
    Validation(String),
    /// A frame could not be parsed at all.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// No local fabric matches the destination id.
    #[error("no fabric matches destination id")]
    FabricNotFound,
    /// Certificate chain did not verify.
    #[error("certificate chain invalid: {0}")]
    CertChainInvalid(String),
    /// A signature did not verify.
    #[error("signature invalid")]
    SignatureInvalid,
    /// AEAD tag mismatch or other crypto failure.
    #[error("crypto operation failed: {0}")]
    Crypto(String),
    #[error("timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    /// Programmer error, non-recoverable at this layer.
    #[error("implementation error: {0}")]
    Implementation(String),
}

impl MatterError {
    /// Classify an `anyhow` error, if it carries one of our kinds.
    pub fn of(err: &anyhow::Error) -> Option<&MatterError> {
        err.downcast_ref::<MatterError>()
    }
}

#[cfg(test)]
mod tests {
    use super::MatterError;

    #[test]
    fn test_downcast_through_anyhow() {
        let e: anyhow::Error = MatterError::FabricNotFound.into();
        assert_eq!(MatterError::of(&e), Some(&MatterError::FabricNotFound));
        let plain = anyhow::anyhow!("something else");
        assert!(MatterError::of(&plain).is_none());
    }
}
