use std::env;

use base64::{prelude::BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_KEY_ENV: &str = "TURBO_REMOTE_CACHE_SIGNATURE_KEY";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error(
        "signature secret key not found. You must specify a secret key in the \
         TURBO_REMOTE_CACHE_SIGNATURE_KEY environment variable"
    )]
    NoSignatureSecretKey,
    #[error("base64 encoding error: {0}")]
    Base64EncodingError(#[from] base64::DecodeError),
    #[error(transparent)]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// Signs and verifies artifact bodies with a team-scoped secret. The tag is
/// an HMAC-SHA256 over `hash || team_id || body`, base64-encoded and carried
/// in the `x-artifact-tag` header.
#[derive(Debug)]
pub struct ArtifactSignatureAuthenticator {
    team_id: Vec<u8>,
    // test override so env var state can't race across tests
    secret_key_override: Option<Vec<u8>>,
}

impl ArtifactSignatureAuthenticator {
    pub fn new(team_id: Vec<u8>, secret_key_override: Option<Vec<u8>>) -> Self {
        Self {
            team_id,
            secret_key_override,
        }
    }

    fn secret_key(&self) -> Result<Vec<u8>, SignatureError> {
        if let Some(secret_key) = &self.secret_key_override {
            return Ok(secret_key.clone());
        }
        Ok(env::var(SIGNATURE_KEY_ENV)
            .map_err(|_| SignatureError::NoSignatureSecretKey)?
            .into_bytes())
    }

    fn mac(&self, hash: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)?;
        mac.update(hash);
        mac.update(&self.team_id);
        Ok(mac)
    }

    pub fn generate_tag(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
    ) -> Result<String, SignatureError> {
        let mut mac = self.mac(hash)?;
        mac.update(artifact_body);
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    pub fn validate(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
        expected_tag: &str,
    ) -> Result<bool, SignatureError> {
        let mut mac = self.mac(hash)?;
        mac.update(artifact_body);
        let expected_bytes = BASE64_STANDARD.decode(expected_tag)?;
        Ok(mac.verify_slice(&expected_bytes).is_ok())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn authenticator() -> ArtifactSignatureAuthenticator {
        ArtifactSignatureAuthenticator::new(b"team_abc".to_vec(), Some(b"secret".to_vec()))
    }

    #[test]
    fn test_round_trip() {
        let auth = authenticator();
        let tag = auth.generate_tag(b"hash1", b"artifact body").unwrap();
        assert!(auth.validate(b"hash1", b"artifact body", &tag).unwrap());
    }

    #[test]
    fn test_tampered_body_fails() {
        let auth = authenticator();
        let tag = auth.generate_tag(b"hash1", b"artifact body").unwrap();
        assert!(!auth.validate(b"hash1", b"tampered body", &tag).unwrap());
        assert!(!auth.validate(b"hash2", b"artifact body", &tag).unwrap());
    }

    #[test]
    fn test_different_team_different_tag() {
        let a = ArtifactSignatureAuthenticator::new(b"team_a".to_vec(), Some(b"secret".to_vec()));
        let b = ArtifactSignatureAuthenticator::new(b"team_b".to_vec(), Some(b"secret".to_vec()));
        let tag_a = a.generate_tag(b"hash", b"body").unwrap();
        let tag_b = b.generate_tag(b"hash", b"body").unwrap();
        assert_ne!(tag_a, tag_b);
    }

    #[test]
    fn test_missing_key_errors() {
        let auth = ArtifactSignatureAuthenticator::new(b"team".to_vec(), None);
        // ensure the env var is absent for this check
        std::env::remove_var(SIGNATURE_KEY_ENV);
        assert!(matches!(
            auth.generate_tag(b"h", b"b"),
            Err(SignatureError::NoSignatureSecretKey)
        ));
    }
}
