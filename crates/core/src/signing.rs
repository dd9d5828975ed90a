//! The tool's RSA signing key: signs LTI Advantage client assertions and is
//! published as a JWK so platforms can verify them.

use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MarginError, Result};

/// A public key in JWK form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Clone)]
pub struct ToolKey {
    kid: String,
    encoding_key: EncodingKey,
    jwk: Jwk,
}

impl std::fmt::Debug for ToolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolKey").field("kid", &self.kid).finish_non_exhaustive()
    }
}

impl ToolKey {
    /// Generate a fresh 2048-bit key, returned as PKCS#1 PEM.
    pub fn generate_pem() -> Result<String> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| MarginError::Crypto(format!("failed to generate RSA key: {e}")))?;
        let pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| MarginError::Crypto(format!("failed to encode RSA key: {e}")))?;
        Ok(pem.to_string())
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| MarginError::Crypto(format!("invalid RSA private key: {e}")))?;
        let public = key.to_public_key();
        let n = public.n().to_bytes_be();
        let e = public.e().to_bytes_be();
        // Stable across restarts, changes with the key.
        let kid = hex::encode(&Sha256::digest(&n)[..8]);

        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| MarginError::Crypto(format!("signing key error: {e}")))?;

        Ok(Self {
            jwk: Jwk {
                kty: "RSA".into(),
                use_: "sig".into(),
                alg: "RS256".into(),
                kid: kid.clone(),
                n: URL_SAFE_NO_PAD.encode(n),
                e: URL_SAFE_NO_PAD.encode(e),
            },
            kid,
            encoding_key,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_pem(&std::fs::read_to_string(path)?)
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// Sign `claims` as an RS256 JWT carrying our `kid`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| MarginError::Crypto(format!("JWT encoding error: {e}")))
    }
}
