// Narinfo signing
//
// Ed25519 signatures in the format Nix checks against trusted-public-keys.
// Secret keys use the `nix-store --generate-binary-cache-key` layout:
// `<name>:<base64(seed || public)>`.

use crate::error::{CacheServerError, Result};
use crate::types::NarInfo;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fs;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

/// Signing key of one cache instance
#[derive(Clone)]
pub struct NarinfoSigner {
    key_name: String,
    signing_key: SigningKey,
}

impl NarinfoSigner {
    /// Create a signer from an existing key
    pub fn new(key_name: String, signing_key: SigningKey) -> Self {
        Self {
            key_name,
            signing_key,
        }
    }

    /// Create a signer with a fresh random key
    pub fn generate(key_name: String) -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(seed.as_mut());
        Self::new(key_name, SigningKey::from_bytes(&seed))
    }

    /// Parse a secret key in Nix format
    ///
    /// Accepts both the 64 byte `seed || public` payload Nix writes and a bare
    /// 32 byte seed.
    pub fn from_nix_secret(secret: &str) -> Result<Self> {
        let (name, encoded) = secret.trim().split_once(':').ok_or_else(|| {
            CacheServerError::ConfigInvalid("Signing key must look like <name>:<base64>".to_string())
        })?;

        let bytes = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| {
                    CacheServerError::ConfigInvalid(format!("Failed to decode signing key: {}", e))
                })?,
        );

        if bytes.len() != 32 && bytes.len() != 64 {
            return Err(CacheServerError::ConfigInvalid(format!(
                "Signing key must be 32 or 64 bytes, got {}",
                bytes.len()
            )));
        }

        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&bytes[..32]);
        let signing_key = SigningKey::from_bytes(&seed);

        if bytes.len() == 64 && signing_key.verifying_key().as_bytes() != &bytes[32..] {
            return Err(CacheServerError::ConfigInvalid(format!(
                "Public half of signing key {} does not match its seed",
                name
            )));
        }

        Ok(Self::new(name.to_string(), signing_key))
    }

    /// Read the key stored at `path`, or generate and persist one
    pub fn load_or_generate(path: &Path, key_name: &str) -> Result<Self> {
        if path.exists() {
            let secret = Zeroizing::new(fs::read_to_string(path)?);
            return Self::from_nix_secret(&secret);
        }

        let signer = Self::generate(key_name.to_string());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, signer.to_nix_secret().as_bytes())?;
        info!("Generated signing key {} at {}", key_name, path.display());

        Ok(signer)
    }

    /// Name that prefixes every signature
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Secret key in Nix format
    pub fn to_nix_secret(&self) -> Zeroizing<String> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(64));
        bytes.extend_from_slice(self.signing_key.as_bytes());
        bytes.extend_from_slice(self.signing_key.verifying_key().as_bytes());
        Zeroizing::new(format!(
            "{}:{}",
            self.key_name,
            base64::engine::general_purpose::STANDARD.encode(bytes.as_slice())
        ))
    }

    /// Public key in Nix format, as listed in trusted-public-keys
    pub fn public_key(&self) -> String {
        let verifying_key: VerifyingKey = self.signing_key.verifying_key();
        format!(
            "{}:{}",
            self.key_name,
            base64::engine::general_purpose::STANDARD.encode(verifying_key.as_bytes())
        )
    }

    /// Sign a fingerprint, returning `<name>:<base64 signature>`
    pub fn sign(&self, fingerprint: &str) -> String {
        let signature = self.signing_key.sign(fingerprint.as_bytes());
        format!(
            "{}:{}",
            self.key_name,
            base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
        )
    }

    /// Replace every signature on `info` with ours
    pub fn sign_narinfo(&self, info: &mut NarInfo) {
        let sig = self.sign(&info.fingerprint());
        info.sigs = vec![sig];
    }

    /// Check that `info` carries a valid signature from this key
    pub fn verify_narinfo(&self, info: &NarInfo) -> bool {
        let fingerprint = info.fingerprint();
        let verifying_key = self.signing_key.verifying_key();

        info.sigs.iter().any(|sig| {
            let Some((name, encoded)) = sig.split_once(':') else {
                return false;
            };
            if name != self.key_name {
                return false;
            }
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                return false;
            };
            let Ok(signature) = Signature::from_slice(&bytes) else {
                return false;
            };
            verifying_key
                .verify(fingerprint.as_bytes(), &signature)
                .is_ok()
        })
    }
}

/// Key name used when a cache has no configured signing key
pub fn default_key_name(cache: &str, hostname: &str) -> String {
    format!("{}.{}-1", cache, hostname)
}
