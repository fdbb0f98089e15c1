//! Authenticated encryption for credential blobs.
//!
//! Credentials are stored as opaque tokens of the form
//! `Base64( IV[12] ‖ tag[16] ‖ ciphertext )` under AES-256-GCM. The 32-byte
//! key comes from configuration: a 64-hex-character value is used raw,
//! anything else is stretched with scrypt under a fixed salt. Tokens carry a
//! fresh random IV, so encrypting the same plaintext twice yields distinct
//! ciphertexts.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Fixed KDF salt; changing it invalidates every stored credential.
const KDF_SALT: &[u8] = b"flowmill-credential-store";

const DEV_PLACEHOLDER_KEY: &str = "flowmill-dev-placeholder-key";

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication tag mismatch: wrong key or tampered token.
    #[error("ciphertext authentication failed")]
    AuthFailed,

    /// The token is not valid base64 or is too short to contain IV and tag.
    #[error("malformed ciphertext token: {0}")]
    Malformed(String),
}

/// Generate a 32-byte cryptographically random token, hex-encoded.
///
/// Used for OAuth `state` values and anywhere else an unguessable opaque
/// string is needed.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// AES-256-GCM cipher over credential blobs, built once from configuration.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build the cipher from the configured key material.
    ///
    /// A 64-hex-character value decodes to the raw 32-byte key; any other
    /// value is treated as a passphrase and stretched with scrypt. Absence of
    /// key material is fatal in production and falls back to a constant
    /// placeholder (with a loud warning) in development.
    pub fn from_key_material(configured: Option<&str>, production: bool) -> anyhow::Result<Self> {
        let key = match configured {
            Some(k) if k.len() == 64 && k.bytes().all(|b| b.is_ascii_hexdigit()) => {
                let raw = hex::decode(k)?;
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&raw);
                key
            }
            Some(k) => derive_key(k)?,
            None if production => {
                anyhow::bail!("encryption key is not configured; refusing to start in production")
            }
            None => {
                tracing::warn!(
                    "encryption key is not configured; using an INSECURE development placeholder"
                );
                derive_key(DEV_PLACEHOLDER_KEY)?
            }
        };

        Ok(Self::from_key(key))
    }

    /// Build the cipher from a passphrase directly. Test convenience.
    pub fn from_passphrase(passphrase: &str) -> anyhow::Result<Self> {
        Ok(Self::from_key(derive_key(passphrase)?))
    }

    fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypt a JSON value into an opaque token.
    ///
    /// Strings are encrypted as-is; every other value is serialized to its
    /// canonical JSON representation first.
    pub fn encrypt(&self, value: &Value) -> Result<String, CryptoError> {
        let plaintext = match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)
                .map_err(|e| CryptoError::Malformed(e.to_string()))?,
        };
        self.encrypt_str(&plaintext)
    }

    fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Malformed("encryption failure".into()))?;

        // The AEAD output is ciphertext ‖ tag; the wire format wants the tag
        // up front, right after the IV.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut token = Vec::with_capacity(IV_LEN + TAG_LEN + body.len());
        token.extend_from_slice(&iv);
        token.extend_from_slice(tag);
        token.extend_from_slice(body);
        Ok(BASE64.encode(token))
    }

    /// Decrypt a token back into a JSON value.
    ///
    /// Plaintexts that parse as JSON come back as the parsed value; anything
    /// else comes back as a string (matching how plain strings are encrypted
    /// without quoting).
    pub fn decrypt(&self, token: &str) -> Result<Value, CryptoError> {
        let plaintext = self.decrypt_string(token)?;
        Ok(serde_json::from_str(&plaintext).unwrap_or(Value::String(plaintext)))
    }

    /// Decrypt a token into the raw plaintext string.
    pub fn decrypt_string(&self, token: &str) -> Result<String, CryptoError> {
        let raw = BASE64
            .decode(token)
            .map_err(|e| CryptoError::Malformed(format!("invalid base64: {e}")))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::Malformed(format!(
                "token too short: {} bytes",
                raw.len()
            )));
        }

        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_slice())
            .map_err(|_| CryptoError::AuthFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Malformed("plaintext is not UTF-8".into()))
    }
}

fn derive_key(material: &str) -> anyhow::Result<[u8; KEY_LEN]> {
    let params = scrypt::Params::new(14, 8, 1, KEY_LEN)
        .map_err(|e| anyhow::anyhow!("invalid scrypt params: {e}"))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(material.as_bytes(), KDF_SALT, &params, &mut key)
        .map_err(|e| anyhow::anyhow!("scrypt derivation failed: {e}"))?;
    Ok(key)
}
