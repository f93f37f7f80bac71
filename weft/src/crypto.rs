//! Symmetric encryption for sensitive config fields at rest.
//!
//! Persisted agent records may carry secrets (per-agent API keys, webhook
//! URLs). Encrypted string values are tagged with the literal prefix `enc:`
//! so plaintext and ciphertext can coexist in the same JSON/YAML documents.
//!
//! AES-256-GCM; the cipher key is SHA-256 of the configured key string, the
//! wire form is `enc:` + base64(nonce || ciphertext+tag).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix marking an encrypted string value in persisted documents.
pub const ENC_PREFIX: &str = "enc:";

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption key not configured")]
    NoKey,
    #[error("ciphertext is malformed: {0}")]
    Malformed(String),
    #[error("decryption failed (wrong key or tampered data)")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

fn cipher(key: &str) -> Aes256Gcm {
    let digest = Sha256::digest(key.as_bytes());
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest))
}

/// True when `value` carries the `enc:` tag.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENC_PREFIX)
}

/// Encrypts `plaintext`, returning the tagged wire form.
pub fn encrypt(plaintext: &str, key: &str) -> Result<String, CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::NoKey);
    }
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher(key)
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut wire = Vec::with_capacity(NONCE_LEN + sealed.len());
    wire.extend_from_slice(&nonce_bytes);
    wire.extend_from_slice(&sealed);
    Ok(format!("{ENC_PREFIX}{}", BASE64.encode(wire)))
}

/// Decrypts a value produced by [`encrypt`]. The `enc:` tag is optional on
/// input so callers can pass either the tagged or the raw base64 form.
pub fn decrypt(value: &str, key: &str) -> Result<String, CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::NoKey);
    }
    let encoded = value.strip_prefix(ENC_PREFIX).unwrap_or(value);
    let wire = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;
    if wire.len() <= NONCE_LEN {
        return Err(CryptoError::Malformed("too short".into()));
    }
    let (nonce_bytes, sealed) = wire.split_at(NONCE_LEN);
    let opened = cipher(key)
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(opened).map_err(|e| CryptoError::Malformed(e.to_string()))
}

/// Recursively decrypts every `enc:`-tagged string in a JSON document.
///
/// Used when loading DB-sourced agent configs: nested maps and lists are
/// walked; a value that fails to decrypt is kept as-is (and logged) so one
/// bad field does not drop the whole agent.
pub fn decrypt_json(value: serde_json::Value, key: &str) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, decrypt_json(v, key)))
                .collect(),
        ),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.into_iter().map(|v| decrypt_json(v, key)).collect(),
        ),
        serde_json::Value::String(s) if is_encrypted(&s) => match decrypt(&s, key) {
            Ok(plain) => serde_json::Value::String(plain),
            Err(e) => {
                tracing::warn!(error = %e, "failed to decrypt config value, keeping original");
                serde_json::Value::String(s)
            }
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "unit-test-key";

    #[test]
    fn encrypt_decrypt_round_trips() {
        let sealed = encrypt("sk-secret-value", KEY).unwrap();
        assert!(is_encrypted(&sealed));
        assert_eq!(decrypt(&sealed, KEY).unwrap(), "sk-secret-value");
    }

    #[test]
    fn decrypt_accepts_untagged_input() {
        let sealed = encrypt("v", KEY).unwrap();
        let raw = sealed.strip_prefix(ENC_PREFIX).unwrap();
        assert_eq!(decrypt(raw, KEY).unwrap(), "v");
    }

    #[test]
    fn wrong_key_fails_without_panicking() {
        let sealed = encrypt("v", KEY).unwrap();
        assert!(matches!(
            decrypt(&sealed, "other-key"),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let sealed = encrypt("v", KEY).unwrap();
        let mut wire = BASE64.decode(sealed.strip_prefix(ENC_PREFIX).unwrap()).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let tampered = format!("{ENC_PREFIX}{}", BASE64.encode(wire));
        assert!(decrypt(&tampered, KEY).is_err());
    }

    #[test]
    fn empty_key_is_an_error() {
        assert!(matches!(encrypt("v", ""), Err(CryptoError::NoKey)));
        assert!(matches!(decrypt("enc:abc", ""), Err(CryptoError::NoKey)));
    }

    /// **Scenario**: nested document with encrypted and plain values — only
    /// tagged strings change, everything else round-trips bit-identical.
    #[test]
    fn decrypt_json_walks_nested_structures() {
        let sealed = encrypt("plain-api-key", KEY).unwrap();
        let doc = json!({
            "id": "bot",
            "api_key": sealed,
            "tools": [{"name": "t", "url": encrypt("https://hook", KEY).unwrap()}],
            "top_k": 5,
        });
        let out = decrypt_json(doc, KEY);
        assert_eq!(out["api_key"], "plain-api-key");
        assert_eq!(out["tools"][0]["url"], "https://hook");
        assert_eq!(out["id"], "bot");
        assert_eq!(out["top_k"], 5);
    }

    #[test]
    fn decrypt_json_keeps_undecryptable_values() {
        let doc = json!({"k": "enc:not-valid-base64!!"});
        let out = decrypt_json(doc, KEY);
        assert_eq!(out["k"], "enc:not-valid-base64!!");
    }
}
