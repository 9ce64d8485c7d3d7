use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use mesh_core::Envelope;
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::keystore::KeyStore;

type HmacSha256 = Hmac<Sha256>;

/// Literal domain separator for encryption key derivation (spec §4.5).
/// Part of the wire contract: every implementation must derive the same
/// `enc_key` from a given PSK for interoperability.
const ENC_KEY_DOMAIN: &[u8] = b"mesh-encrypt-v1";

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("unknown sender, cannot derive decryption key")]
    UnknownSender,
    #[error("aead operation failed")]
    CryptoFailure,
    #[error("encrypted payload is not valid hex")]
    InvalidEncoding,
}

fn derive_enc_key(psk: &str) -> [u8; 32] {
    let key_bytes = hex::decode(psk).unwrap_or_else(|_| psk.as_bytes().to_vec());
    let mut mac = HmacSha256::new_from_slice(&key_bytes).expect("HMAC accepts any key length");
    mac.update(ENC_KEY_DOMAIN);
    mac.finalize().into_bytes().into()
}

fn build_aad(env: &Envelope) -> Vec<u8> {
    let type_str = serde_json::to_value(env.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!("{}|{}|{}|{}", type_str, env.source, env.target, env.ts).into_bytes()
}

/// Applies when all of: encryption enabled, target is a known
/// non-broadcast peer, and `env.kind` is CHAT/COMMAND/RESPONSE (spec
/// §4.5). Otherwise the caller should leave the payload in cleartext.
pub fn should_encrypt(env: &Envelope, encryption_enabled: bool, target_is_broadcast: bool) -> bool {
    encryption_enabled && !target_is_broadcast && env.kind.is_encryptable()
}

/// Encrypts `env.payload` in place under the PSK-derived key, moving the
/// ciphertext into `encrypted_payload`/`iv` and clearing `payload`.
pub fn encrypt_payload(env: &mut Envelope, psk: &str) -> Result<(), AeadError> {
    let key_bytes = derive_enc_key(psk);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let mut iv = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);
    let plaintext = serde_json::to_vec(&Value::Object(env.payload.clone())).map_err(|_| AeadError::CryptoFailure)?;
    let aad = build_aad(env);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: &plaintext, aad: &aad })
        .map_err(|_| AeadError::CryptoFailure)?;
    env.encrypted_payload = Some(hex::encode(&ciphertext));
    env.iv = Some(hex::encode(iv));
    env.payload = Map::new();
    Ok(())
}

/// Decrypts `env.encrypted_payload` in place if present, replacing
/// `env.payload` with the decoded mapping. A no-op if `encrypted_payload`
/// is absent. On any failure — missing key, wrong key, tampered AAD
/// metadata — returns `Err` and leaves `env` untouched; the caller is
/// expected to drop the message rather than act on stale cleartext.
pub fn decrypt_payload(env: &mut Envelope, keystore: &KeyStore) -> Result<(), AeadError> {
    let Some(encoded_ciphertext) = env.encrypted_payload.clone() else {
        return Ok(());
    };
    let Some(encoded_iv) = env.iv.clone() else {
        return Err(AeadError::InvalidEncoding);
    };
    let Some(psk) = keystore.get(&env.source) else {
        debug!(source = %env.source, "aead: no key for sender, dropping encrypted message");
        return Err(AeadError::UnknownSender);
    };
    let key_bytes = derive_enc_key(psk);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let iv = hex::decode(encoded_iv).map_err(|_| AeadError::InvalidEncoding)?;
    if iv.len() != 12 {
        return Err(AeadError::InvalidEncoding);
    }
    let ciphertext = hex::decode(encoded_ciphertext).map_err(|_| AeadError::InvalidEncoding)?;
    let nonce = Nonce::from_slice(&iv);
    let aad = build_aad(env);
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: &ciphertext, aad: &aad })
        .map_err(|_| {
            debug!(source = %env.source, "aead: decryption failed, dropping message");
            AeadError::CryptoFailure
        })?;
    let value: Value = serde_json::from_slice(&plaintext).map_err(|_| AeadError::CryptoFailure)?;
    let Value::Object(map) = value else {
        return Err(AeadError::CryptoFailure);
    };
    env.payload = map;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::MessageType;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let psk = store.add("esp32-kitchen", "Kitchen", 0.0).unwrap();

        let mut env = Envelope::new(MessageType::Chat, "esp32-kitchen", "hub", 42.0);
        env.payload.insert("text".to_string(), Value::String("hello".to_string()));
        encrypt_payload(&mut env, &psk).unwrap();
        assert!(env.payload.is_empty());
        assert!(env.encrypted_payload.is_some());

        decrypt_payload(&mut env, &store).unwrap();
        assert_eq!(env.payload.get("text").unwrap(), "hello");
    }

    #[test]
    fn decrypt_is_a_no_op_when_nothing_is_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let mut env = Envelope::new(MessageType::Ping, "esp32-kitchen", "hub", 0.0);
        decrypt_payload(&mut env, &store).unwrap();
        assert!(env.payload.is_empty());
    }

    #[test]
    fn decrypt_fails_closed_for_unknown_sender() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let psk = store.add("esp32-kitchen", "Kitchen", 0.0).unwrap();
        let mut env = Envelope::new(MessageType::Chat, "esp32-kitchen", "hub", 0.0);
        env.payload.insert("text".to_string(), Value::String("hi".to_string()));
        encrypt_payload(&mut env, &psk).unwrap();
        env.source = "unknown".to_string();
        assert!(decrypt_payload(&mut env, &store).is_err());
    }

    #[test]
    fn tampered_metadata_fails_aad_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let psk = store.add("esp32-kitchen", "Kitchen", 0.0).unwrap();
        let mut env = Envelope::new(MessageType::Chat, "esp32-kitchen", "hub", 0.0);
        env.payload.insert("text".to_string(), Value::String("hi".to_string()));
        encrypt_payload(&mut env, &psk).unwrap();
        env.ts = 1.0;
        assert!(decrypt_payload(&mut env, &store).is_err());
    }

    #[test]
    fn should_encrypt_only_for_chat_command_response_to_non_broadcast() {
        let env = Envelope::new(MessageType::Chat, "hub", "esp32-kitchen", 0.0);
        assert!(should_encrypt(&env, true, false));
        assert!(!should_encrypt(&env, false, false));
        assert!(!should_encrypt(&env, true, true));
        let ping = Envelope::new(MessageType::Ping, "hub", "esp32-kitchen", 0.0);
        assert!(!should_encrypt(&ping, true, false));
    }

}
