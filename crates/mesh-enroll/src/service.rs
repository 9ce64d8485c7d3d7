use hmac::{Hmac, Mac};
use mesh_crypto::{CertificateAuthority, KeyStore};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::pin::PendingEnrollment;

type HmacSha256 = Hmac<Sha256>;

const PBKDF2_ITERATIONS: u32 = 100_000;
const DERIVED_KEY_LEN: usize = 32;

/// Response payload for `ENROLL_RESPONSE` (spec §4.9, §8).
#[derive(Debug, Serialize)]
pub struct EnrollResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_psk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_pem: Option<String>,
}

impl EnrollResult {
    fn error(reason: &'static str) -> Self {
        Self {
            status: "error",
            reason: Some(reason),
            encrypted_psk: None,
            salt: None,
            cert_pem: None,
            key_pem: None,
            ca_cert_pem: None,
        }
    }
}

/// Owns at most one [`PendingEnrollment`] and performs PIN-proof
/// verification plus sealed PSK delivery for newly enrolled devices.
pub struct EnrollmentService {
    pin_length: u32,
    pending: Option<PendingEnrollment>,
}

impl EnrollmentService {
    pub fn new(pin_length: u32) -> Self {
        Self { pin_length, pending: None }
    }

    /// Generates a fresh PIN, replacing any prior one. Returns the
    /// plaintext PIN for out-of-band communication to the device.
    pub fn create_pin(&mut self, max_age: f64, max_attempts: u32, now: f64) -> String {
        let pending = PendingEnrollment::new(self.pin_length, max_age, max_attempts, now);
        let pin = pending.pin.clone();
        self.pending = Some(pending);
        pin
    }

    pub fn is_active(&self, now: f64) -> bool {
        self.pending.as_ref().is_some_and(|p| p.is_active(now))
    }

    pub fn cancel_pin(&mut self) {
        self.pending = None;
    }

    /// Handles one `ENROLL_REQUEST`: verifies `pin_proof`, and on success
    /// enrolls `source` into `keystore` (and, if `ca` is available, issues
    /// a device certificate), sealing the PSK under a PBKDF2-derived
    /// one-time pad (spec §4.9 step 5).
    pub fn handle_request(
        &mut self,
        source: &str,
        name: &str,
        pin_proof_hex: &str,
        keystore: &mut KeyStore,
        ca: Option<&CertificateAuthority>,
        now: f64,
    ) -> EnrollResult {
        let Some(pending) = self.pending.as_mut() else {
            return EnrollResult::error("no_active_enrollment");
        };

        let expected_proof = compute_pin_proof(&pending.pin, source);
        let matches = expected_proof.as_bytes().ct_eq(pin_proof_hex.as_bytes()).unwrap_u8() == 1;
        if !matches {
            pending.attempts += 1;
            if pending.attempts >= pending.max_attempts {
                pending.locked = true;
                debug!(source, "enrollment: pin locked after repeated failures");
                return EnrollResult::error("locked");
            }
            debug!(source, attempts = pending.attempts, "enrollment: invalid pin proof");
            return EnrollResult::error("invalid_pin");
        }

        if pending.locked {
            return EnrollResult::error("locked");
        }
        if pending.is_expired(now) {
            return EnrollResult::error("expired");
        }
        if pending.used {
            return EnrollResult::error("already_used");
        }

        let pin = pending.pin.clone();
        let psk_hex = match keystore.add(source, name, now) {
            Ok(psk) => psk,
            Err(err) => {
                debug!(source, error = %err, "enrollment: keystore write failed");
                return EnrollResult::error("internal_error");
            }
        };
        pending.used = true;

        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut derived_key = [0u8; DERIVED_KEY_LEN];
        pbkdf2_hmac::<Sha256>(pin.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut derived_key);

        let psk_bytes = hex::decode(&psk_hex).unwrap_or_default();
        let encrypted_psk: Vec<u8> =
            psk_bytes.iter().zip(derived_key.iter().cycle()).map(|(a, b)| a ^ b).collect();

        let (cert_pem, key_pem, ca_cert_pem) = match ca {
            Some(ca) => match ca.issue_device_cert(source) {
                Ok(identity) => (Some(identity.cert_pem), Some(identity.key_pem), Some(identity.ca_cert_pem)),
                Err(err) => {
                    debug!(source, error = %err, "enrollment: CA cert issuance failed");
                    (None, None, None)
                }
            },
            None => (None, None, None),
        };

        EnrollResult {
            status: "ok",
            reason: None,
            encrypted_psk: Some(hex::encode(encrypted_psk)),
            salt: Some(hex::encode(salt)),
            cert_pem,
            key_pem,
            ca_cert_pem,
        }
    }
}

/// `pin_proof = hex(HMAC-SHA256(key=PIN_utf8, msg=source_node_id_utf8))`.
pub fn compute_pin_proof(pin: &str, source_node_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(pin.as_bytes()).expect("HMAC accepts any key length");
    mac.update(source_node_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_keystore() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(dir.path().join("mesh_keys.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn happy_path_enrolls_device_and_seals_psk() {
        let (_dir, mut keystore) = new_keystore();
        let mut service = EnrollmentService::new(6);
        let pin = service.create_pin(300.0, 3, 0.0);
        let proof = compute_pin_proof(&pin, "esp32-kitchen");

        let result = service.handle_request("esp32-kitchen", "Kitchen Sensor", &proof, &mut keystore, None, 1.0);
        assert_eq!(result.status, "ok");
        assert!(result.encrypted_psk.is_some());
        assert_eq!(hex::decode(result.salt.unwrap()).unwrap().len(), 16);
        assert!(keystore.contains("esp32-kitchen"));
    }

    #[test]
    fn second_request_with_same_pin_is_already_used() {
        let (_dir, mut keystore) = new_keystore();
        let mut service = EnrollmentService::new(6);
        let pin = service.create_pin(300.0, 3, 0.0);
        let proof = compute_pin_proof(&pin, "esp32-kitchen");
        service.handle_request("esp32-kitchen", "Kitchen Sensor", &proof, &mut keystore, None, 1.0);

        let second = service.handle_request("esp32-kitchen", "Kitchen Sensor", &proof, &mut keystore, None, 2.0);
        assert_eq!(second.status, "error");
        assert_eq!(second.reason, Some("already_used"));
    }

    #[test]
    fn wrong_pin_three_times_locks_the_window() {
        let (_dir, mut keystore) = new_keystore();
        let mut service = EnrollmentService::new(6);
        service.create_pin(300.0, 3, 0.0);
        for i in 0..2 {
            let result = service.handle_request("esp32-kitchen", "Kitchen", "deadbeef", &mut keystore, None, i as f64);
            assert_eq!(result.reason, Some("invalid_pin"));
        }
        let locked = service.handle_request("esp32-kitchen", "Kitchen", "deadbeef", &mut keystore, None, 2.0);
        assert_eq!(locked.reason, Some("locked"));
        assert!(!service.is_active(2.0));
    }

    #[test]
    fn no_active_enrollment_is_rejected() {
        let (_dir, mut keystore) = new_keystore();
        let mut service = EnrollmentService::new(6);
        let result = service.handle_request("esp32-kitchen", "Kitchen", "deadbeef", &mut keystore, None, 0.0);
        assert_eq!(result.reason, Some("no_active_enrollment"));
    }

    #[test]
    fn expired_pin_is_rejected_even_with_correct_proof() {
        let (_dir, mut keystore) = new_keystore();
        let mut service = EnrollmentService::new(6);
        let pin = service.create_pin(10.0, 3, 0.0);
        let proof = compute_pin_proof(&pin, "esp32-kitchen");
        let result = service.handle_request("esp32-kitchen", "Kitchen", &proof, &mut keystore, None, 20.0);
        assert_eq!(result.reason, Some("expired"));
    }

    #[test]
    fn cancel_pin_deactivates_the_window() {
        let mut service = EnrollmentService::new(6);
        service.create_pin(300.0, 3, 0.0);
        assert!(service.is_active(0.0));
        service.cancel_pin();
        assert!(!service.is_active(0.0));
    }
}
