//! Key storage, envelope authentication, AEAD payload encryption, and the
//! local device certificate authority (spec §4.3-4.6).

pub mod aead;
pub mod auth;
pub mod ca;
pub mod keystore;

pub use aead::{decrypt_payload, encrypt_payload, should_encrypt, AeadError};
pub use auth::AuthGuard;
pub use ca::{CaError, CertificateAuthority, DeviceIdentity};
pub use keystore::{KeyStore, KeyStoreEntry};
