use mesh_core::Envelope;

/// Deterministic serialization of `env` used as the HMAC input (spec §4.1).
///
/// Defined as the same JSON object with `hmac` and `nonce` fields removed,
/// object keys sorted lexicographically, no insignificant whitespace, UTF-8
/// output. `hmac`/`nonce` are excluded to break the self-reference: the
/// signature cannot cover itself.
///
/// `serde_json::Map` is backed by a `BTreeMap` in this workspace (the
/// `preserve_order` feature is never enabled), so converting the envelope to
/// a `serde_json::Value` already yields lexicographically sorted object
/// keys at every nesting level; `serde_json::to_vec` never inserts
/// insignificant whitespace.
pub fn canonical_bytes(env: &Envelope) -> Vec<u8> {
    let mut value = serde_json::to_value(env).expect("Envelope always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("hmac");
        obj.remove("nonce");
    }
    serde_json::to_vec(&value).expect("canonical value always serializes")
}

#[cfg(test)]
mod tests {
    use super::canonical_bytes;
    use mesh_core::{Envelope, MessageType};

    #[test]
    fn hmac_and_nonce_do_not_affect_canonical_bytes() {
        let mut a = Envelope::new(MessageType::Ping, "hub", "dev-1", 10.0);
        let mut b = a.clone();
        a.hmac = Some("aa".repeat(32));
        a.nonce = Some("bb".repeat(8));
        b.hmac = None;
        b.nonce = None;
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn canonical_bytes_are_deterministic_and_whitespace_free() {
        let env = Envelope::new(MessageType::Ping, "hub", "dev-1", 10.0);
        let bytes = canonical_bytes(&env);
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains(' '));
        assert!(!text.contains('\n'));
        assert_eq!(canonical_bytes(&env), bytes);
    }

    #[test]
    fn object_keys_are_sorted_lexicographically() {
        let env = Envelope::new(MessageType::Ping, "hub", "dev-1", 10.0);
        let bytes = canonical_bytes(&env);
        let text = String::from_utf8(bytes).unwrap();
        let source_pos = text.find("\"source\"").unwrap();
        let target_pos = text.find("\"target\"").unwrap();
        let ts_pos = text.find("\"ts\"").unwrap();
        assert!(source_pos < target_pos);
        assert!(target_pos < ts_pos);
    }
}
