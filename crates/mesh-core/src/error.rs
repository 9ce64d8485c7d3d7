use thiserror::Error;

/// Shared lightweight error type for cross-crate plumbing.
///
/// Individual components define narrower error enums (`KeyStoreError`,
/// `OtaError`, ...); this type is used where a component boundary needs a
/// single error shape, e.g. the dispatcher in `mesh-hub`.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::MeshError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            MeshError::NotFound("esp32-kitchen".to_string()).to_string(),
            "not found: esp32-kitchen"
        );
    }
}
