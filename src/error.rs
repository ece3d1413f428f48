use thiserror::Error;

/// Central error type for the cipherchat library.
///
/// Variants map one-to-one onto the failure classes the relay and client
/// distinguish: transport failures tear the connection down, protocol and
/// crypto failures are scoped to a single record, and `NotReady` rejects
/// sends attempted before the key exchange finished.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Connect/read/write failure on the underlying stream. Triggers a
    /// disconnect and a status notification; never retried automatically.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// A record that could not be decoded. The offending record is skipped
    /// and the connection continues.
    #[error("malformed record: {0}")]
    Protocol(String),

    /// Decryption failure: wrong key, malformed ciphertext, or a recovered
    /// session key that is not printable text.
    #[error("decryption failed: {0}")]
    Crypto(String),

    /// Key material that could not be parsed (bad base64, bad JSON, or a
    /// non-numeric exponent/modulus).
    #[error("malformed key material: {0}")]
    KeyFormat(String),

    /// An application send was attempted before the handshake reached the
    /// ready state. Callers should wait for key-exchange completion and retry.
    #[error("handshake not complete")]
    NotReady,
}

impl ChatError {
    /// Transport error for a peer that went away without an io error.
    pub(crate) fn closed(context: &str) -> Self {
        Self::Transport(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            context.to_string(),
        ))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
