//! Error kinds the router core distinguishes.
//!
//! Parsing/config errors abort startup; per-session errors close the session
//! but never the link layer; per-TX errors complete the TX but never evict the
//! DHT node table. Verification failures on received records drop the item and
//! still acknowledge upstream so askers are not left waiting.

/// A typed failure from the router core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Configuration file failed to parse or validate.
    ConfigInvalid(String),
    /// A key file could not be read or written.
    KeyIoError(String),
    /// A signature or AEAD tag failed to verify.
    CryptoVerifyFail,
    /// The peer is excluded by whitelist, blacklist, or strict-connect policy.
    PeerNotAllowed,
    /// A link session went silent past its timeout.
    SessionTimeout,
    /// The remote rejected or failed the session handshake.
    SessionRejected,
    /// A bounded queue refused the entry.
    QueueFull,
    /// A DHT transaction reached its deadline without an answer.
    DhtTimeout,
    /// A DHT message failed validation.
    DhtInvalidMessage,
    /// Not enough usable routers to assemble a path.
    PathBuildFail,
    /// The record is past its lifetime.
    Expired,
    /// The record or request was already seen.
    Duplicate,
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            RouterError::KeyIoError(msg) => write!(f, "key file i/o error: {msg}"),
            RouterError::CryptoVerifyFail => write!(f, "cryptographic verification failed"),
            RouterError::PeerNotAllowed => write!(f, "peer not allowed by policy"),
            RouterError::SessionTimeout => write!(f, "session timed out"),
            RouterError::SessionRejected => write!(f, "session rejected by remote"),
            RouterError::QueueFull => write!(f, "queue full"),
            RouterError::DhtTimeout => write!(f, "dht request timed out"),
            RouterError::DhtInvalidMessage => write!(f, "invalid dht message"),
            RouterError::PathBuildFail => write!(f, "path build failed"),
            RouterError::Expired => write!(f, "record expired"),
            RouterError::Duplicate => write!(f, "duplicate record"),
        }
    }
}

impl std::error::Error for RouterError {}
