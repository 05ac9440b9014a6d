use thiserror::Error;

/// Errors raised by the tunnel core.
///
/// Construction-time variants (`InvalidKey`, `InvalidPassword`) abort
/// startup; everything else is contained to the connection it occurred on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid password: {0}")]
    InvalidPassword(String),

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Error::InvalidKey(msg.into())
    }

    pub fn invalid_password(msg: impl Into<String>) -> Self {
        Error::InvalidPassword(msg.into())
    }

    pub fn malformed_address(msg: impl Into<String>) -> Self {
        Error::MalformedAddress(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }
}
