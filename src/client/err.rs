use err_derive::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level failure or an HTTP error status. Retryable; the caller
    /// decides how often.
    #[error(display = "transport error: {}", _0)]
    Transport(#[error(source)] reqwest::Error),

    /// The UI answered, but not in the shape the contract promises.
    #[error(display = "protocol error: {}", _0)]
    Protocol(String),

    /// A download crossed the configured size cap.
    #[error(display = "download exceeds the {} byte cap", _0)]
    TooLarge(u64),

    #[error(display = "io error: {}", _0)]
    Io(#[error(source)] std::io::Error),
}

impl ClientError {
    pub fn protocol(msg: impl Into<String>) -> ClientError {
        ClientError::Protocol(msg.into())
    }

    /// Only transport errors are worth retrying; everything else reproduces.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}
