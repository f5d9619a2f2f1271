use thiserror::Error;

/// Coarse classification shared by every failure that crosses the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect refused, reset, or any other socket-level fault.
    Transport,
    /// The byte stream never produced a parseable document.
    Framing,
    /// Payload decoding or detection failed; reported as `status: "error"`.
    Processing,
    /// A complete document that is not a valid envelope.
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Framing => "framing",
            ErrorKind::Processing => "processing",
            ErrorKind::Validation => "validation",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid envelope: {0}")]
    Validation(String),
    #[error("Invalid base64 payload: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("Failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Validation(_) => ErrorKind::Validation,
            ProtocolError::Payload(_) | ProtocolError::Serialize(_) => ErrorKind::Processing,
        }
    }
}
