use thiserror::Error;

/// Failure reported by (or on the way to) the WhatsApp protocol layer.
///
/// Remote errors keep the library's message verbatim; callers classify them
/// by text, so the message must not be rewritten.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaError {
    #[error("not connected")]
    NotConnected,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{message}")]
    Remote { code: Option<u16>, message: String },

    #[error("invalid jid: {0}")]
    InvalidJid(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl WaError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Remote { code, .. } => *code,
            _ => None,
        }
    }
}

pub type WaResult<T> = std::result::Result<T, WaError>;
