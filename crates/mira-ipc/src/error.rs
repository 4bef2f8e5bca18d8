use mira_core::WaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sidecar not running")]
    ProcessNotRunning,

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Bun install failed: {0}")]
    BunInstallFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{message}")]
    Remote { code: Option<u16>, message: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("context deadline exceeded")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl From<IpcError> for WaError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Timeout => WaError::Timeout("context deadline exceeded".to_string()),
            IpcError::Remote { code, message } => WaError::Remote { code, message },
            IpcError::Serialization(e) => WaError::Decode(e.to_string()),
            IpcError::ChannelClosed => WaError::ChannelClosed,
            IpcError::ProcessNotRunning => WaError::NotConnected,
            other => WaError::remote(other.to_string()),
        }
    }
}
