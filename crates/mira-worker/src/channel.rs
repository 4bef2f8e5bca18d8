use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::retry::{ErrorClass, Retryable};

#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("api error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl Retryable for ChannelError {
    /// Client errors other than flood control are final; everything else may
    /// pass on a later attempt.
    fn class(&self) -> ErrorClass {
        match self {
            Self::Api { code: 429, .. } => ErrorClass::RateLimited,
            Self::Api { code, .. } if (400..500).contains(code) => ErrorClass::Other,
            _ => ErrorClass::Transient,
        }
    }
}

/// Inline button shown under a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// File descriptor returned by the first download stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_id: String,
    pub file_path: String,
    pub size: Option<u64>,
}

/// Operator-facing transport. Chat ids and message ids are the transport's own.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, ChannelError>;

    async fn send_buttons(
        &self,
        chat_id: i64,
        text: &str,
        rows: &[Vec<Button>],
    ) -> Result<i64, ChannelError>;

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str)
    -> Result<(), ChannelError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ChannelError>;

    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str)
    -> Result<i64, ChannelError>;

    async fn file_info(&self, file_id: &str) -> Result<RemoteFile, ChannelError>;

    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>, ChannelError>;
}
