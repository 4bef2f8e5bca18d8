use mira_core::WaError;
use mira_db::DbError;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::retry::{ErrorClass, classify};

/// How a failure is handled at the operator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Connection,
    PermanentSession,
    TransientSession,
    ProtocolPerItem,
    ProtocolInvited,
    RateLimit,
    Catalog,
    Invariant,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("{0}")]
    Wa(#[from] WaError),

    #[error("Control channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("No account linked")]
    NoAccount,

    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("Account {account_id} is not owned by operator {operator}")]
    NotOwner { operator: i64, account_id: i64 },

    #[error("connection unavailable")]
    ConnectionUnavailable,

    #[error("{0}")]
    Busy(String),
}

impl WorkerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(DbError::PhoneOwnedElsewhere { .. }) => ErrorKind::Invariant,
            Self::Db(DbError::AccountNotFound(_)) => ErrorKind::Validation,
            Self::Db(_) | Self::Io(_) => ErrorKind::Catalog,
            Self::Wa(err) => match classify(err) {
                ErrorClass::Permanent => ErrorKind::PermanentSession,
                ErrorClass::RateLimited => ErrorKind::RateLimit,
                ErrorClass::Transient => ErrorKind::TransientSession,
                ErrorClass::Other => match err.code() {
                    Some(401) => ErrorKind::ProtocolInvited,
                    Some(_) => ErrorKind::ProtocolPerItem,
                    None => ErrorKind::TransientSession,
                },
            },
            Self::Channel(_) | Self::Download(_) => ErrorKind::Connection,
            Self::Validation(_) | Self::Image(_) | Self::NoAccount | Self::Busy(_) => {
                ErrorKind::Validation
            }
            Self::AccountNotFound(_) => ErrorKind::Validation,
            Self::NotOwner { .. } => ErrorKind::Invariant,
            Self::ConnectionUnavailable => ErrorKind::TransientSession,
        }
    }

    /// The protocol error behind this failure, if any.
    pub fn as_wa(&self) -> Option<&WaError> {
        match self {
            Self::Wa(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
