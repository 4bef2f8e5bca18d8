use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Phone {phone} is already linked by another operator")]
    PhoneOwnedElsewhere { phone: String },

    #[error("Invalid group name for {0}")]
    InvalidName(String),

    #[error("Could not resolve data directory")]
    NoDataDir,
}

pub type Result<T> = std::result::Result<T, DbError>;
