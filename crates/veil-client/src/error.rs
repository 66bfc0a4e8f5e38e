//! Client error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Psi(#[from] veil_core::Error),

    #[error("Failed to connect to {0}")]
    Connect(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
