//! Crate-wide error type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DuetaskError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid task status: {0}")]
    InvalidStatus(String),

    #[error("Invalid due date: {0}")]
    InvalidDueDate(String),
}

pub type Result<T> = std::result::Result<T, DuetaskError>;
