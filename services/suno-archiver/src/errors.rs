//!
//! src/errors.rs  Andrew Belles  Oct 18th, 2025
//!
//! Defines enums and methods of error conversion
//! for errors the archiver uses
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("config error: {0}")]
    Config(String),
    #[error("browser connection failed: {0}")]
    Connection(String),
    #[error("navigation error: {0}")]
    Navigation(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("tag error: {0}")]
    Tag(String),
    #[error("audio error: {0}")]
    Audio(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl ArchiverError {
    /// Only a failed attach to the browser aborts a whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArchiverError::Connection(_) | ArchiverError::Config(_))
    }
}

impl From<reqwest::Error> for ArchiverError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ArchiverError::Timeout(e.to_string())
        } else {
            ArchiverError::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ArchiverError {
    fn from(e: serde_json::Error) -> Self { ArchiverError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for ArchiverError {
    fn from(e: sqlx::Error) -> Self { ArchiverError::Db(e.to_string()) }
}

impl From<url::ParseError> for ArchiverError {
    fn from(e: url::ParseError) -> Self { ArchiverError::Parse(format!("url: {e}")) }
}

impl From<csv::Error> for ArchiverError {
    fn from(e: csv::Error) -> Self { ArchiverError::Parse(format!("csv: {e}")) }
}

impl From<tokio_tungstenite::tungstenite::Error> for ArchiverError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ArchiverError::Navigation(format!("devtools socket: {e}"))
    }
}

impl From<lofty::error::LoftyError> for ArchiverError {
    fn from(e: lofty::error::LoftyError) -> Self { ArchiverError::Tag(e.to_string()) }
}

impl From<symphonia::core::errors::Error> for ArchiverError {
    fn from(e: symphonia::core::errors::Error) -> Self { ArchiverError::Audio(e.to_string()) }
}

impl From<tempfile::PersistError> for ArchiverError {
    fn from(e: tempfile::PersistError) -> Self { ArchiverError::Io(e.error) }
}

impl From<tokio::task::JoinError> for ArchiverError {
    fn from(e: tokio::task::JoinError) -> Self {
        ArchiverError::Io(std::io::Error::other(format!("task join: {e}")))
    }
}
