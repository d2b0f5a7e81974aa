//! Crate-wide error type.
//!
//! One enum covers every failure surfaced to callers; the HTTP layer maps
//! variants onto status codes (400/404/409/503/500).

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the indexing and retrieval engine.
#[derive(Debug)]
pub enum Error {
    /// Encoder models are not loaded.
    NotReady(String),
    /// Caller supplied malformed or empty input.
    InvalidInput(String),
    /// The weights repository rejected the credential (HTTP 401).
    AuthFailed,
    /// The weights repository has no such file (HTTP 404).
    MissingRemoteFile(String),
    /// Disk or socket failure.
    Io(std::io::Error),
    /// The stored credential was sealed on a different host.
    DecryptFailed,
    /// A download session is already running.
    Conflict(String),
    /// Unknown image, folder, or record.
    NotFound(String),
    /// Durable store failure.
    Db(rusqlite::Error),
    /// Anything else.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady(msg) => write!(f, "Not ready: {}", msg),
            Self::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Self::AuthFailed => {
                write!(f, "Authentication failed (401). Please check your access token.")
            }
            Self::MissingRemoteFile(file) => {
                write!(f, "File not found on remote repository (404): {}", file)
            }
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::DecryptFailed => write!(
                f,
                "Could not decrypt token — it may have been saved on a different machine. Please re-enter it."
            ),
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Db(e) => write!(f, "Database error: {}", e),
            Self::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("record".to_string()),
            other => Self::Db(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", e))
    }
}

impl From<Error> for String {
    fn from(e: Error) -> String {
        e.to_string()
    }
}
