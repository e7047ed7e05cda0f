//! Caller-visible error kinds.
//!
//! Every coordinator operation surfaces one of these stable kinds; the HTTP
//! layer maps them to status codes without inspecting messages.

use std::fmt;

/// Error returned by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// Input failed validation before any transaction opened.
    #[error("{0}")]
    BadRequest(String),

    /// The referenced node, job, or task does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Shared secret missing or mismatched.
    #[error("missing or invalid shared secret")]
    Unauthorized,

    /// The operation conflicts with the current state of the row.
    #[error("{0}")]
    Conflict(String),

    /// Store failure; the transaction was rolled back.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoordError {
    /// Stable machine-readable kind string.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<sqlx::Error> for CoordError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

/// The stable kind names surfaced in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Unauthorized,
    Conflict,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(CoordError::bad_request("x").kind(), ErrorKind::BadRequest);
        assert_eq!(CoordError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(CoordError::Unauthorized.kind(), ErrorKind::Unauthorized);
        assert_eq!(CoordError::conflict("x").kind(), ErrorKind::Conflict);
        assert_eq!(
            CoordError::Internal(anyhow::anyhow!("boom")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(ErrorKind::BadRequest.to_string(), "bad_request");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
