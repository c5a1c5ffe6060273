//! Error types for ThemisDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ThemisDB core operations.
///
/// Each variant carries a stable kind identifier returned by
/// [`CoreError::kind`], which transports map to status codes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage substrate error.
    #[error("storage error: {0}")]
    Storage(#[from] themis_storage::StorageError),

    /// Corrupt serialized entity.
    #[error("bad encoding: {0}")]
    BadEncoding(#[from] themis_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// AQL syntax error at a byte position.
    #[error("parse error at {pos}: {msg}")]
    Parse {
        /// Byte offset in the query text.
        pos: usize,
        /// Description of the syntax error.
        msg: String,
    },

    /// The planner cannot satisfy a required query feature.
    #[error("plan error: {message}")]
    Plan {
        /// Description of the planning failure.
        message: String,
    },

    /// Key or entity absent.
    #[error("not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// A unique index already holds this key under another primary key.
    #[error("unique violation on {table}.{column}: value {value:?} already indexed for {existing_pk}")]
    UniqueViolation {
        /// Table of the violated index.
        table: String,
        /// Column of the violated index.
        column: String,
        /// The duplicated value.
        value: String,
        /// Primary key already holding the value.
        existing_pk: String,
    },

    /// A content or security policy denied the operation.
    #[error("policy denied: {reason}")]
    PolicyDenied {
        /// Human-readable reason.
        reason: String,
        /// The file's MIME type is on the deny list.
        blacklisted: bool,
        /// The upload exceeds the applicable size cap.
        size_exceeded: bool,
        /// The MIME type is not on the allow list.
        not_whitelisted: bool,
    },

    /// No key context is available for a required cryptographic operation.
    #[error("key unavailable: {message}")]
    KeyUnavailable {
        /// Description of the missing context.
        message: String,
    },

    /// GCM authentication tag mismatch or invalid signature.
    #[error("authentication failure: {message}")]
    AuthFailure {
        /// Description of the failure.
        message: String,
    },

    /// A scalar subquery returned a row count other than one.
    #[error("cardinality violation: scalar subquery returned {rows} rows")]
    Cardinality {
        /// The number of rows actually returned.
        rows: usize,
    },

    /// Query deadline exceeded.
    #[error("timeout after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds elapsed when the deadline fired.
        elapsed_ms: u64,
    },

    /// Per-connection rate limit exceeded.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Description of the exceeded limit.
        message: String,
    },

    /// An on-disk index failed to open. Callers degrade to an empty index.
    #[error("index corrupt: {message}")]
    IndexCorrupt {
        /// Description of the corruption.
        message: String,
    },

    /// The audit hash chain failed verification.
    #[error("audit chain violation at entry {index}: {message}")]
    ChainViolation {
        /// Index of the first entry that failed verification.
        index: usize,
        /// Description of the violation.
        message: String,
    },

    /// Geometry bytes could not be parsed as EWKB.
    #[error("bad geometry: {message}")]
    BadGeometry {
        /// Description of the parse failure.
        message: String,
    },

    /// Configuration document is invalid.
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Returns the stable kind identifier for this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Storage(_) => "IOError",
            CoreError::BadEncoding(_) => "BadEncoding",
            CoreError::Io(_) => "IOError",
            CoreError::Parse { .. } => "Parse",
            CoreError::Plan { .. } => "Plan",
            CoreError::NotFound { .. } => "NotFound",
            CoreError::UniqueViolation { .. } => "UniqueViolation",
            CoreError::PolicyDenied { .. } => "PolicyDenied",
            CoreError::KeyUnavailable { .. } => "KeyUnavailable",
            CoreError::AuthFailure { .. } => "AuthFailure",
            CoreError::Cardinality { .. } => "Cardinality",
            CoreError::Timeout { .. } => "Timeout",
            CoreError::RateLimited { .. } => "RateLimited",
            CoreError::IndexCorrupt { .. } => "IndexCorrupt",
            CoreError::ChainViolation { .. } => "ChainViolation",
            CoreError::BadGeometry { .. } => "BadGeometry",
            CoreError::ConfigInvalid { .. } => "ConfigInvalid",
            CoreError::InvalidOperation { .. } => "InvalidOperation",
        }
    }

    /// Creates a parse error.
    pub fn parse(pos: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            pos,
            msg: msg.into(),
        }
    }

    /// Creates a plan error.
    pub fn plan(message: impl Into<String>) -> Self {
        Self::Plan {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a key-unavailable error.
    pub fn key_unavailable(message: impl Into<String>) -> Self {
        Self::KeyUnavailable {
            message: message.into(),
        }
    }

    /// Creates an authentication failure error.
    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::AuthFailure {
            message: message.into(),
        }
    }

    /// Creates a policy-denied error with structured flags.
    pub fn policy_denied(
        reason: impl Into<String>,
        blacklisted: bool,
        size_exceeded: bool,
        not_whitelisted: bool,
    ) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
            blacklisted,
            size_exceeded,
            not_whitelisted,
        }
    }

    /// Creates an index-corrupt error.
    pub fn index_corrupt(message: impl Into<String>) -> Self {
        Self::IndexCorrupt {
            message: message.into(),
        }
    }

    /// Creates a chain-violation error.
    pub fn chain_violation(index: usize, message: impl Into<String>) -> Self {
        Self::ChainViolation {
            index,
            message: message.into(),
        }
    }

    /// Creates a bad-geometry error.
    pub fn bad_geometry(message: impl Into<String>) -> Self {
        Self::BadGeometry {
            message: message.into(),
        }
    }

    /// Creates an invalid-configuration error.
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a rate-limited error.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(CoreError::parse(3, "x").kind(), "Parse");
        assert_eq!(CoreError::not_found("k").kind(), "NotFound");
        assert_eq!(CoreError::Timeout { elapsed_ms: 5 }.kind(), "Timeout");
        assert_eq!(CoreError::Cardinality { rows: 2 }.kind(), "Cardinality");
        assert_eq!(
            CoreError::policy_denied("r", true, false, false).kind(),
            "PolicyDenied"
        );
    }

    #[test]
    fn parse_error_carries_position() {
        let err = CoreError::parse(17, "unexpected token");
        assert_eq!(err.to_string(), "parse error at 17: unexpected token");
    }

    #[test]
    fn codec_errors_surface_as_bad_encoding() {
        let codec_err = themis_codec::CodecError::bad_encoding("junk");
        let err: CoreError = codec_err.into();
        assert_eq!(err.kind(), "BadEncoding");
    }
}
