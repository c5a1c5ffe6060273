//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input bytes do not form a valid entity record.
    #[error("bad encoding: {message}")]
    BadEncoding {
        /// Description of the malformation.
        message: String,
    },

    /// NaN doubles are forbidden in canonical encoding.
    #[error("NaN values are forbidden")]
    NaNForbidden,

    /// Invalid UTF-8 in a field name or string payload.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Input ended before the declared length.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A field appears in both plaintext and encrypted form.
    #[error("field '{field}' is present in both plaintext and encrypted form")]
    DualForm {
        /// Name of the offending field.
        field: String,
    },

    /// Unknown value tag byte.
    #[error("unknown value tag: {tag:#04x}")]
    UnknownTag {
        /// The tag byte that was read.
        tag: u8,
    },

    /// Unsupported format version.
    #[error("unsupported format version: {version}")]
    UnsupportedVersion {
        /// The version byte that was read.
        version: u8,
    },

    /// JSON payload could not be serialized or parsed.
    #[error("invalid JSON payload: {message}")]
    InvalidJson {
        /// Description of the JSON error.
        message: String,
    },
}

impl CodecError {
    /// Creates a bad encoding error.
    pub fn bad_encoding(message: impl Into<String>) -> Self {
        Self::BadEncoding {
            message: message.into(),
        }
    }

    /// Creates a dual-form error.
    pub fn dual_form(field: impl Into<String>) -> Self {
        Self::DualForm {
            field: field.into(),
        }
    }

    /// Creates an invalid JSON error.
    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::InvalidJson {
            message: message.into(),
        }
    }
}
