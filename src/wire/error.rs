//! Wire codec error kinds.
//!
//! The connection runner keys its recovery decisions on these kinds:
//! a validation failure is answered on the wire and the connection lives on,
//! a clean zero-read means the peer went away quietly, and everything else
//! is a transport fault that terminates the connection.

use snafu::Snafu;

use crate::document::BsonError;

use super::header::MsgHeader;

/// Errors produced while reading, decoding, or writing wire messages.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WireError {
    /// The message failed structural validation. Recoverable: the runner
    /// answers with an error document and keeps reading.
    #[snafu(display("message validation failed: {message}"))]
    Validation {
        /// What was structurally wrong.
        message: String,
        /// The request header, when enough of it was readable. Lets the
        /// error response reference the offending message's id.
        header: Option<MsgHeader>,
    },

    /// The peer closed the connection at a message boundary, before sending
    /// a single byte of a new message. Not a fault.
    #[snafu(display("connection closed cleanly before a new message"))]
    ZeroRead,

    /// Transport-level failure: short read mid-message, write failure, or
    /// any other socket error. Terminates the connection.
    #[snafu(display("wire transport error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl WireError {
    /// Build a validation error from any displayable cause.
    pub fn validation(message: impl Into<String>) -> Self {
        WireError::Validation {
            message: message.into(),
            header: None,
        }
    }

    /// Attach the request header to a validation error; other kinds pass
    /// through untouched.
    pub(super) fn with_header(self, request_header: MsgHeader) -> Self {
        match self {
            WireError::Validation { message, header } => WireError::Validation {
                message,
                header: header.or(Some(request_header)),
            },
            other => other,
        }
    }

    /// The request header, when a validation error could preserve it.
    pub fn request_header(&self) -> Option<&MsgHeader> {
        match self {
            WireError::Validation { header, .. } => header.as_ref(),
            _ => None,
        }
    }

    /// Whether this is a structural validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, WireError::Validation { .. })
    }

    /// Whether this is a clean zero-read disconnect.
    pub fn is_zero_read(&self) -> bool {
        matches!(self, WireError::ZeroRead)
    }
}

impl From<BsonError> for WireError {
    fn from(err: BsonError) -> Self {
        WireError::validation(err.to_string())
    }
}

impl From<std::io::Error> for WireError {
    fn from(source: std::io::Error) -> Self {
        WireError::Io { source }
    }
}
