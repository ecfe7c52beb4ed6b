//! Protocol error taxonomy and its on-wire document projection.
//!
//! Errors are kinds, not an open hierarchy: a [`ProtocolError`] is either a
//! named-and-coded [`CommandError`] or a batch of per-document
//! [`WriteErrors`]. Anything else reaching the dispatch layer (backend
//! faults, decode failures, contract violations) is rendered as a generic
//! internal error before it goes on the wire.

use std::fmt;

use snafu::Snafu;

use crate::backend::BackendError;
use crate::doc;
use crate::document::Array;
use crate::document::Document;
use crate::document::Value;
use crate::wire::WireError;

/// Stable numeric error codes, a subset of the reference server's space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Placeholder for errors without a specific code.
    Unset = 0,
    /// An unexpected internal failure.
    InternalError = 1,
    /// A field value failed validation.
    BadValue = 2,
    /// A command document could not be parsed.
    FailedToParse = 9,
    /// A field had the wrong type.
    TypeMismatch = 14,
    /// The namespace does not exist.
    NamespaceNotFound = 26,
    /// The namespace already exists.
    NamespaceExists = 48,
    /// The command name is not registered.
    CommandNotFound = 59,
    /// The namespace is malformed.
    InvalidNamespace = 73,
    /// The feature is recognized but not implemented.
    NotImplemented = 238,
    /// An `_id` collided with an existing document.
    DuplicateKey = 11000,
}

impl ErrorCode {
    /// The numeric code as sent on the wire.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The symbolic name as sent on the wire.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Unset => "Unset",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::NamespaceExists => "NamespaceExists",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::DuplicateKey => "DuplicateKey",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named, coded command failure; optionally carries the argument that
/// triggered it.
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(display("{} ({}): {}", code.name(), code.code(), message))]
pub struct CommandError {
    code: ErrorCode,
    message: String,
    argument: Option<String>,
}

impl CommandError {
    /// Build a command error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            argument: None,
        }
    }

    /// Attach the offending argument name.
    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.argument = Some(argument.into());
        self
    }

    /// The error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The offending argument, if recorded.
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    /// The on-wire response document.
    pub fn document(&self) -> Document {
        doc! {
            "ok" => Value::Double(0.0),
            "errmsg" => Value::String(self.message.clone()),
            "code" => Value::Int32(self.code.code()),
            "codeName" => Value::String(self.code.name().to_owned()),
        }
    }
}

/// One failed document of a batched write.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteError {
    /// Position of the document in the request batch.
    pub index: i32,
    /// The failure code.
    pub code: ErrorCode,
    /// The human-readable message.
    pub message: String,
}

/// Per-document failures from a batched write.
///
/// Write errors are reported inside an ok-framed reply: the batch was
/// processed, individual documents failed.
#[derive(Clone, Debug, Default, PartialEq, Snafu)]
#[snafu(display("{} write error(s)", errors.len()))]
pub struct WriteErrors {
    errors: Vec<WriteError>,
}

impl WriteErrors {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for the document at `index`.
    pub fn push(&mut self, index: i32, code: ErrorCode, message: impl Into<String>) {
        self.errors.push(WriteError {
            index,
            code,
            message: message.into(),
        });
    }

    /// Whether any failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The recorded failures, in insertion order.
    pub fn errors(&self) -> &[WriteError] {
        &self.errors
    }

    /// The `writeErrors` array for embedding in a reply.
    pub fn to_array(&self) -> Array {
        self.errors
            .iter()
            .map(|e| {
                Value::Document(doc! {
                    "index" => Value::Int32(e.index),
                    "code" => Value::Int32(e.code.code()),
                    "errmsg" => Value::String(e.message.clone()),
                })
            })
            .collect()
    }

    /// The on-wire response document.
    pub fn document(&self) -> Document {
        doc! {
            "writeErrors" => Value::Array(self.to_array()),
            "ok" => Value::Double(1.0),
        }
    }
}

/// The tagged projection of any error onto the wire.
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum ProtocolError {
    /// A named, coded command failure.
    #[snafu(context(false), display("{source}"))]
    Command {
        /// The failure.
        source: CommandError,
    },

    /// Per-document failures from a batched write.
    #[snafu(context(false), display("{source}"))]
    Write {
        /// The recorded failures.
        source: WriteErrors,
    },
}

impl ProtocolError {
    /// A `CommandNotFound` error for `command`.
    pub fn command_not_found(command: &str) -> Self {
        CommandError::new(
            ErrorCode::CommandNotFound,
            format!("no such command: '{command}'"),
        )
        .with_argument(command.to_owned())
        .into()
    }

    /// A generic internal error wrapping any displayable cause.
    pub fn internal(cause: impl fmt::Display) -> Self {
        CommandError::new(ErrorCode::InternalError, cause.to_string()).into()
    }

    /// Render a structural decode failure for an on-wire answer.
    ///
    /// The command is unknown at this point, so the projection is a generic
    /// internal error carrying the validation message.
    pub fn from_validation(err: &WireError) -> Self {
        Self::internal(err)
    }

    /// The on-wire response document.
    pub fn document(&self) -> Document {
        match self {
            ProtocolError::Command { source } => source.document(),
            ProtocolError::Write { source } => source.document(),
        }
    }

    /// The metrics result label: the code name for command errors, the
    /// fixed `write-error` label for write errors.
    pub fn result_label(&self) -> &'static str {
        match self {
            ProtocolError::Command { source } => source.code().name(),
            ProtocolError::Write { .. } => "write-error",
        }
    }

    /// The offending argument, if the error records one.
    pub fn argument(&self) -> Option<&str> {
        match self {
            ProtocolError::Command { source } => source.argument(),
            ProtocolError::Write { .. } => None,
        }
    }
}

// Backend faults that reach dispatch unmapped are internal errors; handlers
// that want user-facing codes map them before returning.
impl From<BackendError> for ProtocolError {
    fn from(err: BackendError) -> Self {
        Self::internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_document_shape() {
        let err = CommandError::new(ErrorCode::CommandNotFound, "no such command: 'x'");
        let d = err.document();
        assert_eq!(d.get("ok"), Some(&Value::Double(0.0)));
        assert_eq!(d.get("code"), Some(&Value::Int32(59)));
        assert_eq!(
            d.get("codeName"),
            Some(&Value::String("CommandNotFound".into()))
        );
        assert_eq!(
            d.get("errmsg"),
            Some(&Value::String("no such command: 'x'".into()))
        );
    }

    #[test]
    fn write_errors_document_is_ok_framed() {
        let mut errs = WriteErrors::new();
        errs.push(0, ErrorCode::DuplicateKey, "duplicate _id");
        let d = errs.document();
        assert_eq!(d.get("ok"), Some(&Value::Double(1.0)));
        let Value::Array(arr) = d.get("writeErrors").unwrap() else {
            panic!("writeErrors must be an array");
        };
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn result_labels() {
        assert_eq!(
            ProtocolError::command_not_found("x").result_label(),
            "CommandNotFound"
        );
        assert_eq!(
            ProtocolError::from(WriteErrors::new()).result_label(),
            "write-error"
        );
    }

    #[test]
    fn display_delegates_to_the_kind() {
        let err = ProtocolError::command_not_found("x");
        assert_eq!(
            err.to_string(),
            "CommandNotFound (59): no such command: 'x'"
        );
    }

    #[test]
    fn unknown_errors_become_internal() {
        let err = ProtocolError::internal("boom");
        let ProtocolError::Command { source } = &err else {
            panic!("expected a command error");
        };
        assert_eq!(source.code(), ErrorCode::InternalError);
    }
}
