//! Storage error kinds and the allowed-set discipline.

use snafu::Snafu;

/// Discriminant for [`BackendError`], used by the contract wrappers to
/// verify that an implementation only returns the kinds its operation is
/// allowed to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The database name failed validation.
    DatabaseNameIsInvalid,
    /// The collection name failed validation.
    CollectionNameIsInvalid,
    /// An inserted document's `_id` collided with an existing one.
    InsertDuplicateId,
    /// A backend or transport fault; allowed from every operation.
    Fault,
    /// An implementation returned a kind its contract does not allow.
    Unexpected,
}

/// Errors produced by storage backends.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BackendError {
    /// The database name failed validation.
    #[snafu(display("invalid database name {name:?}"))]
    DatabaseNameIsInvalid {
        /// The rejected name.
        name: String,
    },

    /// The collection name failed validation.
    #[snafu(display("invalid collection name {name:?}"))]
    CollectionNameIsInvalid {
        /// The rejected name.
        name: String,
    },

    /// An inserted document's `_id` collided with an existing one.
    #[snafu(display("duplicate _id {id}"))]
    InsertDuplicateId {
        /// Rendered form of the colliding `_id`.
        id: String,
    },

    /// A backend or transport fault.
    #[snafu(display("backend fault: {message}"))]
    Fault {
        /// What went wrong.
        message: String,
    },

    /// An implementation returned a kind its contract does not allow.
    /// This is a programmer bug in the backend, not a user error.
    #[snafu(display("unexpected error kind from {operation}: {source}"))]
    Unexpected {
        /// The contract operation that observed the violation.
        operation: &'static str,
        /// The disallowed error.
        source: Box<BackendError>,
    },
}

impl BackendError {
    /// The kind discriminant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::DatabaseNameIsInvalid { .. } => ErrorKind::DatabaseNameIsInvalid,
            BackendError::CollectionNameIsInvalid { .. } => ErrorKind::CollectionNameIsInvalid,
            BackendError::InsertDuplicateId { .. } => ErrorKind::InsertDuplicateId,
            BackendError::Fault { .. } => ErrorKind::Fault,
            BackendError::Unexpected { .. } => ErrorKind::Unexpected,
        }
    }

    /// A backend fault from any displayable cause.
    pub fn fault(message: impl Into<String>) -> Self {
        BackendError::Fault {
            message: message.into(),
        }
    }
}

/// Pass `err` through if its kind is `Fault` or listed in `allowed`;
/// otherwise wrap it as [`BackendError::Unexpected`] for `operation`.
pub(super) fn check_error(
    operation: &'static str,
    err: BackendError,
    allowed: &[ErrorKind],
) -> BackendError {
    let kind = err.kind();
    if kind == ErrorKind::Fault || allowed.contains(&kind) {
        return err;
    }
    BackendError::Unexpected {
        operation,
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_kind_passes_through() {
        let err = check_error(
            "insert_all",
            BackendError::InsertDuplicateId { id: "1".into() },
            &[ErrorKind::InsertDuplicateId],
        );
        assert_eq!(err.kind(), ErrorKind::InsertDuplicateId);
    }

    #[test]
    fn fault_always_passes_through() {
        let err = check_error("query", BackendError::fault("disk on fire"), &[]);
        assert_eq!(err.kind(), ErrorKind::Fault);
    }

    #[test]
    fn disallowed_kind_is_wrapped() {
        let err = check_error(
            "query",
            BackendError::InsertDuplicateId { id: "1".into() },
            &[],
        );
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(err.to_string().contains("query"));
    }
}
