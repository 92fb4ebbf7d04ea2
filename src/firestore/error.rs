use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Codes that a retry on a fresh stream may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FirestoreErrorCode::Cancelled
                | FirestoreErrorCode::Unknown
                | FirestoreErrorCode::DeadlineExceeded
                | FirestoreErrorCode::ResourceExhausted
                | FirestoreErrorCode::Internal
                | FirestoreErrorCode::Unavailable
                | FirestoreErrorCode::Unauthenticated
        )
    }

    /// Whether a write that failed with this code must be rejected instead of retried.
    ///
    /// `Aborted` is permanent for reads but writes hit it on contention, so it is retried.
    pub fn is_permanent_write_error(&self) -> bool {
        !self.is_transient() && *self != FirestoreErrorCode::Aborted
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Persistence failures leave the local store in an unknown state; the client stops serving.
    pub fn is_fatal(&self) -> bool {
        self.code == FirestoreErrorCode::DataLoss
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

/// Maps a numeric gRPC status carried in a stream `cause` onto an error.
pub fn map_grpc_status(code: i64, message: impl Into<String>) -> FirestoreError {
    let code = match code {
        1 => FirestoreErrorCode::Cancelled,
        2 => FirestoreErrorCode::Unknown,
        3 => FirestoreErrorCode::InvalidArgument,
        4 => FirestoreErrorCode::DeadlineExceeded,
        5 => FirestoreErrorCode::NotFound,
        6 => FirestoreErrorCode::AlreadyExists,
        7 => FirestoreErrorCode::PermissionDenied,
        8 => FirestoreErrorCode::ResourceExhausted,
        9 => FirestoreErrorCode::FailedPrecondition,
        10 => FirestoreErrorCode::Aborted,
        11 => FirestoreErrorCode::OutOfRange,
        12 => FirestoreErrorCode::Unimplemented,
        14 => FirestoreErrorCode::Unavailable,
        15 => FirestoreErrorCode::DataLoss,
        16 => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Internal,
    };
    FirestoreError::new(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_write_errors() {
        assert!(FirestoreErrorCode::InvalidArgument.is_permanent_write_error());
        assert!(FirestoreErrorCode::FailedPrecondition.is_permanent_write_error());
        assert!(FirestoreErrorCode::PermissionDenied.is_permanent_write_error());
        assert!(!FirestoreErrorCode::Aborted.is_permanent_write_error());
        assert!(!FirestoreErrorCode::Unavailable.is_permanent_write_error());
    }

    #[test]
    fn maps_grpc_codes() {
        assert_eq!(
            map_grpc_status(7, "denied").code,
            FirestoreErrorCode::PermissionDenied
        );
        assert_eq!(map_grpc_status(14, "down").code_str(), "firestore/unavailable");
        assert_eq!(map_grpc_status(99, "?").code, FirestoreErrorCode::Internal);
    }
}
