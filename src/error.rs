use std::sync::Arc;

use strum_macros::{AsRefStr, Display};

use crate::repository::interface::Error as RepositoryError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} {name:?} already exists")]
    AlreadyExists { entity: String, name: String },

    #[error("{entity} {name:?} doesn't exist")]
    NotFound { entity: String, name: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Storage failure during {operation} of {ident}: {source}")]
    Storage {
        operation: String,
        ident: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Stable, enumerable classification of [`Error`] for callers that translate errors
/// into another representation (status codes, exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    Forbidden,
    InvalidArgument,
    StorageFailure,
    Internal,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Forbidden { .. } => ErrorKind::Forbidden,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::Storage { .. } => ErrorKind::StorageFailure,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn already_exists(entity: impl ToString, name: impl ToString) -> Self {
        Error::AlreadyExists {
            entity: entity.to_string(),
            name: name.to_string(),
        }
    }

    pub fn not_found(entity: impl ToString, name: impl ToString) -> Self {
        Error::NotFound {
            entity: entity.to_string(),
            name: name.to_string(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Error::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }

    /// Wraps a backend failure, logging it with enough context to correlate.
    pub fn storage(
        operation: &str,
        ident: impl ToString,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let ident = ident.to_string();
        let source = source.into();
        tracing::error!(operation, %ident, error = %source, "Storage failure");
        Error::Storage {
            operation: operation.to_string(),
            ident,
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

/// Fallback conversion for repository errors that weren't interpreted at the call site,
/// which knows the entity type and name. Unique violations and missing rows are
/// handled there.
impl From<RepositoryError> for Error {
    fn from(err: RepositoryError) -> Error {
        let source = match err {
            RepositoryError::UniqueConstraintViolation(e) => e,
            RepositoryError::FKConstraintViolation(e) => e,
            RepositoryError::SqlxError(e) => e,
        };
        Error::storage("repository", "unknown", source)
    }
}

/// Errors shared by concurrent cache loaders. Storage sources can't be cloned and are
/// kept as their message.
impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Error {
        let shared = match Arc::try_unwrap(err) {
            Ok(err) => return err,
            Err(shared) => shared,
        };
        match shared.as_ref() {
            Error::AlreadyExists { entity, name } => Error::already_exists(entity, name),
            Error::NotFound { entity, name } => Error::not_found(entity, name),
            Error::Forbidden { reason } => Error::forbidden(reason.clone()),
            Error::InvalidArgument { reason } => Error::invalid_argument(reason.clone()),
            Error::Internal { reason } => Error::internal(reason.clone()),
            Error::Storage {
                operation,
                ident,
                source,
            } => Error::Storage {
                operation: operation.clone(),
                ident: ident.clone(),
                source: source.to_string().into(),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::internal(format!("Failed (de)serializing JSON: {err}"))
    }
}
