//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Rejected entity or field definition. Raised at save time, before any storage mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("invalid entity '{entity}': {message}")]
    InvalidEntity { entity: String, message: String },
    #[error("invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },
    #[error("duplicate {kind}: {value}")]
    Duplicate { kind: &'static str, value: String },
}

impl DefinitionError {
    pub(crate) fn field(field: &str, message: impl Into<String>) -> Self {
        DefinitionError::InvalidField {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn entity(entity: &str, message: impl Into<String>) -> Self {
        DefinitionError::InvalidEntity {
            entity: entity.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("definition validation: {0}")]
    DefinitionValidation(#[from] DefinitionError),
    #[error("unresolved reference: field '{field}' targets '{target}'")]
    UnresolvedReference { field: String, target: String },
    #[error("schema introspection of '{table}': {source}")]
    SchemaIntrospection {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("migration: {0}")]
    MigrationApply(String),
    #[error("backup: {0}")]
    Backup(String),
    #[error("restore: {0}")]
    Restore(String),
    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
    /// A structural operation failed after a snapshot was written.
    #[error("{source} (backup kept at {})", .backup.display())]
    Aborted {
        #[source]
        source: Box<EngineError>,
        backup: PathBuf,
    },
}

impl EngineError {
    /// Snapshot path written before the failing operation, if any.
    pub fn backup_path(&self) -> Option<&Path> {
        match self {
            EngineError::Aborted { backup, .. } => Some(backup.as_path()),
            _ => None,
        }
    }

    /// The underlying error, looking through `Aborted`.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn with_backup(self, backup: Option<&Path>) -> Self {
        match backup {
            Some(path) => EngineError::Aborted {
                source: Box::new(self),
                backup: path.to_path_buf(),
            },
            None => self,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Backup(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        AppError::Engine(EngineError::DefinitionValidation(e))
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Engine(e) => match e.root() {
                EngineError::DefinitionValidation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "definition_error"),
                EngineError::UnresolvedReference { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "unresolved_reference"),
                EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                EngineError::MigrationApply(_) => (StatusCode::CONFLICT, "migration_error"),
                EngineError::Restore(_) => (StatusCode::BAD_REQUEST, "restore_error"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "engine_error"),
            },
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };
        let details = match &self {
            AppError::Engine(e) => e
                .backup_path()
                .map(|p| serde_json::json!({ "backup": p.display().to_string() })),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_exposes_backup_and_root() {
        let err = EngineError::MigrationApply("table exists".into()).with_backup(Some(Path::new("/tmp/b.sqlite3")));
        assert_eq!(err.backup_path(), Some(Path::new("/tmp/b.sqlite3")));
        assert!(matches!(err.root(), EngineError::MigrationApply(_)));
        assert!(err.to_string().contains("/tmp/b.sqlite3"));
    }

    #[test]
    fn without_backup_is_unchanged() {
        let err = EngineError::Restore("missing".into()).with_backup(None);
        assert!(err.backup_path().is_none());
        assert!(matches!(err, EngineError::Restore(_)));
    }
}
