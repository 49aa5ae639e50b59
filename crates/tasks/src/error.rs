//! Task execution error types.

use thiserror::Error;

/// Errors raised by the template evaluator.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Expression or template failed to parse.
    #[error("Template syntax error: {0}")]
    Syntax(String),

    /// Expression or template failed while rendering.
    #[error("Template render error: {0}")]
    Render(String),

    /// `[[name]]` prefix names a language that is not supported.
    #[error("Unknown template language: {0}")]
    UnknownLanguage(String),
}

impl From<minijinja::Error> for TemplateError {
    fn from(e: minijinja::Error) -> Self {
        match e.kind() {
            minijinja::ErrorKind::SyntaxError => TemplateError::Syntax(e.to_string()),
            _ => TemplateError::Render(e.to_string()),
        }
    }
}

/// Errors raised by the shared infrastructure collaborators.
#[derive(Debug, Error)]
pub enum StackError {
    /// Document store failure.
    #[error("Document store error: {0}")]
    Store(String),

    /// Write would give a second document the same id.
    #[error("Duplicate document: {0}")]
    Duplicate(String),

    /// Cache failure.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Lease service failure.
    #[error("Lock service error: {0}")]
    Lock(String),

    /// Message broker failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Realtime channel failure.
    #[error("Realtime error: {0}")]
    Realtime(String),

    /// Collaborator is not configured in this process.
    #[error("{0} is not available")]
    Unavailable(&'static str),
}

/// Errors that can occur while executing a task function.
///
/// The first four variants form the user-facing taxonomy and render as the
/// bare messages recorded into task metrics.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Required parameters are missing or malformed.
    #[error("invalid task definition")]
    InvalidDefinition,

    /// Target document does not exist.
    #[error("document not found")]
    DocumentNotFound,

    /// Requested version record does not exist.
    #[error("version not found")]
    VersionNotFound,

    /// A live document already exists where none was expected.
    #[error("document already exists")]
    DocumentExists,

    /// Function name is not registered.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Template evaluation failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Lease could not be acquired.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Collaborator failure.
    #[error(transparent)]
    Stack(StackError),

    /// Credential signing or verification failed.
    #[error("Token error: {0}")]
    Token(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Task reported failure without a more specific cause.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<StackError> for TaskError {
    fn from(e: StackError) -> Self {
        match e {
            StackError::Duplicate(_) => TaskError::DocumentExists,
            other => TaskError::Stack(other),
        }
    }
}

impl TaskError {
    /// Whether this error belongs to the conflict class (always fatal).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TaskError::DocumentNotFound | TaskError::VersionNotFound | TaskError::DocumentExists
        )
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Json(e.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for TaskError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        TaskError::Token(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_messages() {
        assert_eq!(TaskError::InvalidDefinition.to_string(), "invalid task definition");
        assert_eq!(TaskError::DocumentNotFound.to_string(), "document not found");
        assert_eq!(TaskError::VersionNotFound.to_string(), "version not found");
        assert_eq!(TaskError::DocumentExists.to_string(), "document already exists");
    }

    #[test]
    fn test_conflict_class() {
        assert!(TaskError::DocumentExists.is_conflict());
        assert!(TaskError::VersionNotFound.is_conflict());
        assert!(!TaskError::InvalidDefinition.is_conflict());
    }

    #[test]
    fn test_stack_error_passthrough() {
        let err: TaskError = StackError::Unavailable("broker").into();
        assert_eq!(err.to_string(), "broker is not available");
    }

    #[test]
    fn test_duplicate_write_is_document_exists() {
        let err: TaskError = StackError::Duplicate("users~1".into()).into();
        assert!(matches!(err, TaskError::DocumentExists));
        assert!(err.is_conflict());
    }
}
