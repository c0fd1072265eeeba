//! Error types for Mneme

use thiserror::Error;

/// Result type alias using Mneme's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of errors, stable across backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Storage,
    DimensionMismatch,
    CapabilityUnavailable,
    Embedding,
    Config,
    Internal,
}

/// Mneme error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (E001-E099)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Lookup errors (E100-E199)
    #[error("Entity '{0}' not found. Run `mneme search <query>` to look up existing entities.")]
    EntityNotFound(String),

    #[error("Relation '{from}' -[{relation_type}]-> '{to}' not found.")]
    RelationNotFound {
        from: String,
        to: String,
        relation_type: String,
    },

    #[error("Embedding job '{0}' not found.")]
    JobNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Storage errors (E300-E399)
    #[error("Storage error during {operation} ({key}): {source}")]
    Storage {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt storage document: {0}")]
    Corrupt(String),

    // Vector errors (E400-E499)
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage backend does not support {0}")]
    CapabilityUnavailable(&'static str),

    // Embedding errors (E500-E599)
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Network error: {0}. Check your internet connection.")]
    Network(#[from] reqwest::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get the error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E001",
            Self::EntityNotFound(_) => "E100",
            Self::RelationNotFound { .. } => "E101",
            Self::JobNotFound(_) => "E102",
            Self::NotFound(_) => "E103",
            Self::Conflict(_) => "E200",
            Self::Storage { source, .. } => source.code(),
            Self::Database(_) => "E300",
            Self::Io(_) => "E301",
            Self::Json(_) => "E302",
            Self::Corrupt(_) => "E303",
            Self::DimensionMismatch { .. } => "E400",
            Self::CapabilityUnavailable(_) => "E401",
            Self::EmbeddingFailed(_) => "E500",
            Self::Network(_) => "E501",
            Self::Config(_) => "E600",
            Self::Other(_) => "E999",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::EntityNotFound(_)
            | Self::RelationNotFound { .. }
            | Self::JobNotFound(_)
            | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Storage { source, .. } => source.kind(),
            Self::Database(_) | Self::Io(_) | Self::Json(_) | Self::Corrupt(_) => {
                ErrorKind::Storage
            }
            Self::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Self::CapabilityUnavailable(_) => ErrorKind::CapabilityUnavailable,
            Self::EmbeddingFailed(_) | Self::Network(_) => ErrorKind::Embedding,
            Self::Config(_) => ErrorKind::Config,
            Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Get a suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::EntityNotFound(name) => Some(format!("mneme create-entity {} <type>", name)),
            Self::Io(_) => Some("Check that the storage path exists and is writable".to_string()),
            Self::Corrupt(_) => {
                Some("Inspect the storage file; it is never repaired automatically".to_string())
            }
            Self::DimensionMismatch { .. } => {
                Some("mneme config get embedding.dimensions".to_string())
            }
            Self::EmbeddingFailed(_) | Self::Network(_) => {
                Some("Set MNEME_OPENAI_API_KEY or switch to embedding.provider = \"default\"".to_string())
            }
            Self::Storage { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Attach the storage operation and key that failed.
    pub fn in_storage(self, operation: &'static str, key: impl Into<String>) -> Self {
        match self {
            // validation and lookup failures already carry their own context
            Self::Storage { .. }
            | Self::Validation(_)
            | Self::EntityNotFound(_)
            | Self::RelationNotFound { .. } => self,
            other => Self::Storage {
                operation,
                key: key.into(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying I/O error kind, looking through storage context.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io(err) => Some(err.kind()),
            Self::Storage { source, .. } => source.io_kind(),
            _ => None,
        }
    }
}

/// Extension for attaching storage context to results
pub trait StorageContext<T> {
    fn storage_context(self, operation: &'static str, key: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> StorageContext<T> for std::result::Result<T, E> {
    fn storage_context(self, operation: &'static str, key: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().in_storage(operation, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_kinds() {
        let err = Error::EntityNotFound("alice".into());
        assert_eq!(err.code(), "E100");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.suggestion().is_some());

        let err = Error::DimensionMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_storage_context_preserves_io_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Result<()> = Err(io).storage_context("save_graph", "/tmp/graph.json");
        let err = err.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::PermissionDenied));
        assert!(err.to_string().contains("save_graph"));
        assert!(err.to_string().contains("/tmp/graph.json"));
    }

    #[test]
    fn test_storage_context_leaves_not_found_alone() {
        let err = Error::EntityNotFound("bob".into()).in_storage("add_observations", "bob");
        assert!(matches!(err, Error::EntityNotFound(_)));
    }
}
