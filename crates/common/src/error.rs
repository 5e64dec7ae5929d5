//! Error types for netmesh

use thiserror::Error;

/// Result type alias using netmesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// netmesh error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} named {name}")]
    AlreadyExists { kind: String, name: String },

    #[error(
        "Circular routing: peer '{peer}' is the gateway of route '{route}' and cannot be a member of group '{group}'"
    )]
    CircularRouting {
        group: String,
        route: String,
        peer: String,
    },

    #[error("Field '{field}' of {entity} cannot be changed")]
    ImmutableField { entity: String, field: String },

    #[error("Invalid policy order: {0}")]
    InvalidOrder(String),

    #[error("DNS mapping address {ip} is outside route destination {cidr}")]
    DnsMappingOutOfRange { ip: String, cidr: String },

    #[error("{kind} {name} is still in use: {reason}")]
    InUse {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Insufficient capacity: requested {requested} hosts, at most {available} available")]
    Capacity { requested: u64, available: u64 },

    #[error("Address space exhausted: requested {requested} blocks, found {found}")]
    Exhausted { requested: usize, found: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn immutable(entity: impl Into<String>, field: &str) -> Self {
        Error::ImmutableField {
            entity: entity.into(),
            field: field.to_string(),
        }
    }

    /// True for errors caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_)
        )
    }
}
