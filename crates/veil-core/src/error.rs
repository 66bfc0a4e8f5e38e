//! Error types for veil-core

use thiserror::Error;

use crate::wire::MessageKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Context mismatch while decoding {kind}: expected context {expected:016x}, got {actual:016x}")]
    ContextMismatch {
        kind: MessageKind,
        expected: u64,
        actual: u64,
    },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Query must contain at least one item")]
    EmptyQuery,

    #[error("Query does not fit the cuckoo table: {unplaced} items left over in {table_size} bins")]
    QueryTooLarge { unplaced: usize, table_size: u32 },

    #[error("Invalid operation kind: expected {expected}, received {received}")]
    InvalidOperationKind {
        expected: OperationKind,
        received: OperationKind,
    },

    #[error("Parameter mismatch: request was built for parameters {request:016x}, database uses {database:016x}")]
    ParameterMismatch { request: u64, database: u64 },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Label of {actual} bytes exceeds the database label width of {max} bytes")]
    LabelTooLong { actual: usize, max: usize },

    #[error("Ingest error: {0}")]
    IngestError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Invalid session state for {operation}: expected {expected}, session is {actual}")]
    InvalidState {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Database not loaded: initialize or load a database first")]
    DatabaseNotLoaded,

    #[error("Homomorphic backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Request operation carried by a sender-bound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Params,
    Oprf,
    Query,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Params => write!(f, "params"),
            OperationKind::Oprf => write!(f, "oprf"),
            OperationKind::Query => write!(f, "query"),
        }
    }
}
