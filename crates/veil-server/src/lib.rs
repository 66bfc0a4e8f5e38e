//! veil-server: SenderDB and request handling for labeled PSI
//!
//! Holds the server's database, answers OPRF and query requests against
//! it, and serves them over TCP.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod session;
pub mod shared;

pub use config::ServerConfig;
pub use db::{read_tabular, BatchReport, DbData, SenderDb};
pub use dispatcher::Dispatcher;
pub use error::ServerError;
pub use session::{
    handle_oprf, handle_oprf_bytes, handle_params, handle_query, handle_query_bytes, handle_request,
};
pub use shared::{DbSnapshot, SharedSenderDb};
