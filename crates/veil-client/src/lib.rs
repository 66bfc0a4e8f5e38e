//! veil-client: Labeled PSI client
//!
//! [`ClientSession`] drives the protocol over any
//! [`Channel`](veil_core::Channel); [`NetworkClient`] wraps it for the
//! common one-shot TCP query.

pub mod client;
pub mod cuckoo;
pub mod error;
pub mod session;

pub use client::{ClientBuilder, NetworkClient, TrafficStats};
pub use cuckoo::CuckooTable;
pub use error::ClientError;
pub use session::{ClientSession, SessionState};
