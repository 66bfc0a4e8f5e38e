//! veil-psi: labeled private set intersection
//!
//! Re-exports the workspace crates for applications that want a single
//! dependency.

pub use veil_client;
pub use veil_core;
pub use veil_server;
