//! Worker pool sizing
//!
//! Bulk OPRF hashing, label encryption and bundle evaluation run on an
//! explicit `rayon::ThreadPool` built from this config and passed down to
//! the operations that need it.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    pub thread_count: usize,
}

impl ThreadPoolConfig {
    pub fn new(thread_count: usize) -> Result<Self> {
        let config = Self { thread_count };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_count < 1 {
            return Err(Error::InvalidParams("thread_count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<rayon::ThreadPool> {
        self.validate()?;
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_count)
            .thread_name(|i| format!("veil-worker-{}", i))
            .build()
            .map_err(|e| Error::InvalidParams(format!("failed to build worker pool: {}", e)))
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let thread_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { thread_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(ThreadPoolConfig::new(0).is_err());
        assert!(ThreadPoolConfig { thread_count: 0 }.build().is_err());
    }

    #[test]
    fn test_pool_has_requested_size() {
        let pool = ThreadPoolConfig::new(2).unwrap().build().unwrap();
        assert_eq!(pool.current_num_threads(), 2);
        assert!(ThreadPoolConfig::default().thread_count >= 1);
    }
}
