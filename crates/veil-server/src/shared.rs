//! Shared database handle: lock-free snapshots for readers, serialized
//! writers
//!
//! Readers grab an `Arc<SenderDb>` snapshot and keep using it for the whole
//! request even if a writer swaps in a new database meanwhile. Writers
//! build the next database off to the side (clone-modify for updates, fresh
//! for loads) and publish it with a single atomic swap.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use veil_core::{Error, Result};

use crate::db::SenderDb;
use crate::metrics;

/// Database snapshot held for the duration of a request
pub type DbSnapshot = Arc<SenderDb>;

#[derive(Default)]
pub struct SharedSenderDb {
    current: ArcSwapOption<SenderDb>,
    writer: Mutex<()>,
}

impl SharedSenderDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db(db: SenderDb) -> Self {
        let shared = Self::new();
        shared.replace(db);
        shared
    }

    /// Current snapshot, or `DatabaseNotLoaded`
    pub fn snapshot(&self) -> Result<DbSnapshot> {
        self.current.load_full().ok_or(Error::DatabaseNotLoaded)
    }

    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }

    /// Publish a new database, returning the previous one
    pub fn replace(&self, db: SenderDb) -> Option<DbSnapshot> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let items = db.item_count();
        let previous = self.current.swap(Some(Arc::new(db)));
        metrics::set_db_items(items);
        tracing::info!(items, "SenderDB published");
        previous
    }

    /// Apply `f` to a copy of the current database and publish the result
    ///
    /// If `f` fails, the current database is left untouched.
    pub fn update<T>(&self, f: impl FnOnce(&mut SenderDb) -> Result<T>) -> Result<T> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load_full().ok_or(Error::DatabaseNotLoaded)?;

        let mut next = SenderDb::clone(&current);
        let out = f(&mut next)?;
        metrics::set_db_items(next.item_count());
        self.current.store(Some(Arc::new(next)));
        Ok(out)
    }

    /// Drop the current database
    pub fn unload(&self) -> Option<DbSnapshot> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        metrics::set_db_items(0);
        self.current.swap(None)
    }
}
