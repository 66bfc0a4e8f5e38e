//! SenderDB: the server's store of hashed items and encrypted labels
//!
//! The authoritative content is a map from hashed item to (optional) label
//! blob. The bin layout queried by [`crate::session::handle_query`] is
//! derived from it and rebuilt on load.

mod bins;
mod ingest;
mod persist;

use std::collections::BTreeMap;

use rayon::prelude::*;
use veil_core::label::{self, MAX_LABEL_BYTE_COUNT, MAX_NONCE_BYTE_COUNT};
use veil_core::{CryptoContext, Error, HashedItem, Item, Label, OprfKey, PsiParams, Result, SlotLayout};

pub use bins::{BinBundle, BinLayout};
pub use ingest::read_tabular;
pub use persist::{DbHeader, DB_HEADER_SIZE, DB_MAGIC};

/// Rows read from a tabular source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbData {
    Unlabeled(Vec<Item>),
    Labeled(Vec<(Item, Label)>),
}

impl DbData {
    pub fn len(&self) -> usize {
        match self {
            DbData::Unlabeled(items) => items.len(),
            DbData::Labeled(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a bulk insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct SenderDb {
    params: PsiParams,
    context: CryptoContext,
    oprf_key: OprfKey,
    label_byte_count: usize,
    nonce_byte_count: usize,
    compressed: bool,
    entries: BTreeMap<HashedItem, Option<Vec<u8>>>,
    bins: BinLayout,
}

impl SenderDb {
    /// Create an empty database with a fresh OPRF key
    ///
    /// The database is labeled iff `label_byte_count > 0`. Unlabeled
    /// databases ignore `nonce_byte_count`.
    pub fn new(
        params: PsiParams,
        label_byte_count: usize,
        nonce_byte_count: usize,
        compressed: bool,
    ) -> Result<Self> {
        Self::with_key(params, OprfKey::random(), label_byte_count, nonce_byte_count, compressed)
    }

    pub(crate) fn with_key(
        params: PsiParams,
        oprf_key: OprfKey,
        label_byte_count: usize,
        nonce_byte_count: usize,
        compressed: bool,
    ) -> Result<Self> {
        params.validate()?;
        if label_byte_count > MAX_LABEL_BYTE_COUNT {
            return Err(Error::InvalidParams(format!(
                "label_byte_count {} exceeds {}",
                label_byte_count, MAX_LABEL_BYTE_COUNT
            )));
        }
        if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
            return Err(Error::InvalidParams(format!(
                "nonce_byte_count {} exceeds {}",
                nonce_byte_count, MAX_NONCE_BYTE_COUNT
            )));
        }
        let nonce_byte_count = if label_byte_count == 0 { 0 } else { nonce_byte_count };

        let layout = SlotLayout::new(&params);
        let bins = BinLayout::new(layout, params.table_params.max_items_per_bin as usize);
        Ok(Self {
            context: CryptoContext::from_params(&params),
            params,
            oprf_key,
            label_byte_count,
            nonce_byte_count,
            compressed,
            entries: BTreeMap::new(),
            bins,
        })
    }

    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    pub fn crypto_context(&self) -> &CryptoContext {
        &self.context
    }

    pub fn oprf_key(&self) -> &OprfKey {
        &self.oprf_key
    }

    pub fn slot_layout(&self) -> &SlotLayout {
        self.bins.slot_layout()
    }

    pub fn is_labeled(&self) -> bool {
        self.label_byte_count > 0
    }

    pub fn label_byte_count(&self) -> usize {
        self.label_byte_count
    }

    pub fn nonce_byte_count(&self) -> usize {
        self.nonce_byte_count
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn item_count(&self) -> usize {
        self.entries.len()
    }

    pub fn packing_rate(&self) -> f64 {
        self.bins.packing_rate()
    }

    /// Bin bundles stored at `bundle_idx`
    pub fn bundles_for(&self, bundle_idx: usize) -> &[BinBundle] {
        self.bins.bundles_for(bundle_idx)
    }

    /// Number of label planes each result part carries
    pub fn label_plane_count(&self) -> usize {
        if !self.is_labeled() {
            return 0;
        }
        let blob_len = label::label_blob_len(self.label_byte_count, self.nonce_byte_count);
        self.slot_layout().label_plane_count(blob_len)
    }

    pub(crate) fn entries(&self) -> &BTreeMap<HashedItem, Option<Vec<u8>>> {
        &self.entries
    }

    fn require_schema(&self, labeled: bool) -> Result<()> {
        match (self.is_labeled(), labeled) {
            (true, false) => Err(Error::SchemaMismatch(
                "unlabeled insert into a labeled database".into(),
            )),
            (false, true) => Err(Error::SchemaMismatch(
                "labeled insert into an unlabeled database".into(),
            )),
            _ => Ok(()),
        }
    }

    fn encrypt_label(&self, label: &[u8], key: &veil_core::LabelKey) -> Result<Vec<u8>> {
        label::encrypt_label(label, key, self.label_byte_count, self.nonce_byte_count)
    }

    /// Store a prepared entry, returning true if the item is new
    pub(crate) fn store(&mut self, item: HashedItem, blob: Option<Vec<u8>>) -> bool {
        let label_felts = match &blob {
            Some(blob) => self.slot_layout().label_felts(blob),
            None => Vec::new(),
        };
        self.bins.upsert(&item, &label_felts);
        self.entries.insert(item, blob).is_none()
    }

    /// Insert an item into an unlabeled database
    ///
    /// Returns true if the item was not present before.
    pub fn insert_or_assign_item(&mut self, item: &Item) -> Result<bool> {
        self.require_schema(false)?;
        let (hashed, _) = self.oprf_key.compute_hash(item);
        Ok(self.store(hashed, None))
    }

    /// Insert an item with a label, replacing any previous label
    pub fn insert_or_assign_labeled(&mut self, item: &Item, label: &[u8]) -> Result<bool> {
        self.require_schema(true)?;
        let (hashed, key) = self.oprf_key.compute_hash(item);
        let blob = self.encrypt_label(label, &key)?;
        Ok(self.store(hashed, Some(blob)))
    }

    fn apply(&mut self, prepared: Vec<(HashedItem, Option<Vec<u8>>)>, skipped: usize) -> BatchReport {
        let mut report = BatchReport {
            skipped,
            ..BatchReport::default()
        };
        for (hashed, blob) in prepared {
            if self.store(hashed, blob) {
                report.inserted += 1;
            } else {
                report.updated += 1;
            }
        }
        report
    }

    /// Bulk insert into an unlabeled database
    pub fn insert_or_assign_items(
        &mut self,
        items: &[Item],
        pool: &rayon::ThreadPool,
    ) -> Result<BatchReport> {
        self.require_schema(false)?;
        let key = &self.oprf_key;
        let prepared: Vec<_> = pool.install(|| {
            items
                .par_iter()
                .map(|item| (key.compute_hash(item).0, None))
                .collect()
        });

        let report = self.apply(prepared, 0);
        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            "bulk insert finished"
        );
        Ok(report)
    }

    /// Bulk insert into a labeled database
    ///
    /// Entries that cannot be stored (label too long) are logged and
    /// skipped; the rest are applied.
    pub fn insert_or_assign_labeled_batch(
        &mut self,
        items: &[(Item, Label)],
        pool: &rayon::ThreadPool,
    ) -> Result<BatchReport> {
        self.require_schema(true)?;
        let this = &*self;
        let results: Vec<(usize, Result<(HashedItem, Option<Vec<u8>>)>)> = pool.install(|| {
            items
                .par_iter()
                .enumerate()
                .map(|(idx, (item, label))| {
                    let (hashed, key) = this.oprf_key.compute_hash(item);
                    let blob = this.encrypt_label(label, &key);
                    (idx, blob.map(|b| (hashed, Some(b))))
                })
                .collect()
        });

        let mut prepared = Vec::with_capacity(results.len());
        let mut skipped = 0;
        for (idx, result) in results {
            match result {
                Ok(entry) => prepared.push(entry),
                Err(e) => {
                    tracing::warn!(row = idx, error = %e, "skipping entry");
                    skipped += 1;
                }
            }
        }

        let report = self.apply(prepared, skipped);
        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "bulk labeled insert finished"
        );
        Ok(report)
    }

    /// Replace the database contents with `data`
    pub fn set_data(&mut self, data: &DbData, pool: &rayon::ThreadPool) -> Result<BatchReport> {
        match data {
            DbData::Unlabeled(_) => self.require_schema(false)?,
            DbData::Labeled(_) => self.require_schema(true)?,
        }
        self.clear();
        match data {
            DbData::Unlabeled(items) => self.insert_or_assign_items(items, pool),
            DbData::Labeled(items) => self.insert_or_assign_labeled_batch(items, pool),
        }
    }

    /// Remove all items, keeping parameters and key
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bins = BinLayout::new(self.slot_layout().clone(), self.params.table_params.max_items_per_bin as usize);
    }

    pub fn contains(&self, item: &Item) -> bool {
        let (hashed, _) = self.oprf_key.compute_hash(item);
        self.entries.contains_key(&hashed)
    }

    /// Decrypt the label stored for `item`
    pub fn label(&self, item: &Item) -> Option<Label> {
        let (hashed, key) = self.oprf_key.compute_hash(item);
        let blob = self.entries.get(&hashed)?.as_ref()?;
        match label::decrypt_label(blob, &key, self.label_byte_count, self.nonce_byte_count) {
            Ok(label) => Some(label),
            Err(e) => {
                tracing::warn!(item = %hashed, error = %e, "stored label failed to decrypt");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::params::test_params;
    use veil_core::ThreadPoolConfig;

    fn pool() -> rayon::ThreadPool {
        ThreadPoolConfig::new(2).unwrap().build().unwrap()
    }

    #[test]
    fn test_unlabeled_insert_and_lookup() {
        let mut db = SenderDb::new(test_params(), 0, 16, false).unwrap();
        assert_eq!(db.nonce_byte_count(), 0);
        assert!(db.insert_or_assign_item(&Item::from("a")).unwrap());
        assert!(!db.insert_or_assign_item(&Item::from("a")).unwrap());
        assert_eq!(db.item_count(), 1);
        assert!(db.contains(&Item::from("a")));
        assert!(!db.contains(&Item::from("b")));
        assert_eq!(db.label(&Item::from("a")), None);
        assert_eq!(db.label_plane_count(), 0);
    }

    #[test]
    fn test_schema_exclusivity() {
        let mut unlabeled = SenderDb::new(test_params(), 0, 0, false).unwrap();
        assert!(matches!(
            unlabeled.insert_or_assign_labeled(&Item::from("a"), b"x"),
            Err(Error::SchemaMismatch(_))
        ));
        assert_eq!(unlabeled.item_count(), 0);

        let mut labeled = SenderDb::new(test_params(), 4, 16, false).unwrap();
        assert!(matches!(
            labeled.insert_or_assign_item(&Item::from("a")),
            Err(Error::SchemaMismatch(_))
        ));
        assert!(matches!(
            labeled.insert_or_assign_items(&[Item::from("a")], &pool()),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_idempotent_upsert_keeps_last_label() {
        let mut db = SenderDb::new(test_params(), 8, 16, false).unwrap();
        db.insert_or_assign_labeled(&Item::from("a"), b"first").unwrap();
        db.insert_or_assign_labeled(&Item::from("a"), b"second").unwrap();
        assert_eq!(db.item_count(), 1);
        assert_eq!(db.label(&Item::from("a")), Some(b"second".to_vec()));
    }

    #[test]
    fn test_label_too_long() {
        let mut db = SenderDb::new(test_params(), 3, 16, false).unwrap();
        assert!(matches!(
            db.insert_or_assign_labeled(&Item::from("a"), b"four"),
            Err(Error::LabelTooLong { actual: 4, max: 3 })
        ));
        assert_eq!(db.item_count(), 0);
    }

    #[test]
    fn test_batch_isolates_bad_entries() {
        let mut db = SenderDb::new(test_params(), 4, 8, false).unwrap();
        db.insert_or_assign_labeled(&Item::from("a"), b"old").unwrap();

        let batch = vec![
            (Item::from("a"), b"new".to_vec()),
            (Item::from("b"), b"too long".to_vec()),
            (Item::from("c"), b"ok".to_vec()),
        ];
        let report = db.insert_or_assign_labeled_batch(&batch, &pool()).unwrap();
        assert_eq!(report, BatchReport { inserted: 1, updated: 1, skipped: 1 });
        assert_eq!(db.label(&Item::from("a")), Some(b"new".to_vec()));
        assert!(!db.contains(&Item::from("b")));
        assert_eq!(db.label(&Item::from("c")), Some(b"ok".to_vec()));
    }

    #[test]
    fn test_set_data_replaces_contents() {
        let mut db = SenderDb::new(test_params(), 0, 0, false).unwrap();
        db.insert_or_assign_item(&Item::from("old")).unwrap();

        let data = DbData::Unlabeled(vec![Item::from("x"), Item::from("y"), Item::from("x")]);
        let report = db.set_data(&data, &pool()).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(db.item_count(), 2);
        assert!(!db.contains(&Item::from("old")));
        assert!(db.packing_rate() > 0.0);
    }

    #[test]
    fn test_label_planes_cover_blob() {
        let db = SenderDb::new(test_params(), 10, 16, false).unwrap();
        // 16 + 2 + 10 = 28 bytes = 224 bits -> 15 felts -> 2 planes
        assert_eq!(db.label_plane_count(), 2);
    }
}
