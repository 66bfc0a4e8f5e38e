//! Index Translation Table
//!
//! Maps the bins of a client query back to the positions of the items the
//! caller passed in. Duplicate inputs share a bin; an input that could not
//! be placed has no bin and always comes back as not found.

use std::collections::BTreeMap;

/// Single-use mapping from table bin to original item indices
///
/// Deliberately not `Clone`: result extraction consumes it.
#[derive(Debug)]
pub struct IndexTranslationTable {
    item_count: usize,
    bins: BTreeMap<u32, Vec<usize>>,
}

impl IndexTranslationTable {
    pub fn new(item_count: usize) -> Self {
        Self {
            item_count,
            bins: BTreeMap::new(),
        }
    }

    /// Build from `(bin, original indices)` pairs
    pub fn from_bins(item_count: usize, bins: impl IntoIterator<Item = (u32, Vec<usize>)>) -> Self {
        let mut table = Self::new(item_count);
        for (bin, indices) in bins {
            for idx in indices {
                table.insert(bin, idx);
            }
        }

        let unmapped = table.unmapped_items();
        if !unmapped.is_empty() {
            tracing::warn!(
                count = unmapped.len(),
                items = ?unmapped,
                "items could not be placed in the query table and will be reported as not found"
            );
        }
        table
    }

    pub fn insert(&mut self, bin: u32, original_idx: usize) {
        debug_assert!(original_idx < self.item_count);
        let entry = self.bins.entry(bin).or_default();
        if !entry.contains(&original_idx) {
            entry.push(original_idx);
        }
    }

    /// Number of items in the original query
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Number of occupied bins
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn original_indices(&self, bin: u32) -> &[usize] {
        self.bins.get(&bin).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bins(&self) -> impl Iterator<Item = (u32, &[usize])> {
        self.bins.iter().map(|(bin, idx)| (*bin, idx.as_slice()))
    }

    /// Original indices that are not mapped to any bin
    pub fn unmapped_items(&self) -> Vec<usize> {
        let mut mapped = vec![false; self.item_count];
        for idx in self.bins.values().flatten() {
            if let Some(slot) = mapped.get_mut(*idx) {
                *slot = true;
            }
        }
        mapped
            .iter()
            .enumerate()
            .filter(|(_, m)| !**m)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_share_bin() {
        let itt = IndexTranslationTable::from_bins(3, vec![(5, vec![0, 2]), (9, vec![1])]);
        assert_eq!(itt.item_count(), 3);
        assert_eq!(itt.bin_count(), 2);
        assert_eq!(itt.original_indices(5), &[0, 2]);
        assert_eq!(itt.original_indices(9), &[1]);
        assert!(itt.original_indices(6).is_empty());
        assert!(itt.unmapped_items().is_empty());
    }

    #[test]
    fn test_unmapped_items_reported() {
        let itt = IndexTranslationTable::from_bins(4, vec![(1, vec![0]), (2, vec![3])]);
        assert_eq!(itt.unmapped_items(), vec![1, 2]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut itt = IndexTranslationTable::new(1);
        itt.insert(3, 0);
        itt.insert(3, 0);
        assert_eq!(itt.original_indices(3), &[0]);
    }
}
