//! Server-side bin packing
//!
//! Every item is stored in all of its candidate bins. Each bundle index
//! holds a list of bin bundles; a bin bundle accepts at most
//! `max_items_per_bin` items per bin, and a new bundle is opened when an
//! item's bin is full in all existing ones.

use veil_core::{BinEntry, HashedItem, SlotLayout};

/// One bin bundle: `items_per_bundle` bins of bounded size
#[derive(Debug, Clone)]
pub struct BinBundle {
    entries: Vec<Vec<BinEntry>>,
    keys: Vec<Vec<HashedItem>>,
}

impl BinBundle {
    fn new(items_per_bundle: usize) -> Self {
        Self {
            entries: vec![Vec::new(); items_per_bundle],
            keys: vec![Vec::new(); items_per_bundle],
        }
    }

    /// Bin contents, indexed by bin within the bundle
    pub fn bins(&self) -> &[Vec<BinEntry>] {
        &self.entries
    }

    fn position(&self, bin: usize, item: &HashedItem) -> Option<usize> {
        self.keys[bin].iter().position(|k| k == item)
    }

    fn occupied(&self) -> usize {
        self.keys.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct BinLayout {
    layout: SlotLayout,
    max_items_per_bin: usize,
    bundles: Vec<Vec<BinBundle>>,
}

impl BinLayout {
    pub fn new(layout: SlotLayout, max_items_per_bin: usize) -> Self {
        let bundles = vec![Vec::new(); layout.bundle_idx_count];
        Self {
            layout,
            max_items_per_bin,
            bundles,
        }
    }

    pub fn slot_layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Insert or update `item` in all of its bins
    pub fn upsert(&mut self, item: &HashedItem, label_felts: &[u64]) {
        let item_felts = self.layout.item_felts(item);
        for location in self.layout.bin_locations(item) {
            let (bundle_idx, bin) = self.layout.bundle_of(location);
            let bundles = &mut self.bundles[bundle_idx];

            let existing = bundles
                .iter_mut()
                .find_map(|b| b.position(bin, item).map(|pos| (b, pos)));
            if let Some((bundle, pos)) = existing {
                bundle.entries[bin][pos].label_felts = label_felts.to_vec();
                continue;
            }

            let entry = BinEntry {
                item_felts: item_felts.clone(),
                label_felts: label_felts.to_vec(),
            };
            let target = match bundles
                .iter_mut()
                .position(|b| b.keys[bin].len() < self.max_items_per_bin)
            {
                Some(idx) => &mut bundles[idx],
                None => {
                    bundles.push(BinBundle::new(self.layout.items_per_bundle));
                    let last = bundles.len() - 1;
                    &mut bundles[last]
                }
            };
            target.entries[bin].push(entry);
            target.keys[bin].push(*item);
        }
    }

    pub fn bundles_for(&self, bundle_idx: usize) -> &[BinBundle] {
        self.bundles.get(bundle_idx).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bin_bundle_count(&self) -> usize {
        self.bundles.iter().map(Vec::len).sum()
    }

    /// Fraction of allocated bin capacity in use
    pub fn packing_rate(&self) -> f64 {
        let capacity = self.bin_bundle_count() * self.layout.items_per_bundle * self.max_items_per_bin;
        if capacity == 0 {
            return 0.0;
        }
        let occupied: usize = self.bundles.iter().flatten().map(BinBundle::occupied).sum();
        occupied as f64 / capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::params::test_params;

    fn layout(max_items_per_bin: u32) -> BinLayout {
        let mut params = test_params();
        params.table_params.max_items_per_bin = max_items_per_bin;
        BinLayout::new(SlotLayout::new(&params), max_items_per_bin as usize)
    }

    #[test]
    fn test_item_lands_in_every_location() {
        let mut bins = layout(4);
        let item = HashedItem::new([9; 16]);
        bins.upsert(&item, &[]);

        let slot_layout = bins.slot_layout().clone();
        let felts = slot_layout.item_felts(&item);
        for location in slot_layout.bin_locations(&item) {
            let (bundle_idx, bin) = slot_layout.bundle_of(location);
            let bundle = &bins.bundles_for(bundle_idx)[0];
            assert_eq!(bundle.bins()[bin][0].item_felts, felts);
        }
    }

    #[test]
    fn test_upsert_replaces_label() {
        let mut bins = layout(4);
        let item = HashedItem::new([1; 16]);
        bins.upsert(&item, &[1, 2]);
        bins.upsert(&item, &[3, 4]);
        assert_eq!(bins.bin_bundle_count(), 1);

        let (bundle_idx, bin) = bins.slot_layout().bundle_of(bins.slot_layout().bin_locations(&item)[0]);
        let bin_entries = &bins.bundles_for(bundle_idx)[0].bins()[bin];
        assert_eq!(bin_entries.len(), 1);
        assert_eq!(bin_entries[0].label_felts, vec![3, 4]);
    }

    #[test]
    fn test_full_bin_opens_new_bundle() {
        let mut bins = layout(1);
        for i in 0..200u8 {
            bins.upsert(&HashedItem::new([i; 16]), &[]);
        }
        assert!(bins.bin_bundle_count() > 1);
        let rate = bins.packing_rate();
        assert!(rate > 0.0 && rate <= 1.0);
    }
}
