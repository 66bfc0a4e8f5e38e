//! Client cuckoo table
//!
//! Every hashed item is placed in exactly one of its candidate bins. When
//! all candidates are taken the occupant of one of them is evicted and
//! re-placed, up to [`MAX_PROBES`] times.

use veil_core::{HashedItem, IndexTranslationTable, SlotLayout};

/// Evictions attempted before an item is given up
pub const MAX_PROBES: usize = 512;

#[derive(Debug)]
struct Occupant {
    item: HashedItem,
    /// Positions of this item in the caller's input
    indices: Vec<usize>,
}

#[derive(Debug)]
pub struct CuckooTable<'a> {
    layout: &'a SlotLayout,
    bins: Vec<Option<Occupant>>,
    item_count: usize,
}

impl<'a> CuckooTable<'a> {
    pub fn new(layout: &'a SlotLayout, item_count: usize) -> Self {
        let mut bins = Vec::with_capacity(layout.table_size as usize);
        bins.resize_with(layout.table_size as usize, || None);
        Self {
            layout,
            bins,
            item_count,
        }
    }

    /// Place all items in input order
    pub fn build(layout: &'a SlotLayout, items: &[HashedItem]) -> Self {
        let mut table = Self::new(layout, items.len());
        for (idx, item) in items.iter().enumerate() {
            table.insert(*item, idx);
        }
        table
    }

    /// Insert the item found at `original_idx` of the input
    ///
    /// Returns false when some item had to be dropped. The dropped item is
    /// not necessarily the one being inserted.
    pub fn insert(&mut self, item: HashedItem, original_idx: usize) -> bool {
        let mut locations = self.layout.bin_locations(&item);

        for &bin in &locations {
            if let Some(occupant) = self.bins[bin as usize].as_mut() {
                if occupant.item == item {
                    occupant.indices.push(original_idx);
                    return true;
                }
            }
        }

        let mut current = Occupant {
            item,
            indices: vec![original_idx],
        };
        let mut came_from: Option<u32> = None;

        for probe in 0..MAX_PROBES {
            if let Some(&free) = locations.iter().find(|&&bin| self.bins[bin as usize].is_none()) {
                self.bins[free as usize] = Some(current);
                return true;
            }

            let mut target = locations[probe % locations.len()];
            if came_from == Some(target) && locations.len() > 1 {
                target = locations[(probe + 1) % locations.len()];
            }

            match self.bins[target as usize].replace(current) {
                Some(evicted) => current = evicted,
                None => return true,
            }
            locations = self.layout.bin_locations(&current.item);
            came_from = Some(target);
        }

        tracing::debug!(
            item = %current.item,
            inputs = ?current.indices,
            "cuckoo insertion exhausted its probes"
        );
        false
    }

    /// Occupied bins and the item each holds
    pub fn occupied(&self) -> impl Iterator<Item = (u32, &HashedItem)> {
        self.bins
            .iter()
            .enumerate()
            .filter_map(|(bin, slot)| slot.as_ref().map(|o| (bin as u32, &o.item)))
    }

    /// Fraction of bins holding an item
    pub fn fill_rate(&self) -> f64 {
        if self.bins.is_empty() {
            return 0.0;
        }
        self.bins.iter().filter(|b| b.is_some()).count() as f64 / self.bins.len() as f64
    }

    pub fn into_itt(self) -> IndexTranslationTable {
        let item_count = self.item_count;
        IndexTranslationTable::from_bins(
            item_count,
            self.bins
                .into_iter()
                .enumerate()
                .filter_map(|(bin, slot)| slot.map(|o| (bin as u32, o.indices))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::params::test_params;
    use veil_core::{Item, OprfKey};

    fn hashed(count: usize) -> Vec<HashedItem> {
        let key = OprfKey::random();
        (0..count)
            .map(|i| key.compute_hash(&Item::from(format!("item-{}", i).as_str())).0)
            .collect()
    }

    #[test]
    fn test_every_item_placed_once() {
        let layout = SlotLayout::new(&test_params());
        let items = hashed(200);
        let table = CuckooTable::build(&layout, &items);
        assert_eq!(table.occupied().count(), 200);

        for (bin, item) in table.occupied() {
            assert!(layout.bin_locations(item).contains(&bin));
        }

        let itt = table.into_itt();
        assert!(itt.unmapped_items().is_empty());
        assert_eq!(itt.bin_count(), 200);
    }

    #[test]
    fn test_duplicates_share_bin() {
        let layout = SlotLayout::new(&test_params());
        let items = hashed(3);
        let input = vec![items[0], items[1], items[0], items[2]];

        let itt = CuckooTable::build(&layout, &input).into_itt();
        assert_eq!(itt.bin_count(), 3);
        let shared = itt.bins().find(|(_, idx)| idx.len() == 2).unwrap();
        assert_eq!(shared.1, &[0, 2]);
    }

    #[test]
    fn test_overfull_table_leaves_items_unmapped() {
        let layout = SlotLayout {
            table_size: 8,
            ..SlotLayout::new(&test_params())
        };
        let items = hashed(12);
        let mut table = CuckooTable::new(&layout, items.len());
        let placed = items
            .iter()
            .enumerate()
            .filter(|(idx, item)| table.insert(**item, *idx))
            .count();
        assert!(placed <= 8);
        let held = table.occupied().count();
        assert!(table.fill_rate() <= 1.0);

        let itt = table.into_itt();
        assert_eq!(itt.unmapped_items().len(), 12 - held);
    }

    #[test]
    fn test_placement_is_deterministic() {
        let layout = SlotLayout::new(&test_params());
        let items = hashed(300);
        let a: Vec<_> = CuckooTable::build(&layout, &items)
            .occupied()
            .map(|(b, i)| (b, *i))
            .collect();
        let b: Vec<_> = CuckooTable::build(&layout, &items)
            .occupied()
            .map(|(b, i)| (b, *i))
            .collect();
        assert_eq!(a, b);
    }
}
