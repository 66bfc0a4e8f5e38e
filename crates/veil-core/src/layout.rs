//! Table geometry: bin locations and slot packing
//!
//! A query is a set of bundles, one per `bundle_idx`. Each bundle packs
//! `items_per_bundle` bins side by side, and each bin occupies
//! `felts_per_item` consecutive slots holding the bit-sliced item.

use std::ops::Range;

use sha2::{Digest, Sha256};

use crate::item::HashedItem;
use crate::params::PsiParams;

const BIN_HASH_DOMAIN: &[u8] = b"veil-bin";

/// Geometry derived from a validated [`PsiParams`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    pub table_size: u32,
    pub hash_func_count: u32,
    pub felts_per_item: usize,
    pub bits_per_felt: u32,
    pub items_per_bundle: usize,
    pub bundle_idx_count: usize,
    pub slot_count: usize,
}

impl SlotLayout {
    pub fn new(params: &PsiParams) -> Self {
        Self {
            table_size: params.table_params.table_size,
            hash_func_count: params.table_params.hash_func_count,
            felts_per_item: params.item_params.felts_per_item as usize,
            bits_per_felt: params.bits_per_felt(),
            items_per_bundle: params.items_per_bundle() as usize,
            bundle_idx_count: params.bundle_idx_count() as usize,
            slot_count: params.encryption_params.poly_modulus_degree as usize,
        }
    }

    /// Candidate bins for an item, one per hash function, deduplicated
    pub fn bin_locations(&self, item: &HashedItem) -> Vec<u32> {
        let mut locations = Vec::with_capacity(self.hash_func_count as usize);
        for hash_idx in 0..self.hash_func_count {
            let digest = Sha256::new()
                .chain_update(BIN_HASH_DOMAIN)
                .chain_update(hash_idx.to_le_bytes())
                .chain_update(item.as_bytes())
                .finalize();
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let bin = (u64::from_le_bytes(head) % self.table_size as u64) as u32;
            if !locations.contains(&bin) {
                locations.push(bin);
            }
        }
        locations
    }

    /// Split a table bin into `(bundle_idx, bin index within the bundle)`
    pub fn bundle_of(&self, bin: u32) -> (usize, usize) {
        let bin = bin as usize;
        (bin / self.items_per_bundle, bin % self.items_per_bundle)
    }

    /// Table bin for a bin index within a bundle
    pub fn table_bin(&self, bundle_idx: usize, bin_in_bundle: usize) -> u32 {
        (bundle_idx * self.items_per_bundle + bin_in_bundle) as u32
    }

    /// Slots covered by a bin within its bundle
    pub fn slot_range(&self, bin_in_bundle: usize) -> Range<usize> {
        let start = bin_in_bundle * self.felts_per_item;
        start..start + self.felts_per_item
    }

    /// Encode the low `felts_per_item * bits_per_felt` bits of an item
    pub fn item_felts(&self, item: &HashedItem) -> Vec<u64> {
        bytes_to_felts(item.as_bytes(), self.felts_per_item, self.bits_per_felt)
    }

    /// Field elements needed to carry a label blob of `blob_len` bytes
    pub fn label_felt_count(&self, blob_len: usize) -> usize {
        if blob_len == 0 {
            return 0;
        }
        let bits = blob_len * 8;
        let per = self.bits_per_felt as usize;
        (bits + per - 1) / per
    }

    /// Number of label planes, each `felts_per_item` felts wide
    pub fn label_plane_count(&self, blob_len: usize) -> usize {
        let felts = self.label_felt_count(blob_len);
        (felts + self.felts_per_item - 1) / self.felts_per_item
    }

    /// Label blob as felts, zero-padded to whole planes
    pub fn label_felts(&self, blob: &[u8]) -> Vec<u64> {
        let planes = self.label_plane_count(blob.len());
        bytes_to_felts(blob, planes * self.felts_per_item, self.bits_per_felt)
    }
}

/// Bit-slice `bytes` (little-endian bit order) into `felt_count` felts of
/// `bits_per_felt` bits. Bits past the end of `bytes` are zero; bits that
/// don't fit are dropped.
pub fn bytes_to_felts(bytes: &[u8], felt_count: usize, bits_per_felt: u32) -> Vec<u64> {
    let total_bits = bytes.len() * 8;
    let mut felts = vec![0u64; felt_count];
    for (i, felt) in felts.iter_mut().enumerate() {
        for b in 0..bits_per_felt as usize {
            let bit = i * bits_per_felt as usize + b;
            if bit >= total_bits {
                return felts;
            }
            if bytes[bit / 8] >> (bit % 8) & 1 == 1 {
                *felt |= 1 << b;
            }
        }
    }
    felts
}

/// Inverse of [`bytes_to_felts`]
pub fn felts_to_bytes(felts: &[u64], byte_count: usize, bits_per_felt: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; byte_count];
    let total_bits = byte_count * 8;
    for (i, felt) in felts.iter().enumerate() {
        for b in 0..bits_per_felt as usize {
            let bit = i * bits_per_felt as usize + b;
            if bit >= total_bits {
                return bytes;
            }
            if felt >> b & 1 == 1 {
                bytes[bit / 8] |= 1 << (bit % 8);
            }
        }
    }
    bytes
}
