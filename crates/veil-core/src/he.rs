//! Homomorphic backend seam
//!
//! The protocol layer only needs four things from the encryption scheme:
//! encrypt a slot vector, decrypt one, and evaluate a query bundle against
//! the server's bin contents. [`HeBackend`] captures exactly that.
//!
//! [`TransparentBackend`] keeps slots in the clear and performs the bin
//! comparison directly. It provides no query confidentiality and exists so
//! the session, codec and database layers can run end to end.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::params::PsiParams;
use crate::Result;

/// Identity of the encryption parameters a ciphertext was produced under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoContext {
    pub id: u64,
    pub slot_count: usize,
    pub plain_modulus: u64,
}

impl CryptoContext {
    /// Derive the context from the encryption section of `params`
    pub fn from_params(params: &PsiParams) -> Self {
        let enc = &params.encryption_params;
        let mut hasher = Sha256::new()
            .chain_update(b"veil-context")
            .chain_update(params.plain_modulus().to_le_bytes())
            .chain_update(enc.poly_modulus_degree.to_le_bytes());
        for bits in &enc.coeff_modulus_bits {
            hasher.update(bits.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);

        Self {
            id: u64::from_le_bytes(head),
            slot_count: enc.poly_modulus_degree as usize,
            plain_modulus: params.plain_modulus(),
        }
    }
}

/// Opaque ciphertext tagged with its context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub context_id: u64,
    pub body: Vec<u8>,
}

/// One item stored in a server bin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinEntry {
    pub item_felts: Vec<u64>,
    /// Label blob felts, `label_plane_count * felts_per_item` long; empty
    /// for unlabeled databases
    pub label_felts: Vec<u64>,
}

/// Encrypted answer for one bin bundle
///
/// After decryption, a bin whose slots in `matches` are all zero matched
/// the query; the same slots across `label_planes` carry its label felts.
#[derive(Debug, Clone)]
pub struct BundleResult {
    pub matches: Ciphertext,
    pub label_planes: Vec<Ciphertext>,
}

pub trait HeBackend: Send + Sync + Sized {
    /// Build a backend for the given parameters
    fn from_params(params: &PsiParams) -> Result<Self>;

    fn context(&self) -> &CryptoContext;

    /// Encrypt a full slot vector
    fn encrypt(&self, slots: &[u64]) -> Result<Ciphertext>;

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u64>>;

    /// Evaluate one query bundle against a bin bundle
    ///
    /// `bins[i]` holds the entries of bin `i` within the bundle.
    fn evaluate_bundle(
        &self,
        query: &Ciphertext,
        bins: &[Vec<BinEntry>],
        label_plane_count: usize,
    ) -> Result<BundleResult>;
}

/// Cleartext backend
#[derive(Debug, Clone)]
pub struct TransparentBackend {
    context: CryptoContext,
    felts_per_item: usize,
}

impl TransparentBackend {
    fn check_context(&self, ciphertext: &Ciphertext) -> Result<()> {
        if ciphertext.context_id != self.context.id {
            return Err(Error::Backend(format!(
                "ciphertext context {:016x} does not match backend context {:016x}",
                ciphertext.context_id, self.context.id
            )));
        }
        Ok(())
    }
}

impl HeBackend for TransparentBackend {
    fn from_params(params: &PsiParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            context: CryptoContext::from_params(params),
            felts_per_item: params.item_params.felts_per_item as usize,
        })
    }

    fn context(&self) -> &CryptoContext {
        &self.context
    }

    fn encrypt(&self, slots: &[u64]) -> Result<Ciphertext> {
        if slots.len() != self.context.slot_count {
            return Err(Error::Backend(format!(
                "expected {} slots, got {}",
                self.context.slot_count,
                slots.len()
            )));
        }
        if let Some(bad) = slots.iter().find(|&&s| s >= self.context.plain_modulus) {
            return Err(Error::Backend(format!(
                "slot value {} exceeds plain modulus {}",
                bad, self.context.plain_modulus
            )));
        }
        let body = slots.iter().flat_map(|s| s.to_le_bytes()).collect();
        Ok(Ciphertext {
            context_id: self.context.id,
            body,
        })
    }

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u64>> {
        self.check_context(ciphertext)?;
        if ciphertext.body.len() != self.context.slot_count * 8 {
            return Err(Error::MalformedMessage(format!(
                "ciphertext body is {} bytes, expected {}",
                ciphertext.body.len(),
                self.context.slot_count * 8
            )));
        }
        Ok(ciphertext
            .body
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect())
    }

    fn evaluate_bundle(
        &self,
        query: &Ciphertext,
        bins: &[Vec<BinEntry>],
        label_plane_count: usize,
    ) -> Result<BundleResult> {
        let slots = self.decrypt(query)?;
        let fpi = self.felts_per_item;
        if bins.len() * fpi > slots.len() {
            return Err(Error::Backend(format!(
                "{} bins do not fit in {} slots",
                bins.len(),
                slots.len()
            )));
        }

        let mut matches = vec![1u64; slots.len()];
        let mut planes = vec![vec![0u64; slots.len()]; label_plane_count];

        for (bin_idx, entries) in bins.iter().enumerate() {
            let range = bin_idx * fpi..(bin_idx + 1) * fpi;
            let queried = &slots[range.clone()];
            let Some(hit) = entries.iter().find(|e| e.item_felts == queried) else {
                continue;
            };
            matches[range.clone()].fill(0);
            for (p, plane) in planes.iter_mut().enumerate() {
                let felts = hit.label_felts.get(p * fpi..(p + 1) * fpi).ok_or_else(|| {
                    Error::Backend(format!("bin entry carries too few label felts for plane {}", p))
                })?;
                plane[range.clone()].copy_from_slice(felts);
            }
        }

        Ok(BundleResult {
            matches: self.encrypt(&matches)?,
            label_planes: planes
                .iter()
                .map(|plane| self.encrypt(plane))
                .collect::<Result<_>>()?,
        })
    }
}
