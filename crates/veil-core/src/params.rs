//! PSI parameter document and versioning
//!
//! The parameters document is shared verbatim between client and server.
//! When the table geometry or the encryption parameters change, the
//! [`PsiParams::fingerprint`] changes with them and queries built for the
//! old document are rejected with `ParameterMismatch`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::Result;

/// Parameter document version
///
/// History:
/// - v1: Initial version
pub const PSI_PARAMS_VERSION: u16 = 1;

/// Maximum number of hash functions used to place an item in the table
pub const MAX_HASH_FUNC_COUNT: u32 = 8;

/// Accepted range for the effective item bit count
pub const MIN_ITEM_BIT_COUNT: u32 = 80;
pub const MAX_ITEM_BIT_COUNT: u32 = 128;

/// Cuckoo table geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableParams {
    /// Number of hash functions, i.e. candidate bins per item
    pub hash_func_count: u32,
    /// Number of bins in the table
    pub table_size: u32,
    /// Sender-side bin capacity before a new bin bundle is opened
    pub max_items_per_bin: u32,
}

/// Item encoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemParams {
    /// Number of field elements each item is split into
    pub felts_per_item: u32,
}

/// Query power configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub ps_low_degree: u32,
    pub query_powers: Vec<u32>,
}

/// Homomorphic encryption parameters
///
/// Either `plain_modulus` or `plain_modulus_bits` must be given; loading
/// resolves the latter into a concrete modulus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_modulus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_modulus_bits: Option<u32>,
    pub poly_modulus_degree: u32,
    pub coeff_modulus_bits: Vec<u32>,
}

/// Full parameter document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsiParams {
    #[serde(default = "default_version")]
    pub version: u16,
    pub table_params: TableParams,
    pub item_params: ItemParams,
    pub query_params: QueryParams,
    #[serde(rename = "seal_params")]
    pub encryption_params: EncryptionParams,
}

fn default_version() -> u16 {
    PSI_PARAMS_VERSION
}

impl PsiParams {
    /// Parse and validate a JSON parameter document
    pub fn load(json: &str) -> Result<Self> {
        let mut params: PsiParams = serde_json::from_str(json)
            .map_err(|e| Error::InvalidParams(format!("failed to parse parameters: {}", e)))?;
        params.resolve_plain_modulus()?;
        params.validate()?;
        Ok(params)
    }

    /// Load a JSON parameter document from disk
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::load(&json)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn resolve_plain_modulus(&mut self) -> Result<()> {
        let enc = &mut self.encryption_params;
        if enc.plain_modulus.is_some() {
            return Ok(());
        }
        let bits = enc.plain_modulus_bits.ok_or_else(|| {
            Error::InvalidParams("one of plain_modulus or plain_modulus_bits is required".into())
        })?;
        let modulus = batching_prime(bits, enc.poly_modulus_degree).ok_or_else(|| {
            Error::InvalidParams(format!(
                "no {}-bit prime supports batching for degree {}",
                bits, enc.poly_modulus_degree
            ))
        })?;
        enc.plain_modulus = Some(modulus);
        Ok(())
    }

    /// Check the document is internally consistent and of the current version
    pub fn validate(&self) -> Result<()> {
        if self.version != PSI_PARAMS_VERSION {
            return Err(Error::InvalidParams(format!(
                "parameter version mismatch: expected v{}, got v{}",
                PSI_PARAMS_VERSION, self.version
            )));
        }

        let table = &self.table_params;
        if table.hash_func_count == 0 || table.hash_func_count > MAX_HASH_FUNC_COUNT {
            return Err(Error::InvalidParams(format!(
                "hash_func_count must be in 1..={}, got {}",
                MAX_HASH_FUNC_COUNT, table.hash_func_count
            )));
        }
        if table.max_items_per_bin == 0 {
            return Err(Error::InvalidParams("max_items_per_bin must be positive".into()));
        }

        let enc = &self.encryption_params;
        let modulus = enc
            .plain_modulus
            .ok_or_else(|| Error::InvalidParams("plain modulus is unresolved".into()))?;
        if !is_prime(modulus) {
            return Err(Error::InvalidParams(format!("plain modulus {} is not prime", modulus)));
        }
        if enc.poly_modulus_degree == 0 || !enc.poly_modulus_degree.is_power_of_two() {
            return Err(Error::InvalidParams(format!(
                "poly_modulus_degree must be a power of two, got {}",
                enc.poly_modulus_degree
            )));
        }

        let felts = self.item_params.felts_per_item;
        if felts == 0 || felts > enc.poly_modulus_degree {
            return Err(Error::InvalidParams(format!(
                "felts_per_item must be in 1..={}, got {}",
                enc.poly_modulus_degree, felts
            )));
        }
        let item_bits = self.item_bit_count();
        if !(MIN_ITEM_BIT_COUNT..=MAX_ITEM_BIT_COUNT).contains(&item_bits) {
            return Err(Error::InvalidParams(format!(
                "item bit count {} is outside {}..={}",
                item_bits, MIN_ITEM_BIT_COUNT, MAX_ITEM_BIT_COUNT
            )));
        }

        let per_bundle = self.items_per_bundle();
        if table.table_size == 0 || table.table_size % per_bundle != 0 {
            return Err(Error::InvalidParams(format!(
                "table_size {} must be a positive multiple of {} items per bundle",
                table.table_size, per_bundle
            )));
        }

        if !self.query_params.query_powers.contains(&1) {
            return Err(Error::InvalidParams("query_powers must contain 1".into()));
        }

        Ok(())
    }

    /// Resolved plain modulus
    pub fn plain_modulus(&self) -> u64 {
        self.encryption_params.plain_modulus.unwrap_or(0)
    }

    /// Usable bits per field element (`floor(log2 plain_modulus)`)
    pub fn bits_per_felt(&self) -> u32 {
        let modulus = self.plain_modulus();
        if modulus < 2 {
            return 0;
        }
        63 - modulus.leading_zeros()
    }

    /// Number of item bits that survive encoding into field elements
    pub fn item_bit_count(&self) -> u32 {
        self.item_params.felts_per_item * self.bits_per_felt()
    }

    /// Number of table bins packed into one ciphertext
    pub fn items_per_bundle(&self) -> u32 {
        self.encryption_params.poly_modulus_degree / self.item_params.felts_per_item.max(1)
    }

    /// Number of ciphertexts a query consists of
    pub fn bundle_idx_count(&self) -> u32 {
        self.table_params.table_size / self.items_per_bundle().max(1)
    }

    /// Stable 64-bit fingerprint of the whole document
    pub fn fingerprint(&self) -> u64 {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::new()
            .chain_update(b"veil-params")
            .chain_update(&canonical)
            .finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }
}

/// Small parameter set for tests and examples
pub fn test_params() -> PsiParams {
    PsiParams {
        version: PSI_PARAMS_VERSION,
        table_params: TableParams {
            hash_func_count: 3,
            table_size: 512,
            max_items_per_bin: 92,
        },
        item_params: ItemParams { felts_per_item: 8 },
        query_params: QueryParams {
            ps_low_degree: 0,
            query_powers: vec![1, 3, 4, 5, 8, 14, 20, 26, 32, 38, 41, 42, 43, 45, 46],
        },
        encryption_params: EncryptionParams {
            plain_modulus: Some(40961),
            plain_modulus_bits: None,
            poly_modulus_degree: 4096,
            coeff_modulus_bits: vec![40, 32, 32],
        },
    }
}

/// Largest prime below `2^bits` that is congruent to 1 mod `2 * degree`
fn batching_prime(bits: u32, degree: u32) -> Option<u64> {
    if !(2..=60).contains(&bits) || degree == 0 {
        return None;
    }
    let step = 2 * degree as u64;
    let mut k = ((1u64 << bits) - 2) / step;
    while k > 0 {
        let candidate = k * step + 1;
        if is_prime(candidate) {
            return Some(candidate);
        }
        k -= 1;
    }
    None
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut acc = 1u64;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    acc
}

/// Deterministic Miller-Rabin for 64-bit integers
pub(crate) fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    for p in WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }
    let mut d = n - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }
    'witness: for a in WITNESSES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS_JSON: &str = r#"{
        "table_params": {"hash_func_count": 3, "table_size": 512, "max_items_per_bin": 92},
        "item_params": {"felts_per_item": 8},
        "query_params": {"ps_low_degree": 0, "query_powers": [1, 3, 4, 5, 8, 14, 20, 26, 32, 38, 41, 42, 43, 45, 46]},
        "seal_params": {"plain_modulus": 40961, "poly_modulus_degree": 4096, "coeff_modulus_bits": [40, 32, 32]}
    }"#;

    #[test]
    fn test_load_params_json() {
        let params = PsiParams::load(PARAMS_JSON).unwrap();
        assert_eq!(params.version, PSI_PARAMS_VERSION);
        assert_eq!(params, test_params());
        assert_eq!(params.bits_per_felt(), 15);
        assert_eq!(params.item_bit_count(), 120);
        assert_eq!(params.items_per_bundle(), 512);
        assert_eq!(params.bundle_idx_count(), 1);
    }

    #[test]
    fn test_plain_modulus_bits_resolved() {
        let json = r#"{
            "table_params": {"hash_func_count": 3, "table_size": 1638, "max_items_per_bin": 1304},
            "item_params": {"felts_per_item": 5},
            "query_params": {"ps_low_degree": 44, "query_powers": [1, 3, 11, 18, 45, 225]},
            "seal_params": {"plain_modulus_bits": 22, "poly_modulus_degree": 8192, "coeff_modulus_bits": [56, 56, 56, 50]}
        }"#;
        let params = PsiParams::load(json).unwrap();
        let modulus = params.plain_modulus();
        assert!(modulus < 1 << 22);
        assert_eq!(modulus % (2 * 8192), 1);
        assert!(is_prime(modulus));
        assert_eq!(params.bits_per_felt(), 21);
    }

    #[test]
    fn test_version_mismatch() {
        let old = PsiParams {
            version: 0,
            ..test_params()
        };
        assert!(matches!(old.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_table_size_must_fill_bundles() {
        let mut params = test_params();
        params.table_params.table_size = 500;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_item_bit_count_range() {
        let mut params = test_params();
        params.item_params.felts_per_item = 4;
        params.table_params.table_size = 1024;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_geometry() {
        let base = test_params();
        assert_eq!(base.fingerprint(), test_params().fingerprint());

        let mut other = test_params();
        other.table_params.max_items_per_bin = 64;
        assert_ne!(base.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_is_prime() {
        assert!(is_prime(40961));
        assert!(is_prime(65537));
        assert!(!is_prime(40963 * 3));
        assert!(!is_prime(1));
    }
}
