//! Oblivious PRF over Ristretto255
//!
//! The client blinds `H(item)` with a random scalar `r`, the server
//! multiplies by its key `k`, and the client removes `r` to obtain
//! `k * H(item)` without the server seeing the item. The unblinded point is
//! hashed into a [`HashedItem`] (database key) and a [`LabelKey`].

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};

use crate::error::Error;
use crate::item::{HashedItem, Item, LabelKey, ITEM_BYTE_COUNT, LABEL_KEY_BYTE_COUNT};
use crate::Result;

/// Size of a compressed Ristretto point on the wire
pub const OPRF_POINT_BYTE_COUNT: usize = 32;

/// Size of a serialized OPRF key
pub const OPRF_KEY_BYTE_COUNT: usize = 32;

/// Compressed point as carried in OPRF messages
pub type OprfPoint = [u8; OPRF_POINT_BYTE_COUNT];

const HASH_TO_POINT_DOMAIN: &[u8] = b"veil-oprf-h2c";
const OUTPUT_DOMAIN: &[u8] = b"veil-oprf-out";

fn hash_to_point(item: &Item) -> RistrettoPoint {
    let hasher = Sha512::new()
        .chain_update(HASH_TO_POINT_DOMAIN)
        .chain_update(item.as_bytes());
    RistrettoPoint::from_hash(hasher)
}

fn decode_point(bytes: &OprfPoint) -> Result<RistrettoPoint> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or_else(|| Error::MalformedMessage("OPRF point is not a valid Ristretto encoding".into()))
}

fn derive_outputs(point: &RistrettoPoint) -> (HashedItem, LabelKey) {
    let digest = Sha512::new()
        .chain_update(OUTPUT_DOMAIN)
        .chain_update(point.compress().as_bytes())
        .finalize();

    let mut item = [0u8; ITEM_BYTE_COUNT];
    item.copy_from_slice(&digest[..ITEM_BYTE_COUNT]);
    let mut key = [0u8; LABEL_KEY_BYTE_COUNT];
    key.copy_from_slice(&digest[64 - LABEL_KEY_BYTE_COUNT..]);

    (HashedItem::new(item), LabelKey::new(key))
}

/// Server-held PRF key
#[derive(Clone, PartialEq, Eq)]
pub struct OprfKey(Scalar);

impl OprfKey {
    /// Sample a fresh key
    pub fn random() -> Self {
        Self(Scalar::random(&mut OsRng))
    }

    pub fn from_bytes(bytes: [u8; OPRF_KEY_BYTE_COUNT]) -> Result<Self> {
        Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes))
            .map(Self)
            .ok_or_else(|| Error::PersistenceError("OPRF key is not a canonical scalar".into()))
    }

    pub fn to_bytes(&self) -> [u8; OPRF_KEY_BYTE_COUNT] {
        self.0.to_bytes()
    }

    /// Evaluate the PRF on blinded points
    pub fn evaluate(&self, blinded: &[OprfPoint]) -> Result<Vec<OprfPoint>> {
        blinded
            .iter()
            .map(|bytes| {
                let point = decode_point(bytes)?;
                Ok((self.0 * point).compress().to_bytes())
            })
            .collect()
    }

    /// Compute hashed item and label key directly, without blinding
    pub fn compute_hash(&self, item: &Item) -> (HashedItem, LabelKey) {
        derive_outputs(&(self.0 * hash_to_point(item)))
    }
}

impl std::fmt::Debug for OprfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OprfKey(..)")
    }
}

/// Client-side blinding state
///
/// Holds the inverse blinding factor for each item, in input order. Consumed
/// by [`OprfReceiver::unblind`].
pub struct OprfReceiver {
    inverse_factors: Vec<Scalar>,
}

impl OprfReceiver {
    /// Blind `items`, returning the state and the points to send
    pub fn blind(items: &[Item]) -> (Self, Vec<OprfPoint>) {
        let (inverse_factors, blinded): (Vec<Scalar>, Vec<OprfPoint>) = items
            .iter()
            .map(|item| {
                let factor = Scalar::random(&mut OsRng);
                let blinded = (factor * hash_to_point(item)).compress().to_bytes();
                (factor.invert(), blinded)
            })
            .unzip();

        (Self { inverse_factors }, blinded)
    }

    pub fn item_count(&self) -> usize {
        self.inverse_factors.len()
    }

    /// Remove the blinding from the server's evaluations
    pub fn unblind(self, evaluated: &[OprfPoint]) -> Result<(Vec<HashedItem>, Vec<LabelKey>)> {
        if evaluated.len() != self.inverse_factors.len() {
            return Err(Error::MalformedMessage(format!(
                "OPRF response carries {} points for {} blinded items",
                evaluated.len(),
                self.inverse_factors.len()
            )));
        }

        let mut hashed = Vec::with_capacity(evaluated.len());
        let mut keys = Vec::with_capacity(evaluated.len());
        for (bytes, inverse) in evaluated.iter().zip(&self.inverse_factors) {
            let point = decode_point(bytes)?;
            let (item, key) = derive_outputs(&(inverse * point));
            hashed.push(item);
            keys.push(key);
        }
        Ok((hashed, keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blind_evaluate_unblind_matches_direct_hash() {
        let key = OprfKey::random();
        let items: Vec<Item> = ["item", "meti", "time"].iter().map(|s| Item::from(*s)).collect();

        let (receiver, blinded) = OprfReceiver::blind(&items);
        let evaluated = key.evaluate(&blinded).unwrap();
        let (hashed, label_keys) = receiver.unblind(&evaluated).unwrap();

        for (i, item) in items.iter().enumerate() {
            let (direct, direct_key) = key.compute_hash(item);
            assert_eq!(hashed[i], direct);
            assert_eq!(label_keys[i], direct_key);
        }
    }

    #[test]
    fn test_different_keys_give_different_outputs() {
        let item = Item::from("item");
        let (a, _) = OprfKey::random().compute_hash(&item);
        let (b, _) = OprfKey::random().compute_hash(&item);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unblind_rejects_count_mismatch() {
        let key = OprfKey::random();
        let (receiver, blinded) = OprfReceiver::blind(&[Item::from("a"), Item::from("b")]);
        let evaluated = key.evaluate(&blinded[..1]).unwrap();
        assert!(matches!(
            receiver.unblind(&evaluated),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_evaluate_rejects_invalid_point() {
        let key = OprfKey::random();
        assert!(key.evaluate(&[[0xff; OPRF_POINT_BYTE_COUNT]]).is_err());
    }

    #[test]
    fn test_key_bytes_roundtrip() {
        let key = OprfKey::random();
        let restored = OprfKey::from_bytes(key.to_bytes()).unwrap();
        assert_eq!(key, restored);
    }
}
