//! SenderDB file format
//!
//! ```text
//! 0..4    magic "VSDB"
//! 4..6    format version (u16)
//! 6..8    flags (u16): bit 0 compressed, bit 1 labeled
//! 8..12   label_byte_count (u32)
//! 12..16  nonce_byte_count (u32)
//! 16..24  item_count (u64)
//! 24..32  body_len (u64)
//! 32..40  params fingerprint (u64)
//! 40..    bincode body: params JSON, OPRF key, entries
//! ```
//!
//! All integers are little-endian. The bin layout is not stored; it is
//! rebuilt from the entries on load.

use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use veil_core::{Error, HashedItem, OprfKey, PsiParams, Result};

use super::SenderDb;

/// Magic bytes identifying a SenderDB file
pub const DB_MAGIC: [u8; 4] = *b"VSDB";

/// Header size in bytes
pub const DB_HEADER_SIZE: usize = 40;

const FLAG_COMPRESSED: u16 = 1;
const FLAG_LABELED: u16 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbHeader {
    pub version: u16,
    pub compressed: bool,
    pub labeled: bool,
    pub label_byte_count: u32,
    pub nonce_byte_count: u32,
    pub item_count: u64,
    pub body_len: u64,
    pub params_fingerprint: u64,
}

impl DbHeader {
    /// Current format version
    pub const VERSION: u16 = 1;

    pub fn to_bytes(&self) -> [u8; DB_HEADER_SIZE] {
        let mut flags = 0u16;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.labeled {
            flags |= FLAG_LABELED;
        }

        let mut buf = [0u8; DB_HEADER_SIZE];
        buf[0..4].copy_from_slice(&DB_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.label_byte_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.nonce_byte_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.item_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.body_len.to_le_bytes());
        buf[32..40].copy_from_slice(&self.params_fingerprint.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DB_HEADER_SIZE {
            return Err(Error::PersistenceError(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != DB_MAGIC {
            return Err(Error::PersistenceError("not a SenderDB file (bad magic)".into()));
        }

        let u16_at = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(b)
        };

        let version = u16_at(4);
        if version != Self::VERSION {
            return Err(Error::PersistenceError(format!(
                "unsupported SenderDB format version {} (expected {})",
                version,
                Self::VERSION
            )));
        }
        let flags = u16_at(6);

        Ok(Self {
            version,
            compressed: flags & FLAG_COMPRESSED != 0,
            labeled: flags & FLAG_LABELED != 0,
            label_byte_count: u32_at(8),
            nonce_byte_count: u32_at(12),
            item_count: u64_at(16),
            body_len: u64_at(24),
            params_fingerprint: u64_at(32),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct DbBody {
    params_json: String,
    oprf_key: [u8; 32],
    entries: Vec<(HashedItem, Option<Vec<u8>>)>,
}

fn persistence<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::PersistenceError(format!("{}: {}", context, e))
}

impl SenderDb {
    /// Write the database to `writer`
    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        let body = DbBody {
            params_json: self.params().to_json().map_err(persistence("failed to encode params"))?,
            oprf_key: self.oprf_key().to_bytes(),
            entries: self
                .entries()
                .iter()
                .map(|(item, blob)| (*item, blob.clone()))
                .collect(),
        };
        let body = bincode::serialize(&body).map_err(persistence("failed to encode body"))?;

        let header = DbHeader {
            version: DbHeader::VERSION,
            compressed: self.is_compressed(),
            labeled: self.is_labeled(),
            label_byte_count: self.label_byte_count() as u32,
            nonce_byte_count: self.nonce_byte_count() as u32,
            item_count: self.item_count() as u64,
            body_len: body.len() as u64,
            params_fingerprint: self.params().fingerprint(),
        };

        writer
            .write_all(&header.to_bytes())
            .and_then(|_| writer.write_all(&body))
            .and_then(|_| writer.flush())
            .map_err(persistence("failed to write database"))?;

        tracing::debug!(
            items = header.item_count,
            bytes = DB_HEADER_SIZE as u64 + header.body_len,
            "SenderDB saved"
        );
        Ok(())
    }

    /// Read a database previously written by [`SenderDb::save`]
    pub fn load<R: Read>(mut reader: R) -> Result<Self> {
        let mut head = [0u8; DB_HEADER_SIZE];
        reader
            .read_exact(&mut head)
            .map_err(persistence("failed to read header"))?;
        let header = DbHeader::from_bytes(&head)?;

        let mut body = Vec::new();
        reader
            .take(header.body_len)
            .read_to_end(&mut body)
            .map_err(persistence("failed to read body"))?;
        if body.len() as u64 != header.body_len {
            return Err(Error::PersistenceError(format!(
                "truncated body: header declares {} bytes, read {}",
                header.body_len,
                body.len()
            )));
        }
        let body: DbBody = bincode::deserialize(&body).map_err(persistence("failed to decode body"))?;

        let params = PsiParams::load(&body.params_json).map_err(persistence("invalid stored params"))?;
        if params.fingerprint() != header.params_fingerprint {
            return Err(Error::PersistenceError(
                "stored params do not match header fingerprint".into(),
            ));
        }
        if header.labeled != (header.label_byte_count > 0) {
            return Err(Error::PersistenceError(
                "labeled flag disagrees with label_byte_count".into(),
            ));
        }
        if body.entries.len() as u64 != header.item_count {
            return Err(Error::PersistenceError(format!(
                "header declares {} items, body holds {}",
                header.item_count,
                body.entries.len()
            )));
        }

        let key = OprfKey::from_bytes(body.oprf_key)?;
        let mut db = SenderDb::with_key(
            params,
            key,
            header.label_byte_count as usize,
            header.nonce_byte_count as usize,
            header.compressed,
        )
        .map_err(persistence("invalid stored metadata"))?;

        let blob_len = veil_core::label::label_blob_len(db.label_byte_count(), db.nonce_byte_count());
        for (item, blob) in body.entries {
            match (&blob, db.is_labeled()) {
                (Some(b), true) if b.len() == blob_len => {}
                (None, false) => {}
                _ => {
                    return Err(Error::PersistenceError(format!(
                        "entry {} does not match the database schema",
                        item
                    )))
                }
            }
            db.store(item, blob);
        }

        tracing::info!(
            items = db.item_count(),
            label_byte_count = db.label_byte_count(),
            nonce_byte_count = db.nonce_byte_count(),
            "SenderDB loaded"
        );
        Ok(db)
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .map_err(|e| Error::PersistenceError(format!("{}: {}", path.display(), e)))?;
        self.save(std::io::BufWriter::new(file))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| Error::PersistenceError(format!("{}: {}", path.display(), e)))?;
        Self::load(std::io::BufReader::new(file))
    }
}
