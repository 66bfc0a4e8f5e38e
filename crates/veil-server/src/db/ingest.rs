//! CSV ingestion
//!
//! Each row is either `item` or `item,label`; the first row fixes the
//! shape for the whole source. Surrounding whitespace is trimmed.

use std::io::Read;
use std::path::Path;

use veil_core::label::MAX_LABEL_BYTE_COUNT;
use veil_core::{Error, Item, PsiParams, Result};

use super::{DbData, SenderDb};

fn ingest_error(e: csv::Error) -> Error {
    Error::IngestError(e.to_string())
}

/// Read all rows from a headerless CSV source
pub fn read_tabular<R: Read>(reader: R) -> Result<DbData> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut data: Option<DbData> = None;
    for (row, record) in csv_reader.byte_records().enumerate() {
        let record = record.map_err(ingest_error)?;
        let item = match record.get(0) {
            Some(field) if !field.is_empty() => Item::from(field),
            _ => {
                return Err(Error::IngestError(format!("row {}: empty item", row + 1)));
            }
        };

        let label = match record.len() {
            1 => None,
            2 => Some(record[1].to_vec()),
            n => {
                return Err(Error::IngestError(format!(
                    "row {}: expected 1 or 2 columns, got {}",
                    row + 1,
                    n
                )));
            }
        };

        let rows = data.get_or_insert_with(|| match label {
            Some(_) => DbData::Labeled(Vec::new()),
            None => DbData::Unlabeled(Vec::new()),
        });
        match (rows, label) {
            (DbData::Unlabeled(items), None) => items.push(item),
            (DbData::Labeled(items), Some(label)) => items.push((item, label)),
            _ => {
                return Err(Error::IngestError(format!(
                    "row {}: mixes labeled and unlabeled rows",
                    row + 1
                )));
            }
        }
    }

    data.ok_or_else(|| Error::IngestError("source contains no rows".into()))
}

impl SenderDb {
    /// Build a database from CSV rows
    ///
    /// Labeled sources get a label width equal to their longest label.
    /// Unlabeled sources always use a zero nonce.
    pub fn load_from_tabular<R: Read>(
        reader: R,
        params: PsiParams,
        nonce_byte_count: usize,
        compressed: bool,
        pool: &rayon::ThreadPool,
    ) -> Result<Self> {
        let data = read_tabular(reader)?;

        let mut db = match &data {
            DbData::Unlabeled(_) => SenderDb::new(params, 0, 0, compressed)?,
            DbData::Labeled(rows) => {
                let label_byte_count = rows.iter().map(|(_, l)| l.len()).max().unwrap_or(0);
                if label_byte_count == 0 {
                    return Err(Error::IngestError(
                        "labeled source has only empty labels".into(),
                    ));
                }
                if label_byte_count > MAX_LABEL_BYTE_COUNT {
                    return Err(Error::IngestError(format!(
                        "longest label is {} bytes, at most {} are supported",
                        label_byte_count, MAX_LABEL_BYTE_COUNT
                    )));
                }
                SenderDb::new(params, label_byte_count, nonce_byte_count, compressed)?
            }
        };
        db.set_data(&data, pool)?;

        if db.is_labeled() {
            tracing::info!(
                items = db.item_count(),
                label_byte_count = db.label_byte_count(),
                nonce_byte_count = db.nonce_byte_count(),
                "created labeled SenderDB"
            );
        } else {
            tracing::info!(items = db.item_count(), "created unlabeled SenderDB");
        }
        if compressed {
            tracing::info!("using in-memory compression");
        }
        tracing::info!(packing_rate = db.packing_rate(), "SenderDB packing rate");

        Ok(db)
    }

    pub fn load_from_csv_path(
        path: impl AsRef<Path>,
        params: PsiParams,
        nonce_byte_count: usize,
        compressed: bool,
        pool: &rayon::ThreadPool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| Error::IngestError(format!("{}: {}", path.display(), e)))?;
        Self::load_from_tabular(file, params, nonce_byte_count, compressed, pool)
    }
}
