//! veil-core: Shared types and protocol plumbing for labeled PSI
//!
//! A client holding a few items learns which of them are in a server's
//! large set, and the label stored with each match, in four phases:
//!
//! 1. **Params** - the server sends its parameter document verbatim
//! 2. **OPRF** - the client blinds its items, the server evaluates its PRF,
//!    the client unblinds to get a hashed item and a label key per item
//! 3. **Query** - hashed items are placed in a cuckoo table, packed into
//!    slots and encrypted, one ciphertext per bundle index
//! 4. **Result** - the server answers per bin bundle; the client decrypts
//!    each part and maps matches back to input order through the
//!    [`IndexTranslationTable`]
//!
//! ## What the Server Learns
//!
//! | Information | Server Knowledge |
//! |-------------|------------------|
//! | Client items | NO - blinded during OPRF |
//! | Which items matched | NO - results are encrypted |
//! | Query size in bundles | YES - fixed by parameters |
//! | Timing, client identity | YES - via network metadata |
//!
//! The confidentiality of phases 3 and 4 rests on the [`HeBackend`]. The
//! bundled [`TransparentBackend`] keeps slots in the clear.

pub mod channel;
mod error;
pub mod he;
mod item;
mod itt;
pub mod label;
pub mod layout;
pub mod logging;
pub mod oprf;
pub mod params;
mod pool;
pub mod wire;

pub use channel::{BufferChannel, Channel, NetworkChannel, StreamChannel};
pub use error::{Error, OperationKind};
pub use he::{BinEntry, BundleResult, Ciphertext, CryptoContext, HeBackend, TransparentBackend};
pub use item::{
    found_items, found_labels, HashedItem, Item, Label, LabelKey, MatchRecord, ITEM_BYTE_COUNT,
    LABEL_KEY_BYTE_COUNT,
};
pub use itt::IndexTranslationTable;
pub use layout::SlotLayout;
pub use logging::{LogConfig, LogLevel};
pub use oprf::{OprfKey, OprfReceiver};
pub use params::{PsiParams, PSI_PARAMS_VERSION};
pub use pool::ThreadPoolConfig;
pub use wire::{Message, MessageKind, Request, Response};

pub type Result<T> = std::result::Result<T, Error>;
