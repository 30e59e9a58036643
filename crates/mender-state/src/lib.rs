//! mender-state: storage substrate for the mender fix orchestrator
//!
//! Two primitives back the engine's durable state:
//!
//! - `CasStore`: content-addressed blobs, used for pre-fix file backups
//! - `Journal`: append-only entry log, used to mirror the audit trail
//!
//! Each trait ships with an in-memory fake (`fakes`) and a filesystem
//! backend (`fs`).

mod error;
pub mod fakes;
pub mod fs;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::{MemoryCasStore, MemoryJournal};
pub use fs::{FsCasStore, JsonlJournal};
pub use storage_traits::{CasStore, ContentDigest, Journal, JournalEntry, StorageResult};
