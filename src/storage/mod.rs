pub mod json_backend;

use std::path::PathBuf;

use crate::{errors::LedgerError, ledger::LedgerSnapshot};

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Durable home for ledger snapshots. Injected into the manager, never global.
pub trait StorageBackend: Send + Sync {
    fn save_snapshot(&self, name: &str, snapshot: &LedgerSnapshot) -> Result<()>;
    /// Returns `None` when no ledger with this name has been saved yet.
    fn load_snapshot(&self, name: &str) -> Result<Option<LedgerSnapshot>>;
    fn snapshot_path(&self, name: &str) -> PathBuf;
}

pub use json_backend::{ledger_warnings, JsonStorage};
