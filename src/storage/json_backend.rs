use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    core::utils::{ensure_dir, write_atomic, PathResolver},
    errors::LedgerError,
    ledger::{approval::ApprovalSubject, LedgerSnapshot},
};

use super::{Result, StorageBackend};

/// Stores each ledger as a pretty-printed JSON document under `<root>/ledgers`.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    root: PathBuf,
    ledgers_dir: PathBuf,
}

impl JsonStorage {
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        let app_root = PathResolver::resolve_base(root);
        ensure_dir(&app_root)?;
        let ledgers_dir = PathResolver::ledger_dir_in(&app_root);
        ensure_dir(&ledgers_dir)?;
        Ok(Self {
            root: app_root,
            ledgers_dir,
        })
    }

    pub fn new_default() -> Result<Self> {
        Self::new(None)
    }

    pub fn base_dir(&self) -> &Path {
        &self.root
    }
}

impl StorageBackend for JsonStorage {
    fn save_snapshot(&self, name: &str, snapshot: &LedgerSnapshot) -> Result<()> {
        let path = self.snapshot_path(name);
        save_snapshot_to_path(snapshot, &path)?;
        debug!(path = %path.display(), entries = snapshot.journal_entries.len(), "ledger snapshot saved");
        Ok(())
    }

    fn load_snapshot(&self, name: &str) -> Result<Option<LedgerSnapshot>> {
        let path = self.snapshot_path(name);
        if !path.exists() {
            return Ok(None);
        }
        load_snapshot_from_path(&path).map(Some)
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.ledgers_dir
            .join(format!("{}.json", canonical_name(name)))
    }
}

pub fn save_snapshot_to_path(snapshot: &LedgerSnapshot, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    write_atomic(path, &json)
}

pub fn load_snapshot_from_path(path: &Path) -> Result<LedgerSnapshot> {
    let data = fs::read_to_string(path)?;
    let snapshot: LedgerSnapshot = serde_json::from_str(&data)
        .map_err(|err| LedgerError::Storage(format!("{}: {}", path.display(), err)))?;
    Ok(snapshot)
}

fn canonical_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            _ => '_',
        })
        .collect();
    if sanitized.trim_matches('_').is_empty() {
        "ledger".into()
    } else {
        sanitized
    }
}

/// Detects dangling references within a snapshot.
pub fn ledger_warnings(snapshot: &LedgerSnapshot) -> Vec<String> {
    let account_ids: HashSet<_> = snapshot.accounts.iter().map(|a| a.id).collect();
    let entry_ids: HashSet<_> = snapshot.journal_entries.iter().map(|e| e.id).collect();
    let definition_ids: HashSet<_> = snapshot
        .recurring_definitions
        .iter()
        .map(|d| d.id)
        .collect();
    let mut warnings = Vec::new();

    for account in &snapshot.accounts {
        if let Some(parent) = account.parent_id {
            if !account_ids.contains(&parent) {
                warnings.push(format!(
                    "account {} references unknown parent {}",
                    account.code, parent
                ));
            }
        }
    }
    for row in &snapshot.ledger_entries {
        if !account_ids.contains(&row.account_id) {
            warnings.push(format!(
                "ledger row {} references unknown account {}",
                row.id, row.account_id
            ));
        }
        if !entry_ids.contains(&row.journal_entry_id) {
            warnings.push(format!(
                "ledger row {} references missing journal entry {}",
                row.id, row.journal_entry_id
            ));
        }
    }
    for definition in &snapshot.recurring_definitions {
        for line in &definition.lines {
            if !account_ids.contains(&line.account_id) {
                warnings.push(format!(
                    "recurring definition `{}` references unknown account {}",
                    definition.name, line.account_id
                ));
            }
        }
    }
    for record in &snapshot.execution_records {
        if !definition_ids.contains(&record.definition_id) {
            warnings.push(format!(
                "execution record {} references missing definition {}",
                record.id, record.definition_id
            ));
        }
    }
    for request in &snapshot.approval_requests {
        let dangling = match &request.subject {
            ApprovalSubject::JournalEntry { entry_id } => !entry_ids.contains(entry_id),
            ApprovalSubject::RecurringOccurrence { definition_id, .. } => {
                !definition_ids.contains(definition_id)
            }
        };
        if dangling {
            warnings.push(format!(
                "approval request {} references a missing subject",
                request.id
            ));
        }
    }
    warnings
}
