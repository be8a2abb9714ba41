use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    account::{Account, AccountNature},
    approval::{ApprovalRequest, ApprovalSubject},
    journal::{JournalEntry, LedgerEntry},
    recurring::{RecurringEntryDefinition, RecurringExecutionRecord},
};
use crate::errors::{ConcurrencyError, LedgerError};

pub const CURRENT_SCHEMA_VERSION: u8 = 1;

/// An account together with the ledger rows posted to it, in posting order.
#[derive(Debug, Clone)]
pub struct AccountBook {
    pub account: Account,
    pub rows: Vec<LedgerEntry>,
    pub children: usize,
    pub integrity_hold: bool,
}

impl AccountBook {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            rows: Vec::new(),
            children: 0,
            integrity_hold: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children == 0
    }

    /// Recomputes the balance from scratch, checking every row's running balance.
    pub fn replay(&self) -> Result<Decimal, LedgerError> {
        let mut balance = Decimal::ZERO;
        for row in &self.rows {
            balance += self.account.nature.balance_delta(row.debit, row.credit);
            if balance != row.balance_after {
                return Err(LedgerError::IntegrityViolation {
                    account_id: self.account.id,
                    recorded: row.balance_after,
                    expected: balance,
                });
            }
        }
        Ok(balance)
    }

    /// Pre-posting check: every row must reconcile and the balance must match the replay.
    pub fn check_integrity(&self) -> Result<(), LedgerError> {
        if self.integrity_hold {
            return Err(LedgerError::IntegrityHold(self.account.id));
        }
        let expected = self.replay()?;
        if self.account.current_balance != expected {
            return Err(LedgerError::IntegrityViolation {
                account_id: self.account.id,
                recorded: self.account.current_balance,
                expected,
            });
        }
        Ok(())
    }
}

pub type SharedAccount = Arc<Mutex<AccountBook>>;

/// Read-only facts the journal validator needs about an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountView {
    pub id: Uuid,
    pub nature: AccountNature,
    pub active: bool,
    pub is_leaf: bool,
}

impl From<&AccountBook> for AccountView {
    fn from(book: &AccountBook) -> Self {
        Self {
            id: book.account.id,
            nature: book.account.nature,
            active: book.account.active,
            is_leaf: book.is_leaf(),
        }
    }
}

/// Anything that can answer account lookups for validation.
pub trait AccountDirectory {
    fn lookup(&self, id: Uuid) -> Option<AccountView>;
}

/// Account locks held for the duration of a posting, sorted by account id.
pub struct LockedAccounts<'a> {
    guards: Vec<(Uuid, MutexGuard<'a, AccountBook>)>,
}

impl<'a> LockedAccounts<'a> {
    /// Locks every handle in ascending id order so concurrent postings cannot deadlock.
    pub fn acquire(handles: &'a [(Uuid, SharedAccount)], timeout: Duration) -> Result<Self, LedgerError> {
        let mut ordered: Vec<&'a (Uuid, SharedAccount)> = handles.iter().collect();
        ordered.sort_by_key(|(id, _)| *id);
        ordered.dedup_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(ordered.len());
        for (id, handle) in ordered {
            let guard = handle
                .try_lock_for(timeout)
                .ok_or(ConcurrencyError::LockTimeout(*id))?;
            guards.push((*id, guard));
        }
        Ok(Self { guards })
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.guards.binary_search_by_key(&id, |(key, _)| *key).ok()
    }

    pub fn get(&self, id: Uuid) -> Option<&AccountBook> {
        self.position(id).map(|idx| &*self.guards[idx].1)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut AccountBook> {
        let idx = self.position(id)?;
        Some(&mut *self.guards[idx].1)
    }

    pub fn books_mut(&mut self) -> Vec<&mut AccountBook> {
        self.guards.iter_mut().map(|(_, guard)| &mut **guard).collect()
    }
}

impl AccountDirectory for LockedAccounts<'_> {
    fn lookup(&self, id: Uuid) -> Option<AccountView> {
        self.get(id).map(AccountView::from)
    }
}

#[derive(Debug, Default)]
pub struct JournalStore {
    entries: Vec<JournalEntry>,
    index: HashMap<Uuid, usize>,
}

impl JournalStore {
    fn from_entries(entries: Vec<JournalEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.id, idx))
            .collect();
        Self { entries, index }
    }

    pub fn get(&self, id: Uuid) -> Option<&JournalEntry> {
        self.index.get(&id).map(|idx| &self.entries[*idx])
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut JournalEntry> {
        let idx = *self.index.get(&id)?;
        Some(&mut self.entries[idx])
    }

    /// Inserts a new entry or replaces the stored version with the same id.
    pub fn upsert(&mut self, entry: JournalEntry) {
        match self.index.get(&entry.id) {
            Some(idx) => self.entries[*idx] = entry,
            None => {
                self.index.insert(entry.id, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RecurringStore {
    pub definitions: BTreeMap<Uuid, RecurringEntryDefinition>,
    pub records: Vec<RecurringExecutionRecord>,
}

impl RecurringStore {
    pub fn record_mut(&mut self, id: Uuid) -> Option<&mut RecurringExecutionRecord> {
        self.records.iter_mut().find(|record| record.id == id)
    }
}

#[derive(Debug, Default)]
pub struct ApprovalStore {
    pub requests: Vec<ApprovalRequest>,
}

impl ApprovalStore {
    pub fn get(&self, id: Uuid) -> Option<&ApprovalRequest> {
        self.requests.iter().find(|request| request.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut ApprovalRequest> {
        self.requests.iter_mut().find(|request| request.id == id)
    }

    /// Most recent request gating the journal entry `entry_id`, if any.
    pub fn latest_for_entry(&self, entry_id: Uuid) -> Option<&ApprovalRequest> {
        self.requests.iter().rev().find(|request| {
            matches!(request.subject, ApprovalSubject::JournalEntry { entry_id: id } if id == entry_id)
        })
    }
}

/// Shared, concurrently accessible book of accounts.
///
/// Lock order, always: recurring store, approval store, accounts in ascending id,
/// journal store. The account map lock is never taken while an account lock is held.
#[derive(Debug)]
pub struct Ledger {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    accounts: RwLock<BTreeMap<Uuid, SharedAccount>>,
    journal: Mutex<JournalStore>,
    recurring: Mutex<RecurringStore>,
    approvals: Mutex<ApprovalStore>,
    next_entry_number: AtomicU64,
}

impl Ledger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            accounts: RwLock::new(BTreeMap::new()),
            journal: Mutex::new(JournalStore::default()),
            recurring: Mutex::new(RecurringStore::default()),
            approvals: Mutex::new(ApprovalStore::default()),
            next_entry_number: AtomicU64::new(1),
        }
    }

    /// Hands out the next journal entry number. Numbers are unique and increasing.
    pub fn allocate_entry_number(&self) -> u64 {
        self.next_entry_number.fetch_add(1, Ordering::SeqCst)
    }

    pub fn account_handle(&self, id: Uuid) -> Option<SharedAccount> {
        self.accounts.read().get(&id).cloned()
    }

    /// Handles for the given ids that exist; unknown ids are skipped.
    pub fn account_handles(&self, ids: &[Uuid]) -> Vec<(Uuid, SharedAccount)> {
        let map = self.accounts.read();
        ids.iter()
            .filter_map(|id| map.get(id).map(|handle| (*id, Arc::clone(handle))))
            .collect()
    }

    /// Every account handle, in ascending id order.
    pub fn all_account_handles(&self) -> Vec<(Uuid, SharedAccount)> {
        self.accounts
            .read()
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect()
    }

    pub fn accounts_map(&self) -> &RwLock<BTreeMap<Uuid, SharedAccount>> {
        &self.accounts
    }

    pub fn journal(&self) -> MutexGuard<'_, JournalStore> {
        self.journal.lock()
    }

    pub fn recurring(&self) -> MutexGuard<'_, RecurringStore> {
        self.recurring.lock()
    }

    pub fn approvals(&self) -> MutexGuard<'_, ApprovalStore> {
        self.approvals.lock()
    }

    /// Consistent copy of the whole ledger, taking every lock in the global order.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let recurring = self.recurring.lock();
        let approvals = self.approvals.lock();
        let handles = self.all_account_handles();
        let books: Vec<MutexGuard<'_, AccountBook>> =
            handles.iter().map(|(_, handle)| handle.lock()).collect();
        let journal = self.journal.lock();

        let mut accounts = Vec::with_capacity(books.len());
        let mut ledger_entries = Vec::new();
        let mut integrity_holds = Vec::new();
        for book in &books {
            accounts.push(book.account.clone());
            ledger_entries.extend(book.rows.iter().cloned());
            if book.integrity_hold {
                integrity_holds.push(book.account.id);
            }
        }

        LedgerSnapshot {
            id: self.id,
            name: self.name.clone(),
            schema_version: CURRENT_SCHEMA_VERSION,
            created_at: self.created_at,
            saved_at: Utc::now(),
            next_entry_number: self.next_entry_number.load(Ordering::SeqCst),
            accounts,
            ledger_entries,
            journal_entries: journal.iter().cloned().collect(),
            recurring_definitions: recurring.definitions.values().cloned().collect(),
            execution_records: recurring.records.clone(),
            approval_requests: approvals.requests.clone(),
            integrity_holds,
        }
    }

    /// Rebuilds live state from a persisted snapshot.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let LedgerSnapshot {
            id,
            name,
            created_at,
            next_entry_number,
            accounts,
            ledger_entries,
            journal_entries,
            recurring_definitions,
            execution_records,
            approval_requests,
            integrity_holds,
            ..
        } = snapshot;

        let mut books: BTreeMap<Uuid, AccountBook> = accounts
            .into_iter()
            .map(|account| (account.id, AccountBook::new(account)))
            .collect();
        let parents: Vec<Uuid> = books
            .values()
            .filter_map(|book| book.account.parent_id)
            .collect();
        for parent in parents {
            if let Some(book) = books.get_mut(&parent) {
                book.children += 1;
            }
        }
        for row in ledger_entries {
            if let Some(book) = books.get_mut(&row.account_id) {
                book.rows.push(row);
            }
        }
        for id in integrity_holds {
            if let Some(book) = books.get_mut(&id) {
                book.integrity_hold = true;
            }
        }

        let highest = journal_entries
            .iter()
            .map(|entry| entry.entry_number)
            .max()
            .unwrap_or(0);

        Self {
            id,
            name,
            created_at,
            accounts: RwLock::new(
                books
                    .into_iter()
                    .map(|(id, book)| (id, Arc::new(Mutex::new(book))))
                    .collect(),
            ),
            journal: Mutex::new(JournalStore::from_entries(journal_entries)),
            recurring: Mutex::new(RecurringStore {
                definitions: recurring_definitions
                    .into_iter()
                    .map(|definition| (definition.id, definition))
                    .collect(),
                records: execution_records,
            }),
            approvals: Mutex::new(ApprovalStore {
                requests: approval_requests,
            }),
            next_entry_number: AtomicU64::new(next_entry_number.max(highest + 1)),
        }
    }
}

/// Serializable form of the entire ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "LedgerSnapshot::schema_version_default")]
    pub schema_version: u8,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub next_entry_number: u64,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub ledger_entries: Vec<LedgerEntry>,
    #[serde(default)]
    pub journal_entries: Vec<JournalEntry>,
    #[serde(default)]
    pub recurring_definitions: Vec<RecurringEntryDefinition>,
    #[serde(default)]
    pub execution_records: Vec<RecurringExecutionRecord>,
    #[serde(default)]
    pub approval_requests: Vec<ApprovalRequest>,
    #[serde(default)]
    pub integrity_holds: Vec<Uuid>,
}

impl LedgerSnapshot {
    pub fn schema_version_default() -> u8 {
        CURRENT_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(account: &Account, debit: i64, credit: i64, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            journal_entry_id: Uuid::new_v4(),
            entry_number: 1,
            account_id: account.id,
            debit: Decimal::from(debit),
            credit: Decimal::from(credit),
            balance_after: Decimal::from(balance_after),
            posted_at: Utc::now(),
        }
    }

    #[test]
    fn replay_detects_tampered_running_balance() {
        let account = Account::new("1000", "Cash", AccountNature::Asset);
        let mut book = AccountBook::new(account.clone());
        book.rows.push(row(&account, 100, 0, 100));
        book.rows.push(row(&account, 0, 40, 60));
        assert_eq!(book.replay().unwrap(), Decimal::from(60));

        book.rows.push(row(&account, 10, 0, 75));
        let err = book.replay().expect_err("tampered row must be caught");
        assert!(matches!(err, LedgerError::IntegrityViolation { .. }));
    }

    #[test]
    fn posting_check_catches_bad_earlier_row() {
        let mut account = Account::new("1000", "Cash", AccountNature::Asset);
        account.current_balance = Decimal::from(20);
        let mut book = AccountBook::new(account.clone());
        book.rows.push(row(&account, 10, 0, 11));
        book.rows.push(row(&account, 10, 0, 20));
        assert!(matches!(
            book.check_integrity(),
            Err(LedgerError::IntegrityViolation { .. })
        ));

        book.rows[0].balance_after = Decimal::from(10);
        assert!(book.check_integrity().is_ok());
        book.integrity_hold = true;
        assert!(matches!(
            book.check_integrity(),
            Err(LedgerError::IntegrityHold(id)) if id == account.id
        ));
    }

    #[test]
    fn locked_accounts_dedup_and_sort() {
        let ledger = Ledger::new("Locks");
        let a = Account::new("1", "A", AccountNature::Asset);
        let b = Account::new("2", "B", AccountNature::Income);
        let (a_id, b_id) = (a.id, b.id);
        {
            let mut map = ledger.accounts_map().write();
            map.insert(a_id, Arc::new(Mutex::new(AccountBook::new(a))));
            map.insert(b_id, Arc::new(Mutex::new(AccountBook::new(b))));
        }
        let handles = ledger.account_handles(&[b_id, a_id, b_id]);
        let locked = LockedAccounts::acquire(&handles, Duration::from_millis(50)).unwrap();
        assert!(locked.lookup(a_id).is_some());
        assert!(locked.lookup(b_id).is_some());
        assert!(locked.lookup(Uuid::new_v4()).is_none());
    }

    #[test]
    fn snapshot_roundtrip_restores_children_and_numbering() {
        let ledger = Ledger::new("Snap");
        let parent = Account::new("1000", "Current assets", AccountNature::Asset);
        let child = Account::new("1010", "Cash", AccountNature::Asset).with_parent(parent.id);
        let parent_id = parent.id;
        {
            let mut map = ledger.accounts_map().write();
            let mut parent_book = AccountBook::new(parent);
            parent_book.children = 1;
            map.insert(parent_id, Arc::new(Mutex::new(parent_book)));
            map.insert(child.id, Arc::new(Mutex::new(AccountBook::new(child))));
        }
        ledger.allocate_entry_number();
        ledger.allocate_entry_number();

        let restored = Ledger::from_snapshot(ledger.snapshot());
        let handle = restored.account_handle(parent_id).unwrap();
        assert!(!handle.lock().is_leaf());
        assert_eq!(restored.allocate_entry_number(), 3);
    }
}
