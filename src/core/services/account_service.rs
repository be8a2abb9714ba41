use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::LedgerError;
use crate::ledger::{Account, AccountBook, AccountNature, Ledger};

use super::ServiceResult;

/// Editable account attributes. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountChanges {
    pub name: Option<String>,
    pub active: Option<bool>,
}

pub struct AccountService;

impl AccountService {
    pub fn create(
        ledger: &Ledger,
        code: &str,
        name: &str,
        nature: AccountNature,
        parent_id: Option<Uuid>,
    ) -> ServiceResult<Account> {
        if code.trim().is_empty() {
            return Err(LedgerError::InvalidInput("account code is required".into()));
        }
        if name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("account name is required".into()));
        }

        let mut map = ledger.accounts_map().write();
        let normalized = Account::normalized_code(code);
        let duplicate = map
            .values()
            .any(|handle| Account::normalized_code(&handle.lock().account.code) == normalized);
        if duplicate {
            return Err(LedgerError::InvalidInput(format!(
                "account code `{}` already exists",
                code.trim()
            )));
        }

        let mut account = Account::new(code, name.trim(), nature);
        if let Some(parent_id) = parent_id {
            let handle = map
                .get(&parent_id)
                .map(Arc::clone)
                .ok_or_else(|| LedgerError::NotFound(format!("parent account {}", parent_id)))?;
            let mut parent = handle.lock();
            if !parent.rows.is_empty() {
                return Err(LedgerError::InvalidState(format!(
                    "account {} already has postings and cannot become a group account",
                    parent.account.code
                )));
            }
            parent.children += 1;
            account = account.with_parent(parent_id);
        }

        map.insert(
            account.id,
            Arc::new(Mutex::new(AccountBook::new(account.clone()))),
        );
        info!(account = %account.id, code = %account.code, nature = account.nature.label(), "account created");
        Ok(account)
    }

    pub fn update(ledger: &Ledger, id: Uuid, changes: AccountChanges) -> ServiceResult<Account> {
        let handle = ledger
            .account_handle(id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", id)))?;
        let mut book = handle.lock();
        if let Some(name) = changes.name {
            if name.trim().is_empty() {
                return Err(LedgerError::InvalidInput("account name is required".into()));
            }
            book.account.name = name.trim().to_string();
        }
        if let Some(active) = changes.active {
            if book.account.active != active {
                info!(account = %id, active, "account activation changed");
            }
            book.account.active = active;
        }
        Ok(book.account.clone())
    }

    /// All accounts ordered by code.
    pub fn list(ledger: &Ledger) -> Vec<Account> {
        let mut accounts: Vec<Account> = ledger
            .all_account_handles()
            .iter()
            .map(|(_, handle)| handle.lock().account.clone())
            .collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));
        accounts
    }

    pub fn get(ledger: &Ledger, id: Uuid) -> ServiceResult<Account> {
        ledger
            .account_handle(id)
            .map(|handle| handle.lock().account.clone())
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", id)))
    }

    pub fn find_by_code(ledger: &Ledger, code: &str) -> Option<Account> {
        let normalized = Account::normalized_code(code);
        ledger
            .all_account_handles()
            .iter()
            .map(|(_, handle)| handle.lock().account.clone())
            .find(|account| Account::normalized_code(&account.code) == normalized)
    }

    /// Lifts an integrity hold after operator review.
    ///
    /// The ledger rows stay authoritative: the rows must replay cleanly and the
    /// account balance is reset to their total.
    pub fn release_integrity_hold(ledger: &Ledger, id: Uuid) -> ServiceResult<Account> {
        let handle = ledger
            .account_handle(id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", id)))?;
        let mut book = handle.lock();
        if !book.integrity_hold {
            return Err(LedgerError::InvalidState(format!(
                "account {} is not on integrity hold",
                book.account.code
            )));
        }
        let replayed = book.replay()?;
        if book.account.current_balance != replayed {
            warn!(
                account = %id,
                recorded = %book.account.current_balance,
                replayed = %replayed,
                "balance reset to ledger replay on hold release"
            );
            book.account.current_balance = replayed;
        }
        book.integrity_hold = false;
        info!(account = %id, "integrity hold released");
        Ok(book.account.clone())
    }
}
