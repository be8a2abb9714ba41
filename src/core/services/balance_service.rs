use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::LedgerError;
use crate::ledger::{AccountBook, AccountNature, Ledger, LedgerEntry, LockedAccounts};

use super::ServiceResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalanceLine {
    pub account_id: Uuid,
    pub code: String,
    pub name: String,
    pub nature: AccountNature,
    pub debit: Decimal,
    pub credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalance {
    pub as_of: NaiveDate,
    pub lines: Vec<TrialBalanceLine>,
    pub total_debits: Decimal,
    pub total_credits: Decimal,
    pub balanced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub date: NaiveDate,
    pub entry_number: u64,
    pub journal_entry_id: Uuid,
    pub debit: Decimal,
    pub credit: Decimal,
    pub balance: Decimal,
}

/// Ledger view of one account over a date window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStatement {
    pub account_id: Uuid,
    pub code: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub opening_balance: Decimal,
    pub lines: Vec<StatementLine>,
    pub closing_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub account_id: Uuid,
    pub code: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub accounts_checked: usize,
    pub rows_checked: usize,
    pub issues: Vec<IntegrityIssue>,
    /// Accounts this run placed on integrity hold.
    #[serde(default)]
    pub newly_held: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct BalanceService;

impl BalanceService {
    /// Balance of `account_id` counting only rows dated on or before `as_of`.
    pub fn get_balance(ledger: &Ledger, account_id: Uuid, as_of: NaiveDate) -> ServiceResult<Decimal> {
        let handle = ledger
            .account_handle(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", account_id)))?;
        let book = handle.lock();
        Ok(balance_as_of(&book, as_of))
    }

    /// Every active leaf account with its closing balance in the debit or credit column.
    pub fn trial_balance(
        ledger: &Ledger,
        as_of: NaiveDate,
        lock_timeout: Duration,
    ) -> ServiceResult<TrialBalance> {
        let handles = ledger.all_account_handles();
        let locked = LockedAccounts::acquire(&handles, lock_timeout)?;

        let mut lines = Vec::new();
        for (id, _) in &handles {
            let Some(book) = locked.get(*id) else { continue };
            if !book.is_leaf() {
                continue;
            }
            let balance = balance_as_of(book, as_of);
            // Inactive accounts still carrying a balance stay listed so the report closes.
            if !book.account.active && balance.is_zero() {
                continue;
            }
            let (debit, credit) = split_balance(book.account.nature, balance);
            lines.push(TrialBalanceLine {
                account_id: book.account.id,
                code: book.account.code.clone(),
                name: book.account.name.clone(),
                nature: book.account.nature,
                debit,
                credit,
            });
        }
        drop(locked);
        lines.sort_by(|a, b| a.code.cmp(&b.code));

        let total_debits: Decimal = lines.iter().map(|line| line.debit).sum();
        let total_credits: Decimal = lines.iter().map(|line| line.credit).sum();
        Ok(TrialBalance {
            as_of,
            balanced: total_debits == total_credits,
            lines,
            total_debits,
            total_credits,
        })
    }

    pub fn account_statement(
        ledger: &Ledger,
        account_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> ServiceResult<AccountStatement> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(LedgerError::InvalidInput(format!(
                    "statement window starts ({}) after it ends ({})",
                    from, to
                )));
            }
        }
        let handle = ledger
            .account_handle(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", account_id)))?;
        let book = handle.lock();
        let nature = book.account.nature;

        let mut rows: Vec<&LedgerEntry> = book.rows.iter().collect();
        rows.sort_by_key(|row| row.sort_key());

        let mut opening = Decimal::ZERO;
        let mut running = Decimal::ZERO;
        let mut lines = Vec::new();
        for row in rows {
            if to.is_some_and(|to| row.date > to) {
                break;
            }
            running += nature.balance_delta(row.debit, row.credit);
            if from.is_some_and(|from| row.date < from) {
                opening = running;
                continue;
            }
            lines.push(StatementLine {
                date: row.date,
                entry_number: row.entry_number,
                journal_entry_id: row.journal_entry_id,
                debit: row.debit,
                credit: row.credit,
                balance: running,
            });
        }

        Ok(AccountStatement {
            account_id,
            code: book.account.code.clone(),
            from,
            to,
            opening_balance: opening,
            lines,
            closing_balance: running,
        })
    }

    /// Replays every account's rows and compares with its recorded balance.
    /// Replays every account; any account that does not reconcile goes on integrity hold.
    pub fn verify_integrity(ledger: &Ledger) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        for (_, handle) in ledger.all_account_handles() {
            let mut book = handle.lock();
            report.accounts_checked += 1;
            report.rows_checked += book.rows.len();
            let detail = match book.replay() {
                Err(err) => Some(err.to_string()),
                Ok(replayed) if replayed != book.account.current_balance => Some(format!(
                    "recorded balance {} differs from replayed {}",
                    book.account.current_balance, replayed
                )),
                Ok(_) => None,
            };
            if let Some(detail) = detail {
                warn!(account = %book.account.id, %detail, "integrity check failed");
                if !book.integrity_hold {
                    book.integrity_hold = true;
                    report.newly_held += 1;
                    warn!(account = %book.account.id, code = %book.account.code, "account placed on integrity hold");
                }
                report.issues.push(IntegrityIssue {
                    account_id: book.account.id,
                    code: book.account.code.clone(),
                    detail,
                });
            }
        }
        report
    }
}

fn balance_as_of(book: &AccountBook, as_of: NaiveDate) -> Decimal {
    let nature = book.account.nature;
    let mut rows: Vec<&LedgerEntry> = book.rows.iter().filter(|row| row.date <= as_of).collect();
    rows.sort_by_key(|row| row.sort_key());
    rows.iter()
        .fold(Decimal::ZERO, |balance, row| {
            balance + nature.balance_delta(row.debit, row.credit)
        })
}

/// Places a signed balance in the debit or credit column, never both.
fn split_balance(nature: AccountNature, balance: Decimal) -> (Decimal, Decimal) {
    let on_normal_side = balance >= Decimal::ZERO;
    match (nature.is_debit_normal(), on_normal_side) {
        (true, true) => (balance, Decimal::ZERO),
        (true, false) => (Decimal::ZERO, -balance),
        (false, true) => (Decimal::ZERO, balance),
        (false, false) => (-balance, Decimal::ZERO),
    }
}
