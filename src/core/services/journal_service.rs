use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{AccountRejection, ConcurrencyError, LedgerError, ValidationError};
use crate::ledger::ledger::ApprovalStore;
use crate::ledger::{
    AccountDirectory, AccountView, ApprovalStatus, EntrySource, JournalEntry, JournalStatus,
    Ledger, LedgerEntry, LockedAccounts,
};

use super::ServiceResult;

/// Knobs applied to a single posting.
#[derive(Debug, Clone, Copy)]
pub struct PostingOptions {
    pub currency_scale: u32,
    pub epsilon: Decimal,
    pub lock_timeout: Duration,
    pub deadline: Option<(Instant, u64)>,
}

impl PostingOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            currency_scale: config.currency_scale,
            epsilon: config.balance_epsilon,
            lock_timeout: config.lock_timeout(),
            deadline: None,
        }
    }

    /// Bounds the posting by `budget`, measured from now.
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some((Instant::now() + budget, budget.as_millis() as u64));
        self
    }

    fn lock_wait(&self) -> Duration {
        match self.deadline {
            Some((at, _)) => self
                .lock_timeout
                .min(at.saturating_duration_since(Instant::now())),
            None => self.lock_timeout,
        }
    }

    fn check_deadline(&self) -> Result<(), ConcurrencyError> {
        match self.deadline {
            Some((at, budget_ms)) if Instant::now() > at => {
                Err(ConcurrencyError::DeadlineExceeded(budget_ms))
            }
            _ => Ok(()),
        }
    }
}

impl Default for PostingOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Looks accounts up one at a time without holding their locks.
pub struct LiveDirectory<'a>(pub &'a Ledger);

impl AccountDirectory for LiveDirectory<'_> {
    fn lookup(&self, id: Uuid) -> Option<AccountView> {
        self.0
            .account_handle(id)
            .map(|handle| AccountView::from(&*handle.lock()))
    }
}

pub struct JournalService;

impl JournalService {
    /// Structural and referential checks. Pure: nothing is mutated.
    pub fn validate<D: AccountDirectory + ?Sized>(
        entry: &JournalEntry,
        directory: &D,
        epsilon: Decimal,
    ) -> Result<(), ValidationError> {
        if entry.lines.len() < 2 {
            return Err(ValidationError::EmptyEntry {
                lines: entry.lines.len(),
            });
        }

        for (index, line) in entry.lines.iter().enumerate() {
            if line.debit < Decimal::ZERO || line.credit < Decimal::ZERO {
                return Err(ValidationError::NegativeAmount { line: index });
            }
            if line.debit.is_zero() == line.credit.is_zero() {
                return Err(ValidationError::AmbiguousLine { line: index });
            }
        }

        for (index, line) in entry.lines.iter().enumerate() {
            Self::check_account(directory, index, line.account_id)?;
        }

        let difference = entry.total_debits() - entry.total_credits();
        if difference.abs() >= epsilon {
            return Err(ValidationError::UnbalancedEntry { difference });
        }
        Ok(())
    }

    /// An account can take postings when it exists, is active, and has no children.
    pub fn check_account<D: AccountDirectory + ?Sized>(
        directory: &D,
        line: usize,
        account_id: Uuid,
    ) -> Result<(), ValidationError> {
        let reason = match directory.lookup(account_id) {
            None => AccountRejection::Unknown,
            Some(view) if !view.active => AccountRejection::Inactive,
            Some(view) if !view.is_leaf => AccountRejection::GroupAccount,
            Some(_) => return Ok(()),
        };
        Err(ValidationError::InvalidAccountReference {
            line,
            account_id,
            reason,
        })
    }

    /// Rounds every amount to the currency scale.
    pub fn normalize(entry: &mut JournalEntry, scale: u32) {
        for line in &mut entry.lines {
            line.debit = round(line.debit, scale);
            line.credit = round(line.credit, scale);
        }
    }

    /// Validates and posts a new entry atomically.
    pub fn post(
        ledger: &Ledger,
        mut entry: JournalEntry,
        options: &PostingOptions,
        now: DateTime<Utc>,
    ) -> ServiceResult<JournalEntry> {
        if entry.status != JournalStatus::Draft {
            return Err(LedgerError::InvalidState(format!(
                "journal entry {} is not a draft",
                entry.id
            )));
        }
        Self::normalize(&mut entry, options.currency_scale);
        Self::commit(ledger, entry, options, now)
    }

    /// Stores a validated draft without touching any balance.
    pub fn record_draft(
        ledger: &Ledger,
        mut entry: JournalEntry,
        options: &PostingOptions,
    ) -> ServiceResult<JournalEntry> {
        if entry.status != JournalStatus::Draft {
            return Err(LedgerError::InvalidState(format!(
                "journal entry {} is not a draft",
                entry.id
            )));
        }
        Self::normalize(&mut entry, options.currency_scale);
        Self::validate(&entry, &LiveDirectory(ledger), options.epsilon)?;

        let mut journal = ledger.journal();
        if journal.get(entry.id).is_some() {
            return Err(LedgerError::InvalidState(format!(
                "journal entry {} is already recorded",
                entry.id
            )));
        }
        if entry.entry_number == 0 {
            entry.entry_number = ledger.allocate_entry_number();
        }
        journal.upsert(entry.clone());
        debug!(entry = %entry.id, number = entry.entry_number, "draft journal entry recorded");
        Ok(entry)
    }

    /// Posts a draft previously stored with [`JournalService::record_draft`].
    pub fn post_draft(
        ledger: &Ledger,
        entry_id: Uuid,
        options: &PostingOptions,
        now: DateTime<Utc>,
    ) -> ServiceResult<JournalEntry> {
        let draft = ledger
            .journal()
            .get(entry_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("journal entry {}", entry_id)))?;
        Self::post(ledger, draft, options, now)
    }

    /// Posts the mirror image of a posted entry and marks the original reversed.
    pub fn reverse(
        ledger: &Ledger,
        entry_id: Uuid,
        date: Option<NaiveDate>,
        actor: &str,
        options: &PostingOptions,
        now: DateTime<Utc>,
    ) -> ServiceResult<JournalEntry> {
        let original = ledger
            .journal()
            .get(entry_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("journal entry {}", entry_id)))?;
        ensure_reversible(&original)?;

        let mut reversal = JournalEntry::draft(date.unwrap_or(original.date), actor)
            .with_reference(format!("REV-{}", original.entry_number))
            .with_description(format!("Reversal of entry {}", original.entry_number))
            .with_source(EntrySource::Reversal);
        reversal.lines = original.lines.iter().map(|line| line.inverted()).collect();
        reversal.reverses = Some(original.id);

        let posted = Self::commit(ledger, reversal, options, now)?;
        info!(original = %entry_id, reversal = %posted.id, "journal entry reversed");
        Ok(posted)
    }

    fn commit(
        ledger: &Ledger,
        mut entry: JournalEntry,
        options: &PostingOptions,
        now: DateTime<Utc>,
    ) -> ServiceResult<JournalEntry> {
        // A recorded draft posts only once its approval gate (if any) is open. The
        // approvals guard is held through the commit so the gate cannot change under us.
        let recorded = ledger.journal().get(entry.id).is_some();
        let _gate = if recorded {
            let approvals = ledger.approvals();
            ensure_gate_open(&approvals, entry.id)?;
            Some(approvals)
        } else {
            None
        };

        let ids: Vec<Uuid> = entry.lines.iter().map(|line| line.account_id).collect();
        let handles = ledger.account_handles(&ids);
        let mut locked = LockedAccounts::acquire(&handles, options.lock_wait()).map_err(|err| {
            match (err, options.deadline) {
                (LedgerError::Concurrency(ConcurrencyError::LockTimeout(_)), Some((at, ms)))
                    if Instant::now() >= at =>
                {
                    ConcurrencyError::DeadlineExceeded(ms).into()
                }
                (err, _) => err,
            }
        })?;

        Self::validate(&entry, &locked, options.epsilon)?;

        for book in locked.books_mut() {
            if let Err(err) = book.check_integrity() {
                if matches!(err, LedgerError::IntegrityViolation { .. }) {
                    book.integrity_hold = true;
                    warn!(account = %book.account.id, code = %book.account.code, "integrity violation, account placed on hold");
                }
                return Err(err);
            }
        }

        options.check_deadline()?;

        let mut journal = ledger.journal();
        if let Some(stored) = journal.get(entry.id) {
            if !recorded {
                return Err(ConcurrencyError::Conflict(format!(
                    "journal entry {} was recorded while it was being posted",
                    entry.id
                ))
                .into());
            }
            if stored.status != JournalStatus::Draft {
                return Err(LedgerError::InvalidState(format!(
                    "journal entry {} is already {:?}",
                    entry.id, stored.status
                )));
            }
        }
        if let Some(original_id) = entry.reverses {
            let original = journal.get(original_id).ok_or_else(|| {
                LedgerError::NotFound(format!("journal entry {}", original_id))
            })?;
            ensure_reversible(original)?;
        }

        if entry.entry_number == 0 {
            entry.entry_number = ledger.allocate_entry_number();
        }
        entry.status = JournalStatus::Posted;
        entry.posted_at = Some(now);

        for line in &entry.lines {
            let book = locked.get_mut(line.account_id).ok_or_else(|| {
                LedgerError::InvalidState(format!("account {} lost its lock", line.account_id))
            })?;
            let balance_after =
                book.account.current_balance + book.account.nature.balance_delta(line.debit, line.credit);
            book.rows.push(LedgerEntry {
                id: Uuid::new_v4(),
                date: entry.date,
                journal_entry_id: entry.id,
                entry_number: entry.entry_number,
                account_id: line.account_id,
                debit: line.debit,
                credit: line.credit,
                balance_after,
                posted_at: now,
            });
            book.account.current_balance = balance_after;
        }

        if let Some(original_id) = entry.reverses {
            if let Some(original) = journal.get_mut(original_id) {
                original.status = JournalStatus::Reversed;
                original.reversed_by = Some(entry.id);
            }
        }
        journal.upsert(entry.clone());

        info!(
            entry = %entry.id,
            number = entry.entry_number,
            lines = entry.lines.len(),
            amount = %entry.total_debits(),
            "journal entry posted"
        );
        Ok(entry)
    }
}

fn ensure_gate_open(approvals: &ApprovalStore, entry_id: Uuid) -> ServiceResult<()> {
    match approvals.latest_for_entry(entry_id).map(|request| request.status) {
        Some(ApprovalStatus::Pending) => Err(LedgerError::InvalidState(format!(
            "journal entry {} is awaiting approval",
            entry_id
        ))),
        Some(ApprovalStatus::Rejected) => Err(LedgerError::InvalidState(format!(
            "journal entry {} was rejected",
            entry_id
        ))),
        _ => Ok(()),
    }
}

fn ensure_reversible(entry: &JournalEntry) -> ServiceResult<()> {
    match entry.status {
        JournalStatus::Posted if entry.reversed_by.is_none() => Ok(()),
        JournalStatus::Reversed => Err(LedgerError::InvalidState(format!(
            "journal entry {} is already reversed",
            entry.id
        ))),
        _ => Err(LedgerError::InvalidState(format!(
            "journal entry {} is not posted",
            entry.id
        ))),
    }
}

fn round(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}
