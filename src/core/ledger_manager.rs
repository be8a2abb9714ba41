use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{
    AccountRequest, BatchDecisionRequest, BatchItemResult, DecisionRequest, JournalEntryRequest,
    LedgerQuery, RecurringEntryRequest,
};
use crate::config::EngineConfig;
use crate::core::clock::Clock;
use crate::core::services::recurrence_service::FailedExecution;
use crate::core::services::{
    AccountChanges, AccountService, AccountStatement, ApprovalService, BalanceService,
    DecisionOutcome, IntegrityReport, JournalService, PostingOptions, RecurrenceService,
    RetryOutcome, RunReport, TrialBalance,
};
use crate::errors::{LedgerError, Result};
use crate::ledger::{
    Account, ApprovalRequest, Decision, JournalEntry, Ledger, LedgerSnapshot,
    RecurringEntryDefinition, RecurringExecutionRecord, CURRENT_SCHEMA_VERSION,
};
use crate::storage::{ledger_warnings, StorageBackend};

/// Metadata describing how the ledger was opened.
#[derive(Debug, Clone)]
pub struct LoadMetadata {
    pub warnings: Vec<String>,
    pub path: PathBuf,
    pub schema_version: u8,
    pub created: bool,
}

/// Facade that coordinates ledger state, services, and persistence.
///
/// Every mutating operation writes a fresh snapshot before returning.
pub struct LedgerManager {
    ledger: Ledger,
    storage: Box<dyn StorageBackend>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    metadata: LoadMetadata,
    persist_lock: Mutex<()>,
    /// Set when applied changes could not be written; mutations stay refused until a save succeeds.
    unsaved: AtomicBool,
}

impl LedgerManager {
    /// Loads the configured ledger, or starts an empty one when none is stored yet.
    pub fn open(
        storage: Box<dyn StorageBackend>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let name = config.ledger_name.clone();
        let path = storage.snapshot_path(&name);
        let (ledger, metadata) = match storage.load_snapshot(&name)? {
            Some(snapshot) => {
                ensure_schema_support(snapshot.schema_version)?;
                let warnings = ledger_warnings(&snapshot);
                for warning in &warnings {
                    warn!(ledger = %name, "{}", warning);
                }
                let schema_version = snapshot.schema_version;
                let ledger = Ledger::from_snapshot(snapshot);
                info!(ledger = %name, path = %path.display(), "ledger loaded");
                (
                    ledger,
                    LoadMetadata {
                        warnings,
                        path,
                        schema_version,
                        created: false,
                    },
                )
            }
            None => {
                info!(ledger = %name, "starting new ledger");
                (
                    Ledger::new(name.clone()),
                    LoadMetadata {
                        warnings: Vec::new(),
                        path,
                        schema_version: CURRENT_SCHEMA_VERSION,
                        created: true,
                    },
                )
            }
        };
        Ok(Self {
            ledger,
            storage,
            config,
            clock,
            metadata,
            persist_lock: Mutex::new(()),
            unsaved: AtomicBool::new(false),
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub fn load_metadata(&self) -> &LoadMetadata {
        &self.metadata
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Writes the current state. Snapshots are taken and written one at a time.
    pub fn persist(&self) -> Result<PathBuf> {
        let _guard = self.persist_lock.lock();
        let snapshot = self.ledger.snapshot();
        self.storage
            .save_snapshot(&self.config.ledger_name, &snapshot)?;
        if self.unsaved.swap(false, Ordering::SeqCst) {
            info!(ledger = %self.config.ledger_name, "unsaved changes written, mutations resumed");
        }
        Ok(self.storage.snapshot_path(&self.config.ledger_name))
    }

    /// True while applied changes are waiting for a successful save.
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved.load(Ordering::SeqCst)
    }

    fn posting_options(&self) -> PostingOptions {
        PostingOptions::from_config(&self.config)
    }

    /// Refuses to mutate on top of state that could not be saved, after one more save attempt.
    fn ensure_writable(&self) -> Result<()> {
        if !self.has_unsaved_changes() {
            return Ok(());
        }
        self.persist().map(|_| ()).map_err(|err| {
            LedgerError::Storage(format!(
                "ledger has unsaved changes and accepts no mutations until they are written: {}",
                err
            ))
        })
    }

    /// Saves after a change was applied. A failed save leaves the change live, so the
    /// caller learns it is not durable and further mutations are refused.
    fn durable(&self) -> Result<()> {
        self.persist().map(|_| ()).map_err(|err| {
            self.unsaved.store(true, Ordering::SeqCst);
            error!(ledger = %self.config.ledger_name, error = %err, "change applied but not persisted");
            LedgerError::NotDurable(err.to_string())
        })
    }

    fn persisted<T>(&self, value: T) -> Result<T> {
        self.durable()?;
        Ok(value)
    }

    /// Like `persisted`, but an integrity violation also persists the hold it raised.
    fn settled<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => self.persisted(value),
            Err(err @ LedgerError::IntegrityViolation { .. }) => {
                self.durable()?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    // Accounts

    pub fn create_account(&self, request: AccountRequest) -> Result<Account> {
        self.ensure_writable()?;
        let parent = request
            .parent
            .as_ref()
            .map(|selector| selector.resolve(&self.ledger))
            .transpose()?;
        let account = AccountService::create(
            &self.ledger,
            &request.code,
            &request.name,
            request.nature,
            parent,
        )?;
        self.persisted(account)
    }

    pub fn update_account(&self, id: Uuid, changes: AccountChanges) -> Result<Account> {
        self.ensure_writable()?;
        let account = AccountService::update(&self.ledger, id, changes)?;
        self.persisted(account)
    }

    pub fn accounts(&self) -> Vec<Account> {
        AccountService::list(&self.ledger)
    }

    pub fn account(&self, id: Uuid) -> Result<Account> {
        AccountService::get(&self.ledger, id)
    }

    pub fn find_account(&self, code: &str) -> Option<Account> {
        AccountService::find_by_code(&self.ledger, code)
    }

    pub fn release_integrity_hold(&self, id: Uuid) -> Result<Account> {
        self.ensure_writable()?;
        let account = AccountService::release_integrity_hold(&self.ledger, id)?;
        self.persisted(account)
    }

    // Journal

    /// `POST /journal-entries`
    pub fn post_journal_entry(&self, request: JournalEntryRequest) -> Result<JournalEntry> {
        let entry = request.into_entry(&self.ledger)?;
        self.post_entry(entry)
    }

    pub fn post_entry(&self, entry: JournalEntry) -> Result<JournalEntry> {
        self.ensure_writable()?;
        let posted =
            JournalService::post(&self.ledger, entry, &self.posting_options(), self.now());
        self.settled(posted)
    }

    /// Stores the entry as a draft behind an approval request.
    pub fn submit_journal_entry(
        &self,
        request: JournalEntryRequest,
    ) -> Result<(JournalEntry, ApprovalRequest)> {
        self.ensure_writable()?;
        let entry = request.into_entry(&self.ledger)?;
        let submitted = ApprovalService::submit_journal_entry(
            &self.ledger,
            entry,
            &self.posting_options(),
            self.now(),
        )?;
        self.persisted(submitted)
    }

    pub fn post_draft(&self, entry_id: Uuid) -> Result<JournalEntry> {
        self.ensure_writable()?;
        let posted =
            JournalService::post_draft(&self.ledger, entry_id, &self.posting_options(), self.now());
        self.settled(posted)
    }

    pub fn reverse_entry(
        &self,
        entry_id: Uuid,
        date: Option<NaiveDate>,
        actor: &str,
    ) -> Result<JournalEntry> {
        self.ensure_writable()?;
        let reversal = JournalService::reverse(
            &self.ledger,
            entry_id,
            date,
            actor,
            &self.posting_options(),
            self.now(),
        );
        self.settled(reversal)
    }

    pub fn journal_entry(&self, entry_id: Uuid) -> Result<JournalEntry> {
        self.ledger
            .journal()
            .get(entry_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("journal entry {}", entry_id)))
    }

    // Balances

    pub fn get_balance(&self, account_id: Uuid, as_of: Option<NaiveDate>) -> Result<Decimal> {
        BalanceService::get_balance(&self.ledger, account_id, as_of.unwrap_or(self.today()))
    }

    /// `GET /accounts/{id}/ledger?from&to`
    pub fn account_statement(&self, account_id: Uuid, query: LedgerQuery) -> Result<AccountStatement> {
        BalanceService::account_statement(&self.ledger, account_id, query.from, query.to)
    }

    /// `GET /trial-balance?asOf`
    pub fn trial_balance(&self, as_of: Option<NaiveDate>) -> Result<TrialBalance> {
        BalanceService::trial_balance(
            &self.ledger,
            as_of.unwrap_or(self.today()),
            self.config.lock_timeout(),
        )
    }

    /// Replays every account. Accounts that fail are placed on hold and the holds are saved.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let report = BalanceService::verify_integrity(&self.ledger);
        if report.newly_held > 0 {
            // A failed save is surfaced through `has_unsaved_changes` and refused mutations.
            let _ = self.durable();
        }
        report
    }

    // Recurring entries

    /// `POST /recurring-entries`
    pub fn create_recurring(&self, request: RecurringEntryRequest) -> Result<RecurringEntryDefinition> {
        self.ensure_writable()?;
        let definition = request.into_definition(&self.ledger, &self.config)?;
        let created = RecurrenceService::create(&self.ledger, &self.config, definition, self.now())?;
        self.persisted(created)
    }

    /// `PUT /recurring-entries/{id}`
    pub fn update_recurring(
        &self,
        id: Uuid,
        request: RecurringEntryRequest,
    ) -> Result<RecurringEntryDefinition> {
        self.ensure_writable()?;
        let changes = request.into_definition(&self.ledger, &self.config)?;
        let updated = RecurrenceService::update(&self.ledger, &self.config, id, changes, self.now())?;
        self.persisted(updated)
    }

    pub fn pause_recurring(&self, id: Uuid) -> Result<RecurringEntryDefinition> {
        self.ensure_writable()?;
        let definition = RecurrenceService::set_paused(&self.ledger, id, true, self.now())?;
        self.persisted(definition)
    }

    pub fn resume_recurring(&self, id: Uuid) -> Result<RecurringEntryDefinition> {
        self.ensure_writable()?;
        let definition = RecurrenceService::set_paused(&self.ledger, id, false, self.now())?;
        self.persisted(definition)
    }

    pub fn reactivate_recurring(&self, id: Uuid) -> Result<RecurringEntryDefinition> {
        self.ensure_writable()?;
        let definition = RecurrenceService::reactivate(&self.ledger, id, self.now())?;
        self.persisted(definition)
    }

    pub fn set_recurring_parameters(
        &self,
        id: Uuid,
        parameters: BTreeMap<String, Decimal>,
    ) -> Result<RecurringEntryDefinition> {
        self.ensure_writable()?;
        let definition = RecurrenceService::set_parameters(
            &self.ledger,
            &self.config,
            id,
            parameters,
            self.now(),
        )?;
        self.persisted(definition)
    }

    pub fn recurring_definition(&self, id: Uuid) -> Result<RecurringEntryDefinition> {
        RecurrenceService::get(&self.ledger, id)
    }

    pub fn recurring_definitions(&self) -> Vec<RecurringEntryDefinition> {
        RecurrenceService::list(&self.ledger)
    }

    pub fn recurring_history(&self, id: Uuid) -> Vec<RecurringExecutionRecord> {
        RecurrenceService::history(&self.ledger, id)
    }

    /// Runs every due occurrence as of the clock's current date.
    pub fn run_due(&self) -> Result<RunReport> {
        self.ensure_writable()?;
        let report = RecurrenceService::run_due(&self.ledger, &self.config, self.now());
        if report.outcomes.is_empty() {
            return Ok(report);
        }
        self.persisted(report)
    }

    /// `POST /recurring-entries/{id}/retry`
    pub fn retry_recurring(&self, id: Uuid) -> Result<RetryOutcome> {
        self.ensure_writable()?;
        let outcome = RecurrenceService::retry(&self.ledger, &self.config, id, self.now())?;
        self.persisted(outcome)
    }

    /// `POST /recurring-entries/{id}/skip-next`
    pub fn skip_next(&self, id: Uuid) -> Result<RecurringExecutionRecord> {
        self.ensure_writable()?;
        let record = RecurrenceService::skip_next(&self.ledger, id, self.now())?;
        self.persisted(record)
    }

    /// `GET /recurring-entries/failed`
    pub fn failed_executions(&self) -> Vec<FailedExecution> {
        RecurrenceService::failed_executions(&self.ledger)
    }

    // Approvals

    /// `GET /recurring-entries/pending-approvals`
    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        ApprovalService::pending(&self.ledger)
    }

    pub fn decide(
        &self,
        request_id: Uuid,
        decision: Decision,
        approval: DecisionRequest,
    ) -> Result<DecisionOutcome> {
        self.ensure_writable()?;
        let outcome = ApprovalService::decide(
            &self.ledger,
            &self.config,
            request_id,
            decision,
            &approval.approver,
            approval.comments,
            self.now(),
        )?;
        self.persisted(outcome)
    }

    /// `POST /recurring-entries/{id}/approve`
    pub fn approve_recurring(&self, id: Uuid, approval: DecisionRequest) -> Result<DecisionOutcome> {
        let definition = RecurrenceService::get(&self.ledger, id)?;
        let request_id = definition.pending_approval.ok_or_else(|| {
            LedgerError::InvalidState(format!(
                "recurring definition {} has no pending approval",
                id
            ))
        })?;
        self.decide(request_id, Decision::Approve, approval)
    }

    /// `POST /recurring-entries/batch-approve`
    pub fn approve_all(&self, batch: BatchDecisionRequest) -> Result<Vec<BatchItemResult>> {
        self.decide_all(batch, Decision::Approve)
    }

    pub fn decide_all(
        &self,
        batch: BatchDecisionRequest,
        decision: Decision,
    ) -> Result<Vec<BatchItemResult>> {
        self.ensure_writable()?;
        let results = ApprovalService::decide_all(
            &self.ledger,
            &self.config,
            &batch.request_ids,
            decision,
            &batch.approver,
            batch.comments,
            self.now(),
        );
        let items: Vec<BatchItemResult> = results
            .into_iter()
            .map(|(id, result)| BatchItemResult::from_result(id, result))
            .collect();
        if items.iter().any(BatchItemResult::is_ok) {
            self.durable()?;
        }
        Ok(items)
    }
}

fn ensure_schema_support(schema_version: u8) -> Result<()> {
    if schema_version > CURRENT_SCHEMA_VERSION {
        return Err(LedgerError::Storage(format!(
            "ledger schema v{} is newer than supported v{}",
            schema_version, CURRENT_SCHEMA_VERSION
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AccountSelector;
    use crate::core::clock::FixedClock;
    use crate::ledger::AccountNature;
    use crate::storage::JsonStorage;
    use tempfile::tempdir;

    fn manager_in(dir: &std::path::Path) -> LedgerManager {
        let storage = JsonStorage::new(Some(dir.to_path_buf())).unwrap();
        let clock = Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()));
        LedgerManager::open(Box::new(storage), EngineConfig::default(), clock).unwrap()
    }

    fn account(code: &str, name: &str, nature: AccountNature) -> AccountRequest {
        AccountRequest {
            code: code.into(),
            name: name.into(),
            nature,
            parent: None,
        }
    }

    #[test]
    fn state_survives_reopen() {
        let temp = tempdir().unwrap();
        let manager = manager_in(temp.path());
        assert!(manager.load_metadata().created);
        let cash = manager
            .create_account(account("1000", "Cash", AccountNature::Asset))
            .unwrap();
        manager
            .create_account(account("4000", "Revenue", AccountNature::Income))
            .unwrap();
        let request: JournalEntryRequest = serde_json::from_value(serde_json::json!({
            "date": "2024-01-15",
            "createdBy": "clerk",
            "lines": [
                {"account": {"by": "code", "value": "1000"}, "debit": "1000"},
                {"account": {"by": "code", "value": "4000"}, "credit": "1000"}
            ]
        }))
        .unwrap();
        manager.post_journal_entry(request).unwrap();
        drop(manager);

        let reopened = manager_in(temp.path());
        assert!(!reopened.load_metadata().created);
        assert!(reopened.load_metadata().warnings.is_empty());
        assert_eq!(
            reopened.get_balance(cash.id, None).unwrap(),
            Decimal::from(1000)
        );
        assert!(reopened.trial_balance(None).unwrap().balanced);
    }

    #[test]
    fn rejects_future_schema_versions() {
        let temp = tempdir().unwrap();
        let storage = JsonStorage::new(Some(temp.path().to_path_buf())).unwrap();
        let mut snapshot = Ledger::new("general").snapshot();
        snapshot.schema_version = CURRENT_SCHEMA_VERSION + 5;
        storage.save_snapshot("general", &snapshot).unwrap();

        let clock = Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        let err = LedgerManager::open(Box::new(storage), EngineConfig::default(), clock)
            .err()
            .expect("future schema should fail");
        match err {
            LedgerError::Storage(message) => {
                assert!(message.contains("newer"), "unexpected error: {message}");
            }
            other => panic!("expected storage error, got {other:?}"),
        }
    }

    #[test]
    fn child_accounts_resolve_parent_by_code() {
        let temp = tempdir().unwrap();
        let manager = manager_in(temp.path());
        let parent = manager
            .create_account(account("1000", "Current assets", AccountNature::Asset))
            .unwrap();
        let child = manager
            .create_account(AccountRequest {
                parent: Some(AccountSelector::Code("1000".into())),
                ..account("1010", "Cash", AccountNature::Asset)
            })
            .unwrap();
        assert_eq!(child.parent_id, Some(parent.id));
    }

    /// Delegates to a JSON store but refuses saves while `failing` is set.
    struct FlakyStorage {
        inner: JsonStorage,
        failing: Arc<AtomicBool>,
    }

    impl StorageBackend for FlakyStorage {
        fn save_snapshot(&self, name: &str, snapshot: &LedgerSnapshot) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LedgerError::Storage("disk full".into()));
            }
            self.inner.save_snapshot(name, snapshot)
        }

        fn load_snapshot(&self, name: &str) -> Result<Option<LedgerSnapshot>> {
            self.inner.load_snapshot(name)
        }

        fn snapshot_path(&self, name: &str) -> PathBuf {
            self.inner.snapshot_path(name)
        }
    }

    fn cash_sale(amount: &str) -> JournalEntryRequest {
        serde_json::from_value(serde_json::json!({
            "date": "2024-01-15",
            "createdBy": "clerk",
            "lines": [
                {"account": {"by": "code", "value": "1000"}, "debit": amount},
                {"account": {"by": "code", "value": "4000"}, "credit": amount}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn failed_save_reports_not_durable_and_blocks_mutations() {
        let temp = tempdir().unwrap();
        let failing = Arc::new(AtomicBool::new(false));
        let storage = FlakyStorage {
            inner: JsonStorage::new(Some(temp.path().to_path_buf())).unwrap(),
            failing: Arc::clone(&failing),
        };
        let clock = Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()));
        let manager = LedgerManager::open(Box::new(storage), EngineConfig::default(), clock).unwrap();
        let cash = manager
            .create_account(account("1000", "Cash", AccountNature::Asset))
            .unwrap();
        manager
            .create_account(account("4000", "Revenue", AccountNature::Income))
            .unwrap();

        failing.store(true, Ordering::SeqCst);
        let err = manager.post_journal_entry(cash_sale("100")).unwrap_err();
        assert!(matches!(err, LedgerError::NotDurable(_)), "got {err:?}");
        assert!(manager.has_unsaved_changes());
        assert_eq!(manager.get_balance(cash.id, None).unwrap(), Decimal::from(100));

        let err = manager.post_journal_entry(cash_sale("50")).unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)), "got {err:?}");
        assert_eq!(manager.get_balance(cash.id, None).unwrap(), Decimal::from(100));

        failing.store(false, Ordering::SeqCst);
        manager.post_journal_entry(cash_sale("50")).unwrap();
        assert!(!manager.has_unsaved_changes());
        drop(manager);

        let reopened = manager_in(temp.path());
        assert_eq!(
            reopened.get_balance(cash.id, None).unwrap(),
            Decimal::from(150)
        );
    }

    #[test]
    fn approve_recurring_without_pending_request_is_invalid() {
        let temp = tempdir().unwrap();
        let manager = manager_in(temp.path());
        let err = manager
            .approve_recurring(
                Uuid::new_v4(),
                DecisionRequest {
                    approver: "cfo".into(),
                    comments: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
