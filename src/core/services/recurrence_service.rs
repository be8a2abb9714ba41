use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{ExecutionError, LedgerError, ValidationError};
use crate::ledger::ledger::RecurringStore;
use crate::ledger::{
    ApprovalSubject, Decision, ExecutionStatus, Ledger, RecurringEntryDefinition,
    RecurringExecutionRecord, RecurringStatus, TemplateAmount,
};

use super::approval_service::ApprovalService;
use super::journal_service::{JournalService, LiveDirectory, PostingOptions};
use super::ServiceResult;

/// Result of trying to run one scheduled occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OccurrenceOutcome {
    Posted {
        definition_id: Uuid,
        scheduled_date: NaiveDate,
        entry_id: Uuid,
    },
    AwaitingApproval {
        definition_id: Uuid,
        scheduled_date: NaiveDate,
        request_id: Uuid,
    },
    Failed {
        definition_id: Uuid,
        scheduled_date: NaiveDate,
        reason: String,
        retry_count: u32,
        exhausted: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// No failure outstanding; nothing was posted.
    NothingToRetry,
    /// The occurrence already succeeded; the existing entry is returned.
    AlreadyPosted { entry_id: Option<Uuid> },
    Executed(OccurrenceOutcome),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcomes: Vec<OccurrenceOutcome>,
}

impl RunReport {
    pub fn posted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, OccurrenceOutcome::Posted { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, OccurrenceOutcome::Failed { .. }))
            .count()
    }
}

/// A definition whose current occurrence failed and awaits a retry or intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedExecution {
    pub definition_id: Uuid,
    pub name: String,
    pub scheduled_date: NaiveDate,
    pub retry_count: u32,
    pub max_retries: u32,
    pub exhausted: bool,
    pub last_failure: Option<String>,
    pub failed_at: DateTime<Utc>,
}

pub struct RecurrenceService;

impl RecurrenceService {
    pub fn create(
        ledger: &Ledger,
        config: &EngineConfig,
        mut definition: RecurringEntryDefinition,
        now: DateTime<Utc>,
    ) -> ServiceResult<RecurringEntryDefinition> {
        Self::validate_definition(ledger, config, &definition)?;
        definition.status = RecurringStatus::Active;
        definition.retry_count = 0;
        definition.pending_approval = None;
        definition.approved_occurrence = None;
        definition.last_run = None;
        definition.next_run = definition.compute_next_run_from_start();
        if definition.next_run.is_none() {
            definition.status = RecurringStatus::Dormant;
        }
        definition.created_at = now;
        definition.updated_at = now;

        let mut store = ledger.recurring();
        if store.definitions.contains_key(&definition.id) {
            return Err(LedgerError::InvalidState(format!(
                "recurring definition {} already exists",
                definition.id
            )));
        }
        store.definitions.insert(definition.id, definition.clone());
        info!(
            definition = %definition.id,
            name = %definition.name,
            frequency = definition.frequency.label(),
            next_run = ?definition.next_run,
            "recurring definition created"
        );
        Ok(definition)
    }

    /// Replaces the template and schedule of an existing definition.
    pub fn update(
        ledger: &Ledger,
        config: &EngineConfig,
        id: Uuid,
        changes: RecurringEntryDefinition,
        now: DateTime<Utc>,
    ) -> ServiceResult<RecurringEntryDefinition> {
        Self::validate_definition(ledger, config, &changes)?;
        let mut store = ledger.recurring();
        let definition = store
            .definitions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        if definition.pending_approval.is_some() {
            return Err(ExecutionError::AwaitingApproval(id).into());
        }

        definition.name = changes.name;
        definition.frequency = changes.frequency;
        definition.start_date = changes.start_date;
        definition.end_date = changes.end_date;
        definition.reference = changes.reference;
        definition.lines = changes.lines;
        definition.parameters = changes.parameters;
        definition.max_retries = changes.max_retries;
        definition.approval_required = changes.approval_required;
        definition.approved_occurrence = None;
        definition.next_run = match definition.last_run {
            Some(last) => definition.compute_next_run(last),
            None => definition.compute_next_run_from_start(),
        };
        match (definition.status, definition.next_run) {
            (RecurringStatus::Active, None) => definition.status = RecurringStatus::Dormant,
            (RecurringStatus::Dormant, Some(_)) => definition.status = RecurringStatus::Active,
            _ => {}
        }
        definition.updated_at = now;
        info!(definition = %id, next_run = ?definition.next_run, "recurring definition updated");
        Ok(definition.clone())
    }

    pub fn set_paused(
        ledger: &Ledger,
        id: Uuid,
        paused: bool,
        now: DateTime<Utc>,
    ) -> ServiceResult<RecurringEntryDefinition> {
        let mut store = ledger.recurring();
        let definition = store
            .definitions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        definition.status = match (definition.status, paused) {
            (RecurringStatus::Active, true) | (RecurringStatus::Paused, true) => RecurringStatus::Paused,
            (RecurringStatus::Paused, false) | (RecurringStatus::Active, false) => RecurringStatus::Active,
            (status, _) => {
                return Err(LedgerError::InvalidState(format!(
                    "recurring definition {} is {:?} and cannot be paused or resumed",
                    id, status
                )))
            }
        };
        definition.updated_at = now;
        info!(definition = %id, paused, "recurring definition pause state changed");
        Ok(definition.clone())
    }

    /// Manual intervention after retries were exhausted: back to active, counter reset.
    pub fn reactivate(
        ledger: &Ledger,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> ServiceResult<RecurringEntryDefinition> {
        let mut store = ledger.recurring();
        let definition = store
            .definitions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        if definition.next_run.is_none() {
            return Err(ExecutionError::Dormant(id).into());
        }
        if definition.status == RecurringStatus::Active && definition.retry_count == 0 {
            return Err(LedgerError::InvalidState(format!(
                "recurring definition {} is already active",
                id
            )));
        }
        definition.status = RecurringStatus::Active;
        definition.retry_count = 0;
        definition.updated_at = now;
        info!(definition = %id, "recurring definition reactivated");
        Ok(definition.clone())
    }

    pub fn set_parameters(
        ledger: &Ledger,
        config: &EngineConfig,
        id: Uuid,
        parameters: BTreeMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> ServiceResult<RecurringEntryDefinition> {
        let mut candidate = Self::get(ledger, id)?;
        candidate.parameters = parameters;
        Self::validate_definition(ledger, config, &candidate)?;

        let mut store = ledger.recurring();
        let definition = store
            .definitions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        definition.parameters = candidate.parameters;
        definition.updated_at = now;
        debug!(definition = %id, "recurring parameters replaced");
        Ok(definition.clone())
    }

    pub fn get(ledger: &Ledger, id: Uuid) -> ServiceResult<RecurringEntryDefinition> {
        ledger
            .recurring()
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))
    }

    pub fn list(ledger: &Ledger) -> Vec<RecurringEntryDefinition> {
        ledger.recurring().definitions.values().cloned().collect()
    }

    pub fn history(ledger: &Ledger, id: Uuid) -> Vec<RecurringExecutionRecord> {
        ledger
            .recurring()
            .records
            .iter()
            .filter(|record| record.definition_id == id)
            .cloned()
            .collect()
    }

    /// Runs every occurrence due on or before `now`'s date.
    pub fn run_due(ledger: &Ledger, config: &EngineConfig, now: DateTime<Utc>) -> RunReport {
        let today = now.date_naive();
        let mut store = ledger.recurring();
        let ids: Vec<Uuid> = store.definitions.keys().copied().collect();
        let mut report = RunReport::default();

        for id in ids {
            loop {
                let due = store
                    .definitions
                    .get(&id)
                    .filter(|definition| definition.is_due(today))
                    .and_then(|definition| definition.next_run);
                let Some(scheduled_date) = due else { break };

                match Self::start_occurrence(ledger, &mut store, config, id, scheduled_date, now) {
                    Ok(outcome) => {
                        let posted = matches!(outcome, OccurrenceOutcome::Posted { .. });
                        report.outcomes.push(outcome);
                        if !posted {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(definition = %id, %scheduled_date, error = %err, "recurring occurrence could not start");
                        break;
                    }
                }
            }
        }

        info!(
            %today,
            posted = report.posted(),
            failed = report.failed(),
            total = report.outcomes.len(),
            "recurring run finished"
        );
        report
    }

    /// Re-attempts the failed occurrence without advancing the schedule.
    pub fn retry(
        ledger: &Ledger,
        config: &EngineConfig,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> ServiceResult<RetryOutcome> {
        let mut store = ledger.recurring();
        let definition = store
            .definitions
            .get(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        if definition.status == RecurringStatus::Failed {
            return Err(ExecutionError::RetriesExhausted(id).into());
        }
        if !definition.has_outstanding_failure() {
            debug!(definition = %id, "retry requested with no outstanding failure");
            return Ok(RetryOutcome::NothingToRetry);
        }
        let Some(scheduled_date) = definition.next_run else {
            return Err(ExecutionError::Dormant(id).into());
        };
        if definition.pending_approval.is_some() {
            return Err(ExecutionError::AwaitingApproval(id).into());
        }

        if let Some(done) = store.records.iter().find(|record| {
            record.definition_id == id
                && record.scheduled_date == scheduled_date
                && record.status == ExecutionStatus::Succeeded
        }) {
            warn!(definition = %id, %scheduled_date, "occurrence already posted, retry ignored");
            return Ok(RetryOutcome::AlreadyPosted {
                entry_id: done.journal_entry_id,
            });
        }

        let outcome = Self::start_occurrence(ledger, &mut store, config, id, scheduled_date, now)?;
        Ok(RetryOutcome::Executed(outcome))
    }

    /// Advances past the next occurrence without posting it.
    pub fn skip_next(
        ledger: &Ledger,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> ServiceResult<RecurringExecutionRecord> {
        let mut store = ledger.recurring();
        let (scheduled_date, pending) = {
            let definition = store
                .definitions
                .get(&id)
                .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
            let scheduled_date = definition.next_run.ok_or(ExecutionError::Dormant(id))?;
            (scheduled_date, definition.pending_approval)
        };

        if let Some(request_id) = pending {
            let mut approvals = ledger.approvals();
            if let Some(request) = approvals.get_mut(request_id) {
                if request.is_pending() {
                    request.record_decision(
                        Decision::Reject,
                        "system",
                        Some("occurrence skipped".into()),
                        now,
                    );
                    info!(request = %request_id, "pending approval rejected by skip");
                }
            }
        }

        let awaiting = store.records.iter().position(|record| {
            record.definition_id == id
                && record.scheduled_date == scheduled_date
                && record.status == ExecutionStatus::AwaitingApproval
        });
        let record = match awaiting {
            Some(index) => {
                let record = &mut store.records[index];
                record.status = ExecutionStatus::Skipped;
                record.run_at = now;
                record.clone()
            }
            None => {
                let record = RecurringExecutionRecord::new(
                    id,
                    scheduled_date,
                    ExecutionStatus::Skipped,
                    0,
                    now,
                );
                store.records.push(record.clone());
                record
            }
        };

        if let Some(definition) = store.definitions.get_mut(&id) {
            definition.pending_approval = None;
            definition.retry_count = 0;
            definition.advance_from(scheduled_date);
            info!(definition = %id, %scheduled_date, next_run = ?definition.next_run, "occurrence skipped");
        }
        Ok(record)
    }

    /// Continues an occurrence after its approval request was approved.
    pub fn resume_approved(
        ledger: &Ledger,
        config: &EngineConfig,
        request_id: Uuid,
        definition_id: Uuid,
        scheduled_date: NaiveDate,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> ServiceResult<OccurrenceOutcome> {
        let mut store = ledger.recurring();
        let definition = store.definitions.get_mut(&definition_id).ok_or_else(|| {
            LedgerError::NotFound(format!("recurring definition {}", definition_id))
        })?;
        if definition.pending_approval != Some(request_id) {
            return Err(LedgerError::InvalidState(format!(
                "occurrence {} of {} is no longer awaiting this approval",
                scheduled_date, definition_id
            )));
        }
        definition.pending_approval = None;
        definition.approved_occurrence = Some(scheduled_date);
        Self::attempt(
            ledger,
            &mut store,
            config,
            definition_id,
            scheduled_date,
            Some(record_id),
            now,
        )
    }

    /// Terminates an occurrence whose approval was rejected. The retry counter is untouched.
    pub fn reject_occurrence(
        ledger: &Ledger,
        request_id: Uuid,
        definition_id: Uuid,
        scheduled_date: NaiveDate,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let mut store = ledger.recurring();
        let definition = store.definitions.get_mut(&definition_id).ok_or_else(|| {
            LedgerError::NotFound(format!("recurring definition {}", definition_id))
        })?;
        if definition.pending_approval != Some(request_id) {
            return Err(LedgerError::InvalidState(format!(
                "occurrence {} of {} is no longer awaiting this approval",
                scheduled_date, definition_id
            )));
        }
        definition.pending_approval = None;
        definition.advance_from(scheduled_date);
        info!(definition = %definition_id, %scheduled_date, next_run = ?definition.next_run, "occurrence rejected");

        if let Some(record) = store.record_mut(record_id) {
            record.status = ExecutionStatus::Rejected;
            record.run_at = now;
        }
        Ok(())
    }

    /// Definitions whose current occurrence failed, latest failure first.
    pub fn failed_executions(ledger: &Ledger) -> Vec<FailedExecution> {
        let store = ledger.recurring();
        let mut failed: Vec<FailedExecution> = store
            .definitions
            .values()
            .filter(|definition| definition.has_outstanding_failure())
            .filter_map(|definition| {
                let scheduled_date = definition.next_run?;
                let last = store.records.iter().rev().find(|record| {
                    record.definition_id == definition.id
                        && record.scheduled_date == scheduled_date
                        && record.status == ExecutionStatus::Failed
                })?;
                Some(FailedExecution {
                    definition_id: definition.id,
                    name: definition.name.clone(),
                    scheduled_date,
                    retry_count: definition.retry_count,
                    max_retries: definition.max_retries,
                    exhausted: definition.status == RecurringStatus::Failed,
                    last_failure: last.failure.clone(),
                    failed_at: last.run_at,
                })
            })
            .collect();
        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        failed
    }

    fn start_occurrence(
        ledger: &Ledger,
        store: &mut RecurringStore,
        config: &EngineConfig,
        id: Uuid,
        scheduled_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> ServiceResult<OccurrenceOutcome> {
        let definition = store
            .definitions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        if !definition.approval_required || definition.approved_occurrence == Some(scheduled_date) {
            return Self::attempt(ledger, store, config, id, scheduled_date, None, now);
        }

        let record = RecurringExecutionRecord::new(
            id,
            scheduled_date,
            ExecutionStatus::AwaitingApproval,
            definition.retry_count + 1,
            now,
        );
        let request = ApprovalService::open(
            &mut ledger.approvals(),
            ApprovalSubject::RecurringOccurrence {
                definition_id: id,
                scheduled_date,
                record_id: record.id,
            },
            format!("recurring:{}", definition.name),
            now,
        );
        definition.pending_approval = Some(request.id);
        definition.updated_at = now;
        store.records.push(record);
        info!(definition = %id, %scheduled_date, request = %request.id, "occurrence awaiting approval");
        Ok(OccurrenceOutcome::AwaitingApproval {
            definition_id: id,
            scheduled_date,
            request_id: request.id,
        })
    }

    /// Materializes, validates, and posts one occurrence, recording the outcome.
    fn attempt(
        ledger: &Ledger,
        store: &mut RecurringStore,
        config: &EngineConfig,
        id: Uuid,
        scheduled_date: NaiveDate,
        record_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> ServiceResult<OccurrenceOutcome> {
        let options = PostingOptions::from_config(config).with_deadline(config.execution_deadline());
        let definition = store
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        let attempt = definition.retry_count + 1;

        let record_id = match record_id.and_then(|record_id| store.record_mut(record_id)) {
            Some(record) => {
                record.status = ExecutionStatus::Running;
                record.attempt = attempt;
                record.run_at = now;
                record.id
            }
            None => {
                let record = RecurringExecutionRecord::new(
                    id,
                    scheduled_date,
                    ExecutionStatus::Running,
                    attempt,
                    now,
                );
                let record_id = record.id;
                store.records.push(record);
                record_id
            }
        };

        let result = definition
            .materialize(scheduled_date)
            .map_err(LedgerError::from)
            .and_then(|entry| {
                JournalService::post(ledger, entry, &options, now).map_err(downstream_failure)
            });

        let (status, entry_id, failure) = match &result {
            Ok(entry) => (ExecutionStatus::Succeeded, Some(entry.id), None),
            Err(err) => (ExecutionStatus::Failed, None, Some(err.to_string())),
        };
        if let Some(record) = store.record_mut(record_id) {
            record.status = status;
            record.journal_entry_id = entry_id;
            record.failure = failure;
        }

        let definition = store
            .definitions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("recurring definition {}", id)))?;
        definition.updated_at = now;
        match result {
            Ok(entry) => {
                definition.retry_count = 0;
                definition.last_run = Some(scheduled_date);
                definition.advance_from(scheduled_date);
                info!(
                    definition = %id,
                    %scheduled_date,
                    entry = %entry.id,
                    next_run = ?definition.next_run,
                    "recurring occurrence posted"
                );
                Ok(OccurrenceOutcome::Posted {
                    definition_id: id,
                    scheduled_date,
                    entry_id: entry.id,
                })
            }
            Err(err) => {
                definition.retry_count += 1;
                let exhausted = definition.retries_exhausted();
                if exhausted {
                    definition.status = RecurringStatus::Failed;
                    error!(
                        definition = %id,
                        %scheduled_date,
                        attempts = definition.retry_count,
                        error = %err,
                        "recurring definition failed, retries exhausted"
                    );
                } else {
                    warn!(
                        definition = %id,
                        %scheduled_date,
                        attempt,
                        error = %err,
                        "recurring occurrence failed"
                    );
                }
                Ok(OccurrenceOutcome::Failed {
                    definition_id: id,
                    scheduled_date,
                    reason: err.to_string(),
                    retry_count: definition.retry_count,
                    exhausted,
                })
            }
        }
    }

    fn validate_definition(
        ledger: &Ledger,
        config: &EngineConfig,
        definition: &RecurringEntryDefinition,
    ) -> ServiceResult<()> {
        if definition.name.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "recurring definition name is required".into(),
            ));
        }
        if let Some(end) = definition.end_date {
            if end < definition.start_date {
                return Err(LedgerError::InvalidInput(format!(
                    "end date {} precedes start date {}",
                    end, definition.start_date
                )));
            }
        }
        if definition.max_retries == 0 {
            return Err(LedgerError::InvalidInput(
                "max_retries must be at least 1".into(),
            ));
        }
        if definition.lines.len() < 2 {
            return Err(ValidationError::EmptyEntry {
                lines: definition.lines.len(),
            }
            .into());
        }
        for (index, line) in definition.lines.iter().enumerate() {
            if let TemplateAmount::Fixed(amount) = line.amount {
                if amount < Decimal::ZERO {
                    return Err(ValidationError::NegativeAmount { line: index }.into());
                }
                if amount.is_zero() {
                    return Err(ValidationError::AmbiguousLine { line: index }.into());
                }
            }
        }

        let directory = LiveDirectory(ledger);
        match definition.materialize(definition.start_date) {
            Ok(mut entry) => {
                JournalService::normalize(&mut entry, config.currency_scale);
                JournalService::validate(&entry, &directory, config.balance_epsilon)?;
            }
            // Parameters may be supplied later; only the accounts can be checked now.
            Err(_) => {
                for (index, line) in definition.lines.iter().enumerate() {
                    JournalService::check_account(&directory, index, line.account_id)?;
                }
            }
        }
        Ok(())
    }
}

/// Validation and concurrency failures keep their own kind; anything else the poster
/// reports (holds, state conflicts) is a downstream failure of the run.
fn downstream_failure(err: LedgerError) -> LedgerError {
    match err {
        LedgerError::Validation(_) | LedgerError::Concurrency(_) => err,
        other => ExecutionError::Downstream(other.to_string()).into(),
    }
}
