use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{ApprovalError, LedgerError};
use crate::ledger::ledger::ApprovalStore;
use crate::ledger::{ApprovalRequest, ApprovalSubject, Decision, JournalEntry, Ledger};

use super::journal_service::{JournalService, PostingOptions};
use super::recurrence_service::{OccurrenceOutcome, RecurrenceService};
use super::ServiceResult;

/// What happened to the gated subject once the decision was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "continuation", rename_all = "snake_case")]
pub enum Continuation {
    Posted { entry_id: Uuid },
    Executed { occurrence: OccurrenceOutcome },
    Terminated,
    /// Approved, but the subject could not be posted. The decision stands.
    PostingFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub request: ApprovalRequest,
    pub continuation: Continuation,
}

pub struct ApprovalService;

impl ApprovalService {
    /// Adds a pending request to an already locked store.
    pub fn open(
        store: &mut ApprovalStore,
        subject: ApprovalSubject,
        requested_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> ApprovalRequest {
        let request = ApprovalRequest::new(subject, requested_by, now);
        store.requests.push(request.clone());
        request
    }

    pub fn request_approval(
        ledger: &Ledger,
        subject: ApprovalSubject,
        requested_by: &str,
        now: DateTime<Utc>,
    ) -> ApprovalRequest {
        let request = Self::open(&mut ledger.approvals(), subject, requested_by, now);
        info!(request = %request.id, by = requested_by, "approval requested");
        request
    }

    /// Stores `entry` as a draft and gates its posting behind an approval request.
    pub fn submit_journal_entry(
        ledger: &Ledger,
        entry: JournalEntry,
        options: &PostingOptions,
        now: DateTime<Utc>,
    ) -> ServiceResult<(JournalEntry, ApprovalRequest)> {
        // Draft and request appear together: posting checks the gate under this lock.
        let mut approvals = ledger.approvals();
        let draft = JournalService::record_draft(ledger, entry, options)?;
        let request = Self::open(
            &mut approvals,
            ApprovalSubject::JournalEntry { entry_id: draft.id },
            draft.created_by.clone(),
            now,
        );
        info!(request = %request.id, entry = %draft.id, "journal entry submitted for approval");
        Ok((draft, request))
    }

    pub fn pending(ledger: &Ledger) -> Vec<ApprovalRequest> {
        ledger
            .approvals()
            .requests
            .iter()
            .filter(|request| request.is_pending())
            .cloned()
            .collect()
    }

    pub fn get(ledger: &Ledger, id: Uuid) -> ServiceResult<ApprovalRequest> {
        ledger
            .approvals()
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("approval request {}", id)))
    }

    /// Records a decision, then continues or terminates the gated work.
    pub fn decide(
        ledger: &Ledger,
        config: &EngineConfig,
        request_id: Uuid,
        decision: Decision,
        approver: &str,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> ServiceResult<DecisionOutcome> {
        if !config.is_authorized_approver(approver) {
            warn!(request = %request_id, approver, "unauthorized approval attempt");
            return Err(ApprovalError::Unauthorized {
                approver: approver.to_string(),
            }
            .into());
        }

        let request = {
            let mut approvals = ledger.approvals();
            let request = approvals
                .get_mut(request_id)
                .ok_or_else(|| ApprovalError::InvalidState {
                    request_id,
                    reason: "no such request".into(),
                })?;
            if !request.is_pending() {
                return Err(ApprovalError::InvalidState {
                    request_id,
                    reason: format!("already {:?}", request.status).to_lowercase(),
                }
                .into());
            }
            request.record_decision(decision, approver, comments, now);
            request.clone()
        };
        info!(request = %request_id, ?decision, approver, "approval decided");

        let continuation = match (&request.subject, decision) {
            (ApprovalSubject::JournalEntry { entry_id }, Decision::Approve) => {
                let options = PostingOptions::from_config(config);
                match JournalService::post_draft(ledger, *entry_id, &options, now) {
                    Ok(entry) => Continuation::Posted { entry_id: entry.id },
                    Err(err) => posting_failed(request_id, err),
                }
            }
            (ApprovalSubject::JournalEntry { .. }, Decision::Reject) => Continuation::Terminated,
            (
                ApprovalSubject::RecurringOccurrence {
                    definition_id,
                    scheduled_date,
                    record_id,
                },
                Decision::Approve,
            ) => match RecurrenceService::resume_approved(
                ledger,
                config,
                request_id,
                *definition_id,
                *scheduled_date,
                *record_id,
                now,
            ) {
                Ok(occurrence) => Continuation::Executed { occurrence },
                Err(err) => posting_failed(request_id, err),
            },
            (
                ApprovalSubject::RecurringOccurrence {
                    definition_id,
                    scheduled_date,
                    record_id,
                },
                Decision::Reject,
            ) => match RecurrenceService::reject_occurrence(
                ledger,
                request_id,
                *definition_id,
                *scheduled_date,
                *record_id,
                now,
            ) {
                Ok(()) => Continuation::Terminated,
                Err(err) => {
                    warn!(request = %request_id, error = %err, "rejected occurrence was already resolved");
                    Continuation::Terminated
                }
            },
        };

        Ok(DecisionOutcome {
            request,
            continuation,
        })
    }

    /// Decides each request independently; one failure never blocks the rest.
    pub fn decide_all(
        ledger: &Ledger,
        config: &EngineConfig,
        request_ids: &[Uuid],
        decision: Decision,
        approver: &str,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Vec<(Uuid, ServiceResult<DecisionOutcome>)> {
        request_ids
            .iter()
            .map(|id| {
                let outcome =
                    Self::decide(ledger, config, *id, decision, approver, comments.clone(), now);
                (*id, outcome)
            })
            .collect()
    }

    pub fn approve_all(
        ledger: &Ledger,
        config: &EngineConfig,
        request_ids: &[Uuid],
        approver: &str,
        now: DateTime<Utc>,
    ) -> Vec<(Uuid, ServiceResult<DecisionOutcome>)> {
        Self::decide_all(ledger, config, request_ids, Decision::Approve, approver, None, now)
    }
}

fn posting_failed(request_id: Uuid, err: LedgerError) -> Continuation {
    warn!(request = %request_id, error = %err, "approved subject could not be posted");
    Continuation::PostingFailed {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::services::AccountService;
    use crate::ledger::{AccountNature, ApprovalStatus, JournalLine, JournalStatus};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn setup() -> (Ledger, Uuid, Uuid) {
        let ledger = Ledger::new("Approvals");
        let cash = AccountService::create(&ledger, "1000", "Cash", AccountNature::Asset, None)
            .unwrap()
            .id;
        let capital =
            AccountService::create(&ledger, "3000", "Capital", AccountNature::Equity, None)
                .unwrap()
                .id;
        (ledger, cash, capital)
    }

    fn entry(cash: Uuid, capital: Uuid) -> JournalEntry {
        JournalEntry::draft(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), "clerk")
            .with_line(JournalLine::debit(cash, Decimal::from(500)))
            .with_line(JournalLine::credit(capital, Decimal::from(500)))
    }

    #[test]
    fn approving_a_journal_subject_posts_it() {
        let (ledger, cash, capital) = setup();
        let config = EngineConfig::default();
        let (draft, request) = ApprovalService::submit_journal_entry(
            &ledger,
            entry(cash, capital),
            &PostingOptions::default(),
            Utc::now(),
        )
        .unwrap();
        assert!(
            JournalService::post_draft(&ledger, draft.id, &PostingOptions::default(), Utc::now())
                .is_err()
        );
        let bypass = JournalService::post(&ledger, draft.clone(), &PostingOptions::default(), Utc::now());
        assert!(matches!(bypass, Err(LedgerError::InvalidState(_))));
        assert!(ledger.account_handle(cash).unwrap().lock().rows.is_empty());

        let outcome = ApprovalService::decide(
            &ledger,
            &config,
            request.id,
            Decision::Approve,
            "controller",
            None,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(outcome.request.status, ApprovalStatus::Approved);
        assert_eq!(outcome.continuation, Continuation::Posted { entry_id: draft.id });
        assert_eq!(
            ledger.journal().get(draft.id).unwrap().status,
            JournalStatus::Posted
        );
    }

    #[test]
    fn second_decision_is_invalid() {
        let (ledger, cash, capital) = setup();
        let config = EngineConfig::default();
        let (_, request) = ApprovalService::submit_journal_entry(
            &ledger,
            entry(cash, capital),
            &PostingOptions::default(),
            Utc::now(),
        )
        .unwrap();
        ApprovalService::decide(&ledger, &config, request.id, Decision::Reject, "a", None, Utc::now())
            .unwrap();
        let err = ApprovalService::decide(
            &ledger,
            &config,
            request.id,
            Decision::Approve,
            "a",
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Approval(ApprovalError::InvalidState { .. })
        ));
    }

    #[test]
    fn unauthorized_approver_changes_nothing() {
        let (ledger, cash, capital) = setup();
        let config = EngineConfig {
            authorized_approvers: vec!["cfo".into()],
            ..EngineConfig::default()
        };
        let (_, request) = ApprovalService::submit_journal_entry(
            &ledger,
            entry(cash, capital),
            &PostingOptions::default(),
            Utc::now(),
        )
        .unwrap();
        let err = ApprovalService::decide(
            &ledger,
            &config,
            request.id,
            Decision::Approve,
            "intern",
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Approval(ApprovalError::Unauthorized { .. })
        ));
        assert_eq!(ApprovalService::pending(&ledger).len(), 1);
    }

    #[test]
    fn batch_reports_each_request_independently() {
        let (ledger, cash, capital) = setup();
        let config = EngineConfig::default();
        let (_, first) = ApprovalService::submit_journal_entry(
            &ledger,
            entry(cash, capital),
            &PostingOptions::default(),
            Utc::now(),
        )
        .unwrap();
        let unknown = Uuid::new_v4();
        let results =
            ApprovalService::approve_all(&ledger, &config, &[first.id, unknown], "controller", Utc::now());
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert_eq!(results[1].0, unknown);
    }

    #[test]
    fn decision_stands_when_the_subject_cannot_post() {
        let (ledger, cash, capital) = setup();
        let posted = JournalService::post(
            &ledger,
            entry(cash, capital),
            &PostingOptions::default(),
            Utc::now(),
        )
        .unwrap();
        let request = ApprovalService::request_approval(
            &ledger,
            ApprovalSubject::JournalEntry { entry_id: posted.id },
            "auditor",
            Utc::now(),
        );
        assert!(request.is_pending());

        let outcome = ApprovalService::decide(
            &ledger,
            &EngineConfig::default(),
            request.id,
            Decision::Approve,
            "controller",
            None,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(outcome.request.status, ApprovalStatus::Approved);
        assert!(matches!(outcome.continuation, Continuation::PostingFailed { .. }));
        assert_eq!(ledger.account_handle(cash).unwrap().lock().rows.len(), 1);
    }
}
