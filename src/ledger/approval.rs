use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an approval request gates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalSubject {
    JournalEntry {
        entry_id: Uuid,
    },
    RecurringOccurrence {
        definition_id: Uuid,
        scheduled_date: NaiveDate,
        record_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub subject: ApprovalSubject,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

impl ApprovalRequest {
    pub fn new(
        subject: ApprovalSubject,
        requested_by: impl Into<String>,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            requested_by: requested_by.into(),
            requested_at,
            status: ApprovalStatus::Pending,
            approver: None,
            decided_at: None,
            comments: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Records a decision. Callers check `is_pending` first.
    pub fn record_decision(
        &mut self,
        decision: Decision,
        approver: impl Into<String>,
        comments: Option<String>,
        decided_at: DateTime<Utc>,
    ) {
        self.status = match decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        };
        self.approver = Some(approver.into());
        self.comments = comments;
        self.decided_at = Some(decided_at);
    }
}
