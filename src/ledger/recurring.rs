use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::journal::{EntrySource, JournalEntry, JournalLine};
use super::time_interval::Frequency;
use crate::errors::ExecutionError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntrySide {
    Debit,
    Credit,
}

/// Amount carried by a template line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TemplateAmount {
    Fixed(Decimal),
    /// Resolved from the definition's parameters at execution time.
    Parameter(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateLine {
    pub account_id: Uuid,
    pub side: EntrySide,
    pub amount: TemplateAmount,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_center: Option<String>,
}

impl TemplateLine {
    pub fn fixed(account_id: Uuid, side: EntrySide, amount: Decimal) -> Self {
        Self {
            account_id,
            side,
            amount: TemplateAmount::Fixed(amount),
            description: String::new(),
            cost_center: None,
        }
    }

    pub fn parameter(account_id: Uuid, side: EntrySide, name: impl Into<String>) -> Self {
        Self {
            account_id,
            side,
            amount: TemplateAmount::Parameter(name.into()),
            description: String::new(),
            cost_center: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecurringStatus {
    #[default]
    Active,
    Paused,
    /// Past its end date; kept for history, never scheduled again.
    Dormant,
    /// Retry budget exhausted; needs manual intervention.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurringEntryDefinition {
    pub id: Uuid,
    pub name: String,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub reference: String,
    pub lines: Vec<TemplateLine>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub status: RecurringStatus,
    #[serde(default)]
    pub next_run: Option<NaiveDate>,
    #[serde(default)]
    pub last_run: Option<NaiveDate>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "RecurringEntryDefinition::default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub pending_approval: Option<Uuid>,
    #[serde(default)]
    pub approved_occurrence: Option<NaiveDate>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringEntryDefinition {
    pub fn new(
        name: impl Into<String>,
        frequency: Frequency,
        start_date: NaiveDate,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            frequency,
            start_date,
            end_date: None,
            reference: String::new(),
            lines: Vec::new(),
            parameters: BTreeMap::new(),
            status: RecurringStatus::Active,
            next_run: Some(start_date),
            last_run: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            approval_required: false,
            pending_approval: None,
            approved_occurrence: None,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_line(mut self, line: TemplateLine) -> Self {
        self.lines.push(line);
        self
    }

    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn default_max_retries() -> u32 {
        DEFAULT_MAX_RETRIES
    }

    pub fn is_active(&self) -> bool {
        self.status == RecurringStatus::Active
    }

    pub fn has_outstanding_failure(&self) -> bool {
        self.retry_count > 0
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Due on `today` when active, scheduled on or before `today`, and not parked on a
    /// failure or an open approval.
    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.is_active()
            && !self.has_outstanding_failure()
            && self.pending_approval.is_none()
            && self.next_run.is_some_and(|next| next <= today)
    }

    /// Next scheduled run strictly after `from`, or `None` once past the end date.
    pub fn compute_next_run(&self, from: NaiveDate) -> Option<NaiveDate> {
        let candidate = self.frequency.next_after(self.start_date, from);
        match self.end_date {
            Some(end) if candidate > end => None,
            _ => Some(candidate),
        }
    }

    /// First occurrence: the start date itself, unless it already lies past the end date.
    pub fn compute_next_run_from_start(&self) -> Option<NaiveDate> {
        match self.end_date {
            Some(end) if self.start_date > end => None,
            _ => Some(self.start_date),
        }
    }

    /// Moves the schedule past `completed`, turning the definition dormant at its end.
    pub fn advance_from(&mut self, completed: NaiveDate) {
        self.next_run = self.compute_next_run(completed);
        self.approved_occurrence = None;
        if self.next_run.is_none() && self.status == RecurringStatus::Active {
            self.status = RecurringStatus::Dormant;
        }
        self.updated_at = Utc::now();
    }

    /// Builds the draft journal entry for the occurrence scheduled on `scheduled_date`.
    pub fn materialize(
        &self,
        scheduled_date: NaiveDate,
    ) -> Result<JournalEntry, ExecutionError> {
        let mut entry = JournalEntry::draft(scheduled_date, format!("recurring:{}", self.name))
            .with_reference(if self.reference.is_empty() {
                format!("REC-{}", scheduled_date.format("%Y%m%d"))
            } else {
                self.reference.clone()
            })
            .with_description(self.name.clone())
            .with_source(EntrySource::Recurring {
                definition_id: self.id,
                scheduled_date,
            });
        for (index, template) in self.lines.iter().enumerate() {
            let amount = self.resolve_amount(index, &template.amount)?;
            let mut line = match template.side {
                EntrySide::Debit => JournalLine::debit(template.account_id, amount),
                EntrySide::Credit => JournalLine::credit(template.account_id, amount),
            }
            .with_description(template.description.clone());
            line.cost_center = template.cost_center.clone();
            entry.lines.push(line);
        }
        Ok(entry)
    }

    fn resolve_amount(
        &self,
        line: usize,
        amount: &TemplateAmount,
    ) -> Result<Decimal, ExecutionError> {
        match amount {
            TemplateAmount::Fixed(value) => Ok(*value),
            TemplateAmount::Parameter(name) => {
                self.parameters
                    .get(name)
                    .copied()
                    .ok_or_else(|| ExecutionError::TemplateResolution {
                        line,
                        reason: format!("parameter `{}` has no value", name),
                    })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    AwaitingApproval,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Rejected,
}

/// One attempt at a scheduled occurrence. Append-only once terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurringExecutionRecord {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub scheduled_date: NaiveDate,
    pub run_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_entry_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub attempt: u32,
}

impl RecurringExecutionRecord {
    pub fn new(
        definition_id: Uuid,
        scheduled_date: NaiveDate,
        status: ExecutionStatus,
        attempt: u32,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id,
            scheduled_date,
            run_at,
            status,
            journal_entry_id: None,
            failure: None,
            attempt,
        }
    }
}
