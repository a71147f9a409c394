use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::flows::backoff::BackoffPolicy;

pub const TOTAL_STAGES: u32 = 6;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const INITIAL_ACTION_DELAY_MINUTES: i64 = 5;
pub const RESUME_DELAY_MINUTES: i64 = 5;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    ProposalAccepted,
    ContractGenerated,
    ContractSent,
    ContractSigned,
    InvoiceGenerated,
    PaymentProcessed,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

/// Statuses the due-flow scanner picks up on its own.
pub const SCANNABLE_STATUSES: [FlowStatus; 5] = [
    FlowStatus::ProposalAccepted,
    FlowStatus::ContractGenerated,
    FlowStatus::ContractSent,
    FlowStatus::ContractSigned,
    FlowStatus::InvoiceGenerated,
];

impl FlowStatus {
    pub const ALL: [FlowStatus; 10] = [
        Self::ProposalAccepted,
        Self::ContractGenerated,
        Self::ContractSent,
        Self::ContractSigned,
        Self::InvoiceGenerated,
        Self::PaymentProcessed,
        Self::Completed,
        Self::Failed,
        Self::Paused,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProposalAccepted => "proposal_accepted",
            Self::ContractGenerated => "contract_generated",
            Self::ContractSent => "contract_sent",
            Self::ContractSigned => "contract_signed",
            Self::InvoiceGenerated => "invoice_generated",
            Self::PaymentProcessed => "payment_processed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proposal_accepted" => Some(Self::ProposalAccepted),
            "contract_generated" => Some(Self::ContractGenerated),
            "contract_sent" => Some(Self::ContractSent),
            "contract_signed" => Some(Self::ContractSigned),
            "invoice_generated" => Some(Self::InvoiceGenerated),
            "payment_processed" => Some(Self::PaymentProcessed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Status a flow sitting at `stage` is in while it waits for that stage to run.
    pub fn for_stage(stage: u32) -> Option<Self> {
        match stage {
            1 => Some(Self::ProposalAccepted),
            2 => Some(Self::ContractGenerated),
            3 => Some(Self::ContractSent),
            4 => Some(Self::ContractSigned),
            5 => Some(Self::InvoiceGenerated),
            6 => Some(Self::PaymentProcessed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage toggles read by the stage executors. Opaque to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowConfig {
    pub auto_email: bool,
    pub auto_contract: bool,
    pub auto_invoice: bool,
    pub recurring_billing: bool,
    pub interval_days: u32,
    pub contract_template_id: Option<String>,
    pub email_template_id: Option<String>,
    pub invoice_template_id: Option<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            auto_email: true,
            auto_contract: true,
            auto_invoice: true,
            recurring_billing: false,
            interval_days: 30,
            contract_template_id: None,
            email_template_id: None,
            invoice_template_id: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfigPatch {
    pub auto_email: Option<bool>,
    pub auto_contract: Option<bool>,
    pub auto_invoice: Option<bool>,
    pub recurring_billing: Option<bool>,
    pub interval_days: Option<u32>,
    pub contract_template_id: Option<String>,
    pub email_template_id: Option<String>,
    pub invoice_template_id: Option<String>,
}

impl FlowConfig {
    pub fn merged(mut self, patch: FlowConfigPatch) -> Self {
        if let Some(value) = patch.auto_email {
            self.auto_email = value;
        }
        if let Some(value) = patch.auto_contract {
            self.auto_contract = value;
        }
        if let Some(value) = patch.auto_invoice {
            self.auto_invoice = value;
        }
        if let Some(value) = patch.recurring_billing {
            self.recurring_billing = value;
        }
        if let Some(value) = patch.interval_days {
            self.interval_days = value;
        }
        if let Some(value) = patch.contract_template_id {
            self.contract_template_id = Some(value);
        }
        if let Some(value) = patch.email_template_id {
            self.email_template_id = Some(value);
        }
        if let Some(value) = patch.invoice_template_id {
            self.invoice_template_id = Some(value);
        }
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowMetadata {
    pub client_id: Option<String>,
    pub owner_id: Option<String>,
    pub total_amount: Option<Decimal>,
    pub currency: Option<String>,
    pub delivery_terms: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: FlowId,
    pub tenant_id: TenantId,
    pub flow_number: String,
    pub proposal_id: String,
    pub contract_id: Option<String>,
    pub invoice_id: Option<String>,
    pub status: FlowStatus,
    pub current_stage: u32,
    pub total_stages: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_action_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub config: FlowConfig,
    pub metadata: FlowMetadata,
    pub notes: Option<String>,
    pub last_error: Option<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to open a flow for an accepted proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowDraft {
    pub tenant_id: TenantId,
    pub proposal_id: String,
    pub flow_number: String,
    pub config: FlowConfig,
    pub metadata: FlowMetadata,
    pub max_attempts: u32,
}

/// Partial edit applied through the update API.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowUpdate {
    pub status: Option<FlowStatus>,
    pub current_stage: Option<u32>,
    pub config: Option<FlowConfigPatch>,
    pub metadata: Option<FlowMetadata>,
    pub notes: Option<String>,
    pub max_attempts: Option<u32>,
    pub next_action_at: Option<DateTime<Utc>>,
}

pub fn format_flow_number(year: i32, sequence: u32) -> String {
    format!("FL{year}{sequence:06}")
}

impl Flow {
    pub fn start(draft: FlowDraft, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let proposal_id = draft.proposal_id.trim();
        if proposal_id.is_empty() {
            return Err(DomainError::Validation("proposalId is required".to_string()));
        }
        if draft.tenant_id.0.trim().is_empty() {
            return Err(DomainError::Validation("tenantId is required".to_string()));
        }
        if draft.max_attempts == 0 {
            return Err(DomainError::Validation(
                "maxAttempts must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            id: FlowId::generate(),
            tenant_id: draft.tenant_id,
            flow_number: draft.flow_number,
            proposal_id: proposal_id.to_string(),
            contract_id: None,
            invoice_id: None,
            status: FlowStatus::ProposalAccepted,
            current_stage: 1,
            total_stages: TOTAL_STAGES,
            started_at: now,
            completed_at: None,
            next_action_at: None,
            attempt_count: 0,
            max_attempts: draft.max_attempts,
            config: draft.config,
            metadata: draft.metadata,
            notes: None,
            last_error: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn can_process(&self) -> bool {
        !matches!(self.status, FlowStatus::Completed | FlowStatus::Cancelled | FlowStatus::Paused)
            && self.attempt_count < self.max_attempts
    }

    pub fn advance_stage(&mut self) {
        if self.current_stage < self.total_stages {
            self.current_stage += 1;
        }
    }

    pub fn reset_attempts(&mut self) {
        self.attempt_count = 0;
    }

    pub fn schedule_next_action(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.next_action_at = Some(now + delay);
        self.updated_at = now;
    }

    /// Idempotent: `completed_at` keeps the first completion time.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = FlowStatus::Completed;
        self.current_stage = self.total_stages;
        self.completed_at.get_or_insert(now);
        self.next_action_at = None;
        self.updated_at = now;
    }

    pub fn mark_failed(
        &mut self,
        error_message: impl Into<String>,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) {
        self.status = FlowStatus::Failed;
        self.last_error = Some(error_message.into());
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.next_action_at = Some(backoff.next_attempt_at(
            self.attempt_count,
            self.max_attempts,
            now,
        ));
        self.updated_at = now;
    }

    /// Returns the status the flow had before it was paused.
    pub fn pause(
        &mut self,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FlowStatus, DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition {
                status: self.status,
                operation: "pause",
            });
        }

        let previous = self.status;
        self.status = FlowStatus::Paused;
        self.append_note("PAUSED", reason, now);
        self.updated_at = now;
        Ok(previous)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != FlowStatus::Paused {
            return Err(DomainError::InvalidStateTransition {
                status: self.status,
                operation: "resume",
            });
        }

        let status = FlowStatus::for_stage(self.current_stage).ok_or_else(|| {
            DomainError::Validation(format!(
                "currentStage {} is outside 1..={}",
                self.current_stage, self.total_stages
            ))
        })?;

        self.status = status;
        self.schedule_next_action(Duration::minutes(RESUME_DELAY_MINUTES), now);
        Ok(())
    }

    pub fn cancel(&mut self, reason: Option<&str>, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status == FlowStatus::Completed {
            return Err(DomainError::InvalidStateTransition {
                status: self.status,
                operation: "cancel",
            });
        }

        self.status = FlowStatus::Cancelled;
        self.completed_at.get_or_insert(now);
        self.next_action_at = None;
        self.append_note("CANCELLED", reason, now);
        self.updated_at = now;
        Ok(())
    }

    pub fn apply_update(&mut self, update: FlowUpdate, now: DateTime<Utc>) -> Result<(), DomainError> {
        if let Some(stage) = update.current_stage {
            if stage == 0 || stage > self.total_stages {
                return Err(DomainError::Validation(format!(
                    "currentStage must be in range 1..={}, got {stage}",
                    self.total_stages
                )));
            }
        }
        if update.max_attempts == Some(0) {
            return Err(DomainError::Validation(
                "maxAttempts must be greater than zero".to_string(),
            ));
        }
        let resulting_status = update.status.unwrap_or(self.status);
        if resulting_status.is_terminal() && update.next_action_at.is_some() {
            return Err(DomainError::Validation(format!(
                "nextActionAt cannot be set on a {} flow",
                resulting_status.as_str()
            )));
        }

        if let Some(stage) = update.current_stage {
            self.current_stage = stage;
        }
        if let Some(max_attempts) = update.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(patch) = update.config {
            self.config = self.config.clone().merged(patch);
        }
        if let Some(metadata) = update.metadata {
            self.metadata = metadata;
        }
        if let Some(notes) = update.notes {
            self.notes = Some(notes);
        }
        if let Some(next_action_at) = update.next_action_at {
            self.next_action_at = Some(next_action_at);
        }
        if let Some(status) = update.status {
            self.status = status;
            if status.is_terminal() {
                self.completed_at.get_or_insert(now);
                self.next_action_at = None;
            }
        }

        self.updated_at = now;
        Ok(())
    }

    fn append_note(&mut self, label: &str, reason: Option<&str>, now: DateTime<Utc>) {
        let Some(reason) = reason.map(str::trim).filter(|reason| !reason.is_empty()) else {
            return;
        };

        let line = format!("[{}] {label}: {reason}", now.to_rfc3339_opts(SecondsFormat::Secs, true));
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{line}"),
            _ => line,
        });
    }
}
