use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::flow::{Flow, FlowId, TenantId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProposalAccepted,
    ContractCreated,
    ContractSent,
    ContractSigned,
    InvoiceCreated,
    PaymentReceived,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelled,
    ErrorOccurred,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProposalAccepted => "proposal_accepted",
            Self::ContractCreated => "contract_created",
            Self::ContractSent => "contract_sent",
            Self::ContractSigned => "contract_signed",
            Self::InvoiceCreated => "invoice_created",
            Self::PaymentReceived => "payment_received",
            Self::WorkflowPaused => "workflow_paused",
            Self::WorkflowResumed => "workflow_resumed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::ErrorOccurred => "error_occurred",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "proposal_accepted" => Some(Self::ProposalAccepted),
            "contract_created" => Some(Self::ContractCreated),
            "contract_sent" => Some(Self::ContractSent),
            "contract_signed" => Some(Self::ContractSigned),
            "invoice_created" => Some(Self::InvoiceCreated),
            "payment_received" => Some(Self::PaymentReceived),
            "workflow_paused" => Some(Self::WorkflowPaused),
            "workflow_resumed" => Some(Self::WorkflowResumed),
            "workflow_cancelled" => Some(Self::WorkflowCancelled),
            "error_occurred" => Some(Self::ErrorOccurred),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventData {
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub parameters: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventResult {
    pub success: bool,
    pub payload: Option<Value>,
    pub message: Option<String>,
    pub error_code: Option<String>,
}

/// Immutable audit record for one lifecycle change of a flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub flow_id: FlowId,
    pub event_type: EventType,
    pub status: EventStatus,
    pub title: String,
    pub description: Option<String>,
    pub event_data: EventData,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub processing_duration_ms: Option<u64>,
    pub processed_by: Option<String>,
    pub result: Option<EventResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowEvent {
    /// A completed event for a transition that has already been applied to `flow`.
    pub fn record(
        flow: &Flow,
        event_type: EventType,
        title: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            tenant_id: flow.tenant_id.clone(),
            flow_id: flow.id.clone(),
            event_type,
            status: EventStatus::Completed,
            title: title.into(),
            description: None,
            event_data: EventData::default(),
            scheduled_at: None,
            processed_at: Some(now),
            attempt_count: 0,
            max_attempts: flow.max_attempts,
            last_error: None,
            processing_duration_ms: None,
            processed_by: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Error record written after `flow` has been marked failed.
    pub fn failure(flow: &Flow, error_message: &str, error_code: &str, now: DateTime<Utc>) -> Self {
        let mut event = Self::record(flow, EventType::ErrorOccurred, "Stage execution failed", now);
        event.status = EventStatus::Error;
        event.description = Some(error_message.to_string());
        event.attempt_count = flow.attempt_count;
        event.last_error = Some(error_message.to_string());
        event.event_data = EventData {
            entity_id: Some(flow.id.0.clone()),
            entity_type: Some("flow".to_string()),
            before: None,
            after: Some(json!({
                "status": flow.status.as_str(),
                "stage": flow.current_stage,
                "nextActionAt": flow.next_action_at,
            })),
            parameters: Some(json!({
                "attempt": flow.attempt_count,
                "maxAttempts": flow.max_attempts,
            })),
        };
        event.result = Some(EventResult {
            success: false,
            payload: None,
            message: Some(error_message.to_string()),
            error_code: Some(error_code.to_string()),
        });
        event
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, event_data: EventData) -> Self {
        self.event_data = event_data;
        self
    }

    pub fn with_result(mut self, result: EventResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn processed_by(mut self, actor: impl Into<String>) -> Self {
        self.processed_by = Some(actor.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.processing_duration_ms = Some(duration_ms);
        self
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.status, EventStatus::Completed | EventStatus::Error | EventStatus::Cancelled)
    }
}
