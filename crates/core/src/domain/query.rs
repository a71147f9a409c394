use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow::{Flow, FlowStatus, TenantId};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Sortable columns. Anything outside this list is rejected before it reaches SQL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowSortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    StartedAt,
    CompletedAt,
    NextActionAt,
    FlowNumber,
    Status,
    CurrentStage,
}

impl FlowSortField {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "createdAt" | "created_at" => Some(Self::CreatedAt),
            "updatedAt" | "updated_at" => Some(Self::UpdatedAt),
            "startedAt" | "started_at" => Some(Self::StartedAt),
            "completedAt" | "completed_at" => Some(Self::CompletedAt),
            "nextActionAt" | "next_action_at" => Some(Self::NextActionAt),
            "flowNumber" | "flow_number" => Some(Self::FlowNumber),
            "status" => Some(Self::Status),
            "currentStage" | "current_stage" => Some(Self::CurrentStage),
            _ => None,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::StartedAt => "started_at",
            Self::CompletedAt => "completed_at",
            Self::NextActionAt => "next_action_at",
            Self::FlowNumber => "flow_number",
            Self::Status => "status",
            Self::CurrentStage => "current_stage",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ASC" => Some(Self::Asc),
            "DESC" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<FlowStatus>,
    pub proposal_id: Option<String>,
    pub contract_id: Option<String>,
    pub invoice_id: Option<String>,
    pub current_stage: Option<u32>,
    pub started_from: Option<DateTime<Utc>>,
    pub started_to: Option<DateTime<Utc>>,
    pub completed_from: Option<DateTime<Utc>>,
    pub completed_to: Option<DateTime<Utc>>,
    /// Only flows currently in `failed`.
    pub has_errors: bool,
    /// Only flows whose next action is in the past and that have not completed.
    pub overdue: bool,
}

impl FlowFilter {
    pub fn matches(&self, flow: &Flow, now: DateTime<Utc>) -> bool {
        if let Some(tenant_id) = &self.tenant_id {
            if &flow.tenant_id != tenant_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if flow.status != status {
                return false;
            }
        }
        if !optional_eq(&self.proposal_id, Some(&flow.proposal_id)) {
            return false;
        }
        if !optional_eq(&self.contract_id, flow.contract_id.as_ref()) {
            return false;
        }
        if !optional_eq(&self.invoice_id, flow.invoice_id.as_ref()) {
            return false;
        }
        if let Some(stage) = self.current_stage {
            if flow.current_stage != stage {
                return false;
            }
        }
        if !within(Some(flow.started_at), self.started_from, self.started_to) {
            return false;
        }
        if (self.completed_from.is_some() || self.completed_to.is_some())
            && !within(flow.completed_at, self.completed_from, self.completed_to)
        {
            return false;
        }
        if self.has_errors && flow.status != FlowStatus::Failed {
            return false;
        }
        if self.overdue && !is_overdue(flow, now) {
            return false;
        }
        true
    }
}

pub fn is_overdue(flow: &Flow, now: DateTime<Utc>) -> bool {
    flow.status != FlowStatus::Completed
        && flow.next_action_at.map(|next| next < now).unwrap_or(false)
}

fn optional_eq(expected: &Option<String>, actual: Option<&String>) -> bool {
    match expected {
        Some(expected) => actual == Some(expected),
        None => true,
    }
}

fn within(
    value: Option<DateTime<Utc>>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    let Some(value) = value else {
        return from.is_none() && to.is_none();
    };
    from.map(|from| value >= from).unwrap_or(true) && to.map(|to| value <= to).unwrap_or(true)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowQuery {
    pub filter: FlowFilter,
    pub sort_by: FlowSortField,
    pub direction: SortDirection,
    pub offset: u32,
    pub limit: Option<u32>,
}

impl FlowQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPage {
    pub items: Vec<Flow>,
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsFilter {
    pub tenant_id: Option<TenantId>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

impl StatsFilter {
    pub fn matches(&self, flow: &Flow) -> bool {
        if let Some(tenant_id) = &self.tenant_id {
            if &flow.tenant_id != tenant_id {
                return false;
            }
        }
        within(Some(flow.created_at), self.created_from, self.created_to)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: FlowStatus,
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatistics {
    #[serde(rename = "resumo")]
    pub summary: Vec<StatusCount>,
    #[serde(rename = "totalFlows")]
    pub total_flows: u64,
}

impl FlowStatistics {
    pub fn from_counts(mut summary: Vec<StatusCount>) -> Self {
        summary.retain(|count| count.total > 0);
        summary.sort_by_key(|count| count.status.as_str());
        let total_flows = summary.iter().map(|count| count.total).sum();
        Self { summary, total_flows }
    }

    pub fn count_for(&self, status: FlowStatus) -> u64 {
        self.summary
            .iter()
            .find(|count| count.status == status)
            .map(|count| count.total)
            .unwrap_or(0)
    }
}
