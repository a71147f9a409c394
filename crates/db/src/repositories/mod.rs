use async_trait::async_trait;
use closeflow_core::chrono::{DateTime, Utc};
use thiserror::Error;

use closeflow_core::domain::event::FlowEvent;
use closeflow_core::domain::flow::{Flow, FlowId, FlowStatus, TenantId};
use closeflow_core::domain::query::{FlowPage, FlowQuery, StatsFilter, StatusCount};

pub mod event;
pub mod flow;
pub mod memory;

pub use event::SqlEventRepository;
pub use flow::SqlFlowRepository;
pub use memory::{InMemoryEventRepository, InMemoryFlowRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("flow `{flow_id}` was modified concurrently (expected version {expected_version})")]
    VersionConflict { flow_id: FlowId, expected_version: u32 },
}

/// Selection criteria for the due-flow scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DueFlowQuery {
    pub tenant_id: Option<TenantId>,
    pub statuses: Vec<FlowStatus>,
    pub now: DateTime<Utc>,
    pub limit: u32,
}

impl DueFlowQuery {
    pub fn matches(&self, flow: &Flow) -> bool {
        self.tenant_id.as_ref().map(|tenant_id| &flow.tenant_id == tenant_id).unwrap_or(true)
            && self.statuses.contains(&flow.status)
            && flow.next_action_at.map(|next| next < self.now).unwrap_or(false)
            && flow.attempt_count < flow.max_attempts
    }
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Atomically advances and returns the tenant's flow counter.
    async fn next_flow_sequence(&self, tenant_id: &TenantId) -> Result<u32, RepositoryError>;

    async fn insert(&self, flow: &Flow) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Flow>, RepositoryError>;

    /// Writes `flow` when the stored version still equals `flow.version` and returns
    /// the new version.
    async fn update(&self, flow: &Flow) -> Result<u32, RepositoryError>;

    /// Oldest-due first, at most `query.limit` rows.
    async fn find_due(&self, query: &DueFlowQuery) -> Result<Vec<Flow>, RepositoryError>;

    async fn list(&self, query: &FlowQuery, now: DateTime<Utc>) -> Result<FlowPage, RepositoryError>;

    async fn count_by_status(&self, filter: &StatsFilter) -> Result<Vec<StatusCount>, RepositoryError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn append(&self, event: &FlowEvent) -> Result<(), RepositoryError>;

    /// Events of one flow in append order.
    async fn list_for_flow(&self, flow_id: &FlowId) -> Result<Vec<FlowEvent>, RepositoryError>;

    /// Newest first.
    async fn list_recent(
        &self,
        tenant_id: Option<&TenantId>,
        limit: u32,
    ) -> Result<Vec<FlowEvent>, RepositoryError>;
}

pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(closeflow_core::chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_json<T>(column: &str, value: &str) -> Result<T, RepositoryError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn to_json<T>(column: &str, value: &T) -> Result<String, RepositoryError>
where
    T: serde::Serialize,
{
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode `{column}`: {error}")))
}
