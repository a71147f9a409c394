use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use closeflow_core::config::OrchestratorConfig;
use closeflow_core::domain::event::{EventData, EventStatus, EventType, FlowEvent};
use closeflow_core::domain::flow::{
    format_flow_number, Flow, FlowConfig, FlowConfigPatch, FlowDraft, FlowId, FlowMetadata,
    FlowStatus, FlowUpdate, TenantId, DEFAULT_MAX_ATTEMPTS, INITIAL_ACTION_DELAY_MINUTES,
    SCANNABLE_STATUSES,
};
use closeflow_core::domain::query::{FlowFilter, FlowPage, FlowQuery, FlowStatistics, StatsFilter};
use closeflow_core::errors::ApplicationError;
use closeflow_core::executor::{dispatch, ExecutorError, StageExecutor};
use closeflow_core::flows::backoff::BackoffPolicy;
use closeflow_core::flows::policy::{rule_for_flow, StageOutcome};
use closeflow_db::repositories::{DueFlowQuery, EventRepository, FlowRepository, RepositoryError};

use crate::locks::FlowLocks;

pub const DASHBOARD_RECENT_EVENTS: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub batch_size: u32,
    pub stage_timeout: StdDuration,
    pub retry_failed: bool,
    pub default_max_attempts: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            stage_timeout: StdDuration::from_secs(30),
            retry_failed: true,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            stage_timeout: StdDuration::from_secs(config.stage_timeout_secs),
            retry_failed: config.retry_failed,
            default_max_attempts: config.default_max_attempts,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateFlowRequest {
    pub tenant_id: TenantId,
    pub proposal_id: String,
    pub config: Option<FlowConfigPatch>,
    pub metadata: Option<FlowMetadata>,
    pub max_attempts: Option<u32>,
}

/// Outcome counts of one due-flow batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub selected: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// The most recent due-flow batch, as reported by the health endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub finished_at: DateTime<Utc>,
    pub report: ScanReport,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backlog {
    pub overdue_flows: u64,
    pub failing_flows: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub statistics: FlowStatistics,
    pub overdue_flows: u64,
    pub failing_flows: u64,
    pub recent_events: Vec<FlowEvent>,
}

/// The flow engine: creates flows, runs their stages, and applies operator commands.
///
/// Every method takes an optional tenant scope. A flow owned by another tenant is
/// reported as not found.
pub struct FlowOrchestrator {
    flows: Arc<dyn FlowRepository>,
    events: Arc<dyn EventRepository>,
    executor: Arc<dyn StageExecutor>,
    settings: OrchestratorSettings,
    backoff: BackoffPolicy,
    locks: FlowLocks,
    last_scan: Mutex<Option<ScanRecord>>,
}

impl FlowOrchestrator {
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        events: Arc<dyn EventRepository>,
        executor: Arc<dyn StageExecutor>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            flows,
            events,
            executor,
            settings,
            backoff: BackoffPolicy::default(),
            locks: FlowLocks::default(),
            last_scan: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn locks(&self) -> &FlowLocks {
        &self.locks
    }

    pub fn last_scan(&self) -> Option<ScanRecord> {
        self.last_scan.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn create_flow(&self, request: CreateFlowRequest) -> Result<Flow, ApplicationError> {
        let now = Utc::now();
        let config = match request.config {
            Some(patch) => FlowConfig::default().merged(patch),
            None => FlowConfig::default(),
        };
        let mut flow = Flow::start(
            FlowDraft {
                tenant_id: request.tenant_id,
                proposal_id: request.proposal_id,
                flow_number: String::new(),
                config,
                metadata: request.metadata.unwrap_or_default(),
                max_attempts: request.max_attempts.unwrap_or(self.settings.default_max_attempts),
            },
            now,
        )?;

        let sequence =
            self.flows.next_flow_sequence(&flow.tenant_id).await.map_err(repository_error)?;
        flow.flow_number = format_flow_number(now.year(), sequence);
        self.flows.insert(&flow).await.map_err(repository_error)?;

        let accepted = FlowEvent::record(&flow, EventType::ProposalAccepted, "Proposal accepted", now)
            .with_data(EventData {
                entity_id: Some(flow.proposal_id.clone()),
                entity_type: Some("proposal".to_string()),
                before: None,
                after: Some(json!({ "status": flow.status.as_str(), "stage": flow.current_stage })),
                parameters: None,
            })
            .processed_by("api");
        self.events.append(&accepted).await.map_err(repository_error)?;

        flow.schedule_next_action(Duration::minutes(INITIAL_ACTION_DELAY_MINUTES), now);
        self.persist(&mut flow).await?;

        info!(
            event_name = "flow.lifecycle.created",
            flow_id = %flow.id,
            flow_number = %flow.flow_number,
            tenant_id = %flow.tenant_id,
            proposal_id = %flow.proposal_id,
            "flow created for accepted proposal"
        );
        Ok(flow)
    }

    /// Runs the stage mapped to the flow's status. Stage failures surface to the
    /// caller untouched; only the scanner converts them into a failed attempt.
    pub async fn process_flow(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
        force: bool,
        params: Value,
    ) -> Result<Flow, ApplicationError> {
        let _guard = self.locks.try_acquire(flow_id).ok_or_else(|| {
            ApplicationError::Conflict(format!("flow `{flow_id}` is already being processed"))
        })?;

        let flow = self.load(scope, flow_id).await?;
        if !force && !flow.can_process() {
            return Err(ApplicationError::NotProcessable {
                flow_id: flow.id,
                status: flow.status,
                attempt_count: flow.attempt_count,
                max_attempts: flow.max_attempts,
            });
        }

        self.execute_stage(flow, &params, "api").await
    }

    /// Processes up to `batch_size` due flows. A failing flow is marked failed and
    /// the batch moves on.
    pub async fn process_pending_flows(
        &self,
        scope: Option<&TenantId>,
    ) -> Result<ScanReport, ApplicationError> {
        let scan_id = Uuid::new_v4().to_string();
        let mut statuses = SCANNABLE_STATUSES.to_vec();
        if self.settings.retry_failed {
            statuses.push(FlowStatus::Failed);
        }

        let mut due_query = DueFlowQuery {
            tenant_id: scope.cloned(),
            statuses,
            now: Utc::now(),
            limit: self.settings.batch_size,
        };
        let due = self.flows.find_due(&due_query).await.map_err(repository_error)?;

        let mut report = ScanReport { selected: due.len() as u32, ..ScanReport::default() };
        for candidate in due {
            let Some(_guard) = self.locks.try_acquire(&candidate.id) else {
                report.skipped += 1;
                continue;
            };

            // Reload under the lock; the row may have been processed, paused or
            // rescheduled since selection.
            due_query.now = Utc::now();
            let flow = match self.flows.find_by_id(&candidate.id).await {
                Ok(Some(flow)) if flow.can_process() && due_query.matches(&flow) => flow,
                Ok(_) => {
                    info!(
                        event_name = "flow.scan.no_longer_due",
                        correlation_id = %scan_id,
                        flow_id = %candidate.id,
                        "flow changed after selection; skipped"
                    );
                    report.skipped += 1;
                    continue;
                }
                Err(error) => {
                    warn!(
                        event_name = "flow.scan.reload_failed",
                        correlation_id = %scan_id,
                        flow_id = %candidate.id,
                        error = %error,
                        "could not reload due flow"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let flow_id = flow.id.clone();
            match self.execute_stage(flow, &Value::Null, "scanner").await {
                Ok(_) => report.succeeded += 1,
                Err(ApplicationError::Conflict(message)) => {
                    warn!(
                        event_name = "flow.scan.conflict",
                        correlation_id = %scan_id,
                        flow_id = %flow_id,
                        message = %message,
                        "flow changed while its stage ran"
                    );
                    report.skipped += 1;
                }
                Err(ApplicationError::Persistence(message)) => {
                    // The stage may already be saved; an attempt is only charged for stage errors.
                    warn!(
                        event_name = "flow.scan.persistence_failed",
                        correlation_id = %scan_id,
                        flow_id = %flow_id,
                        error = %message,
                        "could not store stage result"
                    );
                    report.failed += 1;
                }
                Err(error) => {
                    report.failed += 1;
                    if let Err(record_error) = self.record_failure(&flow_id, &error, &scan_id).await {
                        warn!(
                            event_name = "flow.scan.failure_not_recorded",
                            correlation_id = %scan_id,
                            flow_id = %flow_id,
                            error = %record_error,
                            "could not record stage failure"
                        );
                    }
                }
            }
        }

        info!(
            event_name = "flow.scan.completed",
            correlation_id = %scan_id,
            tenant_id = scope.map(|tenant| tenant.0.as_str()).unwrap_or("*"),
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "due-flow scan finished"
        );
        *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(ScanRecord { finished_at: Utc::now(), report: report.clone() });
        Ok(report)
    }

    pub async fn get_flow(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
    ) -> Result<Flow, ApplicationError> {
        self.load(scope, flow_id).await
    }

    pub async fn list_flows(
        &self,
        scope: Option<&TenantId>,
        mut query: FlowQuery,
    ) -> Result<FlowPage, ApplicationError> {
        if let Some(tenant_id) = scope {
            query.filter.tenant_id = Some(tenant_id.clone());
        }
        self.flows.list(&query, Utc::now()).await.map_err(repository_error)
    }

    pub async fn statistics(
        &self,
        scope: Option<&TenantId>,
        mut filter: StatsFilter,
    ) -> Result<FlowStatistics, ApplicationError> {
        if let Some(tenant_id) = scope {
            filter.tenant_id = Some(tenant_id.clone());
        }
        let counts = self.flows.count_by_status(&filter).await.map_err(repository_error)?;
        Ok(FlowStatistics::from_counts(counts))
    }

    pub async fn dashboard(&self, scope: Option<&TenantId>) -> Result<Dashboard, ApplicationError> {
        let statistics = self.statistics(scope, StatsFilter::default()).await?;
        let backlog = self.backlog(scope).await?;
        let recent_events = self
            .events
            .list_recent(scope, DASHBOARD_RECENT_EVENTS)
            .await
            .map_err(repository_error)?;

        Ok(Dashboard {
            statistics,
            overdue_flows: backlog.overdue_flows,
            failing_flows: backlog.failing_flows,
            recent_events,
        })
    }

    /// Flows past their next action and flows sitting in `failed`.
    pub async fn backlog(&self, scope: Option<&TenantId>) -> Result<Backlog, ApplicationError> {
        let overdue_flows = self
            .count_matching(scope, FlowFilter { overdue: true, ..FlowFilter::default() })
            .await?;
        let failing_flows = self
            .count_matching(scope, FlowFilter { has_errors: true, ..FlowFilter::default() })
            .await?;
        Ok(Backlog { overdue_flows, failing_flows })
    }

    pub async fn list_events(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
    ) -> Result<Vec<FlowEvent>, ApplicationError> {
        let flow = self.load(scope, flow_id).await?;
        self.events.list_for_flow(&flow.id).await.map_err(repository_error)
    }

    pub async fn pause_flow(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
        reason: Option<&str>,
    ) -> Result<Flow, ApplicationError> {
        let mut flow = self.load(scope, flow_id).await?;
        let now = Utc::now();
        let stage = flow.current_stage;
        let previous = flow.pause(reason, now)?;
        self.persist(&mut flow).await?;

        let event = lifecycle_event(&flow, EventType::WorkflowPaused, "Workflow paused", reason, now)
            .with_data(EventData {
                entity_id: Some(flow.id.0.clone()),
                entity_type: Some("flow".to_string()),
                before: Some(json!({ "status": previous.as_str(), "stage": stage })),
                after: Some(json!({ "status": flow.status.as_str(), "stage": flow.current_stage })),
                parameters: reason.map(|reason| json!({ "reason": reason })),
            });
        self.events.append(&event).await.map_err(repository_error)?;

        info!(
            event_name = "flow.lifecycle.paused",
            flow_id = %flow.id,
            flow_number = %flow.flow_number,
            tenant_id = %flow.tenant_id,
            previous_status = previous.as_str(),
            "flow paused"
        );
        Ok(flow)
    }

    pub async fn resume_flow(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
        reason: Option<&str>,
    ) -> Result<Flow, ApplicationError> {
        let mut flow = self.load(scope, flow_id).await?;
        let now = Utc::now();
        flow.resume(now)?;
        self.persist(&mut flow).await?;

        let event =
            lifecycle_event(&flow, EventType::WorkflowResumed, "Workflow resumed", reason, now)
                .with_data(EventData {
                    entity_id: Some(flow.id.0.clone()),
                    entity_type: Some("flow".to_string()),
                    before: Some(json!({ "status": FlowStatus::Paused.as_str() })),
                    after: Some(json!({
                        "status": flow.status.as_str(),
                        "stage": flow.current_stage,
                        "nextActionAt": flow.next_action_at,
                    })),
                    parameters: reason.map(|reason| json!({ "reason": reason })),
                });
        self.events.append(&event).await.map_err(repository_error)?;

        info!(
            event_name = "flow.lifecycle.resumed",
            flow_id = %flow.id,
            flow_number = %flow.flow_number,
            tenant_id = %flow.tenant_id,
            status = flow.status.as_str(),
            "flow resumed"
        );
        Ok(flow)
    }

    pub async fn cancel_flow(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
        reason: Option<&str>,
    ) -> Result<Flow, ApplicationError> {
        let mut flow = self.load(scope, flow_id).await?;
        let now = Utc::now();
        let previous = flow.status;
        flow.cancel(reason, now)?;
        self.persist(&mut flow).await?;

        let mut event =
            lifecycle_event(&flow, EventType::WorkflowCancelled, "Workflow cancelled", reason, now)
                .with_data(EventData {
                    entity_id: Some(flow.id.0.clone()),
                    entity_type: Some("flow".to_string()),
                    before: Some(json!({ "status": previous.as_str(), "stage": flow.current_stage })),
                    after: Some(json!({ "status": flow.status.as_str() })),
                    parameters: reason.map(|reason| json!({ "reason": reason })),
                });
        event.status = EventStatus::Cancelled;
        self.events.append(&event).await.map_err(repository_error)?;

        info!(
            event_name = "flow.lifecycle.cancelled",
            flow_id = %flow.id,
            flow_number = %flow.flow_number,
            tenant_id = %flow.tenant_id,
            previous_status = previous.as_str(),
            "flow cancelled"
        );
        Ok(flow)
    }

    pub async fn update_flow(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
        update: FlowUpdate,
    ) -> Result<Flow, ApplicationError> {
        let mut flow = self.load(scope, flow_id).await?;
        flow.apply_update(update, Utc::now())?;
        self.persist(&mut flow).await?;

        info!(
            event_name = "flow.lifecycle.updated",
            flow_id = %flow.id,
            flow_number = %flow.flow_number,
            tenant_id = %flow.tenant_id,
            status = flow.status.as_str(),
            "flow updated"
        );
        Ok(flow)
    }

    async fn execute_stage(
        &self,
        mut flow: Flow,
        params: &Value,
        actor: &str,
    ) -> Result<Flow, ApplicationError> {
        let rule = rule_for_flow(&flow)?;
        let started = Instant::now();

        let effect = match tokio::time::timeout(
            self.settings.stage_timeout,
            dispatch(self.executor.as_ref(), rule.action, &flow, params),
        )
        .await
        {
            Ok(Ok(effect)) => effect,
            Ok(Err(source)) => {
                return Err(ApplicationError::StageExecution { action: rule.action, source })
            }
            Err(_) => {
                return Err(ApplicationError::StageExecution {
                    action: rule.action,
                    source: ExecutorError::timeout(format!(
                        "no answer within {}ms",
                        self.settings.stage_timeout.as_millis()
                    )),
                })
            }
        };

        let now = Utc::now();
        let report = rule.apply(&mut flow, &effect, now)?;
        self.persist(&mut flow).await?;

        if let Some(event) = report.event {
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let event = event.processed_by(actor).with_duration_ms(elapsed);
            if let Err(error) = self.events.append(&event).await {
                warn!(
                    event_name = "flow.stage.event_not_recorded",
                    flow_id = %flow.id,
                    flow_number = %flow.flow_number,
                    tenant_id = %flow.tenant_id,
                    status = flow.status.as_str(),
                    error = %error,
                    "stage result saved but its event was not appended"
                );
                return Err(repository_error(error));
            }
        }

        match report.outcome {
            StageOutcome::Advanced { from, to } => info!(
                event_name = "flow.stage.advanced",
                flow_id = %flow.id,
                flow_number = %flow.flow_number,
                tenant_id = %flow.tenant_id,
                action = rule.action.as_str(),
                from = from.as_str(),
                to = to.as_str(),
                processed_by = actor,
                "flow stage advanced"
            ),
            StageOutcome::Waiting { retry_at } => info!(
                event_name = "flow.stage.waiting",
                flow_id = %flow.id,
                flow_number = %flow.flow_number,
                tenant_id = %flow.tenant_id,
                action = rule.action.as_str(),
                retry_at = %retry_at,
                processed_by = actor,
                "stage answered not yet; poll rescheduled"
            ),
        }
        Ok(flow)
    }

    async fn record_failure(
        &self,
        flow_id: &FlowId,
        error: &ApplicationError,
        scan_id: &str,
    ) -> Result<(), ApplicationError> {
        let mut flow = self.load(None, flow_id).await?;
        let now = Utc::now();
        let message = error.to_string();
        flow.mark_failed(message.clone(), &self.backoff, now);
        self.persist(&mut flow).await?;

        let event = FlowEvent::failure(&flow, &message, error.error_code(), now).processed_by("scanner");
        self.events.append(&event).await.map_err(repository_error)?;

        warn!(
            event_name = "flow.stage.failed",
            correlation_id = %scan_id,
            flow_id = %flow.id,
            flow_number = %flow.flow_number,
            tenant_id = %flow.tenant_id,
            attempt = flow.attempt_count,
            max_attempts = flow.max_attempts,
            error_code = error.error_code(),
            error = %message,
            "stage failed; retry scheduled"
        );
        Ok(())
    }

    async fn load(
        &self,
        scope: Option<&TenantId>,
        flow_id: &FlowId,
    ) -> Result<Flow, ApplicationError> {
        let flow = self.flows.find_by_id(flow_id).await.map_err(repository_error)?;
        match flow {
            Some(flow) if scope.map(|tenant| tenant == &flow.tenant_id).unwrap_or(true) => Ok(flow),
            _ => Err(ApplicationError::NotFound(flow_id.clone())),
        }
    }

    async fn persist(&self, flow: &mut Flow) -> Result<(), ApplicationError> {
        flow.version = self.flows.update(flow).await.map_err(repository_error)?;
        Ok(())
    }

    async fn count_matching(
        &self,
        scope: Option<&TenantId>,
        filter: FlowFilter,
    ) -> Result<u64, ApplicationError> {
        let page = self
            .list_flows(scope, FlowQuery { filter, limit: Some(1), ..FlowQuery::default() })
            .await?;
        Ok(page.total)
    }
}

fn lifecycle_event(
    flow: &Flow,
    event_type: EventType,
    title: &str,
    reason: Option<&str>,
    now: chrono::DateTime<Utc>,
) -> FlowEvent {
    let event = FlowEvent::record(flow, event_type, title, now).processed_by("api");
    match reason.map(str::trim).filter(|reason| !reason.is_empty()) {
        Some(reason) => event.with_description(reason),
        None => event,
    }
}

fn repository_error(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::VersionConflict { .. } => ApplicationError::Conflict(error.to_string()),
        other => ApplicationError::Persistence(other.to_string()),
    }
}
