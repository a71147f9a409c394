//! Flow orchestration HTTP endpoints.
//!
//! Every request may carry `X-Tenant-Id`. When it does, the call is scoped to that
//! tenant and flows owned by anyone else answer 404. Errors share one body shape,
//! `{error, message, correlation_id}`, and the correlation id is echoed from
//! `X-Correlation-Id` or generated per request.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use closeflow_core::domain::event::FlowEvent;
use closeflow_core::domain::flow::{
    Flow, FlowConfigPatch, FlowId, FlowMetadata, FlowStatus, FlowUpdate, TenantId,
};
use closeflow_core::domain::query::{
    FlowFilter, FlowPage, FlowQuery, FlowSortField, FlowStatistics, SortDirection, StatsFilter,
};
use closeflow_core::errors::{ApplicationError, InterfaceError};
use closeflow_orchestrator::{CreateFlowRequest, Dashboard, FlowOrchestrator, ScanReport};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct FlowApiState {
    orchestrator: Arc<FlowOrchestrator>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

type ApiFailure = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<Json<T>, ApiFailure>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFlowBody {
    tenant_id: Option<String>,
    proposal_id: Option<String>,
    config: Option<FlowConfigPatch>,
    metadata: Option<FlowMetadata>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessBody {
    forcar_processamento: Option<bool>,
    parametros_customizados: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ReasonBody {
    motivo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFlowsParams {
    tenant_id: Option<String>,
    status: Option<String>,
    proposal_id: Option<String>,
    contract_id: Option<String>,
    invoice_id: Option<String>,
    stage: Option<String>,
    started_from: Option<String>,
    started_to: Option<String>,
    completed_from: Option<String>,
    completed_to: Option<String>,
    com_erros: Option<String>,
    vencidos: Option<String>,
    ordenar_por: Option<String>,
    direcao: Option<String>,
    limite: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsParams {
    tenant_id: Option<String>,
    created_from: Option<String>,
    created_to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantParams {
    tenant_id: Option<String>,
}

struct RequestContext {
    scope: Option<TenantId>,
    correlation_id: String,
}

impl RequestContext {
    fn from_headers(headers: &HeaderMap) -> Result<Self, ApiFailure> {
        let correlation_id = headers
            .get(CORRELATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let scope = match headers.get(TENANT_HEADER) {
            None => None,
            Some(value) => {
                let tenant = value.to_str().map(str::trim).unwrap_or_default();
                if tenant.is_empty() {
                    return Err(bad_request(
                        "X-Tenant-Id must be a non-empty ASCII value",
                        &correlation_id,
                    ));
                }
                Some(TenantId(tenant.to_string()))
            }
        };

        Ok(Self { scope, correlation_id })
    }

    /// Combines the header scope with a tenant named in the query or body.
    fn tenant(&self, requested: Option<&str>) -> Result<Option<TenantId>, ApiFailure> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        match (&self.scope, requested) {
            (Some(scope), Some(requested)) if scope.0 != requested => Err(bad_request(
                "tenantId does not match X-Tenant-Id",
                &self.correlation_id,
            )),
            (Some(scope), _) => Ok(Some(scope.clone())),
            (None, requested) => Ok(requested.map(|tenant| TenantId(tenant.to_string()))),
        }
    }
}

pub fn router(orchestrator: Arc<FlowOrchestrator>) -> Router {
    Router::new()
        .route("/flows", post(create_flow).get(list_flows))
        .route("/flows/{flow_id}", get(get_flow).put(update_flow))
        .route("/flows/{flow_id}/process", post(process_flow))
        .route("/flows/{flow_id}/pause", post(pause_flow))
        .route("/flows/{flow_id}/retomar", post(resume_flow))
        .route("/flows/{flow_id}/cancelar", post(cancel_flow))
        .route("/flows/{flow_id}/events", get(list_events))
        .route("/processar-pendentes", post(process_pending))
        .route("/estatisticas", get(statistics))
        .route("/dashboard", get(dashboard))
        .with_state(FlowApiState { orchestrator })
}

async fn create_flow(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Flow> {
    let context = RequestContext::from_headers(&headers)?;
    let body: CreateFlowBody = parse_body(&body, &context.correlation_id)?;
    let tenant_id = context
        .tenant(body.tenant_id.as_deref())?
        .ok_or_else(|| bad_request("tenantId is required", &context.correlation_id))?;

    let flow = state
        .orchestrator
        .create_flow(CreateFlowRequest {
            tenant_id,
            proposal_id: body.proposal_id.unwrap_or_default(),
            config: body.config,
            metadata: body.metadata,
            max_attempts: body.max_attempts,
        })
        .await
        .map_err(|error| application_failure(error, &context.correlation_id))?;

    info!(
        event_name = "http.flow.created",
        correlation_id = %context.correlation_id,
        flow_id = %flow.id,
        flow_number = %flow.flow_number,
        tenant_id = %flow.tenant_id,
        "flow created via api"
    );
    Ok(Json(flow))
}

async fn list_flows(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Query(params): Query<ListFlowsParams>,
) -> ApiResult<FlowPage> {
    let context = RequestContext::from_headers(&headers)?;
    let query = flow_query(&context, params)?;
    state
        .orchestrator
        .list_flows(context.scope.as_ref(), query)
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn get_flow(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
) -> ApiResult<Flow> {
    let context = RequestContext::from_headers(&headers)?;
    state
        .orchestrator
        .get_flow(context.scope.as_ref(), &FlowId(flow_id))
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn update_flow(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> ApiResult<Flow> {
    let context = RequestContext::from_headers(&headers)?;
    let update: FlowUpdate = parse_body(&body, &context.correlation_id)?;
    state
        .orchestrator
        .update_flow(context.scope.as_ref(), &FlowId(flow_id), update)
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn process_flow(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> ApiResult<Flow> {
    let context = RequestContext::from_headers(&headers)?;
    let body: ProcessBody = parse_body(&body, &context.correlation_id)?;
    let force = body.forcar_processamento.unwrap_or(false);

    let flow = state
        .orchestrator
        .process_flow(
            context.scope.as_ref(),
            &FlowId(flow_id),
            force,
            body.parametros_customizados.unwrap_or(Value::Null),
        )
        .await
        .map_err(|error| application_failure(error, &context.correlation_id))?;

    info!(
        event_name = "http.flow.processed",
        correlation_id = %context.correlation_id,
        flow_id = %flow.id,
        flow_number = %flow.flow_number,
        tenant_id = %flow.tenant_id,
        status = flow.status.as_str(),
        forced = force,
        "flow processed via api"
    );
    Ok(Json(flow))
}

async fn pause_flow(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> ApiResult<Flow> {
    let context = RequestContext::from_headers(&headers)?;
    let body: ReasonBody = parse_body(&body, &context.correlation_id)?;
    state
        .orchestrator
        .pause_flow(context.scope.as_ref(), &FlowId(flow_id), body.motivo.as_deref())
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn resume_flow(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> ApiResult<Flow> {
    let context = RequestContext::from_headers(&headers)?;
    let body: ReasonBody = parse_body(&body, &context.correlation_id)?;
    state
        .orchestrator
        .resume_flow(context.scope.as_ref(), &FlowId(flow_id), body.motivo.as_deref())
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn cancel_flow(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> ApiResult<Flow> {
    let context = RequestContext::from_headers(&headers)?;
    let body: ReasonBody = parse_body(&body, &context.correlation_id)?;
    state
        .orchestrator
        .cancel_flow(context.scope.as_ref(), &FlowId(flow_id), body.motivo.as_deref())
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn list_events(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
) -> ApiResult<Vec<FlowEvent>> {
    let context = RequestContext::from_headers(&headers)?;
    state
        .orchestrator
        .list_events(context.scope.as_ref(), &FlowId(flow_id))
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn process_pending(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Query(params): Query<TenantParams>,
) -> ApiResult<ScanReport> {
    let context = RequestContext::from_headers(&headers)?;
    let tenant_id = context.tenant(params.tenant_id.as_deref())?;
    state
        .orchestrator
        .process_pending_flows(tenant_id.as_ref())
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn statistics(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Query(params): Query<StatsParams>,
) -> ApiResult<FlowStatistics> {
    let context = RequestContext::from_headers(&headers)?;
    let filter = StatsFilter {
        tenant_id: context.tenant(params.tenant_id.as_deref())?,
        created_from: parse_timestamp("createdFrom", params.created_from, &context)?,
        created_to: parse_timestamp("createdTo", params.created_to, &context)?,
    };
    state
        .orchestrator
        .statistics(context.scope.as_ref(), filter)
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

async fn dashboard(
    State(state): State<FlowApiState>,
    headers: HeaderMap,
    Query(params): Query<TenantParams>,
) -> ApiResult<Dashboard> {
    let context = RequestContext::from_headers(&headers)?;
    let tenant_id = context.tenant(params.tenant_id.as_deref())?;
    state
        .orchestrator
        .dashboard(tenant_id.as_ref())
        .await
        .map(Json)
        .map_err(|error| application_failure(error, &context.correlation_id))
}

fn flow_query(context: &RequestContext, params: ListFlowsParams) -> Result<FlowQuery, ApiFailure> {
    let correlation_id = context.correlation_id.as_str();
    let status = match params.status.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(
            FlowStatus::parse(raw)
                .ok_or_else(|| bad_request(format!("unknown status `{raw}`"), correlation_id))?,
        ),
        None => None,
    };
    let sort_by = match params.ordenar_por.as_deref() {
        Some(raw) => FlowSortField::parse(raw).ok_or_else(|| {
            bad_request(format!("ordenarPor `{raw}` is not a sortable field"), correlation_id)
        })?,
        None => FlowSortField::default(),
    };
    let direction = match params.direcao.as_deref() {
        Some(raw) => SortDirection::parse(raw).ok_or_else(|| {
            bad_request(format!("direcao `{raw}` must be ASC or DESC"), correlation_id)
        })?,
        None => SortDirection::default(),
    };

    Ok(FlowQuery {
        filter: FlowFilter {
            tenant_id: context.tenant(params.tenant_id.as_deref())?,
            status,
            proposal_id: non_blank(params.proposal_id),
            contract_id: non_blank(params.contract_id),
            invoice_id: non_blank(params.invoice_id),
            current_stage: parse_number("stage", params.stage, context)?,
            started_from: parse_timestamp("startedFrom", params.started_from, context)?,
            started_to: parse_timestamp("startedTo", params.started_to, context)?,
            completed_from: parse_timestamp("completedFrom", params.completed_from, context)?,
            completed_to: parse_timestamp("completedTo", params.completed_to, context)?,
            has_errors: parse_flag("comErros", params.com_erros, context)?,
            overdue: parse_flag("vencidos", params.vencidos, context)?,
        },
        sort_by,
        direction,
        offset: parse_number("offset", params.offset, context)?.unwrap_or(0),
        limit: parse_number("limite", params.limite, context)?,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn parse_number(
    name: &str,
    value: Option<String>,
    context: &RequestContext,
) -> Result<Option<u32>, ApiFailure> {
    let Some(raw) = non_blank(value) else {
        return Ok(None);
    };
    raw.parse::<u32>().map(Some).map_err(|_| {
        bad_request(
            format!("{name} must be a non-negative integer, got `{raw}`"),
            &context.correlation_id,
        )
    })
}

fn parse_flag(name: &str, value: Option<String>, context: &RequestContext) -> Result<bool, ApiFailure> {
    match non_blank(value).as_deref() {
        None | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(raw) => Err(bad_request(
            format!("{name} must be true or false, got `{raw}`"),
            &context.correlation_id,
        )),
    }
}

fn parse_timestamp(
    name: &str,
    value: Option<String>,
    context: &RequestContext,
) -> Result<Option<DateTime<Utc>>, ApiFailure> {
    let Some(raw) = non_blank(value) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| Some(parsed.with_timezone(&Utc)))
        .map_err(|_| {
            bad_request(
                format!("{name} must be an RFC 3339 timestamp, got `{raw}`"),
                &context.correlation_id,
            )
        })
}

/// An empty body is treated as `{}` so optional-only payloads can be omitted.
fn parse_body<T: DeserializeOwned + Default>(
    body: &Bytes,
    correlation_id: &str,
) -> Result<T, ApiFailure> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|error| bad_request(format!("invalid JSON body: {error}"), correlation_id))
}

fn bad_request(message: impl Into<String>, correlation_id: &str) -> ApiFailure {
    interface_failure(InterfaceError::BadRequest {
        message: message.into(),
        correlation_id: correlation_id.to_string(),
    })
}

fn application_failure(error: ApplicationError, correlation_id: &str) -> ApiFailure {
    let error_code = error.error_code();
    match &error {
        ApplicationError::StageExecution { .. }
        | ApplicationError::Persistence(_)
        | ApplicationError::Configuration(_) => error!(
            event_name = "http.flow.failed",
            correlation_id = %correlation_id,
            error_code,
            error = %error,
            "flow request failed"
        ),
        _ => warn!(
            event_name = "http.flow.rejected",
            correlation_id = %correlation_id,
            error_code,
            error = %error,
            "flow request rejected"
        ),
    }
    interface_failure(error.into_interface(correlation_id))
}

fn interface_failure(error: InterfaceError) -> ApiFailure {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match &error {
        InterfaceError::Internal { .. } => error.user_message().to_string(),
        _ => error.message().to_string(),
    };
    (
        status,
        Json(ApiError {
            error: error.code().to_string(),
            message,
            correlation_id: error.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use closeflow_core::domain::event::{EventType, FlowEvent};
    use closeflow_core::domain::flow::{Flow, FlowStatus};
    use closeflow_core::domain::query::FlowPage;
    use closeflow_core::executor::{ExecutorError, ScriptedStageExecutor, StageAction};
    use closeflow_db::repositories::{InMemoryEventRepository, InMemoryFlowRepository};
    use closeflow_orchestrator::{FlowOrchestrator, OrchestratorSettings};
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, ApiError};

    fn app() -> (Router, ScriptedStageExecutor) {
        let executor = ScriptedStageExecutor::approving();
        let orchestrator = FlowOrchestrator::new(
            Arc::new(InMemoryFlowRepository::default()),
            Arc::new(InMemoryEventRepository::default()),
            Arc::new(executor.clone()),
            OrchestratorSettings::default(),
        );
        (router(Arc::new(orchestrator)), executor)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        tenant: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            request = request.header("x-tenant-id", tenant);
        }
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response =
            app.clone().oneshot(request.body(body).expect("request")).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, bytes.to_vec())
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).expect("json payload")
    }

    async fn create(app: &Router, tenant: &str, proposal: &str) -> Flow {
        let (status, body) = send(
            app,
            Method::POST,
            "/flows",
            None,
            Some(json!({ "tenantId": tenant, "proposalId": proposal })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        decode(&body)
    }

    #[tokio::test]
    async fn create_returns_flow_with_defaults() {
        let (app, _) = app();

        let flow = create(&app, "tenant-a", "P-1").await;

        assert_eq!(flow.status, FlowStatus::ProposalAccepted);
        assert_eq!(flow.current_stage, 1);
        assert!(flow.flow_number.starts_with("FL"));
        assert!(flow.flow_number.ends_with("000001"));
    }

    #[tokio::test]
    async fn create_without_tenant_or_proposal_is_bad_request() {
        let (app, _) = app();

        let (status, body) =
            send(&app, Method::POST, "/flows", None, Some(json!({ "proposalId": "P-1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ApiError = decode(&body);
        assert_eq!(error.error, "bad_request");
        assert!(!error.correlation_id.is_empty());

        let (status, _) =
            send(&app, Method::POST, "/flows", Some("tenant-a"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            Method::POST,
            "/flows",
            Some("tenant-a"),
            Some(json!({ "tenantId": "tenant-b", "proposalId": "P-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn process_endpoint_advances_and_reports_not_processable() {
        let (app, _) = app();
        let flow = create(&app, "tenant-a", "P-1").await;
        let uri = format!("/flows/{}/process", flow.id);

        let (status, body) = send(&app, Method::POST, &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        let processed: Flow = decode(&body);
        assert_eq!(processed.status, FlowStatus::ContractGenerated);
        assert_eq!(processed.current_stage, 2);

        for _ in 0..4 {
            let (status, _) = send(&app, Method::POST, &uri, None, None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(&app, Method::GET, &format!("/flows/{}", flow.id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode::<Flow>(&body).status, FlowStatus::Completed);

        let (status, body) = send(&app, Method::POST, &uri, None, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(decode::<ApiError>(&body).error, "conflict");
    }

    #[tokio::test]
    async fn stage_failure_surfaces_as_service_unavailable() {
        let (app, executor) = app();
        let flow = create(&app, "tenant-a", "P-1").await;
        executor.fail_action(
            StageAction::GenerateContract,
            ExecutorError::unavailable("template store offline"),
        );

        let (status, body) =
            send(&app, Method::POST, &format!("/flows/{}/process", flow.id), None, None).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let error: ApiError = decode(&body);
        assert!(error.message.contains("template store offline"), "{}", error.message);

        let (_, body) = send(&app, Method::GET, &format!("/flows/{}", flow.id), None, None).await;
        assert_eq!(decode::<Flow>(&body).status, FlowStatus::ProposalAccepted);
    }

    #[tokio::test]
    async fn tenant_header_hides_foreign_flows() {
        let (app, _) = app();
        let flow = create(&app, "tenant-a", "P-1").await;
        create(&app, "tenant-b", "P-2").await;

        let (status, _) =
            send(&app, Method::GET, &format!("/flows/{}", flow.id), Some("tenant-b"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, Method::GET, "/flows", Some("tenant-b"), None).await;
        assert_eq!(status, StatusCode::OK);
        let page: FlowPage = decode(&body);
        assert_eq!(page.total, 1);
        assert!(page.items.iter().all(|item| item.tenant_id.0 == "tenant-b"));
    }

    #[tokio::test]
    async fn list_applies_filters_and_rejects_bad_parameters() {
        let (app, _) = app();
        let first = create(&app, "tenant-a", "P-1").await;
        create(&app, "tenant-a", "P-2").await;
        send(&app, Method::POST, &format!("/flows/{}/process", first.id), None, None).await;

        let (status, body) = send(
            &app,
            Method::GET,
            "/flows?tenantId=tenant-a&status=contract_generated&ordenarPor=flowNumber&direcao=asc&limite=5",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let page: FlowPage = decode(&body);
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, first.id);

        for uri in [
            "/flows?status=shipped",
            "/flows?ordenarPor=password",
            "/flows?direcao=sideways",
            "/flows?limite=-1",
            "/flows?comErros=maybe",
            "/flows?startedFrom=yesterday",
        ] {
            let (status, _) = send(&app, Method::GET, uri, None, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn pause_resume_cancel_round_trip_with_events() {
        let (app, _) = app();
        let flow = create(&app, "tenant-a", "P-1").await;

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/flows/{}/pause", flow.id),
            None,
            Some(json!({ "motivo": "client review" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode::<Flow>(&body).status, FlowStatus::Paused);

        let (status, body) =
            send(&app, Method::POST, &format!("/flows/{}/retomar", flow.id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode::<Flow>(&body).status, FlowStatus::ProposalAccepted);

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/flows/{}/cancelar", flow.id),
            None,
            Some(json!({ "motivo": "deal lost" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cancelled: Flow = decode(&body);
        assert_eq!(cancelled.status, FlowStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let (status, _) =
            send(&app, Method::POST, &format!("/flows/{}/pause", flow.id), None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            send(&app, Method::GET, &format!("/flows/{}/events", flow.id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        let types: Vec<EventType> =
            decode::<Vec<FlowEvent>>(&body).iter().map(|event| event.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::ProposalAccepted,
                EventType::WorkflowPaused,
                EventType::WorkflowResumed,
                EventType::WorkflowCancelled,
            ]
        );
    }

    #[tokio::test]
    async fn update_rejects_invalid_stage() {
        let (app, _) = app();
        let flow = create(&app, "tenant-a", "P-1").await;
        let uri = format!("/flows/{}", flow.id);

        let (status, body) =
            send(&app, Method::PUT, &uri, None, Some(json!({ "notes": "priority client" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode::<Flow>(&body).notes.as_deref(), Some("priority client"));

        let (status, _) =
            send(&app, Method::PUT, &uri, None, Some(json!({ "currentStage": 9 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::PUT, &uri, None, Some(json!("not an object"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pending_statistics_and_dashboard_endpoints() {
        let (app, _) = app();
        create(&app, "tenant-a", "P-1").await;
        create(&app, "tenant-a", "P-2").await;

        let (status, body) =
            send(&app, Method::POST, "/processar-pendentes", Some("tenant-a"), None).await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = decode(&body);
        assert_eq!(report["selected"], 0);

        let (status, body) = send(&app, Method::GET, "/estatisticas", Some("tenant-a"), None).await;
        assert_eq!(status, StatusCode::OK);
        let stats: Value = decode(&body);
        assert_eq!(stats["totalFlows"], 2);
        assert_eq!(stats["resumo"][0]["status"], "proposal_accepted");

        let (status, body) = send(&app, Method::GET, "/dashboard", Some("tenant-a"), None).await;
        assert_eq!(status, StatusCode::OK);
        let dashboard: Value = decode(&body);
        assert_eq!(dashboard["recentEvents"].as_array().map(Vec::len), Some(2));
        assert_eq!(dashboard["failingFlows"], 0);
    }
}
