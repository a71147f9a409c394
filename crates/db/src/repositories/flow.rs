use closeflow_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use closeflow_core::domain::flow::{Flow, FlowConfig, FlowId, FlowMetadata, FlowStatus, TenantId};
use closeflow_core::domain::query::{FlowFilter, FlowPage, FlowQuery, StatsFilter, StatusCount};

use super::{
    format_timestamp, parse_json, parse_optional_timestamp, parse_timestamp, parse_u32, to_json,
    DueFlowQuery, FlowRepository, RepositoryError,
};
use crate::DbPool;

const SELECT_FLOW: &str = "SELECT
    id,
    tenant_id,
    flow_number,
    proposal_id,
    contract_id,
    invoice_id,
    status,
    current_stage,
    total_stages,
    started_at,
    completed_at,
    next_action_at,
    attempt_count,
    max_attempts,
    config_json,
    metadata_json,
    notes,
    last_error,
    version,
    created_at,
    updated_at
 FROM flow";

pub struct SqlFlowRepository {
    pool: DbPool,
}

impl SqlFlowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl FlowRepository for SqlFlowRepository {
    async fn next_flow_sequence(&self, tenant_id: &TenantId) -> Result<u32, RepositoryError> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO flow_sequence (tenant_id, last_value) VALUES (?, 1)
             ON CONFLICT(tenant_id) DO UPDATE SET last_value = last_value + 1
             RETURNING last_value",
        )
        .bind(&tenant_id.0)
        .fetch_one(&self.pool)
        .await?;

        parse_u32("last_value", value)
    }

    async fn insert(&self, flow: &Flow) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO flow (
                id,
                tenant_id,
                flow_number,
                proposal_id,
                contract_id,
                invoice_id,
                status,
                current_stage,
                total_stages,
                started_at,
                completed_at,
                next_action_at,
                attempt_count,
                max_attempts,
                config_json,
                metadata_json,
                notes,
                last_error,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&flow.id.0)
        .bind(&flow.tenant_id.0)
        .bind(&flow.flow_number)
        .bind(&flow.proposal_id)
        .bind(flow.contract_id.as_deref())
        .bind(flow.invoice_id.as_deref())
        .bind(flow.status.as_str())
        .bind(i64::from(flow.current_stage))
        .bind(i64::from(flow.total_stages))
        .bind(format_timestamp(&flow.started_at))
        .bind(flow.completed_at.as_ref().map(format_timestamp))
        .bind(flow.next_action_at.as_ref().map(format_timestamp))
        .bind(i64::from(flow.attempt_count))
        .bind(i64::from(flow.max_attempts))
        .bind(to_json("config_json", &flow.config)?)
        .bind(to_json("metadata_json", &flow.metadata)?)
        .bind(flow.notes.as_deref())
        .bind(flow.last_error.as_deref())
        .bind(i64::from(flow.version))
        .bind(format_timestamp(&flow.created_at))
        .bind(format_timestamp(&flow.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Flow>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_FLOW} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(flow_from_row).transpose()
    }

    async fn update(&self, flow: &Flow) -> Result<u32, RepositoryError> {
        let result = sqlx::query(
            "UPDATE flow SET
                contract_id = ?,
                invoice_id = ?,
                status = ?,
                current_stage = ?,
                total_stages = ?,
                completed_at = ?,
                next_action_at = ?,
                attempt_count = ?,
                max_attempts = ?,
                config_json = ?,
                metadata_json = ?,
                notes = ?,
                last_error = ?,
                updated_at = ?,
                version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(flow.contract_id.as_deref())
        .bind(flow.invoice_id.as_deref())
        .bind(flow.status.as_str())
        .bind(i64::from(flow.current_stage))
        .bind(i64::from(flow.total_stages))
        .bind(flow.completed_at.as_ref().map(format_timestamp))
        .bind(flow.next_action_at.as_ref().map(format_timestamp))
        .bind(i64::from(flow.attempt_count))
        .bind(i64::from(flow.max_attempts))
        .bind(to_json("config_json", &flow.config)?)
        .bind(to_json("metadata_json", &flow.metadata)?)
        .bind(flow.notes.as_deref())
        .bind(flow.last_error.as_deref())
        .bind(format_timestamp(&flow.updated_at))
        .bind(&flow.id.0)
        .bind(i64::from(flow.version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                flow_id: flow.id.clone(),
                expected_version: flow.version,
            });
        }

        Ok(flow.version + 1)
    }

    async fn find_due(&self, query: &DueFlowQuery) -> Result<Vec<Flow>, RepositoryError> {
        if query.statuses.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_FLOW);
        builder.push(" WHERE next_action_at IS NOT NULL AND next_action_at < ");
        builder.push_bind(format_timestamp(&query.now));
        builder.push(" AND attempt_count < max_attempts AND status IN (");
        let mut separated = builder.separated(", ");
        for status in &query.statuses {
            separated.push_bind(status.as_str());
        }
        builder.push(")");
        if let Some(tenant_id) = &query.tenant_id {
            builder.push(" AND tenant_id = ");
            builder.push_bind(tenant_id.0.clone());
        }
        builder.push(" ORDER BY next_action_at ASC, created_at ASC LIMIT ");
        builder.push_bind(i64::from(query.limit));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(flow_from_row).collect()
    }

    async fn list(&self, query: &FlowQuery, now: DateTime<Utc>) -> Result<FlowPage, RepositoryError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM flow");
        push_flow_filters(&mut count, &query.filter, now);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_FLOW);
        push_flow_filters(&mut select, &query.filter, now);
        select.push(format!(
            " ORDER BY {} {}, id ASC LIMIT ",
            query.sort_by.column(),
            query.direction.as_sql()
        ));
        select.push_bind(i64::from(query.effective_limit()));
        select.push(" OFFSET ");
        select.push_bind(i64::from(query.offset));

        let rows = select.build().fetch_all(&self.pool).await?;
        let items = rows.into_iter().map(flow_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(FlowPage { items, total: u64::try_from(total).unwrap_or_default() })
    }

    async fn count_by_status(&self, filter: &StatsFilter) -> Result<Vec<StatusCount>, RepositoryError> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT status, COUNT(*) AS total FROM flow WHERE 1=1");
        if let Some(tenant_id) = &filter.tenant_id {
            builder.push(" AND tenant_id = ");
            builder.push_bind(tenant_id.0.clone());
        }
        if let Some(from) = &filter.created_from {
            builder.push(" AND created_at >= ");
            builder.push_bind(format_timestamp(from));
        }
        if let Some(to) = &filter.created_to {
            builder.push(" AND created_at <= ");
            builder.push_bind(format_timestamp(to));
        }
        builder.push(" GROUP BY status ORDER BY status ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| -> Result<StatusCount, RepositoryError> {
                let status_raw = row.try_get::<String, _>("status")?;
                let status = FlowStatus::parse(&status_raw).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown flow status `{status_raw}`"))
                })?;
                let total = row.try_get::<i64, _>("total")?;
                Ok(StatusCount { status, total: u64::try_from(total).unwrap_or_default() })
            })
            .collect()
    }
}

fn push_flow_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &FlowFilter, now: DateTime<Utc>) {
    builder.push(" WHERE 1=1");

    if let Some(tenant_id) = &filter.tenant_id {
        builder.push(" AND tenant_id = ");
        builder.push_bind(tenant_id.0.clone());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(proposal_id) = &filter.proposal_id {
        builder.push(" AND proposal_id = ");
        builder.push_bind(proposal_id.clone());
    }
    if let Some(contract_id) = &filter.contract_id {
        builder.push(" AND contract_id = ");
        builder.push_bind(contract_id.clone());
    }
    if let Some(invoice_id) = &filter.invoice_id {
        builder.push(" AND invoice_id = ");
        builder.push_bind(invoice_id.clone());
    }
    if let Some(stage) = filter.current_stage {
        builder.push(" AND current_stage = ");
        builder.push_bind(i64::from(stage));
    }
    if let Some(from) = &filter.started_from {
        builder.push(" AND started_at >= ");
        builder.push_bind(format_timestamp(from));
    }
    if let Some(to) = &filter.started_to {
        builder.push(" AND started_at <= ");
        builder.push_bind(format_timestamp(to));
    }
    if let Some(from) = &filter.completed_from {
        builder.push(" AND completed_at >= ");
        builder.push_bind(format_timestamp(from));
    }
    if let Some(to) = &filter.completed_to {
        builder.push(" AND completed_at <= ");
        builder.push_bind(format_timestamp(to));
    }
    if filter.has_errors {
        builder.push(" AND status = ");
        builder.push_bind(FlowStatus::Failed.as_str());
    }
    if filter.overdue {
        builder.push(" AND next_action_at IS NOT NULL AND next_action_at < ");
        builder.push_bind(format_timestamp(&now));
        builder.push(" AND status <> ");
        builder.push_bind(FlowStatus::Completed.as_str());
    }
}

fn flow_from_row(row: SqliteRow) -> Result<Flow, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = FlowStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown flow status `{status_raw}`")))?;
    let config: FlowConfig = parse_json("config_json", &row.try_get::<String, _>("config_json")?)?;
    let metadata: FlowMetadata =
        parse_json("metadata_json", &row.try_get::<String, _>("metadata_json")?)?;

    Ok(Flow {
        id: FlowId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        flow_number: row.try_get("flow_number")?,
        proposal_id: row.try_get("proposal_id")?,
        contract_id: row.try_get("contract_id")?,
        invoice_id: row.try_get("invoice_id")?,
        status,
        current_stage: parse_u32("current_stage", row.try_get("current_stage")?)?,
        total_stages: parse_u32("total_stages", row.try_get("total_stages")?)?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        next_action_at: parse_optional_timestamp("next_action_at", row.try_get("next_action_at")?)?,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        config,
        metadata,
        notes: row.try_get("notes")?,
        last_error: row.try_get("last_error")?,
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use closeflow_core::chrono::{DateTime, Duration, Utc};
    use closeflow_core::domain::flow::{
        format_flow_number, Flow, FlowConfig, FlowDraft, FlowMetadata, FlowStatus, TenantId,
    };
    use closeflow_core::domain::query::{
        FlowFilter, FlowQuery, FlowSortField, SortDirection, StatsFilter,
    };
    use closeflow_core::flows::backoff::BackoffPolicy;
    use rust_decimal::Decimal;

    use super::SqlFlowRepository;
    use crate::migrations;
    use crate::repositories::{DueFlowQuery, FlowRepository, RepositoryError};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid timestamp").with_timezone(&Utc)
    }

    fn sample_flow(tenant: &str, sequence: u32, now: DateTime<Utc>) -> Flow {
        Flow::start(
            FlowDraft {
                tenant_id: TenantId(tenant.to_string()),
                proposal_id: format!("P-{sequence}"),
                flow_number: format_flow_number(2026, sequence),
                config: FlowConfig::default(),
                metadata: FlowMetadata {
                    client_id: Some("client-9".to_string()),
                    total_amount: Some(Decimal::new(1_250_050, 2)),
                    currency: Some("BRL".to_string()),
                    tags: vec!["enterprise".to_string()],
                    ..FlowMetadata::default()
                },
                max_attempts: 3,
            },
            now,
        )
        .expect("valid draft")
    }

    #[tokio::test]
    async fn sql_flow_repo_round_trip() {
        let pool = setup_pool().await;
        let repo = SqlFlowRepository::new(pool);
        let now = parse_ts("2026-03-01T10:00:00.123456Z");
        let mut flow = sample_flow("tenant-a", 1, now);
        flow.next_action_at = Some(now + Duration::minutes(5));

        repo.insert(&flow).await.expect("insert");

        let found = repo.find_by_id(&flow.id).await.expect("find");
        assert_eq!(found, Some(flow));
    }

    #[tokio::test]
    async fn sequence_is_per_tenant_and_monotonic() {
        let pool = setup_pool().await;
        let repo = SqlFlowRepository::new(pool);
        let tenant_a = TenantId("tenant-a".to_string());
        let tenant_b = TenantId("tenant-b".to_string());

        assert_eq!(repo.next_flow_sequence(&tenant_a).await.expect("seq"), 1);
        assert_eq!(repo.next_flow_sequence(&tenant_a).await.expect("seq"), 2);
        assert_eq!(repo.next_flow_sequence(&tenant_b).await.expect("seq"), 1);
        assert_eq!(repo.next_flow_sequence(&tenant_a).await.expect("seq"), 3);
    }

    #[tokio::test]
    async fn stale_version_update_is_rejected() {
        let pool = setup_pool().await;
        let repo = SqlFlowRepository::new(pool);
        let now = Utc::now();
        let flow = sample_flow("tenant-a", 1, now);
        repo.insert(&flow).await.expect("insert");

        let mut first = flow.clone();
        first.status = FlowStatus::Paused;
        let new_version = repo.update(&first).await.expect("first writer wins");
        assert_eq!(new_version, 2);

        let mut stale = flow.clone();
        stale.status = FlowStatus::Cancelled;
        let error = repo.update(&stale).await.expect_err("stale writer loses");
        assert!(matches!(error, RepositoryError::VersionConflict { expected_version: 1, .. }));

        let stored = repo.find_by_id(&flow.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, FlowStatus::Paused);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn due_query_skips_paused_future_and_exhausted_flows() {
        let pool = setup_pool().await;
        let repo = SqlFlowRepository::new(pool);
        let now = parse_ts("2026-03-01T12:00:00Z");
        let past = now - Duration::minutes(1);

        let mut due = sample_flow("tenant-a", 1, now);
        due.next_action_at = Some(past);
        let mut paused = sample_flow("tenant-a", 2, now);
        paused.next_action_at = Some(past);
        paused.status = FlowStatus::Paused;
        let mut future = sample_flow("tenant-a", 3, now);
        future.next_action_at = Some(now + Duration::minutes(1));
        let mut exhausted = sample_flow("tenant-a", 4, now);
        exhausted.status = FlowStatus::Failed;
        exhausted.attempt_count = 3;
        exhausted.next_action_at = Some(past);
        let mut retryable = sample_flow("tenant-a", 5, now);
        retryable.mark_failed("smtp down", &BackoffPolicy::default(), past - Duration::hours(1));
        let mut other_tenant = sample_flow("tenant-b", 1, now);
        other_tenant.next_action_at = Some(past);

        for flow in [&due, &paused, &future, &exhausted, &retryable, &other_tenant] {
            repo.insert(flow).await.expect("insert");
        }

        let scan = DueFlowQuery {
            tenant_id: Some(TenantId("tenant-a".to_string())),
            statuses: vec![FlowStatus::ProposalAccepted, FlowStatus::Failed],
            now,
            limit: 10,
        };
        let found = repo.find_due(&scan).await.expect("due");
        let ids: Vec<_> = found.iter().map(|flow| flow.id.clone()).collect();
        assert_eq!(ids, vec![retryable.id.clone(), due.id.clone()]);

        let all_tenants = DueFlowQuery { tenant_id: None, limit: 1, ..scan };
        assert_eq!(repo.find_due(&all_tenants).await.expect("due").len(), 1);
    }

    #[tokio::test]
    async fn list_filters_sorts_and_paginates() {
        let pool = setup_pool().await;
        let repo = SqlFlowRepository::new(pool);
        let base = parse_ts("2026-03-01T10:00:00Z");
        let now = base + Duration::days(1);

        for sequence in 1..=5 {
            let mut flow = sample_flow("tenant-a", sequence, base + Duration::minutes(sequence.into()));
            if sequence == 2 {
                flow.status = FlowStatus::Failed;
            }
            if sequence == 3 {
                flow.next_action_at = Some(now - Duration::hours(1));
            }
            repo.insert(&flow).await.expect("insert");
        }
        repo.insert(&sample_flow("tenant-b", 1, base)).await.expect("insert");

        let tenant = Some(TenantId("tenant-a".to_string()));
        let page = repo
            .list(
                &FlowQuery {
                    filter: FlowFilter { tenant_id: tenant.clone(), ..FlowFilter::default() },
                    sort_by: FlowSortField::FlowNumber,
                    direction: SortDirection::Asc,
                    offset: 1,
                    limit: Some(2),
                },
                now,
            )
            .await
            .expect("list");
        assert_eq!(page.total, 5);
        let numbers: Vec<_> = page.items.iter().map(|flow| flow.flow_number.as_str()).collect();
        assert_eq!(numbers, vec!["FL2026000002", "FL2026000003"]);

        let failing = repo
            .list(
                &FlowQuery {
                    filter: FlowFilter {
                        tenant_id: tenant.clone(),
                        has_errors: true,
                        ..FlowFilter::default()
                    },
                    ..FlowQuery::default()
                },
                now,
            )
            .await
            .expect("list failing");
        assert_eq!(failing.total, 1);
        assert_eq!(failing.items[0].flow_number, "FL2026000002");

        let overdue = repo
            .list(
                &FlowQuery {
                    filter: FlowFilter { tenant_id: tenant, overdue: true, ..FlowFilter::default() },
                    ..FlowQuery::default()
                },
                now,
            )
            .await
            .expect("list overdue");
        assert_eq!(overdue.total, 1);
        assert_eq!(overdue.items[0].flow_number, "FL2026000003");
    }

    #[tokio::test]
    async fn count_by_status_groups_within_tenant() {
        let pool = setup_pool().await;
        let repo = SqlFlowRepository::new(pool);
        let now = Utc::now();

        let mut completed = sample_flow("tenant-a", 1, now);
        completed.mark_completed(now);
        repo.insert(&completed).await.expect("insert");
        repo.insert(&sample_flow("tenant-a", 2, now)).await.expect("insert");
        repo.insert(&sample_flow("tenant-a", 3, now)).await.expect("insert");
        repo.insert(&sample_flow("tenant-b", 1, now)).await.expect("insert");

        let counts = repo
            .count_by_status(&StatsFilter {
                tenant_id: Some(TenantId("tenant-a".to_string())),
                ..StatsFilter::default()
            })
            .await
            .expect("counts");

        let total: u64 = counts.iter().map(|count| count.total).sum();
        assert_eq!(total, 3);
        assert!(counts
            .iter()
            .any(|count| count.status == FlowStatus::ProposalAccepted && count.total == 2));
    }
}
