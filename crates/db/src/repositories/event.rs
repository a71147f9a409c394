use sqlx::{sqlite::SqliteRow, Row};

use closeflow_core::domain::event::{EventData, EventId, EventResult, EventStatus, EventType, FlowEvent};
use closeflow_core::domain::flow::{FlowId, TenantId};

use super::{
    format_timestamp, parse_json, parse_optional_timestamp, parse_timestamp, parse_u32, to_json,
    EventRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlEventRepository {
    pool: DbPool,
}

impl SqlEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EventRepository for SqlEventRepository {
    async fn append(&self, event: &FlowEvent) -> Result<(), RepositoryError> {
        let result_json =
            event.result.as_ref().map(|result| to_json("result_json", result)).transpose()?;
        let duration_ms = event
            .processing_duration_ms
            .map(|value| i64::try_from(value).unwrap_or(i64::MAX));

        sqlx::query(
            "INSERT INTO flow_event (
                id,
                tenant_id,
                flow_id,
                event_type,
                status,
                title,
                description,
                event_data_json,
                scheduled_at,
                processed_at,
                attempt_count,
                max_attempts,
                last_error,
                processing_duration_ms,
                processed_by,
                result_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id.0)
        .bind(&event.tenant_id.0)
        .bind(&event.flow_id.0)
        .bind(event.event_type.as_str())
        .bind(event.status.as_str())
        .bind(&event.title)
        .bind(event.description.as_deref())
        .bind(to_json("event_data_json", &event.event_data)?)
        .bind(event.scheduled_at.as_ref().map(format_timestamp))
        .bind(event.processed_at.as_ref().map(format_timestamp))
        .bind(i64::from(event.attempt_count))
        .bind(i64::from(event.max_attempts))
        .bind(event.last_error.as_deref())
        .bind(duration_ms)
        .bind(event.processed_by.as_deref())
        .bind(result_json)
        .bind(format_timestamp(&event.created_at))
        .bind(format_timestamp(&event.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_flow(&self, flow_id: &FlowId) -> Result<Vec<FlowEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                tenant_id,
                flow_id,
                event_type,
                status,
                title,
                description,
                event_data_json,
                scheduled_at,
                processed_at,
                attempt_count,
                max_attempts,
                last_error,
                processing_duration_ms,
                processed_by,
                result_json,
                created_at,
                updated_at
             FROM flow_event
             WHERE flow_id = ?
             ORDER BY rowid ASC",
        )
        .bind(&flow_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn list_recent(
        &self,
        tenant_id: Option<&TenantId>,
        limit: u32,
    ) -> Result<Vec<FlowEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                tenant_id,
                flow_id,
                event_type,
                status,
                title,
                description,
                event_data_json,
                scheduled_at,
                processed_at,
                attempt_count,
                max_attempts,
                last_error,
                processing_duration_ms,
                processed_by,
                result_json,
                created_at,
                updated_at
             FROM flow_event
             WHERE (? IS NULL OR tenant_id = ?)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?",
        )
        .bind(tenant_id.map(|tenant| tenant.0.as_str()))
        .bind(tenant_id.map(|tenant| tenant.0.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: SqliteRow) -> Result<FlowEvent, RepositoryError> {
    let event_type_raw = row.try_get::<String, _>("event_type")?;
    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event type `{event_type_raw}`")))?;
    let status_raw = row.try_get::<String, _>("status")?;
    let status = EventStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event status `{status_raw}`")))?;
    let event_data: EventData =
        parse_json("event_data_json", &row.try_get::<String, _>("event_data_json")?)?;
    let result = row
        .try_get::<Option<String>, _>("result_json")?
        .map(|raw| parse_json::<EventResult>("result_json", &raw))
        .transpose()?;
    let processing_duration_ms = row
        .try_get::<Option<i64>, _>("processing_duration_ms")?
        .map(|value| {
            u64::try_from(value).map_err(|_| {
                RepositoryError::Decode(format!(
                    "invalid value for `processing_duration_ms`: {value}"
                ))
            })
        })
        .transpose()?;

    Ok(FlowEvent {
        id: EventId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        flow_id: FlowId(row.try_get("flow_id")?),
        event_type,
        status,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        event_data,
        scheduled_at: parse_optional_timestamp("scheduled_at", row.try_get("scheduled_at")?)?,
        processed_at: parse_optional_timestamp("processed_at", row.try_get("processed_at")?)?,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        last_error: row.try_get("last_error")?,
        processing_duration_ms,
        processed_by: row.try_get("processed_by")?,
        result,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use closeflow_core::chrono::{DateTime, Duration, Utc};
    use closeflow_core::domain::event::{EventType, FlowEvent};
    use closeflow_core::domain::flow::{
        format_flow_number, Flow, FlowConfig, FlowDraft, FlowMetadata, TenantId,
    };
    use closeflow_core::flows::backoff::BackoffPolicy;

    use super::SqlEventRepository;
    use crate::migrations;
    use crate::repositories::{EventRepository, FlowRepository, SqlFlowRepository};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid timestamp").with_timezone(&Utc)
    }

    async fn stored_flow(pool: &DbPool, tenant: &str, now: DateTime<Utc>) -> Flow {
        let flow = Flow::start(
            FlowDraft {
                tenant_id: TenantId(tenant.to_string()),
                proposal_id: "P-1".to_string(),
                flow_number: format_flow_number(2026, 1),
                config: FlowConfig::default(),
                metadata: FlowMetadata::default(),
                max_attempts: 3,
            },
            now,
        )
        .expect("valid draft");
        SqlFlowRepository::new(pool.clone()).insert(&flow).await.expect("insert flow");
        flow
    }

    #[tokio::test]
    async fn events_round_trip_in_append_order() {
        let pool = setup_pool().await;
        let now = parse_ts("2026-03-01T10:00:00Z");
        let mut flow = stored_flow(&pool, "tenant-a", now).await;
        let repo = SqlEventRepository::new(pool);

        let accepted = FlowEvent::record(&flow, EventType::ProposalAccepted, "Proposal accepted", now)
            .processed_by("api")
            .with_duration_ms(12);
        flow.mark_failed("template store offline", &BackoffPolicy::default(), now);
        let failure = FlowEvent::failure(&flow, "template store offline", "integration", now);

        repo.append(&accepted).await.expect("append accepted");
        repo.append(&failure).await.expect("append failure");

        let events = repo.list_for_flow(&flow.id).await.expect("list");
        assert_eq!(events, vec![accepted, failure]);
    }

    #[tokio::test]
    async fn timeline_follows_insertion_even_when_clocks_disagree() {
        let pool = setup_pool().await;
        let now = parse_ts("2026-03-01T10:00:00Z");
        let flow = stored_flow(&pool, "tenant-a", now).await;
        let repo = SqlEventRepository::new(pool);

        let skewed = FlowEvent::record(
            &flow,
            EventType::ProposalAccepted,
            "Proposal accepted",
            now + Duration::seconds(5),
        );
        let same_tick = FlowEvent::record(&flow, EventType::ContractCreated, "Contract created", now);
        let later_same_tick = FlowEvent::record(&flow, EventType::ContractSent, "Contract sent", now);

        repo.append(&skewed).await.expect("append skewed");
        repo.append(&same_tick).await.expect("append first of tick");
        repo.append(&later_same_tick).await.expect("append second of tick");

        let events = repo.list_for_flow(&flow.id).await.expect("list");
        assert_eq!(events, vec![skewed, same_tick, later_same_tick]);
    }

    #[tokio::test]
    async fn stored_events_cannot_be_updated() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let flow = stored_flow(&pool, "tenant-a", now).await;
        let repo = SqlEventRepository::new(pool.clone());
        let event = FlowEvent::record(&flow, EventType::ProposalAccepted, "Proposal accepted", now);
        repo.append(&event).await.expect("append");

        let result = sqlx::query("UPDATE flow_event SET title = 'edited' WHERE id = ?")
            .bind(&event.id.0)
            .execute(&pool)
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn events_are_removed_with_their_flow() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let flow = stored_flow(&pool, "tenant-a", now).await;
        let repo = SqlEventRepository::new(pool.clone());
        repo.append(&FlowEvent::record(&flow, EventType::ProposalAccepted, "Proposal accepted", now))
            .await
            .expect("append");

        sqlx::query("DELETE FROM flow WHERE id = ?")
            .bind(&flow.id.0)
            .execute(&pool)
            .await
            .expect("delete flow");

        assert!(repo.list_for_flow(&flow.id).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn recent_events_are_newest_first_and_tenant_scoped() {
        let pool = setup_pool().await;
        let now = parse_ts("2026-03-01T10:00:00Z");
        let flow_a = stored_flow(&pool, "tenant-a", now).await;
        let flow_b = stored_flow(&pool, "tenant-b", now).await;
        let repo = SqlEventRepository::new(pool);

        for minutes in 0..3 {
            let at = now + Duration::minutes(minutes);
            repo.append(&FlowEvent::record(&flow_a, EventType::ContractSent, "Contract sent", at))
                .await
                .expect("append");
        }
        repo.append(&FlowEvent::record(&flow_b, EventType::ContractSent, "Contract sent", now))
            .await
            .expect("append");

        let tenant_a = TenantId("tenant-a".to_string());
        let recent = repo.list_recent(Some(&tenant_a), 2).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].created_at, now + Duration::minutes(2));
        assert!(recent.iter().all(|event| event.tenant_id == tenant_a));

        assert_eq!(repo.list_recent(None, 10).await.expect("recent").len(), 4);
    }
}
