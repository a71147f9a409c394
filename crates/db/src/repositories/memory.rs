use std::cmp::Ordering;
use std::collections::HashMap;

use closeflow_core::chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use closeflow_core::domain::event::FlowEvent;
use closeflow_core::domain::flow::{Flow, FlowId, FlowStatus, TenantId};
use closeflow_core::domain::query::{
    FlowPage, FlowQuery, FlowSortField, SortDirection, StatsFilter, StatusCount,
};

use super::{DueFlowQuery, EventRepository, FlowRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryFlowRepository {
    flows: RwLock<HashMap<String, Flow>>,
    sequences: RwLock<HashMap<String, u32>>,
}

#[async_trait::async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn next_flow_sequence(&self, tenant_id: &TenantId) -> Result<u32, RepositoryError> {
        let mut sequences = self.sequences.write().await;
        let value = sequences.entry(tenant_id.0.clone()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn insert(&self, flow: &Flow) -> Result<(), RepositoryError> {
        let mut flows = self.flows.write().await;
        let duplicate_number = flows.values().any(|stored| {
            stored.tenant_id == flow.tenant_id && stored.flow_number == flow.flow_number
        });
        if flows.contains_key(&flow.id.0) || duplicate_number {
            return Err(RepositoryError::Decode(format!(
                "flow `{}` ({}) already exists",
                flow.id, flow.flow_number
            )));
        }
        flows.insert(flow.id.0.clone(), flow.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Flow>, RepositoryError> {
        let flows = self.flows.read().await;
        Ok(flows.get(&id.0).cloned())
    }

    async fn update(&self, flow: &Flow) -> Result<u32, RepositoryError> {
        let mut flows = self.flows.write().await;
        let conflict = || RepositoryError::VersionConflict {
            flow_id: flow.id.clone(),
            expected_version: flow.version,
        };
        let stored = flows.get_mut(&flow.id.0).ok_or_else(conflict)?;
        if stored.version != flow.version {
            return Err(conflict());
        }

        let mut next = flow.clone();
        next.version = flow.version + 1;
        *stored = next;
        Ok(flow.version + 1)
    }

    async fn find_due(&self, query: &DueFlowQuery) -> Result<Vec<Flow>, RepositoryError> {
        let flows = self.flows.read().await;
        let mut due: Vec<Flow> = flows.values().filter(|flow| query.matches(flow)).cloned().collect();
        due.sort_by(|left, right| {
            left.next_action_at
                .cmp(&right.next_action_at)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        due.truncate(query.limit as usize);
        Ok(due)
    }

    async fn list(&self, query: &FlowQuery, now: DateTime<Utc>) -> Result<FlowPage, RepositoryError> {
        let flows = self.flows.read().await;
        let mut matching: Vec<Flow> =
            flows.values().filter(|flow| query.filter.matches(flow, now)).cloned().collect();
        matching.sort_by(|left, right| {
            let ordering = compare_by(query.sort_by, left, right);
            let ordering = match query.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            ordering.then_with(|| left.id.0.cmp(&right.id.0))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.effective_limit() as usize)
            .collect();
        Ok(FlowPage { items, total })
    }

    async fn count_by_status(&self, filter: &StatsFilter) -> Result<Vec<StatusCount>, RepositoryError> {
        let flows = self.flows.read().await;
        let mut counts: HashMap<FlowStatus, u64> = HashMap::new();
        for flow in flows.values().filter(|flow| filter.matches(flow)) {
            *counts.entry(flow.status).or_insert(0) += 1;
        }

        let mut summary: Vec<StatusCount> =
            counts.into_iter().map(|(status, total)| StatusCount { status, total }).collect();
        summary.sort_by_key(|count| count.status.as_str());
        Ok(summary)
    }
}

fn compare_by(field: FlowSortField, left: &Flow, right: &Flow) -> Ordering {
    match field {
        FlowSortField::CreatedAt => left.created_at.cmp(&right.created_at),
        FlowSortField::UpdatedAt => left.updated_at.cmp(&right.updated_at),
        FlowSortField::StartedAt => left.started_at.cmp(&right.started_at),
        FlowSortField::CompletedAt => left.completed_at.cmp(&right.completed_at),
        FlowSortField::NextActionAt => left.next_action_at.cmp(&right.next_action_at),
        FlowSortField::FlowNumber => left.flow_number.cmp(&right.flow_number),
        FlowSortField::Status => left.status.as_str().cmp(right.status.as_str()),
        FlowSortField::CurrentStage => left.current_stage.cmp(&right.current_stage),
    }
}

/// Append-only event store; ordering follows insertion.
#[derive(Default)]
pub struct InMemoryEventRepository {
    events: RwLock<Vec<FlowEvent>>,
}

#[async_trait::async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn append(&self, event: &FlowEvent) -> Result<(), RepositoryError> {
        let mut events = self.events.write().await;
        events.push(event.clone());
        Ok(())
    }

    async fn list_for_flow(&self, flow_id: &FlowId) -> Result<Vec<FlowEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|event| &event.flow_id == flow_id).cloned().collect())
    }

    async fn list_recent(
        &self,
        tenant_id: Option<&TenantId>,
        limit: u32,
    ) -> Result<Vec<FlowEvent>, RepositoryError> {
        let events = self.events.read().await;
        let mut recent: Vec<FlowEvent> = events
            .iter()
            .rev()
            .filter(|event| tenant_id.map(|tenant| &event.tenant_id == tenant).unwrap_or(true))
            .cloned()
            .collect();
        // Stable sort keeps newest-appended first among equal timestamps.
        recent.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        recent.truncate(limit as usize);
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use closeflow_core::chrono::{Duration, Utc};
    use closeflow_core::domain::event::{EventType, FlowEvent};
    use closeflow_core::domain::flow::{
        format_flow_number, Flow, FlowConfig, FlowDraft, FlowMetadata, FlowStatus, TenantId,
        SCANNABLE_STATUSES,
    };
    use closeflow_core::domain::query::{FlowFilter, FlowQuery, FlowSortField, SortDirection};

    use crate::repositories::{
        DueFlowQuery, EventRepository, FlowRepository, InMemoryEventRepository,
        InMemoryFlowRepository, RepositoryError,
    };

    fn flow(tenant: &str, sequence: u32) -> Flow {
        Flow::start(
            FlowDraft {
                tenant_id: TenantId(tenant.to_string()),
                proposal_id: format!("P-{sequence}"),
                flow_number: format_flow_number(2026, sequence),
                config: FlowConfig::default(),
                metadata: FlowMetadata::default(),
                max_attempts: 3,
            },
            Utc::now(),
        )
        .expect("valid draft")
    }

    #[tokio::test]
    async fn in_memory_flow_repo_round_trip_and_version_check() {
        let repo = InMemoryFlowRepository::default();
        let mut stored = flow("tenant-a", 1);
        repo.insert(&stored).await.expect("insert");

        stored.notes = Some("first edit".to_string());
        let stale = stored.clone();
        stored.version = repo.update(&stored).await.expect("update");
        assert_eq!(stored.version, 2);

        let error = repo.update(&stale).await.expect_err("stale update must fail");
        assert!(matches!(error, RepositoryError::VersionConflict { expected_version: 1, .. }));

        let found = repo.find_by_id(&stored.id).await.expect("find").expect("present");
        assert_eq!(found, stored);
    }

    #[tokio::test]
    async fn sequences_are_isolated_per_tenant() {
        let repo = InMemoryFlowRepository::default();
        let tenant_a = TenantId("tenant-a".to_string());
        let tenant_b = TenantId("tenant-b".to_string());

        assert_eq!(repo.next_flow_sequence(&tenant_a).await.expect("seq"), 1);
        assert_eq!(repo.next_flow_sequence(&tenant_a).await.expect("seq"), 2);
        assert_eq!(repo.next_flow_sequence(&tenant_b).await.expect("seq"), 1);
    }

    #[tokio::test]
    async fn due_query_matches_sql_semantics() {
        let repo = InMemoryFlowRepository::default();
        let now = Utc::now();

        let mut due = flow("tenant-a", 1);
        due.next_action_at = Some(now - Duration::minutes(1));
        let mut older = flow("tenant-a", 2);
        older.next_action_at = Some(now - Duration::minutes(30));
        let mut paused = flow("tenant-a", 3);
        paused.status = FlowStatus::Paused;
        paused.next_action_at = Some(now - Duration::minutes(5));
        let mut other_tenant = flow("tenant-b", 1);
        other_tenant.next_action_at = Some(now - Duration::minutes(5));

        for stored in [&due, &older, &paused, &other_tenant] {
            repo.insert(stored).await.expect("insert");
        }

        let selected = repo
            .find_due(&DueFlowQuery {
                tenant_id: Some(TenantId("tenant-a".to_string())),
                statuses: SCANNABLE_STATUSES.to_vec(),
                now,
                limit: 10,
            })
            .await
            .expect("due");

        let ids: Vec<_> = selected.iter().map(|flow| flow.id.clone()).collect();
        assert_eq!(ids, vec![older.id, due.id]);
    }

    #[tokio::test]
    async fn list_sorts_and_counts_before_pagination() {
        let repo = InMemoryFlowRepository::default();
        for sequence in 1..=4 {
            repo.insert(&flow("tenant-a", sequence)).await.expect("insert");
        }

        let page = repo
            .list(
                &FlowQuery {
                    filter: FlowFilter {
                        tenant_id: Some(TenantId("tenant-a".to_string())),
                        ..FlowFilter::default()
                    },
                    sort_by: FlowSortField::FlowNumber,
                    direction: SortDirection::Desc,
                    offset: 1,
                    limit: Some(2),
                },
                Utc::now(),
            )
            .await
            .expect("list");

        assert_eq!(page.total, 4);
        let numbers: Vec<_> = page.items.iter().map(|flow| flow.flow_number.as_str()).collect();
        assert_eq!(numbers, vec!["FL2026000003", "FL2026000002"]);
    }

    #[tokio::test]
    async fn recent_events_are_newest_first() {
        let repo = InMemoryEventRepository::default();
        let stored = flow("tenant-a", 1);
        let now = Utc::now();
        let first = FlowEvent::record(&stored, EventType::ProposalAccepted, "Proposal accepted", now);
        let second = FlowEvent::record(&stored, EventType::ContractCreated, "Contract generated", now);
        repo.append(&first).await.expect("append");
        repo.append(&second).await.expect("append");

        let recent = repo.list_recent(None, 1).await.expect("recent");
        assert_eq!(recent, vec![second.clone()]);
        assert_eq!(repo.list_for_flow(&stored.id).await.expect("list"), vec![first, second]);
    }
}
