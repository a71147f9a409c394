use closeflow_core::chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;

use closeflow_core::domain::event::{EventType, FlowEvent};
use closeflow_core::domain::flow::{
    format_flow_number, Flow, FlowConfig, FlowDraft, FlowId, FlowMetadata, FlowStatus, TenantId,
    DEFAULT_MAX_ATTEMPTS,
};

use crate::connection::DbPool;
use crate::repositories::{
    EventRepository, FlowRepository, RepositoryError, SqlEventRepository, SqlFlowRepository,
};

pub const DEMO_TENANT_ID: &str = "tenant-demo";

/// Canonical demo flows, one per interesting lifecycle position.
const SEED_FLOWS: &[SeedFlowContract] = &[
    SeedFlowContract {
        flow_id: "flow-demo-001",
        sequence: 1,
        proposal_id: "proposal-demo-001",
        status: FlowStatus::ProposalAccepted,
        current_stage: 1,
        contract_id: None,
        invoice_id: None,
        attempt_count: 0,
        last_error: None,
        due_offset_minutes: Some(-5),
        description: "Freshly accepted proposal waiting for contract generation",
    },
    SeedFlowContract {
        flow_id: "flow-demo-002",
        sequence: 2,
        proposal_id: "proposal-demo-002",
        status: FlowStatus::ContractSent,
        current_stage: 3,
        contract_id: Some("CTR-DEMO-002"),
        invoice_id: None,
        attempt_count: 0,
        last_error: None,
        due_offset_minutes: Some(-1),
        description: "Contract sent, polling for signature",
    },
    SeedFlowContract {
        flow_id: "flow-demo-003",
        sequence: 3,
        proposal_id: "proposal-demo-003",
        status: FlowStatus::InvoiceGenerated,
        current_stage: 5,
        contract_id: Some("CTR-DEMO-003"),
        invoice_id: Some("INV-DEMO-003"),
        attempt_count: 0,
        last_error: None,
        due_offset_minutes: Some(120),
        description: "Invoice issued, next payment check in two hours",
    },
    SeedFlowContract {
        flow_id: "flow-demo-004",
        sequence: 4,
        proposal_id: "proposal-demo-004",
        status: FlowStatus::Failed,
        current_stage: 2,
        contract_id: Some("CTR-DEMO-004"),
        invoice_id: None,
        attempt_count: 1,
        last_error: Some("mail relay unavailable"),
        due_offset_minutes: Some(-10),
        description: "Contract delivery failed once, retry is due",
    },
    SeedFlowContract {
        flow_id: "flow-demo-005",
        sequence: 5,
        proposal_id: "proposal-demo-005",
        status: FlowStatus::Paused,
        current_stage: 3,
        contract_id: Some("CTR-DEMO-005"),
        invoice_id: None,
        attempt_count: 0,
        last_error: None,
        due_offset_minutes: Some(-30),
        description: "Paused by an operator while the client reviews terms",
    },
    SeedFlowContract {
        flow_id: "flow-demo-006",
        sequence: 6,
        proposal_id: "proposal-demo-006",
        status: FlowStatus::Completed,
        current_stage: 6,
        contract_id: Some("CTR-DEMO-006"),
        invoice_id: Some("INV-DEMO-006"),
        attempt_count: 0,
        last_error: None,
        due_offset_minutes: None,
        description: "Paid and completed",
    },
];

struct SeedFlowContract {
    flow_id: &'static str,
    sequence: u32,
    proposal_id: &'static str,
    status: FlowStatus,
    current_stage: u32,
    contract_id: Option<&'static str>,
    invoice_id: Option<&'static str>,
    attempt_count: u32,
    last_error: Option<&'static str>,
    due_offset_minutes: Option<i64>,
    description: &'static str,
}

impl SeedFlowContract {
    fn build(&self, now: DateTime<Utc>) -> Result<Flow, RepositoryError> {
        let mut flow = Flow::start(
            FlowDraft {
                tenant_id: TenantId(DEMO_TENANT_ID.to_string()),
                proposal_id: self.proposal_id.to_string(),
                flow_number: format_flow_number(now.year(), self.sequence),
                config: FlowConfig::default(),
                metadata: FlowMetadata {
                    client_id: Some(format!("client-{:03}", self.sequence)),
                    owner_id: Some("user-demo".to_string()),
                    total_amount: Some(Decimal::new(i64::from(self.sequence) * 1_000_000, 2)),
                    currency: Some("BRL".to_string()),
                    tags: vec!["demo".to_string()],
                    ..FlowMetadata::default()
                },
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            },
            now,
        )
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        flow.id = FlowId(self.flow_id.to_string());
        flow.status = self.status;
        flow.current_stage = self.current_stage;
        flow.contract_id = self.contract_id.map(str::to_string);
        flow.invoice_id = self.invoice_id.map(str::to_string);
        flow.attempt_count = self.attempt_count;
        flow.last_error = self.last_error.map(str::to_string);
        flow.next_action_at = self.due_offset_minutes.map(|offset| now + Duration::minutes(offset));
        if self.status == FlowStatus::Completed {
            flow.completed_at = Some(now);
        }
        Ok(flow)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowSeedInfo {
    pub flow_id: &'static str,
    pub status: FlowStatus,
    pub description: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub flows_seeded: Vec<FlowSeedInfo>,
    pub flows_skipped: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

/// Deterministic demo data for local runs and smoke tests.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub fn flow_ids() -> impl Iterator<Item = &'static str> {
        SEED_FLOWS.iter().map(|flow| flow.flow_id)
    }

    /// Inserts the demo flows that are not already present. Re-running is a no-op.
    pub async fn load(pool: &DbPool, now: DateTime<Utc>) -> Result<SeedResult, RepositoryError> {
        let flows = SqlFlowRepository::new(pool.clone());
        let events = SqlEventRepository::new(pool.clone());
        let mut flows_seeded = Vec::new();
        let mut flows_skipped = 0;

        for contract in SEED_FLOWS {
            let flow = contract.build(now)?;
            if flows.find_by_id(&flow.id).await?.is_some() {
                flows_skipped += 1;
                continue;
            }

            flows.insert(&flow).await?;
            events
                .append(
                    &FlowEvent::record(&flow, EventType::ProposalAccepted, "Proposal accepted", now)
                        .with_description(contract.description)
                        .processed_by("seed"),
                )
                .await?;
            flows_seeded.push(FlowSeedInfo {
                flow_id: contract.flow_id,
                status: contract.status,
                description: contract.description,
            });
        }

        let highest = SEED_FLOWS.iter().map(|flow| flow.sequence).max().unwrap_or_default();
        sqlx::query(
            "INSERT INTO flow_sequence (tenant_id, last_value) VALUES (?, ?)
             ON CONFLICT(tenant_id) DO UPDATE SET last_value = MAX(last_value, excluded.last_value)",
        )
        .bind(DEMO_TENANT_ID)
        .bind(i64::from(highest))
        .execute(pool)
        .await?;

        Ok(SeedResult { flows_seeded, flows_skipped })
    }

    /// Checks that every demo flow exists with its contracted status and stage.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for contract in SEED_FLOWS {
            let state_ok: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM flow WHERE id = ?1 AND tenant_id = ?2 AND status = ?3 AND current_stage = ?4)",
            )
            .bind(contract.flow_id)
            .bind(DEMO_TENANT_ID)
            .bind(contract.status.as_str())
            .bind(i64::from(contract.current_stage))
            .fetch_one(pool)
            .await?;
            checks.push((contract.flow_id, state_ok == 1));

            let accepted_events: i64 = sqlx::query_scalar(
                "SELECT COUNT(1) FROM flow_event WHERE flow_id = ?1 AND event_type = 'proposal_accepted'",
            )
            .bind(contract.flow_id)
            .fetch_one(pool)
            .await?;
            checks.push(("proposal_accepted event", accepted_events >= 1));
        }

        let sequence: Option<i64> =
            sqlx::query_scalar("SELECT last_value FROM flow_sequence WHERE tenant_id = ?")
                .bind(DEMO_TENANT_ID)
                .fetch_optional(pool)
                .await?;
        checks.push(("flow-sequence", sequence.unwrap_or_default() >= SEED_FLOWS.len() as i64));

        let all_present = checks.iter().all(|(_, exists)| *exists);
        Ok(VerificationResult { all_present, checks })
    }
}
