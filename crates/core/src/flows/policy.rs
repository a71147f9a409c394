//! Stage table for the post-sale saga.
//!
//! Each non-terminal working status maps to exactly one [`StageRule`]: the executor
//! action to run, the status to move to when it succeeds, and how long to wait when a
//! polling action reports "not yet". Adding a stage is an edit to [`STAGE_TABLE`].

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::domain::event::{EventData, EventResult, EventType, FlowEvent};
use crate::domain::flow::{Flow, FlowStatus};
use crate::errors::DomainError;
use crate::executor::{StageAction, StageEffect};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageAdvance {
    pub to: FlowStatus,
    /// `None` for the final stage, which clears the schedule.
    pub delay_minutes: Option<i64>,
    pub event_type: EventType,
    pub title: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageRule {
    pub status: FlowStatus,
    pub action: StageAction,
    pub advance: StageAdvance,
    /// Re-poll delay when the action reports the external step is still pending.
    pub waiting_delay_minutes: Option<i64>,
}

pub const STAGE_TABLE: [StageRule; 5] = [
    StageRule {
        status: FlowStatus::ProposalAccepted,
        action: StageAction::GenerateContract,
        advance: StageAdvance {
            to: FlowStatus::ContractGenerated,
            delay_minutes: Some(5),
            event_type: EventType::ContractCreated,
            title: "Contract generated",
        },
        waiting_delay_minutes: None,
    },
    StageRule {
        status: FlowStatus::ContractGenerated,
        action: StageAction::SendContract,
        advance: StageAdvance {
            to: FlowStatus::ContractSent,
            delay_minutes: Some(60),
            event_type: EventType::ContractSent,
            title: "Contract sent to client",
        },
        waiting_delay_minutes: None,
    },
    StageRule {
        status: FlowStatus::ContractSent,
        action: StageAction::CheckSignature,
        advance: StageAdvance {
            to: FlowStatus::ContractSigned,
            delay_minutes: Some(5),
            event_type: EventType::ContractSigned,
            title: "Contract signed",
        },
        waiting_delay_minutes: Some(120),
    },
    StageRule {
        status: FlowStatus::ContractSigned,
        action: StageAction::GenerateInvoice,
        advance: StageAdvance {
            to: FlowStatus::InvoiceGenerated,
            delay_minutes: Some(60),
            event_type: EventType::InvoiceCreated,
            title: "Invoice generated",
        },
        waiting_delay_minutes: None,
    },
    StageRule {
        status: FlowStatus::InvoiceGenerated,
        action: StageAction::CheckPayment,
        advance: StageAdvance {
            to: FlowStatus::Completed,
            delay_minutes: None,
            event_type: EventType::PaymentReceived,
            title: "Payment received",
        },
        waiting_delay_minutes: Some(240),
    },
];

pub fn rule_for(status: FlowStatus) -> Result<&'static StageRule, DomainError> {
    STAGE_TABLE
        .iter()
        .find(|rule| rule.status == status)
        .ok_or(DomainError::UnsupportedStatus(status))
}

/// Resolves the rule for a flow, sending a failed flow back to the stage it failed in.
pub fn rule_for_flow(flow: &Flow) -> Result<&'static StageRule, DomainError> {
    let status = match flow.status {
        FlowStatus::Failed => FlowStatus::for_stage(flow.current_stage)
            .ok_or(DomainError::UnsupportedStatus(FlowStatus::Failed))?,
        status => status,
    };
    rule_for(status)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Advanced { from: FlowStatus, to: FlowStatus },
    Waiting { retry_at: DateTime<Utc> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageReport {
    pub outcome: StageOutcome,
    pub event: Option<FlowEvent>,
}

impl StageRule {
    /// Folds a successful executor result into `flow`. Returns the event to append
    /// when the flow advanced.
    pub fn apply(
        &self,
        flow: &mut Flow,
        effect: &StageEffect,
        now: DateTime<Utc>,
    ) -> Result<StageReport, DomainError> {
        if effect.action() != self.action {
            return Err(DomainError::InvariantViolation(format!(
                "stage `{}` received result for `{}`",
                self.action,
                effect.action()
            )));
        }

        let (advanced, entity) = match effect {
            StageEffect::ContractGenerated { contract_id } => {
                flow.contract_id = Some(contract_id.clone());
                (true, Some((contract_id.clone(), "contract")))
            }
            StageEffect::ContractSent => (true, flow.contract_id.clone().map(|id| (id, "contract"))),
            StageEffect::SignatureChecked { signed } => {
                (*signed, flow.contract_id.clone().map(|id| (id, "contract")))
            }
            StageEffect::InvoiceGenerated { invoice_id } => {
                flow.invoice_id = Some(invoice_id.clone());
                (true, Some((invoice_id.clone(), "invoice")))
            }
            StageEffect::PaymentChecked { paid } => {
                (*paid, flow.invoice_id.clone().map(|id| (id, "invoice")))
            }
        };

        if !advanced {
            let delay = Duration::minutes(self.waiting_delay_minutes.unwrap_or(60));
            flow.status = self.status;
            flow.schedule_next_action(delay, now);
            return Ok(StageReport {
                outcome: StageOutcome::Waiting { retry_at: now + delay },
                event: None,
            });
        }

        let from = flow.status;
        let from_stage = flow.current_stage;
        match self.advance.delay_minutes {
            Some(delay_minutes) => {
                flow.status = self.advance.to;
                flow.advance_stage();
                flow.schedule_next_action(Duration::minutes(delay_minutes), now);
            }
            None => flow.mark_completed(now),
        }
        flow.reset_attempts();
        flow.last_error = None;

        let (entity_id, entity_type) = match entity {
            Some((id, kind)) => (Some(id), Some(kind.to_string())),
            None => (None, None),
        };
        let event = FlowEvent::record(flow, self.advance.event_type, self.advance.title, now)
            .with_data(EventData {
                entity_id: entity_id.clone(),
                entity_type,
                before: Some(json!({ "status": from.as_str(), "stage": from_stage })),
                after: Some(json!({
                    "status": flow.status.as_str(),
                    "stage": flow.current_stage,
                    "nextActionAt": flow.next_action_at,
                })),
                parameters: None,
            })
            .with_result(EventResult {
                success: true,
                payload: entity_id.map(|id| json!({ "id": id })),
                message: None,
                error_code: None,
            });

        Ok(StageReport {
            outcome: StageOutcome::Advanced { from, to: flow.status },
            event: Some(event),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::{rule_for, rule_for_flow, StageOutcome, STAGE_TABLE};
    use crate::domain::event::EventType;
    use crate::domain::flow::{
        format_flow_number, Flow, FlowConfig, FlowDraft, FlowMetadata, FlowStatus, TenantId,
    };
    use crate::errors::DomainError;
    use crate::executor::{StageAction, StageEffect};
    use crate::flows::backoff::BackoffPolicy;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn flow(now: DateTime<Utc>) -> Flow {
        Flow::start(
            FlowDraft {
                tenant_id: TenantId("tenant-a".to_string()),
                proposal_id: "P-1".to_string(),
                flow_number: format_flow_number(2026, 1),
                config: FlowConfig::default(),
                metadata: FlowMetadata::default(),
                max_attempts: 3,
            },
            now,
        )
        .expect("valid draft")
    }

    fn success_for(action: StageAction) -> StageEffect {
        match action {
            StageAction::GenerateContract => {
                StageEffect::ContractGenerated { contract_id: "CTR-1".to_string() }
            }
            StageAction::SendContract => StageEffect::ContractSent,
            StageAction::CheckSignature => StageEffect::SignatureChecked { signed: true },
            StageAction::GenerateInvoice => {
                StageEffect::InvoiceGenerated { invoice_id: "INV-1".to_string() }
            }
            StageAction::CheckPayment => StageEffect::PaymentChecked { paid: true },
        }
    }

    #[test]
    fn every_working_status_has_exactly_one_rule() {
        for status in FlowStatus::ALL {
            let count = STAGE_TABLE.iter().filter(|rule| rule.status == status).count();
            let expected = usize::from(matches!(
                status,
                FlowStatus::ProposalAccepted
                    | FlowStatus::ContractGenerated
                    | FlowStatus::ContractSent
                    | FlowStatus::ContractSigned
                    | FlowStatus::InvoiceGenerated
            ));
            assert_eq!(count, expected, "status {status}");
        }
    }

    #[test]
    fn statuses_without_handler_are_rejected() {
        for status in [FlowStatus::Completed, FlowStatus::Paused, FlowStatus::PaymentProcessed] {
            assert_eq!(rule_for(status), Err(DomainError::UnsupportedStatus(status)));
        }
    }

    #[test]
    fn happy_path_walks_every_stage_with_expected_delays() {
        let now = ts("2026-03-01T10:00:00Z");
        let mut flow = flow(now);
        let expected = [
            (FlowStatus::ContractGenerated, 2, Some(5), EventType::ContractCreated),
            (FlowStatus::ContractSent, 3, Some(60), EventType::ContractSent),
            (FlowStatus::ContractSigned, 4, Some(5), EventType::ContractSigned),
            (FlowStatus::InvoiceGenerated, 5, Some(60), EventType::InvoiceCreated),
            (FlowStatus::Completed, 6, None, EventType::PaymentReceived),
        ];

        for (status, stage, delay, event_type) in expected {
            let rule = rule_for_flow(&flow).expect("rule");
            let report = rule.apply(&mut flow, &success_for(rule.action), now).expect("apply");

            assert_eq!(flow.status, status);
            assert_eq!(flow.current_stage, stage);
            assert_eq!(flow.attempt_count, 0);
            assert_eq!(flow.next_action_at, delay.map(|minutes| now + Duration::minutes(minutes)));
            let event = report.event.expect("advancing emits an event");
            assert_eq!(event.event_type, event_type);
            assert!(matches!(report.outcome, StageOutcome::Advanced { to, .. } if to == status));
        }

        assert_eq!(flow.contract_id.as_deref(), Some("CTR-1"));
        assert_eq!(flow.invoice_id.as_deref(), Some("INV-1"));
        assert_eq!(flow.completed_at, Some(now));
    }

    #[test]
    fn unsigned_contract_waits_two_hours_without_event() {
        let now = ts("2026-03-01T10:00:00Z");
        let mut flow = flow(now);
        flow.status = FlowStatus::ContractSent;
        flow.current_stage = 3;

        let rule = rule_for_flow(&flow).expect("rule");
        let report = rule
            .apply(&mut flow, &StageEffect::SignatureChecked { signed: false }, now)
            .expect("apply");

        assert_eq!(flow.status, FlowStatus::ContractSent);
        assert_eq!(flow.current_stage, 3);
        assert_eq!(flow.next_action_at, Some(now + Duration::minutes(120)));
        assert!(report.event.is_none());
        assert_eq!(report.outcome, StageOutcome::Waiting { retry_at: now + Duration::minutes(120) });
    }

    #[test]
    fn unpaid_invoice_waits_four_hours() {
        let now = ts("2026-03-01T10:00:00Z");
        let mut flow = flow(now);
        flow.status = FlowStatus::InvoiceGenerated;
        flow.current_stage = 5;

        let rule = rule_for_flow(&flow).expect("rule");
        rule.apply(&mut flow, &StageEffect::PaymentChecked { paid: false }, now).expect("apply");

        assert_eq!(flow.status, FlowStatus::InvoiceGenerated);
        assert_eq!(flow.next_action_at, Some(now + Duration::minutes(240)));
    }

    #[test]
    fn failed_flow_retries_the_stage_it_failed_in() {
        let now = ts("2026-03-01T10:00:00Z");
        let mut flow = flow(now);
        flow.status = FlowStatus::ContractGenerated;
        flow.current_stage = 2;
        flow.mark_failed("smtp down", &BackoffPolicy::default(), now);

        let rule = rule_for_flow(&flow).expect("rule");
        assert_eq!(rule.action, StageAction::SendContract);

        rule.apply(&mut flow, &StageEffect::ContractSent, now).expect("apply");
        assert_eq!(flow.status, FlowStatus::ContractSent);
        assert_eq!(flow.current_stage, 3);
        assert_eq!(flow.attempt_count, 0);
        assert_eq!(flow.last_error, None);
    }

    #[test]
    fn mismatched_effect_is_an_invariant_violation() {
        let now = Utc::now();
        let mut flow = flow(now);
        let rule = rule_for_flow(&flow).expect("rule");

        let error = rule.apply(&mut flow, &StageEffect::ContractSent, now).expect_err("mismatch");
        assert!(matches!(error, DomainError::InvariantViolation(_)));
        assert_eq!(flow.status, FlowStatus::ProposalAccepted);
    }
}
