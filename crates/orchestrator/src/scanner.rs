use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::service::FlowOrchestrator;

/// Handle to the periodic due-flow scanner.
pub struct ScannerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    /// Signals the loop and waits for the in-flight batch, if any, to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            warn!(
                event_name = "flow.scanner.join_failed",
                correlation_id = "shutdown",
                error = %error,
                "background scanner task ended abnormally"
            );
        }
    }
}

/// Scans all tenants every `period`; the first scan runs one period after start.
pub fn spawn_scanner(orchestrator: Arc<FlowOrchestrator>, period: Duration) -> ScannerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            event_name = "flow.scanner.started",
            correlation_id = "scanner",
            period_secs = period.as_secs(),
            "background scanner started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = orchestrator.process_pending_flows(None).await {
                        warn!(
                            event_name = "flow.scanner.batch_failed",
                            correlation_id = "scanner",
                            error = %error,
                            "due-flow batch could not run"
                        );
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!(
            event_name = "flow.scanner.stopped",
            correlation_id = "scanner",
            "background scanner stopped"
        );
    });

    ScannerHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use closeflow_core::domain::flow::{FlowStatus, TenantId};
    use closeflow_core::executor::ScriptedStageExecutor;
    use closeflow_db::repositories::{FlowRepository, InMemoryEventRepository, InMemoryFlowRepository};

    use super::spawn_scanner;
    use crate::service::{CreateFlowRequest, FlowOrchestrator, OrchestratorSettings};

    #[tokio::test]
    async fn background_scanner_processes_due_flows_and_stops() {
        let flows = Arc::new(InMemoryFlowRepository::default());
        let orchestrator = Arc::new(FlowOrchestrator::new(
            flows.clone(),
            Arc::new(InMemoryEventRepository::default()),
            Arc::new(ScriptedStageExecutor::new()),
            OrchestratorSettings::default(),
        ));
        let flow = orchestrator
            .create_flow(CreateFlowRequest {
                tenant_id: TenantId("tenant-a".to_string()),
                proposal_id: "P-1".to_string(),
                ..CreateFlowRequest::default()
            })
            .await
            .expect("create");
        let mut due = flows.find_by_id(&flow.id).await.expect("find").expect("present");
        due.next_action_at = Some(Utc::now() - chrono::Duration::minutes(1));
        flows.update(&due).await.expect("update");

        let handle = spawn_scanner(orchestrator.clone(), Duration::from_millis(20));
        let mut advanced = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let current = flows.find_by_id(&flow.id).await.expect("find").expect("present");
            if current.status == FlowStatus::ContractGenerated {
                advanced = true;
                break;
            }
        }
        handle.stop().await;

        assert!(advanced, "scanner should advance the due flow");
    }
}
