pub mod http_executor;
pub mod locks;
pub mod scanner;
pub mod service;

use std::sync::Arc;

use closeflow_core::config::{AppConfig, ExecutorConfig, ExecutorMode};
use closeflow_core::errors::ApplicationError;
use closeflow_core::executor::{SimulatedStageExecutor, StageExecutor};
use closeflow_db::repositories::{SqlEventRepository, SqlFlowRepository};
use closeflow_db::DbPool;

pub use http_executor::HttpStageExecutor;
pub use locks::{FlowGuard, FlowLocks};
pub use scanner::{spawn_scanner, ScannerHandle};
pub use service::{
    Backlog, CreateFlowRequest, Dashboard, FlowOrchestrator, OrchestratorSettings, ScanRecord,
    ScanReport,
};

pub fn executor_from_config(
    config: &ExecutorConfig,
) -> Result<Arc<dyn StageExecutor>, ApplicationError> {
    match config.mode {
        ExecutorMode::Simulated => Ok(Arc::new(SimulatedStageExecutor::new(
            config.signature_probability,
            config.payment_probability,
            config.seed,
        ))),
        ExecutorMode::Http => Ok(Arc::new(HttpStageExecutor::from_config(config)?)),
    }
}

/// Orchestrator over the SQL repositories with the executor selected by config.
pub fn sql_orchestrator(
    pool: DbPool,
    config: &AppConfig,
) -> Result<FlowOrchestrator, ApplicationError> {
    Ok(FlowOrchestrator::new(
        Arc::new(SqlFlowRepository::new(pool.clone())),
        Arc::new(SqlEventRepository::new(pool)),
        executor_from_config(&config.executor)?,
        OrchestratorSettings::from(&config.orchestrator),
    ))
}
