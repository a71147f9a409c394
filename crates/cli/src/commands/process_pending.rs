use crate::commands::{migrated_pool, prepare, CommandResult, StepFailure};
use closeflow_core::domain::flow::TenantId;
use closeflow_orchestrator::{sql_orchestrator, ScanReport};

pub fn run(tenant: Option<&str>) -> CommandResult {
    let (config, runtime) = match prepare("process-pending") {
        Ok(prepared) => prepared,
        Err(result) => return result,
    };
    let tenant = tenant.map(str::trim).filter(|tenant| !tenant.is_empty()).map(|tenant| {
        TenantId(tenant.to_string())
    });

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let orchestrator = sql_orchestrator(pool.clone(), &config)
            .map_err(|error| ("executor_setup", error.to_string(), 6u8))?;
        let report = orchestrator
            .process_pending_flows(tenant.as_ref())
            .await
            .map_err(|error| ("scan", error.to_string(), 7u8))?;
        pool.close().await;
        Ok::<ScanReport, StepFailure>(report)
    });

    match result {
        Ok(report) => CommandResult::success("process-pending", summarize(&report)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("process-pending", error_class, message, exit_code)
        }
    }
}

fn summarize(report: &ScanReport) -> String {
    format!(
        "processed due flows: {} selected, {} succeeded, {} failed, {} skipped",
        report.selected, report.succeeded, report.failed, report.skipped
    )
}

#[cfg(test)]
mod tests {
    use closeflow_orchestrator::ScanReport;

    use super::summarize;

    #[test]
    fn summary_lists_every_counter() {
        let report = ScanReport { selected: 4, succeeded: 2, failed: 1, skipped: 1 };

        assert_eq!(
            summarize(&report),
            "processed due flows: 4 selected, 2 succeeded, 1 failed, 1 skipped"
        );
    }
}
