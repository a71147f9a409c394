use crate::commands::{migrated_pool, prepare, CommandResult, StepFailure};
use closeflow_core::chrono::Utc;
use closeflow_db::{DemoSeedDataset, FlowSeedInfo, DEMO_TENANT_ID};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;

        let seed_result = DemoSeedDataset::load(&pool, Utc::now())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<SeedOutput, StepFailure> = if !verification.all_present {
            Err(("seed_verification", verification_failure_message(&verification.checks), 6u8))
        } else {
            Ok(SeedOutput { flows: seed_result.flows_seeded, skipped: seed_result.flows_skipped })
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(output) => {
            let mut lines = vec![format!(
                "demo dataset ready for tenant `{DEMO_TENANT_ID}`: {} seeded, {} already present",
                output.flows.len(),
                output.skipped
            )];
            lines.extend(output.flows.iter().map(|flow| {
                format!("  - {}: {} ({})", flow.flow_id, flow.status.as_str(), flow.description)
            }));
            CommandResult::success("seed", lines.join("\n"))
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

struct SeedOutput {
    flows: Vec<FlowSeedInfo>,
    skipped: usize,
}

fn verification_failure_message(checks: &[(&'static str, bool)]) -> String {
    let failed_checks =
        checks.iter().filter_map(|(check, passed)| (!passed).then_some(*check)).collect::<Vec<_>>();
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_failure_message;

    #[test]
    fn verification_error_message_targets_failed_checks() {
        let checks = [("flow-demo-001", true), ("flow-demo-004", false), ("flow-sequence", false)];

        assert_eq!(
            verification_failure_message(&checks),
            "Seed verification failed for checks: flow-demo-004, flow-sequence"
        );
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        let checks = [("flow-demo-001", true), ("flow-sequence", true)];

        assert_eq!(verification_failure_message(&checks), "Some seed data failed to load");
    }
}
