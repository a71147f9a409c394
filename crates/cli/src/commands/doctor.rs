use closeflow_core::config::{AppConfig, ExecutorMode, LoadOptions};
use closeflow_db::{connect_with_settings, migrations, ping};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult { exit_code, output };
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_executor(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["executor_readiness", "database_connectivity", "migration_state"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_executor(config: &AppConfig) -> DoctorCheck {
    let details = match config.executor.mode {
        ExecutorMode::Simulated => format!(
            "simulated executor (signature probability {}, payment probability {})",
            config.executor.signature_probability, config.executor.payment_probability
        ),
        ExecutorMode::Http => format!(
            "http executor targeting `{}` (token {})",
            config.executor.base_url.as_deref().unwrap_or("<unset>"),
            if config.executor.api_token.is_some() { "configured" } else { "<unset>" }
        ),
    };
    DoctorCheck { name: "executor_readiness", status: CheckStatus::Pass, details }
}

/// Connectivity first; the migration check only runs against a reachable database.
fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                },
                skipped_migration_check(),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    skipped_migration_check(),
                ];
            }
        };

        let connectivity = match ping(&pool).await {
            Ok(()) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            Err(error) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("database query failed: {error}"),
            },
        };
        let migration = if connectivity.status == CheckStatus::Pass {
            let applied =
                migrations::current_version(&pool).await.map_err(|error| error.to_string());
            migration_check(applied, latest_migration_version())
        } else {
            skipped_migration_check()
        };

        pool.close().await;
        vec![connectivity, migration]
    })
}

fn latest_migration_version() -> Option<i64> {
    migrations::MIGRATOR.iter().map(|migration| migration.version).max()
}

fn migration_check(applied: Result<Option<i64>, String>, latest: Option<i64>) -> DoctorCheck {
    let (status, details) = match (applied, latest) {
        (Err(error), _) => (CheckStatus::Fail, format!("could not read migration state: {error}")),
        (Ok(None), _) => {
            (CheckStatus::Fail, "no migrations applied; run `closeflow migrate`".to_string())
        }
        (Ok(Some(applied)), Some(latest)) if applied < latest => (
            CheckStatus::Fail,
            format!("schema version {applied} is behind {latest}; run `closeflow migrate`"),
        ),
        (Ok(Some(applied)), _) => (CheckStatus::Pass, format!("schema at version {applied}")),
    };
    DoctorCheck { name: "migration_state", status, details }
}

fn skipped_migration_check() -> DoctorCheck {
    DoctorCheck {
        name: "migration_state",
        status: CheckStatus::Skipped,
        details: "skipped because the database is unreachable".to_string(),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
