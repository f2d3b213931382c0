use std::str::FromStr;

use dataagent_core::config::{AppConfig, LlmProvider, LoadOptions};
use dataagent_db::connect_with_config;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

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

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
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
            checks.push(check_llm_settings(&config));
            checks.extend(check_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["llm_settings", "database_connectivity", "datasource_connectivity"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_llm_settings(config: &AppConfig) -> DoctorCheck {
    let endpoint = match (&config.llm.base_url, config.llm.provider) {
        (Some(url), _) => url.clone(),
        (None, LlmProvider::OpenAi) => "https://api.openai.com/v1".to_string(),
        (None, LlmProvider::Ollama) => "<unset>".to_string(),
    };
    DoctorCheck {
        name: "llm_settings",
        status: CheckStatus::Pass,
        details: format!(
            "{:?} model `{}` at {endpoint}, {} retries on 429/503/504",
            config.llm.provider, config.llm.model, config.llm.max_retries
        ),
    }
}

fn check_connectivity(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return ["database_connectivity", "datasource_connectivity"]
                .into_iter()
                .map(|name| DoctorCheck {
                    name,
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                })
                .collect();
        }
    };

    runtime.block_on(async {
        let database = match connect_with_config(&config.database).await {
            Ok(pool) => {
                pool.close().await;
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Pass,
                    details: format!("connected using `{}`", config.database.url),
                }
            }
            Err(error) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to connect to database: {error}"),
            },
        };

        let datasource = match &config.datasource.url {
            None => DoctorCheck {
                name: "datasource_connectivity",
                status: CheckStatus::Skipped,
                details: "no datasource configured; generated sql runs against database.url"
                    .to_string(),
            },
            Some(url) => match datasource_table_count(url).await {
                Ok(tables) => DoctorCheck {
                    name: "datasource_connectivity",
                    status: CheckStatus::Pass,
                    details: format!("opened `{url}` read-only, {tables} tables visible"),
                },
                Err(error) => DoctorCheck {
                    name: "datasource_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to open datasource: {error}"),
                },
            },
        };

        vec![database, datasource]
    })
}

async fn datasource_table_count(url: &str) -> Result<i64, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?.read_only(true);
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_one(&pool)
    .await;
    pool.close().await;
    count
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
