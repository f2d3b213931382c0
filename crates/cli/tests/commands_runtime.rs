use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use dataagent_cli::commands::{config, doctor, history, migrate, schema_prompt};
use dataagent_cli::PromptMode;
use dataagent_core::domain::turn::{ConversationTurn, ThreadId};
use dataagent_db::{
    connect, migrations, ConversationTurnRepository, SqlConversationTurnRepository,
};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("DATAAGENT_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_openai_without_key() {
    with_env(
        &[("DATAAGENT_DATABASE_URL", "sqlite::memory:"), ("DATAAGENT_LLM_PROVIDER", "openai")],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
            assert!(payload["message"].as_str().unwrap_or_default().contains("llm.api_key"));
        },
    );
}

#[test]
fn history_show_and_clear_operate_on_the_turn_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = sqlite_file_url(&dir.path().join("turns.db"));
    seed_turns(&url, "thread-7", &["how many orders?", "and per region?"]);

    with_env(&[("DATAAGENT_DATABASE_URL", url.as_str())], || {
        let shown = parse_payload(&history::show("thread-7").output);
        assert_eq!(shown["status"], "ok");
        let turns = shown["data"]["turns"].as_array().expect("turns array");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["sequence_number"], 1);
        assert_eq!(turns[1]["user_question"], "and per region?");

        let cleared = parse_payload(&history::clear("thread-7").output);
        assert_eq!(cleared["data"]["removed"], 2);

        let empty = parse_payload(&history::show("thread-7").output);
        assert_eq!(empty["data"]["turns"].as_array().map(Vec::len), Some(0));
    });
}

#[test]
fn history_rejects_blank_thread_ids() {
    let result = history::show("   ");
    assert_eq!(result.exit_code, 2);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["error_class"], "invalid_argument");
}

#[test]
fn schema_prompt_renders_tables_and_foreign_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("shop.json");
    fs::write(
        &path,
        r#"{
            "name": "shop",
            "tables": [
                {"name": "customer", "primary_keys": ["id"],
                 "columns": [{"name": "id"}, {"name": "region", "data_type": "text", "examples": ["north"]}]},
                {"name": "orders", "primary_keys": ["id"],
                 "columns": [{"name": "id"}, {"name": "customer_id"}, {"name": "total"}]}
            ],
            "foreign_keys": ["orders.customer_id=customer.id"]
        }"#,
    )
    .expect("write schema");

    let result = schema_prompt::run(&path, None, PromptMode::Auto);
    assert_eq!(result.exit_code, 0);
    assert!(result.output.contains("# Table: customer"));
    assert!(result.output.contains("# Table: orders"));
    assert!(result.output.contains("orders.customer_id=customer.id"));

    let missing = schema_prompt::run(&dir.path().join("absent.json"), None, PromptMode::None);
    assert_eq!(missing.exit_code, 2);
    assert_eq!(parse_payload(&missing.output)["error_class"], "schema_input");

    let smart_without_instruction = schema_prompt::run(&path, None, PromptMode::Smart);
    assert_eq!(parse_payload(&smart_without_instruction.output)["error_class"], "invalid_argument");
}

#[test]
fn doctor_json_reports_skipped_datasource_as_ready() {
    with_env(&[("DATAAGENT_DATABASE_URL", "sqlite::memory:")], || {
        let payload = parse_payload(&doctor::run(true));
        assert_eq!(payload["overall_status"], "pass");

        let checks = payload["checks"].as_array().expect("checks");
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("datasource_connectivity"), "skipped");
    });
}

#[test]
fn config_attributes_env_sources() {
    with_env(
        &[("DATAAGENT_DATABASE_URL", "sqlite::memory:"), ("DATAAGENT_AGENT_MAX_TURN_HISTORY", "3")],
        || {
            let output = config::run();
            assert!(output
                .contains("- agent.max_turn_history = 3 (source: env (DATAAGENT_AGENT_MAX_TURN_HISTORY))"));
            assert!(output.contains("- llm.api_key = <unset> (source: default)"));
        },
    );
}

fn seed_turns(url: &str, thread: &str, questions: &[&str]) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let pool = connect(url).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repository = SqlConversationTurnRepository::new(pool.clone());
        for (index, question) in questions.iter().enumerate() {
            repository
                .insert(ConversationTurn::new(
                    ThreadId::new(thread),
                    index as i64 + 1,
                    *question,
                    format!("plan {}", index + 1),
                ))
                .await
                .expect("insert turn");
        }
        pool.close().await;
    });
}

fn sqlite_file_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "DATAAGENT_DATABASE_URL",
        "DATAAGENT_DATABASE_MAX_CONNECTIONS",
        "DATAAGENT_DATABASE_TIMEOUT_SECS",
        "DATAAGENT_DATASOURCE_URL",
        "DATAAGENT_DATASOURCE_MAX_ROWS",
        "DATAAGENT_LLM_PROVIDER",
        "DATAAGENT_LLM_API_KEY",
        "DATAAGENT_LLM_BASE_URL",
        "DATAAGENT_LLM_MODEL",
        "DATAAGENT_LLM_TIMEOUT_SECS",
        "DATAAGENT_LLM_MAX_RETRIES",
        "DATAAGENT_SERVER_BIND_ADDRESS",
        "DATAAGENT_SERVER_PORT",
        "DATAAGENT_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "DATAAGENT_LOGGING_LEVEL",
        "DATAAGENT_LOGGING_FORMAT",
        "DATAAGENT_LOG_LEVEL",
        "DATAAGENT_LOG_FORMAT",
        "DATAAGENT_AGENT_MAX_TURN_HISTORY",
        "DATAAGENT_AGENT_HUMAN_REVIEW_ENABLED",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
