use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::sql_retry::RetryBudget;
use crate::workflow::WorkflowLimits;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub datasource: DatasourceConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub agent: AgentConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Business database that generated SQL runs against.
#[derive(Clone, Debug)]
pub struct DatasourceConfig {
    pub url: Option<String>,
    pub max_rows: u32,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_turn_history: usize,
    pub max_plan_summary_length: usize,
    pub max_plan_repair_attempts: u32,
    pub max_sql_syntax_retries: u32,
    pub max_sql_semantic_retries: u32,
    pub max_sql_execution_retries: u32,
    pub max_sql_total_retries: u32,
    pub human_review_enabled: bool,
    pub prompt_dir: Option<PathBuf>,
    pub flush_concurrency: usize,
    pub flush_timeout_ms: u64,
    pub store_retry_attempts: u32,
    pub store_retry_base_delay_ms: u64,
    pub structured_output_repairs: u32,
}

impl AgentConfig {
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget {
            max_syntax: self.max_sql_syntax_retries,
            max_semantic: self.max_sql_semantic_retries,
            max_execution: self.max_sql_execution_retries,
            max_total: self.max_sql_total_retries,
        }
    }

    pub fn workflow_limits(&self) -> WorkflowLimits {
        WorkflowLimits {
            max_plan_repair_attempts: self.max_plan_repair_attempts,
            retry_budget: self.retry_budget(),
            human_review_enabled: self.human_review_enabled,
        }
    }

    pub fn store_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.store_retry_attempts, self.store_retry_base_delay_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub datasource_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub human_review_enabled: Option<bool>,
    pub prompt_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turn_history: 5,
            max_plan_summary_length: 2000,
            max_plan_repair_attempts: 2,
            max_sql_syntax_retries: 3,
            max_sql_semantic_retries: 3,
            max_sql_execution_retries: 3,
            max_sql_total_retries: 10,
            human_review_enabled: false,
            prompt_dir: None,
            flush_concurrency: 4,
            flush_timeout_ms: 5_000,
            store_retry_attempts: 3,
            store_retry_base_delay_ms: 100,
            structured_output_repairs: 3,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://dataagent.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            datasource: DatasourceConfig { url: None, max_rows: 500 },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "qwen2.5".to_string(),
                timeout_secs: 60,
                temperature: 0.1,
                max_retries: 3,
                retry_initial_delay_ms: 2_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            agent: AgentConfig::default(),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dataagent.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(datasource) = patch.datasource {
            if let Some(url) = datasource.url {
                self.datasource.url = Some(url);
            }
            if let Some(max_rows) = datasource.max_rows {
                self.datasource.max_rows = max_rows;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(retry_initial_delay_ms) = llm.retry_initial_delay_ms {
                self.llm.retry_initial_delay_ms = retry_initial_delay_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(agent) = patch.agent {
            self.agent.apply_patch(agent);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DATAAGENT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DATAAGENT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("DATAAGENT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DATAAGENT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DATAAGENT_DATASOURCE_URL") {
            self.datasource.url = Some(value);
        }
        if let Some(value) = read_env("DATAAGENT_DATASOURCE_MAX_ROWS") {
            self.datasource.max_rows = parse_u32("DATAAGENT_DATASOURCE_MAX_ROWS", &value)?;
        }

        if let Some(value) = read_env("DATAAGENT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("DATAAGENT_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DATAAGENT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("DATAAGENT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("DATAAGENT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("DATAAGENT_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("DATAAGENT_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("DATAAGENT_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("DATAAGENT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DATAAGENT_SERVER_PORT") {
            self.server.port = parse_u16("DATAAGENT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DATAAGENT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("DATAAGENT_LOGGING_LEVEL").or_else(|| read_env("DATAAGENT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DATAAGENT_LOGGING_FORMAT").or_else(|| read_env("DATAAGENT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        self.agent.apply_env_overrides()
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(datasource_url) = overrides.datasource_url {
            self.datasource.url = Some(datasource_url);
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
        if let Some(human_review_enabled) = overrides.human_review_enabled {
            self.agent.human_review_enabled = human_review_enabled;
        }
        if let Some(prompt_dir) = overrides.prompt_dir {
            self.agent.prompt_dir = Some(prompt_dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_datasource(&self.datasource)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_agent(&self.agent)?;
        Ok(())
    }
}

impl AgentConfig {
    fn apply_patch(&mut self, patch: AgentPatch) {
        if let Some(value) = patch.max_turn_history {
            self.max_turn_history = value;
        }
        if let Some(value) = patch.max_plan_summary_length {
            self.max_plan_summary_length = value;
        }
        if let Some(value) = patch.max_plan_repair_attempts {
            self.max_plan_repair_attempts = value;
        }
        if let Some(value) = patch.max_sql_syntax_retries {
            self.max_sql_syntax_retries = value;
        }
        if let Some(value) = patch.max_sql_semantic_retries {
            self.max_sql_semantic_retries = value;
        }
        if let Some(value) = patch.max_sql_execution_retries {
            self.max_sql_execution_retries = value;
        }
        if let Some(value) = patch.max_sql_total_retries {
            self.max_sql_total_retries = value;
        }
        if let Some(value) = patch.human_review_enabled {
            self.human_review_enabled = value;
        }
        if let Some(value) = patch.prompt_dir {
            self.prompt_dir = Some(value);
        }
        if let Some(value) = patch.flush_concurrency {
            self.flush_concurrency = value;
        }
        if let Some(value) = patch.flush_timeout_ms {
            self.flush_timeout_ms = value;
        }
        if let Some(value) = patch.store_retry_attempts {
            self.store_retry_attempts = value;
        }
        if let Some(value) = patch.store_retry_base_delay_ms {
            self.store_retry_base_delay_ms = value;
        }
        if let Some(value) = patch.structured_output_repairs {
            self.structured_output_repairs = value;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DATAAGENT_AGENT_MAX_TURN_HISTORY") {
            self.max_turn_history = parse_usize("DATAAGENT_AGENT_MAX_TURN_HISTORY", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_MAX_PLAN_SUMMARY_LENGTH") {
            self.max_plan_summary_length =
                parse_usize("DATAAGENT_AGENT_MAX_PLAN_SUMMARY_LENGTH", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_MAX_PLAN_REPAIR_ATTEMPTS") {
            self.max_plan_repair_attempts =
                parse_u32("DATAAGENT_AGENT_MAX_PLAN_REPAIR_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_MAX_SQL_SYNTAX_RETRIES") {
            self.max_sql_syntax_retries =
                parse_u32("DATAAGENT_AGENT_MAX_SQL_SYNTAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_MAX_SQL_SEMANTIC_RETRIES") {
            self.max_sql_semantic_retries =
                parse_u32("DATAAGENT_AGENT_MAX_SQL_SEMANTIC_RETRIES", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_MAX_SQL_EXECUTION_RETRIES") {
            self.max_sql_execution_retries =
                parse_u32("DATAAGENT_AGENT_MAX_SQL_EXECUTION_RETRIES", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_MAX_SQL_TOTAL_RETRIES") {
            self.max_sql_total_retries =
                parse_u32("DATAAGENT_AGENT_MAX_SQL_TOTAL_RETRIES", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_HUMAN_REVIEW_ENABLED") {
            self.human_review_enabled =
                parse_bool("DATAAGENT_AGENT_HUMAN_REVIEW_ENABLED", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_PROMPT_DIR") {
            self.prompt_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_FLUSH_CONCURRENCY") {
            self.flush_concurrency = parse_usize("DATAAGENT_AGENT_FLUSH_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("DATAAGENT_AGENT_FLUSH_TIMEOUT_MS") {
            self.flush_timeout_ms = parse_u64("DATAAGENT_AGENT_FLUSH_TIMEOUT_MS", &value)?;
        }
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dataagent.toml"), PathBuf::from("config/dataagent.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn is_sqlite_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:"
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    if !is_sqlite_url(&database.url) {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_datasource(datasource: &DatasourceConfig) -> Result<(), ConfigError> {
    if let Some(url) = &datasource.url {
        if !is_sqlite_url(url) {
            return Err(ConfigError::Validation(
                "datasource.url must be a sqlite URL (`sqlite://...` or `sqlite::...`)"
                    .to_string(),
            ));
        }
    }

    if datasource.max_rows == 0 {
        return Err(ConfigError::Validation(
            "datasource.max_rows must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider (set DATAAGENT_LLM_API_KEY)"
                        .to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    let positive = [
        ("agent.max_turn_history", agent.max_turn_history as u64),
        ("agent.max_plan_summary_length", agent.max_plan_summary_length as u64),
        ("agent.max_sql_syntax_retries", u64::from(agent.max_sql_syntax_retries)),
        ("agent.max_sql_semantic_retries", u64::from(agent.max_sql_semantic_retries)),
        ("agent.max_sql_execution_retries", u64::from(agent.max_sql_execution_retries)),
        ("agent.max_sql_total_retries", u64::from(agent.max_sql_total_retries)),
        ("agent.flush_concurrency", agent.flush_concurrency as u64),
        ("agent.flush_timeout_ms", agent.flush_timeout_ms),
        ("agent.store_retry_attempts", u64::from(agent.store_retry_attempts)),
    ];
    if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
        return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
    }

    if let Some(prompt_dir) = &agent.prompt_dir {
        if !prompt_dir.is_dir() {
            return Err(ConfigError::Validation(format!(
                "agent.prompt_dir `{}` is not a directory",
                prompt_dir.display()
            )));
        }
    }

    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    datasource: Option<DatasourcePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    agent: Option<AgentPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DatasourcePatch {
    url: Option<String>,
    max_rows: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    temperature: Option<f32>,
    max_retries: Option<u32>,
    retry_initial_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_turn_history: Option<usize>,
    max_plan_summary_length: Option<usize>,
    max_plan_repair_attempts: Option<u32>,
    max_sql_syntax_retries: Option<u32>,
    max_sql_semantic_retries: Option<u32>,
    max_sql_execution_retries: Option<u32>,
    max_sql_total_retries: Option<u32>,
    human_review_enabled: Option<bool>,
    prompt_dir: Option<PathBuf>,
    flush_concurrency: Option<usize>,
    flush_timeout_ms: Option<u64>,
    store_retry_attempts: Option<u32>,
    store_retry_base_delay_ms: Option<u64>,
    structured_output_repairs: Option<u32>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_agent_limits() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;
        let limits = config.agent.workflow_limits();

        ensure(config.agent.max_turn_history == 5, "turn window defaults to 5")?;
        ensure(config.agent.max_plan_summary_length == 2000, "summary cap defaults to 2000")?;
        ensure(limits.max_plan_repair_attempts == 2, "plan repair cap defaults to 2")?;
        ensure(limits.retry_budget.max_execution == 3, "execution retries default to 3")?;
        ensure(limits.retry_budget.max_total == 10, "total retries default to 10")?;
        ensure(!limits.human_review_enabled, "human review is off by default")?;
        ensure(config.llm.retry_initial_delay_ms == 2_000, "llm backoff starts at 2s")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_DATAAGENT_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dataagent.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_DATAAGENT_LLM_KEY}"
model = "gpt-4o-mini"

[agent]
max_turn_history = 8
human_review_enabled = true
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string())
                    == Some("sk-from-env".to_string()),
                "api key should be interpolated from environment",
            )?;
            ensure(config.agent.max_turn_history == 8, "agent window should come from file")?;
            ensure(config.agent.human_review_enabled, "human review should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_DATAAGENT_LLM_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAAGENT_LOG_LEVEL", "warn");
        env::set_var("DATAAGENT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["DATAAGENT_LOG_LEVEL", "DATAAGENT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAAGENT_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("DATAAGENT_AGENT_MAX_SQL_EXECUTION_RETRIES", "5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("dataagent.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[logging]
level = "warn"

[agent]
max_sql_execution_retries = 4
max_sql_syntax_retries = 2
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.agent.max_sql_execution_retries == 5,
                "env execution retries should win over file",
            )?;
            ensure(config.agent.max_sql_syntax_retries == 2, "file syntax retries should apply")?;
            Ok(())
        })();

        clear_vars(&["DATAAGENT_DATABASE_URL", "DATAAGENT_AGENT_MAX_SQL_EXECUTION_RETRIES"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAAGENT_AGENT_MAX_TURN_HISTORY", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("agent.max_turn_history")
            );
            ensure(has_message, "validation failure should mention agent.max_turn_history")
        })();

        clear_vars(&["DATAAGENT_AGENT_MAX_TURN_HISTORY"]);
        result
    }

    #[test]
    fn openai_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                llm_provider: Some(LlmProvider::OpenAi),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .err()
        .ok_or_else(|| "openai without api key should fail".to_string())?;

        ensure(
            matches!(error, ConfigError::Validation(ref message) if message.contains("llm.api_key")),
            "validation failure should mention llm.api_key",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DATAAGENT_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["DATAAGENT_LLM_API_KEY"]);
        result
    }
}
