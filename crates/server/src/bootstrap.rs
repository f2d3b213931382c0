use std::sync::Arc;

use dataagent_agent::{
    AgentRuntime, ContextSettings, MultiTurnContextManager, PromptRegistry, RuntimeComponents,
    RuntimeSettings, TextGenerator,
};
use dataagent_core::config::{AppConfig, ConfigError, LoadOptions};
use dataagent_db::{connect_with_settings, migrations, DbPool, SqlConversationTurnRepository};
use thiserror::Error;
use tracing::{info, warn};

use crate::datasource::SqliteDataSource;
use crate::llm::OpenAiCompatibleGenerator;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: AgentRuntime,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("datasource unavailable: {0:#}")]
    Datasource(#[source] anyhow::Error),
    #[error("llm client setup failed: {0:#}")]
    Llm(#[source] anyhow::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let generator: Arc<dyn TextGenerator> =
        Arc::new(OpenAiCompatibleGenerator::from_config(&config.llm).map_err(BootstrapError::Llm)?);
    bootstrap_with_generator(config, generator).await
}

/// Wires the runtime around an already constructed text generator.
pub async fn bootstrap_with_generator(
    config: AppConfig,
    generator: Arc<dyn TextGenerator>,
) -> Result<Application, BootstrapError> {
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let datasource = match &config.datasource.url {
        Some(url) => SqliteDataSource::connect(url, config.datasource.max_rows)
            .await
            .map_err(BootstrapError::Datasource)?,
        None => {
            warn!(
                event_name = "system.bootstrap.datasource_fallback",
                correlation_id = "bootstrap",
                "no datasource url configured, generated sql runs against the main database"
            );
            SqliteDataSource::new(db_pool.clone(), "main", config.datasource.max_rows)
        }
    };
    let datasource = Arc::new(datasource);

    let store = Arc::new(SqlConversationTurnRepository::new(db_pool.clone()));
    let context =
        Arc::new(MultiTurnContextManager::new(store, ContextSettings::from_config(&config.agent)));
    let prompts = Arc::new(PromptRegistry::from_config(&config.agent));

    let runtime = AgentRuntime::new(
        RuntimeComponents {
            generator,
            prompts,
            context,
            schema_source: datasource.clone(),
            executor: datasource,
        },
        RuntimeSettings::from_config(&config),
    );

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        human_review_enabled = config.agent.human_review_enabled,
        "agent runtime ready"
    );
    Ok(Application { config, db_pool, runtime })
}
