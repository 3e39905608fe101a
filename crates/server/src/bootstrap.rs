use std::fmt::Display;
use std::sync::Arc;

use aisle_agent::prompts::PromptError;
use aisle_agent::{HttpCatalogClient, HttpSafetyClassifier, OpenAiCompatibleClient, TurnOrchestrator};
use aisle_core::config::AppConfig;
use aisle_db::{connect_from_config, migrations, DbPool, SqlContextRepository};
use thiserror::Error;
use tracing::info;

/// Everything `main` needs to serve: the validated config, the context-store pool and the
/// orchestrator shared by every request.
pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Arc<TurnOrchestrator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("cannot open context store: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("cannot migrate context store: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("cannot build {service} client: {detail}")]
    Client { service: &'static str, detail: String },
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

fn client<T, E: Display>(service: &'static str, built: Result<T, E>) -> Result<T, BootstrapError> {
    built.map_err(|error| BootstrapError::Client { service, detail: error.to_string() })
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.context_store_ready",
        correlation_id = "bootstrap",
        "context store connected and migrated"
    );

    let llm = client("llm", OpenAiCompatibleClient::new(&config.llm))?;
    let catalog = client("catalog", HttpCatalogClient::new(config.services.catalog_url.clone()))?;
    let classifier =
        client("safety", HttpSafetyClassifier::new(config.services.safety_url.clone()))?;

    let orchestrator = TurnOrchestrator::from_config(
        &config,
        Arc::new(SqlContextRepository::new(db_pool.clone())),
        Arc::new(llm),
        Arc::new(catalog),
        Arc::new(classifier),
    )?;
    info!(
        event_name = "system.bootstrap.orchestrator_ready",
        correlation_id = "bootstrap",
        handlers = orchestrator.handlers().len(),
        model = %config.llm.model,
        authenticated = config.llm_api_key().is_some(),
        "turn orchestrator wired"
    );

    Ok(Application { config, db_pool, orchestrator: Arc::new(orchestrator) })
}

#[cfg(test)]
mod tests {
    use aisle_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap_with_config;

    fn in_memory_config() -> AppConfig {
        AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config loads")
    }

    #[test]
    fn non_http_catalog_url_is_refused_before_bootstrap() {
        let error = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                catalog_url: Some("ftp://catalog.internal".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect_err("ftp catalog rejected");

        assert!(error.to_string().contains("services.catalog_url"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_store_and_wires_every_capability() {
        let app = bootstrap_with_config(in_memory_config())
            .await
            .expect("bootstrap with defaults");

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name IN ('user_context', 'cart_item') ORDER BY name",
        )
        .fetch_all(&app.db_pool)
        .await
        .expect("read sqlite_master");

        assert_eq!(tables, ["cart_item", "user_context"]);
        assert!(app.orchestrator.handlers().is_complete());
        app.db_pool.close().await;
    }
}
