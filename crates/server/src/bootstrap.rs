use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use tunesmith_agent::handlers::{
    AccountHandler, DiscoveryHandler, Handler, InvoiceDeskHandler, StorefrontHandler,
};
use tunesmith_agent::{ConversationEngine, HttpLlmClient, StoreIdentityResolver, Supervisor};
use tunesmith_core::config::{AppConfig, ConfigError, LoadOptions};
use tunesmith_core::{AuditEvent, AuditSink};
use tunesmith_db::repositories::{
    SqlCatalogRepository, SqlConversationRepository, SqlInvoiceRepository,
    SqlRecommendationRepository, SqlSubjectRepository,
};
use tunesmith_db::{connect, migrations, DbPool};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<ConversationEngine>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client setup failed: {0}")]
    LlmClient(String),
}

/// Audit sink for the running server: every control-plane event becomes a
/// structured log line.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = "audit.event",
            audit_event_type = %event.event_type,
            conversation_id = event.conversation_id.as_ref().map(|id| id.0.as_str()),
            actor = %event.actor,
            outcome = ?event.outcome,
            metadata = %serde_json::json!(event.metadata),
        );
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let llm = Arc::new(
        HttpLlmClient::from_config(&config.llm)
            .map_err(|error| BootstrapError::LlmClient(error.to_string()))?,
    );
    let engine = Arc::new(build_engine(db_pool.clone(), llm));

    Ok(Application { config, db_pool, engine })
}

/// Wires the repositories, supervisor, and handlers around one shared model
/// client. Split out so tests can substitute a scripted client.
pub fn build_engine(
    db_pool: DbPool,
    llm: Arc<dyn tunesmith_agent::LlmClient>,
) -> ConversationEngine {
    let subjects = Arc::new(SqlSubjectRepository::new(db_pool.clone()));
    let catalog = Arc::new(SqlCatalogRepository::new(db_pool.clone()));
    let invoices = Arc::new(SqlInvoiceRepository::new(db_pool.clone()));
    let recommendations = Arc::new(SqlRecommendationRepository::new(db_pool.clone()));
    let conversations = Arc::new(SqlConversationRepository::new(db_pool));

    let audit = Arc::new(TracingAuditSink);
    let handlers: Vec<Arc<dyn Handler>> = vec![
        Arc::new(StorefrontHandler::new(
            llm.clone(),
            catalog,
            invoices.clone(),
            subjects.clone(),
        )),
        Arc::new(AccountHandler::new(llm.clone(), invoices.clone())),
        Arc::new(InvoiceDeskHandler::new(llm.clone(), invoices, subjects.clone())),
        Arc::new(DiscoveryHandler::new(llm.clone(), recommendations)),
    ];

    ConversationEngine::new(
        Arc::new(StoreIdentityResolver::new(subjects)),
        conversations,
        Supervisor::new(llm, audit.clone()),
        handlers,
        audit,
    )
}

#[cfg(test)]
mod tests {
    use tunesmith_core::config::{ConfigOverrides, LoadOptions};

    use super::bootstrap;

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_the_engine() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with in-memory database");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('conversation', 'message', 'suspension', 'invoice')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("baseline tables should exist after bootstrap");
        assert_eq!(table_count, 4);

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_urls() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("postgres://localhost/tunesmith".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("validation should fail").to_string();
        assert!(message.contains("database.url"));
    }
}
