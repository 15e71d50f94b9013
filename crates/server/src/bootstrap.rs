use std::sync::Arc;

use expensa_core::audit::{AuditSink, TracingAuditSink};
use expensa_core::config::{AppConfig, ConfigError};
use expensa_core::{
    ApprovalWorkflow, ExpenseService, LogNotificationDispatcher, NotificationDispatcher,
    NotificationError, RuleAdminService,
};
use expensa_db::{
    connect_with_settings, migrations, DbPool, SqlExpenseStore, SqlRuleRepository,
    SqlUserDirectory,
};
use thiserror::Error;
use tracing::info;

use crate::notify::WebhookNotificationDispatcher;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub expenses: ExpenseService,
    pub rules: RuleAdminService,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Notifications(#[from] NotificationError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

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

    let notifier = notifier(&config)?;
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let rule_repository = Arc::new(SqlRuleRepository::new(db_pool.clone()));
    let directory = Arc::new(SqlUserDirectory::new(db_pool.clone()));

    let workflow = ApprovalWorkflow::new(
        rule_repository.clone(),
        directory.clone(),
        Arc::new(SqlExpenseStore::new(db_pool.clone())),
        notifier,
        audit.clone(),
    )
    .with_max_conflict_retries(config.approvals.max_conflict_retries);
    let expenses = ExpenseService::new(workflow, Arc::new(config.currency.rate_table()));
    let rules = RuleAdminService::new(rule_repository, directory, audit);

    Ok(Application { config, db_pool, expenses, rules })
}

fn notifier(config: &AppConfig) -> Result<Arc<dyn NotificationDispatcher>, NotificationError> {
    let settings = &config.notifications;
    match (&settings.webhook_url, &settings.signing_secret) {
        (Some(url), Some(secret)) => {
            info!(
                event_name = "system.bootstrap.notifications",
                correlation_id = "bootstrap",
                transport = "webhook",
                "notifications delivered by signed webhook"
            );
            Ok(Arc::new(WebhookNotificationDispatcher::new(
                url.clone(),
                secret.clone(),
                settings.timeout_secs,
            )?))
        }
        _ => {
            info!(
                event_name = "system.bootstrap.notifications",
                correlation_id = "bootstrap",
                transport = "log",
                "no webhook configured; notifications are logged only"
            );
            Ok(Arc::new(LogNotificationDispatcher))
        }
    }
}

#[cfg(test)]
mod tests {
    use expensa_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use expensa_core::CompanyId;
    use expensa_db::DemoSeedDataset;
    use rust_decimal::Decimal;

    use crate::bootstrap::{bootstrap_with_config, Application, BootstrapError};

    async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
        bootstrap_with_config(AppConfig::load(options)?).await
    }

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_database_url() {
        let result = bootstrap(overrides("postgres://localhost/expensa")).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("database.url"), "unexpected error: {message}");
    }

    #[tokio::test]
    async fn bootstrap_rejects_webhook_without_signing_secret() {
        let mut options = overrides("sqlite::memory:");
        options.overrides.webhook_url = Some("https://hooks.example.test/expensa".to_string());

        let result = bootstrap(options).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("signing_secret"), "unexpected error: {message}");
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_wires_routing_services() {
        let app = bootstrap(overrides("sqlite::memory:")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('companies', 'users', 'approval_rules', \
             'expenses', 'expense_approvers')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("count tables");
        assert_eq!(table_count, 5);

        DemoSeedDataset::load(&app.db_pool).await.expect("seed");
        let preview = app
            .expenses
            .preview(&CompanyId("co-acme".to_string()), Decimal::new(6_000, 0), "USD", "software")
            .await
            .expect("preview");
        assert_eq!(
            preview.policy.rule().map(|rule| rule.id.0.as_str()),
            Some("rule-large-threshold")
        );

        app.db_pool.close().await;
    }
}
