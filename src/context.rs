//! Shared handles used by the CLI commands and the HTTP handlers.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::ai::{create_provider, ChatProvider, ProviderKind};
use crate::config::Config;
use crate::db;
use crate::error::AppError;
use crate::migrate;
use crate::webhook::WebhookClient;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub webhooks: Arc<WebhookClient>,
    provider: Option<Arc<dyn ChatProvider>>,
}

impl AppContext {
    /// Opens the database (applying the schema) and builds the clients.
    ///
    /// A missing AI API key is not fatal: webhook-only deployments still
    /// work, and AI-backed requests fail with `not_configured`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;

        let kind: ProviderKind = config.ai.default_provider.parse()?;
        let provider = match create_provider(&config.ai, kind) {
            Ok(p) => {
                tracing::info!(provider = p.name(), model = p.model(), "AI provider ready");
                Some(p)
            }
            Err(e) => {
                tracing::warn!(error = %e, "AI provider unavailable");
                None
            }
        };

        Ok(Self::new(config.clone(), pool, WebhookClient::new(&config.webhooks)?, provider))
    }

    pub fn new(
        config: Config,
        pool: SqlitePool,
        webhooks: WebhookClient,
        provider: Option<Arc<dyn ChatProvider>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pool,
            webhooks: Arc::new(webhooks),
            provider,
        }
    }

    pub fn provider(&self) -> Result<Arc<dyn ChatProvider>> {
        self.provider.clone().ok_or_else(|| {
            AppError::NotConfigured(format!(
                "AI provider '{}' is not available (missing API key?)",
                self.config.ai.default_provider
            ))
            .into()
        })
    }
}
