//! TOML configuration parsing.
//!
//! All settings live in a single file (default `./config/pdm.toml`):
//!
//! ```toml
//! [db]
//! path = "./data/pdm.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [ai]
//! default_provider = "perplexity"
//!
//! [ai.perplexity]
//! url = "https://api.perplexity.ai/chat/completions"
//! model = "sonar-pro"
//! api_key_env = "PERPLEXITY_API_KEY"
//!
//! [webhooks]
//! base_url = "https://n8n.example.com/webhook"
//! enrich = "pdm-enrich"
//! report = "pdm-report"
//!
//! [reports]
//! table = "pdm.materials"
//! dimensions = ["plant", "material_type", "created_at"]
//! measures = ["quantity", "unit_cost"]
//! ```
//!
//! Secrets (API keys, session signing key, webhook token) are never stored in
//! the file; the file names the environment variables that hold them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Adds the `Secure` attribute to the session cookie.
    #[serde(default)]
    pub cookie_secure: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_session_secret_env")]
    pub session_secret_env: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_min_password_len")]
    pub min_password_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_secret_env: default_session_secret_env(),
            session_ttl_hours: default_session_ttl_hours(),
            cookie_name: default_cookie_name(),
            min_password_len: default_min_password_len(),
        }
    }
}

fn default_session_secret_env() -> String {
    "PDM_SESSION_SECRET".to_string()
}
fn default_session_ttl_hours() -> u64 {
    12
}
fn default_cookie_name() -> String {
    "pdm_session".to_string()
}
fn default_min_password_len() -> usize {
    8
}

impl AuthConfig {
    /// Reads the session signing secret from the configured environment variable.
    pub fn session_secret(&self) -> Result<String> {
        let secret = std::env::var(&self.session_secret_env).with_context(|| {
            format!(
                "{} environment variable not set (session signing secret)",
                self.session_secret_env
            )
        })?;
        if secret.len() < 16 {
            bail!(
                "{} must be at least 16 characters long",
                self.session_secret_env
            );
        }
        Ok(secret)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    #[serde(default = "default_ai_provider")]
    pub default_provider: String,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ai_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "ProviderConfig::perplexity")]
    pub perplexity: ProviderConfig,
    #[serde(default = "ProviderConfig::openai")]
    pub openai: ProviderConfig,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            default_provider: default_ai_provider(),
            timeout_secs: default_ai_timeout_secs(),
            max_retries: default_ai_max_retries(),
            temperature: default_temperature(),
            perplexity: ProviderConfig::perplexity(),
            openai: ProviderConfig::openai(),
        }
    }
}

fn default_ai_provider() -> String {
    "perplexity".to_string()
}
fn default_ai_timeout_secs() -> u64 {
    60
}
fn default_ai_max_retries() -> u32 {
    3
}
fn default_temperature() -> f32 {
    0.2
}

/// Endpoint settings for one chat-completions provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub url: String,
    pub model: String,
    pub api_key_env: String,
}

impl ProviderConfig {
    fn perplexity() -> Self {
        Self {
            url: "https://api.perplexity.ai/chat/completions".to_string(),
            model: "sonar-pro".to_string(),
            api_key_env: "PERPLEXITY_API_KEY".to_string(),
        }
    }

    fn openai() -> Self {
        Self {
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub enrich: Option<String>,
    #[serde(default)]
    pub equivalence: Option<String>,
    #[serde(default)]
    pub transcription: Option<String>,
    #[serde(default)]
    pub report: Option<String>,
    /// Header sent with every webhook call, e.g. `X-N8N-Token`.
    #[serde(default)]
    pub auth_header: Option<String>,
    /// Environment variable holding the value for `auth_header`.
    #[serde(default)]
    pub auth_token_env: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_webhook_max_retries")]
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            search: None,
            enrich: None,
            equivalence: None,
            transcription: None,
            report: None,
            auth_header: None,
            auth_token_env: None,
            timeout_secs: default_webhook_timeout_secs(),
            max_retries: default_webhook_max_retries(),
        }
    }
}

fn default_webhook_timeout_secs() -> u64 {
    120
}
fn default_webhook_max_retries() -> u32 {
    2
}

/// The external workflows the application can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookKind {
    Search,
    Enrich,
    Equivalence,
    Transcription,
    Report,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookKind::Search => "search",
            WebhookKind::Enrich => "enrich",
            WebhookKind::Equivalence => "equivalence",
            WebhookKind::Transcription => "transcription",
            WebhookKind::Report => "report",
        }
    }

    pub const ALL: [WebhookKind; 5] = [
        WebhookKind::Search,
        WebhookKind::Enrich,
        WebhookKind::Equivalence,
        WebhookKind::Transcription,
        WebhookKind::Report,
    ];
}

impl WebhookConfig {
    fn path_for(&self, kind: WebhookKind) -> Option<&str> {
        let path = match kind {
            WebhookKind::Search => &self.search,
            WebhookKind::Enrich => &self.enrich,
            WebhookKind::Equivalence => &self.equivalence,
            WebhookKind::Transcription => &self.transcription,
            WebhookKind::Report => &self.report,
        };
        path.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }

    /// Resolves the full URL of a workflow, or `None` when it is not configured.
    ///
    /// Absolute paths (`http://…`, `https://…`) are used as-is; anything else
    /// is joined onto `base_url`.
    pub fn url_for(&self, kind: WebhookKind) -> Option<String> {
        let path = self.path_for(kind)?;
        if is_absolute_url(path) {
            return Some(path.to_string());
        }
        let base = self.base_url.as_deref()?.trim_end_matches('/');
        Some(format!("{}/{}", base, path.trim_start_matches('/')))
    }

    pub fn is_configured(&self, kind: WebhookKind) -> bool {
        self.url_for(kind).is_some()
    }
}

fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedbackConfig {
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
    #[serde(default = "default_min_rating")]
    pub min_rating: i64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_examples: default_max_examples(),
            min_rating: default_min_rating(),
        }
    }
}

fn default_max_examples() -> usize {
    5
}
fn default_min_rating() -> i64 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_rows() -> usize {
    25
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportsConfig {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            dimensions: Vec::new(),
            measures: Vec::new(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_max_limit() -> u64 {
    5000
}

impl Config {
    /// A configuration usable without a file: local database, no webhooks,
    /// default AI endpoints.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/pdm.sqlite"),
            },
            server: ServerConfig {
                bind: "127.0.0.1:8080".to_string(),
                cookie_secure: false,
            },
            auth: AuthConfig::default(),
            ai: AiConfig::default(),
            webhooks: WebhookConfig::default(),
            feedback: FeedbackConfig::default(),
            validation: ValidationConfig::default(),
            reports: ReportsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.auth.session_ttl_hours == 0 {
        bail!("auth.session_ttl_hours must be > 0");
    }

    match config.ai.default_provider.as_str() {
        "perplexity" | "openai" => {}
        other => bail!(
            "Unknown ai.default_provider: '{}'. Must be perplexity or openai.",
            other
        ),
    }

    if !(0.0..=2.0).contains(&config.ai.temperature) {
        bail!("ai.temperature must be in [0.0, 2.0]");
    }

    for kind in WebhookKind::ALL {
        if let Some(path) = config.webhooks.path_for(kind) {
            if !is_absolute_url(path) && config.webhooks.base_url.is_none() {
                bail!(
                    "webhooks.{} is a relative path but webhooks.base_url is not set",
                    kind.as_str()
                );
            }
        }
    }

    if config.webhooks.auth_header.is_some() != config.webhooks.auth_token_env.is_some() {
        bail!("webhooks.auth_header and webhooks.auth_token_env must be set together");
    }

    if !(1..=5).contains(&config.feedback.min_rating) {
        bail!("feedback.min_rating must be in [1, 5]");
    }

    if config.validation.concurrency == 0 {
        bail!("validation.concurrency must be > 0");
    }
    if config.validation.max_rows == 0 {
        bail!("validation.max_rows must be > 0");
    }

    let reports = &config.reports;
    let has_whitelist = !reports.dimensions.is_empty() || !reports.measures.is_empty();
    if has_whitelist && reports.table.trim().is_empty() {
        bail!("reports.table must be set when reports.dimensions or reports.measures are set");
    }
    if !reports.table.is_empty()
        && !reports.table.split('.').all(crate::pivot::is_plain_identifier)
    {
        bail!("reports.table '{}' is not a valid table name", reports.table);
    }
    for column in reports.dimensions.iter().chain(reports.measures.iter()) {
        if !crate::pivot::is_plain_identifier(column) {
            bail!("reports column '{}' is not a valid identifier", column);
        }
    }
    if reports.max_limit == 0 {
        bail!("reports.max_limit must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!(
            "[db]\npath = \"/tmp/pdm.sqlite\"\n\n[server]\nbind = \"127.0.0.1:0\"\n\n{}",
            extra
        );
        let config: Config = toml::from_str(&text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_apply() {
        let config = parse("").unwrap();
        assert_eq!(config.auth.cookie_name, "pdm_session");
        assert_eq!(config.ai.default_provider, "perplexity");
        assert_eq!(config.ai.perplexity.model, "sonar-pro");
        assert_eq!(config.feedback.min_rating, 4);
        assert_eq!(config.validation.concurrency, 4);
        assert!(!config.webhooks.is_configured(WebhookKind::Report));
    }

    #[test]
    fn test_example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/pdm.example.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(
            config.webhooks.url_for(WebhookKind::Report).as_deref(),
            Some("https://n8n.example.com/webhook/pdm-report")
        );
        assert!(!config.webhooks.is_configured(WebhookKind::Search));
        assert_eq!(config.reports.measures, vec!["quantity", "unit_cost"]);
    }

    #[test]
    fn test_webhook_url_resolution() {
        let config = parse(
            "[webhooks]\nbase_url = \"https://n8n.local/webhook/\"\nenrich = \"/pdm-enrich\"\nreport = \"https://other.host/hook\"\n",
        )
        .unwrap();
        assert_eq!(
            config.webhooks.url_for(WebhookKind::Enrich).as_deref(),
            Some("https://n8n.local/webhook/pdm-enrich")
        );
        assert_eq!(
            config.webhooks.url_for(WebhookKind::Report).as_deref(),
            Some("https://other.host/hook")
        );
        assert_eq!(config.webhooks.url_for(WebhookKind::Search), None);
    }

    #[test]
    fn test_relative_webhook_without_base_rejected() {
        let err = parse("[webhooks]\nenrich = \"pdm-enrich\"\n").unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[ai]\ndefault_provider = \"claude\"\n").unwrap_err();
        assert!(err.to_string().contains("default_provider"));
    }

    #[test]
    fn test_report_whitelist_requires_table() {
        let err = parse("[reports]\ndimensions = [\"plant\"]\n").unwrap_err();
        assert!(err.to_string().contains("reports.table"));
    }

    #[test]
    fn test_report_identifiers_validated() {
        let err = parse("[reports]\ntable = \"pdm.materials\"\nmeasures = [\"cost; drop\"]\n")
            .unwrap_err();
        assert!(err.to_string().contains("not a valid identifier"));
    }

    #[test]
    fn test_min_rating_bounds() {
        assert!(parse("[feedback]\nmin_rating = 6\n").is_err());
        assert!(parse("[feedback]\nmin_rating = 1\n").is_ok());
    }
}
