//! The "validate information" flow.
//!
//! Each selected row is sent to the AI provider with a web-search prompt
//! (see [`crate::prompt::build_validation_prompt`]). The answer table is
//! read back into one [`FieldCheck`] per requested field. Rows run
//! concurrently, bounded by `validation.concurrency`, and reports come back
//! in input order. A failing row yields a report with `error` set; the rest
//! of the batch still completes.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::ai::ChatProvider;
use crate::context::AppContext;
use crate::error::AppError;
use crate::feedback;
use crate::markdown::{normalize_header, process_content, MarkdownTable, ProcessedContent};
use crate::materials::{canonical_field, cited_urls, record_history};
use crate::models::{MaterialRecord, SearchKind};
use crate::prompt;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub rows: Vec<MaterialRecord>,
    /// Fields to check; empty means every populated standard field.
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Confirmed,
    Divergent,
    NotFound,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Confirmed => "confirmed",
            CheckStatus::Divergent => "divergent",
            CheckStatus::NotFound => "not_found",
        }
    }
}

const DIVERGENT_WORDS: [&str; 11] = [
    "diverg", "incorrect", "incorreto", "invalid", "invalido", "wrong", "mismatch", "discrep",
    "differ", "conflit", "conflict",
];
const CONFIRMED_WORDS: [&str; 8] = [
    "confirm", "correct", "correto", "verified", "verificado", "valid", "ok", "match",
];
const NEGATIONS: [&str; 4] = ["not", "nao", "no", "sem"];
const UNVERIFIED_WORDS: [&str; 5] = ["unverif", "unconfirm", "nao_confirm", "nao_verific", "inconclus"];

/// Reads a status cell, accepting English and Portuguese wording.
///
/// Confirmed words must start a token (`ok` does not match `broken`).
/// Unrecognised or empty cells are `NotFound`.
pub fn parse_status(cell: &str) -> CheckStatus {
    if cell.contains('❌') || cell.contains('⚠') {
        return CheckStatus::Divergent;
    }
    if cell.contains('✅') || cell.contains('✔') {
        return CheckStatus::Confirmed;
    }

    let norm = normalize_header(cell);
    if DIVERGENT_WORDS.iter().any(|w| norm.contains(w)) {
        return CheckStatus::Divergent;
    }
    if UNVERIFIED_WORDS.iter().any(|w| norm.contains(w)) {
        return CheckStatus::NotFound;
    }
    if norm.split('_').any(|t| NEGATIONS.contains(&t)) {
        return CheckStatus::NotFound;
    }
    let confirmed = norm
        .split('_')
        .any(|t| CONFIRMED_WORDS.iter().any(|w| t.starts_with(w)));
    if confirmed {
        return CheckStatus::Confirmed;
    }
    CheckStatus::NotFound
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCheck {
    pub field: String,
    pub current: String,
    pub verified: String,
    pub status: CheckStatus,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSummary {
    pub confirmed: usize,
    pub divergent: usize,
    pub not_found: usize,
}

impl StatusSummary {
    fn of(checks: &[FieldCheck]) -> Self {
        let mut summary = Self::default();
        for check in checks {
            match check.status {
                CheckStatus::Confirmed => summary.confirmed += 1,
                CheckStatus::Divergent => summary.divergent += 1,
                CheckStatus::NotFound => summary.not_found += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Position of the row in the request.
    pub row: usize,
    pub label: String,
    pub checks: Vec<FieldCheck>,
    pub citations: Vec<String>,
    pub summary: StatusSummary,
    /// Remarks the model wrote around the table.
    pub notes: String,
    pub error: Option<String>,
}

impl ValidationReport {
    fn failed(row: usize, record: &MaterialRecord, error: String) -> Self {
        Self {
            row,
            label: record.label().to_string(),
            checks: Vec::new(),
            citations: Vec::new(),
            summary: StatusSummary::default(),
            notes: String::new(),
            error: Some(error),
        }
    }
}

/// Maps a field name (English, Portuguese, or an attribute key) to the name
/// used on [`MaterialRecord`].
fn field_key(name: &str) -> String {
    match canonical_field(name) {
        Some(field) if field != "sources" => field.to_string(),
        _ => normalize_header(name),
    }
}

/// Fields to check for one row.
pub fn fields_for(record: &MaterialRecord, requested: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    if requested.is_empty() {
        for field in MaterialRecord::FIELDS {
            if record.field(field).is_some_and(|v| !v.trim().is_empty()) {
                fields.push(field.to_string());
            }
        }
    } else {
        for name in requested {
            let key = field_key(name);
            if !key.is_empty() && !fields.contains(&key) {
                fields.push(key);
            }
        }
    }
    fields
}

struct CheckColumns {
    field: usize,
    current: Option<usize>,
    verified: Option<usize>,
    status: usize,
    source: Option<usize>,
}

impl CheckColumns {
    fn find(table: &MarkdownTable) -> Option<Self> {
        let find = |names: &[&str]| names.iter().find_map(|n| table.column(n));
        Some(Self {
            field: find(&["field", "campo", "attribute", "atributo"])?,
            current: find(&["current", "atual", "current_value", "valor_atual"]),
            verified: find(&["verified", "verificado", "verified_value", "valor_verificado", "correct_value", "valor_correto"]),
            status: find(&["status", "situacao", "resultado", "result"])?,
            source: find(&["source", "fonte", "sources", "fontes", "reference", "referencia"]),
        })
    }
}

/// Reads checks for `fields` out of a processed validation answer.
///
/// Every requested field gets exactly one check, in request order; fields
/// the answer does not cover are `NotFound`.
pub fn checks_from_content(
    record: &MaterialRecord,
    fields: &[String],
    content: &ProcessedContent,
) -> Vec<FieldCheck> {
    let table = content
        .tables
        .iter()
        .find_map(|t| CheckColumns::find(t).map(|cols| (t, cols)));

    fields
        .iter()
        .map(|field| {
            let on_file = record.field(field).unwrap_or("").to_string();
            let row = table.as_ref().and_then(|(t, cols)| {
                t.rows
                    .iter()
                    .find(|r| field_key(&r[cols.field]) == *field)
                    .map(|r| (r, cols))
            });

            match row {
                Some((r, cols)) => {
                    let cell = |i: Option<usize>| i.map(|i| r[i].clone()).unwrap_or_default();
                    let current = cell(cols.current);
                    FieldCheck {
                        field: field.clone(),
                        current: if current.is_empty() { on_file } else { current },
                        verified: cell(cols.verified),
                        status: parse_status(&r[cols.status]),
                        source: cell(cols.source),
                    }
                }
                None => FieldCheck {
                    field: field.clone(),
                    current: on_file,
                    verified: String::new(),
                    status: CheckStatus::NotFound,
                    source: String::new(),
                },
            }
        })
        .collect()
}

async fn validate_one(
    ctx: &AppContext,
    provider: &Arc<dyn ChatProvider>,
    row: usize,
    record: &MaterialRecord,
    requested: &[String],
) -> Result<ValidationReport> {
    let fields = fields_for(record, requested);
    if fields.is_empty() {
        return Err(AppError::BadRequest("row has no fields to validate".to_string()).into());
    }

    let examples = feedback::select_examples(
        &ctx.pool,
        SearchKind::Validation,
        record.label(),
        ctx.config.feedback.min_rating,
        ctx.config.feedback.max_examples,
    )
    .await?;
    let request = prompt::build_validation_prompt(record, &fields, &examples);
    let response = provider.complete(&request).await?;

    let processed = process_content(&response.content);
    let checks = checks_from_content(record, &fields, &processed);

    Ok(ValidationReport {
        row,
        label: record.label().to_string(),
        summary: StatusSummary::of(&checks),
        checks,
        citations: cited_urls(&response.citations, &processed.citations),
        notes: processed.text,
        error: None,
    })
}

/// Validates `request.rows`, one provider call per row.
///
/// # Errors
///
/// `BadRequest` for an empty request or more than `validation.max_rows`
/// rows; `NotConfigured` when no AI provider is available. Per-row
/// failures are reported in [`ValidationReport::error`].
pub async fn validate_rows(
    ctx: &AppContext,
    user_id: Option<&str>,
    request: &ValidateRequest,
) -> Result<Vec<ValidationReport>> {
    if request.rows.is_empty() {
        return Err(AppError::BadRequest("no rows to validate".to_string()).into());
    }
    let max_rows = ctx.config.validation.max_rows;
    if request.rows.len() > max_rows {
        return Err(AppError::BadRequest(format!(
            "too many rows: {} (max {})",
            request.rows.len(),
            max_rows
        ))
        .into());
    }
    let provider = ctx.provider()?;
    let concurrency = ctx.config.validation.concurrency.max(1);

    tracing::info!(rows = request.rows.len(), concurrency, "validating rows");

    let jobs: Vec<_> = request
        .rows
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let provider = provider.clone();
            async move {
                match validate_one(ctx, &provider, i, record, &request.fields).await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::warn!(row = i, error = %e, "row validation failed");
                        ValidationReport::failed(i, record, format!("{:#}", e))
                    }
                }
            }
        })
        .collect();

    let reports: Vec<ValidationReport> = stream::iter(jobs)
        .buffered(concurrency)
        .collect()
        .await;

    for report in &reports {
        record_history(
            &ctx.pool,
            user_id,
            SearchKind::Validation,
            &report.label,
            report.checks.len(),
        )
        .await;
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ChatRequest, ChatResponse};
    use crate::config::{Config, WebhookConfig};
    use crate::webhook::WebhookClient;
    use crate::{db, migrate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("CONFIRMED"), CheckStatus::Confirmed);
        assert_eq!(parse_status("Confirmado"), CheckStatus::Confirmed);
        assert_eq!(parse_status("✅"), CheckStatus::Confirmed);
        assert_eq!(parse_status("DIVERGENT"), CheckStatus::Divergent);
        assert_eq!(parse_status("Divergente"), CheckStatus::Divergent);
        assert_eq!(parse_status("incorrect"), CheckStatus::Divergent);
        assert_eq!(parse_status("Inválido"), CheckStatus::Divergent);
        assert_eq!(parse_status("NOT FOUND"), CheckStatus::NotFound);
        assert_eq!(parse_status("Não encontrado"), CheckStatus::NotFound);
        assert_eq!(parse_status("not confirmed"), CheckStatus::NotFound);
        assert_eq!(parse_status(""), CheckStatus::NotFound);
    }

    #[test]
    fn test_parse_status_negative_prefixes_and_word_boundaries() {
        assert_eq!(parse_status("Unverified"), CheckStatus::NotFound);
        assert_eq!(parse_status("Unconfirmed"), CheckStatus::NotFound);
        assert_eq!(parse_status("Não confirmado"), CheckStatus::NotFound);
        assert_eq!(parse_status("Não verificado"), CheckStatus::NotFound);
        assert_eq!(parse_status("Inconclusive"), CheckStatus::NotFound);
        assert_eq!(parse_status("Broken link"), CheckStatus::NotFound);
        assert_eq!(parse_status("Token"), CheckStatus::NotFound);
        assert_eq!(parse_status("OK"), CheckStatus::Confirmed);
        assert_eq!(parse_status("Verified (datasheet)"), CheckStatus::Confirmed);
        assert_eq!(parse_status("Matches"), CheckStatus::Confirmed);
        assert_eq!(parse_status("Validado"), CheckStatus::Confirmed);
        assert_eq!(parse_status("Correto"), CheckStatus::Confirmed);
    }

    #[test]
    fn test_fields_for() {
        let record = MaterialRecord {
            code: "1020".to_string(),
            standard: "SAE J403".to_string(),
            ..Default::default()
        };
        assert_eq!(fields_for(&record, &[]), vec!["code", "standard"]);

        let requested = vec!["Fabricante".to_string(), "manufacturer".to_string(), "Dureza".to_string()];
        assert_eq!(fields_for(&record, &requested), vec!["manufacturer", "dureza"]);
    }

    #[test]
    fn test_checks_from_content() {
        let record = MaterialRecord {
            code: "1020".to_string(),
            manufacturer: "Gerdau".to_string(),
            standard: "SAE J403".to_string(),
            ..Default::default()
        };
        let content = process_content(
            "Checked against the SAE catalogue [1].\n\n\
             | Campo | Atual | Verificado | Status | Fonte |\n|---|---|---|---|---|\n\
             | Código | 1020 | 1020 | CONFIRMADO | sae.org |\n\
             | Norma |  | SAE J403-2014 | DIVERGENTE | sae.org [1] |",
        );
        let fields = vec!["code".to_string(), "standard".to_string(), "manufacturer".to_string()];
        let checks = checks_from_content(&record, &fields, &content);

        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0].status, CheckStatus::Confirmed);
        assert_eq!(checks[1].current, "SAE J403");
        assert_eq!(checks[1].verified, "SAE J403-2014");
        assert_eq!(checks[1].status, CheckStatus::Divergent);
        assert_eq!(checks[1].source, "sae.org");
        assert_eq!(checks[2].field, "manufacturer");
        assert_eq!(checks[2].current, "Gerdau");
        assert_eq!(checks[2].status, CheckStatus::NotFound);

        let summary = StatusSummary::of(&checks);
        assert_eq!((summary.confirmed, summary.divergent, summary.not_found), (1, 1, 1));
    }

    /// Answers with a fixed table and fails for records labelled `FAIL`.
    struct ScriptedProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn model(&self) -> &str {
            "test"
        }
        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.question().contains("| code | FAIL |") {
                anyhow::bail!("upstream exploded");
            }
            Ok(ChatResponse {
                content: "| Field | Current | Verified | Status | Source |\n|---|---|---|---|---|\n\
                          | code |  |  | CONFIRMED | [1] |"
                    .to_string(),
                citations: vec!["https://example.com/datasheet".to_string()],
                model: "test".to_string(),
                usage: None,
            })
        }
    }

    async fn context(provider: Option<Arc<dyn ChatProvider>>) -> (TempDir, AppContext) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("v.sqlite")).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let mut config = Config::minimal();
        config.validation.max_rows = 3;
        config.validation.concurrency = 2;
        let webhooks = WebhookClient::new(&WebhookConfig::default()).unwrap();
        (tmp, AppContext::new(config, pool, webhooks, provider))
    }

    fn row(code: &str) -> MaterialRecord {
        MaterialRecord {
            code: code.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_validate_rows_keeps_order_and_isolates_failures() {
        let provider = Arc::new(ScriptedProvider {
            calls: AtomicUsize::new(0),
        });
        let (_tmp, ctx) = context(Some(provider.clone() as Arc<dyn ChatProvider>)).await;
        let request = ValidateRequest {
            rows: vec![row("A1"), row("FAIL"), row("C3")],
            fields: Vec::new(),
        };

        let reports = validate_rows(&ctx, None, &request).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        let labels: Vec<&str> = reports.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["A1", "FAIL", "C3"]);

        assert!(reports[0].error.is_none());
        assert_eq!(reports[0].checks[0].current, "A1");
        assert_eq!(reports[0].summary.confirmed, 1);
        assert_eq!(reports[0].citations, vec!["https://example.com/datasheet"]);
        assert!(reports[1].error.as_deref().unwrap().contains("upstream exploded"));
        assert_eq!(reports[2].row, 2);
    }

    #[tokio::test]
    async fn test_validate_rows_limits() {
        let (_tmp, ctx) = context(None).await;

        let empty = ValidateRequest::default();
        let err: AppError = validate_rows(&ctx, None, &empty).await.unwrap_err().into();
        assert_eq!(err.code(), "bad_request");

        let too_many = ValidateRequest {
            rows: (0..4).map(|i| row(&i.to_string())).collect(),
            fields: Vec::new(),
        };
        let err: AppError = validate_rows(&ctx, None, &too_many).await.unwrap_err().into();
        assert_eq!(err.code(), "bad_request");

        let one = ValidateRequest {
            rows: vec![row("A1")],
            fields: Vec::new(),
        };
        let err: AppError = validate_rows(&ctx, None, &one).await.unwrap_err().into();
        assert_eq!(err.code(), "not_configured");
    }
}
