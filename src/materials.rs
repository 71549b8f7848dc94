//! Material search, equivalence lookup, and enrichment.
//!
//! Answers arrive either from the AI provider (markdown text) or from a
//! workflow webhook (text or JSON). Both paths end in [`MaterialRecord`]s:
//! table headers and JSON keys are mapped to record fields through
//! [`canonical_field`], which knows the English and Portuguese column names
//! the models and workflows produce.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::config::WebhookKind;
use crate::context::AppContext;
use crate::error::AppError;
use crate::feedback;
use crate::markdown::{normalize_header, process_content, MarkdownTable, ProcessedContent};
use crate::models::{Equivalence, MaterialRecord, SearchKind};
use crate::prompt;
use crate::webhook::{text_of_reply, unwrap_reply};

/// Maps a (normalized) column name to a [`MaterialRecord`] field.
///
/// Returns `"sources"` for link columns and `None` for unknown columns.
pub fn canonical_field(header: &str) -> Option<&'static str> {
    let h = normalize_header(header);
    let field = match h.as_str() {
        "code" | "codigo" | "cod" | "material_code" | "codigo_do_material" | "part_number"
        | "pn" | "sku" | "item" | "numero_da_peca" => "code",
        "description" | "descricao" | "desc" | "name" | "nome" | "material"
        | "descricao_do_material" => "description",
        "manufacturer" | "fabricante" | "supplier" | "fornecedor" | "brand" | "marca" => {
            "manufacturer"
        }
        "material_type" | "type" | "tipo" | "tipo_de_material" | "category" | "categoria" => {
            "material_type"
        }
        "standard" | "norma" | "norm" | "spec" | "specification" | "especificacao" => "standard",
        "properties" | "propriedades" | "characteristics" | "caracteristicas" => "properties",
        "source" | "sources" | "fonte" | "fontes" | "link" | "links" | "url" | "reference"
        | "referencia" => "sources",
        _ => return None,
    };
    Some(field)
}

pub(crate) fn split_sources(cell: &str) -> Vec<String> {
    cell.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(|s| s.trim_matches(|c: char| c == '<' || c == '>' || c == '(' || c == ')'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn push_unique(list: &mut Vec<String>, items: impl IntoIterator<Item = String>) {
    for item in items {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

fn apply_cell(record: &mut MaterialRecord, header: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    match canonical_field(header) {
        Some("sources") => push_unique(&mut record.sources, split_sources(value)),
        Some(field) => record.set_field(field, value.to_string()),
        None => {
            let key = normalize_header(header);
            if !key.is_empty() {
                record.attributes.insert(key, value.to_string());
            }
        }
    }
}

fn identified(record: &MaterialRecord) -> bool {
    !record.is_empty()
}

fn table_records(table: &MarkdownTable, keep: fn(&MaterialRecord) -> bool) -> Vec<MaterialRecord> {
    table
        .records()
        .into_iter()
        .map(|cells| {
            let mut record = MaterialRecord::default();
            for (header, value) in cells {
                apply_cell(&mut record, header, value);
            }
            record
        })
        .filter(|r| keep(r))
        .collect()
}

/// Converts every table row into a record, dropping rows without code and
/// description.
pub fn records_from_table(table: &MarkdownTable) -> Vec<MaterialRecord> {
    table_records(table, identified)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(value_text)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        _ => None,
    }
}

/// Converts one JSON object (webhook row) into a record.
pub fn record_from_object(obj: &serde_json::Map<String, Value>) -> MaterialRecord {
    let mut record = MaterialRecord::default();
    for (key, value) in obj {
        if key == "attributes" {
            if let Value::Object(attrs) = value {
                for (k, v) in attrs {
                    if let Some(text) = value_text(v) {
                        apply_cell(&mut record, k, &text);
                    }
                }
            }
            continue;
        }
        if let Some(text) = value_text(value) {
            apply_cell(&mut record, key, &text);
        }
    }
    record
}

/// Records from a workflow reply: row objects (bare, or under `materials`,
/// `records`, `data`), a single record object, or answer text with tables.
/// Records without code and description are dropped.
pub fn records_from_reply(reply: Value) -> (Vec<MaterialRecord>, Option<ProcessedContent>) {
    reply_records(reply, identified)
}

/// Like [`records_from_reply`], but keeps records holding only some fields.
/// Enrichment workflows answer with the new data alone.
pub fn partial_records_from_reply(reply: Value) -> (Vec<MaterialRecord>, Option<ProcessedContent>) {
    reply_records(reply, MaterialRecord::has_data)
}

fn reply_records(
    reply: Value,
    keep: fn(&MaterialRecord) -> bool,
) -> (Vec<MaterialRecord>, Option<ProcessedContent>) {
    let reply = unwrap_reply(reply);

    let rows = match &reply {
        Value::Array(items) => Some(items.clone()),
        Value::Object(obj) => ["materials", "records", "data"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array).cloned()),
        _ => None,
    };

    if let Some(rows) = rows {
        let records = rows
            .iter()
            .filter_map(|r| unwrap_reply(r.clone()).as_object().map(record_from_object))
            .filter(|r| keep(r))
            .collect();
        return (records, None);
    }

    if let Value::Object(obj) = &reply {
        if let Some(Value::Object(material)) = obj.get("material") {
            let record = record_from_object(material);
            return (vec![record].into_iter().filter(|r| keep(r)).collect(), None);
        }
        // An unidentified object that carries answer text is read as text
        let record = record_from_object(obj);
        if keep(&record) && (!record.is_empty() || text_of_reply(&reply).is_none()) {
            return (vec![record], None);
        }
    }

    match text_of_reply(&reply) {
        Some(text) => {
            let processed = process_content(&text);
            let records = processed
                .tables
                .iter()
                .flat_map(|t| table_records(t, keep))
                .collect();
            (records, Some(processed))
        }
        None => (Vec::new(), None),
    }
}

// ============ Search ============

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub query: String,
    pub records: Vec<MaterialRecord>,
    /// Prose that accompanied the table(s).
    pub summary: String,
    pub citations: Vec<String>,
    /// `"webhook"` or the AI provider name.
    pub source: String,
    /// The unprocessed answer, kept for rating.
    pub raw: String,
}

pub(crate) async fn record_history(
    pool: &SqlitePool,
    user_id: Option<&str>,
    kind: SearchKind,
    query: &str,
    result_count: usize,
) {
    let result = sqlx::query(
        "INSERT INTO search_history (user_id, kind, query, result_count, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(kind.as_str())
    .bind(query)
    .bind(result_count as i64)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to record search history");
    }
}

fn require_query(query: &str) -> Result<&str> {
    let q = query.trim();
    if q.is_empty() {
        return Err(AppError::BadRequest("query must not be empty".to_string()).into());
    }
    Ok(q)
}

/// Maps `[n]` citation numbers onto provider URLs.
pub(crate) fn cited_urls(citations: &[String], numbers: &[u32]) -> Vec<String> {
    if numbers.is_empty() {
        return citations.to_vec();
    }
    let mut urls = Vec::new();
    for n in numbers {
        if let Some(url) = (*n as usize).checked_sub(1).and_then(|i| citations.get(i)) {
            push_unique(&mut urls, [url.clone()]);
        }
    }
    // Citations the text did not reference are still listed after the cited ones
    push_unique(&mut urls, citations.iter().cloned());
    urls
}

pub async fn search_materials(
    ctx: &AppContext,
    user_id: Option<&str>,
    query: &str,
) -> Result<SearchOutcome> {
    let query = require_query(query)?;

    let outcome = if ctx.webhooks.is_configured(WebhookKind::Search) {
        let reply = ctx
            .webhooks
            .post_json(WebhookKind::Search, &json!({ "query": query, "user": user_id }))
            .await?;
        let raw = text_of_reply(&reply).unwrap_or_else(|| reply.to_string());
        let (records, processed) = records_from_reply(reply);
        let processed = processed.unwrap_or_default();
        SearchOutcome {
            query: query.to_string(),
            records,
            summary: processed.text,
            citations: Vec::new(),
            source: "webhook".to_string(),
            raw,
        }
    } else {
        let provider = ctx.provider()?;
        let examples = feedback::select_examples(
            &ctx.pool,
            SearchKind::Search,
            query,
            ctx.config.feedback.min_rating,
            ctx.config.feedback.max_examples,
        )
        .await?;
        let request = prompt::build_search_prompt(query, &examples);
        let response = provider.complete(&request).await?;
        let processed = process_content(&response.content);
        let records = processed.tables.iter().flat_map(records_from_table).collect();

        SearchOutcome {
            query: query.to_string(),
            records,
            summary: processed.text,
            citations: cited_urls(&response.citations, &processed.citations),
            source: provider.name().to_string(),
            raw: response.content,
        }
    };

    tracing::info!(
        query,
        source = %outcome.source,
        results = outcome.records.len(),
        "material search"
    );
    record_history(&ctx.pool, user_id, SearchKind::Search, query, outcome.records.len()).await;
    Ok(outcome)
}

// ============ Equivalences ============

#[derive(Debug, Clone, Serialize)]
pub struct EquivalenceOutcome {
    pub material: String,
    pub equivalents: Vec<Equivalence>,
    pub summary: String,
    pub citations: Vec<String>,
    pub raw: String,
}

/// Reads a confidence cell: `High`/`Alta`, `Medium`/`Média`, `Low`/`Baixa`,
/// a percentage, or a fraction.
pub fn parse_confidence(cell: &str) -> Option<f32> {
    let norm = normalize_header(cell);
    match norm.as_str() {
        "high" | "alta" | "alto" => return Some(0.9),
        "medium" | "media" | "medio" | "moderate" => return Some(0.6),
        "low" | "baixa" | "baixo" => return Some(0.3),
        _ => {}
    }
    let trimmed = cell.trim();
    let (number, percent) = match trimmed.strip_suffix('%') {
        Some(n) => (n.trim(), true),
        None => (trimmed, false),
    };
    let value: f32 = number.replace(',', ".").parse().ok()?;
    let value = if percent || value > 1.0 { value / 100.0 } else { value };
    (0.0..=1.0).contains(&value).then_some(value)
}

pub fn equivalences_from_table(table: &MarkdownTable) -> Vec<Equivalence> {
    let find = |names: &[&str]| names.iter().find_map(|n| table.column(n));
    let standard = find(&["standard", "norma", "system", "sistema"]);
    let designation = find(&["designation", "designacao", "equivalent", "equivalente", "grade", "material"]);
    let notes = find(&["notes", "observacoes", "obs", "remarks", "comments", "notas"]);
    let confidence = find(&["confidence", "confianca"]);

    let (standard, designation) = match (standard, designation) {
        (Some(s), Some(d)) => (s, d),
        _ => return Vec::new(),
    };

    table
        .rows
        .iter()
        .filter(|row| !row[designation].is_empty())
        .map(|row| Equivalence {
            standard: row[standard].clone(),
            designation: row[designation].clone(),
            notes: notes.map(|i| row[i].clone()).unwrap_or_default(),
            confidence: confidence.and_then(|i| parse_confidence(&row[i])),
        })
        .collect()
}

pub async fn find_equivalents(
    ctx: &AppContext,
    user_id: Option<&str>,
    material: &str,
    standards: &[String],
) -> Result<EquivalenceOutcome> {
    let material = require_query(material)?;

    let (raw, citations) = if ctx.webhooks.is_configured(WebhookKind::Equivalence) {
        let reply = ctx
            .webhooks
            .post_json(
                WebhookKind::Equivalence,
                &json!({ "material": material, "standards": standards }),
            )
            .await?;
        let text = text_of_reply(&reply).ok_or_else(|| {
            AppError::Upstream("equivalence workflow returned no text".to_string())
        })?;
        (text, Vec::new())
    } else {
        let provider = ctx.provider()?;
        let examples = feedback::select_examples(
            &ctx.pool,
            SearchKind::Equivalence,
            material,
            ctx.config.feedback.min_rating,
            ctx.config.feedback.max_examples,
        )
        .await?;
        let request = prompt::build_equivalence_prompt(material, standards, &examples);
        let response = provider.complete(&request).await?;
        (response.content, response.citations)
    };

    let processed = process_content(&raw);
    let equivalents: Vec<Equivalence> = processed
        .tables
        .iter()
        .flat_map(equivalences_from_table)
        .collect();

    record_history(&ctx.pool, user_id, SearchKind::Equivalence, material, equivalents.len()).await;

    Ok(EquivalenceOutcome {
        material: material.to_string(),
        equivalents,
        summary: processed.text.clone(),
        citations: cited_urls(&citations, &processed.citations),
        raw,
    })
}

// ============ Enrichment ============

/// Overlays `incoming` onto `base`: non-empty fields replace, sources are
/// unioned, attributes merged with incoming values winning.
pub fn merge_records(base: &MaterialRecord, incoming: &MaterialRecord) -> MaterialRecord {
    let mut merged = base.clone();
    for field in MaterialRecord::FIELDS {
        if let Some(value) = incoming.field(field).filter(|v| !v.trim().is_empty()) {
            merged.set_field(field, value.to_string());
        }
    }
    push_unique(&mut merged.sources, incoming.sources.iter().cloned());
    for (k, v) in &incoming.attributes {
        if !v.trim().is_empty() {
            merged.attributes.insert(k.clone(), v.clone());
        }
    }
    merged
}

pub async fn enrich(ctx: &AppContext, record: &MaterialRecord) -> Result<MaterialRecord> {
    if record.is_empty() {
        return Err(
            AppError::BadRequest("record needs a code or a description".to_string()).into(),
        );
    }
    let reply = ctx.webhooks.enrich_material(record).await?;
    let (records, _) = partial_records_from_reply(reply);

    let incoming = match records.into_iter().next() {
        Some(r) => r,
        None => {
            tracing::info!(material = record.label(), "enrichment returned no data");
            return Ok(record.clone());
        }
    };
    Ok(merge_records(record, &incoming))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markdown::parse_markdown_table;

    #[test]
    fn test_records_from_portuguese_table() {
        let table = parse_markdown_table(
            "| Código | Descrição | Fabricante | Norma | Dureza | Fonte |\n\
             |---|---|---|---|---|---|\n\
             | 1020 | Aço carbono | Gerdau | SAE J403 | 111 HB | https://a.example, https://b.example |\n\
             |  |  | Usiminas |  |  |  |",
        )
        .unwrap();
        let records = records_from_table(&table);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.code, "1020");
        assert_eq!(r.description, "Aço carbono");
        assert_eq!(r.manufacturer, "Gerdau");
        assert_eq!(r.standard, "SAE J403");
        assert_eq!(r.attributes.get("dureza").map(String::as_str), Some("111 HB"));
        assert_eq!(r.sources, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_records_from_json_rows() {
        let reply = json!([{ "json": { "materials": [
            { "codigo": "A1", "descricao": "Borracha", "shore": 70 },
            { "note": "no identity" }
        ] } }]);
        let (records, processed) = records_from_reply(reply);
        assert!(processed.is_none());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code, "A1");
        assert_eq!(records[0].attributes.get("shore").map(String::as_str), Some("70"));
    }

    #[test]
    fn test_records_from_text_reply() {
        let reply = json!({ "output": "Found:\n\n| Code | Description |\n|---|---|\n| X9 | Nylon 66 |" });
        let (records, processed) = records_from_reply(reply);
        assert_eq!(records[0].description, "Nylon 66");
        assert_eq!(processed.unwrap().text, "Found:");
    }

    #[test]
    fn test_single_material_reply() {
        let reply = json!({ "material": { "code": "A1", "manufacturer": "Acme" } });
        let (records, _) = records_from_reply(reply);
        assert_eq!(records[0].manufacturer, "Acme");
    }

    #[test]
    fn test_parse_confidence() {
        assert_eq!(parse_confidence("High"), Some(0.9));
        assert_eq!(parse_confidence("Média"), Some(0.6));
        assert_eq!(parse_confidence("85%"), Some(0.85));
        assert_eq!(parse_confidence("0,7"), Some(0.7));
        assert_eq!(parse_confidence("40"), Some(0.4));
        assert_eq!(parse_confidence("unknown"), None);
        assert_eq!(parse_confidence("250%"), None);
    }

    #[test]
    fn test_equivalences_from_table() {
        let table = parse_markdown_table(
            "| Norma | Designação | Observações | Confiança |\n|---|---|---|---|\n\
             | DIN | C22 | similar carbon | Alta |\n| JIS | S20C |  | 70% |\n| ISO |  | none | Low |",
        )
        .unwrap();
        let eq = equivalences_from_table(&table);
        assert_eq!(eq.len(), 2);
        assert_eq!(eq[0].standard, "DIN");
        assert_eq!(eq[0].designation, "C22");
        assert_eq!(eq[0].confidence, Some(0.9));
        assert_eq!(eq[1].notes, "");
        assert_eq!(eq[1].confidence, Some(0.7));
    }

    #[test]
    fn test_equivalences_need_identity_columns() {
        let table = parse_markdown_table("| A | B |\n|---|---|\n| 1 | 2 |").unwrap();
        assert!(equivalences_from_table(&table).is_empty());
    }

    #[test]
    fn test_partial_records_from_enrichment_reply() {
        let reply = json!([{ "json": { "material": { "fabricante": "Gerdau", "dureza": "111 HB" } } }]);
        assert!(records_from_reply(reply.clone()).0.is_empty());

        let (records, _) = partial_records_from_reply(reply);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].manufacturer, "Gerdau");
        assert_eq!(records[0].attributes["dureza"], "111 HB");

        let (records, _) = partial_records_from_reply(json!({ "fonte": "https://x.example" }));
        assert_eq!(records[0].sources, vec!["https://x.example"]);

        let (records, processed) =
            partial_records_from_reply(json!({ "output": "| Fabricante |\n|---|\n| Usiminas |" }));
        assert!(processed.is_some());
        assert_eq!(records[0].manufacturer, "Usiminas");

        assert!(partial_records_from_reply(json!({ "material": {} })).0.is_empty());
    }

    #[test]
    fn test_merge_records() {
        let base = MaterialRecord {
            code: "1020".to_string(),
            description: "Steel".to_string(),
            sources: vec!["https://a".to_string()],
            ..Default::default()
        };
        let mut incoming = MaterialRecord {
            description: "Carbon steel, hot rolled".to_string(),
            manufacturer: "Gerdau".to_string(),
            sources: vec!["https://a".to_string(), "https://b".to_string()],
            ..Default::default()
        };
        incoming.attributes.insert("hardness".to_string(), "111 HB".to_string());

        let merged = merge_records(&base, &incoming);
        assert_eq!(merged.code, "1020");
        assert_eq!(merged.description, "Carbon steel, hot rolled");
        assert_eq!(merged.manufacturer, "Gerdau");
        assert_eq!(merged.sources, vec!["https://a", "https://b"]);
        assert_eq!(merged.attributes["hardness"], "111 HB");
    }

    #[test]
    fn test_cited_urls_order() {
        let citations = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
        assert_eq!(cited_urls(&citations, &[3, 1, 9]), vec!["u3", "u1", "u2"]);
        assert_eq!(cited_urls(&citations, &[]), citations);
    }
}
