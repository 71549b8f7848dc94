//! Implementations of the `pdm` CLI commands.
//!
//! Each `run_*` function prints its result to stdout; errors propagate to
//! `main` and end the process with a non-zero status.

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use std::io::{BufRead, Read};
use std::path::Path;

use crate::auth;
use crate::config::Config;
use crate::context::AppContext;
use crate::db;
use crate::feedback;
use crate::markdown::process_content;
use crate::materials;
use crate::migrate;
use crate::pivot::{build_pivot_query, PivotRequest, PivotSchema};
use crate::validate::{self, ValidateRequest};

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

/// Uses `password` when given, otherwise the first line of stdin.
fn password_or_stdin(password: Option<String>) -> Result<String> {
    if let Some(p) = password {
        return Ok(p);
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    if line.is_empty() {
        bail!("no password given (use --password or pipe it on stdin)");
    }
    Ok(line)
}

fn format_date(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn run_user_add(
    config: &Config,
    email: &str,
    name: Option<&str>,
    password: Option<String>,
) -> Result<()> {
    let password = password_or_stdin(password)?;
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let user = auth::create_user(
        &pool,
        email,
        name.unwrap_or(""),
        &password,
        config.auth.min_password_len,
    )
    .await?;
    pool.close().await;
    println!("Created user {} ({})", user.email, user.id);
    Ok(())
}

pub async fn run_user_passwd(config: &Config, email: &str, password: Option<String>) -> Result<()> {
    let password = password_or_stdin(password)?;
    let pool = db::connect(config).await?;
    auth::set_password(&pool, email, &password, config.auth.min_password_len).await?;
    pool.close().await;
    println!("Password updated for {}; existing sessions revoked.", email.trim());
    Ok(())
}

pub async fn run_user_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let users = auth::list_users(&pool).await?;
    pool.close().await;

    if users.is_empty() {
        println!("No users.");
        return Ok(());
    }
    for u in users {
        println!("{:<36}  {:<32}  {:<20}  {}", u.id, u.email, u.name, format_date(u.created_at));
    }
    Ok(())
}

pub async fn run_search(config: &Config, query: &str, json: bool) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let outcome = materials::search_materials(&ctx, None, query).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!("{} result(s) via {}\n", outcome.records.len(), outcome.source);
    for (i, r) in outcome.records.iter().enumerate() {
        println!("{}. {} | {}", i + 1, r.code, r.description);
        for (label, value) in [
            ("manufacturer", &r.manufacturer),
            ("type", &r.material_type),
            ("standard", &r.standard),
            ("properties", &r.properties),
        ] {
            if !value.is_empty() {
                println!("    {}: {}", label, value);
            }
        }
        for (k, v) in &r.attributes {
            println!("    {}: {}", k, v);
        }
        if !r.sources.is_empty() {
            println!("    sources: {}", r.sources.join(", "));
        }
    }
    if !outcome.summary.is_empty() {
        println!("\n{}", outcome.summary);
    }
    for (i, url) in outcome.citations.iter().enumerate() {
        println!("[{}] {}", i + 1, url);
    }
    Ok(())
}

pub async fn run_equivalents(
    config: &Config,
    material: &str,
    standards: &[String],
    json: bool,
) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let outcome = materials::find_equivalents(&ctx, None, material, standards).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if outcome.equivalents.is_empty() {
        println!("No equivalents found for {}.", outcome.material);
    }
    for eq in &outcome.equivalents {
        let confidence = eq
            .confidence
            .map(|c| format!("{:.0}%", c * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<12} {:<20} {:>5}  {}", eq.standard, eq.designation, confidence, eq.notes);
    }
    if !outcome.summary.is_empty() {
        println!("\n{}", outcome.summary);
    }
    Ok(())
}

/// Validates rows from a JSON file holding either `{ "rows": [...],
/// "fields": [...] }` or a bare array of records.
pub async fn run_validate(config: &Config, file: &Path, fields: &[String]) -> Result<()> {
    let text = read_input(Some(file))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", file.display()))?;

    let mut request: ValidateRequest = if value.is_array() {
        ValidateRequest {
            rows: serde_json::from_value(value)?,
            fields: Vec::new(),
        }
    } else {
        serde_json::from_value(value)?
    };
    if !fields.is_empty() {
        request.fields = fields.to_vec();
    }

    let ctx = AppContext::open(config).await?;
    let reports = validate::validate_rows(&ctx, None, &request).await?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

/// Runs markdown processing over a file (or stdin) and prints the result as
/// JSON.
pub fn run_parse_table(file: Option<&Path>) -> Result<()> {
    let text = read_input(file)?;
    let processed = process_content(&text);
    println!("{}", serde_json::to_string_pretty(&processed)?);
    Ok(())
}

pub fn run_pivot_sql(config: &Config, file: &Path) -> Result<()> {
    let text = read_input(Some(file))?;
    let request: PivotRequest = serde_json::from_str(&text)
        .with_context(|| format!("Invalid pivot request in {}", file.display()))?;
    let schema = PivotSchema::from_config(&config.reports);
    let query = build_pivot_query(&request, &schema)?;
    println!("{}", query.sql);
    Ok(())
}

pub async fn run_feedback_list(config: &Config, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let items = feedback::list_feedback(&pool, limit).await?;
    pool.close().await;

    if items.is_empty() {
        println!("No feedback yet.");
    }
    for f in items {
        println!(
            "#{} [{}] {}/5  {}  {}",
            f.id,
            f.kind.as_str(),
            f.rating,
            format_date(f.created_at),
            f.question
        );
        if let Some(comment) = &f.comment {
            println!("    note: {}", comment);
        }
    }
    Ok(())
}

pub async fn run_feedback_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = feedback::feedback_stats(&pool).await?;
    pool.close().await;

    println!("ratings: {}", stats.count);
    match stats.average {
        Some(avg) => println!("average: {:.2}", avg),
        None => println!("average: n/a"),
    }
    for (i, n) in stats.histogram.iter().enumerate() {
        println!("  {}: {}", i + 1, n);
    }
    Ok(())
}

pub async fn run_sessions_purge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let removed = auth::purge_expired(&pool).await?;
    pool.close().await;
    println!("Removed {} expired or revoked session(s).", removed);
    Ok(())
}
