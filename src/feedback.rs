//! Feedback collection and example selection.
//!
//! Users rate answers from 1 to 5. Highly rated question/answer pairs are
//! folded back into later prompts as examples (see [`crate::prompt`]), so
//! the assistant converges on the answers the team found useful.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::error::AppError;
use crate::markdown::normalize_header;
use crate::models::{Feedback, NewFeedback, SearchKind};

/// Longest question or answer stored, in characters.
pub const MAX_TEXT_CHARS: usize = 4000;

/// How many recent rated pairs are considered when picking examples.
const CANDIDATE_POOL: i64 = 200;

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn feedback_from_row(row: &sqlx::sqlite::SqliteRow) -> Feedback {
    let kind: String = row.get("kind");
    Feedback {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: SearchKind::parse(&kind).unwrap_or_default(),
        question: row.get("question"),
        answer: row.get("answer"),
        rating: row.get("rating"),
        comment: row.get("comment"),
        created_at: row.get("created_at"),
    }
}

pub async fn submit_feedback(
    pool: &SqlitePool,
    user_id: Option<&str>,
    input: NewFeedback,
) -> Result<Feedback> {
    if !(1..=5).contains(&input.rating) {
        return Err(AppError::BadRequest("rating must be between 1 and 5".to_string()).into());
    }
    let question = input.question.trim();
    let answer = input.answer.trim();
    if question.is_empty() || answer.is_empty() {
        return Err(
            AppError::BadRequest("question and answer must not be empty".to_string()).into(),
        );
    }

    let question = truncate_chars(question, MAX_TEXT_CHARS);
    let answer = truncate_chars(answer, MAX_TEXT_CHARS);
    let comment = input
        .comment
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| truncate_chars(c, MAX_TEXT_CHARS));
    let created_at = Utc::now().timestamp();

    let result = sqlx::query(
        "INSERT INTO feedback (user_id, kind, question, answer, rating, comment, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(input.kind.as_str())
    .bind(&question)
    .bind(&answer)
    .bind(input.rating)
    .bind(&comment)
    .bind(created_at)
    .execute(pool)
    .await?;

    let feedback = Feedback {
        id: result.last_insert_rowid(),
        user_id: user_id.map(str::to_string),
        kind: input.kind,
        question,
        answer,
        rating: input.rating,
        comment,
        created_at,
    };
    tracing::info!(id = feedback.id, rating = feedback.rating, kind = feedback.kind.as_str(), "feedback stored");
    Ok(feedback)
}

pub async fn list_feedback(pool: &SqlitePool, limit: i64) -> Result<Vec<Feedback>> {
    let rows = sqlx::query(
        "SELECT id, user_id, kind, question, answer, rating, comment, created_at FROM feedback ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(feedback_from_row).collect())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub count: i64,
    pub average: Option<f64>,
    /// `histogram[i]` is the number of ratings equal to `i + 1`.
    pub histogram: [i64; 5],
}

pub async fn feedback_stats(pool: &SqlitePool) -> Result<FeedbackStats> {
    let rows = sqlx::query("SELECT rating, COUNT(*) AS n FROM feedback GROUP BY rating")
        .fetch_all(pool)
        .await?;

    let mut stats = FeedbackStats::default();
    let mut sum = 0i64;
    for row in &rows {
        let rating: i64 = row.get("rating");
        let n: i64 = row.get("n");
        if (1..=5).contains(&rating) {
            stats.histogram[(rating - 1) as usize] = n;
            stats.count += n;
            sum += rating * n;
        }
    }
    if stats.count > 0 {
        stats.average = Some(sum as f64 / stats.count as f64);
    }
    Ok(stats)
}

fn tokens(text: &str) -> HashSet<String> {
    normalize_header(text)
        .split('_')
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Picks rated pairs to show the model as examples.
///
/// Only pairs of the same `kind` with `rating >= min_rating` qualify. They
/// are ranked by how many query tokens they share, then by rating, then by
/// recency.
pub async fn select_examples(
    pool: &SqlitePool,
    kind: SearchKind,
    query: &str,
    min_rating: i64,
    max: usize,
) -> Result<Vec<Feedback>> {
    if max == 0 {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "SELECT id, user_id, kind, question, answer, rating, comment, created_at FROM feedback WHERE kind = ? AND rating >= ? ORDER BY rating DESC, created_at DESC, id DESC LIMIT ?",
    )
    .bind(kind.as_str())
    .bind(min_rating)
    .bind(CANDIDATE_POOL)
    .fetch_all(pool)
    .await?;

    let query_tokens = tokens(query);
    let mut scored: Vec<(usize, Feedback)> = rows
        .iter()
        .map(feedback_from_row)
        .map(|f| {
            let overlap = tokens(&f.question).intersection(&query_tokens).count();
            (overlap, f)
        })
        .collect();

    // Stable sort keeps the SQL order (rating, recency) among equal overlaps
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(scored.into_iter().take(max).map(|(_, f)| f).collect())
}
