//! Core data models used throughout PDM Assist.
//!
//! These types represent the users, sessions, material records, and rated
//! answers that flow between the web UI, the AI providers, and the webhooks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered account.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub created_at: i64,
}

/// A login session stored in SQLite.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// One material row of the product data model.
///
/// Fields that the AI or the enrichment workflow could not determine are
/// empty strings. Columns without a dedicated field are kept in `attributes`
/// under their normalized header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialRecord {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub material_type: String,
    #[serde(default)]
    pub standard: String,
    #[serde(default)]
    pub properties: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl MaterialRecord {
    /// Names of the standard fields, in display order.
    pub const FIELDS: [&'static str; 6] = [
        "code",
        "description",
        "manufacturer",
        "material_type",
        "standard",
        "properties",
    ];

    /// Returns a field by name, looking in `attributes` for non-standard names.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "code" => Some(&self.code),
            "description" => Some(&self.description),
            "manufacturer" => Some(&self.manufacturer),
            "material_type" => Some(&self.material_type),
            "standard" => Some(&self.standard),
            "properties" => Some(&self.properties),
            other => self.attributes.get(other).map(String::as_str),
        }
    }

    /// Sets a field by name; non-standard names go to `attributes`.
    pub fn set_field(&mut self, name: &str, value: String) {
        match name {
            "code" => self.code = value,
            "description" => self.description = value,
            "manufacturer" => self.manufacturer = value,
            "material_type" => self.material_type = value,
            "standard" => self.standard = value,
            "properties" => self.properties = value,
            other => {
                self.attributes.insert(other.to_string(), value);
            }
        }
    }

    /// Short human label: the code when present, else the description.
    pub fn label(&self) -> &str {
        if self.code.is_empty() {
            &self.description
        } else {
            &self.code
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.trim().is_empty() && self.description.trim().is_empty()
    }

    /// True when any field, attribute or source is filled in.
    pub fn has_data(&self) -> bool {
        Self::FIELDS
            .iter()
            .any(|f| self.field(f).is_some_and(|v| !v.trim().is_empty()))
            || !self.sources.is_empty()
            || self.attributes.values().any(|v| !v.trim().is_empty())
    }
}

/// An equivalent designation of a material under another standard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equivalence {
    pub standard: String,
    pub designation: String,
    #[serde(default)]
    pub notes: String,
    /// Confidence in `[0.0, 1.0]` when the answer stated one.
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// What kind of interaction a query or a rating belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    #[default]
    Search,
    Equivalence,
    Validation,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchKind::Search => "search",
            SearchKind::Equivalence => "equivalence",
            SearchKind::Validation => "validation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "search" => Some(SearchKind::Search),
            "equivalence" => Some(SearchKind::Equivalence),
            "validation" => Some(SearchKind::Validation),
            _ => None,
        }
    }
}

/// A stored rating of an answer.
#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub id: i64,
    pub user_id: Option<String>,
    pub kind: SearchKind,
    pub question: String,
    pub answer: String,
    pub rating: i64,
    pub comment: Option<String>,
    pub created_at: i64,
}

/// A rating submitted by a user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewFeedback {
    #[serde(default)]
    pub kind: SearchKind,
    pub question: String,
    pub answer: String,
    pub rating: i64,
    #[serde(default)]
    pub comment: Option<String>,
}
