//! Pivot-table reporting: SQL construction and result assembly.
//!
//! The reporting UI lets users pick row dimensions, column dimensions,
//! measures with an aggregation, and filters. [`build_pivot_query`] turns
//! that selection into a single PostgreSQL `SELECT … GROUP BY` statement,
//! which the report webhook executes. The flat aggregate rows that come back
//! are folded into a two-dimensional grid by [`PivotTable::assemble`].
//!
//! The statement is sent as text, so nothing user-supplied reaches it
//! unchecked:
//!
//! - identifiers must be on the configured whitelist and are double-quoted;
//! - literals are rendered from typed JSON values with quotes doubled;
//! - `contains` patterns escape `%`, `_` and `\`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::config::ReportsConfig;
use crate::error::AppError;

// ============ Request types ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    CountDistinct,
    Min,
    Max,
}

impl Aggregation {
    fn key(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Count => "count",
            Aggregation::CountDistinct => "count_distinct",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }

    /// Combines partial aggregates into a total, or `None` when the
    /// aggregation is not decomposable (averages, distinct counts).
    fn combine(&self, values: impl Iterator<Item = f64>) -> Option<f64> {
        let mut values = values.peekable();
        values.peek()?;
        match self {
            Aggregation::Sum | Aggregation::Count => Some(values.sum()),
            Aggregation::Min => values.reduce(f64::min),
            Aggregation::Max => values.reduce(f64::max),
            Aggregation::Avg | Aggregation::CountDistinct => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Year,
    Quarter,
    Month,
    Week,
    Day,
}

impl Granularity {
    fn as_str(&self) -> &'static str {
        match self {
            Granularity::Year => "year",
            Granularity::Quarter => "quarter",
            Granularity::Month => "month",
            Granularity::Week => "week",
            Granularity::Day => "day",
        }
    }
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "year" => Ok(Granularity::Year),
            "quarter" => Ok(Granularity::Quarter),
            "month" => Ok(Granularity::Month),
            "week" => Ok(Granularity::Week),
            "day" => Ok(Granularity::Day),
            other => bail!("unknown date granularity: '{}'", other),
        }
    }
}

/// A grouping column, optionally bucketed by date (`"created_at:month"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dimension {
    pub field: String,
    pub granularity: Option<Granularity>,
}

impl Dimension {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            granularity: None,
        }
    }

    /// Output column name of this dimension.
    pub fn alias(&self) -> String {
        match self.granularity {
            Some(g) => format!("{}_{}", self.field, g.as_str()),
            None => self.field.clone(),
        }
    }

    fn select_expr(&self) -> String {
        match self.granularity {
            Some(g) => format!(
                "date_trunc('{}', {}) AS {}",
                g.as_str(),
                quote_ident(&self.field),
                quote_ident(&self.alias())
            ),
            None => quote_ident(&self.field),
        }
    }
}

impl FromStr for Dimension {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (field, granularity) = match s.split_once(':') {
            Some((f, g)) => (f.trim(), Some(g.parse()?)),
            None => (s.trim(), None),
        };
        if field.is_empty() {
            bail!("dimension field must not be empty");
        }
        Ok(Self {
            field: field.to_string(),
            granularity,
        })
    }
}

impl TryFrom<String> for Dimension {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Dimension> for String {
    fn from(d: Dimension) -> Self {
        d.to_string()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.granularity {
            Some(g) => write!(f, "{}:{}", self.field, g.as_str()),
            None => write!(f, "{}", self.field),
        }
    }
}

/// A measure with its aggregation. `field = "*"` is allowed for `count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub field: String,
    pub agg: Aggregation,
}

impl ValueSpec {
    pub fn alias(&self) -> String {
        if self.field == "*" {
            format!("{}_all", self.agg.key())
        } else {
            format!("{}_{}", self.agg.key(), self.field)
        }
    }

    fn select_expr(&self) -> String {
        let target = if self.field == "*" {
            "*".to_string()
        } else {
            quote_ident(&self.field)
        };
        let expr = match self.agg {
            Aggregation::Sum => format!("SUM({})", target),
            Aggregation::Avg => format!("AVG({})", target),
            Aggregation::Count => format!("COUNT({})", target),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {})", target),
            Aggregation::Min => format!("MIN({})", target),
            Aggregation::Max => format!("MAX({})", target),
        };
        format!("{} AS {}", expr, quote_ident(&self.alias()))
    }
}

impl FromStr for Aggregation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Aggregation::Sum),
            "avg" | "average" => Ok(Aggregation::Avg),
            "count" => Ok(Aggregation::Count),
            "count_distinct" | "distinct" => Ok(Aggregation::CountDistinct),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            other => bail!("unknown aggregation: '{}'", other),
        }
    }
}

/// Parses `agg:field`; a bare `count` means `count:*`.
impl FromStr for ValueSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (agg, field) = match s.split_once(':') {
            Some((a, f)) => (a.parse()?, f.trim()),
            None => match s.trim().parse()? {
                Aggregation::Count => (Aggregation::Count, "*"),
                _ => bail!("value '{}' needs a field, e.g. sum:quantity", s.trim()),
            },
        };
        if field.is_empty() {
            bail!("value '{}' needs a field", s.trim());
        }
        Ok(Self {
            field: field.to_string(),
            agg,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    Between,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PivotRequest {
    #[serde(default)]
    pub rows: Vec<Dimension>,
    #[serde(default)]
    pub columns: Vec<Dimension>,
    #[serde(default)]
    pub values: Vec<ValueSpec>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub limit: Option<u64>,
}

/// The table and columns a pivot query may touch.
#[derive(Debug, Clone)]
pub struct PivotSchema {
    pub table: String,
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    pub max_limit: u64,
}

impl PivotSchema {
    pub fn from_config(config: &ReportsConfig) -> Self {
        Self {
            table: config.table.clone(),
            dimensions: config.dimensions.clone(),
            measures: config.measures.clone(),
            max_limit: config.max_limit,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.table.is_empty() && !self.measures.is_empty()
    }

    fn is_dimension(&self, field: &str) -> bool {
        self.dimensions.iter().any(|d| d == field)
    }

    fn is_measure(&self, field: &str) -> bool {
        self.measures.iter().any(|m| m == field)
    }

    fn is_known(&self, field: &str) -> bool {
        self.is_dimension(field) || self.is_measure(field)
    }
}

/// A rendered pivot statement plus the column names its rows will carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotQuery {
    pub sql: String,
    pub row_keys: Vec<String>,
    pub column_keys: Vec<String>,
    pub value_keys: Vec<String>,
    pub aggregations: Vec<Aggregation>,
}

// ============ SQL construction ============

/// True for identifiers made of ASCII letters, digits and `_`, not starting
/// with a digit, at most 63 bytes (the PostgreSQL limit).
pub fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn bad_request(message: impl Into<String>) -> anyhow::Error {
    AppError::BadRequest(message.into()).into()
}

/// Renders a scalar JSON value as a SQL literal.
fn render_scalar(field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(quote_literal(s)),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("TRUE".to_string()),
        Value::Bool(false) => Ok("FALSE".to_string()),
        Value::Null => Err(bad_request(format!(
            "filter on '{}' has a null value; use is_null instead",
            field
        ))),
        Value::Array(_) | Value::Object(_) => Err(bad_request(format!(
            "filter on '{}' expects a single value",
            field
        ))),
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn render_filter(filter: &Filter) -> Result<String> {
    let column = quote_ident(&filter.field);
    let field = filter.field.as_str();

    let comparison = |op: &str| -> Result<String> {
        Ok(format!("{} {} {}", column, op, render_scalar(field, &filter.value)?))
    };

    match filter.op {
        FilterOp::Eq => comparison("="),
        FilterOp::Ne => comparison("<>"),
        FilterOp::Gt => comparison(">"),
        FilterOp::Gte => comparison(">="),
        FilterOp::Lt => comparison("<"),
        FilterOp::Lte => comparison("<="),
        FilterOp::In | FilterOp::NotIn => {
            let items = match &filter.value {
                Value::Array(items) if !items.is_empty() => items,
                _ => {
                    return Err(bad_request(format!(
                        "filter on '{}' expects a non-empty list",
                        field
                    )))
                }
            };
            let rendered = items
                .iter()
                .map(|v| render_scalar(field, v))
                .collect::<Result<Vec<_>>>()?;
            let op = if filter.op == FilterOp::In { "IN" } else { "NOT IN" };
            Ok(format!("{} {} ({})", column, op, rendered.join(", ")))
        }
        FilterOp::Contains => match &filter.value {
            Value::String(s) if !s.is_empty() => Ok(format!(
                "{} ILIKE {} ESCAPE '\\'",
                column,
                quote_literal(&format!("%{}%", escape_like(s)))
            )),
            _ => Err(bad_request(format!(
                "filter on '{}' expects a non-empty text value",
                field
            ))),
        },
        FilterOp::Between => match &filter.value {
            Value::Array(items) if items.len() == 2 => Ok(format!(
                "{} BETWEEN {} AND {}",
                column,
                render_scalar(field, &items[0])?,
                render_scalar(field, &items[1])?
            )),
            _ => Err(bad_request(format!(
                "filter on '{}' expects a [low, high] pair",
                field
            ))),
        },
        FilterOp::IsNull => Ok(format!("{} IS NULL", column)),
        FilterOp::IsNotNull => Ok(format!("{} IS NOT NULL", column)),
    }
}

/// Builds the aggregate statement for a pivot request.
///
/// Validation failures are returned as [`AppError::BadRequest`].
pub fn build_pivot_query(request: &PivotRequest, schema: &PivotSchema) -> Result<PivotQuery> {
    if !schema.is_configured() {
        return Err(AppError::NotConfigured(
            "reporting is not configured (reports.table / reports.measures)".to_string(),
        )
        .into());
    }
    if request.values.is_empty() {
        return Err(bad_request("at least one value is required"));
    }

    let dims: Vec<&Dimension> = request.rows.iter().chain(request.columns.iter()).collect();
    let mut seen_aliases = BTreeSet::new();

    for dim in &dims {
        if !schema.is_dimension(&dim.field) {
            return Err(bad_request(format!(
                "'{}' is not an available dimension",
                dim.field
            )));
        }
        if !seen_aliases.insert(dim.alias()) {
            return Err(bad_request(format!("dimension '{}' is used twice", dim)));
        }
    }

    for value in &request.values {
        let allowed = match value.agg {
            Aggregation::Count => value.field == "*" || schema.is_known(&value.field),
            Aggregation::CountDistinct => schema.is_known(&value.field),
            _ => schema.is_measure(&value.field),
        };
        if !allowed {
            return Err(bad_request(format!(
                "'{}' cannot be aggregated with {}",
                value.field,
                value.agg.key()
            )));
        }
        if !seen_aliases.insert(value.alias()) {
            return Err(bad_request(format!(
                "value '{}' is requested twice",
                value.alias()
            )));
        }
    }

    for filter in &request.filters {
        if !schema.is_known(&filter.field) {
            return Err(bad_request(format!(
                "cannot filter on unknown field '{}'",
                filter.field
            )));
        }
    }

    let limit = match request.limit {
        Some(0) => return Err(bad_request("limit must be > 0")),
        Some(n) => n.min(schema.max_limit),
        None => schema.max_limit,
    };

    let mut select: Vec<String> = dims.iter().map(|d| d.select_expr()).collect();
    select.extend(request.values.iter().map(ValueSpec::select_expr));

    let mut sql = format!(
        "SELECT {}\nFROM {}",
        select.join(", "),
        quote_table(&schema.table)
    );

    if !request.filters.is_empty() {
        let clauses = request
            .filters
            .iter()
            .map(render_filter)
            .collect::<Result<Vec<_>>>()?;
        sql.push_str("\nWHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !dims.is_empty() {
        let positions = (1..=dims.len())
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!("\nGROUP BY {}\nORDER BY {}", positions, positions));
    }

    sql.push_str(&format!("\nLIMIT {}", limit));

    Ok(PivotQuery {
        sql,
        row_keys: request.rows.iter().map(Dimension::alias).collect(),
        column_keys: request.columns.iter().map(Dimension::alias).collect(),
        value_keys: request.values.iter().map(ValueSpec::alias).collect(),
        aggregations: request.values.iter().map(|v| v.agg).collect(),
    })
}

// ============ Pivot assembly ============

/// Label used for NULL dimension values.
pub const BLANK_LABEL: &str = "(blank)";

/// One row of the assembled grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotRow {
    pub keys: Vec<String>,
    /// `cells[column][value]`.
    pub cells: Vec<Vec<Option<f64>>>,
    /// One total per value across all columns.
    pub totals: Vec<Option<f64>>,
}

/// Aggregates arranged as rows × column tuples × values, with totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotTable {
    pub row_headers: Vec<String>,
    pub column_headers: Vec<String>,
    pub value_headers: Vec<String>,
    /// Distinct column-key tuples, sorted. A single empty tuple when the
    /// request has no column dimensions.
    pub columns: Vec<Vec<String>>,
    pub rows: Vec<PivotRow>,
    /// `column_totals[column][value]`.
    pub column_totals: Vec<Vec<Option<f64>>>,
    pub grand_totals: Vec<Option<f64>>,
}

fn key_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => BLANK_LABEL.to_string(),
        Some(Value::String(s)) if s.is_empty() => BLANK_LABEL.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Numeric aggregates may arrive as JSON numbers or as strings
/// (PostgreSQL `numeric` is serialised as text by most drivers).
fn cell_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl PivotTable {
    /// Folds flat aggregate rows into a grid.
    ///
    /// Row-key tuples keep the order the rows arrived in; column tuples are
    /// sorted. Every row must carry every dimension key.
    pub fn assemble(query: &PivotQuery, records: &[Value]) -> Result<PivotTable> {
        let n_values = query.value_keys.len();

        let mut row_order: Vec<Vec<String>> = Vec::new();
        let mut row_index: HashMap<Vec<String>, usize> = HashMap::new();
        let mut column_set: BTreeSet<Vec<String>> = BTreeSet::new();
        let mut raw: Vec<(usize, Vec<String>, Vec<Option<f64>>)> = Vec::new();

        for (i, record) in records.iter().enumerate() {
            let obj = match record.as_object() {
                Some(obj) => obj,
                None => bail!("report row {} is not an object", i),
            };
            for key in query.row_keys.iter().chain(query.column_keys.iter()) {
                if !obj.contains_key(key) {
                    bail!("report row {} is missing column '{}'", i, key);
                }
            }

            let row_key: Vec<String> = query.row_keys.iter().map(|k| key_text(obj.get(k))).collect();
            let col_key: Vec<String> = query
                .column_keys
                .iter()
                .map(|k| key_text(obj.get(k)))
                .collect();
            let values: Vec<Option<f64>> = query
                .value_keys
                .iter()
                .map(|k| cell_number(obj.get(k)))
                .collect();

            let idx = *row_index.entry(row_key.clone()).or_insert_with(|| {
                row_order.push(row_key);
                row_order.len() - 1
            });
            column_set.insert(col_key.clone());
            raw.push((idx, col_key, values));
        }

        let columns: Vec<Vec<String>> = if column_set.is_empty() {
            vec![Vec::new()]
        } else {
            column_set.into_iter().collect()
        };
        let col_index: HashMap<&Vec<String>, usize> =
            columns.iter().enumerate().map(|(i, c)| (c, i)).collect();

        // Partial values per (row, column, value) before combining duplicates
        let mut partials: Vec<Vec<Vec<Vec<f64>>>> =
            vec![vec![vec![Vec::new(); n_values]; columns.len()]; row_order.len()];
        for (row, col_key, values) in &raw {
            let col = col_index[col_key];
            for (v, value) in values.iter().enumerate() {
                if let Some(x) = value {
                    partials[*row][col][v].push(*x);
                }
            }
        }

        let combine = |v: usize, xs: &[f64]| -> Option<f64> {
            match xs {
                [] => None,
                [single] => Some(*single),
                _ => query.aggregations[v].combine(xs.iter().copied()),
            }
        };

        let rows: Vec<PivotRow> = row_order
            .into_iter()
            .zip(partials.iter())
            .map(|(keys, per_col)| {
                let cells: Vec<Vec<Option<f64>>> = per_col
                    .iter()
                    .map(|per_val| per_val.iter().enumerate().map(|(v, xs)| combine(v, xs)).collect())
                    .collect();
                let totals = (0..n_values)
                    .map(|v| {
                        query.aggregations[v]
                            .combine(cells.iter().filter_map(|c| c[v]))
                    })
                    .collect();
                PivotRow { keys, cells, totals }
            })
            .collect();

        let column_totals: Vec<Vec<Option<f64>>> = (0..columns.len())
            .map(|c| {
                (0..n_values)
                    .map(|v| {
                        query.aggregations[v]
                            .combine(rows.iter().filter_map(|r| r.cells[c][v]))
                    })
                    .collect()
            })
            .collect();

        let grand_totals = (0..n_values)
            .map(|v| {
                query.aggregations[v].combine(
                    rows.iter()
                        .flat_map(|r| r.cells.iter().filter_map(move |c| c[v])),
                )
            })
            .collect();

        Ok(PivotTable {
            row_headers: query.row_keys.clone(),
            column_headers: query.column_keys.clone(),
            value_headers: query.value_keys.clone(),
            columns,
            rows,
            column_totals,
            grand_totals,
        })
    }
}
