//! Server-rendered HTML pages.
//!
//! Plain `format!` templates; every user- or model-supplied string goes
//! through [`escape_html`] before it is interpolated.

use chrono::{TimeZone, Utc};

use crate::feedback::FeedbackStats;
use crate::materials::{EquivalenceOutcome, SearchOutcome};
use crate::models::{Feedback, MaterialRecord, User};
use crate::pivot::{PivotSchema, PivotTable};

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

const STYLE: &str = r#"
        body {
            font-family: system-ui, -apple-system, sans-serif;
            max-width: 1100px;
            margin: 30px auto;
            padding: 0 20px;
            line-height: 1.5;
            color: #222;
        }
        nav {
            display: flex;
            gap: 16px;
            align-items: center;
            border-bottom: 2px solid #0066cc;
            padding-bottom: 10px;
            margin-bottom: 20px;
        }
        nav .spacer { flex: 1; }
        nav form { display: inline; }
        table { border-collapse: collapse; width: 100%; margin: 12px 0; }
        th, td { border: 1px solid #ccc; padding: 4px 8px; text-align: left; vertical-align: top; }
        th { background: #f0f4fa; }
        td.num { text-align: right; font-variant-numeric: tabular-nums; }
        tr.total td { font-weight: 600; background: #fafafa; }
        .error { color: #a00; background: #fee; padding: 8px; border-radius: 4px; }
        .muted { color: #777; font-size: 0.9em; }
        input[type=text], input[type=email], input[type=password], textarea { padding: 6px; width: 320px; }
        button { padding: 6px 14px; background: #0066cc; color: white; border: 0; border-radius: 4px; }
"#;

/// Wraps `body` in the page chrome. The navigation bar is shown when a
/// user is logged in.
pub fn layout(title: &str, user: Option<&User>, body: &str) -> String {
    let nav = match user {
        Some(u) => format!(
            r#"<nav>
        <strong>PDM Assist</strong>
        <a href="/">Search</a>
        <a href="/equivalents">Equivalents</a>
        <a href="/reports">Reports</a>
        <a href="/feedback">Feedback</a>
        <span class="spacer"></span>
        <span class="muted">{}</span>
        <form method="post" action="/logout"><button type="submit">Log out</button></form>
    </nav>"#,
            escape_html(&u.email)
        ),
        None => "<nav><strong>PDM Assist</strong></nav>".to_string(),
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title} - PDM Assist</title>
    <style>{style}</style>
</head>
<body>
    {nav}
    <h1>{title}</h1>
    {body}
</body>
</html>"#,
        title = escape_html(title),
        style = STYLE,
        nav = nav,
        body = body
    )
}

fn error_box(error: Option<&str>) -> String {
    error
        .map(|e| format!(r#"<p class="error">{}</p>"#, escape_html(e)))
        .unwrap_or_default()
}

pub fn login_page(error: Option<&str>, email: &str) -> String {
    let body = format!(
        r#"{error}
    <form method="post" action="/login">
        <p><label>Email<br><input type="email" name="email" value="{email}" required autofocus></label></p>
        <p><label>Password<br><input type="password" name="password" required></label></p>
        <p><button type="submit">Log in</button></p>
    </form>"#,
        error = error_box(error),
        email = escape_html(email)
    );
    layout("Log in", None, &body)
}

fn format_number(value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => format!("{:.2}", v),
    }
}

fn source_links(sources: &[String]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, url)| {
            if url.starts_with("http://") || url.starts_with("https://") {
                format!(
                    r#"<a href="{}" target="_blank" rel="noopener">[{}]</a>"#,
                    escape_html(url),
                    i + 1
                )
            } else {
                escape_html(url)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn records_table(records: &[MaterialRecord]) -> String {
    if records.is_empty() {
        return r#"<p class="muted">No materials found.</p>"#.to_string();
    }

    let mut html = String::from(
        "<table>\n<tr><th>Code</th><th>Description</th><th>Manufacturer</th><th>Type</th><th>Standard</th><th>Properties</th><th>Other</th><th>Sources</th></tr>\n",
    );
    for r in records {
        let other = r
            .attributes
            .iter()
            .map(|(k, v)| format!("{}: {}", escape_html(k), escape_html(v)))
            .collect::<Vec<_>>()
            .join("<br>");
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&r.code),
            escape_html(&r.description),
            escape_html(&r.manufacturer),
            escape_html(&r.material_type),
            escape_html(&r.standard),
            escape_html(&r.properties),
            other,
            source_links(&r.sources)
        ));
    }
    html.push_str("</table>");
    html
}

fn citations_list(citations: &[String]) -> String {
    if citations.is_empty() {
        return String::new();
    }
    let items: String = citations
        .iter()
        .enumerate()
        .map(|(i, url)| {
            format!(
                r#"<li value="{}"><a href="{url}" target="_blank" rel="noopener">{url}</a></li>"#,
                i + 1,
                url = escape_html(url)
            )
        })
        .collect();
    format!("<h3>Sources</h3>\n<ol>{}</ol>", items)
}

fn paragraphs(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>")))
        .collect()
}

/// Rating form posted to `/feedback`.
fn rating_form(kind: &str, question: &str, answer: &str, back: &str) -> String {
    let options: String = (1..=5)
        .rev()
        .map(|r| format!(r#"<option value="{r}">{r}</option>"#))
        .collect();
    format!(
        r#"<form method="post" action="/feedback">
        <input type="hidden" name="kind" value="{kind}">
        <input type="hidden" name="question" value="{question}">
        <input type="hidden" name="answer" value="{answer}">
        <input type="hidden" name="back" value="{back}">
        <label>Rate this answer <select name="rating">{options}</select></label>
        <input type="text" name="comment" placeholder="Comment (optional)">
        <button type="submit">Send</button>
    </form>"#,
        kind = escape_html(kind),
        question = escape_html(question),
        answer = escape_html(answer),
        back = escape_html(back),
        options = options
    )
}

pub fn search_page(
    user: &User,
    query: &str,
    outcome: Option<&SearchOutcome>,
    error: Option<&str>,
) -> String {
    let mut body = format!(
        r#"<form method="post" action="/search">
        <input type="text" name="q" value="{}" placeholder="Material, code, standard…" required autofocus>
        <button type="submit">Search</button>
    </form>
    {}"#,
        escape_html(query),
        error_box(error)
    );

    if let Some(outcome) = outcome {
        body.push_str(&format!(
            r#"<p class="muted">{} result(s) via {}</p>"#,
            outcome.records.len(),
            escape_html(&outcome.source)
        ));
        body.push_str(&records_table(&outcome.records));
        body.push_str(&paragraphs(&outcome.summary));
        body.push_str(&citations_list(&outcome.citations));
        body.push_str(&rating_form("search", &outcome.query, &outcome.raw, "/"));
    }

    layout("Material search", Some(user), &body)
}

pub fn equivalence_table(outcome: &EquivalenceOutcome) -> String {
    if outcome.equivalents.is_empty() {
        return r#"<p class="muted">No equivalents found.</p>"#.to_string();
    }
    let mut html = String::from(
        "<table>\n<tr><th>Standard</th><th>Designation</th><th>Notes</th><th>Confidence</th></tr>\n",
    );
    for eq in &outcome.equivalents {
        let confidence = eq
            .confidence
            .map(|c| format!("{:.0}%", c * 100.0))
            .unwrap_or_default();
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"num\">{}</td></tr>\n",
            escape_html(&eq.standard),
            escape_html(&eq.designation),
            escape_html(&eq.notes),
            confidence
        ));
    }
    html.push_str("</table>");
    html
}

pub fn equivalents_page(
    user: &User,
    material: &str,
    outcome: Option<&EquivalenceOutcome>,
    error: Option<&str>,
) -> String {
    let mut body = format!(
        r#"<form method="get" action="/equivalents">
        <input type="text" name="q" value="{}" placeholder="e.g. SAE 1020" required autofocus>
        <input type="text" name="standards" placeholder="Standards (optional, comma separated)">
        <button type="submit">Find equivalents</button>
    </form>
    {}"#,
        escape_html(material),
        error_box(error)
    );

    if let Some(outcome) = outcome {
        body.push_str(&equivalence_table(outcome));
        body.push_str(&paragraphs(&outcome.summary));
        body.push_str(&citations_list(&outcome.citations));
        body.push_str(&rating_form(
            "equivalence",
            &outcome.material,
            &outcome.raw,
            "/equivalents",
        ));
    }

    layout("Equivalent materials", Some(user), &body)
}

/// Renders an assembled pivot grid with row, column, and grand totals.
pub fn pivot_table(table: &PivotTable) -> String {
    if table.rows.is_empty() {
        return r#"<p class="muted">The report returned no rows.</p>"#.to_string();
    }

    let n_rows = table.row_headers.len().max(1);
    let n_values = table.value_headers.len();
    let has_columns = !table.column_headers.is_empty();
    let mut html = String::from("<table>\n");

    // Column-key header row
    if has_columns {
        html.push_str(&format!(r#"<tr><th colspan="{}"></th>"#, n_rows));
        for col in &table.columns {
            html.push_str(&format!(
                r#"<th colspan="{}">{}</th>"#,
                n_values,
                escape_html(&col.join(" / "))
            ));
        }
        html.push_str(&format!(r#"<th colspan="{}">Total</th></tr>"#, n_values));
        html.push('\n');
    }

    html.push_str("<tr>");
    if table.row_headers.is_empty() {
        html.push_str("<th></th>");
    }
    for h in &table.row_headers {
        html.push_str(&format!("<th>{}</th>", escape_html(h)));
    }
    let spans = table.columns.len() + usize::from(has_columns);
    for _ in 0..spans {
        for v in &table.value_headers {
            html.push_str(&format!("<th>{}</th>", escape_html(v)));
        }
    }
    html.push_str("</tr>\n");

    for row in &table.rows {
        html.push_str("<tr>");
        if row.keys.is_empty() {
            html.push_str("<td></td>");
        }
        for key in &row.keys {
            html.push_str(&format!("<td>{}</td>", escape_html(key)));
        }
        for cells in &row.cells {
            for cell in cells {
                html.push_str(&format!(r#"<td class="num">{}</td>"#, format_number(*cell)));
            }
        }
        if has_columns {
            for total in &row.totals {
                html.push_str(&format!(r#"<td class="num">{}</td>"#, format_number(*total)));
            }
        }
        html.push_str("</tr>\n");
    }

    html.push_str(&format!(r#"<tr class="total"><td colspan="{}">Total</td>"#, n_rows));
    for totals in &table.column_totals {
        for total in totals {
            html.push_str(&format!(r#"<td class="num">{}</td>"#, format_number(*total)));
        }
    }
    if has_columns {
        for total in &table.grand_totals {
            html.push_str(&format!(r#"<td class="num">{}</td>"#, format_number(*total)));
        }
    }
    html.push_str("</tr>\n</table>");
    html
}

/// Values of the report form, echoed back into its inputs.
#[derive(Debug, Clone, Default)]
pub struct ReportForm {
    pub rows: String,
    pub columns: String,
    pub values: String,
    pub limit: String,
}

pub fn reports_page(
    user: &User,
    schema: &PivotSchema,
    form: &ReportForm,
    result: Option<(&str, &PivotTable)>,
    error: Option<&str>,
) -> String {
    if !schema.is_configured() {
        let body = r#"<p class="muted">Reporting is not configured. Set <code>[reports]</code> table, dimensions and measures in the configuration file.</p>"#;
        return layout("Reports", Some(user), body);
    }

    let mut body = format!(
        r#"<p class="muted">Table <code>{table}</code>. Dimensions: {dims}. Measures: {measures}.
    Append <code>:year</code>, <code>:quarter</code>, <code>:month</code>, <code>:week</code> or <code>:day</code> to a date dimension.
    Values are <code>aggregation:field</code> (sum, avg, count, count_distinct, min, max).</p>
    <form method="get" action="/reports">
        <p><label>Rows<br><input type="text" name="rows" value="{rows}" placeholder="plant, created_at:month"></label></p>
        <p><label>Columns<br><input type="text" name="columns" value="{columns}" placeholder="material_type"></label></p>
        <p><label>Values<br><input type="text" name="values" value="{values}" placeholder="sum:quantity, count:*"></label></p>
        <p><label>Limit<br><input type="text" name="limit" value="{limit}" placeholder="{max_limit}"></label></p>
        <p><button type="submit">Run report</button></p>
    </form>
    {error}"#,
        table = escape_html(&schema.table),
        dims = escape_html(&schema.dimensions.join(", ")),
        measures = escape_html(&schema.measures.join(", ")),
        rows = escape_html(&form.rows),
        columns = escape_html(&form.columns),
        values = escape_html(&form.values),
        limit = escape_html(&form.limit),
        max_limit = schema.max_limit,
        error = error_box(error)
    );

    if let Some((sql, table)) = result {
        body.push_str(&pivot_table(table));
        body.push_str(&format!(
            "<details><summary>SQL</summary><pre>{}</pre></details>",
            escape_html(sql)
        ));
    }

    layout("Reports", Some(user), &body)
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

pub fn feedback_page(user: &User, items: &[Feedback], stats: &FeedbackStats) -> String {
    let average = stats
        .average
        .map(|a| format!("{:.2}", a))
        .unwrap_or_else(|| "n/a".to_string());
    let histogram: String = stats
        .histogram
        .iter()
        .map(|n| format!("<td class=\"num\">{}</td>", n))
        .collect();

    let mut body = format!(
        r#"<p>{count} rating(s), average {average}.</p>
    <table><tr><th>1</th><th>2</th><th>3</th><th>4</th><th>5</th></tr><tr>{histogram}</tr></table>"#,
        count = stats.count,
        average = average,
        histogram = histogram
    );

    if items.is_empty() {
        body.push_str(r#"<p class="muted">No feedback yet.</p>"#);
    } else {
        body.push_str(
            "<table>\n<tr><th>When</th><th>Kind</th><th>Question</th><th>Rating</th><th>Comment</th></tr>\n",
        );
        for f in items {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"num\">{}</td><td>{}</td></tr>\n",
                format_timestamp(f.created_at),
                f.kind.as_str(),
                escape_html(&f.question),
                f.rating,
                escape_html(f.comment.as_deref().unwrap_or(""))
            ));
        }
        body.push_str("</table>");
    }

    layout("Feedback", Some(user), &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pivot::PivotRow;

    fn user() -> User {
        User {
            id: "u1".to_string(),
            email: "ana@example.com".to_string(),
            name: "Ana".to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_login_page_escapes_error_and_email() {
        let html = login_page(Some("invalid email or password"), "a\"b@x.com");
        assert!(html.contains(r#"<p class="error">invalid email or password</p>"#));
        assert!(html.contains(r#"value="a&quot;b@x.com""#));
        assert!(!html.contains("Log out"));
    }

    #[test]
    fn test_records_table_escapes_model_output() {
        let record = MaterialRecord {
            code: "<script>".to_string(),
            description: "Steel".to_string(),
            sources: vec!["https://example.com/a".to_string(), "catalogue".to_string()],
            ..Default::default()
        };
        let html = records_table(&[record]);
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains(r#"href="https://example.com/a""#));
        assert!(html.contains("catalogue"));
    }

    #[test]
    fn test_pivot_table_renders_totals() {
        let table = PivotTable {
            row_headers: vec!["plant".to_string()],
            column_headers: vec!["type".to_string()],
            value_headers: vec!["sum_qty".to_string()],
            columns: vec![vec!["A".to_string()], vec!["B".to_string()]],
            rows: vec![PivotRow {
                keys: vec!["P1".to_string()],
                cells: vec![vec![Some(2.0)], vec![Some(1.5)]],
                totals: vec![Some(3.5)],
            }],
            column_totals: vec![vec![Some(2.0)], vec![Some(1.5)]],
            grand_totals: vec![Some(3.5)],
        };
        let html = pivot_table(&table);
        assert!(html.contains(r#"<th colspan="1">A</th>"#));
        assert!(html.contains(r#"<td class="num">2</td>"#));
        assert!(html.contains(r#"<td class="num">1.50</td>"#));
        assert!(html.contains(r#"<tr class="total"><td colspan="1">Total</td>"#));
    }

    #[test]
    fn test_feedback_page_stats() {
        let stats = FeedbackStats {
            count: 2,
            average: Some(4.5),
            histogram: [0, 0, 0, 1, 1],
        };
        let html = feedback_page(&user(), &[], &stats);
        assert!(html.contains("2 rating(s), average 4.50."));
        assert!(html.contains("No feedback yet."));
        assert!(html.contains("ana@example.com"));
    }
}
