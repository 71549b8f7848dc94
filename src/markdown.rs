//! Markdown-table extraction from LLM answers.
//!
//! AI search providers answer in free-form markdown. Everything downstream
//! (material rows, equivalences, validation checks) expects tables, so this
//! module pulls them out of the text and cleans what is left.
//!
//! # Table grammar
//!
//! ```text
//! | Code | Description |      <- header: any line containing `|`
//! |------|:-----------:|      <- separator: only `|`, `:`, `-` and spaces
//! | 1020 | Carbon steel [2] | <- body: following lines containing `|`
//! ```
//!
//! - Outer pipes are optional; `\|` is a literal pipe inside a cell.
//! - Cells are trimmed; `**bold**`, `__bold__`, `<br>` and citation markers
//!   (`[1]`) are stripped.
//! - Short rows are padded with empty cells, long rows truncated to the
//!   header width, all-empty rows dropped.
//! - A table with a header and separator but no body has zero rows.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::OnceLock;

/// A parsed markdown table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkdownTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MarkdownTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the column whose header matches `name`, ignoring case,
    /// accents, and punctuation.
    pub fn column(&self, name: &str) -> Option<usize> {
        let wanted = normalize_header(name);
        self.headers
            .iter()
            .position(|h| normalize_header(h) == wanted)
    }

    /// Rows as `(header, value)` pairs, in column order.
    pub fn records(&self) -> Vec<Vec<(&str, &str)>> {
        self.rows
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .zip(row.iter())
                    .map(|(h, v)| (h.as_str(), v.as_str()))
                    .collect()
            })
            .collect()
    }
}

/// Result of [`process_content`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessedContent {
    /// Prose left after removing reasoning, tables, and citation markers.
    pub text: String,
    pub tables: Vec<MarkdownTable>,
    /// Citation numbers referenced in the answer, ascending and unique.
    pub citations: Vec<u32>,
    /// Content of `<think>` blocks emitted by reasoning models.
    pub reasoning: Option<String>,
}

impl ProcessedContent {
    pub fn first_table(&self) -> Option<&MarkdownTable> {
        self.tables.first()
    }
}

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("valid regex"))
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d{1,3})\]").expect("valid regex"))
}

fn citation_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]*\[\d{1,3}\]").expect("valid regex"))
}

fn br_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"))
}

fn strong_star_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*\s](?:[^*]*[^*\s])?)\*\*").expect("valid regex"))
}

fn strong_underscore_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"__([^_\s](?:[^_]*[^_\s])?)__").expect("valid regex"))
}

fn blank_runs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

/// Splits an LLM answer into prose, tables, citations, and reasoning.
///
/// An unterminated `<think>` block (truncated stream) swallows the rest of
/// the answer into `reasoning`.
pub fn process_content(raw: &str) -> ProcessedContent {
    let mut reasoning_parts: Vec<String> = Vec::new();
    let mut body = think_re()
        .replace_all(raw, |caps: &regex::Captures| {
            let inner = caps[1].trim();
            if !inner.is_empty() {
                reasoning_parts.push(inner.to_string());
            }
            ""
        })
        .into_owned();

    if let Some(start) = body.find("<think>") {
        let rest = body[start + "<think>".len()..].trim();
        if !rest.is_empty() {
            reasoning_parts.push(rest.to_string());
        }
        body.truncate(start);
    }

    let citations: BTreeSet<u32> = citation_re()
        .captures_iter(&body)
        .filter_map(|c| c[1].parse().ok())
        .collect();

    let lines: Vec<&str> = body.lines().collect();
    let found = scan_tables(&lines);

    let mut remaining: Vec<&str> = Vec::with_capacity(lines.len());
    let mut next = 0;
    for (range, _) in &found {
        remaining.extend_from_slice(&lines[next..range.start]);
        next = range.end;
    }
    remaining.extend_from_slice(&lines[next..]);

    let prose = drop_empty_fences(&remaining).join("\n");
    let prose = citation_strip_re().replace_all(&prose, "");
    let prose = blank_runs_re().replace_all(prose.trim(), "\n\n").into_owned();

    ProcessedContent {
        text: prose,
        tables: found.into_iter().map(|(_, t)| t).collect(),
        citations: citations.into_iter().collect(),
        reasoning: if reasoning_parts.is_empty() {
            None
        } else {
            Some(reasoning_parts.join("\n\n"))
        },
    }
}

/// Returns the first markdown table in `text`, if any.
pub fn parse_markdown_table(text: &str) -> Option<MarkdownTable> {
    let lines: Vec<&str> = text.lines().collect();
    scan_tables(&lines).into_iter().next().map(|(_, t)| t)
}

/// Returns every markdown table in `text`, in order of appearance.
pub fn extract_tables(text: &str) -> Vec<MarkdownTable> {
    let lines: Vec<&str> = text.lines().collect();
    scan_tables(&lines).into_iter().map(|(_, t)| t).collect()
}

/// Finds tables and the line ranges they occupy.
fn scan_tables(lines: &[&str]) -> Vec<(Range<usize>, MarkdownTable)> {
    let mut tables = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let is_header = is_row_line(lines[i])
            && !is_separator_line(lines[i])
            && i + 1 < lines.len()
            && is_separator_line(lines[i + 1]);

        if !is_header {
            i += 1;
            continue;
        }

        let headers = split_row(lines[i]);
        let width = headers.len();
        let mut rows = Vec::new();
        let mut j = i + 2;

        while j < lines.len() && is_row_line(lines[j]) {
            if !is_separator_line(lines[j]) {
                let mut cells = split_row(lines[j]);
                cells.resize(width, String::new());
                if cells.iter().any(|c| !c.is_empty()) {
                    rows.push(cells);
                }
            }
            j += 1;
        }

        tables.push((i..j, MarkdownTable { headers, rows }));
        i = j;
    }

    tables
}

fn is_row_line(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty() && t.contains('|')
}

fn is_separator_line(line: &str) -> bool {
    let t = line.trim();
    if !t.contains('|') || !t.contains('-') {
        return false;
    }
    if !t.chars().all(|c| matches!(c, '|' | ':' | '-' | ' ' | '\t')) {
        return false;
    }
    raw_cells(t).iter().all(|cell| {
        let cell = cell.trim().trim_start_matches(':').trim_end_matches(':');
        !cell.is_empty() && cell.chars().all(|c| c == '-')
    })
}

/// Splits a row on unescaped pipes, dropping the empty cells produced by
/// leading and trailing pipes. `\|` becomes a literal `|`.
fn raw_cells(line: &str) -> Vec<String> {
    let t = line.trim();
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = t.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => cells.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    cells.push(current);

    if t.starts_with('|') && !cells.is_empty() {
        cells.remove(0);
    }
    if t.ends_with('|') && !t.ends_with("\\|") {
        cells.pop();
    }
    cells
}

fn split_row(line: &str) -> Vec<String> {
    raw_cells(line).iter().map(|c| clean_cell(c)).collect()
}

fn clean_cell(cell: &str) -> String {
    let cell = br_re().replace_all(cell, " ");
    let cell = citation_strip_re().replace_all(&cell, "");
    let cell = strong_star_re().replace_all(&cell, "$1");
    // `__init__`-style identifiers are data, not emphasis
    let cell = strong_underscore_re().replace_all(&cell, |caps: &regex::Captures| {
        let inner = &caps[1];
        if inner.chars().all(|c| c.is_ascii_alphanumeric()) {
            caps[0].to_string()
        } else {
            inner.to_string()
        }
    });
    cell.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

/// Removes code fences left empty once their table has been extracted.
fn drop_empty_fences<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mut keep = vec![true; lines.len()];
    let mut i = 0;
    while i < lines.len() {
        if is_fence(lines[i]) {
            if let Some(offset) = lines[i + 1..].iter().position(|l| is_fence(l)) {
                let close = i + 1 + offset;
                if lines[i + 1..close].iter().all(|l| l.trim().is_empty()) {
                    for k in keep.iter_mut().take(close + 1).skip(i) {
                        *k = false;
                    }
                }
                i = close + 1;
                continue;
            }
        }
        i += 1;
    }
    lines
        .iter()
        .zip(keep)
        .filter_map(|(l, k)| k.then_some(*l))
        .collect()
}

/// Canonical form of a column header: lowercase ASCII with common Latin
/// accents folded and runs of other characters collapsed to `_`.
///
/// `"Descrição do Material"` becomes `"descricao_do_material"`.
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut pending_sep = false;

    for c in header.chars().flat_map(char::to_lowercase) {
        let folded = fold_accent(c);
        if folded.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(folded);
        } else {
            pending_sep = true;
        }
    }
    out
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "\
<think>The user wants SAE 1020 data. Search steel databases.</think>
Here is what I found about the material [1].

| Código | Descrição | Norma |
|--------|:---------:|------:|
| 1020 | **Aço carbono** laminado [2] | SAE J403 [1][3] |
| 1045 | Aço médio carbono |

Sources are listed below [4].";

    #[test]
    fn test_process_content_splits_everything() {
        let processed = process_content(ANSWER);

        assert_eq!(
            processed.reasoning.as_deref(),
            Some("The user wants SAE 1020 data. Search steel databases.")
        );
        assert_eq!(processed.citations, vec![1, 2, 3, 4]);
        assert_eq!(processed.tables.len(), 1);

        let table = &processed.tables[0];
        assert_eq!(table.headers, vec!["Código", "Descrição", "Norma"]);
        assert_eq!(
            table.rows[0],
            vec!["1020", "Aço carbono laminado", "SAE J403"]
        );
        // Short row padded
        assert_eq!(table.rows[1], vec!["1045", "Aço médio carbono", ""]);

        assert_eq!(
            processed.text,
            "Here is what I found about the material.\n\nSources are listed below."
        );
    }

    #[test]
    fn test_no_table_returns_none() {
        assert!(parse_markdown_table("just prose | with a pipe").is_none());
        assert!(parse_markdown_table("").is_none());
    }

    #[test]
    fn test_horizontal_rule_is_not_separator() {
        let text = "Title\n---\nmore text";
        assert!(parse_markdown_table(text).is_none());
    }

    #[test]
    fn test_table_without_outer_pipes() {
        let text = "a | b\n--|--\n1 | 2\n3 | 4";
        let table = parse_markdown_table(text).unwrap();
        assert_eq!(table.headers, vec!["a", "b"]);
        assert_eq!(table.rows, vec![vec!["1", "2"], vec!["3", "4"]]);
    }

    #[test]
    fn test_escaped_pipe_and_long_rows() {
        let text = "| Name | Value |\n|---|---|\n| a \\| b | 1 | extra |";
        let table = parse_markdown_table(text).unwrap();
        assert_eq!(table.rows, vec![vec!["a | b", "1"]]);
    }

    #[test]
    fn test_separator_width_differs_from_header() {
        let text = "Rows follow.\n\n| A | B | C |\n|---|---|\n| 1 | 2 |\n| 3 | 4 | 5 | 6 |\n\nDone.";
        let processed = process_content(text);
        assert_eq!(processed.tables.len(), 1);
        let table = &processed.tables[0];
        assert_eq!(table.headers, vec!["A", "B", "C"]);
        assert_eq!(table.rows, vec![vec!["1", "2", ""], vec!["3", "4", "5"]]);
        assert_eq!(processed.text, "Rows follow.\n\nDone.");

        let wide = parse_markdown_table("| A | B |\n|---|---|---|\n| 1 | 2 |").unwrap();
        assert_eq!(wide.rows, vec![vec!["1", "2"]]);
    }

    #[test]
    fn test_strong_markers_only_stripped_in_pairs() {
        let text = "| Name | Note |\n|---|---|\n| **Aço 1020** | __hot rolled__ |\n| __init__ | A__B |\n| 2 ** 3 | **bold** and **more** |";
        let table = parse_markdown_table(text).unwrap();
        assert_eq!(table.rows[0], vec!["Aço 1020", "hot rolled"]);
        assert_eq!(table.rows[1], vec!["__init__", "A__B"]);
        assert_eq!(table.rows[2], vec!["2 ** 3", "bold and more"]);
    }

    #[test]
    fn test_header_only_table_has_no_rows() {
        let table = parse_markdown_table("| A | B |\n|---|---|\n\nafter").unwrap();
        assert_eq!(table.headers, vec!["A", "B"]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_empty_rows_dropped_and_br_flattened() {
        let text = "| A | B |\n|---|---|\n|  |  |\n| x<br>y | z |";
        let table = parse_markdown_table(text).unwrap();
        assert_eq!(table.rows, vec![vec!["x y", "z"]]);
    }

    #[test]
    fn test_multiple_tables_in_fences() {
        let text = "Intro\n```markdown\n| A |\n|---|\n| 1 |\n```\nMiddle\n\n| B | C |\n| - | - |\n| 2 | 3 |\n";
        let processed = process_content(text);
        assert_eq!(processed.tables.len(), 2);
        assert_eq!(processed.tables[0].rows, vec![vec!["1"]]);
        assert_eq!(processed.tables[1].headers, vec!["B", "C"]);
        assert_eq!(processed.text, "Intro\nMiddle");
    }

    #[test]
    fn test_unterminated_think_block() {
        let processed = process_content("Answer start <think>still reasoning");
        assert_eq!(processed.text, "Answer start");
        assert_eq!(processed.reasoning.as_deref(), Some("still reasoning"));
    }

    #[test]
    fn test_column_lookup_ignores_accents() {
        let table = parse_markdown_table("| Código | Descrição |\n|---|---|\n| 1 | x |").unwrap();
        assert_eq!(table.column("codigo"), Some(0));
        assert_eq!(table.column("DESCRICAO"), Some(1));
        assert_eq!(table.column("norma"), None);
        let records = table.records();
        assert_eq!(records[0], vec![("Código", "1"), ("Descrição", "x")]);
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("Descrição do Material"), "descricao_do_material");
        assert_eq!(normalize_header("  N° Peça "), "n_peca");
        assert_eq!(normalize_header("Material-Type"), "material_type");
    }
}
