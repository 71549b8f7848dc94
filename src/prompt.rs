//! Prompt construction.
//!
//! Every prompt asks for a markdown table with fixed columns so that
//! [`crate::markdown`] can read the answer back. Rated examples from
//! [`crate::feedback`] are appended to the system prompt, most relevant
//! first.

use crate::ai::ChatRequest;
use crate::models::{Feedback, MaterialRecord};

pub const SEARCH_SYSTEM_PROMPT: &str = "\
You are a materials engineering assistant for an automotive product data management (PDM) team.
Search technical datasheets, standards and manufacturer catalogues for the materials the user asks about.
Answer with a single markdown table with exactly these columns:
| Code | Description | Manufacturer | Material type | Standard | Properties | Source |
One row per distinct material. Leave a cell empty when the information is not found; never invent part codes.
After the table, add at most three sentences of remarks.";

pub const EQUIVALENCE_SYSTEM_PROMPT: &str = "\
You are a materials standards specialist.
For the given material, list equivalent designations in other standards (for example SAE/AISI, DIN/EN, JIS, ISO, ASTM, ABNT, GB).
Answer with a single markdown table with exactly these columns:
| Standard | Designation | Notes | Confidence |
Confidence is High, Medium or Low. Only list equivalences supported by published cross-reference tables.";

pub const VALIDATION_SYSTEM_PROMPT: &str = "\
You are a data quality auditor for material master data.
Check each field of the record against current public sources (manufacturer datasheets, standards bodies, distributor catalogues).
Answer with a single markdown table with exactly these columns:
| Field | Current | Verified | Status | Source |
Status is CONFIRMED when the current value is correct, DIVERGENT when sources disagree (put the correct value in Verified), or NOT FOUND when no source covers it.
Use one row per field, with the field names exactly as given.";

/// Longest example answer copied into a prompt, in characters.
const EXAMPLE_ANSWER_CHARS: usize = 1500;

fn clip(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Renders rated pairs as a prompt section; empty when there are none.
pub fn examples_section(examples: &[Feedback]) -> String {
    if examples.is_empty() {
        return String::new();
    }

    let mut out = String::from(
        "\n\nPreviously approved answers (match their format and level of detail):",
    );
    for (i, ex) in examples.iter().enumerate() {
        out.push_str(&format!(
            "\n\nExample {} (rated {}/5)\nQuestion: {}\nAnswer:\n{}",
            i + 1,
            ex.rating,
            ex.question.trim(),
            clip(ex.answer.trim(), EXAMPLE_ANSWER_CHARS)
        ));
        if let Some(comment) = ex.comment.as_deref().filter(|c| !c.trim().is_empty()) {
            out.push_str(&format!("\nReviewer note: {}", comment.trim()));
        }
    }
    out
}

fn with_examples(system: &str, examples: &[Feedback]) -> String {
    format!("{}{}", system, examples_section(examples))
}

pub fn build_search_prompt(query: &str, examples: &[Feedback]) -> ChatRequest {
    ChatRequest::new(
        with_examples(SEARCH_SYSTEM_PROMPT, examples),
        format!("Find materials matching: {}", query.trim()),
    )
}

pub fn build_equivalence_prompt(
    material: &str,
    standards: &[String],
    examples: &[Feedback],
) -> ChatRequest {
    let mut user = format!("Material: {}", material.trim());
    if !standards.is_empty() {
        user.push_str(&format!(
            "\nOnly list equivalents in these standards: {}",
            standards.join(", ")
        ));
    }
    ChatRequest::new(with_examples(EQUIVALENCE_SYSTEM_PROMPT, examples), user)
}

/// Asks the model to check `fields` of `record`.
pub fn build_validation_prompt(
    record: &MaterialRecord,
    fields: &[String],
    examples: &[Feedback],
) -> ChatRequest {
    let mut user = String::from("Validate this material record.\n\n| Field | Current |\n|---|---|");
    for field in fields {
        let value = record.field(field).unwrap_or("");
        user.push_str(&format!(
            "\n| {} | {} |",
            field,
            value.replace('|', "\\|").replace('\n', " ")
        ));
    }
    if !record.sources.is_empty() {
        user.push_str(&format!(
            "\n\nSources already on file: {}",
            record.sources.join(", ")
        ));
    }
    ChatRequest::new(with_examples(VALIDATION_SYSTEM_PROMPT, examples), user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markdown::parse_markdown_table;
    use crate::models::SearchKind;

    fn example(question: &str, rating: i64, comment: Option<&str>) -> Feedback {
        Feedback {
            id: 1,
            user_id: None,
            kind: SearchKind::Search,
            question: question.to_string(),
            answer: "| Code |\n|---|\n| 1020 |".to_string(),
            rating,
            comment: comment.map(str::to_string),
            created_at: 0,
        }
    }

    #[test]
    fn test_search_prompt_without_examples() {
        let req = build_search_prompt("  EPDM seal ", &[]);
        assert_eq!(req.system.as_deref(), Some(SEARCH_SYSTEM_PROMPT));
        assert_eq!(req.question(), "Find materials matching: EPDM seal");
    }

    #[test]
    fn test_examples_are_folded_in_order() {
        let examples = vec![
            example("SAE 1020", 5, Some("good sourcing")),
            example("SAE 1045", 4, None),
        ];
        let req = build_search_prompt("SAE 1010", &examples);
        let system = req.system.unwrap();
        let first = system.find("Example 1 (rated 5/5)\nQuestion: SAE 1020").unwrap();
        let second = system.find("Example 2 (rated 4/5)\nQuestion: SAE 1045").unwrap();
        assert!(first < second);
        assert!(system.contains("Reviewer note: good sourcing"));
    }

    #[test]
    fn test_long_example_clipped() {
        let mut ex = example("q", 5, None);
        ex.answer = "x".repeat(EXAMPLE_ANSWER_CHARS + 50);
        let section = examples_section(&[ex]);
        assert!(section.ends_with('…'));
    }

    #[test]
    fn test_validation_prompt_embeds_readable_table() {
        let record = MaterialRecord {
            code: "PN-778".to_string(),
            description: "Seal | EPDM".to_string(),
            ..Default::default()
        };
        let fields = vec!["code".to_string(), "description".to_string()];
        let req = build_validation_prompt(&record, &fields, &[]);
        let table = parse_markdown_table(req.question()).unwrap();
        assert_eq!(table.rows[0], vec!["code", "PN-778"]);
        assert_eq!(table.rows[1], vec!["description", "Seal | EPDM"]);
    }

    #[test]
    fn test_equivalence_prompt_standards() {
        let req = build_equivalence_prompt("SAE 1020", &["DIN".to_string(), "JIS".to_string()], &[]);
        assert!(req.question().contains("these standards: DIN, JIS"));
    }
}
