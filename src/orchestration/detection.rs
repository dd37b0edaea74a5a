//! Question detection for final agent output.
//!
//! A headless agent session ends with a final message. When that message
//! ends by asking the operator something instead of reporting work, the
//! session is treated as a forwarded question rather than a success.
//!
//! Only the closing paragraph is inspected: agents routinely quote
//! questions from the code or their own reasoning earlier in the output.

use regex::Regex;
use std::sync::LazyLock;

/// Numbered or lettered options at the start of a line.
static OPTION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[1-9]|[a-hA-H])[.)]\s+\S").unwrap());

/// Phrases that address the operator directly (matched lowercase).
const QUESTION_PHRASES: &[&str] = &[
    "do you want",
    "would you like",
    "should i",
    "shall i",
    "please confirm",
    "please choose",
    "please select",
    "which option",
    "which approach",
    "let me know",
    "want me to",
    "like me to",
    "how should i",
];

/// Explicit input prompts.
const INPUT_PROMPTS: &[&str] = &["(y/n)", "[y/n]", "(yes/no)", "[yes/no]"];

/// The last paragraph of `text`, trimmed. Empty when `text` is blank.
fn closing_paragraph(text: &str) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let mut start = lines.len();
    while start > 0 && !lines[start - 1].trim().is_empty() {
        start -= 1;
    }
    let mut paragraph: Vec<&str> = lines[start..].to_vec();

    // An option list is usually preceded by its prompt in the paragraph above.
    let all_options = !paragraph.is_empty() && paragraph.iter().all(|l| OPTION_LINE_RE.is_match(l));
    if all_options && start > 0 {
        let mut prompt_start = start - 1;
        while prompt_start > 0 && lines[prompt_start].trim().is_empty() {
            prompt_start -= 1;
        }
        let mut head = prompt_start;
        while head > 0 && !lines[head - 1].trim().is_empty() {
            head -= 1;
        }
        let mut combined: Vec<&str> = lines[head..=prompt_start].to_vec();
        combined.append(&mut paragraph);
        paragraph = combined;
    }
    paragraph.join("\n").trim().to_string()
}

/// True when the closing paragraph asks the operator for something.
pub fn ends_with_question(text: &str) -> bool {
    let paragraph = closing_paragraph(text);
    if paragraph.is_empty() {
        return false;
    }
    let lower = paragraph.to_lowercase();
    let last_line = paragraph.lines().last().unwrap_or("").trim_end();

    if last_line.ends_with('?') {
        return true;
    }
    if INPUT_PROMPTS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    let has_options = paragraph.lines().filter(|l| OPTION_LINE_RE.is_match(l)).count() >= 2;
    let has_phrase = QUESTION_PHRASES.iter().any(|p| lower.contains(p));
    has_phrase && (has_options || lower.contains('?') || lower.contains("let me know"))
}

/// The question to forward, if the output ends with one.
pub fn extract_question(text: &str) -> Option<String> {
    if ends_with_question(text) {
        Some(closing_paragraph(text))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_question() {
        assert!(ends_with_question("I looked at the schema.\n\nWhich database should we use?"));
    }

    #[test]
    fn test_completion_report_is_not_question() {
        assert!(!ends_with_question(
            "Implemented the parser.\nAll tests pass.\n\nUpdated GOAL.md status to ACTIVE."
        ));
    }

    #[test]
    fn test_earlier_question_is_ignored() {
        let text = "The TODO asked: why is this slow?\n\nI fixed it by caching the lookup.";
        assert!(!ends_with_question(text));
    }

    #[test]
    fn test_option_list_with_prompt() {
        let text = "Done analysing.\n\nWhich approach should I take?\n\n1. Rewrite the module\n2. Patch in place";
        let question = extract_question(text).unwrap();
        assert!(question.starts_with("Which approach"));
        assert!(question.contains("2. Patch in place"));
    }

    #[test]
    fn test_let_me_know_phrase() {
        assert!(ends_with_question(
            "Two options exist. Let me know if you would like me to keep the old API."
        ));
    }

    #[test]
    fn test_input_prompt() {
        assert!(ends_with_question("Overwrite the migration? (y/n)"));
    }

    #[test]
    fn test_empty_output() {
        assert!(!ends_with_question("   \n"));
        assert_eq!(extract_question(""), None);
    }

    #[test]
    fn test_extract_returns_closing_paragraph_only() {
        let text = "Context line one.\nContext line two.\n\nShould I also update the docs?";
        assert_eq!(
            extract_question(text),
            Some("Should I also update the docs?".to_string())
        );
    }
}
