//! Helpers for pulling code and answers out of model-written text.

use std::sync::OnceLock;

use regex::Regex;

fn code_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:repl|python)[ \t]*\r?\n(.*?)\r?\n```").ok())
        .as_ref()
}

fn final_answer_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)FINAL\((.*?)\)").ok()).as_ref()
}

/// Extracts the bodies of ```` ```repl ```` and ```` ```python ```` fenced blocks, in order.
pub fn find_code_blocks(text: &str) -> Vec<String> {
    let Some(re) = code_block_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Returns the trimmed argument of the first `FINAL(...)` marker.
///
/// `FINAL_VAR(...)` is not matched; variables are resolved by the service.
pub fn check_for_final_answer(text: &str) -> Option<String> {
    final_answer_regex()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Truncates to `max_chars` characters, noting how many were dropped.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let cut = output
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(output.len());
    format!(
        "{}\n... [truncated, {} chars omitted]",
        &output[..cut],
        total - max_chars
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_repl_and_python_blocks() {
        let text = "Let me look.\n```repl\nx = 1\nprint(x)\n```\nthen\n```python\ny = 2\n```\n```rust\nfn main() {}\n```";
        assert_eq!(
            find_code_blocks(text),
            vec!["x = 1\nprint(x)".to_string(), "y = 2".to_string()]
        );
        assert!(find_code_blocks("no code here").is_empty());
    }

    #[test]
    fn final_answer_marker() {
        assert_eq!(
            check_for_final_answer("done. FINAL( 42 )").as_deref(),
            Some("42")
        );
        assert_eq!(
            check_for_final_answer("FINAL(multi\nline)").as_deref(),
            Some("multi\nline")
        );
        assert_eq!(check_for_final_answer("FINAL_VAR(result)"), None);
        assert_eq!(check_for_final_answer("nothing yet"), None);
    }

    #[test]
    fn truncation_reports_omitted_chars() {
        assert_eq!(truncate_output("short", 10), "short");
        assert_eq!(
            truncate_output("abcdefghij", 4),
            "abcd\n... [truncated, 6 chars omitted]"
        );
        assert_eq!(
            truncate_output("ééééé", 2),
            "éé\n... [truncated, 3 chars omitted]"
        );
    }
}
