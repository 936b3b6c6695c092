//! Shared helpers for the Sparlo crate.

/// Extract the outermost JSON object from model output that may wrap it in
/// prose or a fenced code block. Brace counting is string-aware so braces
/// inside JSON string values do not unbalance the scan.
pub fn extract_json_object(text: &str) -> Option<String> {
    let body = strip_code_fence(text);
    let start = body.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = start;

    for (i, ch) in body[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(body[start..end].to_string())
    } else {
        None
    }
}

/// Drop markdown code fences if the text is fenced, returning the inner body.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip the language tag on the opening fence line.
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        if let Some(inner) = body.rsplit_once("```") {
            return inner.0;
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_with_prose() {
        let text = r#"Here is the result: {"key": "value"} as requested."#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_fenced() {
        let text = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_brace_inside_string() {
        let text = r#"{"headline": "use {placeholders} carefully"}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

}
