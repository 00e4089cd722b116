//! Shared utility functions for the Conveyor crate.

use std::sync::OnceLock;

use regex::Regex;

/// Extract the outermost JSON object from LLM text that wraps it in
/// prose ("Here is the JSON: {...} hope that helps"). Brace-counting,
/// string-aware so braces inside string values do not end the object.
/// Returns the borrowed slice; `None` when no balanced object exists.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
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
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn plus_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""\s*:\s*\+(\d)"#).unwrap())
}

fn plus_array_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\s*\+(\d)").unwrap())
}

fn plus_array_cont_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*\+(\d)").unwrap())
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap())
}

/// Parse JSON from LLM response text, tolerating the usual damage.
///
/// Models wrap JSON in markdown code fences, surround it with prose, and
/// produce minor lints like `+`-prefixed numbers or trailing commas. This
/// strips the fences, repairs those lints, and parses; when the repaired
/// text still fails wholesale, the outermost object is brace-extracted
/// via [`extract_json_object`] and parsed alone. Returns `None` if no
/// JSON can be recovered.
pub fn parse_json_response(response_text: &str) -> Option<serde_json::Value> {
    if response_text.is_empty() {
        return None;
    }

    let mut text = response_text.trim().to_string();

    // Extract JSON from markdown code fences
    if let Some(fence) = text.find("```json") {
        let start = fence + 7;
        if let Some(end) = text[start..].find("```") {
            text = text[start..start + end].trim().to_string();
        }
    } else if let Some(fence) = text.find("```") {
        let start = fence + 3;
        if let Some(end) = text[start..].find("```") {
            text = text[start..start + end].trim().to_string();
        }
    }

    // Repair `+`-prefixed numbers: object values, array starts, array continuations
    let text = plus_value_re().replace_all(&text, "\": $1");
    let text = plus_array_start_re().replace_all(&text, "[$1");
    let text = plus_array_cont_re().replace_all(&text, ", $1");

    // Remove trailing commas before } or ]
    let text = trailing_comma_re().replace_all(&text, "$1");

    if let Ok(value) = serde_json::from_str(&text) {
        return Some(value);
    }

    // the object may be embedded in surrounding prose
    let object = extract_json_object(&text)?;
    serde_json::from_str(object).ok()
}

/// Format seconds as a human-readable duration (e.g., "2h 15m 30s").
pub fn format_elapsed_time(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}

/// Parse a duration argument like "45s", "30m", "2h", or a bare second count.
pub fn parse_duration_arg(text: &str) -> Option<std::time::Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (digits, unit) = match text.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => (&text[..i], &text[i..]),
        None => (text, ""),
    };
    let value: u64 = digits.parse().ok()?;
    let secs = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return None,
    };
    Some(std::time::Duration::from_secs(secs))
}

/// Stable 64-bit FNV-1a hash, used to derive per-unit RNG streams from the
/// run seed so expression results do not depend on chunk partitioning.
pub fn stable_hash(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#));
    }

    #[test]
    fn test_extract_json_object_surrounded_by_prose() {
        let text = r#"Here is the JSON: {"key": "value"} hope that helps"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"outer": {"inner": "value"}}"#));
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"note {"dialog": "use {braces} wisely\" ok"} done"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"dialog": "use {braces} wisely\" ok"}"#)
        );
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("no braces at all"), None);
    }

    #[test]
    fn test_parse_json_response_plain() {
        let parsed = parse_json_response(r#"{"score": 4}"#).unwrap();
        assert_eq!(parsed["score"], 4);
    }

    #[test]
    fn test_parse_json_response_code_fence() {
        let text = "Here you go:\n```json\n{\"score\": 4}\n```\nDone.";
        let parsed = parse_json_response(text).unwrap();
        assert_eq!(parsed["score"], 4);
    }

    #[test]
    fn test_parse_json_response_bare_fence() {
        let text = "```\n{\"ok\": true}\n```";
        let parsed = parse_json_response(text).unwrap();
        assert_eq!(parsed["ok"], true);
    }

    #[test]
    fn test_parse_json_response_plus_prefixed_numbers() {
        let parsed = parse_json_response(r#"{"delta": +4, "list": [+1, +2]}"#).unwrap();
        assert_eq!(parsed["delta"], 4);
        assert_eq!(parsed["list"][0], 1);
        assert_eq!(parsed["list"][1], 2);
    }

    #[test]
    fn test_parse_json_response_trailing_commas() {
        let parsed = parse_json_response(r#"{"a": 1, "b": [1, 2,],}"#).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"][1], 2);
    }

    #[test]
    fn test_parse_json_response_object_in_prose() {
        let text = "Sure! The result is {\"score\": 4} — let me know if that works.";
        let parsed = parse_json_response(text).unwrap();
        assert_eq!(parsed["score"], 4);
    }

    #[test]
    fn test_parse_json_response_garbage() {
        assert!(parse_json_response("not json at all").is_none());
        assert!(parse_json_response("prose with a dangling { brace").is_none());
        assert!(parse_json_response("").is_none());
    }

    #[test]
    fn test_format_elapsed_time() {
        assert_eq!(format_elapsed_time(45), "45s");
        assert_eq!(format_elapsed_time(135), "2m 15s");
        assert_eq!(format_elapsed_time(8130), "2h 15m 30s");
    }

    #[test]
    fn test_parse_duration_arg() {
        assert_eq!(parse_duration_arg("30m").unwrap().as_secs(), 1800);
        assert_eq!(parse_duration_arg("45").unwrap().as_secs(), 45);
        assert_eq!(parse_duration_arg("2h").unwrap().as_secs(), 7200);
        assert!(parse_duration_arg("abc").is_none());
    }

    #[test]
    fn test_stable_hash_is_stable() {
        assert_eq!(stable_hash("unit_001"), stable_hash("unit_001"));
        assert_ne!(stable_hash("unit_001"), stable_hash("unit_002"));
    }
}
