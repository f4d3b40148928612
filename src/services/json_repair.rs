//! Robust recovery of JSON objects from LLM responses.
//!
//! Models wrap JSON in code fences, prepend prose, leave trailing commas or
//! sneak control characters into strings. Recovery runs a four-strategy
//! chain - fence stripping, direct parse, brace-balanced substring
//! extraction, minor-error repair - driven by an explicit discriminated
//! result instead of exceptions. Total failure yields `None`; the caller
//! decides what an empty result means.

use regex::Regex;
use serde_json::Value;

/// Outcome of one parse attempt in the recovery chain.
#[derive(Debug, Clone)]
pub enum JsonRecovery {
    /// Valid JSON.
    Parsed(Value),
    /// Not valid yet, but there is a candidate worth repairing.
    NeedsRepair(String),
    /// Nothing that could become JSON.
    Unrecoverable,
}

/// Classify a candidate string: parsed, repairable, or hopeless.
pub fn classify(candidate: &str) -> JsonRecovery {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => JsonRecovery::Parsed(value),
        Err(_) if candidate.contains('{') => JsonRecovery::NeedsRepair(candidate.to_string()),
        Err(_) => JsonRecovery::Unrecoverable,
    }
}

/// Recover a JSON value from a raw model response. Returns `None` when all
/// four strategies fail.
pub fn recover_json(raw: &str) -> Option<Value> {
    // Strategy 1: strip markdown code fences
    let cleaned = strip_code_fences(raw);

    // Strategy 2: direct parse
    let candidate = match classify(&cleaned) {
        JsonRecovery::Parsed(value) => return Some(value),
        JsonRecovery::NeedsRepair(candidate) => candidate,
        JsonRecovery::Unrecoverable => return None,
    };

    // Strategy 3: brace-balanced substring extraction
    if let Some(extracted) = balanced_object(&candidate) {
        match classify(extracted) {
            JsonRecovery::Parsed(value) => return Some(value),
            _ => {
                // Strategy 4 below works on the extracted object
                if let Ok(value) = serde_json::from_str(&repair_common_errors(extracted)) {
                    return Some(value);
                }
            }
        }
    }

    // Strategy 4: minor-error repair on the whole candidate
    serde_json::from_str(&repair_common_errors(&candidate)).ok()
}

/// Remove a leading/trailing markdown code fence, with or without a
/// language tag.
pub fn strip_code_fences(text: &str) -> String {
    let mut cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim().to_string()
}

/// The outermost brace-balanced `{…}` substring, if any.
pub fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fix the two most common model formatting slips: trailing commas before a
/// closing brace/bracket and raw control characters (stray newlines inside
/// string literals included - outside literals they were only whitespace).
pub fn repair_common_errors(json_str: &str) -> String {
    let trailing_commas = Regex::new(r",(\s*[}\]])").expect("valid regex");
    let repaired = trailing_commas.replace_all(json_str, "$1");
    repaired.chars().filter(|c| !c.is_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_parse() {
        let value = recover_json(r#"{"titulo": "X"}"#).unwrap();
        assert_eq!(value, json!({"titulo": "X"}));
    }

    #[test]
    fn test_fenced_json() {
        let raw = "```json\n{\"titulo\": \"X\"}\n```";
        assert_eq!(recover_json(raw).unwrap(), json!({"titulo": "X"}));

        let raw = "```\n{\"titulo\": \"X\"}\n```";
        assert_eq!(recover_json(raw).unwrap(), json!({"titulo": "X"}));
    }

    #[test]
    fn test_fenced_json_with_trailing_comma() {
        // The shape models produce most often: fences plus a trailing comma
        let raw = "```json\n{ \"title\": \"X\", \"sectors_raw\": \"cultura, turismo\", }\n```";
        let value = recover_json(raw).unwrap();
        assert_eq!(value["title"], "X");
        assert_eq!(value["sectors_raw"], "cultura, turismo");
    }

    #[test]
    fn test_prose_around_object() {
        let raw = "Aquí está el JSON solicitado:\n{\"a\": 1, \"b\": {\"c\": 2}}\nEspero que sirva.";
        assert_eq!(recover_json(raw).unwrap(), json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let raw = "respuesta: {\"nota\": \"llaves { } internas\", \"n\": 1}";
        assert_eq!(
            recover_json(raw).unwrap(),
            json!({"nota": "llaves { } internas", "n": 1})
        );
    }

    #[test]
    fn test_control_characters_removed() {
        let raw = "{\"a\": \"x\u{1}y\"}";
        assert_eq!(recover_json(raw).unwrap(), json!({"a": "xy"}));
    }

    #[test]
    fn test_unrecoverable() {
        assert!(recover_json("no hay nada parecido a json").is_none());
        assert!(recover_json("").is_none());
        assert!(recover_json("{rotundamente roto").is_none());
    }

    #[test]
    fn test_classify_variants() {
        assert!(matches!(classify("{\"a\": 1}"), JsonRecovery::Parsed(_)));
        assert!(matches!(classify("{broken"), JsonRecovery::NeedsRepair(_)));
        assert!(matches!(classify("plain prose"), JsonRecovery::Unrecoverable));
    }

    #[test]
    fn test_balanced_object_nested() {
        let text = "x {\"a\": {\"b\": 1}} y";
        assert_eq!(balanced_object(text), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(balanced_object("sin llaves"), None);
    }
}
