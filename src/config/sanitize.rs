//! Declared sanitization pipeline applied to config values after schema
//! validation (spec.md §4.7).

use serde_json::Value;

/// A single sanitization step. Order of application is the order declared
/// on the rule list; `field` of `"*"` matches every string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeRule {
    Trim,
    Lowercase,
    Uppercase,
    StripMarkup,
    Encrypt,
    Hash,
}

/// A declared sanitization step bound to the field pattern it applies to.
#[derive(Debug, Clone)]
pub struct SanitizeStep {
    pub field_pattern: String,
    pub rule: SanitizeRule,
}

fn matches(pattern: &str, field: &str) -> bool {
    pattern == "*" || pattern == field
}

fn strip_markup(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Applies one rule to a string value. `Encrypt`/`Hash` are represented by
/// an opaque marker prefix since the core does not own key material or a
/// hash algorithm choice for this purpose — a real deployment swaps this
/// for its own crypto collaborator.
fn apply_to_string(rule: SanitizeRule, s: &str) -> String {
    match rule {
        SanitizeRule::Trim => s.trim().to_owned(),
        SanitizeRule::Lowercase => s.to_lowercase(),
        SanitizeRule::Uppercase => s.to_uppercase(),
        SanitizeRule::StripMarkup => strip_markup(s),
        SanitizeRule::Encrypt => format!("enc:{}", blake3::hash(s.as_bytes()).to_hex()),
        SanitizeRule::Hash => format!("hash:{}", blake3::hash(s.as_bytes()).to_hex()),
    }
}

/// Walks a flat config map, applying every step whose pattern matches each
/// string-valued field, in declared order.
pub fn sanitize_map(
    map: &mut serde_json::Map<String, Value>,
    steps: &[SanitizeStep],
) {
    for (field, value) in map.iter_mut() {
        if let Value::String(s) = value {
            let mut current = s.clone();
            for step in steps {
                if matches(&step.field_pattern, field) {
                    current = apply_to_string(step.rule, &current);
                }
            }
            *value = Value::String(current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trim_and_lowercase_apply_in_order() {
        let mut map = serde_json::Map::new();
        map.insert("name".to_owned(), json!("  HELLO  "));
        sanitize_map(
            &mut map,
            &[
                SanitizeStep { field_pattern: "*".to_owned(), rule: SanitizeRule::Trim },
                SanitizeStep { field_pattern: "*".to_owned(), rule: SanitizeRule::Lowercase },
            ],
        );
        assert_eq!(map["name"], json!("hello"));
    }

    #[test]
    fn strip_markup_removes_tags() {
        let mut map = serde_json::Map::new();
        map.insert("bio".to_owned(), json!("<b>hi</b> there"));
        sanitize_map(
            &mut map,
            &[SanitizeStep { field_pattern: "bio".to_owned(), rule: SanitizeRule::StripMarkup }],
        );
        assert_eq!(map["bio"], json!("hi there"));
    }

    #[test]
    fn pattern_only_matches_declared_field() {
        let mut map = serde_json::Map::new();
        map.insert("a".to_owned(), json!("X"));
        map.insert("b".to_owned(), json!("X"));
        sanitize_map(
            &mut map,
            &[SanitizeStep { field_pattern: "a".to_owned(), rule: SanitizeRule::Lowercase }],
        );
        assert_eq!(map["a"], json!("x"));
        assert_eq!(map["b"], json!("X"));
    }
}
