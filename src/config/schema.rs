//! Field-level schema validation for tenant configuration values
//! (spec.md §4.7).

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::CoreError;
use crate::registry::model::{ConfigFieldSchema, FieldType};

/// A named constraint check beyond `{min, max, pattern, enum}`, registered
/// with the owning `TenantConfigManager` and referenced from
/// `FieldConstraints::custom` by name (spec.md §4.7).
pub trait CustomValidator: Send + Sync {
    fn validate(&self, path: &str, value: &Value) -> Result<(), String>;
}

pub type CustomValidators = DashMap<String, Arc<dyn CustomValidator>>;

/// Validates a single field value against its declared schema, producing a
/// `ConfigValidationError` whose `path` names the offending field.
///
/// # Errors
/// Returns `CoreError::ConfigValidationError` on any type or constraint
/// mismatch, including an unregistered `custom` validator name.
pub fn validate_field(
    path: &str,
    schema: &ConfigFieldSchema,
    value: &Value,
    custom_validators: &CustomValidators,
) -> Result<(), CoreError> {
    check_type(path, schema.field_type, value)?;
    check_constraints(path, schema, value, custom_validators)
}

fn err(path: &str, message: impl Into<String>) -> CoreError {
    CoreError::ConfigValidationError {
        path: path.to_owned(),
        message: message.into(),
    }
}

fn check_type(path: &str, field_type: FieldType, value: &Value) -> Result<(), CoreError> {
    let ok = match field_type {
        FieldType::String | FieldType::Date | FieldType::Url | FieldType::Email => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array => value.is_array(),
        FieldType::Object | FieldType::Json => value.is_object() || field_type == FieldType::Json,
    };
    if !ok {
        return Err(err(
            path,
            format!("expected type {field_type:?}, got {value}"),
        ));
    }
    match field_type {
        FieldType::Url => {
            let s = value.as_str().unwrap_or_default();
            Url::parse(s).map_err(|e| err(path, format!("invalid url: {e}")))?;
        }
        FieldType::Email => {
            let s = value.as_str().unwrap_or_default();
            if !s.contains('@') || s.starts_with('@') || s.ends_with('@') {
                return Err(err(path, "invalid email address"));
            }
        }
        FieldType::Date => {
            let s = value.as_str().unwrap_or_default();
            chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| err(path, format!("invalid date: {e}")))?;
        }
        _ => {}
    }
    Ok(())
}

fn check_constraints(
    path: &str,
    schema: &ConfigFieldSchema,
    value: &Value,
    custom_validators: &CustomValidators,
) -> Result<(), CoreError> {
    let c = &schema.constraints;
    if let Some(n) = value.as_f64() {
        if let Some(min) = c.min {
            if n < min {
                return Err(err(path, format!("{n} is below minimum {min}")));
            }
        }
        if let Some(max) = c.max {
            if n > max {
                return Err(err(path, format!("{n} exceeds maximum {max}")));
            }
        }
    }
    if let Some(s) = value.as_str() {
        if let (Some(min), true) = (c.min, true) {
            if (s.len() as f64) < min {
                return Err(err(path, format!("length {} is below minimum {min}", s.len())));
            }
        }
        if let Some(max) = c.max {
            if (s.len() as f64) > max {
                return Err(err(path, format!("length {} exceeds maximum {max}", s.len())));
            }
        }
        if let Some(pattern) = &c.pattern {
            let re = Regex::new(pattern)
                .map_err(|e| err(path, format!("invalid pattern '{pattern}': {e}")))?;
            if !re.is_match(s) {
                return Err(err(path, format!("value does not match pattern '{pattern}'")));
            }
        }
    }
    if let Some(allowed) = &c.enum_values {
        if !allowed.contains(value) {
            return Err(err(path, "value is not one of the allowed enum values"));
        }
    }
    if let Some(name) = &c.custom {
        match custom_validators.get(name) {
            Some(validator) => validator.validate(path, value).map_err(|message| err(path, message))?,
            None => return Err(err(path, format!("custom validator '{name}' is not registered"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::FieldConstraints;
    use serde_json::json;

    fn schema(field_type: FieldType) -> ConfigFieldSchema {
        ConfigFieldSchema {
            field_type,
            constraints: FieldConstraints::default(),
            sensitive: false,
            inheritable: true,
            default: None,
        }
    }

    fn no_custom_validators() -> CustomValidators {
        DashMap::new()
    }

    #[test]
    fn number_type_mismatch_is_rejected() {
        let s = schema(FieldType::Number);
        let err = validate_field("maxTokens", &s, &json!("oops"), &no_custom_validators()).unwrap_err();
        match err {
            CoreError::ConfigValidationError { path, .. } => assert_eq!(path, "maxTokens"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn min_max_enforced() {
        let mut s = schema(FieldType::Number);
        s.constraints.min = Some(0.0);
        s.constraints.max = Some(10.0);
        assert!(validate_field("x", &s, &json!(5), &no_custom_validators()).is_ok());
        assert!(validate_field("x", &s, &json!(11), &no_custom_validators()).is_err());
    }

    #[test]
    fn enum_values_enforced() {
        let mut s = schema(FieldType::String);
        s.constraints.enum_values = Some(vec![json!("a"), json!("b")]);
        assert!(validate_field("x", &s, &json!("a"), &no_custom_validators()).is_ok());
        assert!(validate_field("x", &s, &json!("c"), &no_custom_validators()).is_err());
    }

    struct EvenNumber;
    impl CustomValidator for EvenNumber {
        fn validate(&self, _path: &str, value: &Value) -> Result<(), String> {
            let n = value.as_f64().ok_or("not a number")?;
            if (n as i64) % 2 == 0 {
                Ok(())
            } else {
                Err(format!("{n} is not even"))
            }
        }
    }

    #[test]
    fn custom_validator_dispatches_by_name() {
        let mut s = schema(FieldType::Number);
        s.constraints.custom = Some("even".to_owned());
        let validators = no_custom_validators();
        validators.insert("even".to_owned(), Arc::new(EvenNumber));
        assert!(validate_field("x", &s, &json!(4), &validators).is_ok());
        assert!(validate_field("x", &s, &json!(5), &validators).is_err());
    }

    #[test]
    fn unregistered_custom_validator_is_rejected() {
        let mut s = schema(FieldType::Number);
        s.constraints.custom = Some("missing".to_owned());
        let err = validate_field("x", &s, &json!(4), &no_custom_validators()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigValidationError);
    }
}
