//! # Validation Module
//!
//! Structured validation errors and a rule-string validator:
//!
//! ```ignore
//! let data = Validator::make(&input, &[
//!     ("name", "required|string|max:255"),
//!     ("email", "required|email"),
//!     ("password", "required|min:8|confirmed"),
//! ])?
//! .validate()?;
//! ```

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Error code for categorizing validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    /// Required field is missing
    Required,
    /// Value is invalid type
    InvalidType,
    /// Value is too short
    TooShort,
    /// Value is too long
    TooLong,
    /// Value is below minimum
    TooSmall,
    /// Value is above maximum
    TooLarge,
    /// Value doesn't match pattern
    InvalidFormat,
    /// Value is not unique
    NotUnique,
    /// Value is not in allowed set
    InvalidChoice,
    /// Confirmation field does not match
    Confirmed,
    /// Custom validation failed
    Custom,
}

/// A single validation error for a specific field
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    /// Field name (e.g., "email", "user.address.city")
    pub field: String,
    /// Human-readable error message
    pub message: String,
    /// Machine-readable error code
    pub code: ValidationCode,
}

impl FieldError {
    /// Create a new field error
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ValidationCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }

    /// Create a "required field" error
    pub fn required(field: impl Into<String>) -> Self {
        let field_str = field.into();
        Self {
            message: format!("The {field_str} field is required."),
            field: field_str,
            code: ValidationCode::Required,
        }
    }

    /// Create an "invalid type" error
    pub fn invalid_type(field: impl Into<String>, expected: &str) -> Self {
        let field_str = field.into();
        Self {
            message: format!("The {field_str} field must be {expected}."),
            field: field_str,
            code: ValidationCode::InvalidType,
        }
    }

    /// Create a "too short" error
    pub fn too_short(field: impl Into<String>, min: usize) -> Self {
        let field_str = field.into();
        Self {
            message: format!("The {field_str} field must be at least {min} characters."),
            field: field_str,
            code: ValidationCode::TooShort,
        }
    }

    /// Create a "too long" error
    pub fn too_long(field: impl Into<String>, max: usize) -> Self {
        let field_str = field.into();
        Self {
            message: format!("The {field_str} field must not be greater than {max} characters."),
            field: field_str,
            code: ValidationCode::TooLong,
        }
    }
}

/// Collection of validation errors
///
/// Allows aggregating multiple field errors for a single request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationErrors {
    /// List of field-level errors
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    /// Create an empty error collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field error
    pub fn add(&mut self, error: FieldError) {
        self.errors.push(error);
    }

    /// Add a required field error
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(FieldError::required(field));
    }

    /// Check if there are any errors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Get the number of errors
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Convert to JSON response body
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"errors":[]}"#.to_string())
    }

    /// Messages grouped by field, in the `{"field": ["message", ...]}` shape
    #[must_use]
    pub fn messages(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for error in &self.errors {
            if let Value::Array(list) = map
                .entry(error.field.clone())
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                list.push(Value::String(error.message.clone()));
            }
        }
        map
    }

    /// Group errors by field
    #[must_use]
    pub fn by_field(&self) -> HashMap<String, Vec<&FieldError>> {
        let mut map: HashMap<String, Vec<&FieldError>> = HashMap::new();
        for error in &self.errors {
            map.entry(error.field.clone()).or_default().push(error);
        }
        map
    }
}

/// Result type for validation operations
pub type ValidationResult<T> = std::result::Result<T, ValidationErrors>;

/// One parsed rule from a `|`-separated rule string
#[derive(Debug, Clone, PartialEq)]
enum Rule {
    Required,
    Nullable,
    String,
    Integer,
    Numeric,
    Boolean,
    Array,
    Email,
    Min(f64),
    Max(f64),
    Between(f64, f64),
    In(Vec<String>),
    Confirmed,
}

impl Rule {
    /// Parse one rule; `None` for unknown names or malformed arguments
    fn parse(raw: &str) -> Option<Self> {
        let (name, args) = raw.split_once(':').unwrap_or((raw, ""));
        let number = |s: &str| s.trim().parse::<f64>().ok();
        let rule = match name.trim() {
            "required" => Self::Required,
            "nullable" => Self::Nullable,
            "string" => Self::String,
            "integer" | "int" => Self::Integer,
            "numeric" => Self::Numeric,
            "boolean" | "bool" => Self::Boolean,
            "array" => Self::Array,
            "email" => Self::Email,
            "min" => Self::Min(number(args)?),
            "max" => Self::Max(number(args)?),
            "between" => {
                let (low, high) = args.split_once(',')?;
                Self::Between(number(low)?, number(high)?)
            }
            "in" => Self::In(args.split(',').map(|s| s.trim().to_string()).collect()),
            "confirmed" => Self::Confirmed,
            _ => return None,
        };
        Some(rule)
    }
}

/// Rule-string validator over a JSON object of input
#[derive(Debug)]
pub struct Validator<'a> {
    data: &'a Map<String, Value>,
    rules: Vec<(String, Vec<Rule>)>,
}

impl<'a> Validator<'a> {
    /// Build a validator for `data` with `(field, "rule|rule:arg")` pairs
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRule` for an unknown rule name or malformed
    /// rule arguments.
    pub fn make(data: &'a Map<String, Value>, rules: &[(&str, &str)]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(field, spec)| {
                let parsed = spec
                    .split('|')
                    .filter(|r| !r.is_empty())
                    .map(|raw| {
                        Rule::parse(raw).ok_or_else(|| Error::InvalidRule {
                            field: (*field).to_string(),
                            rule: raw.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(((*field).to_string(), parsed))
            })
            .collect::<Result<_>>()?;
        Ok(Self { data, rules })
    }

    /// Whether validation fails
    #[must_use]
    pub fn fails(&self) -> bool {
        !self.errors().is_empty()
    }

    /// Run every rule and collect failures
    #[must_use]
    pub fn errors(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        for (field, rules) in &self.rules {
            self.check_field(field, rules, &mut errors);
        }
        errors
    }

    /// Validated fields only, or all failures
    ///
    /// # Errors
    ///
    /// Returns every failed rule when any field is invalid.
    pub fn validate(&self) -> ValidationResult<Map<String, Value>> {
        let errors = self.errors();
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(self
            .rules
            .iter()
            .filter_map(|(field, _)| self.data.get(field).map(|v| (field.clone(), v.clone())))
            .collect())
    }

    fn check_field(&self, field: &str, rules: &[Rule], errors: &mut ValidationErrors) {
        let value = self.data.get(field);
        let present = value.is_some_and(|v| !is_empty_value(v));

        if !present {
            if rules.contains(&Rule::Required) {
                errors.add_required(field);
            }
            return;
        }
        let Some(value) = value else { return };
        if value.is_null() && rules.contains(&Rule::Nullable) {
            return;
        }

        let numeric = rules
            .iter()
            .any(|r| matches!(r, Rule::Integer | Rule::Numeric));

        for rule in rules {
            if let Some(error) = check_rule(field, rule, value, numeric, self.data) {
                errors.add(error);
            }
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Size used by min/max/between: numeric value, character count or item count
fn size_of(value: &Value, numeric: bool) -> Option<f64> {
    if numeric {
        return as_number(value);
    }
    match value {
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(a) => Some(a.len() as f64),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
}

fn check_rule(
    field: &str,
    rule: &Rule,
    value: &Value,
    numeric: bool,
    data: &Map<String, Value>,
) -> Option<FieldError> {
    let unit = if numeric { "" } else { " characters" };
    match rule {
        Rule::Required | Rule::Nullable => None,
        Rule::String => (!value.is_string()).then(|| FieldError::invalid_type(field, "a string")),
        Rule::Integer => {
            let ok = match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.trim().parse::<i64>().is_ok(),
                _ => false,
            };
            (!ok).then(|| FieldError::invalid_type(field, "an integer"))
        }
        Rule::Numeric => {
            as_number(value)
                .is_none()
                .then(|| FieldError::invalid_type(field, "a number"))
        }
        Rule::Boolean => {
            let ok = match value {
                Value::Bool(_) => true,
                Value::Number(n) => matches!(n.as_i64(), Some(0 | 1)),
                Value::String(s) => matches!(s.as_str(), "0" | "1" | "true" | "false"),
                _ => false,
            };
            (!ok).then(|| FieldError::invalid_type(field, "true or false"))
        }
        Rule::Array => (!value.is_array()).then(|| FieldError::invalid_type(field, "an array")),
        Rule::Email => {
            let ok = value.as_str().is_some_and(is_email);
            (!ok).then(|| {
                FieldError::new(
                    field,
                    format!("The {field} field must be a valid email address."),
                    ValidationCode::InvalidFormat,
                )
            })
        }
        Rule::Min(min) => {
            let size = size_of(value, numeric)?;
            (size < *min).then(|| {
                let code = if numeric {
                    ValidationCode::TooSmall
                } else {
                    ValidationCode::TooShort
                };
                FieldError::new(
                    field,
                    format!("The {field} field must be at least {min}{unit}."),
                    code,
                )
            })
        }
        Rule::Max(max) => {
            let size = size_of(value, numeric)?;
            (size > *max).then(|| {
                let code = if numeric {
                    ValidationCode::TooLarge
                } else {
                    ValidationCode::TooLong
                };
                FieldError::new(
                    field,
                    format!("The {field} field must not be greater than {max}{unit}."),
                    code,
                )
            })
        }
        Rule::Between(low, high) => {
            let size = size_of(value, numeric)?;
            (size < *low || size > *high).then(|| {
                FieldError::new(
                    field,
                    format!("The {field} field must be between {low} and {high}{unit}."),
                    if size < *low {
                        ValidationCode::TooSmall
                    } else {
                        ValidationCode::TooLarge
                    },
                )
            })
        }
        Rule::In(choices) => {
            let as_text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (!choices.contains(&as_text)).then(|| {
                FieldError::new(
                    field,
                    format!("The selected {field} is invalid."),
                    ValidationCode::InvalidChoice,
                )
            })
        }
        Rule::Confirmed => {
            let confirmation = data.get(&format!("{field}_confirmation"));
            (confirmation != Some(value)).then(|| {
                FieldError::new(
                    field,
                    format!("The {field} field confirmation does not match."),
                    ValidationCode::Confirmed,
                )
            })
        }
    }
}
