//! # Type System for Path Parameters
//!
//! Type constraints for route parameters.
//!
//! A segment written as `{id:int}` only matches when the value converts to
//! the declared type; `{*rest}` captures the remainder of the path.

use crate::error::{Error, Result};
use std::fmt;

/// Supported path parameter types
///
/// Used during route registration to specify expected types.
/// Default is `String`, which accepts any segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    /// String type (default) - no conversion
    #[default]
    String,
    /// Integer type - parses to i64
    Int,
    /// Float type - parses to f64
    Float,
    /// Boolean type - parses "true"/"false" or "1"/"0"
    Bool,
}

impl ParamType {
    /// Parse type specifier from route pattern (e.g., "int" from "{id:int}")
    #[must_use]
    pub fn from_specifier(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "int" | "integer" | "i64" | "number" => Self::Int,
            "float" | "f64" | "numeric" => Self::Float,
            "bool" | "boolean" => Self::Bool,
            _ => Self::String,
        }
    }

    /// Get the type name for error messages
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Converted parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// String value (no conversion performed)
    String(String),
    /// Integer value (i64)
    Int(i64),
    /// Float value (f64)
    Float(f64),
    /// Boolean value
    Bool(bool),
}

impl ParamValue {
    /// Get the value as a string
    #[must_use]
    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    /// Check if value is a string
    #[must_use]
    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    /// Get as i64 if Int variant
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if Float variant
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as bool if Bool variant
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Convert raw string to typed value based on `ParamType`
///
/// # Errors
///
/// Returns `Error::InvalidParameter` if the segment does not fit the type.
pub fn convert_param(raw: &str, param_type: ParamType) -> Result<ParamValue> {
    let invalid = || Error::InvalidParameter {
        value: raw.to_string(),
        expected: param_type,
    };
    match param_type {
        ParamType::String => Ok(ParamValue::String(raw.to_string())),
        ParamType::Int => raw.parse::<i64>().map(ParamValue::Int).map_err(|_| invalid()),
        ParamType::Float => raw
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(ParamValue::Float)
            .ok_or_else(invalid),
        ParamType::Bool => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(ParamValue::Bool(true)),
            "false" | "0" | "no" => Ok(ParamValue::Bool(false)),
            _ => Err(invalid()),
        },
    }
}

/// A parameter segment parsed out of a route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Declared type
    pub param_type: ParamType,
    /// `{*name}` captures the rest of the path
    pub catch_all: bool,
}

/// Parse a path segment pattern to extract name and type
///
/// Examples:
/// - `{id}` -> ("id", ParamType::String)
/// - `{id:int}` -> ("id", ParamType::Int)
/// - `{*path}` -> ("path", ParamType::String, catch-all)
///
/// Returns `None` for a static segment.
#[must_use]
pub fn parse_param_pattern(segment: &str) -> Option<ParamSpec> {
    let inner = segment.strip_prefix('{')?.strip_suffix('}')?;
    let (inner, catch_all) = match inner.strip_prefix('*') {
        Some(rest) => (rest, true),
        None => (inner, false),
    };

    let (name, param_type) = match inner.split_once(':') {
        Some((name, type_spec)) => (name, ParamType::from_specifier(type_spec)),
        None => (inner, ParamType::String),
    };

    Some(ParamSpec {
        name: name.to_string(),
        param_type: if catch_all { ParamType::String } else { param_type },
        catch_all,
    })
}
