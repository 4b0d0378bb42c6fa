//! # JSON Serialization Module
//!
//! JSON parsing using simd-json, serialization through serde_json.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Parse JSON string to a typed value using simd-json
///
/// # Errors
///
/// Returns `Error::BadRequest` if parsing fails
pub fn parse_json<T: DeserializeOwned>(json_str: &str) -> Result<T> {
    let mut bytes = json_str.as_bytes().to_vec();
    parse_json_bytes(&mut bytes)
}

/// Parse JSON bytes to a typed value using simd-json
///
/// simd-json parses in place, so the buffer is clobbered.
///
/// # Errors
///
/// Returns `Error::BadRequest` if parsing fails
pub fn parse_json_bytes<T: DeserializeOwned>(bytes: &mut [u8]) -> Result<T> {
    simd_json::from_slice(bytes).map_err(|e| Error::BadRequest {
        message: format!("Malformed JSON: {e}"),
    })
}

/// Serialize a value to JSON string
///
/// # Errors
///
/// Returns `Error::Json` if the value cannot be represented as JSON
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Serialize a value to pretty-printed JSON string
///
/// # Errors
///
/// Returns `Error::Json` if the value cannot be represented as JSON
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        age: i32,
    }

    #[test]
    fn test_parse_json_object() {
        let json = r#"{"name": "John", "age": 30}"#;
        let data: TestData = parse_json(json).unwrap();
        assert_eq!(data.name, "John");
        assert_eq!(data.age, 30);
    }

    #[test]
    fn test_parse_json_map() {
        let json = r#"{"key": "value", "count": "42"}"#;
        let map: HashMap<String, String> = parse_json(json).unwrap();
        assert_eq!(map.get("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_to_json() {
        let data = TestData {
            name: "Bob".to_string(),
            age: 40,
        };
        let json = to_json(&data).unwrap();
        assert!(json.contains("Bob"));
        assert!(to_json_pretty(&data).unwrap().contains('\n'));
    }

    #[test]
    fn test_invalid_json() {
        let result: Result<TestData> = parse_json("not valid json");
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }
}
