//! Structural subset matching
//!
//! `expected` is a partial document naming only the fields an assertion cares
//! about; `actual` is an observed object. Mappings are matched key by key with
//! extra keys in `actual` ignored, lists are matched position by position and
//! must have the same length, and scalars must be equal in type and value.
//!
//! # Example
//!
//! ```
//! use koe::matcher::is_subset;
//! use serde_json::json;
//!
//! let expected = json!({"status": {"ready": true}});
//! let actual = json!({"status": {"ready": false, "replicas": 3}});
//!
//! let err = is_subset(&expected, &actual).unwrap_err();
//! assert_eq!(err.path(), "status.ready");
//! ```

use std::fmt;

use serde_json::Value;

use crate::resource::value_kind;

/// How the two documents differ at the reported path
#[derive(Debug, Clone, PartialEq)]
pub enum Mismatch {
    MissingKey,
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    LengthMismatch {
        expected: usize,
        actual: usize,
    },
    ValueMismatch {
        expected: Value,
        actual: Value,
    },
}

/// First difference found between expected and actual
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct SubsetError {
    segments: Vec<Segment>,
    pub mismatch: Mismatch,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl SubsetError {
    fn new(mismatch: Mismatch) -> Self {
        Self {
            segments: Vec::new(),
            mismatch,
        }
    }

    fn within(mut self, segment: Segment) -> Self {
        self.segments.insert(0, segment);
        self
    }

    /// Dotted path to the difference, list positions as `[i]`
    pub fn path(&self) -> String {
        let mut path = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Key(key) => {
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(key);
                }
                Segment::Index(i) => path.push_str(&format!("[{i}]")),
            }
        }
        path
    }
}

impl fmt::Display for SubsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path();
        let path = if path.is_empty() { "<root>" } else { path.as_str() };
        match &self.mismatch {
            Mismatch::MissingKey => write!(f, "{path}: key is missing"),
            Mismatch::TypeMismatch { expected, actual } => {
                write!(f, "{path}: type mismatch, expected {expected} != actual {actual}")
            }
            Mismatch::LengthMismatch { expected, actual } => write!(
                f,
                "{path}: slice length mismatch, expected {expected} != actual {actual}"
            ),
            Mismatch::ValueMismatch { expected, actual } => {
                write!(f, "{path}: value mismatch, expected: {expected} != actual: {actual}")
            }
        }
    }
}

/// Check that every field of `expected` is present and equal in `actual`
pub fn is_subset(expected: &Value, actual: &Value) -> Result<(), SubsetError> {
    if expected == actual {
        return Ok(());
    }

    match (expected, actual) {
        (Value::Object(want), Value::Object(have)) => {
            for (key, want_value) in want {
                let have_value = have
                    .get(key)
                    .ok_or_else(|| SubsetError::new(Mismatch::MissingKey))
                    .map_err(|e| e.within(Segment::Key(key.clone())))?;
                is_subset(want_value, have_value)
                    .map_err(|e| e.within(Segment::Key(key.clone())))?;
            }
            Ok(())
        }
        (Value::Array(want), Value::Array(have)) => {
            if want.len() != have.len() {
                return Err(SubsetError::new(Mismatch::LengthMismatch {
                    expected: want.len(),
                    actual: have.len(),
                }));
            }
            for (i, (w, h)) in want.iter().zip(have).enumerate() {
                is_subset(w, h).map_err(|e| e.within(Segment::Index(i)))?;
            }
            Ok(())
        }
        _ if value_kind(expected) != value_kind(actual) => {
            Err(SubsetError::new(Mismatch::TypeMismatch {
                expected: value_kind(expected),
                actual: value_kind(actual),
            }))
        }
        _ => Err(SubsetError::new(Mismatch::ValueMismatch {
            expected: expected.clone(),
            actual: actual.clone(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget() -> Value {
        json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "labels": { "team": "a" } },
            "spec": { "replicas": 3, "ports": [{ "port": 80 }, { "port": 443 }] },
            "status": { "ready": true }
        })
    }

    #[test]
    fn test_reflexive() {
        assert!(is_subset(&widget(), &widget()).is_ok());
        assert!(is_subset(&json!(null), &json!(null)).is_ok());
        assert!(is_subset(&json!([]), &json!([])).is_ok());
    }

    #[test]
    fn test_extra_keys_ignored() {
        let mut observed = widget();
        observed["metadata"]["uid"] = json!("abc");
        observed["spec"]["ports"][0]["protocol"] = json!("TCP");
        observed["extra"] = json!({"nested": [1, 2]});

        assert!(is_subset(&widget(), &observed).is_ok());
    }

    #[test]
    fn test_missing_key_cites_path() {
        let observed = json!({"kind": "Widget", "status": {}});
        let err = is_subset(&json!({"status": {"ready": true}}), &observed).unwrap_err();

        assert_eq!(err.path(), "status.ready");
        assert_eq!(err.mismatch, Mismatch::MissingKey);
    }

    #[test]
    fn test_value_mismatch_cites_path() {
        let err = is_subset(
            &json!({"status": {"ready": true}}),
            &json!({"status": {"ready": false}}),
        )
        .unwrap_err();

        assert_eq!(err.path(), "status.ready");
        assert_eq!(
            err.to_string(),
            "status.ready: value mismatch, expected: true != actual: false"
        );
    }

    #[test]
    fn test_list_length_must_match() {
        let err = is_subset(
            &json!({"spec": {"ports": [{"port": 80}]}}),
            &widget(),
        )
        .unwrap_err();

        assert_eq!(err.path(), "spec.ports");
        assert!(matches!(
            err.mismatch,
            Mismatch::LengthMismatch { expected: 1, actual: 2 }
        ));
    }

    #[test]
    fn test_lists_match_by_position() {
        let swapped = json!({"spec": {"ports": [{"port": 443}, {"port": 80}]}});
        let err = is_subset(&swapped, &widget()).unwrap_err();
        assert_eq!(err.path(), "spec.ports[0].port");
    }

    #[test]
    fn test_type_mismatch() {
        let err = is_subset(
            &json!({"spec": {"replicas": "3"}}),
            &widget(),
        )
        .unwrap_err();

        assert_eq!(
            err.mismatch,
            Mismatch::TypeMismatch {
                expected: "string",
                actual: "number"
            }
        );
        assert!(err.to_string().starts_with("spec.replicas: type mismatch"));
    }

    #[test]
    fn test_root_scalar_mismatch() {
        let err = is_subset(&json!(1), &json!(2)).unwrap_err();
        assert_eq!(err.path(), "");
        assert!(err.to_string().starts_with("<root>:"));
    }
}
