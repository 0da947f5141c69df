//! Dynamically-typed SQL scalar.

use std::hash::{Hash, Hasher};

/// A value that can be stored in an entity column: one of the four SQL
/// scalar kinds, or null.
///
/// Equality compares kind and payload. `Hash` is defined for
/// `Integer`/`Real`/`Text`; hashing a `Blob` or `Null` is a programmer
/// error and panics, matching spec.md §3 ("hashing defined for
/// integer/real/text").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

/// Which SQL scalar kind a [`Value`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Real,
    Text,
    Blob,
    Null,
}

impl Value {
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Integer(_) => ValueKind::Integer,
            Self::Real(_) => ValueKind::Real,
            Self::Text(_) => ValueKind::Text,
            Self::Blob(_) => ValueKind::Blob,
            Self::Null => ValueKind::Null,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Typed accessor: returns the held integer, or `0` if this isn't an
    /// `Integer`.
    #[must_use]
    pub const fn as_integer(&self) -> i64 {
        match self {
            Self::Integer(v) => *v,
            _ => 0,
        }
    }

    /// Typed accessor: returns the held real, or `0.0` if this isn't a
    /// `Real`.
    #[must_use]
    pub const fn as_real(&self) -> f64 {
        match self {
            Self::Real(v) => *v,
            _ => 0.0,
        }
    }

    /// Typed accessor: returns the held text, or `""` if this isn't a
    /// `Text`.
    #[must_use]
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text(v) => v.as_str(),
            _ => "",
        }
    }

    /// Typed accessor: returns the held bytes, or `&[]` if this isn't a
    /// `Blob`.
    #[must_use]
    pub fn as_blob(&self) -> &[u8] {
        match self {
            Self::Blob(v) => v.as_slice(),
            _ => &[],
        }
    }

    /// Render this value as a SQL literal for inlining directly into a
    /// statement (used only for DDL defaults and debug SQL logging —
    /// bound parameters never go through this path).
    ///
    /// # Panics
    ///
    /// Panics when called on a `Blob`: every blob value must travel as a
    /// bind parameter, never inlined.
    #[must_use]
    pub fn sql_literal(&self) -> String {
        match self {
            Self::Integer(v) => v.to_string(),
            Self::Real(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    format!("{v:.1}")
                } else {
                    v.to_string()
                }
            }
            Self::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Self::Blob(_) => panic!("blob values cannot be SQL-literalized; bind them instead"),
            Self::Null => "null".to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => a == b,
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Integer(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            Self::Real(v) => {
                1u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::Text(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Self::Blob(_) => panic!("Blob is not hashable (spec: hashing defined for integer/real/text only)"),
            Self::Null => panic!("Null is not hashable (spec: hashing defined for integer/real/text only)"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

/// Convert to the low-level driver's bind-parameter value. This is the
/// only place `revdb::Value` and `sqlmodel_core::Value` meet — the two
/// types are kept distinct everywhere else so the engine's precise
/// four-kind-plus-null semantics never get diluted by the driver's wider
/// type set.
///
/// The driver has no byte-array bind variant, so a `Blob` travels as
/// base64-encoded `Text` (the same encode-to-text idiom used for binary
/// payloads elsewhere — see `base64::engine::general_purpose::STANDARD`
/// usage for inline image bytes). [`blob_column_to_bytes`] reverses it on
/// read.
impl From<&Value> for sqlmodel_core::Value {
    fn from(v: &Value) -> Self {
        use base64::Engine;
        match v {
            Value::Integer(i) => Self::BigInt(*i),
            Value::Real(r) => Self::Double(*r),
            Value::Text(s) => Self::Text(s.clone()),
            Value::Blob(b) => Self::Text(base64::engine::general_purpose::STANDARD.encode(b)),
            Value::Null => Self::Null,
        }
    }
}

/// Decode a blob column previously bound via `From<&Value> for
/// sqlmodel_core::Value` back into raw bytes.
///
/// # Errors
///
/// Returns an error if `text` is not valid base64 (a blob column should
/// never contain anything else, since every write goes through the
/// encoder above).
pub fn blob_column_to_bytes(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_kind_and_payload() {
        assert_eq!(Value::Integer(1), Value::Integer(1));
        assert_ne!(Value::Integer(1), Value::Integer(2));
        assert_ne!(Value::Integer(1), Value::Real(1.0));
        assert_eq!(Value::Text("a".into()), Value::Text("a".into()));
        assert_eq!(Value::Null, Value::Null);
    }

    #[test]
    fn typed_accessors_return_zero_value_on_mismatch() {
        let v = Value::Text("hi".into());
        assert_eq!(v.as_integer(), 0);
        assert!((v.as_real() - 0.0).abs() < f64::EPSILON);
        assert!(v.as_blob().is_empty());
        assert_eq!(Value::Integer(5).as_text(), "");
    }

    #[test]
    fn sql_literal_escapes_quotes() {
        assert_eq!(Value::Text("O'Brien".into()).sql_literal(), "'O''Brien'");
        assert_eq!(Value::Integer(7).sql_literal(), "7");
        assert_eq!(Value::Real(7.0).sql_literal(), "7.0");
        assert_eq!(Value::Null.sql_literal(), "null");
    }

    #[test]
    #[should_panic(expected = "blob values cannot be SQL-literalized")]
    fn sql_literal_rejects_blob() {
        let _ = Value::Blob(vec![1, 2, 3]).sql_literal();
    }

    #[test]
    #[should_panic(expected = "not hashable")]
    fn hashing_blob_panics() {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        Value::Blob(vec![1]).hash(&mut hasher);
    }

    #[test]
    fn blob_round_trips_through_driver_value_as_base64_text() {
        let bytes = vec![0u8, 1, 2, 254, 255, 16, 32];
        let driver_value = sqlmodel_core::Value::from(&Value::Blob(bytes.clone()));
        let sqlmodel_core::Value::Text(encoded) = driver_value else {
            panic!("blob must bind as Text");
        };
        assert_eq!(blob_column_to_bytes(&encoded).unwrap(), bytes);
    }

    mod proptest_value {
        use super::*;
        use proptest::prelude::*;
        use std::collections::hash_map::DefaultHasher;

        fn hash_of(v: &Value) -> u64 {
            let mut hasher = DefaultHasher::new();
            v.hash(&mut hasher);
            hasher.finish()
        }

        proptest! {
            #[test]
            fn integer_roundtrips_through_kind_and_accessor(i in any::<i64>()) {
                let v = Value::Integer(i);
                prop_assert_eq!(v.kind(), ValueKind::Integer);
                prop_assert_eq!(v.as_integer(), i);
                prop_assert_eq!(v.clone(), Value::Integer(i));
                prop_assert_eq!(hash_of(&v), hash_of(&Value::Integer(i)));
            }

            #[test]
            fn text_sql_literal_is_always_quote_balanced(s in ".*") {
                let literal = Value::Text(s.clone()).sql_literal();
                prop_assert!(literal.starts_with('\''));
                prop_assert!(literal.ends_with('\''));
                // every embedded quote must be doubled: stripping the
                // surrounding quotes and every `''` pair must leave a string
                // with no quote characters left over.
                let inner = &literal[1..literal.len() - 1];
                prop_assert_eq!(inner.replace("''", ""), s.replace('\'', ""));
            }

            #[test]
            fn equal_text_values_hash_equal(s in "[a-zA-Z0-9]{0,16}") {
                let a = Value::Text(s.clone());
                let b = Value::Text(s);
                prop_assert_eq!(a.clone(), b.clone());
                prop_assert_eq!(hash_of(&a), hash_of(&b));
            }

            #[test]
            fn real_sql_literal_parses_back_to_the_same_bits(r in any::<f64>().prop_filter("finite only", |r| r.is_finite())) {
                let literal = Value::Real(r).sql_literal();
                let parsed: f64 = literal.parse().expect("sql_literal for a finite Real must be a valid float literal");
                prop_assert_eq!(parsed.to_bits(), r.to_bits());
            }
        }
    }
}
