//! Wire encoding for terms sent from the master to a slave.
//!
//! The payload is form-encoded with `key`, `taxonomy`, `term` and the optional `term_meta`.
//! `term` and `term_meta` carry JSON text. Decoding is lenient about field contents
//! (blank strings for missing text, numeric strings for ids) but strict about shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Term, TermMeta};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("term payload is missing")]
    Missing,
    #[error("term payload is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirePayload {
    pub key: String,
    pub taxonomy: String,
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_meta: Option<String>,
}

impl WirePayload {
    #[must_use]
    pub fn form_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![
            ("key", self.key.as_str()),
            ("taxonomy", self.taxonomy.as_str()),
            ("term", self.term.as_str()),
        ];
        if let Some(term_meta) = &self.term_meta {
            fields.push(("term_meta", term_meta.as_str()));
        }
        fields
    }
}

#[derive(Serialize)]
struct WireTerm<'a> {
    term_id: i64,
    taxonomy: &'a str,
    name: &'a str,
    slug: &'a str,
    description: &'a str,
    parent: i64,
}

/// Build the transport payload for one term. `term_meta` is attached only when non-empty.
///
/// # Errors
/// Returns an error when JSON serialization fails.
pub fn encode(
    term: &Term,
    key: &str,
    metadata: Option<&TermMeta>,
) -> Result<WirePayload, serde_json::Error> {
    let wire = WireTerm {
        term_id: term.term_id,
        taxonomy: &term.taxonomy,
        name: &term.name,
        slug: &term.slug,
        description: &term.description,
        parent: term.parent.unwrap_or(0),
    };

    let term_meta = match metadata {
        Some(values) if !values.is_empty() => Some(serde_json::to_string(values)?),
        _ => None,
    };

    Ok(WirePayload {
        key: key.to_string(),
        taxonomy: term.taxonomy.clone(),
        term: serde_json::to_string(&wire)?,
        term_meta,
    })
}

/// Parse the `term` field of a received payload.
///
/// # Errors
/// Returns `DecodeError::Missing` when the field is absent and `DecodeError::Invalid` when it is
/// not a JSON object or carries no usable `term_id`.
pub fn decode_term(raw: Option<&str>) -> Result<Term, DecodeError> {
    let raw = raw.ok_or(DecodeError::Missing)?;
    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeError::Invalid(err.to_string()))?;
    let Value::Object(object) = value else {
        return Err(DecodeError::Invalid("term is not a JSON object".to_string()));
    };

    let term_id = id_field(&object, "term_id")
        .filter(|id| *id > 0)
        .ok_or_else(|| DecodeError::Invalid("term_id must be a positive integer".to_string()))?;

    Ok(Term {
        term_id,
        taxonomy: string_field(&object, "taxonomy"),
        name: string_field(&object, "name"),
        slug: string_field(&object, "slug"),
        description: string_field(&object, "description"),
        parent: id_field(&object, "parent").filter(|id| *id > 0),
    })
}

/// Parse the `term_meta` field into a flat string map.
///
/// # Errors
/// Returns `DecodeError::Invalid` when the text is not a JSON object.
pub fn decode_metadata(raw: &str) -> Result<TermMeta, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeError::Invalid(err.to_string()))?;
    let Value::Object(object) = value else {
        return Err(DecodeError::Invalid("term_meta is not a JSON object".to_string()));
    };

    Ok(object
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}

fn string_field(object: &Map<String, Value>, field: &str) -> String {
    match object.get(field) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => String::new(),
    }
}

fn id_field(object: &Map<String, Value>, field: &str) -> Option<i64> {
    match object.get(field)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_support::term;

    fn decode_ok(raw: &str) -> Term {
        match decode_term(Some(raw)) {
            Ok(term) => term,
            Err(err) => panic!("expected `{raw}` to decode: {err}"),
        }
    }

    // Test IDs: TCOD-001
    #[test]
    fn encode_attaches_key_taxonomy_and_root_parent_as_zero() {
        let payload = match encode(&term(7, "genre", "Jazz", None), "k", None) {
            Ok(payload) => payload,
            Err(err) => panic!("encode failed: {err}"),
        };
        assert_eq!(payload.key, "k");
        assert_eq!(payload.taxonomy, "genre");
        assert!(payload.term_meta.is_none());

        let value: Value = match serde_json::from_str(&payload.term) {
            Ok(value) => value,
            Err(err) => panic!("term field is not JSON: {err}"),
        };
        assert_eq!(value.get("term_id").and_then(Value::as_i64), Some(7));
        assert_eq!(value.get("parent").and_then(Value::as_i64), Some(0));
        assert_eq!(payload.form_fields().len(), 3);
    }

    // Test IDs: TCOD-002
    #[test]
    fn encode_skips_empty_metadata_and_includes_non_empty() {
        let empty = TermMeta::new();
        let payload = match encode(&term(7, "genre", "Jazz", None), "k", Some(&empty)) {
            Ok(payload) => payload,
            Err(err) => panic!("encode failed: {err}"),
        };
        assert!(payload.term_meta.is_none());

        let mut meta = TermMeta::new();
        meta.insert("color".to_string(), "blue".to_string());
        let payload = match encode(&term(7, "genre", "Jazz", None), "k", Some(&meta)) {
            Ok(payload) => payload,
            Err(err) => panic!("encode failed: {err}"),
        };
        let raw = payload.term_meta.clone().unwrap_or_default();
        assert_eq!(decode_metadata(&raw), Ok(meta));
        assert!(payload.form_fields().contains(&("term_meta", raw.as_str())));
    }

    // Test IDs: TCOD-003
    #[test]
    fn decode_rejects_absent_non_json_and_non_object_terms() {
        assert_eq!(decode_term(None), Err(DecodeError::Missing));
        assert!(matches!(decode_term(Some("{not json")), Err(DecodeError::Invalid(_))));
        assert!(matches!(decode_term(Some("[1,2]")), Err(DecodeError::Invalid(_))));
        assert!(matches!(decode_term(Some("null")), Err(DecodeError::Invalid(_))));
        assert!(matches!(decode_term(Some(r#"{"name":"Jazz"}"#)), Err(DecodeError::Invalid(_))));
    }

    // Test IDs: TCOD-004
    #[test]
    fn decode_accepts_sparse_objects_with_blank_fields() {
        let decoded = decode_ok(r#"{"term_id":"12"}"#);
        assert_eq!(decoded.term_id, 12);
        assert_eq!(decoded.name, "");
        assert_eq!(decoded.slug, "");
        assert_eq!(decoded.description, "");
        assert_eq!(decoded.taxonomy, "");
        assert_eq!(decoded.parent, None);
    }

    // Test IDs: TCOD-005
    #[test]
    fn decode_normalizes_root_parent_forms() {
        for parent in ["0", "\"0\"", "\"\"", "null", "-3"] {
            let raw = format!(r#"{{"term_id":4,"name":"Blues","parent":{parent}}}"#);
            assert_eq!(decode_ok(&raw).parent, None, "parent literal {parent}");
        }
        assert_eq!(decode_ok(r#"{"term_id":4,"parent":"9"}"#).parent, Some(9));
    }

    // Test IDs: TCOD-006
    #[test]
    fn decode_metadata_flattens_scalar_values() {
        let raw = r#"{"color":"blue","weight":3,"flag":true,"empty":null}"#;
        let decoded = match decode_metadata(raw) {
            Ok(decoded) => decoded,
            Err(err) => panic!("metadata should decode: {err}"),
        };
        assert_eq!(decoded.get("color").map(String::as_str), Some("blue"));
        assert_eq!(decoded.get("weight").map(String::as_str), Some("3"));
        assert_eq!(decoded.get("flag").map(String::as_str), Some("true"));
        assert_eq!(decoded.get("empty").map(String::as_str), Some(""));
        assert!(decode_metadata("[]").is_err());
    }

    proptest! {
        #[test]
        fn property_encode_then_decode_preserves_term_fields(
            term_id in 1_i64..i64::MAX,
            taxonomy in "[a-z_]{1,16}",
            name in "\\PC*",
            slug in "[a-z0-9-]{0,24}",
            description in "\\PC*",
            parent in proptest::option::of(1_i64..1_000_000),
        ) {
            let original = Term { term_id, taxonomy, name, slug, description, parent };
            let payload = match encode(&original, "key", None) {
                Ok(payload) => payload,
                Err(err) => panic!("encode failed: {err}"),
            };
            let decoded = decode_term(Some(&payload.term));
            prop_assert_eq!(decoded, Ok(original));
        }
    }
}
