//! Deterministic cache keys for rendered exports.
//!
//! A key identifies one render output: the same contract state, style and
//! format always hash to the same 64-character hex digest, no matter in which
//! order clause ids or answer keys were collected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Output document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Docx,
    Odt,
}

impl ExportFormat {
    /// File extension, also used as the suffix of cache and delivery paths.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Docx => "docx",
            ExportFormat::Odt => "odt",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docx" => Ok(ExportFormat::Docx),
            "odt" => Ok(ExportFormat::Odt),
            other => Err(format!("unsupported export format: {other}")),
        }
    }
}

/// Parameters that fully determine a render output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeyInput {
    pub contract_instance_id: String,
    pub clause_version_ids: Vec<String>,
    pub answers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_template_id: Option<String>,
    pub format: ExportFormat,
}

/// Computes the SHA-256 cache key of `input` as lowercase hex.
pub fn compute_cache_key(input: &CacheKeyInput) -> String {
    let digest = Sha256::digest(canonical_bytes(input));
    hex::encode(digest)
}

/// Canonical serialization hashed by [`compute_cache_key`].
///
/// Clause ids are sorted and deduplicated, answer objects have their keys
/// sorted at every depth, and a missing style template is an explicit `null`.
fn canonical_bytes(input: &CacheKeyInput) -> Vec<u8> {
    let mut clause_ids: Vec<&str> = input.clause_version_ids.iter().map(String::as_str).collect();
    clause_ids.sort_unstable();
    clause_ids.dedup();

    // Field order here is part of the key; do not reorder.
    let mut out = String::new();
    out.push_str("{\"contractInstanceId\":");
    out.push_str(&Value::String(input.contract_instance_id.clone()).to_string());
    out.push_str(",\"clauseVersionIds\":");
    out.push_str(&Value::from(clause_ids).to_string());
    out.push_str(",\"answers\":");
    write_canonical(&Value::Object(input.answers.clone()), &mut out);
    out.push_str(",\"styleTemplateId\":");
    match &input.style_template_id {
        Some(id) => out.push_str(&Value::String(id.clone()).to_string()),
        None => out.push_str("null"),
    }
    out.push_str(",\"format\":");
    out.push_str(&Value::String(input.format.extension().to_string()).to_string());
    out.push('}');
    out.into_bytes()
}

/// Serializes `value` with object keys in sorted order at every depth,
/// independent of serde_json's map implementation.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answers(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("answers must be an object"),
        }
    }

    fn baseline() -> CacheKeyInput {
        CacheKeyInput {
            contract_instance_id: "ci-100".to_string(),
            clause_version_ids: vec!["cv-3".into(), "cv-1".into(), "cv-2".into()],
            answers: answers(json!({
                "kaufpreis": 50000,
                "parteien": { "kaeufer": "Muster GmbH", "verkaeufer": "Beispiel AG" },
                "zahlungsziel": "30 Tage"
            })),
            style_template_id: Some("st-1".to_string()),
            format: ExportFormat::Docx,
        }
    }

    #[test]
    fn test_key_is_64_lowercase_hex() {
        let key = compute_cache_key(&baseline());
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(compute_cache_key(&baseline()), compute_cache_key(&baseline()));
    }

    #[test]
    fn test_key_ignores_clause_order() {
        let mut reordered = baseline();
        reordered.clause_version_ids = vec!["cv-2".into(), "cv-3".into(), "cv-1".into()];
        assert_eq!(compute_cache_key(&baseline()), compute_cache_key(&reordered));
    }

    #[test]
    fn test_key_ignores_answer_key_order_at_every_depth() {
        let mut reordered = baseline();
        reordered.answers = answers(json!({
            "zahlungsziel": "30 Tage",
            "parteien": { "verkaeufer": "Beispiel AG", "kaeufer": "Muster GmbH" },
            "kaufpreis": 50000
        }));
        assert_eq!(compute_cache_key(&baseline()), compute_cache_key(&reordered));
    }

    #[test]
    fn test_key_changes_with_contract_format_style_and_answers() {
        let base = compute_cache_key(&baseline());

        let mut other = baseline();
        other.contract_instance_id = "ci-101".to_string();
        assert_ne!(base, compute_cache_key(&other));

        let mut other = baseline();
        other.format = ExportFormat::Odt;
        assert_ne!(base, compute_cache_key(&other));

        let mut other = baseline();
        other.style_template_id = Some("st-2".to_string());
        assert_ne!(base, compute_cache_key(&other));

        let mut other = baseline();
        other.answers.insert("kaufpreis".to_string(), json!(50001));
        assert_ne!(base, compute_cache_key(&other));

        let mut other = baseline();
        other.answers.insert(
            "parteien".to_string(),
            json!({ "kaeufer": "Andere GmbH", "verkaeufer": "Beispiel AG" }),
        );
        assert_ne!(base, compute_cache_key(&other));
    }

    #[test]
    fn test_missing_style_differs_from_any_real_id() {
        let mut without = baseline();
        without.style_template_id = None;
        let mut literal_null = baseline();
        literal_null.style_template_id = Some("null".to_string());
        assert_ne!(compute_cache_key(&without), compute_cache_key(&literal_null));
        assert_ne!(compute_cache_key(&without), compute_cache_key(&baseline()));
    }

    #[test]
    fn test_duplicate_clause_ids_collapse() {
        let mut duplicated = baseline();
        duplicated.clause_version_ids.push("cv-1".into());
        assert_eq!(compute_cache_key(&baseline()), compute_cache_key(&duplicated));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("DOCX".parse::<ExportFormat>().unwrap(), ExportFormat::Docx);
        assert_eq!("odt".parse::<ExportFormat>().unwrap(), ExportFormat::Odt);
        assert!("pdf".parse::<ExportFormat>().is_err());
    }
}
