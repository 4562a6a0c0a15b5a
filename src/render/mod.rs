//! Rendering of a resolved contract into DOCX or ODT bytes.

pub mod engine;

use regex::{Captures, Regex};
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::cache_key::ExportFormat;
use crate::converter::OdtConverter;
use crate::error::RenderError;
use crate::loader::ExportData;

use self::engine::DocumentEngine;

/// Stand-in for an answer the user has not given yet.
pub const UNANSWERED: &str = "[___]";

fn parameter_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("parameter pattern is a valid regex")
    })
}

fn answer_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Replaces every `{{key}}` in `content` with the answer for `key`.
///
/// Missing, `null` and empty-string answers become [`UNANSWERED`]. Single-brace
/// `{key}` sequences are left for the document engine.
pub fn substitute_parameters(content: &str, answers: &Map<String, Value>) -> String {
    parameter_pattern()
        .replace_all(content, |caps: &Captures<'_>| {
            answers
                .get(&caps[1])
                .and_then(answer_text)
                .unwrap_or_else(|| UNANSWERED.to_string())
        })
        .into_owned()
}

/// Builds the flat render context for the document engine.
///
/// Sections are numbered from 1 in load order, empty ones included; clauses
/// are numbered `"{section}.{index}"` within their section.
pub fn build_context(data: &ExportData) -> Value {
    let sections: Vec<Value> = data
        .sections
        .iter()
        .enumerate()
        .map(|(s, section)| {
            let section_number = s + 1;
            let clauses: Vec<Value> = section
                .clauses
                .iter()
                .enumerate()
                .map(|(c, clause)| {
                    json!({
                        "number": format!("{section_number}.{}", c + 1),
                        "content": substitute_parameters(&clause.content, &data.answers),
                    })
                })
                .collect();
            json!({
                "number": section_number,
                "title": section.title,
                "clauses": clauses,
            })
        })
        .collect();

    let mut context = Map::new();
    context.insert("contractTitle".into(), Value::String(data.contract_title.clone()));
    context.insert(
        "clientReference".into(),
        data.client_reference.clone().map(Value::String).unwrap_or(Value::Null),
    );
    for (key, value) in &data.answers {
        context.insert(format!("answer_{key}"), value.clone());
    }
    context.insert("sections".into(), Value::Array(sections));
    Value::Object(context)
}

/// Produces document bytes from an [`ExportData`] and a template buffer.
pub struct Renderer {
    engine: Arc<dyn DocumentEngine>,
    converter: Arc<dyn OdtConverter>,
}

impl Renderer {
    pub fn new(engine: Arc<dyn DocumentEngine>, converter: Arc<dyn OdtConverter>) -> Self {
        Self { engine, converter }
    }

    pub async fn render(
        &self,
        data: &ExportData,
        template: Arc<[u8]>,
        format: ExportFormat,
    ) -> Result<Vec<u8>, RenderError> {
        let context = build_context(data);
        let engine = Arc::clone(&self.engine);

        // Zip inflate/deflate is CPU bound.
        let docx = tokio::task::spawn_blocking(move || engine.render(&template, &context))
            .await
            .map_err(|e| RenderError::Task(e.to_string()))??;
        debug!(bytes = docx.len(), %format, "rendered DOCX");

        match format {
            ExportFormat::Docx => Ok(docx),
            ExportFormat::Odt => self.converter.convert(docx).await,
        }
    }
}
