//! DOCX template engine.
//!
//! A DOCX file is a zip archive; the engine rewrites the WordprocessingML
//! parts (`word/document.xml`, headers, footers) and copies every other entry
//! unchanged. Template syntax inside those parts:
//!
//! - `{name}` inserts a value (XML-escaped, `\n` becomes a line break)
//! - `{#name}…{/name}` repeats for each array item, or renders once for any
//!   other truthy value
//! - `{^name}…{/name}` renders only when `name` is falsy or an empty array
//!
//! Lookups walk from the innermost section scope outwards; `a.b` walks into
//! objects and `.` is the current item. Tags must sit inside a single
//! `<w:t xml:space="preserve">` run.

use serde_json::Value;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::RenderError;

/// Main document part of a DOCX archive.
pub const DOCUMENT_PART: &str = "word/document.xml";

/// Turns a template buffer and a render context into document bytes.
pub trait DocumentEngine: Send + Sync {
    fn render(&self, template: &[u8], context: &Value) -> Result<Vec<u8>, RenderError>;
}

/// Template engine for DOCX archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocxTemplateEngine;

impl DocxTemplateEngine {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentEngine for DocxTemplateEngine {
    fn render(&self, template: &[u8], context: &Value) -> Result<Vec<u8>, RenderError> {
        let mut archive = ZipArchive::new(Cursor::new(template))?;
        if !archive.file_names().any(|name| name == DOCUMENT_PART) {
            return Err(RenderError::MissingPart(DOCUMENT_PART.to_string()));
        }

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            if entry.is_dir() {
                writer.add_directory(name, file_options())?;
                continue;
            }

            let mut raw = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut raw)?;

            let out = if is_templated_part(&name) {
                let xml = String::from_utf8(raw)
                    .map_err(|e| RenderError::Template(format!("{name} is not UTF-8: {e}")))?;
                render_text(&xml, context)?.into_bytes()
            } else {
                raw
            };

            writer.start_file(name, file_options())?;
            writer.write_all(&out)?;
        }

        Ok(writer.finish()?.into_inner())
    }
}

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn is_templated_part(name: &str) -> bool {
    name == DOCUMENT_PART
        || (name.starts_with("word/header") && name.ends_with(".xml"))
        || (name.starts_with("word/footer") && name.ends_with(".xml"))
}

/// Reads the main document part back out of a DOCX buffer.
pub fn extract_document_xml(docx: &[u8]) -> Result<String, RenderError> {
    let mut archive = ZipArchive::new(Cursor::new(docx))?;
    let mut entry = archive
        .by_name(DOCUMENT_PART)
        .map_err(|_| RenderError::MissingPart(DOCUMENT_PART.to_string()))?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;
    Ok(xml)
}

const BUILTIN_CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;

const BUILTIN_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#;

const BUILTIN_DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:t xml:space="preserve">{contractTitle}</w:t></w:r></w:p>{#clientReference}<w:p><w:r><w:t xml:space="preserve">Referenz: {clientReference}</w:t></w:r></w:p>{/clientReference}{#sections}<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t xml:space="preserve">{number}. {title}</w:t></w:r></w:p>{#clauses}<w:p><w:r><w:t xml:space="preserve">{number} {content}</w:t></w:r></w:p>{/clauses}{/sections}<w:sectPr/></w:body></w:document>"#;

/// Minimal DOCX template used when no default template is configured.
pub fn builtin_template() -> Result<Vec<u8>, RenderError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in [
        ("[Content_Types].xml", BUILTIN_CONTENT_TYPES),
        ("_rels/.rels", BUILTIN_RELS),
        (DOCUMENT_PART, BUILTIN_DOCUMENT),
    ] {
        writer.start_file(name, file_options())?;
        writer.write_all(body.as_bytes())?;
    }
    Ok(writer.finish()?.into_inner())
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Tag(String),
    Section {
        name: String,
        inverted: bool,
        children: Vec<Node>,
    },
}

/// Renders template text against `context`.
pub fn render_text(template: &str, context: &Value) -> Result<String, RenderError> {
    let nodes = parse(template)?;
    let mut out = String::with_capacity(template.len());
    let mut scopes = vec![context];
    render_nodes(&nodes, &mut scopes, &mut out);
    Ok(out)
}

fn is_tag_name(name: &str) -> bool {
    if name == "." {
        return true;
    }
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Open section while parsing: name, inverted flag, children so far.
type OpenSection = (String, bool, Vec<Node>);

fn innermost<'a>(root: &'a mut Vec<Node>, open: &'a mut [OpenSection]) -> &'a mut Vec<Node> {
    match open.last_mut() {
        Some(section) => &mut section.2,
        None => root,
    }
}

fn parse(template: &str) -> Result<Vec<Node>, RenderError> {
    let mut root = Vec::new();
    let mut open: Vec<OpenSection> = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find('{') {
        text.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let Some(close) = after.find('}') else {
            text.push('{');
            rest = after;
            continue;
        };
        let inner = &after[..close];
        let (kind, name) = match inner.chars().next() {
            Some(c @ ('#' | '^' | '/')) => (Some(c), &inner[1..]),
            _ => (None, inner),
        };

        if !is_tag_name(name) {
            // Not a tag: keep the brace literally and continue after it.
            text.push('{');
            rest = after;
            continue;
        }

        if !text.is_empty() {
            innermost(&mut root, &mut open).push(Node::Text(std::mem::take(&mut text)));
        }

        match kind {
            None => innermost(&mut root, &mut open).push(Node::Tag(name.to_string())),
            Some('/') => {
                let Some((open_name, inverted, children)) = open.pop() else {
                    return Err(RenderError::Template(format!("unexpected closing tag {{/{name}}}")));
                };
                if open_name != name {
                    return Err(RenderError::Template(format!(
                        "section {{#{open_name}}} closed by {{/{name}}}"
                    )));
                }
                innermost(&mut root, &mut open).push(Node::Section {
                    name: open_name,
                    inverted,
                    children,
                });
            }
            Some(c) => open.push((name.to_string(), c == '^', Vec::new())),
        }
        rest = &after[close + 1..];
    }
    text.push_str(rest);

    if let Some((open_name, _, _)) = open.last() {
        return Err(RenderError::Template(format!("section {{#{open_name}}} is never closed")));
    }
    if !text.is_empty() {
        root.push(Node::Text(text));
    }
    Ok(root)
}

fn lookup<'a>(scopes: &[&'a Value], name: &str) -> Option<&'a Value> {
    if name == "." {
        return scopes.last().copied();
    }
    let mut parts = name.split('.');
    let head = parts.next()?;
    let mut value = scopes.iter().rev().find_map(|scope| scope.get(head))?;
    for part in parts {
        value = value.get(part)?;
    }
    Some(value)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

fn render_nodes<'a>(nodes: &[Node], scopes: &mut Vec<&'a Value>, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Tag(name) => {
                if let Some(value) = lookup(scopes, name) {
                    push_escaped(value, out);
                }
            }
            Node::Section {
                name,
                inverted,
                children,
            } => {
                let value = lookup(scopes, name);
                if *inverted {
                    if !is_truthy(value) {
                        render_nodes(children, scopes, out);
                    }
                    continue;
                }
                match value {
                    Some(Value::Array(items)) => {
                        for item in items {
                            scopes.push(item);
                            render_nodes(children, scopes, out);
                            scopes.pop();
                        }
                    }
                    Some(v) if is_truthy(Some(v)) => {
                        scopes.push(v);
                        render_nodes(children, scopes, out);
                        scopes.pop();
                    }
                    _ => {}
                }
            }
        }
    }
}

fn push_escaped(value: &Value, out: &mut String) {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return,
    };
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push_str(r#"</w:t><w:br/><w:t xml:space="preserve">"#);
        }
        for c in line.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&apos;"),
                '\r' => {}
                c => out.push(c),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_tags_and_escaping() {
        let out = render_text("<w:t>{title}</w:t>", &json!({ "title": "A & B <GmbH>" })).unwrap();
        assert_eq!(out, "<w:t>A &amp; B &lt;GmbH&gt;</w:t>");
    }

    #[test]
    fn test_missing_and_null_values_render_empty() {
        let out = render_text("[{missing}][{none}]", &json!({ "none": null })).unwrap();
        assert_eq!(out, "[][]");
    }

    #[test]
    fn test_sections_iterate_with_inner_scope_first() {
        let context = json!({
            "number": "outer",
            "sections": [
                { "number": 1, "clauses": [{ "number": "1.1" }, { "number": "1.2" }] },
                { "number": 2, "clauses": [] }
            ]
        });
        let out = render_text("{#sections}<{number}:{#clauses}{number},{/clauses}>{/sections}", &context).unwrap();
        assert_eq!(out, "<1:1.1,1.2,><2:>");
    }

    #[test]
    fn test_inverted_section() {
        let template = "{#items}x{/items}{^items}leer{/items}";
        assert_eq!(render_text(template, &json!({ "items": [] })).unwrap(), "leer");
        assert_eq!(render_text(template, &json!({ "items": [1, 2] })).unwrap(), "xx");
    }

    #[test]
    fn test_truthy_scalar_section_falls_back_to_outer_scope() {
        let template = "{#ref}Ref: {ref}{/ref}";
        assert_eq!(render_text(template, &json!({ "ref": "K-1" })).unwrap(), "Ref: K-1");
        assert_eq!(render_text(template, &json!({ "ref": null })).unwrap(), "");
    }

    #[test]
    fn test_dotted_and_current_item_lookup() {
        let context = json!({ "party": { "name": "Muster GmbH" }, "tags": ["a", "b"] });
        assert_eq!(render_text("{party.name}", &context).unwrap(), "Muster GmbH");
        assert_eq!(render_text("{#tags}[{.}]{/tags}", &context).unwrap(), "[a][b]");
    }

    #[test]
    fn test_non_tag_braces_are_literal() {
        let out = render_text("{ not a tag } {{x}} {", &json!({ "x": "v" })).unwrap();
        assert_eq!(out, "{ not a tag } {v} {");
    }

    #[test]
    fn test_newlines_become_breaks() {
        let out = render_text("{text}", &json!({ "text": "a\nb" })).unwrap();
        assert_eq!(out, r#"a</w:t><w:br/><w:t xml:space="preserve">b"#);
    }

    #[test]
    fn test_unbalanced_sections_are_errors() {
        assert!(render_text("{#a}x", &json!({})).is_err());
        assert!(render_text("x{/a}", &json!({})).is_err());
        assert!(render_text("{#a}{/b}", &json!({})).is_err());
    }

    #[test]
    fn test_engine_renders_builtin_template() {
        let template = builtin_template().unwrap();
        let context = json!({
            "contractTitle": "Kaufvertrag",
            "clientReference": "K-17",
            "sections": [
                { "number": 1, "title": "Gegenstand", "clauses": [{ "number": "1.1", "content": "Der Verkäufer verkauft." }] }
            ]
        });

        let docx = DocxTemplateEngine::new().render(&template, &context).unwrap();
        let xml = extract_document_xml(&docx).unwrap();
        assert!(xml.contains("Kaufvertrag"));
        assert!(xml.contains("Referenz: K-17"));
        assert!(xml.contains("1. Gegenstand"));
        assert!(xml.contains("1.1 Der Verkäufer verkauft."));
        assert!(!xml.contains("{contractTitle}"));

        // Untemplated parts are carried over unchanged.
        let mut archive = ZipArchive::new(Cursor::new(&docx[..])).unwrap();
        let mut rels = String::new();
        archive.by_name("_rels/.rels").unwrap().read_to_string(&mut rels).unwrap();
        assert_eq!(rels, BUILTIN_RELS);
    }

    #[test]
    fn test_engine_rejects_archive_without_document() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("other.xml", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"<x/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let result = DocxTemplateEngine::new().render(&bytes, &json!({}));
        assert!(matches!(result, Err(RenderError::MissingPart(_))));
    }

    #[test]
    fn test_engine_rejects_non_zip_input() {
        let result = DocxTemplateEngine::new().render(b"not a zip", &json!({}));
        assert!(matches!(result, Err(RenderError::Archive(_))));
    }
}
