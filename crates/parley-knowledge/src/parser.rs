//! Document parsing.
//!
//! Converts raw file bytes into plain text plus optional structure, keyed by
//! file extension:
//!
//! | Extension | Handling |
//! |---|---|
//! | `.txt` | as-is |
//! | `.md` | heading-split sections retained alongside the full text |
//! | `.pdf` | page texts with `[Page N]` markers, via a [`PageExtractor`] |
//! | `.docx` | paragraph texts, via a [`ParagraphExtractor`] |
//! | `.csv` | rows rendered as `key: value` lines; structured rows retained |
//! | `.json` | object flattened to `key: value` lines; value retained |
//!
//! Byte-level PDF/DOCX decoding is intentionally not implemented here; both
//! formats go through extractor seams supplied by the embedding application.
//! Without an extractor those extensions report as unsupported.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::error::{KnowledgeError, Result};

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// A heading-delimited section of a markdown document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Section {
    pub title: String,
    pub level: usize,
    pub content: String,
}

/// The result of parsing one document.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    /// Full plain text, ready for chunking.
    pub text: String,
    /// Markdown sections; empty for other formats.
    pub sections: Vec<Section>,
    /// Structured payload (CSV rows, JSON value) when the format has one.
    pub structured: Option<Value>,
}

// ---------------------------------------------------------------------------
// Extractor seams
// ---------------------------------------------------------------------------

/// Supplies per-page text for PDF bytes.
pub trait PageExtractor: Send + Sync {
    fn pages(&self, bytes: &[u8]) -> Result<Vec<String>>;
}

/// Supplies paragraph text for word-processor documents.
pub trait ParagraphExtractor: Send + Sync {
    fn paragraphs(&self, bytes: &[u8]) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Extension-dispatching document parser.
#[derive(Clone, Default)]
pub struct DocumentParser {
    pdf: Option<Arc<dyn PageExtractor>>,
    docx: Option<Arc<dyn ParagraphExtractor>>,
}

impl DocumentParser {
    /// Parser for the text formats only (txt, md, csv, json).
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a PDF page extractor.
    pub fn with_pdf(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.pdf = Some(extractor);
        self
    }

    /// Attach a DOCX paragraph extractor.
    pub fn with_docx(mut self, extractor: Arc<dyn ParagraphExtractor>) -> Self {
        self.docx = Some(extractor);
        self
    }

    /// Extensions this parser can currently handle.
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut out = vec!["txt", "md", "csv", "json"];
        if self.pdf.is_some() {
            out.push("pdf");
        }
        if self.docx.is_some() {
            out.push("docx");
        }
        out
    }

    /// Parse `bytes` according to the extension of `name`.
    pub fn parse(&self, bytes: &[u8], name: &str) -> Result<ParsedDocument> {
        let extension = name
            .rsplit('.')
            .next()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "txt" => Ok(ParsedDocument {
                text: String::from_utf8_lossy(bytes).into_owned(),
                sections: Vec::new(),
                structured: None,
            }),
            "md" | "markdown" => Ok(parse_markdown(&String::from_utf8_lossy(bytes))),
            "pdf" => match &self.pdf {
                Some(extractor) => parse_pdf(extractor.as_ref(), bytes),
                None => {
                    warn!(name, "pdf extractor not configured");
                    Err(KnowledgeError::UnsupportedFormat { extension })
                }
            },
            "docx" => match &self.docx {
                Some(extractor) => parse_docx(extractor.as_ref(), bytes),
                None => {
                    warn!(name, "docx extractor not configured");
                    Err(KnowledgeError::UnsupportedFormat { extension })
                }
            },
            "csv" => parse_csv(&String::from_utf8_lossy(bytes), name),
            "json" => parse_json(bytes, name),
            _ => Err(KnowledgeError::UnsupportedFormat { extension }),
        }
    }
}

// ---------------------------------------------------------------------------
// Format handlers
// ---------------------------------------------------------------------------

fn parse_markdown(content: &str) -> ParsedDocument {
    let mut sections = Vec::new();
    let mut current = Section {
        title: "Introduction".to_owned(),
        level: 0,
        content: String::new(),
    };

    for line in content.lines() {
        let trimmed = line.trim_start();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
            if !current.content.trim().is_empty() {
                sections.push(current);
            }
            current = Section {
                title: trimmed[hashes..].trim().to_owned(),
                level: hashes,
                content: String::new(),
            };
        } else {
            current.content.push_str(line);
            current.content.push('\n');
        }
    }
    if !current.content.trim().is_empty() {
        sections.push(current);
    }

    ParsedDocument {
        text: content.to_owned(),
        sections,
        structured: None,
    }
}

fn parse_pdf(extractor: &dyn PageExtractor, bytes: &[u8]) -> Result<ParsedDocument> {
    let pages = extractor.pages(bytes)?;
    let text = pages
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.trim().is_empty())
        .map(|(i, p)| format!("[Page {}]\n{}", i + 1, p))
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(ParsedDocument {
        text,
        sections: Vec::new(),
        structured: None,
    })
}

fn parse_docx(extractor: &dyn ParagraphExtractor, bytes: &[u8]) -> Result<ParsedDocument> {
    let paragraphs = extractor.paragraphs(bytes)?;
    let text = paragraphs
        .iter()
        .filter(|p| !p.trim().is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(ParsedDocument {
        text,
        sections: Vec::new(),
        structured: None,
    })
}

fn parse_csv(content: &str, name: &str) -> Result<ParsedDocument> {
    let mut lines = content.lines();
    let header = lines.next().ok_or_else(|| KnowledgeError::CorruptDocument {
        name: name.to_owned(),
        reason: "empty csv".to_owned(),
    })?;
    let columns = split_csv_line(header);

    let mut rows: Vec<Value> = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        let mut row = serde_json::Map::new();
        for (i, column) in columns.iter().enumerate() {
            let value = fields.get(i).cloned().unwrap_or_default();
            row.insert(column.clone(), Value::String(value));
        }
        rows.push(Value::Object(row));
    }

    // Coordinator sheets get the block layout the assistant quotes from;
    // anything else renders generically.
    let text = if columns.iter().any(|c| c == "coordinator_name") {
        let mut out = vec!["Club Coordinators:".to_owned(), String::new()];
        for row in &rows {
            out.push(format!(
                "Event: {}\nCoordinator: {}\nRole: {}\nContact: {}\n",
                field(row, "event_name", "Unknown Event"),
                field(row, "coordinator_name", "Unknown"),
                field(row, "role", "Coordinator"),
                field(row, "contact", "N/A"),
            ));
        }
        out.join("\n")
    } else {
        rows.iter()
            .map(|row| {
                row.as_object()
                    .map(|o| {
                        o.iter()
                            .map(|(k, v)| format!("{k}: {}", v.as_str().unwrap_or_default()))
                            .collect::<Vec<_>>()
                            .join(" | ")
                    })
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    Ok(ParsedDocument {
        text,
        sections: Vec::new(),
        structured: Some(Value::Array(rows)),
    })
}

fn parse_json(bytes: &[u8], name: &str) -> Result<ParsedDocument> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| KnowledgeError::CorruptDocument {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;

    let text = match &value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    };

    Ok(ParsedDocument {
        text,
        sections: Vec::new(),
        structured: Some(value),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn field<'a>(row: &'a Value, key: &str, default: &'a str) -> &'a str {
    row.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

/// Minimal quote-aware CSV field splitter.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_owned());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_owned());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn markdown_splits_on_headings() {
        let doc = DocumentParser::new()
            .parse(
                b"intro text\n# Events\nRoboSprint in March.\n## Details\nArena rules.\n",
                "events.md",
            )
            .unwrap();
        assert_eq!(doc.sections.len(), 3);
        assert_eq!(doc.sections[0].title, "Introduction");
        assert_eq!(doc.sections[1].title, "Events");
        assert_eq!(doc.sections[1].level, 1);
        assert_eq!(doc.sections[2].title, "Details");
        assert_eq!(doc.sections[2].level, 2);
        assert!(doc.text.contains("RoboSprint"));
    }

    #[test]
    fn csv_coordinator_sheet_renders_blocks() {
        let csv = "event_name,coordinator_name,role,contact\n\
                   RoboSprint,Priya Nair,Lead Coordinator,priya@club.example\n\
                   LineTrace,Arjun Rao,Coordinator,arjun@club.example\n";
        let doc = DocumentParser::new().parse(csv.as_bytes(), "coordinators.csv").unwrap();
        assert!(doc.text.contains("Event: RoboSprint"));
        assert!(doc.text.contains("Coordinator: Priya Nair"));
        let rows = doc.structured.unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
    }

    #[test]
    fn csv_generic_renders_key_value_lines() {
        let csv = "name,qty\nservo,4\nlidar,1\n";
        let doc = DocumentParser::new().parse(csv.as_bytes(), "parts.csv").unwrap();
        assert!(doc.text.contains("name: servo | qty: 4"));
    }

    #[test]
    fn csv_quoted_fields_keep_commas() {
        let csv = "name,notes\nchassis,\"aluminium, 2mm\"\n";
        let doc = DocumentParser::new().parse(csv.as_bytes(), "parts.csv").unwrap();
        assert!(doc.text.contains("notes: aluminium, 2mm"));
    }

    #[test]
    fn json_object_flattens_and_retains_value() {
        let doc = DocumentParser::new()
            .parse(
                br#"{"event_name": "RoboSprint", "year": 2026}"#,
                "metadata.json",
            )
            .unwrap();
        assert!(doc.text.contains("event_name: RoboSprint"));
        assert!(doc.text.contains("year: 2026"));
        assert_eq!(doc.structured.unwrap()["year"], json!(2026));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = DocumentParser::new().parse(b"...", "slides.pptx").unwrap_err();
        assert!(matches!(err, KnowledgeError::UnsupportedFormat { .. }));
    }

    #[test]
    fn pdf_without_extractor_is_unsupported() {
        let err = DocumentParser::new().parse(b"%PDF-1.7", "paper.pdf").unwrap_err();
        assert!(matches!(err, KnowledgeError::UnsupportedFormat { .. }));
    }

    #[test]
    fn pdf_extractor_gets_page_markers() {
        struct TwoPages;
        impl PageExtractor for TwoPages {
            fn pages(&self, _bytes: &[u8]) -> Result<Vec<String>> {
                Ok(vec!["first page".into(), "second page".into()])
            }
        }
        let parser = DocumentParser::new().with_pdf(Arc::new(TwoPages));
        let doc = parser.parse(b"%PDF-1.7", "paper.pdf").unwrap();
        assert!(doc.text.contains("[Page 1]\nfirst page"));
        assert!(doc.text.contains("[Page 2]\nsecond page"));
    }

    #[test]
    fn corrupt_json_is_reported() {
        let err = DocumentParser::new().parse(b"{not json", "meta.json").unwrap_err();
        assert!(matches!(err, KnowledgeError::CorruptDocument { .. }));
    }
}
