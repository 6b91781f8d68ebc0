//! Multi-format content extraction for uploaded documents.
//!
//! Dispatch is polymorphic over file extension/MIME through the
//! [`ExtractionHandler`] registry. The pipeline entry point
//! [`extract_content`] never fails: handler errors degrade to an empty item
//! list so downstream stages can detect "zero content" without crashing the
//! consumer.
//!
//! | Handler | Unit | `can_split` |
//! |---------|------|-------------|
//! | PDF | page | yes |
//! | DOCX | document | yes |
//! | PPTX | slide | yes |
//! | XLSX | sheet | no |
//! | CSV | row | no |
//! | PlainText | document | yes |

use std::io::Read;

use crate::models::ContentItem;

/// Supported MIME types for extraction.
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_CSV: &str = "text/csv";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Minimum decode confidence for plain-text encoding sniffing.
const MIN_ENCODING_CONFIDENCE: f64 = 0.7;

/// Extraction error. Handlers return it; the dispatcher downgrades it to an
/// empty result.
#[derive(Debug)]
pub enum ExtractError {
    UnsupportedFormat(String),
    Pdf(String),
    Ooxml(String),
    Csv(String),
    Encoding(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedFormat(k) => write!(f, "unsupported format: {}", k),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
            ExtractError::Csv(e) => write!(f, "CSV extraction failed: {}", e),
            ExtractError::Encoding(e) => write!(f, "encoding detection failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// A format handler. Implementations are registered in a [`HandlerRegistry`]
/// and selected by extension/MIME; the registry is open for new formats.
pub trait ExtractionHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, key: &str, mime: &str) -> bool;
    fn extract(&self, bytes: &[u8], key: &str) -> Result<Vec<ContentItem>, ExtractError>;
}

/// Registry of format handlers, checked in registration order.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn ExtractionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Registry with all built-in handlers. PlainText is last so specific
    /// formats win on extension.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PdfHandler));
        registry.register(Box::new(DocxHandler));
        registry.register(Box::new(PptxHandler));
        registry.register(Box::new(XlsxHandler));
        registry.register(Box::new(CsvHandler));
        registry.register(Box::new(PlainTextHandler));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn ExtractionHandler>) {
        self.handlers.push(handler);
    }

    pub fn find(&self, key: &str, mime: &str) -> Option<&dyn ExtractionHandler> {
        self.handlers
            .iter()
            .find(|h| h.matches(key, mime))
            .map(|h| h.as_ref())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn extension(key: &str) -> String {
    key.rsplit('.').next().unwrap_or("").to_ascii_lowercase()
}

/// Extract content items from object bytes. Never fails: unknown formats and
/// handler errors return an empty slice (logged at warn) so the consumer can
/// treat "zero content" as a data condition rather than a crash.
pub fn extract_content(
    registry: &HandlerRegistry,
    bytes: &[u8],
    key: &str,
    mime: &str,
) -> Vec<ContentItem> {
    let Some(handler) = registry.find(key, mime) else {
        tracing::warn!(key, mime, "no extraction handler; emitting zero content");
        return Vec::new();
    };
    match handler.extract(bytes, key) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(key, handler = handler.name(), error = %e, "extraction degraded to empty content");
            Vec::new()
        }
    }
}

// ============ PDF ============

pub struct PdfHandler;

impl ExtractionHandler for PdfHandler {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn matches(&self, key: &str, mime: &str) -> bool {
        mime == MIME_PDF || extension(key) == "pdf"
    }

    fn extract(&self, bytes: &[u8], _key: &str) -> Result<Vec<ContentItem>, ExtractError> {
        let doc = lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
        let mut items = Vec::new();
        for (page_num, _page_id) in doc.get_pages() {
            // A single unreadable page should not sink the document.
            let text = match doc.extract_text(&[page_num]) {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(page = page_num, error = %e, "skipping unreadable PDF page");
                    continue;
                }
            };
            let text = normalize_whitespace(&text);
            if text.is_empty() {
                continue;
            }
            items.push(ContentItem::new(
                text,
                serde_json::json!({"page": page_num}),
                true,
            ));
        }
        Ok(items)
    }
}

// ============ DOCX ============

pub struct DocxHandler;

impl ExtractionHandler for DocxHandler {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn matches(&self, key: &str, mime: &str) -> bool {
        mime == MIME_DOCX || extension(key) == "docx"
    }

    fn extract(&self, bytes: &[u8], _key: &str) -> Result<Vec<ContentItem>, ExtractError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
        let text = collect_text_elements(&doc_xml)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ContentItem::new(
            text,
            serde_json::json!({"section": 1}),
            true,
        )])
    }
}

// ============ PPTX ============

pub struct PptxHandler;

impl ExtractionHandler for PptxHandler {
    fn name(&self) -> &'static str {
        "pptx"
    }

    fn matches(&self, key: &str, mime: &str) -> bool {
        mime == MIME_PPTX || extension(key) == "pptx"
    }

    fn extract(&self, bytes: &[u8], _key: &str) -> Result<Vec<ContentItem>, ExtractError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        let mut slide_names: Vec<String> = archive
            .file_names()
            .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
            .map(|s| s.to_string())
            .collect();
        slide_names.sort_by_key(|name| {
            name.trim_start_matches("ppt/slides/slide")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        });

        let mut items = Vec::new();
        for (idx, name) in slide_names.iter().enumerate() {
            let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
            let text = collect_text_elements(&xml)?;
            if text.is_empty() {
                continue;
            }
            items.push(ContentItem::new(
                text,
                serde_json::json!({"slide": idx + 1}),
                true,
            ));
        }
        Ok(items)
    }
}

// ============ XLSX ============

pub struct XlsxHandler;

impl ExtractionHandler for XlsxHandler {
    fn name(&self) -> &'static str {
        "xlsx"
    }

    fn matches(&self, key: &str, mime: &str) -> bool {
        mime == MIME_XLSX || extension(key) == "xlsx"
    }

    fn extract(&self, bytes: &[u8], _key: &str) -> Result<Vec<ContentItem>, ExtractError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        let shared_strings = read_shared_strings(&mut archive)?;
        let sheet_names = list_worksheet_names(&mut archive)?;

        let mut items = Vec::new();
        for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
            let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
            let cells = extract_sheet_cells(&sheet_xml, &shared_strings)?;
            if cells.is_empty() {
                continue;
            }
            let sheet = name
                .trim_start_matches("xl/worksheets/")
                .trim_end_matches(".xml")
                .to_string();
            // Tabular content: sentence splitting would shred rows.
            items.push(ContentItem::new(
                cells,
                serde_json::json!({"sheet": sheet}),
                false,
            ));
        }
        Ok(items)
    }
}

// ============ CSV ============

pub struct CsvHandler;

impl ExtractionHandler for CsvHandler {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn matches(&self, key: &str, mime: &str) -> bool {
        mime == MIME_CSV || extension(key) == "csv"
    }

    fn extract(&self, bytes: &[u8], _key: &str) -> Result<Vec<ContentItem>, ExtractError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut items = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
            let line = record.iter().collect::<Vec<_>>().join(", ");
            if line.trim().is_empty() {
                continue;
            }
            items.push(ContentItem::new(
                line,
                serde_json::json!({"row": row + 1}),
                false,
            ));
        }
        Ok(items)
    }
}

// ============ Plain text ============

pub struct PlainTextHandler;

impl ExtractionHandler for PlainTextHandler {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn matches(&self, key: &str, mime: &str) -> bool {
        mime.starts_with("text/")
            || mime == "application/json"
            || matches!(extension(key).as_str(), "txt" | "md" | "json" | "log")
    }

    fn extract(&self, bytes: &[u8], _key: &str) -> Result<Vec<ContentItem>, ExtractError> {
        let (text, encoding, confidence) = sniff_and_decode(bytes)?;
        if confidence <= MIN_ENCODING_CONFIDENCE {
            return Err(ExtractError::Encoding(format!(
                "best candidate {} below confidence threshold ({:.2})",
                encoding, confidence
            )));
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ContentItem::new(
            text,
            serde_json::json!({"char": 0}),
            true,
        )])
    }
}

/// Try common encodings and score each decode; returns the best candidate.
///
/// Confidence is 1.0 for error-free UTF-8 and degrades with the ratio of
/// replacement characters and C0 control bytes for the fallback encodings.
fn sniff_and_decode(bytes: &[u8]) -> Result<(String, &'static str, f64), ExtractError> {
    if bytes.is_empty() {
        return Ok((String::new(), "utf-8", 1.0));
    }

    let candidates: [(&'static str, &'static encoding_rs::Encoding); 4] = [
        ("utf-8", encoding_rs::UTF_8),
        ("utf-16le", encoding_rs::UTF_16LE),
        ("utf-16be", encoding_rs::UTF_16BE),
        ("windows-1252", encoding_rs::WINDOWS_1252),
    ];

    let mut best: Option<(String, &'static str, f64)> = None;
    for (name, encoding) in candidates {
        let (decoded, _, had_errors) = encoding.decode(bytes);
        let confidence = decode_confidence(&decoded, had_errors, name == "utf-8");
        if best.as_ref().map(|(_, _, c)| confidence > *c).unwrap_or(true) {
            best = Some((decoded.into_owned(), name, confidence));
        }
    }

    best.ok_or_else(|| ExtractError::Encoding("no decode candidate".to_string()))
}

fn decode_confidence(decoded: &str, had_errors: bool, is_utf8: bool) -> f64 {
    if decoded.is_empty() {
        return 0.0;
    }
    let total = decoded.chars().count() as f64;
    let replacements = decoded.chars().filter(|&c| c == '\u{FFFD}').count() as f64;
    let controls = decoded
        .chars()
        .filter(|&c| c.is_control() && c != '\n' && c != '\r' && c != '\t')
        .count() as f64;
    let penalty = (replacements + controls) / total;
    // Clean UTF-8 outranks an equally clean fallback decode.
    let base = if is_utf8 && !had_errors { 1.0 } else { 0.95 };
    (base - penalty - if had_errors { 0.1 } else { 0.0 }).max(0.0)
}

// ============ Shared OOXML helpers ============

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Collect the text of every `<t>` element (covers `w:t` in DOCX and `a:t`
/// in PPTX), space-joined.
fn collect_text_elements(xml: &[u8]) -> Result<String, ExtractError> {
    let mut parts: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        let text = te.unescape().unwrap_or_default();
                        if !text.trim().is_empty() {
                            parts.push(text.trim().to_string());
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(parts.join(" "))
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        strings.push(te.unescape().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    Ok(names)
}

fn extract_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() {
                    if cell_is_shared_str {
                        if let Ok(i) = s.parse::<usize>() {
                            if i < shared_strings.len() {
                                cells.push(shared_strings[i].clone());
                                cell_count += 1;
                            }
                        }
                    } else {
                        cells.push(s.to_string());
                        cell_count += 1;
                    }
                }
                in_v = false;
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_never_fails_on_garbage() {
        let registry = HandlerRegistry::with_builtins();
        assert!(extract_content(&registry, b"not a pdf", "x.pdf", MIME_PDF).is_empty());
        assert!(extract_content(&registry, b"not a zip", "x.docx", MIME_DOCX).is_empty());
        assert!(extract_content(&registry, b"bytes", "x.weird", "application/octet-stream").is_empty());
    }

    #[test]
    fn registry_dispatches_by_extension_and_mime() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.find("a.PDF", "").unwrap().name(), "pdf");
        assert_eq!(registry.find("a.bin", MIME_XLSX).unwrap().name(), "xlsx");
        assert_eq!(registry.find("a.csv", "").unwrap().name(), "csv");
        assert_eq!(registry.find("notes.md", "").unwrap().name(), "plain_text");
        assert!(registry.find("a.bin", "application/octet-stream").is_none());
    }

    #[test]
    fn csv_rows_become_unsplittable_items() {
        let registry = HandlerRegistry::with_builtins();
        let items = extract_content(
            &registry,
            b"name,city\nada,london\n",
            "people.csv",
            MIME_CSV,
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "name, city");
        assert_eq!(items[1].content, "ada, london");
        assert!(!items[0].can_split);
        assert_eq!(items[1].location, serde_json::json!({"row": 2}));
    }

    #[test]
    fn plain_text_utf8_full_confidence() {
        let registry = HandlerRegistry::with_builtins();
        let items = extract_content(&registry, "héllo world".as_bytes(), "a.txt", "text/plain");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "héllo world");
        assert!(items[0].can_split);
    }

    #[test]
    fn plain_text_utf16le_decodes() {
        let text = "utf sixteen text";
        let mut bytes = Vec::new();
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let (decoded, _, confidence) = sniff_and_decode(&bytes).unwrap();
        // UTF-16LE decode of ASCII has no replacement chars; the interleaved
        // NULs sink the UTF-8 candidate instead.
        assert!(confidence > MIN_ENCODING_CONFIDENCE);
        assert_eq!(decoded, text);
    }

    #[test]
    fn low_confidence_decode_is_rejected() {
        // Control-character soup decodes "cleanly" in every candidate but the
        // control penalty keeps confidence below the threshold.
        let bytes: Vec<u8> = (0..200).map(|i: i32| (i * 7 % 32) as u8).collect();
        let result = PlainTextHandler.extract(&bytes, "a.txt");
        assert!(matches!(result, Err(ExtractError::Encoding(_))));
    }

    #[test]
    fn whitespace_normalization() {
        assert_eq!(normalize_whitespace("a\n  b\t c "), "a b c");
    }
}
