//! Text extraction from uploaded files.
//!
//! [`FormatParser`] picks an extractor by file extension:
//!
//! | Extension | Extractor |
//! |-----------|-----------|
//! | `.txt .md .markdown .csv .json .log` | UTF-8 decode (invalid UTF-8 is an error) |
//! | `.pdf` | `pdf-extract` |
//! | `.docx` | `word/document.xml`, one paragraph per `<w:p>` |
//! | `.pptx` | `ppt/slides/slideN.xml`, one block per slide |
//! | `.xlsx` | shared-string cells, one line per row, one block per sheet |
//!
//! OOXML parts are read with a size cap (zip-bomb protection). Paragraph
//! breaks are emitted as blank lines so the chunker sees document structure.
//! Extraction never panics; failures come back as [`ExtractError`].

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;

use ragnetic_core::models::{Metadata, MetadataValue};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "csv", "json", "log"];

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedFormat(String),
    InvalidUtf8(String),
    Pdf(String),
    Ooxml(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedFormat(name) => write!(f, "unsupported file type: {}", name),
            ExtractError::InvalidUtf8(e) => write!(f, "text is not valid UTF-8: {}", e),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extracted text plus parser metadata (`format`, `char_count`, and
/// `slide_count` / `sheet_count` where the format has them).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub text: String,
    pub metadata: Metadata,
}

/// Turns raw bytes into text. Implementations are synchronous and may be
/// CPU-heavy; the pipeline runs them on the blocking pool.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, bytes: &[u8], filename: &str) -> anyhow::Result<ParsedDocument>;
}

/// Extension-dispatching parser for the formats listed in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatParser;

impl DocumentParser for FormatParser {
    fn parse(&self, bytes: &[u8], filename: &str) -> anyhow::Result<ParsedDocument> {
        Ok(parse_bytes(bytes, filename)?)
    }
}

/// Lowercased extension of `filename`, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Whether [`FormatParser`] knows how to read `filename`.
pub fn is_supported(filename: &str) -> bool {
    matches!(
        extension_of(filename).as_deref(),
        Some(ext) if TEXT_EXTENSIONS.contains(&ext) || matches!(ext, "pdf" | "docx" | "pptx" | "xlsx")
    )
}

/// MIME type for `filename`, used when writing objects to storage.
pub fn content_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("pdf") => "application/pdf",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("pptx") => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        }
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("md") | Some("markdown") => "text/markdown",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn parse_bytes(bytes: &[u8], filename: &str) -> Result<ParsedDocument, ExtractError> {
    let ext = extension_of(filename)
        .ok_or_else(|| ExtractError::UnsupportedFormat(filename.to_string()))?;

    let mut metadata = Metadata::new();
    let text = match ext.as_str() {
        e if TEXT_EXTENSIONS.contains(&e) => String::from_utf8(bytes.to_vec())
            .map_err(|err| ExtractError::InvalidUtf8(err.to_string()))?,
        "pdf" => extract_pdf(bytes)?,
        "docx" => extract_docx(bytes)?,
        "pptx" => {
            let (text, slides) = extract_pptx(bytes)?;
            metadata.insert("slide_count".to_string(), slides.into());
            text
        }
        "xlsx" => {
            let (text, sheets) = extract_xlsx(bytes)?;
            metadata.insert("sheet_count".to_string(), sheets.into());
            text
        }
        _ => return Err(ExtractError::UnsupportedFormat(filename.to_string())),
    };

    metadata.insert("format".to_string(), MetadataValue::from(ext));
    metadata.insert("char_count".to_string(), text.chars().count().into());
    Ok(ParsedDocument { text, metadata })
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
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

/// Numbered parts like `ppt/slides/slide12.xml`, in numeric order.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<text_tag>` element, ending each
/// `<para_tag>` element with `para_sep`.
fn collect_runs(xml: &[u8], text_tag: &[u8], para_tag: &[u8], para_sep: &str) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == text_tag => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if name.as_ref() == para_tag && !out.is_empty() && !out.ends_with(para_sep) {
                    out.push_str(para_sep);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    collect_runs(&xml, b"t", b"p", "\n\n")
}

fn extract_pptx(bytes: &[u8]) -> Result<(String, usize), ExtractError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_parts(&archive, "ppt/slides/slide");
    let mut blocks = Vec::with_capacity(slides.len());
    for name in &slides {
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let text = collect_runs(&xml, b"t", b"p", "\n")?;
        if !text.is_empty() {
            blocks.push(text);
        }
    }
    Ok((blocks.join("\n\n"), slides.len()))
}

fn extract_xlsx(bytes: &[u8]) -> Result<(String, usize), ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheets = numbered_parts(&archive, "xl/worksheets/sheet");
    let mut blocks = Vec::new();
    for name in sheets.iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let text = extract_sheet_rows(&xml, &shared_strings)?;
        if !text.is_empty() {
            blocks.push(text);
        }
    }
    Ok((blocks.join("\n\n"), sheets.len().min(XLSX_MAX_SHEETS)))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Shared-string cells of one sheet: cells joined by spaces, rows by newlines.
fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_v = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_v && cell_is_shared_str => {
                let v = te.unescape().unwrap_or_default();
                if let Some(s) = v.trim().parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                    row.push(s.clone());
                    cell_count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"c" => cell_is_shared_str = false,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row).join(" ")),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" "));
    }
    Ok(rows.join("\n"))
}
