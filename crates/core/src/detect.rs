//! Source format detection via magic bytes, archive probing, file extension, and content heuristics.

use std::io::{Read, Seek};
use std::path::Path;

use crate::book::SourceFormat;
use crate::error::DetectError;

/// The result of format detection.
#[derive(Debug, Clone)]
pub struct DetectResult {
    pub format: SourceFormat,
    pub confidence: f64,
    pub mime_type: &'static str,
}

impl SourceFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            SourceFormat::Epub => "application/epub+zip",
            SourceFormat::Txt => "text/plain",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SourceFormat::Epub => "epub",
            SourceFormat::Txt => "txt",
        }
    }
}

/// Extensions the upload directory scan considers ingestible.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["epub", "txt"];

const HEADER_SIZE: usize = 4096;

fn result(format: SourceFormat, confidence: f64) -> DetectResult {
    DetectResult {
        format,
        confidence,
        mime_type: format.mime_type(),
    }
}

/// Detect the format from the first bytes of a source and optionally its filename.
pub fn detect(header: &[u8], filename: Option<&str>) -> Result<DetectResult, DetectError> {
    let ext = filename
        .and_then(|f| Path::new(f).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    // 1. Magic bytes
    if header.starts_with(b"PK\x03\x04") {
        // A ZIP that is not named .epub still gets the benefit of the doubt;
        // `detect_file` inspects the container before it gets here.
        return Ok(result(SourceFormat::Epub, 0.7));
    }
    if has_text_bom(header) {
        return Ok(result(SourceFormat::Txt, 0.9));
    }

    // 2. Extension
    match ext.as_deref() {
        Some("epub") => return Ok(result(SourceFormat::Epub, 0.6)),
        Some("txt") | Some("text") => return Ok(result(SourceFormat::Txt, 0.6)),
        _ => {}
    }

    // 3. Content heuristics
    if is_likely_text(header) {
        return Ok(result(SourceFormat::Txt, 0.3));
    }

    Err(DetectError::Unsupported(format!(
        "{} is neither an EPUB container nor plain text",
        filename.unwrap_or("input")
    )))
}

/// Detect the format of a file on disk. ZIP files are inspected for an EPUB
/// container so that arbitrary archives are rejected early.
pub fn detect_file(path: &Path) -> Result<DetectResult, DetectError> {
    let mut file = std::fs::File::open(path)?;
    let mut header = vec![0u8; HEADER_SIZE];
    let bytes_read = file.read(&mut header)?;
    header.truncate(bytes_read);
    file.rewind()?;

    let filename = path.file_name().and_then(|f| f.to_str());
    let detected = detect(&header, filename)?;

    if detected.format == SourceFormat::Epub && header.starts_with(b"PK\x03\x04") {
        let named_epub = filename
            .map(|f| f.to_ascii_lowercase().ends_with(".epub"))
            .unwrap_or(false);
        if !named_epub && !zip_has_epub_container(file) {
            return Err(DetectError::Unsupported(format!(
                "{} is a ZIP archive without an EPUB container",
                path.display()
            )));
        }
    }

    Ok(detected)
}

fn zip_has_epub_container<R: Read + Seek>(reader: R) -> bool {
    let Ok(mut archive) = zip::ZipArchive::new(reader) else {
        return false;
    };
    if let Ok(mut mimetype) = archive.by_name("mimetype") {
        let mut content = String::new();
        if mimetype.read_to_string(&mut content).is_ok()
            && content.trim() == "application/epub+zip"
        {
            return true;
        }
    }
    // Some EPUBs lack the mimetype entry.
    let has_container = archive.by_name("META-INF/container.xml").is_ok();
    has_container
}

fn has_text_bom(header: &[u8]) -> bool {
    header.starts_with(&[0xEF, 0xBB, 0xBF])
        || header.starts_with(&[0xFF, 0xFE])
        || header.starts_with(&[0xFE, 0xFF])
}

/// Text in any single- or multi-byte legacy encoding has no NUL bytes and few
/// C0 control characters; binary data has plenty of both.
fn is_likely_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if bytes.contains(&0) {
        return false;
    }
    let control_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r' && b != 0x0C)
        .count();
    control_count * 1000 < bytes.len()
}
