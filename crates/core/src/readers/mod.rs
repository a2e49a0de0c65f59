//! Source readers. An opened source is either an EPUB container or decoded
//! plain text; the pipeline dispatches on [`SourceDocument`].

pub mod epub;
pub mod txt;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::book::{SourceFingerprint, SourceFormat};
use crate::encoding::EncodingOptions;
use crate::error::ReadError;
use crate::security::SecurityLimits;

pub use epub::EpubArchive;
pub use txt::DecodedText;

pub enum SourceDocument {
    Epub(EpubArchive<BufReader<File>>),
    PlainText(DecodedText),
}

impl SourceDocument {
    pub fn open(
        path: &Path,
        format: SourceFormat,
        encoding: &EncodingOptions,
        limits: &SecurityLimits,
    ) -> Result<Self, ReadError> {
        match format {
            SourceFormat::Epub => Ok(SourceDocument::Epub(EpubArchive::open(path, limits)?)),
            SourceFormat::Txt => Ok(SourceDocument::PlainText(txt::read_text_file(
                path, encoding, limits,
            )?)),
        }
    }

    pub fn format(&self) -> SourceFormat {
        match self {
            SourceDocument::Epub(_) => SourceFormat::Epub,
            SourceDocument::PlainText(_) => SourceFormat::Txt,
        }
    }
}

/// Size, modification time and SHA-256 of a source file.
pub fn fingerprint_file(path: &Path) -> std::io::Result<SourceFingerprint> {
    Ok(SourceFingerprint {
        sha256: sha256_file(path)?,
        ..metadata_fingerprint(path)?
    })
}

/// Size and modification time only; `sha256` is left empty.
pub fn metadata_fingerprint(path: &Path) -> std::io::Result<SourceFingerprint> {
    let meta = std::fs::metadata(path)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    Ok(SourceFingerprint {
        size: meta.len(),
        modified_secs: modified.as_secs(),
        modified_nanos: modified.subsec_nanos(),
        sha256: String::new(),
    })
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}
