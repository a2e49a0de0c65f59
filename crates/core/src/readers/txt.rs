//! Plain text sources: read the file and decode it with encoding detection.

use std::path::Path;

use crate::encoding::{decode_text, EncodingOptions};
use crate::error::ReadError;
use crate::security::SecurityLimits;

pub use crate::encoding::DecodedText;

/// Read and decode a text file. The file is size-checked against the
/// per-resource limit before it is loaded.
pub fn read_text_file(
    path: &Path,
    encoding: &EncodingOptions,
    limits: &SecurityLimits,
) -> Result<DecodedText, ReadError> {
    let size = std::fs::metadata(path)?.len();
    limits.check_source_size(&path.display().to_string(), size)?;

    let bytes = std::fs::read(path)?;
    let decoded = decode_text(&bytes, encoding)?;
    tracing::debug!(
        path = %path.display(),
        encoding = decoded.encoding,
        replacements = decoded.replacements,
        "decoded text source"
    );
    Ok(decoded)
}
