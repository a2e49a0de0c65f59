//! Limits applied while reading untrusted sources.
//!
//! [`SecurityLimits`] is plain configuration. [`ExtractionBudget`] applies it
//! to one open archive and tracks how much has been unpacked so far, so a
//! book cannot inflate past the total limit one entry at a time.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

use crate::error::SecurityError;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLimits {
    /// Largest uncompressed/compressed ratio accepted for one archive entry.
    pub max_compression_ratio: u64,
    pub max_file_count: u64,
    /// Largest single archive entry, or plain-text source, in bytes.
    pub max_resource_size_bytes: u64,
    /// Largest total unpacked from one archive.
    pub max_total_size_bytes: u64,
    /// Deepest TOC nesting kept; deeper levels are truncated.
    pub max_nesting_depth: u32,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_compression_ratio: 100,
            max_file_count: 10_000,
            max_resource_size_bytes: 200 * MB,
            max_total_size_bytes: 1024 * MB,
            max_nesting_depth: 32,
        }
    }
}

impl SecurityLimits {
    /// Size check for a source read whole, such as a plain-text book.
    pub fn check_source_size(&self, name: &str, size: u64) -> Result<(), SecurityError> {
        if size > self.max_resource_size_bytes {
            return Err(SecurityError::OversizedResource {
                name: name.to_string(),
                size_mb: size / MB,
                limit_mb: self.max_resource_size_bytes / MB,
            });
        }
        Ok(())
    }
}

/// Running account of one archive's extraction.
#[derive(Debug, Clone)]
pub struct ExtractionBudget {
    limits: SecurityLimits,
    extracted: u64,
}

impl ExtractionBudget {
    pub fn new(limits: SecurityLimits) -> Self {
        Self {
            limits,
            extracted: 0,
        }
    }

    pub fn limits(&self) -> &SecurityLimits {
        &self.limits
    }

    /// Bytes admitted so far.
    pub fn extracted(&self) -> u64 {
        self.extracted
    }

    pub fn admit_archive(&self, entry_count: usize) -> Result<(), SecurityError> {
        let count = entry_count as u64;
        if count > self.limits.max_file_count {
            return Err(SecurityError::TooManyFiles {
                count,
                limit: self.limits.max_file_count,
            });
        }
        Ok(())
    }

    /// Admit one entry before it is decompressed. The entry is charged
    /// against the archive total even if a later entry is refused.
    pub fn admit_entry(
        &mut self,
        path: &str,
        compressed_size: u64,
        size: u64,
    ) -> Result<(), SecurityError> {
        if !stays_inside_archive(path) {
            return Err(SecurityError::PathTraversal {
                path: path.to_string(),
            });
        }
        self.limits.check_source_size(path, size)?;

        let ratio = match compressed_size {
            0 if size == 0 => 0,
            0 => u64::MAX,
            compressed => size / compressed,
        };
        if ratio > self.limits.max_compression_ratio {
            return Err(SecurityError::ZipBomb {
                entry: path.to_string(),
                ratio,
                limit: self.limits.max_compression_ratio,
            });
        }

        self.extracted = self.extracted.saturating_add(size);
        if self.extracted > self.limits.max_total_size_bytes {
            return Err(SecurityError::ArchiveTooLarge {
                extracted_mb: self.extracted / MB,
                limit_mb: self.limits.max_total_size_bytes / MB,
            });
        }
        Ok(())
    }
}

/// Relative, with no `..` and no drive or root prefix.
fn stays_inside_archive(path: &str) -> bool {
    if path.starts_with(['/', '\\']) || path.as_bytes().get(1) == Some(&b':') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> ExtractionBudget {
        ExtractionBudget::new(SecurityLimits::default())
    }

    #[test]
    fn entry_paths_must_stay_inside() {
        let mut b = budget();
        for ok in ["OEBPS/chapter1.xhtml", "META-INF/container.xml", "./mimetype"] {
            assert!(b.admit_entry(ok, 10, 10).is_ok(), "{ok}");
        }
        for bad in ["../../etc/passwd", "OEBPS/../../x", "/etc/passwd", "C:\\Windows\\x"] {
            assert!(
                matches!(b.admit_entry(bad, 10, 10), Err(SecurityError::PathTraversal { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn inflated_entries_are_bombs() {
        let mut b = budget();
        assert!(b.admit_entry("a.xhtml", 1000, 50_000).is_ok());
        assert!(b.admit_entry("empty", 0, 0).is_ok());
        assert!(matches!(
            b.admit_entry("b.xhtml", 100, 100_000),
            Err(SecurityError::ZipBomb { ratio: 1000, .. })
        ));
        assert!(matches!(
            b.admit_entry("c.xhtml", 0, 100),
            Err(SecurityError::ZipBomb { .. })
        ));
    }

    #[test]
    fn total_accumulates_across_entries() {
        let mut b = ExtractionBudget::new(SecurityLimits {
            max_total_size_bytes: 3 * MB,
            ..SecurityLimits::default()
        });
        b.admit_entry("one", MB, 2 * MB).unwrap();
        assert_eq!(b.extracted(), 2 * MB);
        let err = b.admit_entry("two", MB, 2 * MB).unwrap_err();
        assert!(matches!(err, SecurityError::ArchiveTooLarge { extracted_mb: 4, limit_mb: 3 }));
        assert!(err.to_string().contains("security.max_file_size_mb"));
    }

    #[test]
    fn counts_and_single_sizes() {
        let b = budget();
        assert!(b.admit_archive(10_000).is_ok());
        assert!(matches!(b.admit_archive(10_001), Err(SecurityError::TooManyFiles { .. })));

        let limits = SecurityLimits::default();
        assert!(limits.check_source_size("book.txt", 1024).is_ok());
        assert!(matches!(
            limits.check_source_size("huge.txt", 201 * MB),
            Err(SecurityError::OversizedResource { size_mb: 201, limit_mb: 200, .. })
        ));
    }
}
