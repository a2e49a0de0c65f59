//! The reader's view of the cache: list ingested books, find sources waiting
//! in the upload directory, and open a book, re-ingesting when its cache is
//! stale, missing or damaged.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::book::{Book, SourceFormat};
use crate::cache::{self, CacheStatus, DIR_SUFFIX, RECORD_FILE};
use crate::config::PipelineConfig;
use crate::detect::SUPPORTED_EXTENSIONS;
use crate::error::{CacheError, IngestError};
use crate::pipeline::Pipeline;

/// One cached book, as shown in a library listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSummary {
    /// Cache directory name; accepted by [`Library::open`].
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub chapter_count: usize,
    /// Cache-relative path of the cover image.
    pub cover_image: Option<String>,
    pub format: SourceFormat,
    pub source: PathBuf,
}

pub struct Library {
    pipeline: Pipeline,
}

impl Library {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            pipeline: Pipeline::new(config),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn cache_root(&self) -> &Path {
        &self.pipeline.config().cache_root
    }

    pub fn upload_dir(&self) -> &Path {
        &self.pipeline.config().upload_dir
    }

    /// Books with a readable cache record, sorted by title.
    pub fn list(&self) -> Result<Vec<BookSummary>, CacheError> {
        let read_dir = match std::fs::read_dir(self.cache_root()) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut books = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            let Some(id) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if !path.is_dir() || !id.ends_with(DIR_SUFFIX) {
                continue;
            }
            match cache::read_record(&path) {
                Ok(book) => books.push(BookSummary {
                    id,
                    title: book.metadata.title,
                    authors: book.metadata.authors,
                    chapter_count: book.chapters.len(),
                    cover_image: book.metadata.cover_image,
                    format: book.metadata.source.format,
                    source: book.metadata.source.path,
                }),
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable cache: {e}"),
            }
        }
        books.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()).then(a.id.cmp(&b.id)));
        Ok(books)
    }

    /// Supported files in the upload directory that have no cache yet.
    pub fn pending_sources(&self) -> Result<Vec<PathBuf>, CacheError> {
        let read_dir = match std::fs::read_dir(self.upload_dir()) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut pending: Vec<PathBuf> = read_dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_supported_extension(path))
            .filter(|path| !self.pipeline.cache_dir_for(path).join(RECORD_FILE).is_file())
            .collect();
        pending.sort();
        Ok(pending)
    }

    /// Load a book by cache id or source path, ingesting it when the cache
    /// cannot be served.
    pub fn open(&self, book: &str) -> Result<Book, IngestError> {
        let (dir, explicit) = self.locate(book);
        let source = explicit
            .filter(|p| p.is_file())
            .or_else(|| cache::recorded_source(&dir));
        let Some(source) = source else {
            return Err(IngestError::SourceUnavailable {
                path: book.to_string(),
            });
        };

        match cache::check(&dir, &source) {
            CacheStatus::Fresh(book) => Ok(*book),
            CacheStatus::Corrupted(reason) => {
                tracing::warn!(path = %dir.display(), "cache is corrupted, re-ingesting: {reason}");
                self.pipeline.ingest(&source)
            }
            status => {
                tracing::info!(path = %dir.display(), ?status, "cache cannot be served, ingesting");
                self.pipeline.ingest(&source)
            }
        }
    }

    /// Delete the cache of a book, given its id or source path.
    pub fn remove(&self, book: &str) -> Result<(), CacheError> {
        let (dir, _) = self.locate(book);
        cache::remove(&dir)
    }

    /// Cache directory for an id or a source path, plus the source path when
    /// one was given.
    pub fn locate(&self, book: &str) -> (PathBuf, Option<PathBuf>) {
        let path = Path::new(book);
        if path.is_file() || book.contains(['/', '\\']) || has_supported_extension(path) {
            return (self.pipeline.cache_dir_for(path), Some(path.to_path_buf()));
        }
        let name = if book.ends_with(DIR_SUFFIX) {
            book.to_string()
        } else {
            format!("{book}{DIR_SUFFIX}")
        };
        (self.cache_root().join(name), None)
    }
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}
