use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Version of the on-disk `book.json` record. Bumped whenever the layout of
/// [`Book`] changes incompatibly; the loader treats other versions as corrupted.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// The aggregate produced by one ingestion run and persisted in the cache.
/// Every reader-facing lookup (chapter by index, TOC, images) goes through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub format_version: u32,
    pub metadata: BookMetadata,
    pub chapters: Vec<Chapter>,
    pub toc: Vec<TocEntry>,
    pub images: ImageIndex,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub identifiers: Vec<String>,
    pub language: String,
    pub publisher: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub subjects: Vec<String>,
    /// Cache-relative path of the cover image, if one could be chosen.
    pub cover_image: Option<String>,
    pub source: SourceInfo,
    /// Encoding the text was decoded from (plain-text sources only).
    pub text_encoding: Option<String>,
    /// Unix timestamp (seconds) of the ingestion run.
    pub processed_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    #[default]
    Epub,
    Txt,
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Epub => write!(f, "EPUB"),
            SourceFormat::Txt => write!(f, "TXT"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub format: SourceFormat,
    pub path: PathBuf,
    pub fingerprint: SourceFingerprint,
}

/// Identity of a source file at ingestion time. Size and modification time
/// are the cheap signal; the SHA-256 digest settles cases where only the
/// filesystem metadata moved (e.g. a `touch` or a copy).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub size: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
    pub sha256: String,
}

impl SourceFingerprint {
    pub fn same_metadata(&self, other: &SourceFingerprint) -> bool {
        self.size == other.size
            && self.modified_secs == other.modified_secs
            && self.modified_nanos == other.modified_nanos
    }
}

/// A position in the reader's chapter-addressing scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterLink {
    pub chapter: usize,
    pub fragment: Option<String>,
}

impl ChapterLink {
    pub fn chapter(chapter: usize) -> Self {
        Self {
            chapter,
            fragment: None,
        }
    }

    /// The href emitted into rewritten chapter bodies: `3` or `3#note-1`.
    pub fn href(&self) -> String {
        match &self.fragment {
            Some(fragment) => format!("{}#{}", self.chapter, fragment),
            None => self.chapter.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub target: ChapterLink,
    pub children: Vec<TocEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    /// Archive path of the spine document this chapter came from (EPUB only).
    pub source_href: Option<String>,
    /// Normalized XHTML fragment (body content only).
    pub content: String,
    /// Whitespace-collapsed plain text of `content`.
    pub text: String,
    /// Fragment ids reachable inside `content`.
    pub anchors: Vec<String>,
    /// Cache-relative paths of the images referenced by `content`.
    pub images: Vec<String>,
}

impl Chapter {
    pub fn has_anchor(&self, id: &str) -> bool {
        self.anchors.iter().any(|a| a == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    /// Path inside the source archive.
    pub original_path: String,
    /// Path relative to the book's cache directory (`images/<name>`).
    pub cache_path: String,
    pub media_type: String,
    /// Image bytes. Stored as a file next to the record, not inside it.
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Extracted images keyed by their original archive path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageIndex {
    images: BTreeMap<String, ImageAsset>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: ImageAsset) {
        self.images.insert(asset.original_path.clone(), asset);
    }

    pub fn get(&self, original_path: &str) -> Option<&ImageAsset> {
        self.images.get(original_path)
    }

    pub fn by_cache_path(&self, cache_path: &str) -> Option<&ImageAsset> {
        self.images.values().find(|a| a.cache_path == cache_path)
    }

    pub fn contains_cache_path(&self, cache_path: &str) -> bool {
        self.by_cache_path(cache_path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageAsset> {
        self.images.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ImageAsset> {
        self.images.values_mut()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    MissingToc,
    MalformedToc,
    DroppedTocEntry,
    TocCycle,
    SkippedSpineItem,
    DanglingLink,
    MissingImage,
    AmbiguousSplit,
    DecodeReplacement,
}

/// A recoverable problem met during ingestion. Never aborts the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub detail: String,
}

/// Collector threaded through the pipeline stages.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: DiagnosticKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(?kind, "{}", detail);
        self.entries.push(Diagnostic { kind, detail });
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}

impl Book {
    pub fn chapter(&self, index: usize) -> Option<&Chapter> {
        self.chapters.get(index)
    }

    /// Depth-first flattening of the TOC tree, as shown in a sidebar.
    pub fn flat_toc(&self) -> Vec<(usize, &TocEntry)> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, &TocEntry)> =
            self.toc.iter().rev().map(|e| (0, e)).collect();
        while let Some((depth, entry)) = stack.pop() {
            out.push((depth, entry));
            for child in entry.children.iter().rev() {
                stack.push((depth + 1, child));
            }
        }
        out
    }

    pub fn cover_image(&self) -> Option<&ImageAsset> {
        self.metadata
            .cover_image
            .as_deref()
            .and_then(|p| self.images.by_cache_path(p))
    }

    /// Checks the structural guarantees a loader relies on: contiguous chapter
    /// indices, in-range TOC targets with reachable fragments, and chapter
    /// image references that exist in the image index.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (position, chapter) in self.chapters.iter().enumerate() {
            if chapter.index != position {
                return Err(format!(
                    "chapter at position {} has index {}",
                    position, chapter.index
                ));
            }
            for image in &chapter.images {
                if !self.images.contains_cache_path(image) {
                    return Err(format!(
                        "chapter {} references unknown image {}",
                        position, image
                    ));
                }
            }
        }
        for (_, entry) in self.flat_toc() {
            let Some(chapter) = self.chapters.get(entry.target.chapter) else {
                return Err(format!(
                    "TOC entry '{}' points at chapter {} of {}",
                    entry.title,
                    entry.target.chapter,
                    self.chapters.len()
                ));
            };
            if let Some(fragment) = &entry.target.fragment {
                if !chapter.has_anchor(fragment) {
                    return Err(format!(
                        "TOC entry '{}' points at missing fragment #{}",
                        entry.title, fragment
                    ));
                }
            }
        }
        Ok(())
    }
}
