//! Ingestion pipeline: detect → open → TOC → segment → rewrite → cache.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::book::{
    Book, BookMetadata, Chapter, ChapterLink, DiagnosticKind, Diagnostics, ImageIndex,
    SourceFormat, SourceInfo, TocEntry, CACHE_FORMAT_VERSION,
};
use crate::cache;
use crate::config::PipelineConfig;
use crate::detect::detect_file;
use crate::encoding::normalize_title;
use crate::error::{CacheError, IngestError};
use crate::progress::{emit_progress, IngestStage, ProgressHandler};
use crate::readers::epub::{EpubArchive, PackageMetadata};
use crate::readers::{fingerprint_file, DecodedText, SourceDocument};
use crate::rewrite::{extract_image, rewrite_chapters, NoImages};
use crate::segment::{self, AnchorIndex};
use crate::toc::{self, RawTocEntry};

const DEFAULT_LANGUAGE: &str = "en";
const UNTITLED: &str = "Untitled";

/// Turns source files into cached books. Holds no state besides its
/// configuration, so one instance can ingest any number of books.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

/// Output of the parse stages, before metadata is attached.
struct Parsed {
    chapters: Vec<Chapter>,
    toc: Vec<TocEntry>,
    images: ImageIndex,
    metadata: PackageMetadata,
    cover_image: Option<String>,
    text_encoding: Option<String>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Cache directory a source ingests into.
    pub fn cache_dir_for(&self, source: &Path) -> PathBuf {
        cache::cache_dir_for(&self.config.cache_root, source)
    }

    pub fn ingest(&self, source: &Path) -> Result<Book, IngestError> {
        self.ingest_with_progress(source, None)
    }

    /// Parse `source` and replace its cache. The previous cache survives any
    /// failure.
    pub fn ingest_with_progress(
        &self,
        source: &Path,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<Book, IngestError> {
        let book = self.parse_with_progress(source, progress)?;
        emit_progress(progress, IngestStage::WriteCache, None);
        cache::write(&book, &self.config.cache_root)?;
        Ok(book)
    }

    /// Run every stage except the cache write.
    pub fn parse(&self, source: &Path) -> Result<Book, IngestError> {
        self.parse_with_progress(source, None)
    }

    fn parse_with_progress(
        &self,
        source: &Path,
        progress: Option<&dyn ProgressHandler>,
    ) -> Result<Book, IngestError> {
        if !source.is_file() {
            return Err(IngestError::SourceUnavailable {
                path: source.display().to_string(),
            });
        }
        let source = std::fs::canonicalize(source)?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        emit_progress(progress, IngestStage::Detect, Some(&file_name));
        let detected = detect_file(&source)?;
        tracing::info!(source = %source.display(), format = %detected.format, "ingesting");
        let fingerprint = fingerprint_file(&source)?;

        emit_progress(progress, IngestStage::OpenSource, Some(&file_name));
        let document = SourceDocument::open(
            &source,
            detected.format,
            &self.config.encoding,
            &self.config.security,
        )?;

        let mut diagnostics = Diagnostics::new();
        let parsed = match document {
            SourceDocument::Epub(mut archive) => {
                self.parse_epub(&mut archive, progress, &mut diagnostics)?
            }
            SourceDocument::PlainText(text) => self.parse_text(text, progress, &mut diagnostics)?,
        };

        let book = self.assemble(&source, detected.format, fingerprint, parsed, diagnostics);
        if let Err(problem) = book.check_invariants() {
            tracing::error!("assembled book violates its invariants: {problem}");
            return Err(CacheError::Inconsistent(problem).into());
        }
        tracing::info!(
            title = %book.metadata.title,
            chapters = book.chapters.len(),
            toc_entries = book.flat_toc().len(),
            images = book.images.len(),
            diagnostics = book.diagnostics.len(),
            "parsed"
        );
        Ok(book)
    }

    fn parse_epub<R: std::io::Read + std::io::Seek>(
        &self,
        archive: &mut EpubArchive<R>,
        progress: Option<&dyn ProgressHandler>,
        diagnostics: &mut Diagnostics,
    ) -> Result<Parsed, IngestError> {
        for idref in &archive.package().skipped_idrefs {
            diagnostics.record(
                DiagnosticKind::SkippedSpineItem,
                format!("spine itemref {idref} has no manifest item"),
            );
        }

        emit_progress(progress, IngestStage::ResolveToc, None);
        let raw_toc = toc::resolve_toc(archive, diagnostics);

        emit_progress(progress, IngestStage::Segment, None);
        let segmentation = segment::epub::segment(archive, &raw_toc, diagnostics)?;

        emit_progress(progress, IngestStage::Rewrite, None);
        let (chapters, mut images) = rewrite_chapters(
            segmentation.chapters,
            &segmentation.anchors,
            archive,
            diagnostics,
        )?;
        let toc = map_toc(&raw_toc.entries, &segmentation.anchors, &chapters, diagnostics);

        // A declared cover is usually not referenced from any chapter.
        let declared_cover = archive.package().cover_path().map(str::to_string);
        let declared_cover = match declared_cover {
            Some(path) => extract_image(&mut images, &path, archive, diagnostics)?,
            None => None,
        };
        let cover_image = declared_cover.or_else(|| guess_cover(&chapters, &images));

        Ok(Parsed {
            chapters,
            toc,
            images,
            metadata: archive.package().metadata.clone(),
            cover_image,
            text_encoding: None,
        })
    }

    fn parse_text(
        &self,
        text: DecodedText,
        progress: Option<&dyn ProgressHandler>,
        diagnostics: &mut Diagnostics,
    ) -> Result<Parsed, IngestError> {
        if text.replacements > 0 {
            diagnostics.record(
                DiagnosticKind::DecodeReplacement,
                format!(
                    "{} undecodable sequences replaced while reading {}",
                    text.replacements, text.encoding
                ),
            );
        }

        emit_progress(progress, IngestStage::Segment, Some(text.encoding));
        let segmentation =
            segment::txt::segment(&text.text, &self.config.segmenter, diagnostics);

        emit_progress(progress, IngestStage::Rewrite, None);
        let (chapters, images) = rewrite_chapters(
            segmentation.chapters,
            &AnchorIndex::new(),
            &mut NoImages,
            diagnostics,
        )?;
        let toc = chapters
            .iter()
            .map(|c| TocEntry {
                title: c.title.clone(),
                target: ChapterLink::chapter(c.index),
                children: Vec::new(),
            })
            .collect();

        Ok(Parsed {
            chapters,
            toc,
            images,
            metadata: PackageMetadata {
                description: Some("Imported plain text file".to_string()),
                ..PackageMetadata::default()
            },
            cover_image: None,
            text_encoding: Some(text.encoding.to_string()),
        })
    }

    fn assemble(
        &self,
        source: &Path,
        format: SourceFormat,
        fingerprint: crate::book::SourceFingerprint,
        parsed: Parsed,
        diagnostics: Diagnostics,
    ) -> Book {
        let opts = &self.config.encoding;
        let meta = parsed.metadata;
        let title = meta
            .title
            .map(|t| normalize_title(&t, opts))
            .filter(|t| !t.is_empty())
            .or_else(|| {
                source
                    .file_stem()
                    .map(|s| normalize_title(&s.to_string_lossy(), opts))
                    .filter(|t| !t.is_empty())
            })
            .unwrap_or_else(|| UNTITLED.to_string());

        let mut chapters = parsed.chapters;
        for chapter in &mut chapters {
            chapter.title = normalize_title(&chapter.title, opts);
        }
        if chapters.is_empty() {
            chapters.push(Chapter {
                index: 0,
                title: title.clone(),
                source_href: None,
                content: String::new(),
                text: String::new(),
                anchors: Vec::new(),
                images: Vec::new(),
            });
        }
        let mut toc = parsed.toc;
        normalize_toc_titles(&mut toc, opts);

        let processed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Book {
            format_version: CACHE_FORMAT_VERSION,
            metadata: BookMetadata {
                title,
                authors: meta.authors,
                identifiers: meta.identifiers,
                language: meta
                    .language
                    .filter(|l| !l.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
                publisher: meta.publisher,
                date: meta.date,
                description: meta.description,
                subjects: meta.subjects,
                cover_image: parsed.cover_image,
                source: SourceInfo {
                    format,
                    path: source.to_path_buf(),
                    fingerprint,
                },
                text_encoding: parsed.text_encoding,
                processed_at,
            },
            chapters,
            toc,
            images: parsed.images,
            diagnostics: diagnostics.into_vec(),
        }
    }
}

/// Point TOC entries at chapters. Entries whose target did not survive
/// segmentation are dropped and their children promoted; fragments are kept
/// only where the chapter still carries them.
fn map_toc(
    entries: &[RawTocEntry],
    anchors: &AnchorIndex,
    chapters: &[Chapter],
    diagnostics: &mut Diagnostics,
) -> Vec<TocEntry> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let children = map_toc(&entry.children, anchors, chapters, diagnostics);
        let chapter = anchors
            .lookup(&entry.path, entry.fragment.as_deref())
            .and_then(|i| chapters.get(i));
        match chapter {
            Some(chapter) => {
                let fragment = entry.fragment.clone().filter(|f| chapter.has_anchor(f));
                out.push(TocEntry {
                    title: entry.title.clone().unwrap_or_else(|| chapter.title.clone()),
                    target: ChapterLink {
                        chapter: chapter.index,
                        fragment,
                    },
                    children,
                });
            }
            None => {
                diagnostics.record(
                    DiagnosticKind::DroppedTocEntry,
                    format!("{} has no chapter after segmentation", entry.path),
                );
                out.extend(children);
            }
        }
    }
    out
}

fn normalize_toc_titles(entries: &mut [TocEntry], opts: &crate::encoding::EncodingOptions) {
    for entry in entries {
        entry.title = normalize_title(&entry.title, opts);
        normalize_toc_titles(&mut entry.children, opts);
    }
}

/// First image in reading order named like a cover, else the first image.
fn guess_cover(chapters: &[Chapter], images: &ImageIndex) -> Option<String> {
    let in_reading_order = || chapters.iter().flat_map(|c| c.images.iter());
    let looks_like_cover = |cache_path: &&String| {
        images.by_cache_path(cache_path).map_or(false, |asset| {
            let name = asset
                .original_path
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_lowercase();
            name.contains("cover") || name.contains("front")
        })
    };
    in_reading_order()
        .find(looks_like_cover)
        .or_else(|| in_reading_order().next())
        .cloned()
}
