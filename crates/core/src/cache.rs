//! On-disk book cache.
//!
//! Layout: `<cache_root>/<slug>_data/book.json` plus `images/*`. A cache is
//! built in a staging directory next to its final location and swapped in with
//! a rename, so readers see either the previous book or the new one.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::book::{Book, CACHE_FORMAT_VERSION};
use crate::error::CacheError;
use sha2::{Digest, Sha256};

use crate::readers::{metadata_fingerprint, sha256_file};

pub const RECORD_FILE: &str = "book.json";
pub const DIR_SUFFIX: &str = "_data";

/// Freshness of a cache directory relative to its source.
#[derive(Debug)]
pub enum CacheStatus {
    Fresh(Box<Book>),
    /// The source changed since ingestion.
    Stale,
    Missing,
    Corrupted(String),
}

/// Directory-name slug for a source file: its stem with path-hostile
/// characters replaced.
pub fn book_slug(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let slug: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_start_matches('.').trim_matches('_');
    if slug.is_empty() {
        "book".to_string()
    } else {
        slug.to_string()
    }
}

/// Cache directory of a source. Two sources sharing a stem get distinct
/// directories: whichever was cached first keeps `<slug>_data`, the other
/// gets `<slug>-<path hash>_data`.
pub fn cache_dir_for(cache_root: &Path, source: &Path) -> PathBuf {
    let slug = book_slug(source);
    let plain = cache_root.join(format!("{slug}{DIR_SUFFIX}"));
    let source = fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
    match recorded_source(&plain) {
        Some(recorded) if recorded != source => {
            cache_root.join(format!("{slug}-{}{DIR_SUFFIX}", path_tag(&source)))
        }
        _ => plain,
    }
}

/// First 8 hex digits of the SHA-256 of a path.
fn path_tag(path: &Path) -> String {
    Sha256::digest(path.to_string_lossy().as_bytes())
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Persist `book` under `cache_root`, replacing any previous cache of the
/// same source. Returns the cache directory.
pub fn write(book: &Book, cache_root: &Path) -> Result<PathBuf, CacheError> {
    // The loader rejects such records, so they must never replace a good cache.
    book.check_invariants().map_err(CacheError::Inconsistent)?;
    fs::create_dir_all(cache_root)?;
    let target = cache_dir_for(cache_root, &book.metadata.source.path);

    // Removed on drop, together with whatever was moved into it.
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(cache_root)?;
    let fresh = staging.path().join("book");
    fs::create_dir(&fresh)?;
    write_contents(&fresh, book)?;

    let previous = staging.path().join("previous");
    let had_previous = target.exists();
    if had_previous {
        fs::rename(&target, &previous)?;
    }
    if let Err(e) = fs::rename(&fresh, &target) {
        if had_previous {
            if let Err(restore) = fs::rename(&previous, &target) {
                tracing::warn!(path = %target.display(), "could not restore previous cache: {restore}");
            }
        }
        return Err(e.into());
    }

    tracing::info!(
        path = %target.display(),
        chapters = book.chapters.len(),
        images = book.images.len(),
        "cache written"
    );
    Ok(target)
}

fn write_contents(dir: &Path, book: &Book) -> Result<(), CacheError> {
    if !book.images.is_empty() {
        fs::create_dir(dir.join(crate::rewrite::IMAGE_DIR))?;
    }
    for asset in book.images.iter() {
        let path = contained_path(dir, &asset.cache_path).ok_or_else(|| {
            corrupted(dir, format!("image path {} leaves the cache", asset.cache_path))
        })?;
        fs::write(path, &asset.data)?;
    }
    let record = serde_json::to_vec_pretty(book)?;
    fs::write(dir.join(RECORD_FILE), record)?;
    Ok(())
}

/// `dir/relative`, provided `relative` stays inside `dir`.
fn contained_path(dir: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| dir.join(relative))
}

#[derive(Deserialize)]
struct VersionHeader {
    format_version: u32,
}

/// Read and version-check `book.json` alone. Image bytes are left empty.
pub fn read_record(dir: &Path) -> Result<Book, CacheError> {
    let bytes = match fs::read(dir.join(RECORD_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(CacheError::Missing(dir.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let header: VersionHeader = serde_json::from_slice(&bytes)
        .map_err(|e| corrupted(dir, format!("unreadable record: {e}")))?;
    if header.format_version != CACHE_FORMAT_VERSION {
        return Err(corrupted(
            dir,
            format!(
                "format version {} (expected {})",
                header.format_version, CACHE_FORMAT_VERSION
            ),
        ));
    }
    serde_json::from_slice(&bytes).map_err(|e| corrupted(dir, format!("unreadable record: {e}")))
}

/// Load a cached book, image bytes included, and verify its invariants.
pub fn load(dir: &Path) -> Result<Book, CacheError> {
    let mut book = read_record(dir)?;
    for asset in book.images.iter_mut() {
        let path = contained_path(dir, &asset.cache_path).ok_or_else(|| {
            corrupted(dir, format!("image path {} leaves the cache", asset.cache_path))
        })?;
        asset.data = fs::read(&path)
            .map_err(|e| corrupted(dir, format!("image {}: {e}", asset.cache_path)))?;
    }
    book.check_invariants().map_err(|detail| corrupted(dir, detail))?;
    Ok(book)
}

#[derive(Deserialize)]
struct RecordedSource {
    metadata: RecordedMetadata,
}

#[derive(Deserialize)]
struct RecordedMetadata {
    source: RecordedPath,
}

#[derive(Deserialize)]
struct RecordedPath {
    path: PathBuf,
}

/// Source path recorded in a cache, if its record is readable. Only the path
/// is decoded.
pub fn recorded_source(dir: &Path) -> Option<PathBuf> {
    let bytes = fs::read(dir.join(RECORD_FILE)).ok()?;
    serde_json::from_slice::<RecordedSource>(&bytes)
        .ok()
        .map(|record| record.metadata.source.path)
}

fn corrupted(dir: &Path, detail: String) -> CacheError {
    CacheError::Corrupted {
        path: dir.display().to_string(),
        detail,
    }
}

/// Compare a cache directory against the current state of `source`.
///
/// Size and modification time decide first; when only the timestamp moved,
/// the content hash settles it. A cache whose source no longer exists is
/// served as is.
pub fn check(dir: &Path, source: &Path) -> CacheStatus {
    let book = match load(dir) {
        Ok(book) => book,
        Err(CacheError::Missing(_)) => return CacheStatus::Missing,
        Err(e) => return CacheStatus::Corrupted(e.to_string()),
    };

    let source = fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
    let recorded = &book.metadata.source;
    if recorded.path != source {
        tracing::debug!(recorded = %recorded.path.display(), current = %source.display(), "source path changed");
        return CacheStatus::Stale;
    }
    let current = match metadata_fingerprint(&source) {
        Ok(fp) => fp,
        Err(e) if e.kind() == ErrorKind::NotFound => return CacheStatus::Fresh(Box::new(book)),
        Err(e) => {
            tracing::debug!("cannot stat {}: {e}", source.display());
            return CacheStatus::Stale;
        }
    };
    if recorded.fingerprint.size != current.size {
        return CacheStatus::Stale;
    }
    if recorded.fingerprint.same_metadata(&current) {
        return CacheStatus::Fresh(Box::new(book));
    }
    match sha256_file(&source) {
        Ok(hash) if hash == recorded.fingerprint.sha256 => CacheStatus::Fresh(Box::new(book)),
        _ => CacheStatus::Stale,
    }
}

/// Delete a cache directory, forcing full re-ingestion next time.
pub fn remove(dir: &Path) -> Result<(), CacheError> {
    if !dir.join(RECORD_FILE).is_file() {
        return Err(CacheError::Missing(dir.display().to_string()));
    }
    fs::remove_dir_all(dir)?;
    tracing::info!(path = %dir.display(), "cache removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{
        BookMetadata, Chapter, ChapterLink, ImageAsset, ImageIndex, SourceFormat, SourceInfo,
        TocEntry,
    };
    use crate::readers::fingerprint_file;
    use pretty_assertions::assert_eq;

    fn sample(source: &Path) -> Book {
        let mut images = ImageIndex::new();
        images.insert(ImageAsset {
            original_path: "OEBPS/img/cover.jpg".into(),
            cache_path: "images/cover.jpg".into(),
            media_type: "image/jpeg".into(),
            data: vec![0xff, 0xd8, 0xff],
        });
        Book {
            format_version: CACHE_FORMAT_VERSION,
            metadata: BookMetadata {
                title: "Sample".into(),
                language: "en".into(),
                cover_image: Some("images/cover.jpg".into()),
                source: SourceInfo {
                    format: SourceFormat::Epub,
                    path: fs::canonicalize(source).unwrap(),
                    fingerprint: fingerprint_file(source).unwrap(),
                },
                ..BookMetadata::default()
            },
            chapters: vec![Chapter {
                index: 0,
                title: "One".into(),
                source_href: Some("OEBPS/one.xhtml".into()),
                content: r#"<p id="a"><img src="images/cover.jpg"/></p>"#.into(),
                text: String::new(),
                anchors: vec!["a".into()],
                images: vec!["images/cover.jpg".into()],
            }],
            toc: vec![TocEntry {
                title: "One".into(),
                target: ChapterLink {
                    chapter: 0,
                    fragment: Some("a".into()),
                },
                children: Vec::new(),
            }],
            images,
            diagnostics: Vec::new(),
        }
    }

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("My Book!.epub");
        fs::write(&source, b"source bytes").unwrap();
        (dir, source)
    }

    #[test]
    fn slugs() {
        assert_eq!(book_slug(Path::new("/x/My Book!.epub")), "My_Book");
        assert_eq!(book_slug(Path::new("三体.txt")), "三体");
        assert_eq!(book_slug(Path::new("/x/???.txt")), "book");
    }

    #[test]
    fn write_then_load() {
        let (dir, source) = setup();
        let book = sample(&source);
        let root = dir.path().join("cache");
        let cache_dir = write(&book, &root).unwrap();

        assert_eq!(cache_dir, root.join("My_Book_data"));
        assert!(cache_dir.join("images/cover.jpg").is_file());
        let loaded = load(&cache_dir).unwrap();
        assert_eq!(loaded, book);
        // Only the cache directory is left behind.
        assert_eq!(fs::read_dir(&root).unwrap().count(), 1);
    }

    #[test]
    fn rewrite_replaces_previous_assets() {
        let (dir, source) = setup();
        let root = dir.path().join("cache");
        let mut book = sample(&source);
        write(&book, &root).unwrap();

        book.images = ImageIndex::new();
        book.metadata.cover_image = None;
        book.chapters[0].images.clear();
        let cache_dir = write(&book, &root).unwrap();
        assert!(!cache_dir.join("images").exists());
        assert_eq!(load(&cache_dir).unwrap(), book);
    }

    #[test]
    fn freshness() {
        let (dir, source) = setup();
        let root = dir.path().join("cache");
        let cache_dir = cache_dir_for(&root, &source);
        assert!(matches!(check(&cache_dir, &source), CacheStatus::Missing));

        write(&sample(&source), &root).unwrap();
        assert!(matches!(check(&cache_dir, &source), CacheStatus::Fresh(_)));

        fs::write(&source, b"changed content, longer").unwrap();
        assert!(matches!(check(&cache_dir, &source), CacheStatus::Stale));
    }

    #[test]
    fn touched_source_with_same_content_is_fresh() {
        let (dir, source) = setup();
        let root = dir.path().join("cache");
        let mut book = sample(&source);
        book.metadata.source.fingerprint.modified_secs -= 10;
        let cache_dir = write(&book, &root).unwrap();
        assert!(matches!(check(&cache_dir, &source), CacheStatus::Fresh(_)));

        book.metadata.source.fingerprint.sha256 = "0".repeat(64);
        write(&book, &root).unwrap();
        assert!(matches!(check(&cache_dir, &source), CacheStatus::Stale));
    }

    #[test]
    fn damaged_caches_are_corrupted() {
        let (dir, source) = setup();
        let root = dir.path().join("cache");
        let cache_dir = write(&sample(&source), &root).unwrap();

        fs::remove_file(cache_dir.join("images/cover.jpg")).unwrap();
        assert!(matches!(load(&cache_dir), Err(CacheError::Corrupted { .. })));

        fs::write(cache_dir.join(RECORD_FILE), b"{ not json").unwrap();
        assert!(matches!(check(&cache_dir, &source), CacheStatus::Corrupted(_)));

        let mut old = serde_json::to_value(sample(&source)).unwrap();
        old["format_version"] = serde_json::json!(0);
        fs::write(cache_dir.join(RECORD_FILE), old.to_string()).unwrap();
        let err = load(&cache_dir).unwrap_err();
        assert!(err.to_string().contains("format version 0"), "{err}");
    }

    #[test]
    fn broken_invariants_are_corrupted() {
        let (dir, source) = setup();
        let cache_dir = write(&sample(&source), &dir.path().join("cache")).unwrap();
        let mut record = serde_json::to_value(sample(&source)).unwrap();
        record["toc"][0]["target"]["chapter"] = serde_json::json!(4);
        fs::write(cache_dir.join(RECORD_FILE), record.to_string()).unwrap();
        assert!(matches!(load(&cache_dir), Err(CacheError::Corrupted { .. })));
    }

    #[test]
    fn inconsistent_book_is_not_written() {
        let (dir, source) = setup();
        let root = dir.path().join("cache");
        let good = sample(&source);
        let cache_dir = write(&good, &root).unwrap();

        let mut bad = sample(&source);
        bad.toc[0].target.chapter = 4;
        bad.metadata.title = "Broken".into();
        assert!(matches!(write(&bad, &root), Err(CacheError::Inconsistent(_))));
        assert_eq!(load(&cache_dir).unwrap(), good);
        assert_eq!(fs::read_dir(&root).unwrap().count(), 1);
    }

    #[test]
    fn same_stem_sources_get_separate_caches() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let mut sources = Vec::new();
        for sub in ["a", "b"] {
            fs::create_dir(dir.path().join(sub)).unwrap();
            let source = dir.path().join(sub).join("novel.epub");
            fs::write(&source, format!("source {sub}")).unwrap();
            sources.push(source);
        }

        let first = write(&sample(&sources[0]), &root).unwrap();
        assert_eq!(first, root.join("novel_data"));
        let second = write(&sample(&sources[1]), &root).unwrap();
        assert_ne!(second, first);
        let name = second.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("novel-") && name.ends_with(DIR_SUFFIX), "{name}");

        assert_eq!(cache_dir_for(&root, &sources[0]), first);
        assert_eq!(cache_dir_for(&root, &sources[1]), second);
        assert!(matches!(check(&first, &sources[0]), CacheStatus::Fresh(_)));
        assert!(matches!(check(&second, &sources[1]), CacheStatus::Fresh(_)));
    }

    #[test]
    fn remove_cache() {
        let (dir, source) = setup();
        let cache_dir = write(&sample(&source), &dir.path().join("cache")).unwrap();
        remove(&cache_dir).unwrap();
        assert!(!cache_dir.exists());
        assert!(matches!(remove(&cache_dir), Err(CacheError::Missing(_))));
    }
}
