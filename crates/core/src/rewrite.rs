//! Link and asset rewriting.
//!
//! Intra-book links are mapped onto chapter indices through the
//! [`AnchorIndex`] built by the segmenter; images are pulled out of the source
//! once each and referenced by their cache path.

use std::collections::HashMap;
use std::io::{Read, Seek};

use crate::book::{Chapter, ChapterLink, DiagnosticKind, Diagnostics, ImageAsset, ImageIndex};
use crate::error::ReadError;
use crate::html::{self, HtmlElement};
use crate::readers::epub::{decode_href, is_external, resolve_href, EpubArchive};
use crate::segment::{AnchorIndex, DraftChapter};

/// Directory inside a book's cache that holds extracted images.
pub const IMAGE_DIR: &str = "images";

const DEAD_LINK_CLASS: &str = "dead-link";

/// Where image bytes come from.
pub trait ImageSource {
    /// The source path holding the image at `path`, falling back to a
    /// resource with the same file name.
    fn locate(&self, path: &str) -> Option<String>;

    /// Image bytes and media type.
    fn load(&mut self, path: &str) -> Result<(Vec<u8>, String), ReadError>;
}

impl<R: Read + Seek> ImageSource for EpubArchive<R> {
    fn locate(&self, path: &str) -> Option<String> {
        if self.contains(path) {
            return Some(path.to_string());
        }
        let name = file_name(path).to_lowercase();
        let mut candidates: Vec<&str> = self
            .package()
            .manifest
            .values()
            .filter(|item| item.is_image() && file_name(&item.path).to_lowercase() == name)
            .map(|item| item.path.as_str())
            .collect();
        candidates.sort_unstable();
        candidates.first().map(|p| p.to_string())
    }

    fn load(&mut self, path: &str) -> Result<(Vec<u8>, String), ReadError> {
        let data = self.read_bytes(path)?;
        let media_type = self
            .package()
            .item_by_path(path)
            .map(|item| item.media_type.clone())
            .unwrap_or_else(|| media_type_for(path).to_string());
        Ok((data, media_type))
    }
}

/// For sources without embedded resources.
pub struct NoImages;

impl ImageSource for NoImages {
    fn locate(&self, _path: &str) -> Option<String> {
        None
    }

    fn load(&mut self, path: &str) -> Result<(Vec<u8>, String), ReadError> {
        Err(ReadError::MissingEntry(path.to_string()))
    }
}

/// Cache path for the image at `path`, extracting it into `index` on first
/// use. `Ok(None)` when it cannot be found or read; security violations are
/// errors.
pub fn extract_image(
    index: &mut ImageIndex,
    path: &str,
    source: &mut impl ImageSource,
    diagnostics: &mut Diagnostics,
) -> Result<Option<String>, ReadError> {
    let Some(found) = source.locate(path) else {
        diagnostics.record(DiagnosticKind::MissingImage, format!("{path} not found"));
        return Ok(None);
    };
    if let Some(asset) = index.get(&found) {
        return Ok(Some(asset.cache_path.clone()));
    }
    let (data, media_type) = match source.load(&found) {
        Ok(loaded) => loaded,
        Err(ReadError::Security(e)) => return Err(ReadError::Security(e)),
        Err(e) => {
            diagnostics.record(DiagnosticKind::MissingImage, format!("{found}: {e}"));
            return Ok(None);
        }
    };
    let cache_path = cache_name(index, &found, &media_type);
    tracing::debug!(original = %found, cache = %cache_path, bytes = data.len(), "extracted image");
    index.insert(ImageAsset {
        original_path: found,
        cache_path: cache_path.clone(),
        media_type,
        data,
    });
    Ok(Some(cache_path))
}

/// `images/<sanitized-stem>[-n].<ext>`, unused in `index`.
fn cache_name(index: &ImageIndex, path: &str, media_type: &str) -> String {
    let name = file_name(path);
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext.to_lowercase()),
        _ => (name, String::new()),
    };
    let ext = if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        ext
    } else {
        extension_for(media_type).to_string()
    };
    let stem = sanitize(stem);

    let mut candidate = format!("{IMAGE_DIR}/{stem}.{ext}");
    let mut n = 1;
    while index.contains_cache_path(&candidate) {
        candidate = format!("{IMAGE_DIR}/{stem}-{n}.{ext}");
        n += 1;
    }
    candidate
}

/// Rewrite links and images in every draft and produce the final chapters.
pub fn rewrite_chapters(
    drafts: Vec<DraftChapter>,
    anchors: &AnchorIndex,
    images: &mut impl ImageSource,
    diagnostics: &mut Diagnostics,
) -> Result<(Vec<Chapter>, ImageIndex), ReadError> {
    let chapter_ids: Vec<Vec<String>> = drafts
        .iter()
        .map(|d| html::collect_ids(&d.blocks))
        .collect();
    let mut image_index = ImageIndex::new();
    let mut chapters = Vec::with_capacity(drafts.len());

    for (index, draft) in drafts.into_iter().enumerate() {
        let mut blocks = draft.blocks;
        let mut chapter_images = Vec::new();
        if let Some(base) = draft.source_href.as_deref() {
            rewrite_links(&mut blocks, base, anchors, &chapter_ids, diagnostics);
            chapter_images = rewrite_images(&mut blocks, base, &mut image_index, images, diagnostics)?;
        }
        chapters.push(Chapter {
            index,
            title: draft.title,
            source_href: draft.source_href,
            content: html::serialize(&blocks),
            text: html::text_content(&blocks),
            anchors: chapter_ids[index].clone(),
            images: chapter_images,
        });
    }

    Ok((chapters, image_index))
}

fn rewrite_links(
    blocks: &mut [html::HtmlNode],
    base: &str,
    anchors: &AnchorIndex,
    chapter_ids: &[Vec<String>],
    diagnostics: &mut Diagnostics,
) {
    html::for_each_element_mut(blocks, &mut |el: &mut HtmlElement| {
        if el.name != "a" {
            return;
        }
        let Some(href) = el.attr("href").map(str::to_string) else {
            return;
        };
        if is_external(&href) {
            make_dead(el);
            return;
        }
        let target = resolve_href(base, &href)
            .and_then(|r| anchors.lookup(&r.path, r.fragment.as_deref()).map(|c| (c, r.fragment)));
        match target {
            Some((chapter, fragment)) if chapter < chapter_ids.len() => {
                let fragment = fragment.filter(|f| chapter_ids[chapter].iter().any(|id| id == f));
                let link = ChapterLink { chapter, fragment };
                el.set_attr("href", link.href());
                el.set_attr("data-chapter", chapter.to_string());
            }
            _ => {
                diagnostics.record(
                    DiagnosticKind::DanglingLink,
                    format!("link {href} in {base} has no target in the book"),
                );
                make_dead(el);
            }
        }
    });
}

fn make_dead(el: &mut HtmlElement) {
    // Legacy `<a name>` targets stay reachable as ids.
    if el.name == "a" && el.attr("id").is_none() {
        if let Some(name) = el.attr("name").map(str::to_string) {
            el.set_attr("id", name);
        }
    }
    el.name = "span".to_string();
    el.attrs.retain(|(k, _)| k == "id");
    el.set_attr("class", DEAD_LINK_CLASS);
}

fn image_ref(el: &HtmlElement) -> Option<(&'static str, &str)> {
    match el.name.as_str() {
        "img" => el.attr("src").map(|v| ("src", v)),
        "image" => el.attr("href").map(|v| ("href", v)),
        _ => None,
    }
}

/// Extract every image the blocks reference and point the references at the
/// cache. Returns the chapter's cache paths in first-use order.
fn rewrite_images(
    blocks: &mut [html::HtmlNode],
    base: &str,
    index: &mut ImageIndex,
    source: &mut impl ImageSource,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<String>, ReadError> {
    let mut refs: Vec<String> = Vec::new();
    html::for_each_element(blocks, |el| {
        if let Some((_, value)) = image_ref(el) {
            if !refs.iter().any(|r| r == value) {
                refs.push(value.to_string());
            }
        }
    });

    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut used = Vec::new();
    for reference in refs {
        if is_external(&reference) {
            continue;
        }
        let path = match resolve_href(base, &reference) {
            Some(r) => r.path,
            None => decode_href(reference.split('#').next().unwrap_or_default()),
        };
        if let Some(cache_path) = extract_image(index, &path, source, diagnostics)? {
            if !used.contains(&cache_path) {
                used.push(cache_path.clone());
            }
            resolved.insert(reference, cache_path);
        }
    }

    html::for_each_element_mut(blocks, &mut |el: &mut HtmlElement| {
        let Some((attr, value)) = image_ref(el) else {
            return;
        };
        if let Some(cache_path) = resolved.get(value) {
            el.set_attr(attr, cache_path.as_str());
        }
    });
    Ok(used)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn sanitize(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn media_type_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        _ => "bin",
    }
}
