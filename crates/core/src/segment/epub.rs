//! Spine documents to chapters.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek};

use crate::book::{DiagnosticKind, Diagnostics};
use crate::error::ReadError;
use crate::html::{self, HtmlNode};
use crate::readers::epub::EpubArchive;
use crate::toc::{title_from_file_name, RawToc};

use super::{AnchorIndex, DraftChapter, Segmentation};

/// A TOC entry that starts a chapter inside a given document.
struct Boundary<'a> {
    fragment: Option<&'a str>,
    title: Option<&'a str>,
}

/// A slice of a document's blocks that becomes (part of) a chapter.
struct Piece {
    start: usize,
    title: Option<String>,
    /// Whether a TOC entry starts here.
    listed: bool,
}

/// Turn the spine into draft chapters, split at TOC fragment boundaries.
///
/// Documents that cannot be read or are not XHTML are skipped with a
/// diagnostic. Security violations abort the run.
pub fn segment<R: Read + Seek>(
    archive: &mut EpubArchive<R>,
    toc: &RawToc,
    diagnostics: &mut Diagnostics,
) -> Result<Segmentation, ReadError> {
    let mut boundaries: HashMap<&str, Vec<Boundary<'_>>> = HashMap::new();
    for entry in toc.flatten() {
        boundaries
            .entry(entry.path.as_str())
            .or_default()
            .push(Boundary {
                fragment: entry.fragment.as_deref(),
                title: entry.title.as_deref(),
            });
    }

    let spine = archive.package().spine.clone();
    let mut chapters: Vec<DraftChapter> = Vec::new();
    let mut anchors = AnchorIndex::new();

    for item in &spine {
        if anchors.contains_document(&item.path) {
            diagnostics.record(
                DiagnosticKind::SkippedSpineItem,
                format!("{} appears more than once in the spine", item.path),
            );
            continue;
        }
        let is_xhtml = archive
            .package()
            .item_by_path(&item.path)
            .map_or(false, |m| m.is_xhtml());
        if !is_xhtml {
            diagnostics.record(
                DiagnosticKind::SkippedSpineItem,
                format!("{} ({}) is not an XHTML document", item.path, item.media_type),
            );
            continue;
        }
        let source = match archive.read_text(&item.path) {
            Ok(source) => source,
            Err(ReadError::Security(e)) => return Err(ReadError::Security(e)),
            Err(e) => {
                diagnostics.record(
                    DiagnosticKind::SkippedSpineItem,
                    format!("{}: {}", item.path, e),
                );
                continue;
            }
        };

        let document = html::parse_document(&source);
        let blocks = html::top_level_blocks(document.body);
        let block_ids: Vec<Vec<String>> = blocks
            .iter()
            .map(|b| html::collect_ids(std::slice::from_ref(b)))
            .collect();

        let entries = boundaries.get(item.path.as_str()).map(Vec::as_slice).unwrap_or(&[]);
        let pieces = split_points(entries, &block_ids);
        tracing::debug!(path = %item.path, blocks = blocks.len(), pieces = pieces.len(), "segmenting document");

        let mut remaining = blocks.into_iter();
        let mut consumed = 0;
        for (n, piece) in pieces.iter().enumerate() {
            let end = pieces.get(n + 1).map_or(block_ids.len(), |next| next.start);
            let piece_blocks: Vec<HtmlNode> = remaining.by_ref().take(end - consumed).collect();
            let ids: Vec<&String> = block_ids[piece.start..end].iter().flatten().collect();
            consumed = end;

            let merge = !piece.listed
                && toc.is_from_navigation()
                && !chapters.is_empty()
                && !html::has_heading(&piece_blocks);
            let index = if merge {
                let index = chapters.len() - 1;
                chapters[index].blocks.extend(piece_blocks);
                index
            } else {
                let title = piece
                    .title
                    .clone()
                    .or_else(|| html::first_heading(&piece_blocks))
                    .or_else(|| {
                        if toc.is_from_navigation() {
                            None
                        } else {
                            document
                                .title
                                .clone()
                                .or_else(|| Some(title_from_file_name(&item.path)))
                        }
                    })
                    .unwrap_or_else(|| format!("Chapter {}", chapters.len() + 1));
                chapters.push(DraftChapter {
                    title,
                    source_href: Some(item.path.clone()),
                    blocks: piece_blocks,
                });
                chapters.len() - 1
            };

            if piece.start == 0 {
                anchors.insert_document(&item.path, index);
            }
            for id in ids {
                anchors.insert_fragment(&item.path, id, index);
            }
        }
    }

    Ok(Segmentation { chapters, anchors })
}

/// Where a document splits. A fragment snaps to the top-level block that
/// contains it; an unknown fragment counts as the document start. The first
/// entry at a position names the piece.
fn split_points(entries: &[Boundary<'_>], block_ids: &[Vec<String>]) -> Vec<Piece> {
    let mut starts: BTreeMap<usize, Option<String>> = BTreeMap::new();
    for entry in entries {
        let start = entry
            .fragment
            .and_then(|f| block_ids.iter().position(|ids| ids.iter().any(|id| id == f)))
            .unwrap_or(0);
        let title = starts.entry(start).or_insert(None);
        if title.is_none() {
            *title = entry.title.map(str::to_string);
        }
    }

    let mut pieces = Vec::with_capacity(starts.len() + 1);
    if !starts.contains_key(&0) {
        pieces.push(Piece {
            start: 0,
            title: None,
            listed: false,
        });
    }
    pieces.extend(starts.into_iter().map(|(start, title)| Piece {
        start,
        title,
        listed: true,
    }));
    pieces
}
