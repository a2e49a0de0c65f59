//! Chapter segmentation: turns a source into ordered draft chapters.
//!
//! EPUB sources are split along spine documents and TOC fragment boundaries
//! ([`epub`]); plain text is split by heuristic cues ([`txt`]). Both produce
//! a [`Segmentation`] that the rewriter turns into final chapters.

pub mod epub;
pub mod txt;

use std::collections::HashMap;

use crate::html::HtmlNode;

/// A chapter before link rewriting and image extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftChapter {
    pub title: String,
    /// Spine document the chapter starts in (EPUB only).
    pub source_href: Option<String>,
    pub blocks: Vec<HtmlNode>,
}

/// Maps archive locations to the chapters that now hold them.
#[derive(Debug, Clone, Default)]
pub struct AnchorIndex {
    documents: HashMap<String, usize>,
    fragments: HashMap<(String, String), usize>,
}

impl AnchorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the chapter holding the start of a document. First one wins.
    pub fn insert_document(&mut self, path: &str, chapter: usize) {
        self.documents.entry(path.to_string()).or_insert(chapter);
    }

    pub fn insert_fragment(&mut self, path: &str, fragment: &str, chapter: usize) {
        self.fragments
            .entry((path.to_string(), fragment.to_string()))
            .or_insert(chapter);
    }

    /// Chapter holding `path#fragment`, falling back to the document start
    /// when the fragment is unknown.
    pub fn lookup(&self, path: &str, fragment: Option<&str>) -> Option<usize> {
        if let Some(fragment) = fragment {
            if let Some(&chapter) = self
                .fragments
                .get(&(path.to_string(), fragment.to_string()))
            {
                return Some(chapter);
            }
        }
        self.documents.get(path).copied()
    }

    pub fn contains_document(&self, path: &str) -> bool {
        self.documents.contains_key(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    pub chapters: Vec<DraftChapter>,
    pub anchors: AnchorIndex,
}
