//! Table of contents resolution.
//!
//! Sources are tried in order: the EPUB 3 navigation document, the EPUB 2
//! NCX, then the spine itself. Targets stay archive paths here; they are
//! mapped to chapter indices once the book has been segmented.

use std::collections::HashSet;
use std::io::{Read, Seek};

use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use scraper::{ElementRef, Html};

use crate::book::{DiagnosticKind, Diagnostics};
use crate::encoding::collapse_whitespace;
use crate::readers::epub::{resolve_href, EpubArchive, Package};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocSource {
    Nav,
    Ncx,
    Spine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawTocEntry {
    /// `None` for spine fallback entries; the segmenter titles them.
    pub title: Option<String>,
    pub path: String,
    pub fragment: Option<String>,
    pub children: Vec<RawTocEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawToc {
    pub source: TocSource,
    pub entries: Vec<RawTocEntry>,
}

impl RawToc {
    /// Whether the entries came from a real navigation source rather than
    /// the spine.
    pub fn is_from_navigation(&self) -> bool {
        self.source != TocSource::Spine
    }

    /// Depth-first, document-order flattening.
    pub fn flatten(&self) -> Vec<&RawTocEntry> {
        let mut out = Vec::new();
        let mut stack: Vec<&RawTocEntry> = self.entries.iter().rev().collect();
        while let Some(entry) = stack.pop() {
            out.push(entry);
            stack.extend(entry.children.iter().rev());
        }
        out
    }
}

/// Navigation tree as written in the source, before validation.
#[derive(Debug, Default)]
struct NavNode {
    /// Identity used by the cycle guard (`navPoint@id`, `li@id`).
    key: Option<String>,
    label: String,
    href: Option<String>,
    children: Vec<NavNode>,
}

pub fn resolve_toc<R: Read + Seek>(
    archive: &mut EpubArchive<R>,
    diagnostics: &mut Diagnostics,
) -> RawToc {
    let max_depth = archive.limits().max_nesting_depth as usize;
    let package = archive.package().clone();
    let mut had_navigation = false;

    if let Some(nav_path) = package.nav_path.as_deref() {
        had_navigation = true;
        match archive.read_text(nav_path) {
            Ok(content) => {
                let nodes = parse_nav_document(&content, max_depth);
                let entries = validate(nodes, nav_path, &package, max_depth, diagnostics);
                if !entries.is_empty() {
                    return RawToc {
                        source: TocSource::Nav,
                        entries,
                    };
                }
                diagnostics.record(
                    DiagnosticKind::MalformedToc,
                    format!("navigation document {nav_path} yielded no usable entries"),
                );
            }
            Err(e) => diagnostics.record(
                DiagnosticKind::MalformedToc,
                format!("cannot read navigation document {nav_path}: {e}"),
            ),
        }
    }

    if let Some(ncx_path) = package.ncx_path().map(str::to_string) {
        had_navigation = true;
        match archive.read_text(&ncx_path) {
            Ok(content) => match parse_ncx(&content, max_depth) {
                Ok(nodes) => {
                    let entries = validate(nodes, &ncx_path, &package, max_depth, diagnostics);
                    if !entries.is_empty() {
                        return RawToc {
                            source: TocSource::Ncx,
                            entries,
                        };
                    }
                    diagnostics.record(
                        DiagnosticKind::MalformedToc,
                        format!("NCX {ncx_path} yielded no usable entries"),
                    );
                }
                Err(detail) => diagnostics.record(
                    DiagnosticKind::MalformedToc,
                    format!("cannot parse NCX {ncx_path}: {detail}"),
                ),
            },
            Err(e) => diagnostics.record(
                DiagnosticKind::MalformedToc,
                format!("cannot read NCX {ncx_path}: {e}"),
            ),
        }
    }

    if !had_navigation {
        diagnostics.record(
            DiagnosticKind::MissingToc,
            "no navigation document or NCX; using spine order",
        );
    }
    spine_toc(&package)
}

/// One untitled entry per spine document.
pub fn spine_toc(package: &Package) -> RawToc {
    RawToc {
        source: TocSource::Spine,
        entries: package
            .spine
            .iter()
            .map(|item| RawTocEntry {
                title: None,
                path: item.path.clone(),
                fragment: None,
                children: Vec::new(),
            })
            .collect(),
    }
}

/// Readable title from a file name: `chapter_01-intro.xhtml` → `Chapter 01 Intro`.
pub fn title_from_file_name(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    let words: Vec<String> = stem
        .split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        "Untitled".to_string()
    } else {
        words.join(" ")
    }
}

// --- Validation ---

fn validate(
    nodes: Vec<NavNode>,
    base_path: &str,
    package: &Package,
    max_depth: usize,
    diagnostics: &mut Diagnostics,
) -> Vec<RawTocEntry> {
    let mut visited = HashSet::new();
    validate_level(nodes, base_path, package, 0, max_depth, &mut visited, diagnostics)
}

fn validate_level(
    nodes: Vec<NavNode>,
    base_path: &str,
    package: &Package,
    depth: usize,
    max_depth: usize,
    visited: &mut HashSet<String>,
    diagnostics: &mut Diagnostics,
) -> Vec<RawTocEntry> {
    let mut out = Vec::new();
    for node in nodes {
        if let Some(key) = &node.key {
            if !visited.insert(key.clone()) {
                diagnostics.record(
                    DiagnosticKind::TocCycle,
                    format!("TOC node '{key}' repeats; its subtree is skipped"),
                );
                continue;
            }
        }

        let children = if depth + 1 >= max_depth {
            if !node.children.is_empty() {
                diagnostics.record(
                    DiagnosticKind::MalformedToc,
                    format!(
                        "TOC nesting deeper than {max_depth} levels under '{}' truncated",
                        node.label
                    ),
                );
            }
            Vec::new()
        } else {
            validate_level(
                node.children,
                base_path,
                package,
                depth + 1,
                max_depth,
                visited,
                diagnostics,
            )
        };

        let label = collapse_whitespace(&node.label);
        let title = Some(label.clone()).filter(|l| !l.is_empty());
        let href = node.href.as_deref().map(str::trim).filter(|h| !h.is_empty());

        match href {
            Some(href) => match resolve_href(base_path, href) {
                Some(target) if package.spine_position(&target.path).is_some() => {
                    out.push(RawTocEntry {
                        title: title.or_else(|| Some(title_from_file_name(&target.path))),
                        path: target.path,
                        fragment: target.fragment,
                        children,
                    });
                }
                resolved => {
                    let reason = match resolved {
                        Some(target) if package.contains_path(&target.path) => {
                            "is not part of the spine"
                        }
                        Some(_) => "is not in the manifest",
                        None => "points outside the book",
                    };
                    diagnostics.record(
                        DiagnosticKind::DroppedTocEntry,
                        format!("TOC entry '{label}' ({href}) {reason}"),
                    );
                    out.extend(children);
                }
            },
            None => match children.first() {
                Some(first) => {
                    let (path, fragment) = (first.path.clone(), first.fragment.clone());
                    out.push(RawTocEntry {
                        title: title.or_else(|| first.title.clone()),
                        path,
                        fragment,
                        children,
                    });
                }
                None => diagnostics.record(
                    DiagnosticKind::DroppedTocEntry,
                    format!("TOC entry '{label}' has neither a link nor children"),
                ),
            },
        }
    }
    out
}

// --- EPUB 3 navigation document ---

fn parse_nav_document(content: &str, max_depth: usize) -> Vec<NavNode> {
    let document = Html::parse_document(content);
    let navs: Vec<ElementRef<'_>> = document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "nav")
        .collect();

    let is_toc_type = |el: &ElementRef<'_>| {
        el.value()
            .attr("epub:type")
            .map_or(false, |t| t.split_whitespace().any(|t| t == "toc"))
    };
    let nav = navs
        .iter()
        .find(|el| is_toc_type(*el))
        .or_else(|| navs.iter().find(|el| el.value().attr("role") == Some("doc-toc")))
        .or_else(|| navs.first());

    let Some(nav) = nav else {
        return Vec::new();
    };
    let list = nav
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| matches!(el.value().name(), "ol" | "ul"));
    match list {
        Some(list) => parse_nav_list(list, 0, max_depth),
        None => Vec::new(),
    }
}

fn parse_nav_list(list: ElementRef<'_>, depth: usize, max_depth: usize) -> Vec<NavNode> {
    let mut nodes = Vec::new();
    for li in list
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "li")
    {
        let mut node = NavNode {
            key: li.value().attr("id").map(|id| format!("li#{id}")),
            ..NavNode::default()
        };
        for child in li.children().filter_map(ElementRef::wrap) {
            match child.value().name() {
                "a" if node.href.is_none() && node.label.is_empty() => {
                    node.label = child.text().collect();
                    node.href = child.value().attr("href").map(str::to_string);
                }
                "span" if node.label.is_empty() => {
                    node.label = child.text().collect();
                }
                "ol" | "ul" if node.children.is_empty() => {
                    if depth + 1 < max_depth {
                        node.children = parse_nav_list(child, depth + 1, max_depth);
                    }
                }
                _ => {}
            }
        }
        nodes.push(node);
    }
    nodes
}

// --- EPUB 2 NCX ---

fn parse_ncx(content: &str, max_depth: usize) -> Result<Vec<NavNode>, String> {
    let mut reader = XmlReader::from_str(content);
    let mut buf = Vec::new();

    // stack[0] collects the top level; one frame per open navPoint.
    let mut stack: Vec<NavNode> = vec![NavNode::default()];
    let mut skipped_depth = 0usize;
    let mut in_label_text = false;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| e.to_string())?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                match e.local_name().as_ref() {
                    b"navPoint" if is_start => {
                        if skipped_depth > 0 || stack.len() > max_depth {
                            skipped_depth += 1;
                        } else {
                            let key = e
                                .attributes()
                                .flatten()
                                .find(|a| a.key.local_name().as_ref() == b"id")
                                .map(|a| format!("navPoint#{}", String::from_utf8_lossy(&a.value)));
                            stack.push(NavNode {
                                key,
                                ..NavNode::default()
                            });
                        }
                    }
                    b"text" if is_start && skipped_depth == 0 && stack.len() > 1 => {
                        in_label_text = true;
                    }
                    b"content" if skipped_depth == 0 && stack.len() > 1 => {
                        let src = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.local_name().as_ref() == b"src")
                            .map(|a| {
                                a.unescape_value()
                                    .map(|v| v.into_owned())
                                    .unwrap_or_else(|_| {
                                        String::from_utf8_lossy(&a.value).into_owned()
                                    })
                            });
                        if let Some(current) = stack.last_mut() {
                            if current.href.is_none() {
                                current.href = src;
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref e) if in_label_text => {
                if let Some(current) = stack.last_mut() {
                    current.label.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"text" => in_label_text = false,
                b"navPoint" => {
                    if skipped_depth > 0 {
                        skipped_depth -= 1;
                    } else if stack.len() > 1 {
                        if let Some(done) = stack.pop() {
                            if let Some(parent) = stack.last_mut() {
                                parent.children.push(done);
                            }
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // Unclosed navPoints in truncated files are kept.
    while stack.len() > 1 {
        if let Some(done) = stack.pop() {
            if let Some(parent) = stack.last_mut() {
                parent.children.push(done);
            }
        }
    }
    Ok(stack.pop().map(|root| root.children).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityLimits;
    use pretty_assertions::assert_eq;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

    fn opf(with_nav: bool, with_ncx: bool) -> String {
        let nav = if with_nav {
            r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#
        } else {
            ""
        };
        let ncx = if with_ncx {
            r#"<item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>"#
        } else {
            ""
        };
        format!(
            r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>T</dc:title></metadata>
  <manifest>
    {nav}{ncx}
    <item id="c1" href="text/c1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="text/c2.xhtml" media-type="application/xhtml+xml"/>
    <item id="extra" href="text/extra.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="c1"/><itemref idref="c2"/></spine>
</package>"#
        )
    }

    fn archive(files: &[(&str, String)]) -> EpubArchive<Cursor<Vec<u8>>> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("META-INF/container.xml", FileOptions::<'_, ()>::default())
            .unwrap();
        zip.write_all(CONTAINER.as_bytes()).unwrap();
        for (name, content) in files {
            zip.start_file(*name, FileOptions::<'_, ()>::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        let bytes = zip.finish().unwrap().into_inner();
        EpubArchive::from_reader(Cursor::new(bytes), &SecurityLimits::default()).unwrap()
    }

    fn titles(toc: &RawToc) -> Vec<String> {
        toc.flatten()
            .iter()
            .map(|e| e.title.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn nav_document_is_preferred() {
        let nav = r#"<html xmlns:epub="http://www.idpf.org/2007/ops"><body>
<nav epub:type="landmarks"><ol><li><a href="text/c2.xhtml">Landmark</a></li></ol></nav>
<nav epub:type="toc"><ol>
  <li><a href="text/c1.xhtml">One</a>
    <ol><li><a href="text/c1.xhtml#s1">One.A</a></li></ol>
  </li>
  <li><a href="text/c2.xhtml">Two</a></li>
</ol></nav></body></html>"#;
        let mut archive = archive(&[
            ("OEBPS/content.opf", opf(true, false)),
            ("OEBPS/nav.xhtml", nav.to_string()),
        ]);
        let mut diags = Diagnostics::new();
        let toc = resolve_toc(&mut archive, &mut diags);
        assert_eq!(toc.source, TocSource::Nav);
        assert_eq!(titles(&toc), vec!["One", "One.A", "Two"]);
        assert_eq!(toc.entries[0].children[0].fragment.as_deref(), Some("s1"));
        assert_eq!(toc.entries[0].path, "OEBPS/text/c1.xhtml");
    }

    #[test]
    fn ncx_used_when_nav_missing() {
        let ncx = r#"<?xml version="1.0"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/"><navMap>
  <navPoint id="p1"><navLabel><text>First</text></navLabel><content src="text/c1.xhtml"/>
    <navPoint id="p1a"><navLabel><text>Gone</text></navLabel><content src="text/missing.xhtml"/>
      <navPoint id="p1b"><navLabel><text>Promoted</text></navLabel><content src="text/c1.xhtml#deep"/></navPoint>
    </navPoint>
  </navPoint>
  <navPoint id="p2"><navLabel><text>Second</text></navLabel><content src="text/c2.xhtml"/></navPoint>
  <navPoint id="p2"><navLabel><text>Repeat</text></navLabel><content src="text/c2.xhtml"/></navPoint>
</navMap></ncx>"#;
        let mut archive = archive(&[
            ("OEBPS/content.opf", opf(false, true)),
            ("OEBPS/toc.ncx", ncx.to_string()),
        ]);
        let mut diags = Diagnostics::new();
        let toc = resolve_toc(&mut archive, &mut diags);
        assert_eq!(toc.source, TocSource::Ncx);
        assert_eq!(titles(&toc), vec!["First", "Promoted", "Second"]);
        assert_eq!(diags.count(DiagnosticKind::DroppedTocEntry), 1);
        assert_eq!(diags.count(DiagnosticKind::TocCycle), 1);
    }

    #[test]
    fn label_only_entry_takes_first_child_target() {
        let nav = r#"<html><body><nav><ol>
  <li><span>Part I</span><ol><li><a href="text/c2.xhtml#x">Inner</a></li></ol></li>
</ol></nav></body></html>"#;
        let mut archive = archive(&[
            ("OEBPS/content.opf", opf(true, false)),
            ("OEBPS/nav.xhtml", nav.to_string()),
        ]);
        let toc = resolve_toc(&mut archive, &mut Diagnostics::new());
        assert_eq!(toc.entries[0].title.as_deref(), Some("Part I"));
        assert_eq!(toc.entries[0].path, "OEBPS/text/c2.xhtml");
        assert_eq!(toc.entries[0].fragment.as_deref(), Some("x"));
    }

    #[test]
    fn non_spine_targets_are_dropped() {
        let nav = r#"<html><body><nav><ol>
  <li><a href="text/extra.xhtml">Extra</a></li>
  <li><a href="http://example.com/">Web</a></li>
</ol></nav></body></html>"#;
        let mut archive = archive(&[
            ("OEBPS/content.opf", opf(true, false)),
            ("OEBPS/nav.xhtml", nav.to_string()),
        ]);
        let mut diags = Diagnostics::new();
        let toc = resolve_toc(&mut archive, &mut diags);
        assert_eq!(toc.source, TocSource::Spine);
        assert_eq!(diags.count(DiagnosticKind::DroppedTocEntry), 2);
        assert_eq!(diags.count(DiagnosticKind::MalformedToc), 1);
    }

    #[test]
    fn repeated_nav_ids_are_skipped_as_cycles() {
        let nav = r#"<html><body><nav epub:type="toc"><ol>
  <li id="a"><a href="text/c1.xhtml">One</a>
    <ol><li id="a"><a href="text/c1.xhtml#loop">Loop</a></li></ol>
  </li>
  <li id="b"><a href="text/c2.xhtml">Two</a></li>
  <li id="b"><a href="text/c2.xhtml#again">Two again</a></li>
</ol></nav></body></html>"#;
        let mut archive = archive(&[
            ("OEBPS/content.opf", opf(true, false)),
            ("OEBPS/nav.xhtml", nav.to_string()),
        ]);
        let mut diags = Diagnostics::new();
        let toc = resolve_toc(&mut archive, &mut diags);
        assert_eq!(toc.source, TocSource::Nav);
        assert_eq!(titles(&toc), vec!["One", "Two"]);
        assert!(toc.entries[0].children.is_empty());
        assert_eq!(diags.count(DiagnosticKind::TocCycle), 2);
    }

    #[test]
    fn unusable_nav_falls_back_to_ncx_then_spine() {
        let nav = r#"<html><body><nav epub:type="toc"><ol>
  <li><a href="text/extra.xhtml">Not in spine</a></li>
  <li><a href="text/missing.xhtml">Missing</a></li>
</ol></nav></body></html>"#;
        let ncx = r#"<?xml version="1.0"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/"><navMap>
  <navPoint id="p1"><navLabel><text>From NCX</text></navLabel><content src="text/c2.xhtml"/></navPoint>
</navMap></ncx>"#;
        let mut with_ncx = archive(&[
            ("OEBPS/content.opf", opf(true, true)),
            ("OEBPS/nav.xhtml", nav.to_string()),
            ("OEBPS/toc.ncx", ncx.to_string()),
        ]);
        let mut diags = Diagnostics::new();
        let toc = resolve_toc(&mut with_ncx, &mut diags);
        assert_eq!(toc.source, TocSource::Ncx);
        assert_eq!(titles(&toc), vec!["From NCX"]);
        assert_eq!(diags.count(DiagnosticKind::MalformedToc), 1);

        let broken_ncx = "<ncx><navMap><navPoint id=\"p1\"><content src=\"text/extra.xhtml\"/></navPoint></navMap></ncx>";
        let mut both_unusable = archive(&[
            ("OEBPS/content.opf", opf(true, true)),
            ("OEBPS/nav.xhtml", nav.to_string()),
            ("OEBPS/toc.ncx", broken_ncx.to_string()),
        ]);
        let mut diags = Diagnostics::new();
        let toc = resolve_toc(&mut both_unusable, &mut diags);
        assert_eq!(toc.source, TocSource::Spine);
        assert_eq!(toc.entries.len(), 2);
        assert_eq!(diags.count(DiagnosticKind::MalformedToc), 2);
        assert_eq!(diags.count(DiagnosticKind::MissingToc), 0);
    }

    #[test]
    fn spine_fallback_without_navigation() {
        let mut archive = archive(&[("OEBPS/content.opf", opf(false, false))]);
        let mut diags = Diagnostics::new();
        let toc = resolve_toc(&mut archive, &mut diags);
        assert_eq!(toc.source, TocSource::Spine);
        let paths: Vec<&str> = toc.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["OEBPS/text/c1.xhtml", "OEBPS/text/c2.xhtml"]);
        assert_eq!(diags.count(DiagnosticKind::MissingToc), 1);
    }

    #[test]
    fn deep_nesting_is_truncated() {
        let mut nodes = Vec::new();
        for _ in 0..10 {
            nodes = vec![NavNode {
                key: None,
                label: "level".into(),
                href: Some("text/c1.xhtml".into()),
                children: nodes,
            }];
        }
        let archive = archive(&[("OEBPS/content.opf", opf(false, false))]);
        let package = archive.package().clone();
        let mut diags = Diagnostics::new();
        let entries = validate(nodes, "OEBPS/nav.xhtml", &package, 4, &mut diags);
        let toc = RawToc {
            source: TocSource::Nav,
            entries,
        };
        assert_eq!(toc.flatten().len(), 4);
        assert_eq!(diags.count(DiagnosticKind::MalformedToc), 1);
    }

    #[test]
    fn file_name_titles() {
        assert_eq!(title_from_file_name("OEBPS/chapter_01-intro.xhtml"), "Chapter 01 Intro");
        assert_eq!(title_from_file_name("x/.xhtml"), "Untitled");
    }
}
