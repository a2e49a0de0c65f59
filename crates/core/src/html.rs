//! Content document handling: parse (via `scraper`), clean, and serialize.
//!
//! Documents are converted into a small owned tree ([`HtmlNode`]) holding
//! only the body content. Cleaning happens during conversion: unsafe or
//! interactive elements, comments, event handler attributes and
//! `javascript:` URLs never make it into the tree.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node};

use crate::encoding::collapse_whitespace;

/// Elements dropped together with their content.
const REMOVED_ELEMENTS: &[&str] = &[
    "script", "style", "iframe", "video", "nav", "form", "button", "input", "object", "embed",
    "noscript", "template",
];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

const INLINE_ELEMENTS: &[&str] = &[
    "a", "abbr", "b", "bdi", "bdo", "big", "cite", "code", "del", "dfn", "em", "font", "i",
    "ins", "kbd", "mark", "q", "rb", "rp", "rt", "ruby", "s", "samp", "small", "span", "strong",
    "sub", "sup", "time", "tt", "u", "var",
];

/// Containers the block splitter may look through when they are the only child.
const WRAPPER_ELEMENTS: &[&str] = &["div", "section", "article", "main", "body"];

/// Deeper subtrees are flattened to their text.
const MAX_TREE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum HtmlNode {
    Element(HtmlElement),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HtmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<HtmlNode>,
}

impl HtmlElement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_text(name: &str, text: &str) -> Self {
        let mut el = Self::new(name);
        el.children.push(HtmlNode::Text(text.to_string()));
        el
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn is_heading(&self) -> bool {
        heading_level(&self.name).is_some()
    }
}

impl HtmlNode {
    pub fn as_element(&self) -> Option<&HtmlElement> {
        match self {
            HtmlNode::Element(el) => Some(el),
            HtmlNode::Text(_) => None,
        }
    }

    fn is_blank_text(&self) -> bool {
        matches!(self, HtmlNode::Text(t) if t.trim().is_empty())
    }
}

fn heading_level(name: &str) -> Option<u8> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

/// A cleaned content document.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    /// Text of `<head><title>`, whitespace-collapsed.
    pub title: Option<String>,
    /// Cleaned children of `<body>`.
    pub body: Vec<HtmlNode>,
}

/// XHTML self-closing syntax on non-void elements (`<title/>`, `<div/>`)
/// means "open" to an HTML parser and swallows the rest of the document.
fn expand_self_closing(source: &str) -> std::borrow::Cow<'_, str> {
    static SELF_CLOSING: OnceLock<Regex> = OnceLock::new();
    let re = SELF_CLOSING.get_or_init(|| {
        Regex::new(r#"<([A-Za-z][A-Za-z0-9:_-]*)((?:\s+[^<>]*?)?)\s*/>"#).unwrap()
    });
    re.replace_all(source, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        if VOID_ELEMENTS.contains(&name.to_ascii_lowercase().as_str()) {
            caps[0].to_string()
        } else {
            format!("<{}{}></{}>", name, &caps[2], name)
        }
    })
}

/// Parse and clean a content document.
pub fn parse_document(source: &str) -> ParsedDocument {
    let source = expand_self_closing(source);
    let document = Html::parse_document(&source);
    let root = document.root_element();

    let title = child_element(root, "head")
        .and_then(|head| child_element(head, "title"))
        .map(|t| collapse_whitespace(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    let mut body = Vec::new();
    match child_element(root, "body") {
        Some(el) => convert_children(el, false, 0, &mut body),
        None => convert_children(root, false, 0, &mut body),
    }
    ParsedDocument { title, body }
}

/// Parse a fragment previously produced by [`serialize`].
pub fn parse_fragment(fragment: &str) -> Vec<HtmlNode> {
    parse_document(&format!("<html><body>{fragment}</body></html>")).body
}

fn child_element<'a>(parent: ElementRef<'a>, name: &str) -> Option<ElementRef<'a>> {
    parent
        .children()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == name)
}

fn is_unsafe_url(value: &str) -> bool {
    let v: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    v.starts_with("javascript:") || v.starts_with("vbscript:")
}

fn convert_children(parent: ElementRef<'_>, in_svg: bool, depth: usize, out: &mut Vec<HtmlNode>) {
    for child in parent.children() {
        match child.value() {
            Node::Text(text) => out.push(HtmlNode::Text(String::from(&*text.text))),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    if let Some(node) = convert_element(el, in_svg, depth + 1) {
                        out.push(node);
                    }
                }
            }
            _ => {}
        }
    }
}

fn convert_element(el: ElementRef<'_>, in_svg: bool, depth: usize) -> Option<HtmlNode> {
    // html5ever already lowercases HTML names and case-adjusts SVG ones.
    let name = el.value().name().to_string();
    if REMOVED_ELEMENTS.contains(&name.as_str()) {
        return None;
    }
    if depth > MAX_TREE_DEPTH {
        let text = el.text().collect::<String>();
        return Some(HtmlNode::Text(text));
    }

    let in_svg = in_svg || name == "svg";
    let mut attrs = Vec::new();
    for (key, value) in el.value().attrs() {
        let lower = key.to_ascii_lowercase();
        if lower.starts_with("on") || lower == "xmlns" || lower.starts_with("xmlns:") {
            continue;
        }
        // html5ever maps `xmlns:xlink` on SVG content to a bare `xlink`.
        if in_svg && lower == "xlink" {
            continue;
        }
        if matches!(lower.as_str(), "href" | "src" | "action" | "formaction")
            && is_unsafe_url(value)
        {
            continue;
        }
        attrs.push((key.to_string(), value.to_string()));
    }

    let mut element = HtmlElement {
        name,
        attrs,
        children: Vec::new(),
    };
    convert_children(el, in_svg, depth, &mut element.children);
    Some(HtmlNode::Element(element))
}

// --- Serialization ---

pub fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&#160;"),
            c => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

/// Serialize nodes as an XHTML fragment.
pub fn serialize(nodes: &[HtmlNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        serialize_node(node, &mut out);
    }
    out
}

fn serialize_node(node: &HtmlNode, out: &mut String) {
    // Iterative to keep deep trees off the call stack.
    enum Step<'a> {
        Open(&'a HtmlNode),
        Close(&'a str),
    }
    let mut stack = vec![Step::Open(node)];
    while let Some(step) = stack.pop() {
        match step {
            Step::Close(name) => {
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            Step::Open(HtmlNode::Text(text)) => escape_text(text, out),
            Step::Open(HtmlNode::Element(el)) => {
                out.push('<');
                out.push_str(&el.name);
                for (key, value) in &el.attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    escape_attr(value, out);
                    out.push('"');
                }
                if VOID_ELEMENTS.contains(&el.name.as_str()) {
                    out.push_str("/>");
                    continue;
                }
                out.push('>');
                stack.push(Step::Close(&el.name));
                for child in el.children.iter().rev() {
                    stack.push(Step::Open(child));
                }
            }
        }
    }
}

// --- Queries ---

/// Whitespace-collapsed text, with block boundaries turned into spaces.
pub fn text_content(nodes: &[HtmlNode]) -> String {
    enum Step<'a> {
        Node(&'a HtmlNode),
        Space,
    }
    let mut raw = String::new();
    let mut stack: Vec<Step<'_>> = nodes.iter().rev().map(Step::Node).collect();
    while let Some(step) = stack.pop() {
        match step {
            Step::Space => raw.push(' '),
            Step::Node(HtmlNode::Text(t)) => raw.push_str(t),
            Step::Node(HtmlNode::Element(el)) => {
                let is_inline = INLINE_ELEMENTS.contains(&el.name.as_str());
                if !is_inline {
                    raw.push(' ');
                    stack.push(Step::Space);
                }
                if el.name == "img" {
                    if let Some(alt) = el.attr("alt") {
                        raw.push_str(alt);
                    }
                }
                for child in el.children.iter().rev() {
                    stack.push(Step::Node(child));
                }
            }
        }
    }
    collapse_whitespace(&raw)
}

/// Walk every element in document order.
pub fn for_each_element<'a>(nodes: &'a [HtmlNode], mut f: impl FnMut(&'a HtmlElement)) {
    let mut stack: Vec<&HtmlNode> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if let HtmlNode::Element(el) = node {
            f(el);
            for child in el.children.iter().rev() {
                stack.push(child);
            }
        }
    }
}

/// Walk every element mutably (pre-order).
pub fn for_each_element_mut(nodes: &mut [HtmlNode], f: &mut impl FnMut(&mut HtmlElement)) {
    let mut stack: Vec<&mut HtmlNode> = nodes.iter_mut().rev().collect();
    while let Some(node) = stack.pop() {
        if let HtmlNode::Element(el) = node {
            f(el);
            for child in el.children.iter_mut().rev() {
                stack.push(child);
            }
        }
    }
}

/// Fragment identifiers defined in the nodes: `id` attributes and legacy
/// `<a name>` anchors, in document order, deduplicated.
pub fn collect_ids(nodes: &[HtmlNode]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for_each_element(nodes, |el| {
        let id = el
            .attr("id")
            .or_else(|| if el.name == "a" { el.attr("name") } else { None });
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
    });
    ids
}

/// Text of the first `h1`–`h6`, if it has any.
pub fn first_heading(nodes: &[HtmlNode]) -> Option<String> {
    let mut found = None;
    for_each_element(nodes, |el| {
        if found.is_none() && el.is_heading() {
            let text = text_content(&el.children);
            if !text.is_empty() {
                found = Some(text);
            }
        }
    });
    found
}

pub fn has_heading(nodes: &[HtmlNode]) -> bool {
    let mut found = false;
    for_each_element(nodes, |el| found |= el.is_heading());
    found
}

/// Split body content into top-level blocks, looking through single wrapper
/// containers. Ids carried by the wrappers are kept as empty anchor spans in
/// front of the first block so fragment links to them still resolve.
pub fn top_level_blocks(mut nodes: Vec<HtmlNode>) -> Vec<HtmlNode> {
    let mut wrapper_ids = Vec::new();
    loop {
        let mut significant = nodes.iter().enumerate().filter(|(_, n)| !n.is_blank_text());
        let index = match (significant.next(), significant.next()) {
            (Some((i, HtmlNode::Element(el))), None)
                if WRAPPER_ELEMENTS.contains(&el.name.as_str()) =>
            {
                i
            }
            _ => break,
        };
        let HtmlNode::Element(wrapper) = nodes.swap_remove(index) else {
            break;
        };
        if let Some(id) = wrapper.attr("id") {
            wrapper_ids.push(id.to_string());
        }
        nodes = wrapper.children;
    }

    let mut blocks: Vec<HtmlNode> = wrapper_ids
        .into_iter()
        .map(|id| {
            let mut anchor = HtmlElement::new("span");
            anchor.set_attr("id", id);
            HtmlNode::Element(anchor)
        })
        .collect();
    blocks.extend(nodes.into_iter().filter(|n| !n.is_blank_text()));
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>  Chapter
 One </title><link rel="stylesheet" href="style.css"/><script>alert(1)</script></head>
<body onload="evil()">
  <!-- a comment -->
  <div class="wrapper" id="top">
    <section>
      <h1 id="c1">One</h1>
      <p onclick="x()">Hello <a href="javascript:void(0)">there</a> &amp; welcome.</p>
      <div/>
      <form><input type="text"/></form>
      <p>Bye<br/>now</p>
    </section>
  </div>
</body>
</html>"#;

    #[test]
    fn parses_and_cleans() {
        let doc = parse_document(DOC);
        assert_eq!(doc.title.as_deref(), Some("Chapter One"));
        let html = serialize(&doc.body);
        assert!(!html.contains("script"));
        assert!(!html.contains("onclick"));
        assert!(!html.contains("onload"));
        assert!(!html.contains("javascript"));
        assert!(!html.contains("<form"));
        assert!(!html.contains("comment"));
        assert!(html.contains("Hello <a>there</a> &amp; welcome."));
        assert!(html.contains("Bye<br/>now"));
    }

    #[test]
    fn blocks_look_through_wrappers() {
        let doc = parse_document(DOC);
        let blocks = top_level_blocks(doc.body);
        let names: Vec<&str> = blocks
            .iter()
            .filter_map(|b| b.as_element())
            .map(|el| el.name.as_str())
            .collect();
        assert_eq!(names, vec!["span", "h1", "p", "div", "p"]);
        assert_eq!(blocks[0].as_element().unwrap().attr("id"), Some("top"));
    }

    #[test]
    fn self_closing_title_does_not_swallow_body() {
        let doc = parse_document(
            "<html><head><title/></head><body><p>Still here</p></body></html>",
        );
        assert_eq!(text_content(&doc.body), "Still here");
    }

    #[test]
    fn text_content_separates_blocks() {
        let nodes = parse_fragment("<h2>Title</h2><p>First <em>line</em></p><p>Second</p>");
        assert_eq!(text_content(&nodes), "Title First line Second");
    }

    #[test]
    fn ids_and_headings() {
        let nodes = parse_fragment(
            r#"<p id="a">x</p><h3> Deep <b>Heading</b></h3><a name="legacy"></a><p id="a">dup</p>"#,
        );
        assert_eq!(collect_ids(&nodes), vec!["a", "legacy"]);
        assert_eq!(first_heading(&nodes).as_deref(), Some("Deep Heading"));
        assert!(has_heading(&nodes));
    }

    #[test]
    fn serialize_escapes() {
        let mut p = HtmlElement::with_text("p", "a < b & \"c\"");
        p.set_attr("title", "say \"hi\"");
        assert_eq!(
            serialize(&[HtmlNode::Element(p)]),
            r#"<p title="say &quot;hi&quot;">a &lt; b &amp; "c"</p>"#
        );
    }

    #[test]
    fn svg_image_href_survives() {
        let nodes = parse_fragment(
            r#"<svg xmlns:xlink="http://www.w3.org/1999/xlink"><image xlink:href="../img/c.png"/></svg>"#,
        );
        let mut hrefs = Vec::new();
        for_each_element(&nodes, |el| {
            if el.name == "image" {
                hrefs.push(el.attr("href").map(str::to_string));
            }
        });
        assert_eq!(hrefs, vec![Some("../img/c.png".to_string())]);
    }
}
