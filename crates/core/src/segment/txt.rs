//! Plain text to chapters.
//!
//! Text has no structure beyond lines, so chapters are found heuristically.
//! Each [`SplitStrategy`] either finds at least `min_chapters` chapter starts
//! or reports no signal, and the next strategy in the configured order is
//! tried. Without any signal the text stays whole.

use std::sync::OnceLock;

use regex::Regex;

use crate::book::{DiagnosticKind, Diagnostics};
use crate::html::{HtmlElement, HtmlNode};

use super::{AnchorIndex, DraftChapter, Segmentation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitStrategy {
    /// Markdown ATX (`# Title`) and setext (`Title` + `====`) headings.
    Headings,
    /// Numbered or titled section lines: `Chapter 3`, `PART IV`, `第一章`.
    Patterns,
    /// Runs of blank lines.
    BlankRuns,
}

impl SplitStrategy {
    pub const ALL: [SplitStrategy; 3] = [
        SplitStrategy::Headings,
        SplitStrategy::Patterns,
        SplitStrategy::BlankRuns,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SplitStrategy::Headings => "headings",
            SplitStrategy::Patterns => "patterns",
            SplitStrategy::BlankRuns => "blank-runs",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterOptions {
    pub strategies: Vec<SplitStrategy>,
    /// Blank lines needed to separate two chapters under `blank-runs`.
    pub blank_run_threshold: usize,
    pub min_chapters: usize,
    /// Longer lines are never taken as headings.
    pub max_heading_chars: usize,
    /// Chunk unsplit text into sections of roughly this many characters.
    pub max_section_chars: Option<usize>,
}

impl Default for SegmenterOptions {
    fn default() -> Self {
        Self {
            strategies: SplitStrategy::ALL.to_vec(),
            blank_run_threshold: 3,
            min_chapters: 2,
            max_heading_chars: 80,
            max_section_chars: None,
        }
    }
}

/// A chapter start found by a strategy.
#[derive(Debug, Clone, PartialEq)]
struct Heading {
    line: usize,
    /// Lines taken by the heading itself (0 when the title is synthesized).
    span: usize,
    title: String,
}

pub fn segment(text: &str, opts: &SegmenterOptions, diagnostics: &mut Diagnostics) -> Segmentation {
    let lines: Vec<&str> = text.lines().collect();
    let mut weak = Vec::new();

    for &strategy in &opts.strategies {
        let headings = match strategy {
            SplitStrategy::Headings => markdown_headings(&lines, opts),
            SplitStrategy::Patterns => pattern_headings(&lines, opts),
            SplitStrategy::BlankRuns => blank_run_headings(&lines, opts),
        };
        if !headings.is_empty() && headings.len() >= opts.min_chapters {
            tracing::debug!(
                strategy = strategy.name(),
                chapters = headings.len(),
                "text split"
            );
            return Segmentation {
                chapters: split_at(&lines, &headings),
                anchors: AnchorIndex::new(),
            };
        }
        if !headings.is_empty() {
            weak.push(format!("{} found {}", strategy.name(), headings.len()));
        }
    }

    if !weak.is_empty() {
        diagnostics.record(
            DiagnosticKind::AmbiguousSplit,
            format!(
                "no confident chapter split ({}); keeping the text whole",
                weak.join(", ")
            ),
        );
    }
    Segmentation {
        chapters: unsplit(&lines, opts.max_section_chars),
        anchors: AnchorIndex::new(),
    }
}

fn atx_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})[ \t]+(.+?)(?:[ \t]+#+)?[ \t]*$").unwrap())
}

fn setext_underline() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:={3,}|-{3,})[ \t]*$").unwrap())
}

fn section_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^(?:",
            r"(?i:chapter|part|book)\s+(?:\d+|[IVXLCDM]+|(?i:one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|twenty|first|second|third|last))\b",
            r"|(?i:prologue|epilogue|foreword|afterword)\b",
            r"|第\s*[0-9０-９零〇一二三四五六七八九十百千万两]+\s*[章回卷节部集篇]",
            r"|卷\s*[0-9０-９零〇一二三四五六七八九十百千万]+",
            r"|序章|楔子|尾声|后记",
            r")",
        ))
        .unwrap()
    })
}

fn numbered_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}\.\s+\S").unwrap())
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// The trimmed line, if it is short enough to be a heading.
fn heading_text<'a>(line: &'a str, opts: &SegmenterOptions) -> Option<&'a str> {
    let text = line.trim();
    (!text.is_empty() && text.chars().count() <= opts.max_heading_chars).then_some(text)
}

/// ATX and setext headings, at one level.
fn markdown_headings(lines: &[&str], opts: &SegmenterOptions) -> Vec<Heading> {
    let mut found: Vec<(usize, Heading)> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();
        if let Some(caps) = atx_heading().captures(line) {
            if let Some(title) = heading_text(&caps[2], opts) {
                found.push((
                    caps[1].len(),
                    Heading {
                        line: i,
                        span: 1,
                        title: title.to_string(),
                    },
                ));
            }
        } else if i + 1 < lines.len()
            && !line.is_empty()
            && (i == 0 || is_blank(lines[i - 1]))
            && setext_underline().is_match(lines[i + 1].trim())
        {
            if let Some(title) = heading_text(line, opts) {
                let level = if lines[i + 1].trim().starts_with('=') { 1 } else { 2 };
                found.push((
                    level,
                    Heading {
                        line: i,
                        span: 2,
                        title: title.to_string(),
                    },
                ));
                i += 2;
                continue;
            }
        }
        i += 1;
    }

    // The shallowest level that alone yields enough chapters, so a lone
    // `# Book Title` above `##` chapters does not hide them.
    let mut levels: Vec<usize> = found.iter().map(|(level, _)| *level).collect();
    levels.sort_unstable();
    levels.dedup();
    let count = |level: usize| found.iter().filter(|(l, _)| *l == level).count();
    let Some(chosen) = levels
        .iter()
        .copied()
        .find(|&level| count(level) >= opts.min_chapters)
        .or_else(|| levels.first().copied())
    else {
        return Vec::new();
    };
    found
        .into_iter()
        .filter(|(level, _)| *level == chosen)
        .map(|(_, heading)| heading)
        .collect()
}

fn pattern_headings(lines: &[&str], opts: &SegmenterOptions) -> Vec<Heading> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| {
            let title = heading_text(line, opts)?;
            // Hard-wrapped prose can start a line with "chapter 12 of ...".
            let after_blank = i == 0 || is_blank(lines[i - 1]);
            let matched =
                after_blank && (section_line().is_match(title) || numbered_line().is_match(title));
            matched.then(|| Heading {
                line: i,
                span: 1,
                title: title.to_string(),
            })
        })
        .collect()
}

/// Chapters separated by long blank runs. The first line of each chapter is
/// its title when short enough; otherwise the title is synthesized.
fn blank_run_headings(lines: &[&str], opts: &SegmenterOptions) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut blank = 0;
    let mut seen_content = false;
    for (i, line) in lines.iter().enumerate() {
        if is_blank(line) {
            blank += 1;
            continue;
        }
        if !seen_content || blank >= opts.blank_run_threshold {
            let heading = match heading_text(line, opts) {
                Some(title) => Heading {
                    line: i,
                    span: 1,
                    title: title.to_string(),
                },
                None => Heading {
                    line: i,
                    span: 0,
                    title: format!("Chapter {}", headings.len() + 1),
                },
            };
            headings.push(heading);
        }
        seen_content = true;
        blank = 0;
    }
    // The start of the text alone is no signal.
    if headings.len() < 2 {
        headings.clear();
    }
    headings
}

fn split_at(lines: &[&str], headings: &[Heading]) -> Vec<DraftChapter> {
    let mut chapters = Vec::with_capacity(headings.len() + 1);
    let first = headings.first().map_or(lines.len(), |h| h.line);
    if !is_title_only(&lines[..first]) {
        chapters.push(draft("Preface".to_string(), paragraphs(&lines[..first])));
    }
    for (n, heading) in headings.iter().enumerate() {
        let end = headings.get(n + 1).map_or(lines.len(), |next| next.line);
        let body_start = (heading.line + heading.span).min(end);
        let mut blocks = Vec::new();
        if heading.span > 0 {
            blocks.push(HtmlNode::Element(HtmlElement::with_text("h2", &heading.title)));
        }
        blocks.extend(paragraphs(&lines[body_start..end]));
        chapters.push(draft(heading.title.clone(), blocks));
    }
    chapters
}

/// Nothing but blank lines and at most one Markdown heading: a book title,
/// not a preface.
fn is_title_only(lines: &[&str]) -> bool {
    let content: Vec<&str> = lines.iter().copied().filter(|l| !is_blank(l)).collect();
    match content.as_slice() {
        [] => true,
        [line] => atx_heading().is_match(line.trim()),
        _ => false,
    }
}

/// The whole text as one chapter, or as paragraph-aligned sections when a
/// size is configured.
fn unsplit(lines: &[&str], max_section_chars: Option<usize>) -> Vec<DraftChapter> {
    let Some(max) = max_section_chars else {
        return vec![draft("Section 1".to_string(), paragraphs(lines))];
    };

    let mut sections: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut length = 0;
    for paragraph in lines.split(|l| is_blank(l)).filter(|p| !p.is_empty()) {
        let size: usize = paragraph.iter().map(|l| l.trim().chars().count()).sum();
        if !current.is_empty() && length + size > max {
            sections.push(std::mem::take(&mut current));
            length = 0;
        }
        current.extend_from_slice(paragraph);
        length += size;
    }
    if !current.is_empty() || sections.is_empty() {
        sections.push(current);
    }

    sections
        .iter()
        .enumerate()
        .map(|(i, section)| draft(format!("Section {}", i + 1), paragraphs(section)))
        .collect()
}

fn paragraphs(lines: &[&str]) -> Vec<HtmlNode> {
    lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| HtmlNode::Element(HtmlElement::with_text("p", l)))
        .collect()
}

fn draft(title: String, blocks: Vec<HtmlNode>) -> DraftChapter {
    DraftChapter {
        title,
        source_href: None,
        blocks,
    }
}
