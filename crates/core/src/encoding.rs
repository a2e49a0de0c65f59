//! Text encoding detection and title normalization.
//!
//! Detection order: byte-order mark, strict UTF-8, then a scored pass over
//! lossy UTF-8 and the legacy CJK encodings, falling back to windows-1252.

use encoding_rs::{Encoding, BIG5, EUC_KR, GB18030, SHIFT_JIS, UTF_8, WINDOWS_1252};
use unicode_normalization::UnicodeNormalization;

use crate::error::ReadError;

#[derive(Debug, Clone)]
pub struct EncodingOptions {
    /// Highest tolerated share of replacement characters in decoded text.
    pub max_error_rate: f64,
    /// NFC-normalize and whitespace-collapse chapter and TOC titles.
    pub normalize_titles: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            max_error_rate: 0.01,
            normalize_titles: true,
        }
    }
}

/// Text decoded from raw bytes, with line endings normalized to `\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedText {
    pub text: String,
    /// WHATWG name of the encoding used, e.g. `UTF-8` or `GBK`.
    pub encoding: &'static str,
    /// Number of U+FFFD characters introduced by decoding.
    pub replacements: usize,
}

/// Minimum share of non-ASCII characters that must look like the script an
/// encoding is normally used for.
const MIN_PLAUSIBILITY: f64 = 0.6;

/// Share of control characters above which decoded text is treated as binary.
const MAX_CONTROL_SHARE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Script {
    Any,
    Chinese,
    Japanese,
    Korean,
}

struct Candidate {
    encoding: &'static Encoding,
    script: Script,
}

// EUC-KR precedes GB18030: Korean text also decodes cleanly as GB18030 and
// ties keep the earlier candidate.
const CANDIDATES: &[Candidate] = &[
    Candidate {
        encoding: UTF_8,
        script: Script::Any,
    },
    Candidate {
        encoding: EUC_KR,
        script: Script::Korean,
    },
    Candidate {
        encoding: GB18030,
        script: Script::Chinese,
    },
    Candidate {
        encoding: BIG5,
        script: Script::Chinese,
    },
    Candidate {
        encoding: SHIFT_JIS,
        script: Script::Japanese,
    },
];

/// Decode raw text bytes, detecting their encoding.
pub fn decode_text(bytes: &[u8], opts: &EncodingOptions) -> Result<DecodedText, ReadError> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        let replacements = count_replacements(&text);
        let rate = error_rate(&text, replacements);
        if rate > opts.max_error_rate {
            return Err(ReadError::UnsupportedEncoding {
                detail: format!(
                    "{} byte-order mark present but {:.1}% of the text failed to decode",
                    encoding.name(),
                    rate * 100.0
                ),
            });
        }
        return finish(&text, encoding, replacements);
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return finish(text, UTF_8, 0);
    }

    let mut best: Option<(f64, &'static Encoding, String, usize)> = None;
    for candidate in CANDIDATES {
        let (text, _) = candidate.encoding.decode_without_bom_handling(bytes);
        let replacements = count_replacements(&text);
        let rate = error_rate(&text, replacements);
        if rate > opts.max_error_rate {
            continue;
        }
        let plausibility = script_plausibility(&text, candidate.script);
        if plausibility < MIN_PLAUSIBILITY {
            continue;
        }
        let core = core_ratio(bytes, candidate.encoding);
        let score = plausibility * core - 4.0 * rate;
        tracing::debug!(
            encoding = candidate.encoding.name(),
            rate,
            plausibility,
            core,
            "encoding candidate"
        );
        // Ties keep the earlier candidate.
        if best.as_ref().map_or(true, |(s, ..)| score > *s) {
            best = Some((score, candidate.encoding, text.into_owned(), replacements));
        }
    }
    if let Some((_, encoding, text, replacements)) = best {
        return finish(&text, encoding, replacements);
    }

    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    finish(&text, WINDOWS_1252, 0)
}

fn finish(
    text: &str,
    encoding: &'static Encoding,
    replacements: usize,
) -> Result<DecodedText, ReadError> {
    if control_share(text) > MAX_CONTROL_SHARE {
        return Err(ReadError::UnsupportedEncoding {
            detail: format!(
                "text decoded as {} is mostly control characters",
                encoding.name()
            ),
        });
    }
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    Ok(DecodedText {
        text,
        encoding: encoding.name(),
        replacements,
    })
}

fn count_replacements(text: &str) -> usize {
    text.chars().filter(|&c| c == '\u{FFFD}').count()
}

fn error_rate(text: &str, replacements: usize) -> f64 {
    let total = text.chars().filter(|c| !c.is_whitespace()).count();
    if total == 0 {
        return 0.0;
    }
    replacements as f64 / total as f64
}

fn control_share(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let controls = text
        .chars()
        .filter(|&c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\u{0C}'))
        .count();
    controls as f64 / total as f64
}

fn is_han(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2A6DF}')
}

fn is_kana(c: char) -> bool {
    matches!(c, '\u{3040}'..='\u{30FF}')
}

fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}')
}

/// CJK punctuation and full-width forms (half-width katakana excluded).
fn is_cjk_punctuation(c: char) -> bool {
    matches!(c, '\u{3000}'..='\u{303F}' | '\u{FF01}'..='\u{FF60}' | '\u{FFE0}'..='\u{FFEF}')
        || matches!(c, '\u{2010}'..='\u{2027}')
}

/// Share of non-ASCII characters belonging to the expected script.
fn script_plausibility(text: &str, script: Script) -> f64 {
    let mut non_ascii = 0usize;
    let mut plausible = 0usize;
    for c in text.chars().filter(|c| !c.is_ascii() && *c != '\u{FFFD}') {
        non_ascii += 1;
        let ok = match script {
            Script::Any => true,
            Script::Chinese => is_han(c) || is_cjk_punctuation(c),
            Script::Japanese => is_han(c) || is_kana(c) || is_cjk_punctuation(c),
            Script::Korean => is_hangul(c) || is_cjk_punctuation(c),
        };
        if ok {
            plausible += 1;
        }
    }
    if non_ascii == 0 {
        return 1.0;
    }
    plausible as f64 / non_ascii as f64
}

/// Share of multi-byte sequences that fall in the range where an encoding
/// keeps its everyday repertoire. Text in a foreign legacy encoding often
/// decodes without errors but lands on rarely used code points.
fn core_ratio(bytes: &[u8], encoding: &'static Encoding) -> f64 {
    let core: fn(u8, u8) -> bool = if encoding == GB18030 {
        |lead, trail| (0xA1..=0xF7).contains(&lead) && (0xA1..=0xFE).contains(&trail)
    } else if encoding == SHIFT_JIS {
        |lead, trail| {
            (matches!(lead, 0x81..=0x9F | 0xE0..=0xEF)) && (0x40..=0xFC).contains(&trail)
        }
    } else if encoding == EUC_KR {
        |lead, trail| (0xA1..=0xC8).contains(&lead) && (0xA1..=0xFE).contains(&trail)
    } else {
        return 1.0;
    };

    let mut total = 0usize;
    let mut hits = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        if lead < 0x80 {
            i += 1;
            continue;
        }
        total += 1;
        // Half-width katakana are single bytes in Shift_JIS.
        if encoding == SHIFT_JIS && (0xA1..=0xDF).contains(&lead) {
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(&trail) => {
                if core(lead, trail) {
                    hits += 1;
                }
                // GB18030 four-byte sequences have a digit as second byte.
                if encoding == GB18030 && trail.is_ascii_digit() {
                    i += 4;
                } else {
                    i += 2;
                }
            }
            None => i += 1,
        }
    }
    if total == 0 {
        return 1.0;
    }
    hits as f64 / total as f64
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a display title: whitespace collapsed, NFC when enabled.
pub fn normalize_title(s: &str, opts: &EncodingOptions) -> String {
    let collapsed = collapse_whitespace(s);
    if opts.normalize_titles {
        collapsed.nfc().collect()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> EncodingOptions {
        EncodingOptions::default()
    }

    #[test]
    fn utf8_is_accepted_as_is() {
        let decoded = decode_text("Chapter 1\r\nHello".as_bytes(), &opts()).unwrap();
        assert_eq!(decoded.encoding, "UTF-8");
        assert_eq!(decoded.text, "Chapter 1\nHello");
        assert_eq!(decoded.replacements, 0);
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("héllo".as_bytes());
        let decoded = decode_text(&bytes, &opts()).unwrap();
        assert_eq!(decoded.text, "héllo");
    }

    #[test]
    fn utf16le_bom_is_honored() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "Hi there".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let decoded = decode_text(&bytes, &opts()).unwrap();
        assert_eq!(decoded.encoding, "UTF-16LE");
        assert_eq!(decoded.text, "Hi there");
    }

    #[test]
    fn gbk_chinese_is_detected() {
        let source = "第一章 风起\n天地玄黄宇宙洪荒日月盈昃辰宿列张\n第二章 云涌\n寒来暑往秋收冬藏闰余成岁律吕调阳\n";
        let (bytes, _, _) = GB18030.encode(source);
        let decoded = decode_text(&bytes, &opts()).unwrap();
        assert_eq!(decoded.encoding, "gb18030");
        assert_eq!(decoded.text, source);
    }

    #[test]
    fn shift_jis_japanese_is_detected() {
        let source = "吾輩は猫である。名前はまだ無い。\nどこで生れたかとんと見当がつかぬ。\n";
        let (bytes, _, _) = SHIFT_JIS.encode(source);
        let decoded = decode_text(&bytes, &opts()).unwrap();
        assert_eq!(decoded.encoding, "Shift_JIS");
        assert_eq!(decoded.text, source);
    }

    #[test]
    fn latin1_falls_back_to_windows_1252() {
        let bytes = b"Caf\xe9 cr\xe8me \x93quoted\x94";
        let decoded = decode_text(bytes, &opts()).unwrap();
        assert_eq!(decoded.encoding, "windows-1252");
        assert_eq!(decoded.text, "Café crème \u{201C}quoted\u{201D}");
    }

    #[test]
    fn binary_is_rejected() {
        let bytes: Vec<u8> = (0u8..32).cycle().take(512).collect();
        assert!(matches!(
            decode_text(&bytes, &opts()),
            Err(ReadError::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn title_normalization_composes_and_collapses() {
        let decomposed = "Cafe\u{301}   au\n lait";
        assert_eq!(normalize_title(decomposed, &opts()), "Caf\u{e9} au lait");
    }
}
