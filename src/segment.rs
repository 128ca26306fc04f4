//! Hover text segmentation.
//! Splits raw documentation into ordered `code`/`text` segments. Fenced code
//! blocks are never split; prose is cut only at sentence ends once a segment
//! has reached the target size.

use serde::{Deserialize, Serialize};

/// Default size (in characters) a text segment grows to before it may be cut.
pub const DEFAULT_TARGET_SIZE: usize = 200;

/// Language reported for fenced blocks without an info string.
pub const UNKNOWN_LANGUAGE: &str = "unknown";

/// Language reported for prose segments.
pub const TEXT_LANGUAGE: &str = "text";

/// Sentence terminators that allow a text segment to be closed.
const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '；', ';', '…'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Code,
    Text,
}

/// One contiguous, typed slice of hover text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub language: String,
    pub content: String,
    /// Raw opening/closing delimiter lines of a fenced block, kept so the
    /// original text can be rebuilt.
    #[serde(skip)]
    fence: Option<Fence>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fence {
    open: String,
    close: Option<String>,
}

impl Segment {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Text,
            language: TEXT_LANGUAGE.to_string(),
            content: content.into(),
            fence: None,
        }
    }

    pub fn code(language: impl Into<String>, content: impl Into<String>) -> Self {
        let language = language.into();
        let open = format!("```{language}");
        Self {
            kind: SegmentKind::Code,
            language,
            content: content.into(),
            fence: Some(Fence {
                open,
                close: Some("```".to_string()),
            }),
        }
    }

    pub fn is_code(&self) -> bool {
        self.kind == SegmentKind::Code
    }

    /// Source form of the segment: code content wrapped in its original
    /// fence lines, text content as-is.
    pub fn to_source(&self) -> String {
        match &self.fence {
            Some(fence) => {
                let mut out = fence.open.clone();
                out.push('\n');
                out.push_str(&self.content);
                if let Some(close) = &fence.close {
                    out.push('\n');
                    out.push_str(close);
                }
                out
            }
            None => self.content.clone(),
        }
    }
}

/// Rebuild source text from segments (inverse of [`segment`] for inputs
/// without isolated whitespace-only runs).
pub fn reassemble(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(Segment::to_source)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Line-based segmenter with a configurable target size.
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    target_size: usize,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_SIZE)
    }
}

/// Segment `text` with the default target size.
pub fn segment(text: &str) -> Vec<Segment> {
    Segmenter::default().segment(text)
}

/// Returns the fence marker (``` or ~~~) if `trimmed` opens or closes a fence.
fn fence_marker(trimmed: &str) -> Option<&'static str> {
    ["```", "~~~"].into_iter().find(|m| trimmed.starts_with(m))
}

fn ends_sentence(line: &str) -> bool {
    line.trim_end()
        .chars()
        .last()
        .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c))
}

/// Accumulates prose lines until a cut point.
#[derive(Default)]
struct TextAccumulator {
    lines: Vec<String>,
    chars: usize,
}

impl TextAccumulator {
    fn push(&mut self, line: &str) {
        if !self.lines.is_empty() {
            self.chars += 1;
        }
        self.chars += line.chars().count();
        self.lines.push(line.to_string());
    }

    fn take(&mut self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        self.chars = 0;
        Some(std::mem::take(&mut self.lines).join("\n"))
    }
}

impl Segmenter {
    pub fn new(target_size: usize) -> Self {
        Self {
            target_size: target_size.max(1),
        }
    }

    /// Split `text` into ordered segments. Total: whitespace-only input
    /// yields a single text segment carrying the input unchanged.
    pub fn segment(&self, text: &str) -> Vec<Segment> {
        if text.trim().is_empty() {
            return vec![Segment::text(text)];
        }

        let mut out: Vec<Segment> = Vec::new();
        let mut acc = TextAccumulator::default();
        // (marker, raw opening line, language, collected lines)
        let mut open_fence: Option<(&'static str, String, String, Vec<String>)> = None;

        for line in text.split('\n') {
            let trimmed = line.trim();

            if let Some((marker, _, _, lines)) = open_fence.as_mut() {
                if trimmed.starts_with(*marker) && trimmed.trim_start_matches(*marker).is_empty() {
                    if let Some((_, open, language, lines)) = open_fence.take() {
                        out.push(code_segment(open, language, lines, Some(line.to_string())));
                    }
                } else {
                    lines.push(line.to_string());
                }
                continue;
            }

            if let Some(marker) = fence_marker(trimmed) {
                flush_text(&mut out, &mut acc);
                let info = trimmed.trim_start_matches(marker).trim();
                let language = info
                    .split_whitespace()
                    .next()
                    .unwrap_or(UNKNOWN_LANGUAGE)
                    .to_string();
                open_fence = Some((marker, line.to_string(), language, Vec::new()));
                continue;
            }

            acc.push(line);
            if acc.chars >= self.target_size && ends_sentence(line) {
                flush_text(&mut out, &mut acc);
            }
        }

        // Unterminated fence: keep what was collected.
        if let Some((_, open, language, lines)) = open_fence.take() {
            out.push(code_segment(open, language, lines, None));
        }
        flush_text(&mut out, &mut acc);

        if out.is_empty() {
            out.push(Segment::text(text));
        }
        out
    }
}

fn code_segment(open: String, language: String, lines: Vec<String>, close: Option<String>) -> Segment {
    Segment {
        kind: SegmentKind::Code,
        language,
        content: lines.join("\n"),
        fence: Some(Fence { open, close }),
    }
}

/// Emit the accumulated prose. Whitespace-only runs are folded into a
/// preceding text segment when there is one and dropped otherwise.
fn flush_text(out: &mut Vec<Segment>, acc: &mut TextAccumulator) {
    let Some(content) = acc.take() else {
        return;
    };
    if !content.trim().is_empty() {
        out.push(Segment::text(content));
        return;
    }
    if let Some(prev) = out.last_mut().filter(|s| s.kind == SegmentKind::Text) {
        prev.content.push('\n');
        prev.content.push_str(&content);
    }
}
