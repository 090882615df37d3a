use crate::collector::{CaptureError, LogArtifact, LogCollector};
use crate::config::MarkerSettings;
use crate::testcase::TestCase;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// More bracketed excerpts than issued cases: the markers are misaligned and
    /// the round's output cannot be attributed.
    #[error("Found {segments} segments for {cases} issued test cases")]
    Overrun { segments: usize, cases: usize },
    #[error("Segment {position} is tagged as test case {found}, expected {expected}")]
    OutOfOrder {
        position: usize,
        expected: u32,
        found: u32,
    },
    #[error("Failed to read log artifact: {0}")]
    Io(String),
}

impl From<CaptureError> for SegmentError {
    fn from(err: CaptureError) -> Self {
        SegmentError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryMarkers {
    pub start: String,
    pub end: String,
}

impl From<&MarkerSettings> for BoundaryMarkers {
    fn from(settings: &MarkerSettings) -> Self {
        Self {
            start: settings.start.clone(),
            end: settings.end.clone(),
        }
    }
}

/// Device output attributed to one test case.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub case_number: u32,
    /// Zero-based emission order in the log among the cases that reached the device.
    pub position: usize,
    pub excerpt: String,
    /// The segment had no end marker before the next start marker or the end
    /// of the capture.
    pub truncated: bool,
}

#[derive(Debug)]
struct OpenSegment {
    tag: Option<u32>,
    lines: Vec<String>,
}

#[derive(Debug)]
struct RawSegment {
    tag: Option<u32>,
    excerpt: String,
    truncated: bool,
}

/// Splits a round's raw log into per-case excerpts.
///
/// The Nth bracketed excerpt belongs to the Nth issued case. A start marker may
/// carry the case number (`START 3`); when it does, the number must agree with
/// the case at that position. Segmentation is a pure function of the log text,
/// the markers and the cases, so running it twice yields the same result.
#[derive(Debug, Clone)]
pub struct CaseExtractor {
    markers: BoundaryMarkers,
}

impl CaseExtractor {
    pub fn new(markers: BoundaryMarkers) -> Self {
        Self { markers }
    }

    pub fn markers(&self) -> &BoundaryMarkers {
        &self.markers
    }

    pub fn segment(
        &self,
        artifact: &LogArtifact,
        cases: &[TestCase],
    ) -> Result<Vec<Segment>, SegmentError> {
        let text = LogCollector::read_artifact(artifact)?;
        self.segment_text(&text, cases)
    }

    pub fn segment_text(
        &self,
        text: &str,
        cases: &[TestCase],
    ) -> Result<Vec<Segment>, SegmentError> {
        let raw = self.scan(text);
        if raw.len() > cases.len() {
            return Err(SegmentError::Overrun {
                segments: raw.len(),
                cases: cases.len(),
            });
        }

        raw.into_iter()
            .zip(cases)
            .enumerate()
            .map(|(position, (segment, case))| {
                if let Some(found) = segment.tag {
                    if found != case.number {
                        return Err(SegmentError::OutOfOrder {
                            position,
                            expected: case.number,
                            found,
                        });
                    }
                }
                Ok(Segment {
                    case_number: case.number,
                    position,
                    excerpt: segment.excerpt,
                    truncated: segment.truncated,
                })
            })
            .collect()
    }

    fn scan(&self, text: &str) -> Vec<RawSegment> {
        let start = self.markers.start.as_str();
        let end = self.markers.end.as_str();
        let mut segments = Vec::new();
        let mut open: Option<OpenSegment> = None;

        for line in text.lines() {
            let mut cursor = line;
            let mut whole_line = true;
            loop {
                if open.is_none() {
                    let Some(at) = find_marker(cursor, start) else {
                        break;
                    };
                    let (tag, rest) = parse_tag(&cursor[at + start.len()..]);
                    open = Some(OpenSegment {
                        tag,
                        lines: Vec::new(),
                    });
                    cursor = rest;
                    whole_line = false;
                    continue;
                }

                let start_at = find_marker(cursor, start);
                let end_at = find_marker(cursor, end);
                match (start_at, end_at) {
                    (Some(s), e) if e.is_none_or(|e| s < e) => {
                        push_fragment(&mut open, &cursor[..s]);
                        close(&mut open, &mut segments, true);
                        cursor = &cursor[s..];
                    }
                    (_, Some(e)) => {
                        push_fragment(&mut open, &cursor[..e]);
                        close(&mut open, &mut segments, false);
                        cursor = &cursor[e + end.len()..];
                    }
                    _ => {
                        if whole_line {
                            if let Some(segment) = open.as_mut() {
                                segment.lines.push(cursor.to_string());
                            }
                        } else {
                            push_fragment(&mut open, cursor);
                        }
                        break;
                    }
                }
                whole_line = false;
            }
        }

        close(&mut open, &mut segments, true);
        segments
    }
}

fn push_fragment(open: &mut Option<OpenSegment>, fragment: &str) {
    if fragment.trim().is_empty() {
        return;
    }
    if let Some(segment) = open.as_mut() {
        segment.lines.push(fragment.trim().to_string());
    }
}

fn close(open: &mut Option<OpenSegment>, segments: &mut Vec<RawSegment>, truncated: bool) {
    if let Some(segment) = open.take() {
        segments.push(RawSegment {
            tag: segment.tag,
            excerpt: segment.lines.join("\n"),
            truncated,
        });
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Finds `marker` in `haystack` where it is not part of a longer word.
pub(crate) fn find_marker(haystack: &str, marker: &str) -> Option<usize> {
    if marker.is_empty() {
        return None;
    }
    let word_start = marker.chars().next().is_some_and(is_word_char);
    let word_end = marker.chars().next_back().is_some_and(is_word_char);
    haystack.match_indices(marker).map(|(at, _)| at).find(|&at| {
        let clear_before =
            !word_start || !haystack[..at].chars().next_back().is_some_and(is_word_char);
        let clear_after = !word_end
            || !haystack[at + marker.len()..]
                .chars()
                .next()
                .is_some_and(is_word_char);
        clear_before && clear_after
    })
}

/// Counts non-overlapping whole-word occurrences of `marker`.
pub(crate) fn count_markers(haystack: &str, marker: &str) -> usize {
    let mut count = 0;
    let mut rest = haystack;
    while let Some(at) = find_marker(rest, marker) {
        count += 1;
        rest = &rest[at + marker.len()..];
    }
    count
}

/// Parses an optional case number directly after a start marker.
fn parse_tag(after: &str) -> (Option<u32>, &str) {
    let trimmed = after.trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '#');
    let digits = trimmed.len()
        - trimmed
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .len();
    if digits == 0 {
        return (None, after);
    }
    let rest = &trimmed[digits..];
    if rest.chars().next().is_some_and(is_word_char) {
        return (None, after);
    }
    match trimmed[..digits].parse::<u32>() {
        Ok(tag) => (Some(tag), rest),
        Err(_) => (None, after),
    }
}

/// Counts occurrences of one marker in a stream of output chunks.
///
/// Only complete lines are inspected, so a marker split across two chunks is
/// counted once its line is finished.
#[derive(Debug)]
pub struct MarkerWatch {
    marker: String,
    partial: String,
    seen: usize,
}

impl MarkerWatch {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
            partial: String::new(),
            seen: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        if let Some(last_newline) = self.partial.rfind('\n') {
            let complete: String = self.partial.drain(..=last_newline).collect();
            let found: usize = complete
                .lines()
                .map(|line| count_markers(line, &self.marker))
                .sum();
            self.seen += found;
        }
        self.seen
    }

    pub fn seen(&self) -> usize {
        self.seen
    }
}
