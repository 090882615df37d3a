use crate::analyzer::Verdict;
use crate::command::{CommandError, CommandRunner};
use crate::config::{CommandSettings, MutationSettings};
use crate::record::RoundRecord;
use crate::testcase::{CaseFileError, TestCase, load_batch, parse_batch, resolve_case_path};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Generator command failed: {0}")]
    Command(#[from] CommandError),
    #[error("Generated batch rejected: {0}")]
    InvalidBatch(#[from] CaseFileError),
    #[error("Failed to encode generation request: {0}")]
    Request(String),
    #[error("Generation gave up: {0}")]
    Exhausted(String),
}

/// What a generator is asked for: the next batch for one pair, with the full
/// prior history as read-only context.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub api: &'a str,
    pub function: &'a str,
    pub round: u32,
    pub history: &'a [RoundRecord],
}

/// Produces the next batch of test cases for a round.
///
/// Generators have no side effects on campaign state; everything they know
/// about earlier rounds arrives through the request.
pub trait Generator: Send {
    fn name(&self) -> &'static str;

    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<Vec<TestCase>, GenerationError>;
}

/// Replays a pre-authored batch file (case-fuzzing mode).
#[derive(Debug, Clone)]
pub struct CaseFileGenerator {
    template: String,
}

impl CaseFileGenerator {
    /// `template` is a path, optionally with `{api}`, `{function}` and `{round}`
    /// placeholders.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl Generator for CaseFileGenerator {
    fn name(&self) -> &'static str {
        "CaseFileGenerator"
    }

    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<Vec<TestCase>, GenerationError> {
        let path = resolve_case_path(&self.template, request.api, request.function, request.round);
        tracing::debug!(path = %path.display(), "Loading case file");
        Ok(load_batch(&path)?)
    }
}

/// Asks an external program for the batch: request JSON on stdin, a JSON array
/// of case records on stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    runner: CommandRunner,
}

impl CommandGenerator {
    pub fn new(settings: CommandSettings) -> Self {
        Self {
            runner: CommandRunner::new(settings),
        }
    }
}

impl Generator for CommandGenerator {
    fn name(&self) -> &'static str {
        "CommandGenerator"
    }

    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<Vec<TestCase>, GenerationError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| GenerationError::Request(e.to_string()))?;
        let stdout = self.runner.run(&payload)?;
        let text = String::from_utf8_lossy(&stdout);
        Ok(parse_batch(extract_json_array(&text))?)
    }
}

/// Pulls the JSON array out of generator output that may wrap it in prose or a
/// fenced code block.
fn extract_json_array(text: &str) -> &str {
    let body = fenced_block(text).unwrap_or(text);
    match (body.find('['), body.rfind(']')) {
        (Some(open), Some(close)) if open < close => &body[open..=close],
        _ => body.trim(),
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Skip the info string (`json`) up to the end of the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

const NUMERIC_EDGES: &[&str] = &[
    "0",
    "-1",
    "1",
    "255",
    "256",
    "65535",
    "65536",
    "2147483647",
    "-2147483648",
    "4294967296",
    "999999",
    "0.5",
    "1e308",
];

const STRING_EDGES: &[&str] = &[
    "\"\"",
    "\"\\0\"",
    "\"%s%s%s%n\"",
    "\"nil\"",
    "\"\\xff\\xfe\"",
    "\"../../../../etc/passwd\"",
];

const EXTRA_ARGUMENTS: &[&str] = &["nil", "{}", "0", "-1", "\"\"", "true"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiteralKind {
    Number,
    Text,
}

/// Offline generator that derives each batch from the previous round.
///
/// Round zero gets a fixed seed batch of calls with empty and boundary
/// arguments. Later rounds mutate the literals of earlier snippets, starting
/// with cases that crashed or misbehaved, then cases that stayed silent.
#[derive(Debug)]
pub struct MutationGenerator<R: Rng> {
    rng: R,
    max_cases: usize,
}

impl<R: Rng + Send> MutationGenerator<R> {
    pub fn new(settings: &MutationSettings, rng: R) -> Self {
        Self {
            rng,
            max_cases: settings.max_cases.max(1),
        }
    }

    fn seed_batch(&self, api: &str, function: &str) -> Vec<TestCase> {
        let call = function.trim().trim_end_matches("()");
        let arguments = [
            "",
            "nil",
            "{}",
            "0",
            "-1",
            "\"\"",
            "{}, 0",
            "{}, -1",
            "{}, 999999",
        ];
        arguments
            .iter()
            .take(self.max_cases)
            .zip(1..)
            .map(|(arguments, number)| TestCase {
                number,
                api: api.to_string(),
                function: function.to_string(),
                description: format!("Seed call with arguments ({arguments})."),
                snippets: vec![format!("{call}({arguments})")],
                pre_operation: None,
            })
            .collect()
    }

    /// Orders the last round's cases by how promising they are as parents.
    fn parents<'a>(&self, record: &'a RoundRecord) -> Vec<&'a TestCase> {
        let rank = |case: &TestCase| match record.verdict_for(case.number).map(|v| v.verdict) {
            Some(Verdict::CrashIndicative) => 0,
            Some(Verdict::Anomalous) => 1,
            None => 2,
            Some(Verdict::Unknown) => 3,
            Some(Verdict::Normal) => 4,
        };
        let mut parents: Vec<&TestCase> = record.cases.iter().collect();
        parents.sort_by_key(|case| (rank(case), case.number));
        parents
    }

    fn mutate_snippet(&mut self, snippet: &str) -> String {
        let spans = literal_spans(snippet);
        if spans.is_empty() || self.rng.random_bool(0.2) {
            return self.add_argument(snippet);
        }
        let (range, kind) = &spans[self.rng.random_range(0..spans.len())];
        let table = match kind {
            LiteralKind::Number => NUMERIC_EDGES,
            LiteralKind::Text => STRING_EDGES,
        };
        let replacement = table[self.rng.random_range(0..table.len())];
        format!(
            "{}{}{}",
            &snippet[..range.start],
            replacement,
            &snippet[range.end..]
        )
    }

    fn add_argument(&mut self, snippet: &str) -> String {
        let Some(close) = snippet.rfind(')') else {
            return snippet.to_string();
        };
        let argument = EXTRA_ARGUMENTS[self.rng.random_range(0..EXTRA_ARGUMENTS.len())];
        let separator = if snippet[..close].trim_end().ends_with('(') {
            ""
        } else {
            ", "
        };
        format!(
            "{}{}{}{}",
            &snippet[..close],
            separator,
            argument,
            &snippet[close..]
        )
    }
}

impl<R: Rng + Send> Generator for MutationGenerator<R> {
    fn name(&self) -> &'static str {
        "MutationGenerator"
    }

    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<Vec<TestCase>, GenerationError> {
        let Some(last) = request.history.iter().rev().find(|r| !r.cases.is_empty()) else {
            return Ok(self.seed_batch(request.api, request.function));
        };

        let parents = self.parents(last);
        let mut seen: HashSet<Vec<String>> = request
            .history
            .iter()
            .flat_map(|record| record.cases.iter().map(|c| c.snippets.clone()))
            .collect();
        let mut batch = Vec::with_capacity(self.max_cases);
        // Bounded so a parent with nothing left to mutate cannot spin forever.
        let attempts = self.max_cases * 8;
        for attempt in 0..attempts {
            if batch.len() == self.max_cases {
                break;
            }
            let parent = parents[attempt % parents.len()];
            let snippets: Vec<String> = parent
                .snippets
                .iter()
                .map(|snippet| self.mutate_snippet(snippet))
                .collect();
            if !seen.insert(snippets.clone()) {
                continue;
            }
            batch.push(TestCase {
                number: batch.len() as u32 + 1,
                api: request.api.to_string(),
                function: request.function.to_string(),
                description: format!(
                    "Mutation of case {} from round {}.",
                    parent.number, last.round
                ),
                snippets,
                pre_operation: parent.pre_operation.clone(),
            });
        }

        if batch.is_empty() {
            return Err(GenerationError::Exhausted(
                "no new mutations of the previous batch".to_string(),
            ));
        }
        Ok(batch)
    }
}

/// Locates quoted string and decimal number literals in a snippet.
fn literal_spans(snippet: &str) -> Vec<(Range<usize>, LiteralKind)> {
    let bytes = snippet.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i < bytes.len() {
                    spans.push((start..i + 1, LiteralKind::Text));
                }
                i += 1;
            }
            b'-' | b'0'..=b'9' => {
                let start = i;
                let preceded_by_word = i > 0 && is_word(bytes[i - 1]);
                if bytes[i] == b'-' {
                    if i + 1 >= bytes.len() || !bytes[i + 1].is_ascii_digit() {
                        i += 1;
                        continue;
                    }
                    i += 1;
                }
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let followed_by_word = i < bytes.len() && is_word(bytes[i]);
                if !preceded_by_word && !followed_by_word {
                    spans.push((start..i, LiteralKind::Number));
                }
            }
            _ => i += 1,
        }
    }
    spans
}
