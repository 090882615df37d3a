use crate::command::{CommandError, CommandRunner};
use crate::config::{CommandSettings, PatternSettings};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Analyzer command failed: {0}")]
    Command(#[from] CommandError),
    #[error("Analyzer returned an unrecognised verdict: {0:?}")]
    UnrecognisedVerdict(String),
    #[error("Invalid analyzer pattern: {0}")]
    Pattern(String),
}

/// Triage classification of one segment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Normal,
    Anomalous,
    CrashIndicative,
    /// The analyzer could not classify the excerpt.
    Unknown,
}

impl Verdict {
    /// Verdicts worth following up on.
    pub fn is_finding(self) -> bool {
        matches!(self, Verdict::Anomalous | Verdict::CrashIndicative)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Normal => "normal",
            Verdict::Anomalous => "anomalous",
            Verdict::CrashIndicative => "crash-indicative",
            Verdict::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "normal" => Ok(Verdict::Normal),
            "anomalous" => Ok(Verdict::Anomalous),
            "crash-indicative" | "crash" => Ok(Verdict::CrashIndicative),
            "unknown" => Ok(Verdict::Unknown),
            _ => Err(AnalysisError::UnrecognisedVerdict(s.trim().to_string())),
        }
    }
}

/// Classifies a log excerpt.
///
/// Failures are recoverable: the caller records them as [`Verdict::Unknown`].
pub trait Analyzer: Send {
    fn name(&self) -> &'static str;

    fn analyze(&mut self, excerpt: &str) -> Result<Verdict, AnalysisError>;
}

const CRASH_PATTERNS: &[&str] = &[
    r"(?i)\bpanic",
    r"(?i)segmentation fault",
    r"(?i)core dumped",
    r"(?i)\bwatchdog\b",
    r"(?i)\breboot(ing|ed)?\b",
    r"(?i)out of memory",
    r"(?i)\bfatal\b",
    r"(?i)\bassert(ion)? failed",
];

const ANOMALY_PATTERNS: &[&str] = &[
    r"(?i)\berror\b",
    r"(?i)stack traceback",
    r"(?i)bad argument",
    r"(?i)attempt to (index|call|compare|perform arithmetic on)",
    r"(?i)\bexception\b",
    r"(?i)\binvalid\b",
];

/// Offline analyzer matching well-known crash and error signatures.
///
/// Crash signatures win over anomaly signatures. An excerpt matching neither is
/// `Normal`, including an empty one.
#[derive(Debug, Clone)]
pub struct PatternAnalyzer {
    crash: RegexSet,
    anomaly: RegexSet,
}

impl PatternAnalyzer {
    pub fn new(settings: &PatternSettings) -> Result<Self, AnalysisError> {
        let build = |defaults: &[&str], extra: &[String]| {
            RegexSet::new(
                defaults
                    .iter()
                    .map(|p| p.to_string())
                    .chain(extra.iter().cloned()),
            )
            .map_err(|e| AnalysisError::Pattern(e.to_string()))
        };
        Ok(Self {
            crash: build(CRASH_PATTERNS, &settings.extra_crash_patterns)?,
            anomaly: build(ANOMALY_PATTERNS, &settings.extra_anomaly_patterns)?,
        })
    }
}

impl Analyzer for PatternAnalyzer {
    fn name(&self) -> &'static str {
        "PatternAnalyzer"
    }

    fn analyze(&mut self, excerpt: &str) -> Result<Verdict, AnalysisError> {
        if self.crash.is_match(excerpt) {
            Ok(Verdict::CrashIndicative)
        } else if self.anomaly.is_match(excerpt) {
            Ok(Verdict::Anomalous)
        } else {
            Ok(Verdict::Normal)
        }
    }
}

/// Delegates triage to an external program: excerpt on stdin, verdict word on stdout.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    runner: CommandRunner,
}

impl CommandAnalyzer {
    pub fn new(settings: CommandSettings) -> Self {
        Self {
            runner: CommandRunner::new(settings),
        }
    }
}

impl Analyzer for CommandAnalyzer {
    fn name(&self) -> &'static str {
        "CommandAnalyzer"
    }

    fn analyze(&mut self, excerpt: &str) -> Result<Verdict, AnalysisError> {
        let stdout = self.runner.run(excerpt.as_bytes())?;
        let answer = String::from_utf8_lossy(&stdout);
        // Last non-empty line, so a chatty tool may print reasoning first.
        let verdict_line = answer
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default();
        verdict_line.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_analyzer() -> PatternAnalyzer {
        PatternAnalyzer::new(&PatternSettings::default()).unwrap()
    }

    #[test]
    fn pattern_analyzer_classifies_typical_device_output() {
        let mut analyzer = pattern_analyzer();
        assert_eq!(analyzer.analyze("bind table empty").unwrap(), Verdict::Normal);
        assert_eq!(analyzer.analyze("").unwrap(), Verdict::Normal);
        assert_eq!(
            analyzer
                .analyze("error: bad argument #2 to 'from_values'\nstack traceback:")
                .unwrap(),
            Verdict::Anomalous
        );
        assert_eq!(
            analyzer.analyze("attempt to index a nil value").unwrap(),
            Verdict::Anomalous
        );
        assert_eq!(
            analyzer.analyze("PANIC: watchdog expired, rebooting").unwrap(),
            Verdict::CrashIndicative
        );
    }

    #[test]
    fn crash_signatures_take_precedence() {
        let mut analyzer = pattern_analyzer();
        assert_eq!(
            analyzer
                .analyze("error: allocation failed\nout of memory")
                .unwrap(),
            Verdict::CrashIndicative
        );
    }

    #[test]
    fn word_boundaries_avoid_false_positives() {
        let mut analyzer = pattern_analyzer();
        assert_eq!(
            analyzer.analyze("errors_total=0 terrorist_mode=off").unwrap(),
            Verdict::Normal
        );
    }

    #[test]
    fn extra_patterns_extend_the_defaults() {
        let mut analyzer = PatternAnalyzer::new(&PatternSettings {
            extra_crash_patterns: vec!["(?i)hub offline".to_string()],
            extra_anomaly_patterns: vec!["retrying".to_string()],
        })
        .unwrap();
        assert_eq!(
            analyzer.analyze("Hub offline").unwrap(),
            Verdict::CrashIndicative
        );
        assert_eq!(analyzer.analyze("retrying").unwrap(), Verdict::Anomalous);
    }

    #[test]
    fn invalid_extra_pattern_is_rejected() {
        let result = PatternAnalyzer::new(&PatternSettings {
            extra_crash_patterns: vec!["(unclosed".to_string()],
            extra_anomaly_patterns: vec![],
        });
        assert!(matches!(result, Err(AnalysisError::Pattern(_))));
    }

    #[test]
    fn verdict_parsing_accepts_common_spellings() {
        assert_eq!("normal".parse::<Verdict>().unwrap(), Verdict::Normal);
        assert_eq!(" Anomalous\n".parse::<Verdict>().unwrap(), Verdict::Anomalous);
        assert_eq!(
            "crash_indicative".parse::<Verdict>().unwrap(),
            Verdict::CrashIndicative
        );
        assert!(matches!(
            "maybe".parse::<Verdict>(),
            Err(AnalysisError::UnrecognisedVerdict(_))
        ));
    }

    #[test]
    fn verdict_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Verdict::CrashIndicative).unwrap(),
            "\"crash-indicative\""
        );
        assert_eq!(Verdict::CrashIndicative.to_string(), "crash-indicative");
        assert!(Verdict::Anomalous.is_finding());
        assert!(!Verdict::Unknown.is_finding());
    }

    #[test]
    fn command_analyzer_reads_last_line_of_stdout() {
        let mut analyzer = CommandAnalyzer::new(CommandSettings {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo 'looks like a reset'; echo crash-indicative".to_string(),
            ],
            timeout_ms: 5_000,
            working_dir: None,
        });
        assert_eq!(
            analyzer.analyze("device rebooted").unwrap(),
            Verdict::CrashIndicative
        );
    }

    #[test]
    fn command_analyzer_failure_is_an_error() {
        let mut analyzer = CommandAnalyzer::new(CommandSettings {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
            timeout_ms: 5_000,
            working_dir: None,
        });
        assert!(matches!(
            analyzer.analyze("x"),
            Err(AnalysisError::Command(CommandError::Failed { .. }))
        ));
    }
}
