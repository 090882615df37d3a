use crate::analyzer::Verdict;
use crate::collector::LogArtifact;
use crate::extractor::Segment;
use crate::testcase::TestCase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final status of a round as persisted in its record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RoundStatus {
    Completed,
    PartiallyFailed,
    DeviceUnresponsive,
    /// Segmentation invariants were violated; the log could not be attributed.
    SegmentationFailed,
    Cancelled,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundStatus::Completed => "completed",
            RoundStatus::PartiallyFailed => "partially-failed",
            RoundStatus::DeviceUnresponsive => "device-unresponsive",
            RoundStatus::SegmentationFailed => "segmentation-failed",
            RoundStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CaseVerdict {
    pub case_number: u32,
    pub verdict: Verdict,
    /// Hex MD5 of the excerpt the verdict was computed on.
    pub excerpt_digest: String,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_error: Option<String>,
}

/// The persisted outcome of one round: what was sent, what came back, and how
/// it was judged. Failed rounds are recorded like any other.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    pub api: String,
    pub function: String,
    pub round: u32,
    pub cases: Vec<TestCase>,
    pub log: LogArtifact,
    pub segments: Vec<Segment>,
    /// Cases that never reached the device: their send failed or the round
    /// stopped before them. They take no part in segment alignment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_transmitted: Vec<u32>,
    /// Cases that were sent, but whose session died before the device began
    /// answering. Also left out of alignment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_lost: Vec<u32>,
    pub verdicts: Vec<CaseVerdict>,
    pub status: RoundStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub reconnects: u32,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl RoundRecord {
    /// Cases that reached the device but produced no segment.
    pub fn silent_cases(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter().filter(|case| {
            !self.not_transmitted.contains(&case.number)
                && !self.segments.iter().any(|s| s.case_number == case.number)
        })
    }

    /// Cases the segments were aligned against, in issue order.
    pub fn aligned_cases(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter().filter(|case| {
            !self.not_transmitted.contains(&case.number) && !self.session_lost.contains(&case.number)
        })
    }

    pub fn verdict_for(&self, case_number: u32) -> Option<&CaseVerdict> {
        self.verdicts.iter().find(|v| v.case_number == case_number)
    }

    /// Cases whose excerpt was judged anomalous or crash-indicative.
    pub fn findings(&self) -> impl Iterator<Item = &CaseVerdict> {
        self.verdicts.iter().filter(|v| v.verdict.is_finding())
    }

    /// Checks the record-level invariant that every segment references exactly
    /// one aligned case and there are no more segments than aligned cases.
    pub fn is_consistent(&self) -> bool {
        self.segments.len() <= self.aligned_cases().count()
            && self.segments.iter().all(|s| {
                self.aligned_cases()
                    .filter(|c| c.number == s.case_number)
                    .count()
                    == 1
            })
    }
}

/// Round orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Idle,
    AwaitingCases,
    Executing,
    Collecting,
    Segmenting,
    Triaging,
    Completed,
    Unresponsive,
    PartiallyFailed,
}

impl RoundState {
    pub fn can_transition_to(self, next: RoundState) -> bool {
        use RoundState::*;
        matches!(
            (self, next),
            (Idle, AwaitingCases)
                | (AwaitingCases, Executing)
                | (Executing, Collecting)
                | (Executing, Unresponsive)
                | (Collecting, Segmenting)
                | (Collecting, Unresponsive)
                | (Segmenting, Triaging)
                | (Triaging, Completed)
                | (Triaging, PartiallyFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RoundState::Completed | RoundState::Unresponsive | RoundState::PartiallyFailed
        )
    }
}
