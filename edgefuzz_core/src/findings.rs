use crate::analyzer::Verdict;
use crate::record::RoundRecord;
use serde::Serialize;
use std::collections::HashSet;

/// Hex MD5 of an excerpt, used to recognise the same output across rounds.
pub fn excerpt_digest(excerpt: &str) -> String {
    format!("{:x}", md5::compute(excerpt.trim().as_bytes()))
}

/// First occurrence of a distinct anomalous or crash-indicative excerpt.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub api: String,
    pub function: String,
    pub round: u32,
    pub case_number: u32,
    pub verdict: Verdict,
    pub digest: String,
}

/// Deduplicates findings by excerpt digest.
#[derive(Debug, Default)]
pub struct FindingsLedger {
    known_digests: HashSet<String>,
    findings: Vec<Finding>,
}

impl FindingsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the record's findings and returns how many of them were new.
    pub fn observe(&mut self, record: &RoundRecord) -> usize {
        let mut fresh = 0;
        for verdict in record.findings() {
            if self.known_digests.insert(verdict.excerpt_digest.clone()) {
                self.findings.push(Finding {
                    api: record.api.clone(),
                    function: record.function.clone(),
                    round: record.round,
                    case_number: verdict.case_number,
                    verdict: verdict.verdict,
                    digest: verdict.excerpt_digest.clone(),
                });
                fresh += 1;
            }
        }
        fresh
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}
