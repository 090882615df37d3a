use crate::cancel::CancelToken;
use crate::config::{CampaignSettings, CaseSourcing, TargetSettings};
use crate::findings::{Finding, FindingsLedger};
use crate::generator::{CaseFileGenerator, Generator};
use crate::orchestrator::{RoundContext, RoundError, RoundOrchestrator};
use crate::record::{RoundRecord, RoundStatus};
use crate::store::{CampaignStore, PairCheckpoint, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign store failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Round(#[from] RoundError),
}

/// How a campaign for one pair ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignOutcome {
    Completed,
    /// The device stayed unresponsive for the configured number of consecutive
    /// rounds. Usually the finding worth looking at.
    DeviceUnresponsive,
    GenerationExhausted,
    SegmentationBroken,
    /// Interrupted; a later run resumes where this one stopped.
    Cancelled,
}

impl CampaignOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CampaignOutcome::Cancelled)
    }
}

impl fmt::Display for CampaignOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CampaignOutcome::Completed => "completed",
            CampaignOutcome::DeviceUnresponsive => "device unresponsive",
            CampaignOutcome::GenerationExhausted => "generation exhausted",
            CampaignOutcome::SegmentationBroken => "segmentation invariant broken",
            CampaignOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignLimits {
    pub starting_round: u32,
    pub max_consecutive_unresponsive: u32,
    pub max_generation_failures: u32,
}

impl From<&CampaignSettings> for CampaignLimits {
    fn from(settings: &CampaignSettings) -> Self {
        Self {
            starting_round: settings.starting_round,
            max_consecutive_unresponsive: settings.max_consecutive_unresponsive.max(1),
            max_generation_failures: settings.max_generation_failures.max(1),
        }
    }
}

/// Progress of one `(api, function)` pair.
#[derive(Debug, Clone, Default)]
pub struct PairProgress {
    pub next_round: u32,
    pub records: Vec<RoundRecord>,
    pub consecutive_unresponsive: u32,
    pub consecutive_generation_failures: u32,
    pub outcome: Option<CampaignOutcome>,
}

impl PairProgress {
    fn checkpoint(&self, api: &str, function: &str) -> PairCheckpoint {
        PairCheckpoint {
            api: api.to_string(),
            function: function.to_string(),
            next_round: self.next_round,
            consecutive_unresponsive: self.consecutive_unresponsive,
            consecutive_generation_failures: self.consecutive_generation_failures,
            outcome: self.outcome.filter(|o| o.is_terminal()),
        }
    }

    /// Applies the status of a finished round to the stop conditions.
    fn settle(&mut self, status: RoundStatus, limits: &CampaignLimits) {
        self.consecutive_generation_failures = 0;
        match status {
            RoundStatus::DeviceUnresponsive => {
                self.consecutive_unresponsive += 1;
                if self.consecutive_unresponsive >= limits.max_consecutive_unresponsive {
                    self.outcome = Some(CampaignOutcome::DeviceUnresponsive);
                }
            }
            RoundStatus::SegmentationFailed => {
                self.consecutive_unresponsive = 0;
                self.outcome = Some(CampaignOutcome::SegmentationBroken);
            }
            RoundStatus::Cancelled => self.outcome = Some(CampaignOutcome::Cancelled),
            RoundStatus::Completed | RoundStatus::PartiallyFailed => {
                self.consecutive_unresponsive = 0;
            }
        }
    }
}

/// Campaign progress across all pairs. Only the [`BatchProcessor`] mutates it.
#[derive(Debug, Default)]
pub struct CampaignState {
    pairs: BTreeMap<(String, String), PairProgress>,
}

impl CampaignState {
    pub fn progress(&self, api: &str, function: &str) -> Option<&PairProgress> {
        self.pairs.get(&(api.to_string(), function.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct CampaignReport {
    pub api: String,
    pub function: String,
    pub outcome: CampaignOutcome,
    /// Rounds executed by this invocation, excluding resumed history.
    pub rounds_run: u32,
    pub next_round: u32,
    pub findings: Vec<Finding>,
}

/// Outer loop over pairs and rounds.
///
/// Rounds for a pair run strictly in order against the single device endpoint
/// owned by the orchestrator. Every round record is durably written before the
/// checkpoint advances, so an interrupted campaign loses at most the round in
/// flight.
pub struct BatchProcessor {
    orchestrator: RoundOrchestrator,
    store: CampaignStore,
    generator: Box<dyn Generator>,
    sourcing: CaseSourcing,
    limits: CampaignLimits,
    state: CampaignState,
    cancel: CancelToken,
}

impl BatchProcessor {
    pub fn new(
        orchestrator: RoundOrchestrator,
        store: CampaignStore,
        generator: Box<dyn Generator>,
        sourcing: CaseSourcing,
        limits: CampaignLimits,
        cancel: CancelToken,
    ) -> Self {
        Self {
            orchestrator,
            store,
            generator,
            sourcing,
            limits,
            state: CampaignState::default(),
            cancel,
        }
    }

    pub fn state(&self) -> &CampaignState {
        &self.state
    }

    /// Runs every configured pair, one after another.
    pub fn run_targets(
        &mut self,
        targets: &[TargetSettings],
        total_rounds: u32,
    ) -> Result<Vec<CampaignReport>, CampaignError> {
        let mut reports = Vec::new();
        for target in targets {
            for function in &target.functions {
                if self.cancel.is_cancelled() {
                    tracing::warn!(api = %target.api, function = %function, "Skipping pair, campaign cancelled");
                    return Ok(reports);
                }
                reports.push(self.run_campaign(&target.api, function, total_rounds)?);
            }
        }
        Ok(reports)
    }

    pub fn run_campaign(
        &mut self,
        api: &str,
        function: &str,
        total_rounds: u32,
    ) -> Result<CampaignReport, CampaignError> {
        let mut progress = self.resume(api, function, total_rounds)?;
        let mut ledger = FindingsLedger::new();
        for record in &progress.records {
            ledger.observe(record);
        }

        let mut case_files = match &self.sourcing {
            CaseSourcing::CaseFuzzing { template } => Some(CaseFileGenerator::new(template.clone())),
            CaseSourcing::Refinement => None,
        };
        let mut rounds_run = 0;

        if let Some(outcome) = progress.outcome {
            tracing::info!(api, function, outcome = %outcome, "Campaign already finished, skipping");
        } else {
            tracing::info!(
                api,
                function,
                next_round = progress.next_round,
                total_rounds,
                resumed_records = progress.records.len(),
                "Starting campaign"
            );
        }

        while progress.outcome.is_none() && progress.next_round < total_rounds {
            if self.cancel.is_cancelled() {
                progress.outcome = Some(CampaignOutcome::Cancelled);
                break;
            }
            let round = progress.next_round;
            let ctx = RoundContext { api, function, round };
            let generator: &mut dyn Generator = match case_files.as_mut() {
                Some(case_files) => case_files,
                None => self.generator.as_mut(),
            };

            match self
                .orchestrator
                .run_round(ctx, generator, &progress.records, &self.cancel)
            {
                Ok(record) => {
                    rounds_run += 1;
                    self.store.save_record(&record)?;
                    self.absorb(&mut progress, record, &mut ledger);
                }
                Err(RoundError::Generation { round, source }) => {
                    if self.cancel.is_cancelled() {
                        progress.outcome = Some(CampaignOutcome::Cancelled);
                        break;
                    }
                    progress.consecutive_generation_failures += 1;
                    tracing::warn!(
                        api,
                        function,
                        round,
                        failures = progress.consecutive_generation_failures,
                        error = %source,
                        "Round produced no test cases"
                    );
                    if progress.consecutive_generation_failures >= self.limits.max_generation_failures {
                        progress.outcome = Some(CampaignOutcome::GenerationExhausted);
                    }
                }
                Err(e) => return Err(e.into()),
            }
            self.store.save_checkpoint(&progress.checkpoint(api, function))?;
        }

        if progress.outcome.is_none() {
            progress.outcome = Some(CampaignOutcome::Completed);
            self.store.save_checkpoint(&progress.checkpoint(api, function))?;
        }
        let outcome = progress.outcome.unwrap_or(CampaignOutcome::Completed);
        match outcome {
            CampaignOutcome::Completed => {
                tracing::info!(api, function, rounds_run, findings = ledger.len(), "Campaign completed")
            }
            CampaignOutcome::Cancelled => {
                tracing::warn!(api, function, next_round = progress.next_round, "Campaign cancelled")
            }
            other => tracing::error!(api, function, outcome = %other, "Campaign stopped early"),
        }

        let report = CampaignReport {
            api: api.to_string(),
            function: function.to_string(),
            outcome,
            rounds_run,
            next_round: progress.next_round,
            findings: ledger.findings().to_vec(),
        };
        self.state
            .pairs
            .insert((api.to_string(), function.to_string()), progress);
        Ok(report)
    }

    /// Folds a persisted round into the pair's progress and decides whether the
    /// campaign continues.
    fn absorb(&self, progress: &mut PairProgress, record: RoundRecord, ledger: &mut FindingsLedger) {
        let fresh = ledger.observe(&record);
        if fresh > 0 {
            tracing::info!(round = record.round, new_findings = fresh, "New distinct findings");
        }
        progress.settle(record.status, &self.limits);
        if record.status == RoundStatus::Cancelled {
            // The index is not advanced: a resumed run repeats this round.
            return;
        }
        progress.next_round = record.round + 1;
        progress.records.push(record);
    }

    /// Rebuilds a pair's progress from the store.
    ///
    /// The checkpoint is written after the record, so records past it belong to
    /// rounds whose checkpoint never landed; their statuses are replayed against
    /// the stop conditions. Cancelled rounds are retired and run again. A pair
    /// that ended for any reason other than completion stays finished; a
    /// completed pair continues if more rounds were requested since.
    fn resume(&self, api: &str, function: &str, total_rounds: u32) -> Result<PairProgress, StoreError> {
        let checkpoint = self.store.load_checkpoint(api, function)?.unwrap_or_default();
        let mut progress = PairProgress {
            next_round: checkpoint.next_round,
            records: Vec::new(),
            consecutive_unresponsive: checkpoint.consecutive_unresponsive,
            consecutive_generation_failures: checkpoint.consecutive_generation_failures,
            outcome: checkpoint.outcome,
        };

        let mut replayed = 0;
        for record in self.store.load_records(api, function)? {
            if record.status == RoundStatus::Cancelled {
                self.store.retire_cancelled(&record)?;
                continue;
            }
            if record.round >= checkpoint.next_round && progress.outcome.is_none() {
                progress.settle(record.status, &self.limits);
                replayed += 1;
            }
            progress.next_round = progress.next_round.max(record.round + 1);
            progress.records.push(record);
        }
        progress.next_round = progress.next_round.max(self.limits.starting_round);
        if progress.outcome == Some(CampaignOutcome::Completed) && progress.next_round < total_rounds {
            progress.outcome = None;
        }

        if replayed > 0 {
            self.store.save_checkpoint(&progress.checkpoint(api, function))?;
        }
        if !progress.records.is_empty() {
            tracing::info!(
                api,
                function,
                records = progress.records.len(),
                replayed,
                next_round = progress.next_round,
                "Resuming from store"
            );
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::PatternAnalyzer;
    use crate::channel::Endpoint;
    use crate::channel::test_utils::{Reply, ScriptLog, ScriptedChannel};
    use crate::collector::LogCollector;
    use crate::config::{MarkerSettings, PatternSettings};
    use crate::extractor::{BoundaryMarkers, CaseExtractor};
    use crate::orchestrator::test_utils::{FixedGenerator, FlakyGenerator, settings};
    use crate::record::test_utils::case;
    use crate::testcase::TestCase;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    const API: &str = "zdo/mgmt_bind_request";
    const FUNCTION: &str = "from_values()";

    fn limits() -> CampaignLimits {
        CampaignLimits {
            starting_round: 0,
            max_consecutive_unresponsive: 2,
            max_generation_failures: 2,
        }
    }

    fn processor(
        root: &Path,
        replies: Vec<Reply>,
        generator: Box<dyn Generator>,
        sourcing: CaseSourcing,
        cancel: CancelToken,
    ) -> (BatchProcessor, Arc<Mutex<ScriptLog>>) {
        let channel = ScriptedChannel::new(vec![], replies);
        let log = channel.log();
        let orchestrator = RoundOrchestrator::new(
            Box::new(channel),
            Endpoint::new("hub.local", 9000),
            LogCollector::new(root),
            CaseExtractor::new(BoundaryMarkers::from(&MarkerSettings::default())),
            Box::new(PatternAnalyzer::new(&PatternSettings::default()).unwrap()),
            settings(),
            Box::new(ChaCha8Rng::from_seed([0; 32])),
        );
        let store = CampaignStore::new(root.to_path_buf()).unwrap();
        let processor = BatchProcessor::new(orchestrator, store, generator, sourcing, limits(), cancel);
        (processor, log)
    }

    fn one_case() -> Box<dyn Generator> {
        Box::new(FixedGenerator(vec![case(1, "from_values({}, 0)")]))
    }

    fn ok_reply() -> Reply {
        Reply::Output("START\nbind table empty\nEND\n".to_string())
    }

    #[test]
    fn runs_all_rounds_and_persists_each_record() {
        let dir = tempdir().unwrap();
        let (mut processor, log) = processor(
            dir.path(),
            vec![ok_reply(), ok_reply(), ok_reply()],
            one_case(),
            CaseSourcing::Refinement,
            CancelToken::new(),
        );

        let report = processor.run_campaign(API, FUNCTION, 3).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::Completed);
        assert_eq!(report.rounds_run, 3);
        assert_eq!(report.next_round, 3);
        assert_eq!(log.lock().unwrap().sent.len(), 3);

        let store = CampaignStore::new(dir.path().to_path_buf()).unwrap();
        let records = store.load_records(API, FUNCTION).unwrap();
        assert_eq!(records.iter().map(|r| r.round).collect::<Vec<_>>(), vec![0, 1, 2]);
        let checkpoint = store.load_checkpoint(API, FUNCTION).unwrap().unwrap();
        assert_eq!(checkpoint.next_round, 3);
        assert_eq!(checkpoint.outcome, Some(CampaignOutcome::Completed));

        let progress = processor.state().progress(API, FUNCTION).unwrap();
        assert_eq!(progress.records.len(), 3);
    }

    #[test]
    fn restart_resumes_after_last_durable_round() {
        let dir = tempdir().unwrap();
        {
            let (mut first, _) = processor(
                dir.path(),
                vec![ok_reply(), ok_reply()],
                one_case(),
                CaseSourcing::Refinement,
                CancelToken::new(),
            );
            first.run_campaign(API, FUNCTION, 2).unwrap();
        }

        let (mut second, log) = processor(
            dir.path(),
            vec![ok_reply()],
            one_case(),
            CaseSourcing::Refinement,
            CancelToken::new(),
        );
        let report = second.run_campaign(API, FUNCTION, 3).unwrap();
        assert_eq!(report.rounds_run, 1);
        assert_eq!(report.next_round, 3);
        assert_eq!(log.lock().unwrap().sent.len(), 1);
        assert_eq!(second.state().progress(API, FUNCTION).unwrap().records.len(), 3);

        // Nothing left to do for the same round count.
        let report = second.run_campaign(API, FUNCTION, 3).unwrap();
        assert_eq!(report.rounds_run, 0);
        assert_eq!(report.outcome, CampaignOutcome::Completed);
    }

    #[test]
    fn consecutive_unresponsive_rounds_stop_the_campaign() {
        let dir = tempdir().unwrap();
        let (mut processor, _) = processor(
            dir.path(),
            vec![Reply::Timeout, Reply::Timeout, Reply::Timeout, Reply::Timeout],
            one_case(),
            CaseSourcing::Refinement,
            CancelToken::new(),
        );

        let report = processor.run_campaign(API, FUNCTION, 5).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::DeviceUnresponsive);
        assert_eq!(report.rounds_run, 2);

        let store = CampaignStore::new(dir.path().to_path_buf()).unwrap();
        let records = store.load_records(API, FUNCTION).unwrap();
        assert!(records.iter().all(|r| r.status == RoundStatus::DeviceUnresponsive));

        // A terminated pair is not bombarded again on restart.
        let report = processor.run_campaign(API, FUNCTION, 5).unwrap();
        assert_eq!(report.rounds_run, 0);
        assert_eq!(report.outcome, CampaignOutcome::DeviceUnresponsive);
    }

    #[test]
    fn segmentation_breakage_stops_immediately() {
        let dir = tempdir().unwrap();
        let (mut processor, _) = processor(
            dir.path(),
            vec![Reply::Output("START\na\nEND\nSTART\nb\nEND\n".to_string())],
            one_case(),
            CaseSourcing::Refinement,
            CancelToken::new(),
        );
        let report = processor.run_campaign(API, FUNCTION, 3).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::SegmentationBroken);
        assert_eq!(report.rounds_run, 1);
    }

    #[test]
    fn generation_failures_exhaust_after_limit() {
        let dir = tempdir().unwrap();
        let generator = Box::new(FlakyGenerator {
            failures: u32::MAX,
            calls: 0,
            batch: vec![],
        });
        let (mut processor, log) = processor(
            dir.path(),
            vec![],
            generator,
            CaseSourcing::Refinement,
            CancelToken::new(),
        );
        let report = processor.run_campaign(API, FUNCTION, 3).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::GenerationExhausted);
        assert_eq!(report.rounds_run, 0);
        assert_eq!(report.next_round, 0);
        assert_eq!(log.lock().unwrap().connect_attempts, 0);
    }

    #[test]
    fn case_fuzzing_mode_reads_the_case_file() {
        let dir = tempdir().unwrap();
        let cases: Vec<TestCase> = vec![case(1, "from_values({}, 0)"), case(2, "from_values({}, -1)")];
        let file = dir.path().join("cases.json");
        std::fs::write(&file, serde_json::to_string(&cases).unwrap()).unwrap();

        let (mut processor, log) = processor(
            &dir.path().join("artifacts"),
            vec![ok_reply(), ok_reply()],
            one_case(),
            CaseSourcing::CaseFuzzing {
                template: file.display().to_string(),
            },
            CancelToken::new(),
        );
        let report = processor.run_campaign(API, FUNCTION, 1).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::Completed);
        let log = log.lock().unwrap();
        assert_eq!(log.sent.len(), 2);
        assert_eq!(log.sent[1], cases[1].to_request_line().unwrap());
    }

    #[test]
    fn findings_are_reported_once() {
        let dir = tempdir().unwrap();
        let crash = || Reply::Output("START\nPANIC: watchdog reset\nEND\n".to_string());
        let (mut processor, _) = processor(
            dir.path(),
            vec![crash(), crash()],
            one_case(),
            CaseSourcing::Refinement,
            CancelToken::new(),
        );
        let report = processor.run_campaign(API, FUNCTION, 2).unwrap();
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].round, 0);
    }

    #[test]
    fn cancelled_campaign_is_not_terminal() {
        let dir = tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let (mut processor, _) = processor(
            dir.path(),
            vec![],
            one_case(),
            CaseSourcing::Refinement,
            cancel,
        );
        let targets = vec![TargetSettings {
            api: API.to_string(),
            functions: vec![FUNCTION.to_string(), "to_bytes()".to_string()],
        }];
        let reports = processor.run_targets(&targets, 2).unwrap();
        assert!(reports.is_empty());
        assert!(processor.state().is_empty());

        let (mut resumed, _) = processor_after_cancel(dir.path());
        let report = resumed.run_campaign(API, FUNCTION, 1).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::Completed);
    }

    fn processor_after_cancel(root: &Path) -> (BatchProcessor, Arc<Mutex<ScriptLog>>) {
        processor(
            root,
            vec![ok_reply()],
            one_case(),
            CaseSourcing::Refinement,
            CancelToken::new(),
        )
    }

    #[test]
    fn cancelled_round_is_repeated_on_resume() {
        let dir = tempdir().unwrap();
        let store = CampaignStore::new(dir.path().to_path_buf()).unwrap();
        let live_log = crate::store::round_log_path(dir.path(), API, FUNCTION, 0);
        let mut cancelled = crate::record::test_utils::record(0, vec![case(1, "f(0)")], &[]);
        cancelled.status = RoundStatus::Cancelled;
        cancelled.log.path = live_log.clone();
        store.save_record(&cancelled).unwrap();
        std::fs::write(&live_log, "START\nhalf an answer\n").unwrap();

        let (mut processor, log) = processor_after_cancel(dir.path());
        let report = processor.run_campaign(API, FUNCTION, 1).unwrap();
        assert_eq!(report.rounds_run, 1);
        assert_eq!(log.lock().unwrap().sent.len(), 1);
        let record = store.load_record(API, FUNCTION, 0).unwrap().unwrap();
        assert_eq!(record.status, RoundStatus::Completed);
        assert_eq!(
            std::fs::read_to_string(&live_log).unwrap(),
            "START\nbind table empty\nEND\n"
        );
        let kept = live_log.with_file_name("round-0000.cancelled.log");
        assert_eq!(
            std::fs::read_to_string(kept).unwrap(),
            "START\nhalf an answer\n"
        );
        assert!(live_log.with_file_name("round-0000.cancelled.json").exists());
    }

    fn saved_round(store: &CampaignStore, round: u32, status: RoundStatus) {
        let mut record = crate::record::test_utils::record(round, vec![case(1, "f(0)")], &[]);
        record.status = status;
        store.save_record(&record).unwrap();
    }

    #[test]
    fn broken_round_without_checkpoint_still_stops_the_campaign() {
        let dir = tempdir().unwrap();
        let store = CampaignStore::new(dir.path().to_path_buf()).unwrap();
        saved_round(&store, 0, RoundStatus::SegmentationFailed);

        let (mut processor, log) = processor_after_cancel(dir.path());
        let report = processor.run_campaign(API, FUNCTION, 3).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::SegmentationBroken);
        assert_eq!(report.rounds_run, 0);
        assert_eq!(report.next_round, 1);
        assert_eq!(log.lock().unwrap().connect_attempts, 0);
        let checkpoint = store.load_checkpoint(API, FUNCTION).unwrap().unwrap();
        assert_eq!(checkpoint.outcome, Some(CampaignOutcome::SegmentationBroken));
    }

    #[test]
    fn unresponsive_rounds_past_the_checkpoint_count_toward_the_limit() {
        let dir = tempdir().unwrap();
        let store = CampaignStore::new(dir.path().to_path_buf()).unwrap();
        saved_round(&store, 0, RoundStatus::Completed);
        saved_round(&store, 1, RoundStatus::DeviceUnresponsive);
        saved_round(&store, 2, RoundStatus::DeviceUnresponsive);
        store
            .save_checkpoint(&PairCheckpoint {
                api: API.to_string(),
                function: FUNCTION.to_string(),
                next_round: 1,
                ..PairCheckpoint::default()
            })
            .unwrap();

        let (mut processor, _) = processor_after_cancel(dir.path());
        let report = processor.run_campaign(API, FUNCTION, 5).unwrap();
        assert_eq!(report.outcome, CampaignOutcome::DeviceUnresponsive);
        assert_eq!(report.rounds_run, 0);
        assert_eq!(report.next_round, 3);
        let progress = processor.state().progress(API, FUNCTION).unwrap();
        assert_eq!(progress.consecutive_unresponsive, 2);
    }

    #[test]
    fn starting_round_skips_earlier_indices() {
        let dir = tempdir().unwrap();
        let (mut processor, _) = processor(
            dir.path(),
            vec![ok_reply()],
            one_case(),
            CaseSourcing::Refinement,
            CancelToken::new(),
        );
        processor.limits.starting_round = 4;
        let report = processor.run_campaign(API, FUNCTION, 5).unwrap();
        assert_eq!(report.rounds_run, 1);
        let store = CampaignStore::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.load_records(API, FUNCTION).unwrap()[0].round, 4);
    }
}
