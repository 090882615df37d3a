use crate::analyzer::{Analyzer, Verdict};
use crate::cancel::CancelToken;
use crate::channel::{Channel, ChannelError, Endpoint, IdleWindow, ReceiveEnd, SessionGuard};
use crate::collector::{CaptureError, CaptureHandle, LogCollector, now_ms};
use crate::config::EdgefuzzConfig;
use crate::extractor::{CaseExtractor, MarkerWatch};
use crate::findings::excerpt_digest;
use crate::generator::{GenerationError, GenerationRequest, Generator};
use crate::record::{CaseVerdict, RoundRecord, RoundState, RoundStatus};
use crate::retry::{RetryPolicy, RoundBudget, retry};
use crate::testcase::{TestCase, validate_batch};
use rand_core::RngCore;
use std::ops::ControlFlow;
use std::time::Duration;
use thiserror::Error;

/// Failures that prevent a round from producing a record at all.
#[derive(Error, Debug)]
pub enum RoundError {
    #[error("Round {round} could not obtain test cases: {source}")]
    Generation {
        round: u32,
        #[source]
        source: GenerationError,
    },
    #[error("Round {round} could not capture device output: {source}")]
    Capture {
        round: u32,
        #[source]
        source: CaptureError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RoundSettings {
    pub window: IdleWindow,
    /// Reconnect attempts allowed per round before the device is declared unresponsive.
    pub max_reconnects: u32,
    pub retry: RetryPolicy,
    pub round_budget: Duration,
}

impl From<&EdgefuzzConfig> for RoundSettings {
    fn from(config: &EdgefuzzConfig) -> Self {
        Self {
            window: IdleWindow {
                idle_timeout: Duration::from_millis(config.channel.idle_timeout_ms),
                quiet_period: Duration::from_millis(config.channel.quiet_period_ms),
                max_capture: Duration::from_millis(config.channel.max_capture_ms),
            },
            max_reconnects: config.channel.max_reconnects,
            retry: RetryPolicy::from(&config.retry),
            round_budget: Duration::from_millis(config.retry.round_budget_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RoundContext<'a> {
    pub api: &'a str,
    pub function: &'a str,
    pub round: u32,
}

/// What happened while cases were on the wire.
#[derive(Debug, Default)]
struct Execution {
    /// Indices of cases whose send succeeded, in order.
    transmitted: Vec<usize>,
    /// Transmitted indices whose session failed before any start marker arrived.
    session_lost: Vec<usize>,
    reconnects: u32,
    unresponsive: bool,
    cancelled: bool,
    failure: Option<String>,
    capture_error: Option<CaptureError>,
}

/// Drives one round: cases in, verdicts out.
///
/// The orchestrator is the only holder of the channel while a round runs, and
/// the session is closed before [`RoundOrchestrator::run_round`] returns on
/// every path.
pub struct RoundOrchestrator {
    channel: Box<dyn Channel>,
    endpoint: Endpoint,
    collector: LogCollector,
    extractor: CaseExtractor,
    analyzer: Box<dyn Analyzer>,
    settings: RoundSettings,
    rng: Box<dyn RngCore + Send>,
    state: RoundState,
}

impl Execution {
    /// Cases that segments will be aligned against.
    fn aligned(&self) -> usize {
        self.transmitted.len() - self.session_lost.len()
    }
}

/// Start and end markers seen in the live output stream.
struct OutputWatch {
    starts: MarkerWatch,
    ends: MarkerWatch,
}

impl OutputWatch {
    fn feed(&mut self, chunk: &[u8]) -> usize {
        self.starts.feed(chunk);
        self.ends.feed(chunk)
    }
}

impl RoundOrchestrator {
    pub fn new(
        channel: Box<dyn Channel>,
        endpoint: Endpoint,
        collector: LogCollector,
        extractor: CaseExtractor,
        analyzer: Box<dyn Analyzer>,
        settings: RoundSettings,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            channel,
            endpoint,
            collector,
            extractor,
            analyzer,
            settings,
            rng,
            state: RoundState::Idle,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn enter(&mut self, next: RoundState) {
        // Unresponsive is absorbing: later phases still run for evidence but
        // never leave it.
        if self.state == RoundState::Unresponsive {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal round transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(from = ?self.state, to = ?next, "Round state transition");
        self.state = next;
    }

    /// Runs a complete round and returns its record.
    ///
    /// Channel failures, analyzer failures and segmentation failures are
    /// recorded in the returned record. Only a generator that cannot produce
    /// cases, or a log that cannot be written, fails the call.
    pub fn run_round(
        &mut self,
        ctx: RoundContext<'_>,
        generator: &mut dyn Generator,
        history: &[RoundRecord],
        cancel: &CancelToken,
    ) -> Result<RoundRecord, RoundError> {
        self.state = RoundState::Idle;
        let started_at_ms = now_ms();
        let budget = RoundBudget::new(self.settings.round_budget);

        self.enter(RoundState::AwaitingCases);
        let request = GenerationRequest {
            api: ctx.api,
            function: ctx.function,
            round: ctx.round,
            history,
        };
        let cases = retry(
            &self.settings.retry,
            &budget,
            &mut *self.rng,
            cancel,
            generator.name(),
            |_| {
                let cases = generator.generate(&request)?;
                validate_batch(&cases)?;
                Ok::<_, GenerationError>(cases)
            },
        )
        .map_err(|e| RoundError::Generation {
            round: ctx.round,
            source: GenerationError::Exhausted(e.to_string()),
        })?;
        let payloads = cases
            .iter()
            .map(TestCase::to_request_line)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RoundError::Generation {
                round: ctx.round,
                source: GenerationError::Request(e.to_string()),
            })?;
        tracing::info!(
            api = ctx.api,
            function = ctx.function,
            round = ctx.round,
            cases = cases.len(),
            generator = generator.name(),
            "Test cases ready"
        );

        self.enter(RoundState::Executing);
        let mut capture = self
            .collector
            .begin_capture(ctx.api, ctx.function, ctx.round)
            .map_err(|source| RoundError::Capture {
                round: ctx.round,
                source,
            })?;
        let execution = self.execute(&cases, &payloads, &mut capture, cancel);
        let log = self
            .collector
            .end_capture(capture)
            .map_err(|source| RoundError::Capture {
                round: ctx.round,
                source,
            })?;
        if let Some(source) = execution.capture_error {
            return Err(RoundError::Capture {
                round: ctx.round,
                source,
            });
        }
        if execution.unresponsive {
            self.enter(RoundState::Unresponsive);
        } else {
            self.enter(RoundState::Collecting);
        }

        let not_transmitted = cases
            .iter()
            .enumerate()
            .filter(|(index, _)| !execution.transmitted.contains(index))
            .map(|(_, case)| case.number)
            .collect();
        let session_lost = execution
            .session_lost
            .iter()
            .map(|&index| cases[index].number)
            .collect();
        let mut record = RoundRecord {
            api: ctx.api.to_string(),
            function: ctx.function.to_string(),
            round: ctx.round,
            cases,
            log,
            segments: Vec::new(),
            not_transmitted,
            session_lost,
            verdicts: Vec::new(),
            status: RoundStatus::Completed,
            failure: execution.failure,
            reconnects: execution.reconnects,
            started_at_ms,
            finished_at_ms: 0,
        };

        self.enter(RoundState::Segmenting);
        let aligned: Vec<TestCase> = record.aligned_cases().cloned().collect();
        match self.extractor.segment(&record.log, &aligned) {
            Ok(segments) => record.segments = segments,
            Err(e) => {
                tracing::error!(
                    api = ctx.api,
                    function = ctx.function,
                    round = ctx.round,
                    error = %e,
                    "Segmentation invariant violated"
                );
                record.status = RoundStatus::SegmentationFailed;
                record.failure = Some(e.to_string());
                record.finished_at_ms = now_ms();
                return Ok(record);
            }
        }

        if execution.cancelled {
            record.status = RoundStatus::Cancelled;
            record.finished_at_ms = now_ms();
            tracing::warn!(
                round = ctx.round,
                sent = execution.transmitted.len(),
                "Round cancelled"
            );
            return Ok(record);
        }

        self.enter(RoundState::Triaging);
        let mut analysis_failures = 0;
        for segment in &record.segments {
            let analyzer = &mut self.analyzer;
            let name = analyzer.name();
            let result = retry(
                &self.settings.retry,
                &budget,
                &mut *self.rng,
                cancel,
                name,
                |_| analyzer.analyze(&segment.excerpt),
            );
            let (verdict, analysis_error) = match result {
                Ok(verdict) => (verdict, None),
                Err(e) => {
                    analysis_failures += 1;
                    (Verdict::Unknown, Some(e.to_string()))
                }
            };
            tracing::debug!(
                case = segment.case_number,
                verdict = %verdict,
                truncated = segment.truncated,
                "Segment triaged"
            );
            record.verdicts.push(CaseVerdict {
                case_number: segment.case_number,
                verdict,
                excerpt_digest: excerpt_digest(&segment.excerpt),
                truncated: segment.truncated,
                analysis_error,
            });
        }

        let all_analysis_failed =
            !record.segments.is_empty() && analysis_failures == record.segments.len();
        record.status = if execution.unresponsive {
            RoundStatus::DeviceUnresponsive
        } else if all_analysis_failed {
            self.enter(RoundState::PartiallyFailed);
            record.failure = Some(format!(
                "Analyzer failed for all {} segments",
                record.segments.len()
            ));
            RoundStatus::PartiallyFailed
        } else {
            self.enter(RoundState::Completed);
            RoundStatus::Completed
        };
        record.finished_at_ms = now_ms();

        tracing::info!(
            api = ctx.api,
            function = ctx.function,
            round = ctx.round,
            status = %record.status,
            segments = record.segments.len(),
            findings = record.findings().count(),
            silent = record.silent_cases().count(),
            "Round finished"
        );
        Ok(record)
    }

    /// Sends every case and streams device output into the capture.
    ///
    /// Each case goes out at most once. A failed case is not resent after a
    /// reconnect; its absence from the log is itself the observation. Cases
    /// that never reached the device, or whose session died before the device
    /// started answering them, are reported so they stay out of alignment.
    fn execute(
        &mut self,
        cases: &[TestCase],
        payloads: &[Vec<u8>],
        capture: &mut CaptureHandle,
        cancel: &CancelToken,
    ) -> Execution {
        let window = self.settings.window;
        let mut reconnects_left = self.settings.max_reconnects;
        let mut execution = Execution::default();
        let markers = self.extractor.markers();
        let mut watch = OutputWatch {
            starts: MarkerWatch::new(&markers.start),
            ends: MarkerWatch::new(&markers.end),
        };
        let collector = &self.collector;
        let endpoint = &self.endpoint;
        let mut guard = SessionGuard::new(self.channel.as_mut());

        loop {
            match guard.channel().connect(endpoint) {
                Ok(session) => {
                    tracing::info!(endpoint = %endpoint, session = session.id, "Connected to device");
                    break;
                }
                Err(e) => {
                    if !spend_reconnect(&mut reconnects_left, &mut execution, &e) {
                        return execution;
                    }
                }
            }
        }

        let mut receive = |channel: &mut dyn Channel,
                           watch: &mut OutputWatch,
                           expected_ends: usize,
                           execution: &mut Execution|
         -> Result<ReceiveEnd, ChannelError> {
            let mut sink = |chunk: &[u8]| {
                if let Err(e) = collector.append_raw(capture, chunk) {
                    execution.capture_error = Some(e);
                    return ControlFlow::Break(());
                }
                if watch.feed(chunk) >= expected_ends {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            };
            channel.receive_until_idle(window, &mut sink, cancel)
        };

        for (index, (case, payload)) in cases.iter().zip(payloads).enumerate() {
            if cancel.is_cancelled() {
                execution.cancelled = true;
                break;
            }
            tracing::debug!(case = case.number, snippets = case.snippets.len(), "Sending test case");
            let starts_before = watch.starts.seen();
            let step = match guard.channel().send(payload) {
                Ok(()) => {
                    execution.transmitted.push(index);
                    let expected = execution.aligned();
                    receive(guard.channel(), &mut watch, expected, &mut execution)
                }
                Err(e) => Err(e),
            };
            match step {
                Ok(ReceiveEnd::Cancelled) => {
                    execution.cancelled = true;
                    break;
                }
                Ok(ReceiveEnd::CaptureLimit) => {
                    runaway(&mut execution, window);
                    return execution;
                }
                Ok(_) if execution.capture_error.is_some() => return execution,
                Ok(_) => {}
                Err(e) => {
                    let was_sent = execution.transmitted.last() == Some(&index);
                    if was_sent && watch.starts.seen() == starts_before {
                        execution.session_lost.push(index);
                    }
                    tracing::warn!(case = case.number, sent = was_sent, error = %e, "Channel failure while executing");
                    if !reconnect(guard.channel(), endpoint, &mut reconnects_left, &mut execution, &e) {
                        return execution;
                    }
                }
            }
        }

        let expected = execution.aligned();
        if execution.cancelled || watch.ends.seen() >= expected {
            return execution;
        }
        tracing::debug!(ends_seen = watch.ends.seen(), expected, "Collecting trailing output");
        match receive(guard.channel(), &mut watch, expected, &mut execution) {
            Ok(ReceiveEnd::Cancelled) => execution.cancelled = true,
            Ok(ReceiveEnd::CaptureLimit) => runaway(&mut execution, window),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Channel failure while collecting");
                execution.unresponsive = true;
                execution.failure = Some(e.to_string());
            }
        }
        execution
    }
}

/// A device that never stops printing is not taking commands.
fn runaway(execution: &mut Execution, window: IdleWindow) {
    let message = format!(
        "Device output did not settle within {} ms",
        window.max_capture.as_millis()
    );
    tracing::error!(sent = execution.transmitted.len(), "{message}");
    execution.unresponsive = true;
    execution.failure = Some(message);
}

/// Consumes one reconnect from the round budget, or marks the round unresponsive.
fn spend_reconnect(reconnects_left: &mut u32, execution: &mut Execution, error: &ChannelError) -> bool {
    if *reconnects_left == 0 {
        tracing::error!(error = %error, "Device unresponsive, reconnect budget spent");
        execution.unresponsive = true;
        execution.failure = Some(error.to_string());
        return false;
    }
    *reconnects_left -= 1;
    execution.reconnects += 1;
    tracing::warn!(error = %error, "Reconnecting to device");
    true
}

fn reconnect(
    channel: &mut dyn Channel,
    endpoint: &Endpoint,
    reconnects_left: &mut u32,
    execution: &mut Execution,
    error: &ChannelError,
) -> bool {
    if !spend_reconnect(reconnects_left, execution, error) {
        return false;
    }
    match channel.connect(endpoint) {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(error = %e, "Reconnect failed, device unresponsive");
            execution.unresponsive = true;
            execution.failure = Some(format!("{error}; reconnect failed: {e}"));
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::{FixedGenerator, FlakyGenerator, settings};
    use super::*;
    use crate::analyzer::{AnalysisError, PatternAnalyzer};
    use crate::channel::test_utils::{Reply, ScriptedChannel};
    use crate::config::{MarkerSettings, PatternSettings};
    use crate::extractor::BoundaryMarkers;
    use crate::record::test_utils::case;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::path::Path;
    use tempfile::tempdir;

    struct FailingAnalyzer;

    impl Analyzer for FailingAnalyzer {
        fn name(&self) -> &'static str {
            "FailingAnalyzer"
        }

        fn analyze(&mut self, _excerpt: &str) -> Result<Verdict, AnalysisError> {
            Err(AnalysisError::UnrecognisedVerdict("???".to_string()))
        }
    }

    fn orchestrator(
        root: &Path,
        channel: ScriptedChannel,
        analyzer: Box<dyn Analyzer>,
    ) -> RoundOrchestrator {
        RoundOrchestrator::new(
            Box::new(channel),
            Endpoint::new("hub.local", 9000),
            LogCollector::new(root),
            CaseExtractor::new(BoundaryMarkers::from(&MarkerSettings::default())),
            analyzer,
            settings(),
            Box::new(ChaCha8Rng::from_seed([0; 32])),
        )
    }

    fn pattern() -> Box<dyn Analyzer> {
        Box::new(PatternAnalyzer::new(&PatternSettings::default()).unwrap())
    }

    fn bind_cases() -> Vec<TestCase> {
        vec![
            case(1, "from_values({}, 0)"),
            case(2, "from_values({}, -1)"),
            case(3, "from_values({}, 999999)"),
        ]
    }

    const CTX: RoundContext<'static> = RoundContext {
        api: "zdo/mgmt_bind_request",
        function: "from_values()",
        round: 0,
    };

    #[test]
    fn three_bracketed_excerpts_map_to_three_cases() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![],
            vec![
                Reply::Output("START\nbind table empty\nEND\n".to_string()),
                Reply::Output("START\nerror: bad argument #2\nstack traceback:\nEND\n".to_string()),
                Reply::Output("START\nerror: start index out of range\nEND\n".to_string()),
            ],
        );
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &CancelToken::new())
            .unwrap();

        assert_eq!(record.status, RoundStatus::Completed);
        assert_eq!(orchestrator.state(), RoundState::Completed);
        assert_eq!(record.segments.len(), 3);
        assert_eq!(
            record.verdicts.iter().map(|v| v.verdict).collect::<Vec<_>>(),
            vec![Verdict::Normal, Verdict::Anomalous, Verdict::Anomalous]
        );
        assert!(record.is_consistent());

        let log = log.lock().unwrap();
        assert_eq!(log.sent.len(), 3);
        for (sent, case) in log.sent.iter().zip(bind_cases()) {
            assert_eq!(sent, &case.to_request_line().unwrap());
        }
        assert_eq!(log.closes, 1);
        assert!(record.log.path.exists());
    }

    #[test]
    fn disconnect_after_first_case_is_unresponsive_with_partial_evidence() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![true, false],
            vec![Reply::OutputThenDrop("START\nfrom_values: processing\n".to_string())],
        );
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &CancelToken::new())
            .unwrap();

        assert_eq!(record.status, RoundStatus::DeviceUnresponsive);
        assert_eq!(orchestrator.state(), RoundState::Unresponsive);
        assert_eq!(record.segments.len(), 1);
        assert!(record.segments[0].truncated);
        assert_eq!(record.segments[0].case_number, 1);
        assert_eq!(record.not_transmitted, vec![2, 3]);
        assert_eq!(record.silent_cases().count(), 0);
        assert!(record.failure.is_some());
        let log = log.lock().unwrap();
        assert_eq!(log.sent.len(), 1);
        assert_eq!(log.connect_attempts, 2);
        assert_eq!(
            std::fs::read_to_string(&record.log.path).unwrap(),
            "START\nfrom_values: processing\n"
        );
    }

    #[test]
    fn single_timeout_reconnects_once_without_resending() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![],
            vec![
                Reply::Timeout,
                Reply::Output("START\nok\nEND\n".to_string()),
                Reply::Output("START\nok\nEND\n".to_string()),
            ],
        );
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &CancelToken::new())
            .unwrap();

        assert_eq!(record.status, RoundStatus::Completed);
        assert_eq!(record.reconnects, 1);
        let log = log.lock().unwrap();
        assert_eq!(log.connect_attempts, 2);
        assert_eq!(log.sent.len(), 3);
        assert_eq!(record.session_lost, vec![1]);
        assert_eq!(
            record.segments.iter().map(|s| s.case_number).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(record.is_consistent());
    }

    #[test]
    fn case_whose_send_failed_takes_no_segment() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![],
            vec![
                Reply::Output("START\nran case 1\nEND\n".to_string()),
                Reply::Output("START\nran case 3\nEND\n".to_string()),
            ],
        )
        .failing_send(2);
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &CancelToken::new())
            .unwrap();

        assert_eq!(record.status, RoundStatus::Completed);
        assert_eq!(record.reconnects, 1);
        assert_eq!(record.not_transmitted, vec![2]);
        assert!(record.session_lost.is_empty());
        assert_eq!(
            record
                .segments
                .iter()
                .map(|s| (s.case_number, s.excerpt.trim()))
                .collect::<Vec<_>>(),
            vec![(1, "ran case 1"), (3, "ran case 3")]
        );
        assert_eq!(
            record.verdicts.iter().map(|v| v.case_number).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert!(record.is_consistent());
        let log = log.lock().unwrap();
        assert_eq!(log.send_attempts, 3);
        assert_eq!(log.sent.len(), 2);
    }

    #[test]
    fn device_that_never_settles_is_unresponsive() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![],
            vec![Reply::Flood("START\nreboot loop\n".to_string())],
        );
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &CancelToken::new())
            .unwrap();

        assert_eq!(record.status, RoundStatus::DeviceUnresponsive);
        assert!(record.failure.unwrap().contains("did not settle"));
        assert_eq!(record.reconnects, 0);
        assert_eq!(record.not_transmitted, vec![2, 3]);
        assert_eq!(record.segments.len(), 1);
        assert!(record.segments[0].truncated);
        assert_eq!(log.lock().unwrap().sent.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&record.log.path).unwrap(),
            "START\nreboot loop\n"
        );
    }

    #[test]
    fn second_timeout_is_unresponsive_without_another_reconnect() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(vec![], vec![Reply::Timeout, Reply::Timeout]);
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &CancelToken::new())
            .unwrap();

        assert_eq!(record.status, RoundStatus::DeviceUnresponsive);
        assert_eq!(record.reconnects, 1);
        let log = log.lock().unwrap();
        assert_eq!(log.connect_attempts, 2);
        assert_eq!(log.sent.len(), 2);
        assert_eq!(record.session_lost, vec![1, 2]);
        assert_eq!(record.not_transmitted, vec![3]);
        assert!(record.segments.is_empty());
    }

    #[test]
    fn failed_initial_connect_spends_the_reconnect() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![false],
            vec![Reply::Output("START\nok\nEND\n".to_string()), Reply::Timeout],
        );
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &CancelToken::new())
            .unwrap();

        assert_eq!(record.reconnects, 1);
        assert_eq!(record.status, RoundStatus::DeviceUnresponsive);
        assert_eq!(record.segments.len(), 1);
    }

    #[test]
    fn segment_overrun_fails_the_round_loudly() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![],
            vec![Reply::Output("START\na\nEND\nSTART\nb\nEND\n".to_string())],
        );
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let record = orchestrator
            .run_round(
                CTX,
                &mut FixedGenerator(vec![case(1, "f(0)")]),
                &[],
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(record.status, RoundStatus::SegmentationFailed);
        assert!(record.segments.is_empty());
        assert!(record.verdicts.is_empty());
        assert!(record.failure.unwrap().contains("2 segments for 1"));
    }

    #[test]
    fn analyzer_failing_everywhere_demotes_the_round() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(
            vec![],
            vec![
                Reply::Output("START\na\nEND\n".to_string()),
                Reply::Output("START\nb\nEND\n".to_string()),
            ],
        );
        let mut orchestrator = orchestrator(dir.path(), channel, Box::new(FailingAnalyzer));

        let record = orchestrator
            .run_round(
                CTX,
                &mut FixedGenerator(vec![case(1, "f(0)"), case(2, "f(1)")]),
                &[],
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(record.status, RoundStatus::PartiallyFailed);
        assert_eq!(orchestrator.state(), RoundState::PartiallyFailed);
        assert!(record.verdicts.iter().all(|v| v.verdict == Verdict::Unknown));
        assert!(record.verdicts.iter().all(|v| v.analysis_error.is_some()));
    }

    #[test]
    fn generator_is_retried_then_fails_the_round() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(vec![], vec![]);
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());

        let mut flaky = FlakyGenerator {
            failures: 1,
            calls: 0,
            batch: vec![case(1, "f(0)")],
        };
        let record = orchestrator
            .run_round(CTX, &mut flaky, &[], &CancelToken::new())
            .unwrap();
        assert_eq!(flaky.calls, 2);
        assert_eq!(record.cases.len(), 1);

        let mut broken = FlakyGenerator {
            failures: u32::MAX,
            calls: 0,
            batch: vec![],
        };
        let err = orchestrator
            .run_round(
                RoundContext { round: 1, ..CTX },
                &mut broken,
                &[],
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RoundError::Generation { round: 1, .. }));
        assert_eq!(broken.calls, 2);
        assert_eq!(log.lock().unwrap().connect_attempts, 1);
        assert!(!crate::store::round_log_path(dir.path(), CTX.api, CTX.function, 1).exists());
    }

    #[test]
    fn invalid_generated_batch_is_rejected() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(vec![], vec![]);
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());
        let err = orchestrator
            .run_round(
                CTX,
                &mut FixedGenerator(vec![case(2, "f(0)"), case(1, "f(1)")]),
                &[],
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RoundError::Generation { .. }));
    }

    #[test]
    fn cancellation_keeps_the_partial_log() {
        let dir = tempdir().unwrap();
        let channel = ScriptedChannel::new(vec![], vec![]);
        let log = channel.log();
        let mut orchestrator = orchestrator(dir.path(), channel, pattern());
        let cancel = CancelToken::new();
        cancel.cancel();

        let record = orchestrator
            .run_round(CTX, &mut FixedGenerator(bind_cases()), &[], &cancel)
            .unwrap();

        assert_eq!(record.status, RoundStatus::Cancelled);
        assert!(record.verdicts.is_empty());
        assert!(record.log.path.exists());
        assert!(log.lock().unwrap().sent.is_empty());
        assert_eq!(log.lock().unwrap().closes, 1);
    }
}
