pub mod analyzer;
pub mod announce;
pub mod campaign;
pub mod cancel;
pub mod channel;
pub mod collector;
pub mod command;
pub mod config;
pub mod extractor;
pub mod findings;
pub mod generator;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod store;
pub mod testcase;

pub use analyzer::{AnalysisError, Analyzer, CommandAnalyzer, PatternAnalyzer, Verdict};
pub use announce::PortAnnouncer;
pub use campaign::{BatchProcessor, CampaignError, CampaignLimits, CampaignOutcome, CampaignReport};
pub use cancel::CancelToken;
pub use channel::{Channel, ChannelError, Endpoint, IdleWindow, TcpChannel};
pub use collector::{CaptureError, LogArtifact, LogCollector};
pub use config::EdgefuzzConfig;
pub use extractor::{BoundaryMarkers, CaseExtractor, Segment, SegmentError};
pub use findings::{Finding, FindingsLedger};
pub use generator::{
    CaseFileGenerator, CommandGenerator, GenerationError, GenerationRequest, Generator,
    MutationGenerator,
};
pub use orchestrator::{RoundContext, RoundError, RoundOrchestrator, RoundSettings};
pub use record::{RoundRecord, RoundState, RoundStatus};
pub use retry::RetryPolicy;
pub use store::{CampaignStore, StoreError};
pub use testcase::{CaseFileError, TestCase};
