use edgefuzz_core::analyzer::{Analyzer, CommandAnalyzer, PatternAnalyzer};
use edgefuzz_core::announce::PortAnnouncer;
use edgefuzz_core::campaign::{BatchProcessor, CampaignLimits, CampaignOutcome, CampaignReport};
use edgefuzz_core::cancel::CancelToken;
use edgefuzz_core::channel::{Endpoint, TcpChannel};
use edgefuzz_core::collector::LogCollector;
use edgefuzz_core::config::{
    AnalyzerSettings, CaseSourcing, EdgefuzzConfig, GeneratorSettings, TargetSettings,
};
use edgefuzz_core::extractor::{BoundaryMarkers, CaseExtractor};
use edgefuzz_core::generator::{CommandGenerator, Generator, MutationGenerator};
use edgefuzz_core::orchestrator::{RoundOrchestrator, RoundSettings};
use edgefuzz_core::store::CampaignStore;

use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Multi-round fuzz campaigns against a device API endpoint", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Device host, overrides `channel.host`.
    #[clap(long)]
    host: Option<String>,
    #[clap(short, long)]
    port: Option<u16>,
    /// Rounds per (api, function) pair.
    #[clap(short, long)]
    rounds: Option<u32>,
    /// Replay a case file instead of asking the generator. May contain
    /// `{api}`, `{function}` and `{round}` placeholders.
    #[clap(long)]
    case_file: Option<String>,
    /// Fuzz a single API, replacing the configured targets. Needs `--function`.
    #[clap(long, requires = "function")]
    api: Option<String>,
    #[clap(long, requires = "api")]
    function: Option<String>,
    #[clap(long, value_parser)]
    artifacts_dir: Option<PathBuf>,
    #[clap(long)]
    log_level: Option<String>,
    /// Stop cleanly after this many seconds; a later run resumes.
    #[clap(long)]
    max_duration_secs: Option<u64>,
}

fn load_config(cli: &Cli) -> Result<EdgefuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => EdgefuzzConfig::load_from_file(config_path)?,
        None => {
            let default_config_path = PathBuf::from("edgefuzz.toml");
            if default_config_path.exists() {
                EdgefuzzConfig::load_from_file(&default_config_path)?
            } else {
                EdgefuzzConfig::default()
            }
        }
    };

    if let Some(host) = &cli.host {
        config.channel.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.channel.port = port;
    }
    if let Some(rounds) = cli.rounds {
        config.campaign.total_rounds = rounds;
    }
    if let Some(template) = &cli.case_file {
        config.campaign.mode = CaseSourcing::CaseFuzzing {
            template: template.clone(),
        };
    }
    if let (Some(api), Some(function)) = (&cli.api, &cli.function) {
        config.targets = vec![TargetSettings {
            api: api.clone(),
            functions: vec![function.clone()],
        }];
    }
    if let Some(dir) = &cli.artifacts_dir {
        config.campaign.artifacts_dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_generator(config: &EdgefuzzConfig) -> Box<dyn Generator> {
    match &config.generator {
        GeneratorSettings::Mutation(settings) => Box::new(MutationGenerator::new(
            settings,
            ChaCha8Rng::seed_from_u64(settings.seed),
        )),
        GeneratorSettings::Command(settings) => Box::new(CommandGenerator::new(settings.clone())),
    }
}

fn build_analyzer(config: &EdgefuzzConfig) -> Result<Box<dyn Analyzer>, anyhow::Error> {
    Ok(match &config.analyzer {
        AnalyzerSettings::Pattern(settings) => Box::new(PatternAnalyzer::new(settings)?),
        AnalyzerSettings::Command(settings) => Box::new(CommandAnalyzer::new(settings.clone())),
    })
}

fn exit_code(reports: &[CampaignReport]) -> ExitCode {
    let worst = reports
        .iter()
        .map(|report| match report.outcome {
            CampaignOutcome::Completed | CampaignOutcome::Cancelled => 0,
            CampaignOutcome::DeviceUnresponsive => 2,
            CampaignOutcome::GenerationExhausted => 3,
            CampaignOutcome::SegmentationBroken => 4,
        })
        .max()
        .unwrap_or(0);
    ExitCode::from(worst)
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging.level);
    tracing::debug!(?config, "Effective configuration");

    let cancel = CancelToken::new();
    if let Some(secs) = cli.max_duration_secs {
        // Detached; the process exits regardless.
        let _ = cancel.cancel_after(Duration::from_secs(secs));
    }

    let port = match &config.channel.announce {
        Some(listen) => match PortAnnouncer::bind(listen)?.wait(&cancel)? {
            Some(port) => port,
            None => {
                tracing::warn!("Cancelled while waiting for the port announcement");
                return Ok(ExitCode::SUCCESS);
            }
        },
        None => config.channel.port,
    };
    let endpoint = Endpoint::new(config.channel.host.clone(), port);
    let orchestrator = RoundOrchestrator::new(
        Box::new(TcpChannel::new(config.connect_timeout())),
        endpoint.clone(),
        LogCollector::new(config.campaign.artifacts_dir.clone()),
        CaseExtractor::new(BoundaryMarkers::from(&config.markers)),
        build_analyzer(&config)?,
        RoundSettings::from(&config),
        Box::new(ChaCha8Rng::from_seed([0u8; 32])),
    );
    let store = CampaignStore::new(config.campaign.artifacts_dir.clone())?;
    let mut processor = BatchProcessor::new(
        orchestrator,
        store,
        build_generator(&config),
        config.campaign.mode.clone(),
        CampaignLimits::from(&config.campaign),
        cancel,
    );

    tracing::info!(
        %endpoint,
        pairs = config.targets.iter().map(|t| t.functions.len()).sum::<usize>(),
        rounds = config.campaign.total_rounds,
        artifacts = %config.campaign.artifacts_dir.display(),
        "Starting campaign"
    );
    let start_time = Instant::now();
    let reports = processor.run_targets(&config.targets, config.campaign.total_rounds)?;

    println!("\nCampaign finished in {:.2?}.", start_time.elapsed());
    for report in &reports {
        println!(
            "  {} {}: {} (next round {}, {} run now, {} distinct findings)",
            report.api,
            report.function,
            report.outcome,
            report.next_round,
            report.rounds_run,
            report.findings.len()
        );
        for finding in &report.findings {
            println!(
                "    round {} case {}: {} [{}]",
                finding.round, finding.case_number, finding.verdict, finding.digest
            );
        }
    }

    Ok(exit_code(&reports))
}
