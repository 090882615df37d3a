use crate::store::path_key;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ChannelSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Hard cap on one receive, for devices that never stop printing.
    #[serde(default = "default_max_capture_ms")]
    pub max_capture_ms: u64,
    /// Listen address for the port announcement handshake. When set, the
    /// device-side app connects here and announces the port to fuzz, which
    /// replaces `port`.
    #[serde(default)]
    pub announce: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_idle_timeout_ms() -> u64 {
    30_000
}
fn default_quiet_period_ms() -> u64 {
    2_000
}
fn default_max_reconnects() -> u32 {
    1
}
fn default_max_capture_ms() -> u64 {
    120_000
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            quiet_period_ms: default_quiet_period_ms(),
            max_reconnects: default_max_reconnects(),
            max_capture_ms: default_max_capture_ms(),
            announce: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MarkerSettings {
    #[serde(default = "default_start_marker")]
    pub start: String,
    #[serde(default = "default_end_marker")]
    pub end: String,
}

fn default_start_marker() -> String {
    "START".to_string()
}
fn default_end_marker() -> String {
    "END".to_string()
}

impl Default for MarkerSettings {
    fn default() -> Self {
        Self {
            start: default_start_marker(),
            end: default_end_marker(),
        }
    }
}

/// Where each round's test cases come from.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CaseSourcing {
    /// Ask the configured generator for a batch seeded with the full round history.
    #[default]
    Refinement,
    /// Replay a pre-authored case file. `template` may contain `{api}`,
    /// `{function}` and `{round}` placeholders.
    CaseFuzzing { template: String },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    #[serde(default = "default_total_rounds")]
    pub total_rounds: u32,
    #[serde(default)]
    pub starting_round: u32,
    #[serde(default = "default_max_consecutive_unresponsive")]
    pub max_consecutive_unresponsive: u32,
    #[serde(default = "default_max_generation_failures")]
    pub max_generation_failures: u32,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub mode: CaseSourcing,
}

pub fn default_total_rounds() -> u32 {
    3
}
fn default_max_consecutive_unresponsive() -> u32 {
    2
}
fn default_max_generation_failures() -> u32 {
    3
}
pub fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("./edgefuzz_artifacts")
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            total_rounds: default_total_rounds(),
            starting_round: 0,
            max_consecutive_unresponsive: default_max_consecutive_unresponsive(),
            max_generation_failures: default_max_generation_failures(),
            artifacts_dir: default_artifacts_dir(),
            mode: CaseSourcing::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_round_budget_ms")]
    pub round_budget_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_round_budget_ms() -> u64 {
    120_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
            round_budget_ms: default_round_budget_ms(),
        }
    }
}

/// An external program used as a generator or analyzer.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CommandSettings {
    pub command: Vec<String>,
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_command_timeout_ms() -> u64 {
    60_000
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct MutationSettings {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_max_cases")]
    pub max_cases: usize,
}

fn default_max_cases() -> usize {
    10
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            max_cases: default_max_cases(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GeneratorSettings {
    Mutation(MutationSettings),
    Command(CommandSettings),
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        GeneratorSettings::Mutation(MutationSettings::default())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PatternSettings {
    #[serde(default)]
    pub extra_crash_patterns: Vec<String>,
    #[serde(default)]
    pub extra_anomaly_patterns: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AnalyzerSettings {
    Pattern(PatternSettings),
    Command(CommandSettings),
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        AnalyzerSettings::Pattern(PatternSettings::default())
    }
}

/// One API and the functions of it that should be fuzzed.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub api: String,
    pub functions: Vec<String>,
}

fn default_targets() -> Vec<TargetSettings> {
    vec![TargetSettings {
        api: "zdo/mgmt_bind_request".to_string(),
        functions: vec!["from_values()".to_string()],
    }]
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EdgefuzzConfig {
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub markers: MarkerSettings,
    #[serde(default)]
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub analyzer: AnalyzerSettings,
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetSettings>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl EdgefuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, anyhow::Error> {
        let config: EdgefuzzConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Rejects combinations that would make a campaign meaningless or unsafe.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.targets.is_empty() {
            anyhow::bail!("At least one [[targets]] entry is required");
        }
        let mut keys: HashMap<(String, String), (&str, &str)> = HashMap::new();
        for target in &self.targets {
            if target.api.trim().is_empty() {
                anyhow::bail!("Target with an empty API name");
            }
            if target.functions.is_empty() {
                anyhow::bail!("Target {:?} lists no functions", target.api);
            }
            for function in &target.functions {
                let key = (path_key(&target.api), path_key(function));
                match keys.insert(key, (target.api.as_str(), function.as_str())) {
                    Some(previous) if previous != (target.api.as_str(), function.as_str()) => {
                        anyhow::bail!(
                            "Targets {:?} {:?} and {:?} {:?} would share one artifact directory",
                            previous.0,
                            previous.1,
                            target.api,
                            function
                        );
                    }
                    _ => {}
                }
            }
        }
        if self.campaign.total_rounds == 0 {
            anyhow::bail!("campaign.total-rounds must be at least 1");
        }
        if self.campaign.max_consecutive_unresponsive == 0 {
            anyhow::bail!("campaign.max-consecutive-unresponsive must be at least 1");
        }
        if self.markers.start.is_empty() || self.markers.end.is_empty() {
            anyhow::bail!("Boundary markers must not be empty");
        }
        if self.markers.start == self.markers.end {
            anyhow::bail!(
                "Start and end markers must differ (both are {:?})",
                self.markers.start
            );
        }
        if self.channel.max_capture_ms <= self.channel.quiet_period_ms {
            anyhow::bail!(
                "channel.max-capture-ms ({}) must be longer than channel.quiet-period-ms ({})",
                self.channel.max_capture_ms,
                self.channel.quiet_period_ms
            );
        }
        if self
            .channel
            .announce
            .as_deref()
            .is_some_and(|address| address.trim().is_empty())
        {
            anyhow::bail!("channel.announce must be a listen address such as \"0.0.0.0:8888\"");
        }
        if self.channel.quiet_period_ms >= self.channel.idle_timeout_ms {
            anyhow::bail!(
                "channel.quiet-period-ms ({}) must be shorter than channel.idle-timeout-ms ({})",
                self.channel.quiet_period_ms,
                self.channel.idle_timeout_ms
            );
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max-attempts must be at least 1");
        }
        for settings in [self.generator_command(), self.analyzer_command()]
            .into_iter()
            .flatten()
        {
            if settings.command.is_empty() {
                anyhow::bail!("Command collaborator configured with an empty command");
            }
        }
        Ok(())
    }

    fn generator_command(&self) -> Option<&CommandSettings> {
        match &self.generator {
            GeneratorSettings::Command(settings) => Some(settings),
            GeneratorSettings::Mutation(_) => None,
        }
    }

    fn analyzer_command(&self) -> Option<&CommandSettings> {
        match &self.analyzer {
            AnalyzerSettings::Command(settings) => Some(settings),
            AnalyzerSettings::Pattern(_) => None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.channel.connect_timeout_ms)
    }
}

impl Default for EdgefuzzConfig {
    fn default() -> Self {
        Self {
            channel: ChannelSettings::default(),
            markers: MarkerSettings::default(),
            campaign: CampaignSettings::default(),
            retry: RetrySettings::default(),
            generator: GeneratorSettings::default(),
            analyzer: AnalyzerSettings::default(),
            targets: default_targets(),
            logging: LoggingSettings::default(),
        }
    }
}
