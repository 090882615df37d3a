use crate::campaign::CampaignOutcome;
use crate::record::RoundRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors raised while persisting or reloading campaign history.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An I/O error occurred while touching the artifact tree.
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A record or checkpoint could not be encoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// A persisted file exists but cannot be decoded.
    #[error("Corrupt store file {path:?}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Two pairs reduce to the same artifact directory.
    #[error("{path:?} belongs to {owner}, not to {requested}")]
    KeyCollision {
        path: PathBuf,
        owner: String,
        requested: String,
    },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(format!("JSON operation error: {}", err))
    }
}

/// Reduces an API or function name to a single path component.
///
/// Path separators become `-`, parentheses are dropped, and anything else that
/// is awkward in a file name becomes `_`. `zdo/mgmt_bind_request` maps to
/// `zdo-mgmt_bind_request` and `from_values()` maps to `from_values`.
pub fn path_key(name: &str) -> String {
    let key: String = name
        .trim()
        .chars()
        .filter(|c| !matches!(c, '(' | ')'))
        .map(|c| match c {
            '/' | '\\' => '-',
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        })
        .collect();
    let key = key.trim_matches('.').to_string();
    if key.is_empty() { "_".to_string() } else { key }
}

/// Directory holding every artifact of one `(api, function)` pair.
pub fn pair_dir(root: &Path, api: &str, function: &str) -> PathBuf {
    root.join(path_key(api)).join(path_key(function))
}

fn round_stem(round: u32) -> String {
    format!("round-{round:04}")
}

pub fn round_log_path(root: &Path, api: &str, function: &str, round: u32) -> PathBuf {
    pair_dir(root, api, function).join(format!("{}.log", round_stem(round)))
}

pub fn round_record_path(root: &Path, api: &str, function: &str, round: u32) -> PathBuf {
    pair_dir(root, api, function).join(format!("{}.json", round_stem(round)))
}

/// Per-pair progress persisted alongside the round records.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PairCheckpoint {
    pub api: String,
    pub function: String,
    pub next_round: u32,
    #[serde(default)]
    pub consecutive_unresponsive: u32,
    #[serde(default)]
    pub consecutive_generation_failures: u32,
    /// Set once the campaign for this pair has terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CampaignOutcome>,
}

/// Durable campaign history rooted at the artifacts directory.
///
/// Layout, per pair:
///
/// ```text
/// <root>/<api-key>/<function-key>/round-NNNN.log
/// <root>/<api-key>/<function-key>/round-NNNN.json
/// <root>/<api-key>/<function-key>/campaign.json
/// ```
///
/// JSON files are written to a temporary sibling and renamed into place, so a
/// reader never observes a half-written record. A cancelled round is kept as
/// `round-NNNN.cancelled.{log,json}` when it is run again.
///
/// Every loaded file is checked against the pair it was requested for, so two
/// names that share a [`path_key`] cannot read each other's history.
#[derive(Debug, Clone)]
pub struct CampaignStore {
    root: PathBuf,
}

impl CampaignStore {
    const CHECKPOINT_FILENAME: &'static str = "campaign.json";

    /// Opens the store, creating `root` if it does not exist.
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        if !root.exists() {
            fs::create_dir_all(&root).map_err(|e| {
                StoreError::Io(format!(
                    "Failed to create artifacts directory at {:?}: {}",
                    root, e
                ))
            })?;
        } else if !root.is_dir() {
            return Err(StoreError::Io(format!(
                "Artifacts path {:?} exists but is not a directory",
                root
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, api: &str, function: &str, round: u32) -> PathBuf {
        round_record_path(&self.root, api, function, round)
    }

    fn checkpoint_path(&self, api: &str, function: &str) -> PathBuf {
        pair_dir(&self.root, api, function).join(Self::CHECKPOINT_FILENAME)
    }

    /// Durably writes `record`; returns once the file is in its final place.
    pub fn save_record(&self, record: &RoundRecord) -> Result<PathBuf, StoreError> {
        let path = self.record_path(&record.api, &record.function, record.round);
        write_json_atomically(&path, record)?;
        tracing::debug!(path = %path.display(), status = %record.status, "Round record persisted");
        Ok(path)
    }

    pub fn load_record(&self, api: &str, function: &str, round: u32) -> Result<Option<RoundRecord>, StoreError> {
        read_json(&self.record_path(api, function, round))
    }

    /// Loads every persisted record of a pair, ordered by round index.
    pub fn load_records(&self, api: &str, function: &str) -> Result<Vec<RoundRecord>, StoreError> {
        let dir = pair_dir(&self.root, api, function);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut rounds = Vec::new();
        for entry_result in fs::read_dir(&dir)
            .map_err(|e| StoreError::Io(format!("Failed to read directory {:?}: {}", dir, e)))?
        {
            let entry = entry_result
                .map_err(|e| StoreError::Io(format!("Error reading entry in {:?}: {}", dir, e)))?;
            let name = entry.file_name();
            let Some(round) = name.to_str().and_then(parse_record_file_name) else {
                continue;
            };
            rounds.push(round);
        }
        rounds.sort_unstable();

        let mut records = Vec::with_capacity(rounds.len());
        for round in rounds {
            if let Some(record) = self.load_record(api, function, round)? {
                check_owner(
                    self.record_path(api, function, round),
                    (record.api.as_str(), record.function.as_str()),
                    (api, function),
                )?;
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Moves a cancelled round aside so its index can run again.
    ///
    /// The partial log becomes `round-NNNN.cancelled.log` and the record, pointing
    /// at it, `round-NNNN.cancelled.json`. A previously retired attempt of the
    /// same round is replaced.
    pub fn retire_cancelled(&self, record: &RoundRecord) -> Result<RoundRecord, StoreError> {
        let (api, function, round) = (&record.api, &record.function, record.round);
        let dir = pair_dir(&self.root, api, function);
        let stem = format!("{}.cancelled", round_stem(round));
        let mut retired = record.clone();

        let live_log = round_log_path(&self.root, api, function, round);
        if live_log.exists() {
            let kept_log = dir.join(format!("{stem}.log"));
            fs::rename(&live_log, &kept_log).map_err(|e| {
                StoreError::Io(format!("Failed to move {:?} to {:?}: {}", live_log, kept_log, e))
            })?;
            retired.log.path = kept_log;
        }
        write_json_atomically(&dir.join(format!("{stem}.json")), &retired)?;

        let live_record = self.record_path(api, function, round);
        match fs::remove_file(&live_record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::Io(format!("Failed to remove {:?}: {}", live_record, e)));
            }
        }
        tracing::info!(api, function, round, log = %retired.log.path.display(), "Cancelled round retired");
        Ok(retired)
    }

    pub fn save_checkpoint(&self, checkpoint: &PairCheckpoint) -> Result<(), StoreError> {
        let path = self.checkpoint_path(&checkpoint.api, &checkpoint.function);
        write_json_atomically(&path, checkpoint)
    }

    pub fn load_checkpoint(&self, api: &str, function: &str) -> Result<Option<PairCheckpoint>, StoreError> {
        let path = self.checkpoint_path(api, function);
        let checkpoint: Option<PairCheckpoint> = read_json(&path)?;
        if let Some(checkpoint) = &checkpoint {
            check_owner(path, (checkpoint.api.as_str(), checkpoint.function.as_str()), (api, function))?;
        }
        Ok(checkpoint)
    }
}

fn check_owner(path: PathBuf, stored: (&str, &str), requested: (&str, &str)) -> Result<(), StoreError> {
    if stored == requested {
        return Ok(());
    }
    Err(StoreError::KeyCollision {
        path,
        owner: format!("{} {}", stored.0, stored.1),
        requested: format!("{} {}", requested.0, requested.1),
    })
}

/// `round-0007.json` -> `Some(7)`.
fn parse_record_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("round-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io(format!("Path {:?} has no parent directory", path)))?;
    fs::create_dir_all(dir)
        .map_err(|e| StoreError::Io(format!("Failed to create directory {:?}: {}", dir, e)))?;

    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| StoreError::Io(format!("Failed to move record into {:?}: {}", path, e.error)))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::Io(format!("Failed to read {:?}: {}", path, e)));
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}
