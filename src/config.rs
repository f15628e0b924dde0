//! Configuration loading, mirroring `vrrb_config::NodeConfig::from_file`
//! (the `config` crate's builder plus `try_deserialize`), generalized from
//! TOML/JSON to the INI-style file spec.md §6 calls for. The file format's
//! own grammar is out of scope; only the section/key contract and the
//! derived `allowed_targets` computation live here.

use std::collections::BTreeSet;
use std::path::PathBuf;

use config::{Config, File, FileFormat};
use derive_builder::Builder;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file {path:?} not found")]
    Missing { path: String },
    #[error("failed to parse configuration file {path:?}: {source}")]
    Parse {
        path: String,
        #[source]
        source: config::ConfigError,
    },
    #[error("invalid boolean value {value:?} for key {key:?} (expected yes/no)")]
    InvalidBoolean { key: String, value: String },
}

/// Raw `[receiver]`/`[broadcaster]` shape, deserialized directly off the
/// `config` crate's merged view before being turned into a [`Configuration`].
#[derive(Debug, Clone, Deserialize)]
struct RawReceiver {
    hostname: Option<String>,
    log_filename: Option<String>,
    targets: String,
    targets_directory: PathBuf,
    script_to_execute: String,
    python_command: String,
    metrics_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBroadcaster {
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFile {
    receiver: RawReceiver,
    broadcaster: RawBroadcaster,
}

/// Read-only bundle consumed by the rest of the core (spec.md §3,
/// "Configuration snapshot").
#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct Configuration {
    pub hostname: String,
    pub log_filename: PathBuf,
    pub targets: Vec<String>,
    pub targets_directory: PathBuf,
    pub script_to_execute: String,
    pub interpreter_command: String,
    pub broadcaster_host: String,
    pub broadcaster_port: u16,
    pub metrics_directory: Option<PathBuf>,
    pub allowed_targets: BTreeSet<String>,
}

impl Configuration {
    pub fn from_file(config_path: &str) -> Result<Self, ConfigError> {
        if !std::path::Path::new(config_path).exists() {
            return Err(ConfigError::Missing {
                path: config_path.to_string(),
            });
        }

        let built = Config::builder()
            .add_source(File::new(config_path, FileFormat::Ini))
            .build()
            .map_err(|source| ConfigError::Parse {
                path: config_path.to_string(),
                source,
            })?;

        let raw: RawFile = built.try_deserialize().map_err(|source| ConfigError::Parse {
            path: config_path.to_string(),
            source,
        })?;

        let hostname = raw
            .receiver
            .hostname
            .unwrap_or_else(default_hostname);

        let log_filename = raw
            .receiver
            .log_filename
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/log/yadt-receiver.log"));

        let targets: Vec<String> = raw
            .receiver
            .targets
            .split(',')
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();

        let allowed_targets = compute_allowed_targets(&raw.receiver.targets_directory, &targets);

        Ok(Configuration {
            hostname,
            log_filename,
            targets,
            targets_directory: raw.receiver.targets_directory,
            script_to_execute: raw.receiver.script_to_execute,
            interpreter_command: raw.receiver.python_command,
            broadcaster_host: raw.broadcaster.host,
            broadcaster_port: raw.broadcaster.port,
            metrics_directory: raw.receiver.metrics_directory,
            allowed_targets,
        })
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// spec.md §6: glob-expand each `targets` entry under `targets_directory`
/// and take the basename of each match. Returned in a `BTreeSet` so the
/// dispatcher can subscribe in ascending lexicographic order (§4.D).
fn compute_allowed_targets(targets_directory: &PathBuf, targets: &[String]) -> BTreeSet<String> {
    let mut allowed = BTreeSet::new();
    for entry in targets {
        let pattern = targets_directory.join(entry);
        let pattern = pattern.to_string_lossy().into_owned();
        let Ok(matches) = glob::glob(&pattern) else {
            continue;
        };
        for matched in matches.flatten() {
            if let Some(name) = matched.file_name().and_then(|name| name.to_str()) {
                allowed.insert(name.to_string());
            }
        }
    }
    allowed
}

/// `yes`/`no` coercion kept for forward-compatibility with optional
/// boolean keys; no currently required key uses it.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(ConfigError::InvalidBoolean {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}
