use std::collections::BTreeSet;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use persistence::{BackendKind, StorageConfig};
use serde::Deserialize;
use types::errors::ConfigError;
use types::instrument::{Instrument, Source, parse_instrument_spec};
use types::timeframe::parse_timeframe_ms;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 1500;
const DEFAULT_REPOSITORY_URL: &str = "http://localhost:8123";
const DEFAULT_REPOSITORY_USER: &str = "default";

/// One configured instrument before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstrumentSpec {
    /// `NAME@SOURCE`
    pub instrument: String,
    /// Timeframe tokens (`1s`, `5m`, ...)
    pub timeframes: Vec<String>,
}

/// JSON document accepted through `CONFIG_FILE`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub instruments: Vec<InstrumentSpec>,
    #[serde(default)]
    pub storage: Vec<StorageConfig>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_flush_timeout_ms() -> u64 {
    DEFAULT_FLUSH_TIMEOUT_MS
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub instruments: Vec<Arc<Instrument>>,
    pub storage: Vec<StorageConfig>,
    pub buffer_size: usize,
    pub http_port: u16,
    pub flush_timeout: Duration,
}

/// Environment key holding the timeframes of one instrument.
pub fn timeframe_key(name: &str, source: Source) -> String {
    format!("PS_TIMEFRAME_{}_{}", name.to_ascii_uppercase(), source)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match non_empty(lookup(key)) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from a key lookup. `CONFIG_FILE`, when present, replaces every
    /// other key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(path) = non_empty(lookup("CONFIG_FILE")) {
            return Self::from_file(Path::new(&path));
        }

        let list = non_empty(lookup("PS_INSTRUMENTS"))
            .ok_or_else(|| ConfigError::Missing("PS_INSTRUMENTS".to_string()))?;
        let mut instruments = Vec::new();
        for spec in split_list(&list) {
            let (name, source) = parse_instrument_spec(&spec)?;
            let tokens = non_empty(lookup(&timeframe_key(&name, source)))
                .ok_or_else(|| ConfigError::NoTimeframes(spec.clone()))?;
            instruments.push(InstrumentSpec {
                instrument: spec,
                timeframes: split_list(&tokens),
            });
        }

        let kind = match non_empty(lookup("PS_REPOSITORY_TYPE")) {
            Some(value) => value.parse::<BackendKind>()?,
            None => BackendKind::ClickHouse,
        };
        let storage = StorageConfig {
            kind,
            url: non_empty(lookup("PS_REPOSITORY_URL"))
                .unwrap_or_else(|| DEFAULT_REPOSITORY_URL.to_string()),
            user: non_empty(lookup("PS_REPOSITORY_USER"))
                .unwrap_or_else(|| DEFAULT_REPOSITORY_USER.to_string()),
            password: lookup("PS_REPOSITORY_PASSWORD").unwrap_or_default(),
        };

        Self::validate(FileConfig {
            instruments,
            storage: vec![storage],
            buffer_size: parse_number(&lookup, "PS_BUFFER_SIZE", DEFAULT_BUFFER_SIZE)?,
            http_port: parse_number(&lookup, "PS_HTTP_PORT", DEFAULT_HTTP_PORT)?,
            flush_timeout_ms: parse_number(
                &lookup,
                "PS_FLUSH_TIMEOUT_MS",
                DEFAULT_FLUSH_TIMEOUT_MS,
            )?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let file: FileConfig = serde_json::from_str(&text).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::validate(file)
    }

    pub fn validate(file: FileConfig) -> Result<Self, ConfigError> {
        if file.instruments.is_empty() {
            return Err(ConfigError::Missing("instruments".to_string()));
        }
        if file.storage.is_empty() {
            return Err(ConfigError::Missing("storage".to_string()));
        }
        if file.buffer_size == 0 || !file.buffer_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                key: "buffer_size".to_string(),
                value: file.buffer_size.to_string(),
            });
        }
        if file.flush_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "flush_timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        let mut instruments = Vec::with_capacity(file.instruments.len());
        for spec in &file.instruments {
            let (name, source) = parse_instrument_spec(&spec.instrument)?;
            let full_name = format!("{name}@{source}");
            if !seen.insert(full_name.clone()) {
                return Err(ConfigError::DuplicateInstrument(full_name));
            }
            if spec.timeframes.is_empty() {
                return Err(ConfigError::NoTimeframes(full_name));
            }

            let mut timeframes: Vec<u64> = Vec::with_capacity(spec.timeframes.len());
            for token in &spec.timeframes {
                let ms = parse_timeframe_ms(token).map_err(|source| ConfigError::Timeframe {
                    instrument: full_name.clone(),
                    source,
                })?;
                if !timeframes.contains(&ms) {
                    timeframes.push(ms);
                }
            }
            instruments.push(Arc::new(Instrument::new(name, source, timeframes)));
        }

        Ok(Self {
            instruments,
            storage: file.storage,
            buffer_size: file.buffer_size,
            http_port: file.http_port,
            flush_timeout: Duration::from_millis(file.flush_timeout_ms),
        })
    }
}
