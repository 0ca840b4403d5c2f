//! Backend registry
//!
//! Maps a configured backend identifier to its constructor. The set of
//! backends is closed; an unknown identifier fails configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use types::errors::ConfigError;

use crate::clickhouse::ClickHouseRepository;
use crate::journal::JournalRepository;
use crate::memory::MemoryRepository;
use crate::repository::{Repository, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    ClickHouse,
    Journal,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::ClickHouse => "clickhouse",
            BackendKind::Journal => "journal",
            BackendKind::Memory => "memory",
        }
    }

    pub fn all() -> &'static [BackendKind] {
        &[BackendKind::ClickHouse, BackendKind::Journal, BackendKind::Memory]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        BackendKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownBackend(s.to_string()))
    }
}

/// One storage descriptor.
///
/// `url` is the HTTP endpoint for `clickhouse` and the directory for
/// `journal`; `memory` ignores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            kind: BackendKind::Memory,
            url: String::new(),
            user: String::new(),
            password: String::new(),
        }
    }
}

type Constructor = fn(&StorageConfig) -> Result<Arc<dyn Repository>, StorageError>;

fn open_clickhouse(config: &StorageConfig) -> Result<Arc<dyn Repository>, StorageError> {
    Ok(Arc::new(ClickHouseRepository::new(
        &config.url,
        &config.user,
        &config.password,
    )?))
}

fn open_journal(config: &StorageConfig) -> Result<Arc<dyn Repository>, StorageError> {
    Ok(Arc::new(JournalRepository::open(Path::new(&config.url))?))
}

fn open_memory(_config: &StorageConfig) -> Result<Arc<dyn Repository>, StorageError> {
    Ok(Arc::new(MemoryRepository::new()))
}

fn constructor(kind: BackendKind) -> Constructor {
    match kind {
        BackendKind::ClickHouse => open_clickhouse,
        BackendKind::Journal => open_journal,
        BackendKind::Memory => open_memory,
    }
}

/// Build the backend a descriptor names.
pub fn open_repository(config: &StorageConfig) -> Result<Arc<dyn Repository>, StorageError> {
    let repository = constructor(config.kind)(config)?;
    info!(backend = %config.kind, url = %config.url, "Opened storage backend");
    Ok(repository)
}
