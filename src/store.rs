//! Flat-JSON config store: providers, groups, access keys and aggregate
//! provider stats, each one document mapping id to record.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire shape a provider (or group) speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Openai,
    Anthropic,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Openai => write!(f, "openai"),
            Protocol::Anthropic => write!(f, "anthropic"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_model: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub providers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessKey {
    pub id: String,
    pub name: String,
    pub token: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    #[serde(default)]
    pub failures: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("write config failed: {0}")]
    Write(std::io::Error),
}

const PROVIDERS_FILE: &str = "providers.json";
const GROUPS_FILE: &str = "groups.json";
const KEYS_FILE: &str = "keys.json";
const STATS_FILE: &str = "stats.json";

/// Reads and replaces the four JSON documents under one config dir.
/// Documents are re-read from disk on each access; saves replace the
/// file through a temp-file rename.
#[derive(Debug)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StoreError::Write)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn providers(&self) -> Result<BTreeMap<String, ProviderConfig>, StoreError> {
        self.load(PROVIDERS_FILE)
    }

    pub fn save_providers(
        &self,
        providers: &BTreeMap<String, ProviderConfig>,
    ) -> Result<(), StoreError> {
        self.save(PROVIDERS_FILE, providers)
    }

    pub fn groups(&self) -> Result<BTreeMap<String, GroupConfig>, StoreError> {
        self.load(GROUPS_FILE)
    }

    pub fn save_groups(&self, groups: &BTreeMap<String, GroupConfig>) -> Result<(), StoreError> {
        self.save(GROUPS_FILE, groups)
    }

    pub fn keys(&self) -> Result<BTreeMap<String, AccessKey>, StoreError> {
        self.load(KEYS_FILE)
    }

    pub fn save_keys(&self, keys: &BTreeMap<String, AccessKey>) -> Result<(), StoreError> {
        self.save(KEYS_FILE, keys)
    }

    pub fn stats(&self) -> Result<BTreeMap<String, ProviderStats>, StoreError> {
        self.load(STATS_FILE)
    }

    /// Bumps a provider's lifetime failure counter. Read-modify-write;
    /// concurrent bumps may lose updates, which is tolerated for this
    /// advisory counter.
    pub fn record_failure(&self, provider: &str) -> Result<(), StoreError> {
        let mut stats = self.stats()?;
        stats.entry(provider.to_string()).or_default().failures += 1;
        self.save(STATS_FILE, &stats)
    }

    fn load<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T, StoreError> {
        let path = self.dir.join(file);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(err) => return Err(StoreError::Read(err)),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    fn save<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let path = self.dir.join(file);
        let payload = serde_json::to_vec_pretty(value)?;
        let tmp_path = path.with_extension("tmp");

        if fs::write(&tmp_path, &payload).is_err() {
            fs::write(&path, &payload).map_err(StoreError::Write)?;
            return Ok(());
        }

        match fs::rename(&tmp_path, &path) {
            Ok(()) => Ok(()),
            Err(_) => {
                fs::write(&path, &payload).map_err(StoreError::Write)?;
                let _ = fs::remove_file(&tmp_path);
                Ok(())
            }
        }
    }
}
