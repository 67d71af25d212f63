//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." -- every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment. Three layers, later wins:
//!   1. `INGX_*` environment variables (`INGX_RUNTIME__WORKER_COUNT=8`)
//!   2. the TOML config file, if one was given
//!   3. the credentials TOML, if one was given (it only needs the `[store.*]` bits)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::ElasticsearchStoreConfig;
use crate::job::ConfigError;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// 🧵 How many workers, and how patient they are.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(alias = "threads")]
    pub worker_count: usize,
    /// Empty-queue polls before a worker calls it a day.
    pub drain_retries: usize,
    pub drain_wait_ms: u64,
    /// Connection attempts after the first one.
    pub connect_retries: usize,
    pub connect_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            drain_retries: 3,
            drain_wait_ms: 250,
            connect_retries: 3,
            connect_backoff_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn drain_wait(&self) -> Duration {
        Duration::from_millis(self.drain_wait_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }
}

/// 🗄️ Which store the run talks to. `[store.Elasticsearch]` or `store = "InMemory"`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum StoreConfig {
    // -- env keys arrive lowercased, hence the aliases
    #[serde(alias = "elasticsearch")]
    Elasticsearch(ElasticsearchStoreConfig),
    #[serde(alias = "in_memory")]
    InMemory,
}

/// 📂 When `dir` is set, documents go to files there instead of into the store.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct OutputConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// 📋 Where the job comes from. `spec_file` wins when both are set.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub id: Option<String>,
    pub spec_file: Option<PathBuf>,
    /// Free-form tag copied into the load-job record.
    pub lineage: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            id: None,
            spec_file: None,
            lineage: "ingx".to_string(),
        }
    }
}

/// 🔍 Fallbacks for ingest documents that don't say where their files live.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub input_dir: Option<PathBuf>,
    /// Glob over file names. `*` when unset.
    pub file_pattern: Option<String>,
    /// chrono strftime mask the file name must parse under.
    pub file_mask: Option<String>,
    pub first_epoch: Option<i64>,
    pub last_epoch: Option<i64>,
}

impl AppConfig {
    /// ✅ Catch the setup mistakes serde can't: half-filled credentials, zero workers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.worker_count == 0 {
            return Err(ConfigError::MissingField(
                "runtime.worker_count (at least one worker)".into(),
            ));
        }
        if let StoreConfig::Elasticsearch(es) = &self.store {
            if es.url.trim().is_empty() {
                return Err(ConfigError::MissingField("store.Elasticsearch.url".into()));
            }
            if es.index.trim().is_empty() {
                return Err(ConfigError::MissingField("store.Elasticsearch.index".into()));
            }
            if es.username.is_some() && es.password.is_none() {
                return Err(ConfigError::MissingField("store.Elasticsearch.password".into()));
            }
        }
        Ok(())
    }
}

/// 🚀 Load the config: env vars, then the config file, then the credentials file.
///
/// 📐 No file means no file. We never go looking for a default `ingx.toml` on our own.
pub fn load_config(
    config_file_name: Option<&Path>,
    credentials_file_name: Option<&Path>,
) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?} (credentials: {:#?})",
        config_file_name.unwrap_or(Path::new("")),
        credentials_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("INGX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };
    let config = match credentials_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (INGX_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (INGX_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };
    config.extract().context(context_msg)
}
