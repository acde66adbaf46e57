use crate::error::{Result, SessionsError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// `poll_active_sessions` is a long-poll and gets its own, longer limit.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_registry_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_poll_timeout_secs() -> u64 {
    600
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            timeout_secs: default_timeout_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// PollConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Period of the active-session refresh sweep.
    #[serde(default = "default_sixty")]
    pub refresh_interval_secs: u64,
    /// Pause after a failed sweep before the whole sweep is retried.
    #[serde(default = "default_sixty")]
    pub retry_cooldown_secs: u64,
    /// Pause after a poll that returned no sessions.
    #[serde(default = "default_idle_pause_secs")]
    pub idle_pause_secs: u64,
}

fn default_idle_pause_secs() -> u64 {
    5
}

fn default_sixty() -> u64 {
    60
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_sixty(),
            retry_cooldown_secs: default_sixty(),
            idle_pause_secs: default_idle_pause_secs(),
        }
    }
}

impl PollConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_secs(self.idle_pause_secs)
    }
}

// ---------------------------------------------------------------------------
// OffloadConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Files modified more recently than this are left alone.
    #[serde(default = "default_sixty")]
    pub quiet_window_secs: u64,
    /// Push the session after this many moved files.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

fn default_flush_every() -> usize {
    10
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quiet_window_secs: default_sixty(),
            flush_every: default_flush_every(),
        }
    }
}

impl OffloadConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_secs(self.quiet_window_secs)
    }
}

// ---------------------------------------------------------------------------
// OtfConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtfConfig {
    /// A created workspace is launched once more movies than this are present.
    #[serde(default = "default_launch_min_movies")]
    pub launch_min_movies: u64,
    /// Raw data and workspaces quiet for this long count as stale.
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,
}

fn default_launch_min_movies() -> u64 {
    16
}

fn default_stale_after_hours() -> u64 {
    24
}

impl Default for OtfConfig {
    fn default() -> Self {
        Self {
            launch_min_movies: default_launch_min_movies(),
            stale_after_hours: default_stale_after_hours(),
        }
    }
}

impl OtfConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_after_hours as i64)
    }
}

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

/// Local configuration of the daemon, passed explicitly to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub offload: OffloadConfig,
    #[serde(default)]
    pub otf: OtfConfig,
}

impl DaemonConfig {
    /// Load from a YAML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let data = std::fs::read_to_string(p)?;
                Ok(serde_yaml::from_str(&data)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn data_root(&self) -> Result<&Path> {
        match self.data_root.as_deref() {
            Some(p) if !p.as_os_str().is_empty() => Ok(p),
            _ => Err(SessionsError::DataRootNotConfigured),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionsConfig (remote `sessions` section)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSection {
    /// Glob for the gain reference, may contain `{microscope}`.
    #[serde(default)]
    pub gain: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelionSection {
    #[serde(default)]
    pub common: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtfSection {
    #[serde(default)]
    pub command: HashMap<String, String>,
    #[serde(default)]
    pub relion: RelionSection,
}

/// The `sessions` configuration section served by the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub acquisition: HashMap<String, BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub otf: OtfSection,
}

impl SessionsConfig {
    /// Acquisition parameters of one instrument, rendered as text.
    pub fn acquisition_for(&self, microscope: &str) -> Result<BTreeMap<String, String>> {
        let acq = self
            .acquisition
            .get(microscope)
            .ok_or_else(|| SessionsError::MissingConfig(format!("acquisition.{microscope}")))?;
        Ok(acq
            .iter()
            .map(|(k, v)| (k.clone(), value_text(v)))
            .collect())
    }

    /// Key/template pairs for the processing options dump.
    pub fn relion_options(&self) -> Vec<(&str, String)> {
        self.otf
            .relion
            .common
            .iter()
            .map(|(k, v)| (k.as_str(), value_text(v)))
            .collect()
    }

    pub fn command_for(&self, microscope: &str) -> Result<&str> {
        self.otf
            .command
            .get(microscope)
            .map(String::as_str)
            .ok_or_else(|| SessionsError::MissingConfig(format!("otf.command.{microscope}")))
    }
}

/// Plain text of a JSON scalar; strings lose their quotes.
pub fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
