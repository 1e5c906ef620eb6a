use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cms: CmsConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,
    /// libpq connection string or URI for the network backend.
    pub connection: Option<String>,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Open the embedded store when the network backend is unreachable.
    #[serde(default)]
    pub fallback_to_embedded: bool,
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Sqlite
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/mirrorline.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection: None,
            path: default_db_path(),
            fallback_to_embedded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_call_timeout_secs() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_delay_secs: default_max_delay_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_delay: Duration::from_secs(self.max_delay_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmsConfig {
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_cms_rps")]
    pub requests_per_second: f64,
    #[serde(default = "default_credentials_prefix")]
    pub credentials_env_prefix: String,
    #[serde(default = "default_cms_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

pub const DEFAULT_CMS_RPS: f64 = 3.0;

fn default_per_page() -> u32 {
    100
}
fn default_cms_rps() -> f64 {
    DEFAULT_CMS_RPS
}
fn default_credentials_prefix() -> String {
    "CMS_SITE".to_string()
}
fn default_cms_log_dir() -> PathBuf {
    PathBuf::from("logs/cms")
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            per_page: default_per_page(),
            requests_per_second: default_cms_rps(),
            credentials_env_prefix: default_credentials_prefix(),
            log_dir: default_cms_log_dir(),
            sites: Vec::new(),
        }
    }
}

impl CmsConfig {
    /// Configured rate, with non-positive values replaced by the default.
    #[must_use]
    pub fn effective_rps(&self) -> f64 {
        if self.requests_per_second > 0.0 {
            self.requests_per_second
        } else {
            DEFAULT_CMS_RPS
        }
    }

    #[must_use]
    pub fn site(&self, site_id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    pub base_url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Safe,
    Normal,
}

impl ChannelMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Normal => "normal",
        }
    }

    /// Pacing preset for this mode.
    #[must_use]
    pub fn settings(self) -> ModeSettings {
        match self {
            Self::Safe => ModeSettings {
                batch_pause_min: Duration::from_millis(800),
                batch_pause_max: Duration::from_millis(1500),
                throttle_extra: Duration::from_secs(5),
                max_retries: 5,
            },
            Self::Normal => ModeSettings {
                batch_pause_min: Duration::from_millis(300),
                batch_pause_max: Duration::from_millis(800),
                throttle_extra: Duration::from_secs(3),
                max_retries: 3,
            },
        }
    }
}

impl std::str::FromStr for ChannelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "normal" => Ok(Self::Normal),
            other => Err(format!("unknown mode '{other}' (expected safe or normal)")),
        }
    }
}

/// Explicit pacing values handed to the message pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSettings {
    pub batch_pause_min: Duration,
    pub batch_pause_max: Duration,
    pub throttle_extra: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub mode: ChannelMode,
    #[serde(default = "default_channel_rps")]
    pub requests_per_second: f64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_session_file() -> PathBuf {
    PathBuf::from("mirrorline.session")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("exports")
}
fn default_channel_rps() -> f64 {
    1.0
}
fn default_page_size() -> u32 {
    100
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            session_file: default_session_file(),
            output_dir: default_output_dir(),
            mode: ChannelMode::default(),
            requests_per_second: default_channel_rps(),
            page_size: default_page_size(),
        }
    }
}
