use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::reconciler::ReconcilerConfig;
use crate::stage::{RetryPolicy, StagePolicies};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("matchflow.db")
}

/// Retry and timeout limits for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct StageLimitsConfig {
    /// Maximum wall-clock time from stage start, in seconds
    pub timeout_secs: u64,
    /// Maximum reconciliation passes before the stage is failed
    pub max_retries: u32,
}

impl StageLimitsConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.timeout_secs), self.max_retries)
    }
}

/// Per-stage limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StagesConfig {
    #[serde(default = "default_ingestion_limits")]
    pub ingestion: StageLimitsConfig,
    #[serde(default = "default_detection_limits")]
    pub detection: StageLimitsConfig,
    #[serde(default = "default_analysis_limits")]
    pub analysis: StageLimitsConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            ingestion: default_ingestion_limits(),
            detection: default_detection_limits(),
            analysis: default_analysis_limits(),
        }
    }
}

impl StagesConfig {
    pub fn policies(&self) -> StagePolicies {
        StagePolicies {
            ingestion: self.ingestion.policy(),
            detection: self.detection.policy(),
            analysis: self.analysis.policy(),
        }
    }
}

fn default_ingestion_limits() -> StageLimitsConfig {
    StageLimitsConfig {
        timeout_secs: 2 * 3600,
        max_retries: 120,
    }
}

fn default_detection_limits() -> StageLimitsConfig {
    StageLimitsConfig {
        timeout_secs: 2 * 3600,
        max_retries: 120,
    }
}

fn default_analysis_limits() -> StageLimitsConfig {
    StageLimitsConfig {
        timeout_secs: 6 * 3600,
        max_retries: 360,
    }
}

/// External stage service endpoints. A missing section disables the stage.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub ingestion: Option<ServiceConfig>,
    #[serde(default)]
    pub detection: Option<ServiceConfig>,
    #[serde(default)]
    pub analysis: Option<ServiceConfig>,
}

/// One external stage service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Base URL (e.g., "http://detector:9000")
    pub url: String,
    /// Bearer token sent with every request
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
    /// Webhook URL passed along with submissions (ingestion only)
    #[serde(default)]
    pub callback_url: Option<String>,
}

fn default_timeout() -> u32 {
    30
}

/// Notification outbox configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Capacity of the channel between emitters and the outbox writer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_buffer_size() -> usize {
    1024
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub reconciler: ReconcilerConfig,
    pub stages: StagesConfig,
    pub services: SanitizedServicesConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedServicesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<SanitizedServiceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<SanitizedServiceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<SanitizedServiceConfig>,
}

/// Sanitized service config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedServiceConfig {
    pub url: String,
    pub api_key_configured: bool,
    pub timeout_secs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl From<&ServiceConfig> for SanitizedServiceConfig {
    fn from(s: &ServiceConfig) -> Self {
        Self {
            url: s.url.clone(),
            api_key_configured: s.api_key.as_ref().is_some_and(|k| !k.is_empty()),
            timeout_secs: s.timeout_secs,
            callback_url: s.callback_url.clone(),
        }
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            reconciler: config.reconciler.clone(),
            stages: config.stages.clone(),
            services: SanitizedServicesConfig {
                ingestion: config.services.ingestion.as_ref().map(Into::into),
                detection: config.services.detection.as_ref().map(Into::into),
                analysis: config.services.analysis.as_ref().map(Into::into),
            },
            notifications: config.notifications.clone(),
        }
    }
}
