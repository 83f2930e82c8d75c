//! Configuration
//!
//! TOML file loading with fatal validation of required values. Unknown
//! keys are warned about and ignored so a config written for a newer
//! version still starts an older daemon.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::alerts::notify::RetryPolicy;
use crate::alerts::AlertManagerConfig;
use crate::bindings::BindingConfig;
use crate::core::arp::MacAddr;
use crate::engine::capture::CaptureConfig;
use crate::rate::{RateConfig, RateMetric, ThresholdRule};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub alerting: AlertingConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub capture: CaptureConfig,
}

impl Config {
    /// Load configuration from file. Parse failures and invalid values
    /// are fatal; unknown keys are warned about and ignored.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;

        let raw: toml::Value = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;
        warn_unknown_keys(&raw);

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default locations, or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/arpsentry/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("arpsentry/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Refuse to run with thresholds or windows that make detection
    /// undefined.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        if d.rate_window_seconds == 0 {
            bail!("detection.rate_window_seconds must be at least 1");
        }
        if d.correlation_window_seconds == 0 {
            bail!("detection.correlation_window_seconds must be at least 1");
        }
        if d.context_depth == 0 {
            bail!("detection.context_depth must be at least 1");
        }
        for (idx, rule) in d.rate_thresholds.iter().enumerate() {
            if rule.violation_count == 0 {
                bail!("detection.rate_thresholds[{}].violation_count must be at least 1", idx);
            }
            if rule.violation_ratio <= 0.0 {
                bail!("detection.rate_thresholds[{}].violation_ratio must be positive", idx);
            }
            if rule.window_size == 0 || rule.window_size as u64 > d.rate_window_seconds {
                bail!(
                    "detection.rate_thresholds[{}].window_size must be within 1..={}",
                    idx,
                    d.rate_window_seconds
                );
            }
        }
        for channel in &self.alerting.channels {
            match channel.channel_type.as_str() {
                "webhook" | "slack" if channel.url.is_none() => {
                    bail!(
                        "alerting channel '{}' requires a url",
                        channel.effective_name()
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn binding_config(&self) -> BindingConfig {
        BindingConfig {
            correlation_window: Duration::from_secs(self.detection.correlation_window_seconds),
            mac_fanout_threshold: self.detection.mac_fanout_threshold,
            gratuitous_window: Duration::from_secs(self.detection.rate_window_seconds.max(60)),
        }
    }

    pub fn rate_config(&self) -> RateConfig {
        RateConfig {
            window: Duration::from_secs(self.detection.rate_window_seconds),
            baseline_floor: self.detection.baseline_floor,
            ewma_alpha: 0.3,
        }
    }

    pub fn manager_config(&self) -> AlertManagerConfig {
        AlertManagerConfig {
            correlation_window: Duration::from_secs(self.detection.correlation_window_seconds),
            retry: (&self.alerting.retry).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Sliding-window span for the rate detector, seconds
    #[serde(default = "default_rate_window")]
    pub rate_window_seconds: u64,

    /// Threshold rules evaluated every tick
    #[serde(default = "default_rate_thresholds")]
    pub rate_thresholds: Vec<ThresholdRule>,

    /// Signature database; pattern matching is disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_db_path: Option<PathBuf>,

    /// Window within which related detections merge into one alert
    #[serde(default = "default_correlation_window")]
    pub correlation_window_seconds: u64,

    /// Events retained per (sender, target) pair for pattern context
    #[serde(default = "default_context_depth")]
    pub context_depth: usize,

    /// Floor under the learned rate baseline, events/sec
    #[serde(default = "default_baseline_floor")]
    pub baseline_floor: f32,

    /// Distinct IPs one MAC may claim before a fan-out detection
    #[serde(default = "default_mac_fanout")]
    pub mac_fanout_threshold: usize,

    /// Bindings unseen for this long are evicted
    #[serde(default = "default_binding_max_age")]
    pub binding_max_age_seconds: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            rate_window_seconds: default_rate_window(),
            rate_thresholds: default_rate_thresholds(),
            pattern_db_path: None,
            correlation_window_seconds: default_correlation_window(),
            context_depth: default_context_depth(),
            baseline_floor: default_baseline_floor(),
            mac_fanout_threshold: default_mac_fanout(),
            binding_max_age_seconds: default_binding_max_age(),
        }
    }
}

fn default_rate_window() -> u64 {
    10
}

fn default_correlation_window() -> u64 {
    10
}

fn default_context_depth() -> usize {
    8
}

fn default_baseline_floor() -> f32 {
    1.0
}

fn default_mac_fanout() -> usize {
    8
}

fn default_binding_max_age() -> u64 {
    3600
}

fn default_rate_thresholds() -> Vec<ThresholdRule> {
    vec![
        ThresholdRule {
            metric: RateMetric::Reply,
            window_size: 5,
            violation_count: 3,
            violation_ratio: 4.0,
        },
        ThresholdRule {
            metric: RateMetric::Gratuitous,
            window_size: 5,
            violation_count: 2,
            violation_ratio: 3.0,
        },
        ThresholdRule {
            metric: RateMetric::Total,
            window_size: 10,
            violation_count: 3,
            violation_ratio: 6.0,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Notification channels, attempted independently
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,

    /// Append-only JSONL audit log
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            history_path: default_history_path(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig {
        channel_type: "console".to_string(),
        name: None,
        enabled: true,
        url: None,
    }]
}

fn default_history_path() -> PathBuf {
    PathBuf::from("/var/lib/arpsentry/alerts.jsonl")
}

/// One notification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Destination for webhook/slack channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ChannelConfig {
    pub fn effective_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.channel_type.clone())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_elapsed_seconds")]
    pub max_elapsed_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_elapsed_seconds: default_max_elapsed_seconds(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_elapsed_seconds() -> u64 {
    120
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_elapsed: Duration::from_secs(config.max_elapsed_seconds),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Gateways whose IP (and optionally MAC) are authoritative
    #[serde(default)]
    pub trusted_gateways: Vec<GatewayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ip: Ipv4Addr,
    /// Pinned hardware address; omit to mark the IP as a gateway without
    /// pinning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
}

/// Known keys per section, for unknown-key warnings
fn known_keys() -> HashMap<&'static str, Vec<&'static str>> {
    HashMap::from([
        ("general", vec!["log_level"]),
        (
            "detection",
            vec![
                "rate_window_seconds",
                "rate_thresholds",
                "pattern_db_path",
                "correlation_window_seconds",
                "context_depth",
                "baseline_floor",
                "mac_fanout_threshold",
                "binding_max_age_seconds",
            ],
        ),
        ("alerting", vec!["channels", "history_path", "retry"]),
        ("network", vec!["trusted_gateways"]),
        (
            "capture",
            vec![
                "method",
                "interface",
                "pcap_file",
                "snaplen",
                "promiscuous",
                "timeout_ms",
            ],
        ),
    ])
}

fn warn_unknown_keys(raw: &toml::Value) {
    let Some(table) = raw.as_table() else {
        return;
    };
    let known = known_keys();

    for (section, value) in table {
        let Some(section_keys) = known.get(section.as_str()) else {
            warn!(section = %section, "unknown config section ignored");
            continue;
        };
        if let Some(section_table) = value.as_table() {
            for key in section_table.keys() {
                if !section_keys.contains(&key.as_str()) {
                    warn!(section = %section, key = %key, "unknown config key ignored");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.rate_window_seconds, 10);
        assert_eq!(config.alerting.channels.len(), 1);
    }

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[detection]
rate_window_seconds = 20
correlation_window_seconds = 15

[[detection.rate_thresholds]]
metric = "reply"
window_size = 5
violation_count = 2
violation_ratio = 3.0

[[alerting.channels]]
type = "webhook"
url = "http://localhost:9000/alerts"

[[network.trusted_gateways]]
ip = "192.168.1.1"
mac = "aa:bb:cc:dd:ee:ff"

[capture]
method = "live"
interface = "eth0"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.detection.rate_window_seconds, 20);
        assert_eq!(config.detection.rate_thresholds.len(), 1);
        assert_eq!(config.network.trusted_gateways.len(), 1);
        assert_eq!(
            config.network.trusted_gateways[0].mac.unwrap().to_string(),
            "aa:bb:cc:dd:ee:ff"
        );
    }

    #[test]
    fn test_invalid_threshold_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[detection.rate_thresholds]]
metric = "reply"
window_size = 5
violation_count = 0
violation_ratio = 3.0
"#
        )
        .unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_webhook_without_url_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[alerting.channels]]
type = "webhook"
"#
        )
        .unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_unknown_keys_ignored_not_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[general]
log_level = "debug"
shiny_new_option = true

[experimental]
flux_capacitor = 88
"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "debug");
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(
            loaded.detection.rate_window_seconds,
            config.detection.rate_window_seconds
        );
    }
}
