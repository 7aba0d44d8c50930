//! Configuration model.
//!
//! The on-disk representation is a single JSON document with `server`,
//! `browser`, `streaming`, `security`, `features`, and `storage` sections.
//! Every field has a default, so an empty document (or a missing file) yields
//! a fully usable configuration. Environment overrides are applied by the
//! server binary after loading.

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriscopeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origin ("*" for any)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Page loaded when `init` carries no URL
    #[serde(default = "default_url")]
    pub default_url: String,
    /// Pool capacity; the LRU instance is evicted when a create would exceed it
    #[serde(default = "default_max_browsers")]
    pub max_browsers: usize,
    /// Idle reap threshold in milliseconds (0 = disabled)
    #[serde(default = "default_browser_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Default raster quality (1-100)
    #[serde(default = "default_screenshot_quality")]
    pub screenshot_quality: u32,
    /// Raster format: jpeg or png
    #[serde(default)]
    pub screenshot_type: ImageFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_fps")]
    pub default_fps: u32,
    #[serde(default = "default_min_fps")]
    pub min_fps: u32,
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    /// Keyframe cadence used when no connection-class preset applies
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
    #[serde(default = "default_min_quality")]
    pub min_quality: u32,
    #[serde(default = "default_max_quality")]
    pub max_quality: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Session TTL in milliseconds; expired sessions are reaped
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Master switch for feedback-driven fps/quality adaptation
    #[serde(default = "default_true")]
    pub adaptive_streaming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Write the effective config back to disk at boot when the file is absent
    #[serde(default = "default_true")]
    pub write_back: bool,
}

/// Raster output format for screenshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            default_url: default_url(),
            max_browsers: default_max_browsers(),
            idle_timeout_ms: default_browser_timeout_ms(),
            screenshot_quality: default_screenshot_quality(),
            screenshot_type: ImageFormat::Jpeg,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            default_fps: default_fps(),
            min_fps: default_min_fps(),
            max_fps: default_max_fps(),
            keyframe_interval: default_keyframe_interval(),
            min_quality: default_min_quality(),
            max_quality: default_max_quality(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            adaptive_streaming: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { write_back: true }
    }
}

impl PeriscopeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the server should not start)
    /// or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.browser.max_browsers == 0 {
            issues.push("ERROR: browser.max_browsers must be >= 1.".to_string());
        }

        if self.browser.idle_timeout_ms > 0 && self.browser.idle_timeout_ms < 60_000 {
            issues.push(format!(
                "ERROR: browser.idle_timeout_ms must be 0 (disabled) or at least 60000, got {}. \
                 Values under a minute reap browsers mid-use.",
                self.browser.idle_timeout_ms
            ));
        }

        if !(1..=100).contains(&self.browser.screenshot_quality) {
            issues.push(format!(
                "ERROR: browser.screenshot_quality must be between 1 and 100, got {}.",
                self.browser.screenshot_quality
            ));
        }

        if self.streaming.min_fps == 0 {
            issues.push("ERROR: streaming.min_fps must be >= 1.".to_string());
        }
        if self.streaming.min_fps > self.streaming.max_fps {
            issues.push(format!(
                "ERROR: streaming.min_fps ({}) must not exceed streaming.max_fps ({}).",
                self.streaming.min_fps, self.streaming.max_fps
            ));
        }
        if !(self.streaming.min_fps..=self.streaming.max_fps).contains(&self.streaming.default_fps)
        {
            issues.push(format!(
                "WARNING: streaming.default_fps ({}) is outside [{}, {}]; it will be clamped.",
                self.streaming.default_fps, self.streaming.min_fps, self.streaming.max_fps
            ));
        }
        if self.streaming.max_fps > 120 {
            issues.push(format!(
                "WARNING: streaming.max_fps is {} — screenshot capture rarely sustains more \
                 than 60 fps; this is likely a misconfiguration.",
                self.streaming.max_fps
            ));
        }

        if self.streaming.min_quality > self.streaming.max_quality {
            issues.push(format!(
                "ERROR: streaming.min_quality ({}) must not exceed streaming.max_quality ({}).",
                self.streaming.min_quality, self.streaming.max_quality
            ));
        }
        if !(1..=100).contains(&self.streaming.max_quality) {
            issues.push(format!(
                "ERROR: streaming.max_quality must be between 1 and 100, got {}.",
                self.streaming.max_quality
            ));
        }

        if self.streaming.keyframe_interval == 0 {
            issues.push("ERROR: streaming.keyframe_interval must be >= 1.".to_string());
        }

        if self.security.session_timeout_ms < 60_000 {
            issues.push(format!(
                "ERROR: security.session_timeout_ms must be at least 60000, got {}. \
                 Sub-minute sessions expire between reconnects.",
                self.security.session_timeout_ms
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8002
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_url() -> String {
    "https://www.google.com".to_string()
}
fn default_max_browsers() -> usize {
    5
}
fn default_browser_timeout_ms() -> u64 {
    900_000 // 15 minutes
}
fn default_screenshot_quality() -> u32 {
    80
}
fn default_fps() -> u32 {
    30
}
fn default_min_fps() -> u32 {
    5
}
fn default_max_fps() -> u32 {
    60
}
fn default_keyframe_interval() -> u32 {
    10
}
fn default_min_quality() -> u32 {
    20
}
fn default_max_quality() -> u32 {
    95
}
fn default_session_timeout_ms() -> u64 {
    7_200_000 // 2 hours
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_document() {
        let config: PeriscopeConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8002);
        assert_eq!(config.server.cors_origin, "*");

        assert_eq!(config.browser.default_url, "https://www.google.com");
        assert_eq!(config.browser.max_browsers, 5);
        assert_eq!(config.browser.idle_timeout_ms, 900_000);
        assert_eq!(config.browser.screenshot_quality, 80);
        assert_eq!(config.browser.screenshot_type, ImageFormat::Jpeg);

        assert_eq!(config.streaming.default_fps, 30);
        assert_eq!(config.streaming.min_fps, 5);
        assert_eq!(config.streaming.max_fps, 60);
        assert_eq!(config.streaming.keyframe_interval, 10);
        assert_eq!(config.streaming.min_quality, 20);
        assert_eq!(config.streaming.max_quality, 95);

        assert_eq!(config.security.session_timeout_ms, 7_200_000);
        assert!(config.features.adaptive_streaming);
        assert!(config.storage.write_back);
    }

    #[test]
    fn default_trait_matches_empty_document() {
        let from_json: PeriscopeConfig = serde_json::from_str("{}").unwrap();
        let from_default = PeriscopeConfig::default();
        assert_eq!(
            serde_json::to_value(&from_json).unwrap(),
            serde_json::to_value(&from_default).unwrap()
        );
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config: PeriscopeConfig = serde_json::from_str(
            r#"{"browser": {"max_browsers": 2}, "streaming": {"default_fps": 15}}"#,
        )
        .unwrap();
        assert_eq!(config.browser.max_browsers, 2);
        assert_eq!(config.browser.screenshot_quality, 80);
        assert_eq!(config.streaming.default_fps, 15);
        assert_eq!(config.streaming.max_fps, 60);
        assert_eq!(config.server.port, 8002);
    }

    #[test]
    fn screenshot_type_parses_lowercase() {
        let config: PeriscopeConfig =
            serde_json::from_str(r#"{"browser": {"screenshot_type": "png"}}"#).unwrap();
        assert_eq!(config.browser.screenshot_type, ImageFormat::Png);
        assert!(
            serde_json::from_str::<PeriscopeConfig>(
                r#"{"browser": {"screenshot_type": "webp"}}"#
            )
            .is_err()
        );
    }

    // --- Validation ---

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn validate_issues(config: &PeriscopeConfig) -> Vec<String> {
        config.validate().err().unwrap_or_default()
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(PeriscopeConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = PeriscopeConfig::default();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_zero_capacity_is_error() {
        let mut config = PeriscopeConfig::default();
        config.browser.max_browsers = 0;
        assert!(has_error(&validate_issues(&config), "max_browsers"));
    }

    #[test]
    fn validate_inverted_fps_bounds_is_error() {
        let mut config = PeriscopeConfig::default();
        config.streaming.min_fps = 40;
        config.streaming.max_fps = 20;
        assert!(has_error(&validate_issues(&config), "min_fps"));
    }

    #[test]
    fn validate_inverted_quality_bounds_is_error() {
        let mut config = PeriscopeConfig::default();
        config.streaming.min_quality = 90;
        config.streaming.max_quality = 40;
        assert!(has_error(&validate_issues(&config), "min_quality"));
    }

    #[test]
    fn validate_out_of_range_default_fps_is_warning() {
        let mut config = PeriscopeConfig::default();
        config.streaming.default_fps = 90;
        let issues = validate_issues(&config);
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("WARNING:") && i.contains("default_fps"))
        );
        assert!(!has_error(&issues, "default_fps"));
    }

    #[test]
    fn validate_short_browser_timeout_is_error() {
        let mut config = PeriscopeConfig::default();
        config.browser.idle_timeout_ms = 5_000;
        assert!(has_error(&validate_issues(&config), "idle_timeout_ms"));
    }

    #[test]
    fn validate_browser_timeout_zero_disables_reaping() {
        let mut config = PeriscopeConfig::default();
        config.browser.idle_timeout_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_collects_multiple_issues() {
        let mut config = PeriscopeConfig::default();
        config.server.port = 0;
        config.browser.max_browsers = 0;
        config.streaming.keyframe_interval = 0;
        let issues = validate_issues(&config);
        assert!(issues.len() >= 3, "expected >= 3 issues, got {issues:?}");
    }
}
