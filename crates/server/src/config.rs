use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use periscope_protocol::{ImageFormat, PeriscopeConfig};

/// Load configuration from a JSON file at the given path, then apply
/// environment overrides. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<PeriscopeConfig> {
    let mut config = read_config_file(path)?;
    apply_env_overrides(&mut config, std::env::vars());
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<PeriscopeConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(PeriscopeConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: PeriscopeConfig =
        serde_json::from_str(&contents).context("Failed to parse config JSON")?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Write the effective configuration back to disk (pretty JSON).
pub fn write_back(path: &Path, config: &PeriscopeConfig) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, data)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

/// Overlay the documented environment variables onto the loaded config.
/// Malformed values are ignored with a warning — a bad env var must never
/// keep the server from starting.
fn apply_env_overrides(
    config: &mut PeriscopeConfig,
    vars: impl Iterator<Item = (String, String)>,
) {
    for (key, value) in vars {
        match key.as_str() {
            "HOST" => config.server.host = value,
            "PORT" => set_parsed(&mut config.server.port, &key, &value),
            "CORS_ORIGIN" => config.server.cors_origin = value,
            "DEFAULT_URL" => config.browser.default_url = value,
            "MAX_BROWSERS" => set_parsed(&mut config.browser.max_browsers, &key, &value),
            "BROWSER_TIMEOUT" => set_parsed(&mut config.browser.idle_timeout_ms, &key, &value),
            "SCREENSHOT_QUALITY" => {
                set_parsed(&mut config.browser.screenshot_quality, &key, &value)
            }
            "SCREENSHOT_TYPE" => match value.to_ascii_lowercase().as_str() {
                "jpeg" => config.browser.screenshot_type = ImageFormat::Jpeg,
                "png" => config.browser.screenshot_type = ImageFormat::Png,
                other => tracing::warn!("Ignoring SCREENSHOT_TYPE={other}: expected jpeg or png"),
            },
            "DEFAULT_FPS" => set_parsed(&mut config.streaming.default_fps, &key, &value),
            "MIN_FPS" => set_parsed(&mut config.streaming.min_fps, &key, &value),
            "MAX_FPS" => set_parsed(&mut config.streaming.max_fps, &key, &value),
            "KEYFRAME_INTERVAL" => {
                set_parsed(&mut config.streaming.keyframe_interval, &key, &value)
            }
            "SESSION_TIMEOUT" => set_parsed(&mut config.security.session_timeout_ms, &key, &value),
            _ => {}
        }
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, value: &str)
where
    T::Err: Display,
{
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(e) => tracing::warn!("Ignoring {key}={value}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(pairs: &[(&str, &str)]) -> PeriscopeConfig {
        let mut config = PeriscopeConfig::default();
        apply_env_overrides(
            &mut config,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        config
    }

    #[test]
    fn env_overrides_every_documented_variable() {
        let config = overlay(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("CORS_ORIGIN", "https://viewer.example"),
            ("DEFAULT_URL", "https://start.example"),
            ("MAX_BROWSERS", "3"),
            ("BROWSER_TIMEOUT", "600000"),
            ("SCREENSHOT_QUALITY", "65"),
            ("SCREENSHOT_TYPE", "png"),
            ("DEFAULT_FPS", "24"),
            ("MIN_FPS", "10"),
            ("MAX_FPS", "48"),
            ("KEYFRAME_INTERVAL", "12"),
            ("SESSION_TIMEOUT", "3600000"),
        ]);

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.cors_origin, "https://viewer.example");
        assert_eq!(config.browser.default_url, "https://start.example");
        assert_eq!(config.browser.max_browsers, 3);
        assert_eq!(config.browser.idle_timeout_ms, 600_000);
        assert_eq!(config.browser.screenshot_quality, 65);
        assert_eq!(config.browser.screenshot_type, ImageFormat::Png);
        assert_eq!(config.streaming.default_fps, 24);
        assert_eq!(config.streaming.min_fps, 10);
        assert_eq!(config.streaming.max_fps, 48);
        assert_eq!(config.streaming.keyframe_interval, 12);
        assert_eq!(config.security.session_timeout_ms, 3_600_000);
    }

    #[test]
    fn malformed_env_values_are_ignored() {
        let config = overlay(&[
            ("PORT", "not-a-port"),
            ("MAX_BROWSERS", "-1"),
            ("SCREENSHOT_TYPE", "webp"),
            ("DEFAULT_FPS", "fast"),
        ]);
        assert_eq!(config.server.port, 8002);
        assert_eq!(config.browser.max_browsers, 5);
        assert_eq!(config.browser.screenshot_type, ImageFormat::Jpeg);
        assert_eq!(config.streaming.default_fps, 30);
    }

    #[test]
    fn unrelated_env_vars_are_left_alone() {
        let config = overlay(&[("PATH", "/usr/bin"), ("EDITOR", "vi")]);
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            serde_json::to_value(PeriscopeConfig::default()).unwrap()
        );
    }

    #[test]
    fn write_back_then_load_round_trips() {
        let path = std::env::temp_dir().join(format!(
            "periscope-config-{}.json",
            uuid::Uuid::new_v4()
        ));

        let mut config = PeriscopeConfig::default();
        config.server.port = 9123;
        config.browser.max_browsers = 2;
        write_back(&path, &config).unwrap();

        let loaded = read_config_file(&path).unwrap();
        assert_eq!(loaded.server.port, 9123);
        assert_eq!(loaded.browser.max_browsers, 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!(
            "periscope-missing-{}.json",
            uuid::Uuid::new_v4()
        ));
        let config = read_config_file(&path).unwrap();
        assert_eq!(config.server.port, 8002);
    }
}
