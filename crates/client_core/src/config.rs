use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";
const ENV_PREFIX: &str = "APP__";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub server_base_url: String,
    pub push_url: Option<String>,
    pub first_page_size: u32,
    pub older_page_size: u32,
    pub max_attachment_bytes: u64,
    pub settle_window_ms: u64,
    pub seen_visible_fraction: f32,
    pub seen_dwell_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub register_wait_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_base_url: "http://127.0.0.1:5000/api".into(),
            push_url: None,
            first_page_size: 50,
            older_page_size: 10,
            max_attachment_bytes: 3 * 1024 * 1024,
            settle_window_ms: 1_000,
            seen_visible_fraction: 0.5,
            seen_dwell_ms: 400,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 16_000,
            max_reconnect_attempts: 5,
            register_wait_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    /// WebSocket endpoint of the push transport. Falls back to the REST base URL with its
    /// scheme swapped, minus any trailing `/api` segment.
    pub fn push_ws_url(&self) -> Result<String> {
        if let Some(url) = &self.push_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let base = self.server_base_url.trim_end_matches('/');
        let base = base.strip_suffix("/api").unwrap_or(base);
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!(
                "server_base_url must start with http:// or https://: {base}"
            ));
        };
        Ok(format!("{ws}/ws"))
    }

    pub fn rest_base_url(&self) -> &str {
        self.server_base_url.trim_end_matches('/')
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn seen_dwell(&self) -> Duration {
        Duration::from_millis(self.seen_dwell_ms)
    }

    pub fn register_wait(&self) -> Duration {
        Duration::from_millis(self.register_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based): capped exponential.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_base_url: Option<String>,
    push_url: Option<String>,
    first_page_size: Option<u32>,
    older_page_size: Option<u32>,
    max_attachment_bytes: Option<u64>,
    settle_window_ms: Option<u64>,
    seen_visible_fraction: Option<f32>,
    seen_dwell_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    register_wait_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then `path` if it exists and parses, then `APP__*` overrides from `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    apply_env_overrides(&mut settings, env);
    settings
}

fn apply_file_settings(settings: &mut SyncSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_base_url {
        settings.server_base_url = v;
    }
    if let Some(v) = file_cfg.push_url {
        settings.push_url = Some(v);
    }
    if let Some(v) = file_cfg.first_page_size {
        settings.first_page_size = v;
    }
    if let Some(v) = file_cfg.older_page_size {
        settings.older_page_size = v;
    }
    if let Some(v) = file_cfg.max_attachment_bytes {
        settings.max_attachment_bytes = v;
    }
    if let Some(v) = file_cfg.settle_window_ms {
        settings.settle_window_ms = v;
    }
    if let Some(v) = file_cfg.seen_visible_fraction {
        settings.seen_visible_fraction = v;
    }
    if let Some(v) = file_cfg.seen_dwell_ms {
        settings.seen_dwell_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = file_cfg.max_reconnect_attempts {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = file_cfg.register_wait_ms {
        settings.register_wait_ms = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
}

fn apply_env_overrides(settings: &mut SyncSettings, env: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| env(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("SERVER_BASE_URL") {
        settings.server_base_url = v;
    }
    if let Some(v) = var("PUSH_URL") {
        settings.push_url = Some(v);
    }
    override_parsed(&mut settings.first_page_size, "FIRST_PAGE_SIZE", var("FIRST_PAGE_SIZE"));
    override_parsed(&mut settings.older_page_size, "OLDER_PAGE_SIZE", var("OLDER_PAGE_SIZE"));
    override_parsed(
        &mut settings.max_attachment_bytes,
        "MAX_ATTACHMENT_BYTES",
        var("MAX_ATTACHMENT_BYTES"),
    );
    override_parsed(&mut settings.settle_window_ms, "SETTLE_WINDOW_MS", var("SETTLE_WINDOW_MS"));
    override_parsed(
        &mut settings.seen_visible_fraction,
        "SEEN_VISIBLE_FRACTION",
        var("SEEN_VISIBLE_FRACTION"),
    );
    override_parsed(&mut settings.seen_dwell_ms, "SEEN_DWELL_MS", var("SEEN_DWELL_MS"));
    override_parsed(
        &mut settings.reconnect_base_delay_ms,
        "RECONNECT_BASE_DELAY_MS",
        var("RECONNECT_BASE_DELAY_MS"),
    );
    override_parsed(
        &mut settings.reconnect_max_delay_ms,
        "RECONNECT_MAX_DELAY_MS",
        var("RECONNECT_MAX_DELAY_MS"),
    );
    override_parsed(
        &mut settings.max_reconnect_attempts,
        "MAX_RECONNECT_ATTEMPTS",
        var("MAX_RECONNECT_ATTEMPTS"),
    );
    override_parsed(&mut settings.register_wait_ms, "REGISTER_WAIT_MS", var("REGISTER_WAIT_MS"));
    override_parsed(
        &mut settings.request_timeout_secs,
        "REQUEST_TIMEOUT_SECS",
        var("REQUEST_TIMEOUT_SECS"),
    );
}

fn override_parsed<T: FromStr>(target: &mut T, name: &str, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!("config: ignoring invalid {ENV_PREFIX}{name}={raw}"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
