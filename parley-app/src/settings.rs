//! Persistent application settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{vad::VadConfig, EngineConfig, ReconnectPolicy};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKEND_URL: &str = "ws://127.0.0.1:8000/ws";
pub const BACKEND_URL_ENV: &str = "PARLEY_BACKEND_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub backend_url: String,
    pub preferred_input_device: Option<String>,
    pub start_delta: f32,
    pub stop_delta: f32,
    pub barge_delta: f32,
    pub threshold_cap: f32,
    pub silence_ms: u64,
    pub min_speech_ms: u64,
    pub noise_adapt_rate: f32,
    pub min_blob_bytes: usize,
    pub upload_sample_rate: u32,
    pub max_capture_secs: u64,
    /// 0 waits for a reply forever.
    pub reply_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub resume_on_reconnect: bool,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_attempts: u32,
    /// Print a live level meter line while listening.
    pub show_levels: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        let vad = VadConfig::default();
        Self {
            backend_url: DEFAULT_BACKEND_URL.into(),
            preferred_input_device: None,
            start_delta: vad.start_delta,
            stop_delta: vad.stop_delta,
            barge_delta: vad.barge_delta,
            threshold_cap: vad.threshold_cap,
            silence_ms: 400,
            min_speech_ms: 300,
            noise_adapt_rate: 0.05,
            min_blob_bytes: 200,
            upload_sample_rate: 16_000,
            max_capture_secs: 30,
            reply_timeout_secs: 20,
            connect_timeout_ms: 5_000,
            resume_on_reconnect: true,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 5_000,
            reconnect_attempts: 5,
            show_levels: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.backend_url = normalize_backend_url(&self.backend_url);
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.start_delta = self.start_delta.clamp(0.001, 0.5);
        self.stop_delta = self.stop_delta.clamp(0.0, self.start_delta - 0.001);
        self.barge_delta = self.barge_delta.clamp(0.001, 0.5);
        self.threshold_cap = self.threshold_cap.clamp(self.start_delta, 1.0);
        self.silence_ms = self.silence_ms.clamp(100, 5_000);
        self.min_speech_ms = self.min_speech_ms.clamp(0, 5_000);
        self.noise_adapt_rate = self.noise_adapt_rate.clamp(0.001, 1.0);
        self.min_blob_bytes = self.min_blob_bytes.min(1 << 20);
        self.upload_sample_rate = self.upload_sample_rate.clamp(8_000, 48_000);
        self.max_capture_secs = self.max_capture_secs.clamp(1, 300);
        self.reply_timeout_secs = self.reply_timeout_secs.min(600);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(100, 60_000);
        self.reconnect_base_ms = self.reconnect_base_ms.clamp(10, 60_000);
        self.reconnect_max_ms = self.reconnect_max_ms.clamp(self.reconnect_base_ms, 300_000);
        self.reconnect_attempts = self.reconnect_attempts.clamp(1, 100);
    }

    /// Environment overrides win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                self.backend_url = normalize_backend_url(url);
            }
        }
    }

    pub fn into_engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.vad = VadConfig {
            start_delta: self.start_delta,
            stop_delta: self.stop_delta,
            barge_delta: self.barge_delta,
            threshold_cap: self.threshold_cap,
            silence_duration: Duration::from_millis(self.silence_ms),
            min_speech_duration: Duration::from_millis(self.min_speech_ms),
        };
        config.noise.adapt_rate = self.noise_adapt_rate;
        config.capture.min_blob_bytes = self.min_blob_bytes;
        config.capture.target_sample_rate = self.upload_sample_rate;
        config.capture.max_duration = Duration::from_secs(self.max_capture_secs);
        config.reply_timeout =
            (self.reply_timeout_secs > 0).then(|| Duration::from_secs(self.reply_timeout_secs));
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.resume_on_reconnect = self.resume_on_reconnect;
        config.reconnect = ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_attempts,
        };
        config.preferred_input_device = self.preferred_input_device.clone();
        config.normalized()
    }
}

/// Accept `host:port/path` and `http(s)://` forms, returning a `ws(s)://` URL.
pub fn normalize_backend_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_BACKEND_URL.into();
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return format!("wss://{rest}");
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return format!("ws://{rest}");
    }
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        return trimmed.into();
    }
    format!("ws://{trimmed}")
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parley")
            .join("settings.json")
    }
}

/// Missing or unreadable files yield defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"backendUrl":"ws://assistant.local/ws","silenceMs":600}"#)
                .expect("parse settings");
        assert_eq!(settings.backend_url, "ws://assistant.local/ws");
        assert_eq!(settings.silence_ms, 600);
        assert_eq!(settings.min_speech_ms, 300);
        assert!(settings.resume_on_reconnect);
    }

    #[test]
    fn normalize_restores_hysteresis() {
        let mut settings = AppSettings {
            start_delta: 0.01,
            stop_delta: 0.05,
            barge_delta: -1.0,
            ..AppSettings::default()
        };
        settings.normalize();
        assert!(settings.stop_delta < settings.start_delta);
        assert!(settings.barge_delta > 0.0);
    }

    #[test]
    fn backend_url_forms() {
        assert_eq!(normalize_backend_url(""), DEFAULT_BACKEND_URL);
        assert_eq!(normalize_backend_url("localhost:9000/ws"), "ws://localhost:9000/ws");
        assert_eq!(normalize_backend_url("https://example.com/ws"), "wss://example.com/ws");
        assert_eq!(normalize_backend_url(" wss://example.com/ws "), "wss://example.com/ws");
    }

    #[test]
    fn engine_config_mapping() {
        let settings = AppSettings {
            reply_timeout_secs: 0,
            max_capture_secs: 12,
            preferred_input_device: Some("USB Mic".into()),
            ..AppSettings::default()
        };
        let config = settings.into_engine_config();
        assert_eq!(config.reply_timeout, None);
        assert_eq!(config.capture.max_duration, Duration::from_secs(12));
        assert_eq!(config.preferred_input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.vad, VadConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("parley-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            show_levels: true,
            backend_url: "ws://10.0.0.2:8000/ws".into(),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).expect("save settings");
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(dir);
    }
}
