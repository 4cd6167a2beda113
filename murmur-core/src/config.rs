//! Persistent audio settings (JSON file in the data directory).
//!
//! Every field has a default, so a partial or stale file still loads.
//! `normalize` clamps values into ranges the pipelines can run with, and
//! `MURMUR_*` environment variables override the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::buffering::chunk::PcmFormat;
use crate::dsp::{DspConfig, JsonFileStore};
use crate::stream::http::HttpConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AudioSettings {
    pub capture_sample_rate: u32,
    pub capture_channels: u16,
    pub target_sample_rate: u32,
    pub frame_ms: u64,
    pub raw_mic_ring_bytes: usize,
    pub mic_ring_bytes: usize,
    pub preroll_ms: u64,
    pub wake_word_ms: u64,
    pub playback_ring_bytes: usize,
    pub http_recv_timeout_ms: u64,
    pub http_connect_timeout_ms: u64,
    pub max_redirects: usize,
    pub connect_retry_limit: u32,
    pub live_refresh_backoff_ms: u64,
    pub max_live_refresh_attempts: u32,
    pub user_agent: String,
    pub mute_store_path: Option<PathBuf>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            capture_sample_rate: 48_000,
            capture_channels: 2,
            target_sample_rate: 16_000,
            frame_ms: 20,
            raw_mic_ring_bytes: 4 * 1024,
            mic_ring_bytes: 8 * 1024,
            preroll_ms: 500,
            wake_word_ms: 600,
            playback_ring_bytes: 32 * 1024,
            http_recv_timeout_ms: 500,
            http_connect_timeout_ms: 5_000,
            max_redirects: 10,
            connect_retry_limit: 8,
            live_refresh_backoff_ms: 1_000,
            max_live_refresh_attempts: 30,
            user_agent: format!("murmur/{}", env!("CARGO_PKG_VERSION")),
            mute_store_path: None,
        }
    }
}

impl AudioSettings {
    pub fn normalize(&mut self) {
        self.capture_sample_rate = self.capture_sample_rate.clamp(8_000, 192_000);
        self.capture_channels = self.capture_channels.clamp(1, 8);
        self.target_sample_rate = self.target_sample_rate.clamp(8_000, 48_000);
        self.frame_ms = self.frame_ms.clamp(10, 100);
        self.raw_mic_ring_bytes = self.raw_mic_ring_bytes.clamp(1024, 1 << 20);
        self.mic_ring_bytes = self.mic_ring_bytes.clamp(1024, 1 << 20);
        self.preroll_ms = self.preroll_ms.clamp(0, 5_000);
        self.wake_word_ms = self.wake_word_ms.clamp(100, 5_000);
        self.playback_ring_bytes = self.playback_ring_bytes.clamp(1024, 1 << 22);
        self.http_recv_timeout_ms = self.http_recv_timeout_ms.clamp(50, 30_000);
        self.http_connect_timeout_ms = self.http_connect_timeout_ms.clamp(100, 60_000);
        self.max_redirects = self.max_redirects.clamp(1, 20);
        self.connect_retry_limit = self.connect_retry_limit.clamp(1, 64);
        self.live_refresh_backoff_ms = self.live_refresh_backoff_ms.clamp(100, 30_000);
        self.max_live_refresh_attempts = self.max_live_refresh_attempts.clamp(1, 1_000);
        let agent = self.user_agent.trim();
        self.user_agent = if agent.is_empty() {
            AudioSettings::default().user_agent
        } else {
            agent.to_string()
        };
        self.mute_store_path = self
            .mute_store_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }

    /// Apply `MURMUR_*` overrides, then re-normalize.
    pub fn apply_env_overrides(&mut self) {
        override_from_env("MURMUR_HTTP_RECV_TIMEOUT_MS", &mut self.http_recv_timeout_ms);
        override_from_env("MURMUR_HTTP_CONNECT_TIMEOUT_MS", &mut self.http_connect_timeout_ms);
        override_from_env("MURMUR_MAX_REDIRECTS", &mut self.max_redirects);
        override_from_env("MURMUR_CONNECT_RETRY_LIMIT", &mut self.connect_retry_limit);
        override_from_env("MURMUR_PREROLL_MS", &mut self.preroll_ms);
        override_from_env("MURMUR_WAKE_WORD_MS", &mut self.wake_word_ms);
        override_from_env("MURMUR_CAPTURE_SAMPLE_RATE", &mut self.capture_sample_rate);
        if let Ok(agent) = std::env::var("MURMUR_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(path) = std::env::var_os("MURMUR_MUTE_STORE") {
            self.mute_store_path = Some(PathBuf::from(path));
        }
        self.normalize();
    }

    pub fn capture_format(&self) -> PcmFormat {
        PcmFormat::new(self.capture_sample_rate, self.capture_channels, 16)
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            recv_timeout: Duration::from_millis(self.http_recv_timeout_ms),
            connect_timeout: Duration::from_millis(self.http_connect_timeout_ms),
            max_redirects: self.max_redirects,
            connect_retry_limit: self.connect_retry_limit,
            live_refresh_backoff: Duration::from_millis(self.live_refresh_backoff_ms),
            max_live_refresh_attempts: self.max_live_refresh_attempts,
            user_agent: self.user_agent.clone(),
        }
    }

    /// Where the mic mute flag is persisted.
    pub fn mute_store_path(&self) -> PathBuf {
        self.mute_store_path
            .clone()
            .unwrap_or_else(|| data_dir().join("state.json"))
    }

    pub fn mute_store(&self) -> JsonFileStore {
        JsonFileStore::open(self.mute_store_path())
    }

    pub fn dsp_config(&self) -> DspConfig {
        DspConfig {
            capture_format: self.capture_format(),
            target_sample_rate: self.target_sample_rate,
            frame_ms: self.frame_ms,
            raw_mic_ring_bytes: self.raw_mic_ring_bytes,
            mic_ring_bytes: self.mic_ring_bytes,
            preroll_ms: self.preroll_ms,
            wake_word_ms: self.wake_word_ms,
        }
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value = raw.as_str(), "ignoring unparsable override"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("murmur")
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// Load settings, falling back to defaults on a missing or corrupt file.
pub fn load_settings(path: &Path) -> AudioSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AudioSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AudioSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
