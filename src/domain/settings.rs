use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::infrastructure::peer::protocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "motion_stream".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name the display peer advertises under.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Name the source peer browses under.
    #[serde(default = "default_source_name")]
    pub source_name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,

    // Streaming
    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: f64,
    #[serde(default = "default_sensor_rate_hz")]
    pub sensor_rate_hz: f64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Loopback pipe size, in whole packets.
    #[serde(default = "default_stream_capacity_packets")]
    pub stream_capacity_packets: usize,

    /// Stop after this long; run until Ctrl-C when unset.
    #[serde(default)]
    pub run_for_secs: Option<u64>,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            source_name: default_source_name(),
            service_type: default_service_type(),
            tick_rate_hz: default_tick_rate_hz(),
            sensor_rate_hz: default_sensor_rate_hz(),
            connect_timeout_secs: default_connect_timeout_secs(),
            stream_capacity_packets: default_stream_capacity_packets(),
            run_for_secs: None,
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn tick_interval(&self) -> Duration {
        rate_to_interval(self.tick_rate_hz, default_tick_rate_hz())
    }

    pub fn sensor_interval(&self) -> Duration {
        rate_to_interval(self.sensor_rate_hz, default_sensor_rate_hz())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.clamp(1, MAX_CONNECT_TIMEOUT_SECS))
    }

    pub fn stream_capacity_bytes(&self) -> usize {
        self.stream_capacity_packets
            .clamp(1, MAX_STREAM_CAPACITY_PACKETS)
            * protocol::PACKET_LEN
    }
}

const MIN_RATE_HZ: f64 = 0.1;
const MAX_RATE_HZ: f64 = 1000.0;
const MAX_CONNECT_TIMEOUT_SECS: u64 = 3600;
const MAX_STREAM_CAPACITY_PACKETS: usize = 4096;

fn rate_to_interval(rate_hz: f64, fallback_hz: f64) -> Duration {
    let rate = if rate_hz.is_finite() && rate_hz > 0.0 {
        rate_hz.clamp(MIN_RATE_HZ, MAX_RATE_HZ)
    } else {
        tracing::warn!("Invalid rate {} Hz, using {} Hz", rate_hz, fallback_hz);
        fallback_hz
    };
    Duration::try_from_secs_f64(1.0 / rate)
        .unwrap_or_else(|_| Duration::from_secs_f64(1.0 / fallback_hz))
}

fn default_display_name() -> String {
    "display".to_string()
}
fn default_source_name() -> String {
    "source".to_string()
}
fn default_service_type() -> String {
    protocol::SERVICE_TYPE.to_string()
}
fn default_tick_rate_hz() -> f64 {
    30.0
}
fn default_sensor_rate_hz() -> f64 {
    60.0
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_stream_capacity_packets() -> usize {
    8
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is absent
    /// or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("MotionStream");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
