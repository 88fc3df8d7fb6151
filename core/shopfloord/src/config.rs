//! Runtime configuration for shopfloord.
//!
//! Loaded once at startup from `~/.shopfloor/shopfloord.toml`. Every section
//! and field has a default, so a missing or partial file is never fatal; a
//! malformed file logs a warning and the daemon runs on defaults.

use serde::Deserialize;
use shopfloor_core::WorkCalendar;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".shopfloor/shopfloord.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_warmup_threshold_secs")]
    pub warmup_threshold_secs: i64,
    /// Machines with paired turrets report fixed-width "double tool" ids;
    /// enables zero-padding normalization instead of zero-stripping.
    #[serde(default)]
    pub double_tool_numbers: bool,
    #[serde(default = "default_parts_per_cycle")]
    pub default_parts_per_cycle: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            warmup_threshold_secs: default_warmup_threshold_secs(),
            double_tool_numbers: false,
            default_parts_per_cycle: default_parts_per_cycle(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_cursor_ttl_secs")]
    pub cursor_ttl_secs: i64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            cursor_ttl_secs: default_cursor_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_shift_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_shift_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_morning_break_hour")]
    pub morning_break_hour: u32,
    #[serde(default = "default_morning_break_secs")]
    pub morning_break_secs: i64,
    #[serde(default = "default_midday_break_hour")]
    pub midday_break_hour: u32,
    #[serde(default = "default_midday_break_secs")]
    pub midday_break_secs: i64,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            start_hour: default_shift_start_hour(),
            end_hour: default_shift_end_hour(),
            morning_break_hour: default_morning_break_hour(),
            morning_break_secs: default_morning_break_secs(),
            midday_break_hour: default_midday_break_hour(),
            midday_break_secs: default_midday_break_secs(),
        }
    }
}

impl CalendarConfig {
    pub fn build(&self) -> Result<WorkCalendar, String> {
        WorkCalendar::new(
            self.start_hour,
            self.end_hour,
            self.morning_break_hour,
            self.morning_break_secs,
            self.midday_break_hour,
            self.midday_break_secs,
        )
        .map_err(|err| format!("Invalid calendar config: {}", err))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
}

/// Load the runtime config from `path`, or the default location when absent.
/// A missing file yields defaults; a present-but-malformed file is an error
/// so the caller can decide to warn and fall back.
pub fn load_runtime_config(path: Option<&Path>) -> Result<RuntimeConfig, String> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !path.exists() {
        return Ok(RuntimeConfig::default());
    }

    let raw = fs_err::read_to_string(&path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    toml::from_str(&raw).map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))
}

fn default_config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

fn default_warmup_threshold_secs() -> i64 {
    16 * 60
}

fn default_parts_per_cycle() -> i64 {
    1
}

fn default_refresh_interval_secs() -> u64 {
    10
}

fn default_cursor_ttl_secs() -> i64 {
    180
}

fn default_shift_start_hour() -> u32 {
    7
}

fn default_shift_end_hour() -> u32 {
    16
}

fn default_morning_break_hour() -> u32 {
    9
}

fn default_morning_break_secs() -> i64 {
    15 * 60
}

fn default_midday_break_hour() -> u32 {
    12
}

fn default_midday_break_secs() -> i64 {
    45 * 60
}
