use log::{LevelFilter, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use crate::render::{
    DEFAULT_CACHE_SIZE, DEFAULT_SHUTDOWN_TIMEOUT, QueueOrder, RenderConfig, WorkerMode,
};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pdfcutter";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Rendered bitmaps kept in memory
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default)]
    pub queue_order: QueueOrder,

    /// Minimum time a bitmap stays cached, 0 disables the guard
    #[serde(default)]
    pub keep_time_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Render on a background thread. Off renders on the caller's thread.
    #[serde(default = "default_true")]
    pub threaded: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            cache_capacity: default_cache_capacity(),
            queue_order: QueueOrder::default(),
            keep_time_ms: 0,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            threaded: true,
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            cache_capacity: self.cache_capacity,
            queue_order: self.queue_order,
            keep_time: (self.keep_time_ms > 0).then(|| Duration::from_millis(self.keep_time_ms)),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            mode: if self.threaded {
                WorkerMode::Threaded
            } else {
                WorkerMode::Inline
            },
        }
    }

    /// Configured log level, `Info` when unparsable
    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level {:?}, using info", self.log_level);
            LevelFilter::Info
        })
    }
}

static SETTINGS: LazyLock<RwLock<Settings>> = LazyLock::new(|| RwLock::new(Settings::default()));

pub fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

pub fn load_settings() {
    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, using default settings");
        return;
    };
    if path.exists() {
        load_settings_from(&path);
    } else {
        info!("Settings file not found, creating with defaults at {path:?}");
        if let Ok(settings) = SETTINGS.read() {
            save_settings_to_file(&settings, &path);
        }
    }
}

/// Replace the global settings with the contents of `path`.
///
/// Unreadable or malformed files are logged and leave the current settings
/// in place.
pub fn load_settings_from(path: &Path) {
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");

                if settings.version < CURRENT_VERSION {
                    migrate_settings(&mut settings);
                    save_settings_to_file(&settings, path);
                }

                if let Ok(mut global) = SETTINGS.write() {
                    *global = settings;
                }
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
            }
        },
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    settings.version = CURRENT_VERSION;
}

fn save_settings_to_file(settings: &Settings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    let content = generate_settings_yaml(settings);

    match fs::write(path, content) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

fn generate_settings_yaml(settings: &Settings) -> String {
    let mut content = String::new();

    content.push_str(&format!("version: {}\n", settings.version));
    content.push('\n');
    content.push_str("# Number of rendered pages and boxes kept in memory\n");
    content.push_str(&format!("cache_capacity: {}\n", settings.cache_capacity));
    content.push_str("# Which queued render runs first: lifo (newest) or fifo (oldest)\n");
    let order_str = match settings.queue_order {
        QueueOrder::Lifo => "lifo",
        QueueOrder::Fifo => "fifo",
    };
    content.push_str(&format!("queue_order: {order_str}\n"));
    content.push_str("# Milliseconds a bitmap is protected from eviction, 0 disables\n");
    content.push_str(&format!("keep_time_ms: {}\n", settings.keep_time_ms));
    content.push_str(&format!(
        "shutdown_timeout_ms: {}\n",
        settings.shutdown_timeout_ms
    ));
    content.push_str("# false renders on the calling thread (debugging)\n");
    content.push_str(&format!("threaded: {}\n", settings.threaded));
    content.push_str(&format!("log_level: \"{}\"\n", settings.log_level));

    content
}

// Public API for accessing/modifying settings

#[must_use]
pub fn current() -> Settings {
    SETTINGS.read().map(|s| s.clone()).unwrap_or_default()
}

#[must_use]
pub fn render_config() -> RenderConfig {
    SETTINGS
        .read()
        .map(|s| s.render_config())
        .unwrap_or_default()
}

#[must_use]
pub fn get_cache_capacity() -> usize {
    SETTINGS
        .read()
        .map(|s| s.cache_capacity)
        .unwrap_or(DEFAULT_CACHE_SIZE)
}

#[must_use]
pub fn is_threaded() -> bool {
    SETTINGS.read().map(|s| s.threaded).unwrap_or(true)
}

#[must_use]
pub fn get_log_level() -> LevelFilter {
    SETTINGS
        .read()
        .map(|s| s.log_level())
        .unwrap_or(LevelFilter::Info)
}
