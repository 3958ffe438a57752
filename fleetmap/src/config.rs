//! INI configuration file.
//!
//! ```ini
//! [runtime]
//! init_timeout_ms = 10000
//! layer_mount_timeout_ms = 5000
//! flush_timeout_ms = 2000
//! history_capacity = 64
//! frame_interval_ms = 50
//!
//! [queue]
//! max_len = 100
//!
//! [telemetry]
//! fast_debounce_ms = 100
//! topology_debounce_ms = 2000
//! teleport_threshold_m = 2000
//! smoothing_duration_ms = 1000
//! frame_interval_ms = 50
//! persist = true
//!
//! [store]
//! dir = ~/.local/share/fleetmap/store
//! max_tiles = 5000
//! tile_max_age_secs = 604800
//! analytics_ttl_secs = 3600
//!
//! [sync]
//! base_url = http://localhost:8080
//! periodic_interval_secs = 300
//! max_attempts = 0
//! initial_backoff_ms = 1000
//! max_backoff_ms = 300000
//! request_timeout_secs = 30
//!
//! [simulation]
//! tick_ms = 1000
//! time_scale = 1
//! dwell_secs = 30
//! trail_length = 50
//! seed = 42
//! event_rate = 0.002
//! completion = loop
//!
//! [logging]
//! dir = ~/.local/share/fleetmap/logs
//! level = info
//! stderr = false
//! ```
//!
//! A missing file or key falls back to the defaults. Values that do not
//! parse are an error naming the section and key.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::logging::LoggingConfig;
use crate::runtime::{PhaseTimeouts, RuntimeConfig, DEFAULT_FRAME_INTERVAL, DEFAULT_HISTORY_CAPACITY};
use crate::layers::DEFAULT_MAX_QUEUE_LEN;
use crate::simulation::{RouteCompletion, SimulationConfig};
use crate::store::StoreConfig;
use crate::sync::{RetryPolicy, SyncConfig};
use crate::telemetry::{
    SmoothingConfig, TelemetrySourceConfig, DEFAULT_SMOOTHING_DURATION,
    DEFAULT_TELEPORT_THRESHOLD_M, FAST_DEBOUNCE, TOPOLOGY_DEBOUNCE,
};

/// Application directory name under the platform config/data dirs.
pub const APP_DIR: &str = "fleetmap";

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "config.ini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("Invalid value {value:?} for {section}.{key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),
}

/// Platform config directory for the application.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Platform data directory for the store and logs.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Default location of the config file.
pub fn config_file_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

// =============================================================================
// Section types not owned by other modules
// =============================================================================

/// Layer queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_QUEUE_LEN,
        }
    }
}

impl QueueConfig {
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }
}

/// Telemetry defaults applied to every source.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub fast_debounce: Duration,
    pub topology_debounce: Duration,
    pub teleport_threshold_m: f64,
    pub smoothing_duration: Duration,
    pub frame_interval: Duration,
    pub persist: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            fast_debounce: FAST_DEBOUNCE,
            topology_debounce: TOPOLOGY_DEBOUNCE,
            teleport_threshold_m: DEFAULT_TELEPORT_THRESHOLD_M,
            smoothing_duration: DEFAULT_SMOOTHING_DURATION,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            persist: true,
        }
    }
}

impl TelemetryConfig {
    pub fn with_fast_debounce(mut self, debounce: Duration) -> Self {
        self.fast_debounce = debounce;
        self
    }

    pub fn with_topology_debounce(mut self, debounce: Duration) -> Self {
        self.topology_debounce = debounce;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn smoothing(&self) -> SmoothingConfig {
        SmoothingConfig {
            duration: self.smoothing_duration,
            teleport_threshold_m: self.teleport_threshold_m,
        }
    }

    /// Source settings for fast-moving entities.
    pub fn fast_source(&self, id: impl Into<String>) -> TelemetrySourceConfig {
        TelemetrySourceConfig::fast(id)
            .with_debounce(self.fast_debounce)
            .with_smoothing(Some(self.smoothing()))
            .with_frame_interval(self.frame_interval)
            .with_persist(self.persist)
    }

    /// Source settings for near-static entities.
    pub fn topology_source(&self, id: impl Into<String>) -> TelemetrySourceConfig {
        TelemetrySourceConfig::topology(id)
            .with_debounce(self.topology_debounce)
            .with_frame_interval(self.frame_interval)
            .with_persist(self.persist)
    }
}

// =============================================================================
// Config file
// =============================================================================

/// Everything in `config.ini`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub timeouts: PhaseTimeouts,
    pub history_capacity: usize,
    pub frame_interval: Duration,
    pub queue: QueueConfig,
    pub telemetry: TelemetryConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            timeouts: PhaseTimeouts::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            queue: QueueConfig::default(),
            telemetry: TelemetryConfig::default(),
            store: StoreConfig::default().with_dir(data_dir().join("store")),
            sync: SyncConfig::default(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path).map_err(|e| match e {
            ini::Error::Io(e) => ConfigError::Io(e),
            ini::Error::Parse(e) => ConfigError::Parse(e.to_string()),
        })?;
        Self::from_ini(&ini)
    }

    /// Write to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.to_ini().write_to_file(path)?;
        Ok(())
    }

    /// Runtime settings with the queue section applied.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::default()
            .with_timeouts(self.timeouts)
            .with_history_capacity(self.history_capacity)
            .with_max_queue_len(self.queue.max_len)
            .with_frame_interval(self.frame_interval)
    }

    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let d = Self::default();
        let r = Reader(ini);

        let timeouts = PhaseTimeouts {
            init: r.millis("runtime", "init_timeout_ms")?.unwrap_or(d.timeouts.init),
            layer_mount: r
                .millis("runtime", "layer_mount_timeout_ms")?
                .unwrap_or(d.timeouts.layer_mount),
            flush: r.millis("runtime", "flush_timeout_ms")?.unwrap_or(d.timeouts.flush),
        };

        let telemetry = TelemetryConfig {
            fast_debounce: r
                .millis("telemetry", "fast_debounce_ms")?
                .unwrap_or(d.telemetry.fast_debounce),
            topology_debounce: r
                .millis("telemetry", "topology_debounce_ms")?
                .unwrap_or(d.telemetry.topology_debounce),
            teleport_threshold_m: r
                .value("telemetry", "teleport_threshold_m")?
                .unwrap_or(d.telemetry.teleport_threshold_m),
            smoothing_duration: r
                .millis("telemetry", "smoothing_duration_ms")?
                .unwrap_or(d.telemetry.smoothing_duration),
            frame_interval: r
                .millis("telemetry", "frame_interval_ms")?
                .unwrap_or(d.telemetry.frame_interval),
            persist: r.flag("telemetry", "persist")?.unwrap_or(d.telemetry.persist),
        };

        let mut store = d.store.clone();
        if let Some(dir) = r.path("store", "dir") {
            store.dir = Some(dir);
        }
        store.max_tiles = r.value("store", "max_tiles")?.unwrap_or(store.max_tiles);
        store.tile_max_age_secs = r
            .value("store", "tile_max_age_secs")?
            .unwrap_or(store.tile_max_age_secs);
        store.analytics_ttl_secs = r
            .value("store", "analytics_ttl_secs")?
            .unwrap_or(store.analytics_ttl_secs);

        let retry = RetryPolicy::default()
            .with_initial_delay(
                r.millis("sync", "initial_backoff_ms")?
                    .unwrap_or(d.sync.retry.initial_delay),
            )
            .with_max_delay(r.millis("sync", "max_backoff_ms")?.unwrap_or(d.sync.retry.max_delay))
            .with_max_attempts(r.value("sync", "max_attempts")?.unwrap_or(0));
        let sync = SyncConfig::default()
            .with_base_url(r.string("sync", "base_url").unwrap_or(d.sync.base_url))
            .with_periodic_interval(
                r.secs("sync", "periodic_interval_secs")?
                    .unwrap_or(d.sync.periodic_interval),
            )
            .with_request_timeout(
                r.secs("sync", "request_timeout_secs")?
                    .unwrap_or(d.sync.request_timeout),
            )
            .with_retry(retry);

        let sim = &d.simulation;
        let simulation = SimulationConfig::default()
            .with_tick(r.millis("simulation", "tick_ms")?.unwrap_or(sim.tick))
            .with_time_scale(r.value("simulation", "time_scale")?.unwrap_or(sim.time_scale))
            .with_dwell(r.secs("simulation", "dwell_secs")?.unwrap_or(sim.dwell))
            .with_trail_length(r.value("simulation", "trail_length")?.unwrap_or(sim.trail_length))
            .with_seed(r.value("simulation", "seed")?.unwrap_or(sim.seed))
            .with_event_rate(
                r.value("simulation", "event_rate")?
                    .unwrap_or(sim.event_rate_per_sec),
            )
            .with_completion(r.value("simulation", "completion")?.unwrap_or(sim.completion));

        let logging = LoggingConfig {
            dir: r.path("logging", "dir").unwrap_or(d.logging.dir),
            level: r.string("logging", "level").unwrap_or(d.logging.level),
            stderr: r.flag("logging", "stderr")?.unwrap_or(d.logging.stderr),
        };

        Ok(Self {
            timeouts,
            history_capacity: r
                .value("runtime", "history_capacity")?
                .unwrap_or(d.history_capacity),
            frame_interval: r
                .millis("runtime", "frame_interval_ms")?
                .unwrap_or(d.frame_interval),
            queue: QueueConfig::default()
                .with_max_len(r.value("queue", "max_len")?.unwrap_or(d.queue.max_len)),
            telemetry,
            store,
            sync,
            simulation,
            logging,
        })
    }

    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        let ms = |d: Duration| d.as_millis().to_string();

        ini.with_section(Some("runtime"))
            .set("init_timeout_ms", ms(self.timeouts.init))
            .set("layer_mount_timeout_ms", ms(self.timeouts.layer_mount))
            .set("flush_timeout_ms", ms(self.timeouts.flush))
            .set("history_capacity", self.history_capacity.to_string())
            .set("frame_interval_ms", ms(self.frame_interval));

        ini.with_section(Some("queue"))
            .set("max_len", self.queue.max_len.to_string());

        let t = &self.telemetry;
        ini.with_section(Some("telemetry"))
            .set("fast_debounce_ms", ms(t.fast_debounce))
            .set("topology_debounce_ms", ms(t.topology_debounce))
            .set("teleport_threshold_m", t.teleport_threshold_m.to_string())
            .set("smoothing_duration_ms", ms(t.smoothing_duration))
            .set("frame_interval_ms", ms(t.frame_interval))
            .set("persist", t.persist.to_string());

        let s = &self.store;
        ini.with_section(Some("store"))
            .set(
                "dir",
                s.dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
            )
            .set("max_tiles", s.max_tiles.to_string())
            .set("tile_max_age_secs", s.tile_max_age_secs.to_string())
            .set("analytics_ttl_secs", s.analytics_ttl_secs.to_string());

        let y = &self.sync;
        ini.with_section(Some("sync"))
            .set("base_url", y.base_url.clone())
            .set("periodic_interval_secs", y.periodic_interval.as_secs().to_string())
            .set("max_attempts", y.retry.max_attempts.unwrap_or(0).to_string())
            .set("initial_backoff_ms", ms(y.retry.initial_delay))
            .set("max_backoff_ms", ms(y.retry.max_delay))
            .set("request_timeout_secs", y.request_timeout.as_secs().to_string());

        let m = &self.simulation;
        ini.with_section(Some("simulation"))
            .set("tick_ms", ms(m.tick))
            .set("time_scale", m.time_scale.to_string())
            .set("dwell_secs", m.dwell.as_secs().to_string())
            .set("trail_length", m.trail_length.to_string())
            .set("seed", m.seed.to_string())
            .set("event_rate", m.event_rate_per_sec.to_string())
            .set("completion", m.completion.to_string());

        let l = &self.logging;
        ini.with_section(Some("logging"))
            .set("dir", l.dir.display().to_string())
            .set("level", l.level.clone())
            .set("stderr", l.stderr.to_string());

        ini
    }
}

/// Typed lookups with section/key-aware errors.
struct Reader<'a>(&'a Ini);

impl Reader<'_> {
    fn raw(&self, section: &str, key: &str) -> Option<&str> {
        self.0
            .get_from(Some(section), key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn string(&self, section: &str, key: &str) -> Option<String> {
        self.raw(section, key).map(str::to_string)
    }

    fn path(&self, section: &str, key: &str) -> Option<PathBuf> {
        self.raw(section, key).map(expand_home)
    }

    fn value<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
        self.raw(section, key)
            .map(|v| v.parse::<T>().map_err(|_| invalid(section, key, v)))
            .transpose()
    }

    fn millis(&self, section: &str, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.value::<u64>(section, key)?.map(Duration::from_millis))
    }

    fn secs(&self, section: &str, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.value::<u64>(section, key)?.map(Duration::from_secs))
    }

    fn flag(&self, section: &str, key: &str) -> Result<Option<bool>, ConfigError> {
        self.raw(section, key)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(invalid(section, key, v)),
            })
            .transpose()
    }
}

fn invalid(section: &str, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

// =============================================================================
// Keys for `config get` / `config set`
// =============================================================================

const KEYS: &[(&str, &str)] = &[
    ("runtime", "init_timeout_ms"),
    ("runtime", "layer_mount_timeout_ms"),
    ("runtime", "flush_timeout_ms"),
    ("runtime", "history_capacity"),
    ("runtime", "frame_interval_ms"),
    ("queue", "max_len"),
    ("telemetry", "fast_debounce_ms"),
    ("telemetry", "topology_debounce_ms"),
    ("telemetry", "teleport_threshold_m"),
    ("telemetry", "smoothing_duration_ms"),
    ("telemetry", "frame_interval_ms"),
    ("telemetry", "persist"),
    ("store", "dir"),
    ("store", "max_tiles"),
    ("store", "tile_max_age_secs"),
    ("store", "analytics_ttl_secs"),
    ("sync", "base_url"),
    ("sync", "periodic_interval_secs"),
    ("sync", "max_attempts"),
    ("sync", "initial_backoff_ms"),
    ("sync", "max_backoff_ms"),
    ("sync", "request_timeout_secs"),
    ("simulation", "tick_ms"),
    ("simulation", "time_scale"),
    ("simulation", "dwell_secs"),
    ("simulation", "trail_length"),
    ("simulation", "seed"),
    ("simulation", "event_rate"),
    ("simulation", "completion"),
    ("logging", "dir"),
    ("logging", "level"),
    ("logging", "stderr"),
];

/// A `section.key` name from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigKey {
    section: &'static str,
    key: &'static str,
}

impl ConfigKey {
    pub fn all() -> impl Iterator<Item = ConfigKey> {
        KEYS.iter().map(|&(section, key)| ConfigKey { section, key })
    }

    pub fn section(&self) -> &'static str {
        self.section
    }

    pub fn key_name(&self) -> &'static str {
        self.key
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.section, self.key)
    }

    pub fn get(&self, config: &ConfigFile) -> String {
        config
            .to_ini()
            .get_from(Some(self.section), self.key)
            .unwrap_or_default()
            .to_string()
    }

    /// Set a value, validating it by re-reading the whole file.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        let mut ini = config.to_ini();
        ini.with_section(Some(self.section)).set(self.key, value.trim());
        *config = ConfigFile::from_ini(&ini)?;
        Ok(())
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.key)
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (section, key) = s
            .split_once('.')
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))?;
        ConfigKey::all()
            .find(|k| k.section == section && k.key == key)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ConfigFile::load_from(&temp.path().join("absent.ini")).unwrap();
        assert_eq!(config.queue.max_len, DEFAULT_MAX_QUEUE_LEN);
        assert_eq!(config.timeouts, PhaseTimeouts::default());
        assert_eq!(config.sync.retry, RetryPolicy::default());
    }

    #[test]
    fn test_partial_file_overrides_only_given_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[runtime]\ninit_timeout_ms = 2500\n\n[queue]\nmax_len = 7\n\n\
             [sync]\nmax_attempts = 5\nbase_url = https://api.example.com\n\n\
             [simulation]\ncompletion = stop\n\n[store]\ndir = /var/lib/fleetmap"
        )
        .unwrap();

        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.timeouts.init, Duration::from_millis(2500));
        assert_eq!(config.timeouts.flush, PhaseTimeouts::default().flush);
        assert_eq!(config.runtime_config().max_queue_len, 7);
        assert_eq!(config.sync.retry.max_attempts, Some(5));
        assert_eq!(config.sync.base_url, "https://api.example.com");
        assert_eq!(config.simulation.completion, RouteCompletion::Stop);
        assert_eq!(config.store.dir, Some(PathBuf::from("/var/lib/fleetmap")));
    }

    #[test]
    fn test_malformed_number_names_section_and_key() {
        let mut ini = Ini::new();
        ini.with_section(Some("telemetry")).set("fast_debounce_ms", "soon");
        match ConfigFile::from_ini(&ini) {
            Err(ConfigError::InvalidValue {
                section,
                key,
                value,
            }) => {
                assert_eq!(section, "telemetry");
                assert_eq!(key, "fast_debounce_ms");
                assert_eq!(value, "soon");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_save_then_load_preserves_settings() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.ini");
        let mut config = ConfigFile::default();
        config.telemetry = config.telemetry.with_persist(false);
        config.simulation = config.simulation.with_seed(7);
        config.save_to(&path).unwrap();

        let loaded = ConfigFile::load_from(&path).unwrap();
        assert!(!loaded.telemetry.persist);
        assert_eq!(loaded.simulation.seed, 7);
        assert_eq!(loaded.store.dir, config.store.dir);
    }

    #[test]
    fn test_config_key_get_and_set() {
        let mut config = ConfigFile::default();
        let key: ConfigKey = "queue.max_len".parse().unwrap();
        assert_eq!(key.get(&config), "100");

        key.set(&mut config, "250").unwrap();
        assert_eq!(config.queue.max_len, 250);
        assert!(key.set(&mut config, "lots").is_err());
        assert_eq!(config.queue.max_len, 250);

        assert!("queue.nope".parse::<ConfigKey>().is_err());
        assert!("nodot".parse::<ConfigKey>().is_err());
    }

    #[test]
    fn test_telemetry_source_presets() {
        let telemetry = TelemetryConfig::default().with_fast_debounce(Duration::from_millis(250));
        let fast = telemetry.fast_source("vehicles");
        assert_eq!(fast.debounce, Duration::from_millis(250));
        assert!(fast.smoothing.is_some());
        assert!(telemetry.topology_source("facilities").smoothing.is_none());
    }
}
