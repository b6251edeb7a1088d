//! Application configuration
//!
//! Loaded from TOML. Every field has a default, so an empty or missing file
//! gives a working relay on the standard ports.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::ChannelId;
use crate::constants::*;
use crate::dispatch::{LaneConfig, RouteTarget, RoutingTable};
use crate::error::{Error, Result};
use crate::signal::DetectionParams;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub detection: DetectionConfig,
    pub ingest: IngestConfig,
    pub dispatch: DispatchConfig,
    pub routing: RoutingConfig,
    pub api: ApiConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub ingest_port: u16,
    /// Let several processes share the ingest port
    pub reuse_port: bool,
    pub recv_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            ingest_port: DEFAULT_INGEST_PORT,
            reuse_port: true,
            recv_buffer_size: 256 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        resolve(&format!("{}:{}", self.bind_address, self.ingest_port))
    }
}

/// Detection tunables, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub moving_average_window: usize,
    pub baseline_decay_rate: f64,
    pub baseline_decay_interval: u32,
    pub threshold_fraction: f64,
    pub min_signal_range: f64,
    pub disconnect_timeout_ms: u64,
    pub refractory_period_ms: u64,
    pub gap_threshold_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let p = DetectionParams::default();
        Self {
            moving_average_window: p.moving_average_window,
            baseline_decay_rate: p.baseline_decay_rate,
            baseline_decay_interval: p.baseline_decay_interval,
            threshold_fraction: p.threshold_fraction,
            min_signal_range: p.min_signal_range,
            disconnect_timeout_ms: p.disconnect_timeout.as_millis() as u64,
            refractory_period_ms: p.refractory_period.as_millis() as u64,
            gap_threshold_ms: p.gap_threshold.as_millis() as u64,
        }
    }
}

impl DetectionConfig {
    pub fn params(&self) -> DetectionParams {
        DetectionParams {
            moving_average_window: self.moving_average_window,
            baseline_decay_rate: self.baseline_decay_rate,
            baseline_decay_interval: self.baseline_decay_interval,
            threshold_fraction: self.threshold_fraction,
            min_signal_range: self.min_signal_range,
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
            refractory_period: Duration::from_millis(self.refractory_period_ms),
            gap_threshold: Duration::from_millis(self.gap_threshold_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub bundle_size: usize,
    pub sample_rate_hz: u32,
    pub adc_max: i32,
    /// Per-channel worker queue, in batches
    pub channel_queue: usize,
    /// Upstream beats older than this are rejected at decode
    pub freshness_window_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bundle_size: DEFAULT_BUNDLE_SIZE,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            adc_max: ADC_MAX,
            channel_queue: DEFAULT_CHANNEL_QUEUE,
            freshness_window_ms: FRESHNESS_WINDOW_MS,
        }
    }
}

/// Sink behind a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Udp,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneSettings {
    pub name: String,
    pub sink: SinkKind,
    /// `host:port` for UDP sinks
    pub target: Option<String>,
    pub broadcast: bool,
    pub capacity: usize,
    pub banks: Option<Vec<u8>>,
    pub freshness_window_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self {
            name: "log".into(),
            sink: SinkKind::Log,
            target: None,
            broadcast: false,
            capacity: DEFAULT_LANE_CAPACITY,
            banks: None,
            freshness_window_ms: FRESHNESS_WINDOW_MS,
            max_consecutive_failures: 10,
        }
    }
}

impl LaneSettings {
    fn udp(name: &str, port: u16) -> Self {
        Self {
            name: name.into(),
            sink: SinkKind::Udp,
            target: Some(format!("127.0.0.1:{port}")),
            ..Default::default()
        }
    }

    pub fn lane_config(&self) -> LaneConfig {
        LaneConfig {
            name: self.name.clone(),
            capacity: self.capacity,
            banks: self.banks.clone(),
            freshness_window: Duration::from_millis(self.freshness_window_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    /// Resolved UDP target
    pub fn target_addr(&self) -> Result<SocketAddr> {
        let target = self
            .target
            .as_deref()
            .ok_or_else(|| Error::Config(format!("lane '{}' needs a target", self.name)))?;
        resolve(target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub shutdown_grace_ms: u64,
    /// Seconds between periodic statistics logs; 0 disables them
    pub stats_interval_secs: u64,
    pub lanes: Vec<LaneSettings>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 500,
            stats_interval_secs: 30,
            lanes: vec![
                LaneSettings::udp("sound", DEFAULT_AUDIO_PORT),
                LaneSettings::udp("lighting", DEFAULT_LIGHTING_PORT),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteSettings {
    pub channel: u8,
    pub bank: u8,
    pub pan: f32,
}

/// Overrides on top of the default per-sensor routing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Channels left without a route
    pub unrouted: Vec<u8>,
    pub routes: Vec<RouteSettings>,
}

impl RoutingConfig {
    pub fn table(&self) -> Result<RoutingTable> {
        let mut table = RoutingTable::with_default_pans();
        for r in &self.routes {
            let channel = channel_id(r.channel)?;
            table = table
                .with_route(channel, RouteTarget { bank: r.bank, pan: r.pan })
                .map_err(|e| Error::Config(e.to_string()))?;
        }
        for id in &self.unrouted {
            table = table.without_route(channel_id(*id)?);
        }
        Ok(table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".into(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl ApiConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        resolve(&format!("{}:{}", self.bind_address, self.http_port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub queue: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("data"),
            queue: 1024,
        }
    }
}

impl AppConfig {
    /// Default location: `<platform config dir>/pulse-relay/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pulse-relay").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                return Err(Error::Config(format!("{} not found", path.display())));
            }
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        if d.moving_average_window == 0 {
            return Err(Error::Config("moving_average_window must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&d.baseline_decay_rate) {
            return Err(Error::Config("baseline_decay_rate must be within [0, 1]".into()));
        }
        if d.baseline_decay_interval == 0 {
            return Err(Error::Config("baseline_decay_interval must be at least 1".into()));
        }
        if !(d.threshold_fraction > 0.0 && d.threshold_fraction < 1.0) {
            return Err(Error::Config("threshold_fraction must be within (0, 1)".into()));
        }
        if d.min_signal_range < 0.0 {
            return Err(Error::Config("min_signal_range must not be negative".into()));
        }
        if d.gap_threshold_ms == 0 {
            return Err(Error::Config("gap_threshold_ms must be positive".into()));
        }

        let i = &self.ingest;
        if i.bundle_size == 0 || i.bundle_size > u8::MAX as usize {
            return Err(Error::Config("bundle_size must be within 1..=255".into()));
        }
        if i.sample_rate_hz == 0 {
            return Err(Error::Config("sample_rate_hz must be positive".into()));
        }
        if i.adc_max <= 0 {
            return Err(Error::Config("adc_max must be positive".into()));
        }
        if i.channel_queue == 0 {
            return Err(Error::Config("channel_queue must be at least 1".into()));
        }

        let mut names = std::collections::HashSet::new();
        for lane in &self.dispatch.lanes {
            if !names.insert(lane.name.as_str()) {
                return Err(Error::Config(format!("duplicate lane name '{}'", lane.name)));
            }
            if lane.capacity == 0 {
                return Err(Error::Config(format!("lane '{}' capacity must be at least 1", lane.name)));
            }
            if lane.sink == SinkKind::Udp {
                lane.target_addr()?;
            }
        }

        self.routing.table()?;
        Ok(())
    }
}

fn channel_id(id: u8) -> Result<ChannelId> {
    ChannelId::new(id).ok_or_else(|| Error::Config(format!("channel {id} out of range")))
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| Error::Config(format!("{addr}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("{addr}: no address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.ingest_port, 8000);
        assert_eq!(config.dispatch.lanes.len(), 2);
        assert_eq!(config.detection.params(), DetectionParams::default());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [detection]
            refractory_period_ms = 250

            [[dispatch.lanes]]
            name = "console"
            sink = "log"
            banks = [0, 1]
            "#,
        )
        .unwrap();
        assert_eq!(config.detection.params().refractory_period, Duration::from_millis(250));
        assert_eq!(config.detection.threshold_fraction, 0.6);
        assert_eq!(config.dispatch.lanes.len(), 1);
        assert_eq!(config.dispatch.lanes[0].lane_config().banks, Some(vec![0, 1]));
        assert_eq!(config.ingest.bundle_size, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for text in [
            "[detection]\nthreshold_fraction = 1.5",
            "[detection]\nmoving_average_window = 0",
            "[ingest]\nbundle_size = 0",
            "[[routing.routes]]\nchannel = 9\nbank = 0\npan = 0.0",
            "[[routing.routes]]\nchannel = 1\nbank = 0\npan = 3.0",
            "[[dispatch.lanes]]\nname = \"a\"\nsink = \"udp\"",
        ] {
            assert!(
                matches!(AppConfig::from_toml(text), Err(Error::Config(_))),
                "accepted: {text}"
            );
        }
    }

    #[test]
    fn test_routing_overrides() {
        let config = AppConfig::from_toml(
            "[routing]\nunrouted = [7]\n[[routing.routes]]\nchannel = 5\nbank = 9\npan = 0.0",
        )
        .unwrap();
        let table = config.routing.table().unwrap();
        assert_eq!(table.get(ChannelId::new(5).unwrap()), Some(RouteTarget { bank: 9, pan: 0.0 }));
        assert!(table.get(ChannelId::new(7).unwrap()).is_none());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());

        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[api]\nenabled = false\n").unwrap();
        assert!(!AppConfig::load(Some(&path)).unwrap().api.enabled);
    }
}
