//! Layered configuration: defaults, optional TOML file, then environment.
//!
//! Environment variables use the `MEDIA_WINDOW` prefix with `__` between
//! section and key, e.g. `MEDIA_WINDOW__CACHE__CAPACITY=30`.

use crate::error::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "MEDIA_WINDOW";

/// Device class, used to size caches and windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    /// Phones and other memory-constrained devices.
    Constrained,
}

/// Observed connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Fast,
    #[default]
    Normal,
    Slow,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub catalog: CatalogSettings,
    pub cache: CacheSettings,
    pub preload: PreloadSettings,
    pub navigation: NavigationSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub url: String,
    /// Value of the `session_id` cookie. Generated when absent.
    pub session_id: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".into(),
            session_id: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub page_size: usize,
    /// Ask the server to shuffle; `None` leaves the server default.
    pub shuffle: Option<bool>,
    pub indexing_poll_ms: u64,
    /// Upper bound on pages walked while resolving a forced order.
    pub max_forced_order_pages: u32,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            page_size: 10,
            shuffle: None,
            indexing_poll_ms: 1000,
            max_forced_order_pages: 200,
        }
    }
}

impl CatalogSettings {
    pub fn indexing_poll_interval(&self) -> Duration {
        Duration::from_millis(self.indexing_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: usize,
    pub constrained_capacity: usize,
    pub cleanup_interval_secs: u64,
    pub constrained_cleanup_interval_secs: u64,
    /// External device-memory hint in GB.
    pub device_memory_gb: Option<f32>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 50,
            constrained_capacity: 20,
            cleanup_interval_secs: 60,
            constrained_cleanup_interval_secs: 30,
            device_memory_gb: None,
        }
    }
}

impl CacheSettings {
    /// Capacity for the given device, further capped by the memory hint.
    pub fn capacity_for(&self, device: DeviceClass) -> usize {
        let base = match device {
            DeviceClass::Desktop => self.capacity,
            DeviceClass::Constrained => self.constrained_capacity.min(self.capacity),
        };
        let capped = match self.device_memory_gb {
            Some(gb) if gb <= 1.0 => base.min(5),
            Some(gb) if gb <= 2.0 => base.min(10),
            Some(gb) if gb <= 4.0 => base.min(20),
            _ => base,
        };
        capped.max(1)
    }

    pub fn cleanup_interval_for(&self, device: DeviceClass) -> Duration {
        let secs = match device {
            DeviceClass::Desktop => self.cleanup_interval_secs,
            DeviceClass::Constrained => self.constrained_cleanup_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadSettings {
    pub timeout_ms: u64,
    /// Neighbourhood preloaded around the current index, clamped to 1..=2.
    pub radius: usize,
}

impl Default for PreloadSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            radius: 2,
        }
    }
}

impl PreloadSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn effective_radius(&self) -> usize {
        self.radius.clamp(1, 2)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NavigationSettings {
    pub window_radius: usize,
    pub prefetch_threshold: usize,
    pub device: DeviceClass,
    pub connection: ConnectionQuality,
    pub start_category: Option<String>,
    pub fallback_thumbnail: String,
}

impl Default for NavigationSettings {
    fn default() -> Self {
        Self {
            window_radius: 0,
            prefetch_threshold: 3,
            device: DeviceClass::Desktop,
            connection: ConnectionQuality::Normal,
            start_category: None,
            fallback_thumbnail: "/static/icons/Ghosthub192.png".into(),
        }
    }
}

impl NavigationSettings {
    /// Window half-width for the current device and connection.
    pub fn effective_window_radius(&self) -> usize {
        const MIN_WINDOW_RADIUS: usize = 0;
        match (self.device, self.connection) {
            (DeviceClass::Constrained, _) | (_, ConnectionQuality::Slow) => MIN_WINDOW_RADIUS,
            (DeviceClass::Desktop, ConnectionQuality::Fast) => self.window_radius + 1,
            _ => self.window_radius,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Socket.IO endpoint path on the server.
    pub channel_path: String,
    pub reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_max_ms: u64,
    pub heartbeat_secs: u64,
    /// Include the full media order on every Nth emission.
    pub order_resync_every: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            channel_path: "/socket.io/".into(),
            reconnect_attempts: 10,
            reconnect_base_ms: 1000,
            reconnect_factor: 1.5,
            reconnect_max_ms: 30_000,
            heartbeat_secs: 25,
            order_resync_every: 10,
        }
    }
}

impl SyncSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Settings {
    /// Load settings from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        } else {
            builder = builder.add_source(config::File::with_name("media-window").required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let settings = Settings::default();
        assert_eq!(settings.catalog.page_size, 10);
        assert_eq!(settings.cache.capacity, 50);
        assert_eq!(settings.preload.timeout(), Duration::from_secs(5));
        assert_eq!(settings.sync.reconnect_attempts, 10);
        assert_eq!(settings.navigation.effective_window_radius(), 0);
    }

    #[test]
    fn capacity_shrinks_on_constrained_devices() {
        let mut cache = CacheSettings::default();
        assert_eq!(cache.capacity_for(DeviceClass::Desktop), 50);
        assert_eq!(cache.capacity_for(DeviceClass::Constrained), 20);
        cache.device_memory_gb = Some(2.0);
        assert_eq!(cache.capacity_for(DeviceClass::Desktop), 10);
        cache.device_memory_gb = Some(0.5);
        assert_eq!(cache.capacity_for(DeviceClass::Constrained), 5);
    }

    #[test]
    fn window_radius_follows_connection() {
        let mut nav = NavigationSettings {
            window_radius: 1,
            ..Default::default()
        };
        assert_eq!(nav.effective_window_radius(), 1);
        nav.connection = ConnectionQuality::Fast;
        assert_eq!(nav.effective_window_radius(), 2);
        nav.device = DeviceClass::Constrained;
        assert_eq!(nav.effective_window_radius(), 0);
    }

    #[test]
    fn preload_radius_is_clamped() {
        let preload = PreloadSettings {
            radius: 9,
            ..Default::default()
        };
        assert_eq!(preload.effective_radius(), 2);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let settings = Settings::load(Some(Path::new("/nonexistent/media-window.toml"))).unwrap();
        assert_eq!(settings.catalog.page_size, 10);
    }
}
