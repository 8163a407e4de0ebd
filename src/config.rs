use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9157;

/// Upper bound for `window` and `interval`, in seconds (one day).
pub const MAX_DURATION_SECS: u64 = 86_400;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Wireless interfaces to measure (e.g. wlan0)
    pub interfaces: Vec<String>,
    /// Query port; probes use `port + 1`
    pub port: u16,
    /// Nominal probe period in seconds
    pub interval: u64,
    /// Statistics retention horizon in seconds
    pub window: u64,
    /// 0 = quiet, 1 = daemon diagnostics, 2 = per-probe diagnostics
    pub verbosity: u8,
    /// Wired management interface the snapshot server binds to
    pub http_interface: String,
    pub http_listen: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            port: DEFAULT_PORT,
            interval: 1,
            window: 10,
            verbosity: 0,
            http_interface: "eth0".to_string(),
            http_listen: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&content)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 || self.window == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if self.interval > MAX_DURATION_SECS || self.window > MAX_DURATION_SECS {
            return Err(ConfigError::DurationTooLong {
                max: MAX_DURATION_SECS,
            });
        }
        if self.window < self.interval {
            return Err(ConfigError::WindowShorterThanInterval {
                window: self.window,
                interval: self.interval,
            });
        }
        if self.port == 0 || self.port == u16::MAX {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if self.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        Ok(())
    }

    pub fn probe_port(&self) -> u16 {
        self.port.saturating_add(1)
    }

    pub fn timing(&self) -> ProbeTiming {
        ProbeTiming {
            window_secs: self.window,
            interval_secs: self.interval,
        }
    }

    pub fn probe_diagnostics(&self) -> bool {
        self.verbosity >= 2
    }
}

/// Window and interval as seen by a link state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    pub window_secs: u64,
    pub interval_secs: u64,
}

impl ProbeTiming {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Probes a well-behaved neighbor sends inside one window.
    ///
    /// Integer division: a window that is not a multiple of the interval
    /// drops the remainder, which biases ratios slightly upwards.
    pub fn expected_probe_count(&self) -> u64 {
        if self.interval_secs == 0 {
            return 0;
        }
        self.window_secs / self.interval_secs
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Window ({window}) must be >= interval ({interval})")]
    WindowShorterThanInterval { window: u64, interval: u64 },
    #[error("Window and interval must be positive")]
    ZeroDuration,
    #[error("Window and interval must not exceed {max} seconds")]
    DurationTooLong { max: u64 },
    #[error("Invalid port {0}: the probe port is port + 1")]
    InvalidPort(u16),
    #[error("No valid network interfaces specified")]
    NoInterfaces,
}
