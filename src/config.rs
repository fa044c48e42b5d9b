//! Relay settings, read from a [ron] file.
//!
//! Every field has a default, so a file only needs to name what differs:
//!
//! ```ron
//! (
//!     device: "/dev/ttyUSB0",
//!     birds: 4,
//!     host: "192.168.1.20",
//!     bus: (status_delay_ms: 200),
//! )
//! ```

use crate::{bus::BusTimings, liberty::StreamConfig, record::RecordMode};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, io, path::Path, path::PathBuf};

/// Default serial device.
pub const DEFAULT_DEVICE: &str = "/dev/ttyS0";

/// Default remote port; control messages are read on the next one up.
pub const DEFAULT_PORT: u16 = 7000;

#[allow(missing_docs)]
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Ron(ron::de::SpannedError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::Io(e) => Cow::from(format!("can't read configuration: {}", e)),
            ConfigError::Ron(e) => Cow::from(format!("ron error: {}", e)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Ron(e) => Some(e),
        }
    }
}

/// Everything the relay needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Serial device the tracker is attached to.
    pub device: PathBuf,
    /// Number of tracking units.
    pub birds: usize,
    /// Record shape requested from every unit on the bus.
    pub record_mode: RecordMode,
    /// Ask for all units in one group response.
    pub group: bool,
    /// Ask for continuous output.
    pub stream: bool,
    /// Host records are sent to.
    pub host: String,
    /// Port records are sent to.
    pub port: u16,
    /// Port control messages are read from; `port + 1` when unset.
    pub local_port: Option<u16>,
    /// Smallest movement, in normalized units, worth sending.
    pub noise_level: f64,
    /// Rise per poll on the z axis that starts a bump.
    pub z_threshold: f64,
    /// Polls after a bump during which no new bump is detected.
    pub after_bump_delay: u64,
    /// Bus settle delays.
    pub bus: BusTimings,
    /// High-speed tracker tuning.
    pub liberty: StreamConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            device: PathBuf::from(DEFAULT_DEVICE),
            birds: 2,
            record_mode: RecordMode::PositionAngles,
            group: true,
            stream: true,
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            local_port: None,
            noise_level: 3e-4,
            z_threshold: 1.5e-2,
            after_bump_delay: 8,
            bus: BusTimings::default(),
            liberty: StreamConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        text.parse()
    }

    /// Port control messages are read from.
    pub fn control_port(&self) -> u16 {
        self.local_port
            .unwrap_or_else(|| self.port.wrapping_add(1))
    }
}

impl std::str::FromStr for RelayConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ron::from_str(s).map_err(ConfigError::Ron)
    }
}
