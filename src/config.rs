//! Configuration for the sensor rig stack
//!
//! Loads configuration from a TOML file. Hard protocol limits that the
//! firmware bakes in as magic numbers are kept configurable here with
//! the firmware's values as defaults.

use crate::error::Result;
use crate::reassembler::ReassemblyLimits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level rig configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RigConfig {
    pub device: DeviceSection,
    pub transport: TransportSection,
    pub reassembly: ReassemblyLimits,
    pub writer: WriterSection,
    pub logging: LoggingSection,
}

/// Which USB device to open
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSection {
    /// USB vendor id of the FIFO bridge
    pub vendor_id: u16,
    /// USB product id of the FIFO bridge
    pub product_id: u16,
}

/// Read pipeline tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportSection {
    /// Number of bulk-in transfers kept in flight
    pub buffer_count: usize,
    /// Size of each transfer buffer in bytes
    pub buffer_size: usize,
}

/// Rate-limited writer tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterSection {
    /// Writer tick interval in milliseconds
    pub interval_ms: u64,
}

impl WriterSection {
    /// Tick interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Logging configuration, consumed by the embedding application
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout, stderr, or file path)
    pub output: String,
}

impl RigConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: RigConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Defaults for the standard rig hardware.
    pub fn rig_defaults() -> Self {
        Self {
            device: DeviceSection {
                vendor_id: 0x0403,
                product_id: 0x601F,
            },
            transport: TransportSection {
                buffer_count: 64,
                buffer_size: 64 * 1024,
            },
            reassembly: ReassemblyLimits::default(),
            writer: WriterSection { interval_ms: 50 },
            logging: LoggingSection {
                level: "info".to_string(),
                output: "stdout".to_string(),
            },
        }
    }
}

impl Default for RigConfig {
    fn default() -> Self {
        Self::rig_defaults()
    }
}
