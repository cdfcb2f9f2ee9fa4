//! FIFO bridge configuration record
//!
//! The bridge chip stores a 152-byte configuration block readable and
//! writable through a vendor control request. The block is encoded and
//! decoded field by field; nothing here relies on struct layout.

use crate::error::{Error, Result};

/// FIFO clock rate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoClock {
    /// 100 MHz
    Clock100MHz,
    /// 66 MHz
    Clock66MHz,
    /// 50 MHz
    Clock50MHz,
    /// 40 MHz
    Clock40MHz,
}

/// FIFO bus protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoMode {
    /// 245-style synchronous FIFO
    Mode245,
    /// 600-style multi-channel FIFO
    Mode600,
}

/// FIFO channel arrangement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelConfig {
    /// Four bidirectional channels
    QuadChannel,
    /// Two bidirectional channels
    DoubleChannel,
    /// One bidirectional channel
    SingleChannel,
    /// One out-pipe only
    SingleChannelOutPipe,
    /// One in-pipe only
    SingleChannelInPipe,
}

impl FifoClock {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Clock100MHz),
            1 => Ok(Self::Clock66MHz),
            2 => Ok(Self::Clock50MHz),
            3 => Ok(Self::Clock40MHz),
            _ => Err(Error::ConfigIoFailed(format!("bad fifo clock code {code}"))),
        }
    }
}

impl FifoMode {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Mode245),
            1 => Ok(Self::Mode600),
            _ => Err(Error::ConfigIoFailed(format!("bad fifo mode code {code}"))),
        }
    }
}

impl ChannelConfig {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::QuadChannel),
            1 => Ok(Self::DoubleChannel),
            2 => Ok(Self::SingleChannel),
            3 => Ok(Self::SingleChannelOutPipe),
            4 => Ok(Self::SingleChannelInPipe),
            _ => Err(Error::ConfigIoFailed(format!(
                "bad channel config code {code}"
            ))),
        }
    }
}

/// Decoded USB string descriptors from the configuration block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringDescriptors {
    /// Manufacturer string
    pub manufacturer: String,
    /// Product description string
    pub product_description: String,
    /// Serial number string
    pub serial_number: String,
}

/// The 152-byte bridge configuration block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// USB vendor id the bridge enumerates with
    pub vendor_id: u16,
    /// USB product id the bridge enumerates with
    pub product_id: u16,
    /// Raw 128-byte encoded string descriptor table
    pub string_descriptors: [u8; 128],
    /// bmAttributes of the configuration descriptor
    pub power_attributes: u8,
    /// Max power draw in 2 mA units
    pub power_consumption: u16,
    /// FIFO clock rate
    pub fifo_clock: FifoClock,
    /// FIFO bus protocol
    pub fifo_mode: FifoMode,
    /// FIFO channel arrangement
    pub channel_config: ChannelConfig,
    /// Optional feature enable bits
    pub optional_feature_support: u16,
    /// Battery charging GPIO configuration
    pub battery_charging_gpio_config: u8,
    /// Flash/EEPROM detection result byte
    pub flash_eeprom_detection: u8,
    /// MSIO pin control word
    pub msio_control: u32,
    /// GPIO pin control word
    pub gpio_control: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0,
            product_id: 0,
            string_descriptors: [0; 128],
            power_attributes: 0xE0,
            power_consumption: 0x60,
            fifo_clock: FifoClock::Clock100MHz,
            fifo_mode: FifoMode::Mode600,
            channel_config: ChannelConfig::QuadChannel,
            optional_feature_support: 0,
            battery_charging_gpio_config: 0xE4,
            flash_eeprom_detection: 0,
            msio_control: 0x10800,
            gpio_control: 0,
        }
    }
}

impl DeviceConfig {
    /// Encoded size in bytes
    pub const SIZE: usize = 152;

    /// Encode to the wire block.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.vendor_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.product_id.to_le_bytes());
        out[4..132].copy_from_slice(&self.string_descriptors);
        // out[132] reserved
        out[133] = self.power_attributes;
        out[134..136].copy_from_slice(&self.power_consumption.to_le_bytes());
        // out[136] reserved
        out[137] = self.fifo_clock as u8;
        out[138] = self.fifo_mode as u8;
        out[139] = self.channel_config as u8;
        out[140..142].copy_from_slice(&self.optional_feature_support.to_le_bytes());
        out[142] = self.battery_charging_gpio_config;
        out[143] = self.flash_eeprom_detection;
        out[144..148].copy_from_slice(&self.msio_control.to_le_bytes());
        out[148..152].copy_from_slice(&self.gpio_control.to_le_bytes());
        out
    }

    /// Decode from the wire block.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let b: &[u8; Self::SIZE] = bytes
            .get(..Self::SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                Error::ConfigIoFailed(format!(
                    "config block too short: {} < {}",
                    bytes.len(),
                    Self::SIZE
                ))
            })?;
        let mut string_descriptors = [0u8; 128];
        string_descriptors.copy_from_slice(&b[4..132]);
        Ok(Self {
            vendor_id: u16::from_le_bytes(b[0..2].try_into().unwrap()),
            product_id: u16::from_le_bytes(b[2..4].try_into().unwrap()),
            string_descriptors,
            power_attributes: b[133],
            power_consumption: u16::from_le_bytes(b[134..136].try_into().unwrap()),
            fifo_clock: FifoClock::from_code(b[137])?,
            fifo_mode: FifoMode::from_code(b[138])?,
            channel_config: ChannelConfig::from_code(b[139])?,
            optional_feature_support: u16::from_le_bytes(b[140..142].try_into().unwrap()),
            battery_charging_gpio_config: b[142],
            flash_eeprom_detection: b[143],
            msio_control: u32::from_le_bytes(b[144..148].try_into().unwrap()),
            gpio_control: u32::from_le_bytes(b[148..152].try_into().unwrap()),
        })
    }

    /// Decode the string descriptor table.
    ///
    /// The table is a sequence of standard USB string descriptors
    /// (length byte, type byte 0x03, UTF-16LE data); only the low byte
    /// of each code unit is kept.
    pub fn decode_strings(&self) -> StringDescriptors {
        let mut strings: Vec<String> = Vec::new();
        let table = &self.string_descriptors;
        let mut i = 0;
        while i < table.len() {
            let len = table[i] as usize;
            if len < 2 {
                // padding byte
                i += 1;
                continue;
            }
            let body = len - 2;
            if table.get(i + 1) == Some(&0x03) {
                let end = (i + 2 + body).min(table.len());
                // UTF-16LE code units, low bytes only
                strings.push(
                    table[i + 2..end]
                        .iter()
                        .step_by(2)
                        .map(|&b| char::from(b))
                        .collect(),
                );
            }
            i += 2 + body;
        }
        let mut it = strings.into_iter();
        StringDescriptors {
            manufacturer: it.next().unwrap_or_default(),
            product_description: it.next().unwrap_or_default(),
            serial_number: it.next().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip() {
        let mut config = DeviceConfig {
            vendor_id: 0x0403,
            product_id: 0x601F,
            fifo_clock: FifoClock::Clock66MHz,
            channel_config: ChannelConfig::SingleChannelInPipe,
            msio_control: 0xDEAD_BEEF,
            ..DeviceConfig::default()
        };
        config.string_descriptors[0] = 0x04;
        config.string_descriptors[1] = 0x03;
        let decoded = DeviceConfig::decode(&config.encode()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn decode_rejects_short_block() {
        assert!(DeviceConfig::decode(&[0u8; 64]).is_err());
    }

    #[test]
    fn decode_rejects_bad_enum_code() {
        let mut block = DeviceConfig::default().encode();
        block[137] = 9;
        assert!(DeviceConfig::decode(&block).is_err());
    }

    fn encode_string_descriptor(out: &mut Vec<u8>, s: &str) {
        out.push((s.len() * 2 + 2) as u8);
        out.push(0x03);
        for c in s.bytes() {
            out.push(c);
            out.push(0);
        }
    }

    #[test]
    fn string_descriptor_table_decodes() {
        let mut table = Vec::new();
        encode_string_descriptor(&mut table, "ACME");
        encode_string_descriptor(&mut table, "SensorRig");
        encode_string_descriptor(&mut table, "SR-0042");
        let mut config = DeviceConfig::default();
        config.string_descriptors[..table.len()].copy_from_slice(&table);
        let strings = config.decode_strings();
        assert_eq!(strings.manufacturer, "ACME");
        assert_eq!(strings.product_description, "SensorRig");
        assert_eq!(strings.serial_number, "SR-0042");
    }
}
