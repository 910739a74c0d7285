/*
 * Gaia - greenhouse automation engine
 * Copyright (c) 2023-2026  Gaia Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::errors::GaiaError;

pub type HardwareUid = String;

/// The literal address meaning "the driver's default I2C address".
pub const I2C_DEFAULT: &str = "I2C_default";

/// What a piece of hardware is, which decides the subroutine that owns it
/// and the actuator handler that drives it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HardwareType {
    Sensor,
    Light,
    Heater,
    Cooler,
    Humidifier,
    Dehumidifier,
    Fan,
    Camera,
}

impl HardwareType {
    pub fn is_actuator(self) -> bool {
        !matches!(self, Self::Sensor | Self::Camera)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HardwareLevel {
    Environment,
    Plants,
}

/// One `measure|unit` entry of a sensor's `measures` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureSpec {
    pub measure: String,
    pub unit: Option<String>,
}

impl fmt::Display for MeasureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "{}|{unit}", self.measure),
            None => write!(f, "{}", self.measure),
        }
    }
}

impl FromStr for MeasureSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, '|');
        let measure = parts
            .next()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| GaiaError::config(format!("Empty measure entry: '{s}'")))?
            .trim()
            .to_string();
        let unit = parts
            .next()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(ToString::to_string);
        Ok(Self { measure, unit })
    }
}

impl Serialize for MeasureSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MeasureSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One entry of an ecosystem's `IO` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub uid: HardwareUid,
    pub name: String,
    pub address: String,
    #[serde(rename = "type")]
    pub h_type: HardwareType,
    pub level: HardwareLevel,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measures: Vec<MeasureSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexer_model: Option<String>,
}

impl HardwareConfig {
    pub fn parsed_address(&self) -> Result<HardwareAddress> {
        self.address.parse()
    }

    pub fn measure_names(&self) -> impl Iterator<Item = &str> {
        self.measures.iter().map(|spec| spec.measure.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum AddressKind {
    GPIO,
    BCM,
    BOARD,
    I2C,
    SPI,
}

impl AddressKind {
    fn is_pin_numbered(self) -> bool {
        matches!(self, Self::GPIO | Self::BCM | Self::BOARD)
    }
}

/// A single bus location: `TYPE_NUM`, where NUM is a decimal pin for the
/// GPIO families and a hex address (optionally behind a multiplexer channel,
/// `I2C_0x70#1_0x40`) for I2C/SPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub kind: AddressKind,
    pub main: u32,
    pub multiplexer_address: Option<u32>,
    pub multiplexer_channel: Option<u8>,
}

static ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<type>GPIO|BCM|BOARD|I2C|SPI)_(?:(?P<pin>\d+)|(?P<default>default)|(?:(?P<mux>0x[0-9a-fA-F]+)#(?P<channel>\d+)_)?(?P<hex>0x[0-9a-fA-F]+))$",
    )
    .unwrap()
});

impl FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let captures = ADDRESS_PATTERN
            .captures(s)
            .ok_or_else(|| GaiaError::config(format!("Invalid hardware address: '{s}'")))?;
        let kind: AddressKind = captures["type"].parse()?;
        if kind.is_pin_numbered() {
            let Some(pin) = captures.name("pin") else {
                return Err(
                    GaiaError::config(format!("{kind} addresses use a decimal pin: '{s}'")).into(),
                );
            };
            return Ok(Self {
                kind,
                main: pin.as_str().parse()?,
                multiplexer_address: None,
                multiplexer_channel: None,
            });
        }
        if captures.name("default").is_some() {
            // main 0 is the "driver default" marker for I2C devices
            return Ok(Self {
                kind,
                main: 0,
                multiplexer_address: None,
                multiplexer_channel: None,
            });
        }
        let Some(hex) = captures.name("hex") else {
            return Err(
                GaiaError::config(format!("{kind} addresses use a hex address: '{s}'")).into(),
            );
        };
        let main = u32::from_str_radix(hex.as_str().trim_start_matches("0x"), 16)?;
        let multiplexer_address = captures
            .name("mux")
            .map(|mux| u32::from_str_radix(mux.as_str().trim_start_matches("0x"), 16))
            .transpose()?;
        let multiplexer_channel = captures
            .name("channel")
            .map(|channel| channel.as_str().parse())
            .transpose()?;
        Ok(Self {
            kind,
            main,
            multiplexer_address,
            multiplexer_channel,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_pin_numbered() {
            return write!(f, "{}_{}", self.kind, self.main);
        }
        if self.is_default() {
            return write!(f, "{}_default", self.kind);
        }
        match (self.multiplexer_address, self.multiplexer_channel) {
            (Some(mux), Some(channel)) => {
                write!(f, "{}_{mux:#x}#{channel}_{:#x}", self.kind, self.main)
            }
            _ => write!(f, "{}_{:#x}", self.kind, self.main),
        }
    }
}

impl Address {
    pub fn is_default(&self) -> bool {
        !self.kind.is_pin_numbered() && self.main == 0
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer_address.is_some()
    }
}

/// A full hardware address. A dual (colon-separated) address encodes a
/// composite hardware: the primary location switches it on and off, the
/// secondary one carries the PWM signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareAddress {
    pub primary: Address,
    pub secondary: Option<Address>,
}

impl FromStr for HardwareAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, ':');
        let primary = parts.next().unwrap_or_default().parse()?;
        let secondary = parts.next().map(Address::from_str).transpose()?;
        Ok(Self { primary, secondary })
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secondary {
            Some(secondary) => write!(f, "{}:{secondary}", self.primary),
            None => write!(f, "{}", self.primary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpio_pin_address() {
        let address: HardwareAddress = "GPIO_17".parse().unwrap();
        assert_eq!(address.primary.kind, AddressKind::GPIO);
        assert_eq!(address.primary.main, 17);
        assert!(address.secondary.is_none());
        assert_eq!(address.to_string(), "GPIO_17");
    }

    #[test]
    fn parses_dual_composite_address() {
        let address: HardwareAddress = "BCM_4:BCM_18".parse().unwrap();
        assert_eq!(address.primary.main, 4);
        assert_eq!(address.secondary.unwrap().main, 18);
        assert_eq!(address.to_string(), "BCM_4:BCM_18");
    }

    #[test]
    fn parses_i2c_hex_and_default() {
        let address: HardwareAddress = "I2C_0x70#1_0x40".parse().unwrap();
        assert_eq!(address.primary.main, 0x40);
        assert_eq!(address.primary.multiplexer_address, Some(0x70));
        assert_eq!(address.primary.multiplexer_channel, Some(1));
        assert_eq!(address.to_string(), "I2C_0x70#1_0x40");

        let default: HardwareAddress = I2C_DEFAULT.parse().unwrap();
        assert!(default.primary.is_default());
        assert_eq!(default.to_string(), I2C_DEFAULT);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("UART_1".parse::<HardwareAddress>().is_err());
        assert!("GPIO_0x14".parse::<HardwareAddress>().is_err());
        assert!("I2C_".parse::<HardwareAddress>().is_err());
        assert!("17".parse::<HardwareAddress>().is_err());
    }

    #[test]
    fn measure_spec_round_trip() {
        let spec: MeasureSpec = "temperature|°C".parse().unwrap();
        assert_eq!(spec.measure, "temperature");
        assert_eq!(spec.unit.as_deref(), Some("°C"));
        assert_eq!(spec.to_string(), "temperature|°C");

        let bare: MeasureSpec = "humidity".parse().unwrap();
        assert!(bare.unit.is_none());
    }
}
