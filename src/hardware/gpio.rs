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

//! GPIO-family driver shims, going through the kernel's sysfs interfaces:
//! `/sys/class/gpio` for plain on/off pins, `/sys/class/pwm` for dimmable
//! outputs and the w1 bus for DS18B20 temperature probes.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;

use crate::errors::GaiaError;
use crate::gaia_fs;
use crate::hardware::{
    BaseSensor, Dimmer, Hardware, HardwareDriver, HardwareMetadata, SensorRecord, Switch,
};

const GPIO_SYSFS: &str = "/sys/class/gpio";
const PWM_SYSFS: &str = "/sys/class/pwm/pwmchip0";
const W1_DEVICES: &str = "/sys/bus/w1/devices";
const PWM_PERIOD_NS: u64 = 1_000_000; // 1 kHz

async fn export_gpio(pin: u32) -> Result<PathBuf> {
    let pin_dir = PathBuf::from(format!("{GPIO_SYSFS}/gpio{pin}"));
    if !pin_dir.exists() {
        // export fails when the pin is already held; surface that
        gaia_fs::write_string(format!("{GPIO_SYSFS}/export"), pin.to_string())
            .await
            .with_context(|| format!("Exporting GPIO pin {pin}"))?;
    }
    gaia_fs::write_string(pin_dir.join("direction"), "out".to_string())
        .await
        .with_context(|| format!("Setting GPIO pin {pin} as output"))?;
    Ok(pin_dir)
}

async fn write_gpio_value(pin: u32, high: bool) -> Result<()> {
    let pin_dir = export_gpio(pin).await?;
    let value = if high { "1" } else { "0" };
    gaia_fs::write_string(pin_dir.join("value"), value.to_string())
        .await
        .with_context(|| format!("Writing GPIO pin {pin} value"))
}

/// A plain on/off output on one GPIO pin.
pub struct GpioSwitch {
    metadata: HardwareMetadata,
}

impl GpioSwitch {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }
}

impl Hardware for GpioSwitch {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_switch(&self) -> Option<&dyn Switch> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl Switch for GpioSwitch {
    async fn turn_on(&self) -> Result<()> {
        debug!("Turning on '{}'", self.metadata.name);
        write_gpio_value(self.metadata.address.primary.main, true).await
    }

    async fn turn_off(&self) -> Result<()> {
        debug!("Turning off '{}'", self.metadata.name);
        write_gpio_value(self.metadata.address.primary.main, false).await
    }
}

/// A composite output: the primary pin switches the load, the secondary one
/// carries the PWM signal (dual `TYPE_N:TYPE_M` address).
pub struct GpioDimmable {
    metadata: HardwareMetadata,
}

impl GpioDimmable {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        if metadata.address.secondary.is_none() {
            return Err(GaiaError::config(format!(
                "Dimmable hardware '{}' needs a dual address with a PWM pin",
                metadata.name
            ))
            .into());
        }
        Ok(Rc::new(Self { metadata }))
    }

    fn pwm_channel(&self) -> u32 {
        self.metadata
            .address
            .secondary
            .map(|address| address.main)
            .unwrap_or_default()
    }

    async fn export_pwm(&self) -> Result<PathBuf> {
        let channel = self.pwm_channel();
        let channel_dir = PathBuf::from(format!("{PWM_SYSFS}/pwm{channel}"));
        if !channel_dir.exists() {
            gaia_fs::write_string(format!("{PWM_SYSFS}/export"), channel.to_string())
                .await
                .with_context(|| format!("Exporting PWM channel {channel}"))?;
        }
        gaia_fs::write_string(channel_dir.join("period"), PWM_PERIOD_NS.to_string()).await?;
        gaia_fs::write_string(channel_dir.join("enable"), "1".to_string()).await?;
        Ok(channel_dir)
    }
}

impl Hardware for GpioDimmable {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_switch(&self) -> Option<&dyn Switch> {
        Some(self)
    }

    fn as_dimmer(&self) -> Option<&dyn Dimmer> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl Switch for GpioDimmable {
    async fn turn_on(&self) -> Result<()> {
        write_gpio_value(self.metadata.address.primary.main, true).await
    }

    async fn turn_off(&self) -> Result<()> {
        write_gpio_value(self.metadata.address.primary.main, false).await
    }
}

#[async_trait(?Send)]
impl Dimmer for GpioDimmable {
    async fn set_pwm_duty(&self, duty_cycle_16b: u16) -> Result<()> {
        let channel_dir = self.export_pwm().await?;
        let duty_ns = u64::from(duty_cycle_16b) * PWM_PERIOD_NS / u64::from(u16::MAX);
        gaia_fs::write_string(channel_dir.join("duty_cycle"), duty_ns.to_string())
            .await
            .with_context(|| format!("Writing PWM duty cycle for '{}'", self.metadata.name))
    }
}

/// A DS18B20 temperature probe on the w1 bus.
pub struct Ds18b20 {
    metadata: HardwareMetadata,
}

impl Ds18b20 {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }

    async fn locate_probe() -> Result<PathBuf> {
        let mut entries = tokio::fs::read_dir(W1_DEVICES)
            .await
            .map_err(|_| GaiaError::TransientHardwareFailure {
                msg: "w1 bus is not available on this host".to_string(),
            })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            // DS18B20 family code is 28
            if name.to_string_lossy().starts_with("28-") {
                return Ok(entry.path().join("w1_slave"));
            }
        }
        Err(GaiaError::TransientHardwareFailure {
            msg: "No DS18B20 probe found on the w1 bus".to_string(),
        }
        .into())
    }

    fn parse_w1_slave(raw: &str) -> Result<f64> {
        if !raw.lines().next().is_some_and(|line| line.ends_with("YES")) {
            return Err(GaiaError::TransientHardwareFailure {
                msg: "DS18B20 CRC check failed".to_string(),
            }
            .into());
        }
        let millidegrees: f64 = raw
            .split("t=")
            .nth(1)
            .and_then(|rest| rest.trim().parse().ok())
            .ok_or_else(|| GaiaError::TransientHardwareFailure {
                msg: "Unreadable DS18B20 output".to_string(),
            })?;
        Ok(millidegrees / 1000.0)
    }
}

impl Hardware for Ds18b20 {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_sensor(&self) -> Option<&dyn BaseSensor> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl BaseSensor for Ds18b20 {
    async fn get_data(&self) -> Result<Vec<SensorRecord>> {
        let probe = Self::locate_probe().await?;
        let raw = gaia_fs::read_txt(&probe).await?;
        let temperature = Self::parse_w1_slave(&raw)?;
        Ok(vec![SensorRecord {
            sensor_uid: self.metadata.uid.clone(),
            measure: "temperature".to_string(),
            value: temperature,
            timestamp: Some(Utc::now()),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_w1_slave_output() {
        let raw = "6e 01 4b 46 7f ff 02 10 71 : crc=71 YES\n\
                   6e 01 4b 46 7f ff 02 10 71 t=22875";
        assert_eq!(Ds18b20::parse_w1_slave(raw).unwrap(), 22.875);
    }

    #[test]
    fn rejects_failed_crc() {
        let raw = "6e 01 4b 46 7f ff 02 10 71 : crc=71 NO\n\
                   6e 01 4b 46 7f ff 02 10 71 t=22875";
        assert!(Ds18b20::parse_w1_slave(raw).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Ds18b20::parse_w1_slave("YES but no temp").is_err());
    }
}
