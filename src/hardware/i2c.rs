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

//! I2C sensor shims.
//!
//! Register-level access is left to the kernel: these drivers read the IIO
//! sysfs channels the in-tree `veml7700`/`aht10` modules expose, the same
//! way the engine reads every other bus. Devices without a kernel driver
//! (the seesaw moisture sensor) report a transient failure on hosts where
//! the bus is absent.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::errors::GaiaError;
use crate::gaia_fs;
use crate::hardware::{
    BaseSensor, Hardware, HardwareDriver, HardwareMetadata, LightSensor, SensorRecord,
};

const IIO_DEVICES: &str = "/sys/bus/iio/devices";

/// Locates the IIO device directory whose `name` entry matches.
async fn locate_iio_device(driver_name: &str) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(IIO_DEVICES)
        .await
        .map_err(|_| GaiaError::TransientHardwareFailure {
            msg: format!("IIO bus is not available on this host (wanted '{driver_name}')"),
        })?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name_path = entry.path().join("name");
        if let Ok(name) = gaia_fs::read_txt(&name_path).await {
            if name.trim() == driver_name {
                return Ok(entry.path());
            }
        }
    }
    Err(GaiaError::TransientHardwareFailure {
        msg: format!("No IIO device named '{driver_name}' found"),
    }
    .into())
}

async fn read_iio_channel(device_dir: &PathBuf, channel: &str) -> Result<f64> {
    let raw = gaia_fs::read_txt(device_dir.join(channel)).await?;
    raw.trim()
        .parse()
        .map_err(|_| {
            GaiaError::TransientHardwareFailure {
                msg: format!("Unreadable IIO channel '{channel}'"),
            }
            .into()
        })
}

/// VEML7700 ambient light sensor (lux).
pub struct Veml7700 {
    metadata: HardwareMetadata,
}

impl Veml7700 {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }

    async fn read_lux(&self) -> Result<f64> {
        let device = locate_iio_device("veml7700").await?;
        read_iio_channel(&device, "in_illuminance_input").await
    }
}

impl Hardware for Veml7700 {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_sensor(&self) -> Option<&dyn BaseSensor> {
        Some(self)
    }

    fn as_light_sensor(&self) -> Option<&dyn LightSensor> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl BaseSensor for Veml7700 {
    async fn get_data(&self) -> Result<Vec<SensorRecord>> {
        let lux = self.read_lux().await?;
        Ok(vec![SensorRecord {
            sensor_uid: self.metadata.uid.clone(),
            measure: "light".to_string(),
            value: lux,
            timestamp: Some(Utc::now()),
        }])
    }
}

#[async_trait(?Send)]
impl LightSensor for Veml7700 {
    async fn get_lux(&self) -> Result<f64> {
        self.read_lux().await
    }
}

/// AHT20 temperature and relative humidity sensor.
pub struct Aht20 {
    metadata: HardwareMetadata,
}

impl Aht20 {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }
}

impl Hardware for Aht20 {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_sensor(&self) -> Option<&dyn BaseSensor> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl BaseSensor for Aht20 {
    async fn get_data(&self) -> Result<Vec<SensorRecord>> {
        let device = locate_iio_device("aht10").await?;
        let now = Utc::now();
        let mut records = Vec::with_capacity(2);
        // channels are millidegrees / milli-percent
        let temperature = read_iio_channel(&device, "in_temp_input").await? / 1000.0;
        records.push(SensorRecord {
            sensor_uid: self.metadata.uid.clone(),
            measure: "temperature".to_string(),
            value: temperature,
            timestamp: Some(now),
        });
        let humidity = read_iio_channel(&device, "in_humidityrelative_input").await? / 1000.0;
        records.push(SensorRecord {
            sensor_uid: self.metadata.uid.clone(),
            measure: "humidity".to_string(),
            value: humidity,
            timestamp: Some(now),
        });
        Ok(records)
    }
}

/// Adafruit seesaw capacitive moisture sensor. No in-tree kernel driver, so
/// this shim only works behind a userspace bridge exposing an IIO device.
pub struct CapacitiveMoisture {
    metadata: HardwareMetadata,
}

impl CapacitiveMoisture {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }
}

impl Hardware for CapacitiveMoisture {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_sensor(&self) -> Option<&dyn BaseSensor> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl BaseSensor for CapacitiveMoisture {
    async fn get_data(&self) -> Result<Vec<SensorRecord>> {
        let device = locate_iio_device("seesaw-moisture").await?;
        let moisture = read_iio_channel(&device, "in_capacitance_input").await?;
        Ok(vec![SensorRecord {
            sensor_uid: self.metadata.uid.clone(),
            measure: "moisture".to_string(),
            value: moisture,
            timestamp: Some(Utc::now()),
        }])
    }
}
