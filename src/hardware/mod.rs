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

//! Hardware driver shims.
//!
//! Drivers are dispatched on the `model` string of their config through a
//! registry; adding a model means registering a constructor, no type
//! hierarchy needed. Capabilities are expressed as traits (`Switch`,
//! `Dimmer`, `BaseSensor`, `LightSensor`, `Camera`) a driver opts into via
//! the `as_*` accessors.

pub mod camera;
pub mod gpio;
pub mod i2c;
pub mod virtual_devices;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ecosystem::EcosystemUid;
use crate::config::hardware::{
    HardwareAddress, HardwareConfig, HardwareLevel, HardwareType, HardwareUid, MeasureSpec,
};
use crate::errors::GaiaError;
use crate::hardware::camera::PixelFrame;

/// A single measured value from one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub sensor_uid: HardwareUid,
    pub measure: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The static description every driver carries, resolved from its
/// `HardwareConfig` at construction.
#[derive(Debug, Clone)]
pub struct HardwareMetadata {
    pub uid: HardwareUid,
    pub name: String,
    pub ecosystem_uid: EcosystemUid,
    pub address: HardwareAddress,
    pub h_type: HardwareType,
    pub level: HardwareLevel,
    pub model: String,
    pub measures: Vec<MeasureSpec>,
}

impl HardwareMetadata {
    pub fn from_config(config: &HardwareConfig, ecosystem_uid: &str) -> Result<Self> {
        Ok(Self {
            uid: config.uid.clone(),
            name: config.name.clone(),
            ecosystem_uid: ecosystem_uid.to_string(),
            address: config.parsed_address()?,
            h_type: config.h_type,
            level: config.level,
            model: config.model.clone(),
            measures: config.measures.clone(),
        })
    }
}

/// An on/off output.
#[async_trait(?Send)]
pub trait Switch {
    async fn turn_on(&self) -> Result<()>;
    async fn turn_off(&self) -> Result<()>;
}

/// A PWM output. Takes the raw 16-bit duty cycle.
#[async_trait(?Send)]
pub trait Dimmer {
    async fn set_pwm_duty(&self, duty_cycle_16b: u16) -> Result<()>;
}

/// Anything that produces measured values.
#[async_trait(?Send)]
pub trait BaseSensor {
    async fn get_data(&self) -> Result<Vec<SensorRecord>>;
}

/// A sensor that can read ambient light intensity.
#[async_trait(?Send)]
pub trait LightSensor {
    async fn get_lux(&self) -> Result<f64>;
}

#[async_trait(?Send)]
pub trait Camera {
    async fn capture(&self) -> Result<PixelFrame>;
}

/// The common interface of every live driver object.
pub trait Hardware {
    fn metadata(&self) -> &HardwareMetadata;

    fn uid(&self) -> &HardwareUid {
        &self.metadata().uid
    }

    fn name(&self) -> &str {
        &self.metadata().name
    }

    fn h_type(&self) -> HardwareType {
        self.metadata().h_type
    }

    fn as_switch(&self) -> Option<&dyn Switch> {
        None
    }

    fn as_dimmer(&self) -> Option<&dyn Dimmer> {
        None
    }

    fn as_sensor(&self) -> Option<&dyn BaseSensor> {
        None
    }

    fn as_light_sensor(&self) -> Option<&dyn LightSensor> {
        None
    }

    fn as_camera(&self) -> Option<&dyn Camera> {
        None
    }
}

pub type HardwareDriver = Rc<dyn Hardware>;

type Constructor = fn(HardwareMetadata) -> Result<HardwareDriver>;

/// model string -> driver constructor.
///
/// The `virtual*` models run the full control plane without hardware and are
/// what the virtualization mode (`GAIA_VIRTUALIZATION`) substitutes in.
static MODEL_REGISTRY: LazyLock<HashMap<&'static str, Constructor>> = LazyLock::new(|| {
    let mut registry: HashMap<&'static str, Constructor> = HashMap::new();
    registry.insert("gpioSwitch", gpio::GpioSwitch::create);
    registry.insert("gpioDimmable", gpio::GpioDimmable::create);
    registry.insert("DS18B20", gpio::Ds18b20::create);
    registry.insert("VEML7700", i2c::Veml7700::create);
    registry.insert("AHT20", i2c::Aht20::create);
    registry.insert("CapacitiveMoisture", i2c::CapacitiveMoisture::create);
    registry.insert("PiCamera", camera::PiCamera::create);
    registry.insert("virtualSwitch", virtual_devices::VirtualSwitch::create);
    registry.insert("virtualDimmable", virtual_devices::VirtualDimmable::create);
    registry.insert("virtualDS18B20", virtual_devices::VirtualSensor::create_temperature);
    registry.insert("virtualAHT20", virtual_devices::VirtualSensor::create_temperature_humidity);
    registry.insert("virtualVEML7700", virtual_devices::VirtualLightSensor::create);
    registry.insert(
        "virtualMoisture",
        virtual_devices::VirtualSensor::create_moisture,
    );
    registry.insert("virtualCamera", virtual_devices::VirtualCamera::create);
    registry
});

pub fn available_models() -> HashSet<String> {
    MODEL_REGISTRY.keys().map(ToString::to_string).collect()
}

/// Builds the live driver for one piece of configured hardware.
///
/// With `virtualization` enabled, real models are transparently swapped for
/// their virtual counterparts so a desktop engine never touches a bus.
pub fn create_hardware(
    config: &HardwareConfig,
    ecosystem_uid: &str,
    virtualization: bool,
) -> Result<HardwareDriver> {
    let metadata = HardwareMetadata::from_config(config, ecosystem_uid)?;
    let model = if virtualization && !config.model.starts_with("virtual") {
        virtual_substitute(&config.model)
    } else {
        config.model.as_str()
    };
    let constructor = MODEL_REGISTRY.get(model).ok_or_else(|| {
        GaiaError::config(format!(
            "{} is not in the list of available hardware models",
            config.model
        ))
    })?;
    constructor(metadata)
}

fn virtual_substitute(model: &str) -> &str {
    match model {
        "gpioSwitch" => "virtualSwitch",
        "gpioDimmable" => "virtualDimmable",
        "DS18B20" => "virtualDS18B20",
        "AHT20" => "virtualAHT20",
        "VEML7700" => "virtualVEML7700",
        "CapacitiveMoisture" => "virtualMoisture",
        "PiCamera" => "virtualCamera",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::hardware::HardwareLevel;

    fn sensor_config(model: &str) -> HardwareConfig {
        HardwareConfig {
            uid: "abcdefgh12345678".to_string(),
            name: "test sensor".to_string(),
            address: "I2C_default".to_string(),
            h_type: HardwareType::Sensor,
            level: HardwareLevel::Environment,
            model: model.to_string(),
            measures: vec!["temperature|°C".parse().unwrap()],
            plants: Vec::new(),
            multiplexer_model: None,
        }
    }

    #[test]
    fn registry_knows_virtual_and_real_models() {
        let models = available_models();
        assert!(models.contains("gpioSwitch"));
        assert!(models.contains("virtualSwitch"));
        assert!(models.contains("VEML7700"));
    }

    #[test]
    fn unknown_model_is_a_config_error() {
        let config = sensor_config("notAModel");
        assert!(create_hardware(&config, "aaaaaaaa", false).is_err());
    }

    #[test]
    fn virtualization_substitutes_models() {
        let config = sensor_config("AHT20");
        let driver = create_hardware(&config, "aaaaaaaa", true).unwrap();
        assert_eq!(driver.metadata().model, "AHT20");
        // the driver behind it is virtual: it measures without a bus
        assert!(driver.as_sensor().is_some());
    }
}
