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

//! Virtualization-mode hardware: no bus access, plausible values.
//!
//! These models let a desktop engine run the full control plane. Switches
//! and dimmers remember their state, sensors produce lightly noised values
//! around greenhouse-typical baselines.

use std::cell::Cell;
use std::rc::Rc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use rand::Rng;

use crate::hardware::camera::{Pixel, PixelFrame};
use crate::hardware::{
    BaseSensor, Camera, Dimmer, Hardware, HardwareDriver, HardwareMetadata, LightSensor,
    SensorRecord, Switch,
};

const BASE_TEMPERATURE: f64 = 25.0;
const BASE_HUMIDITY: f64 = 60.0;
const BASE_MOISTURE: f64 = 30.0;

fn noised(base: f64, relative_spread: f64) -> f64 {
    let factor = 1.0 + rand::thread_rng().gen_range(-relative_spread..=relative_spread);
    (base * factor * 100.0).round() / 100.0
}

pub struct VirtualSwitch {
    metadata: HardwareMetadata,
    on: Cell<bool>,
}

impl VirtualSwitch {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self {
            metadata,
            on: Cell::new(false),
        }))
    }

    pub fn is_on(&self) -> bool {
        self.on.get()
    }
}

impl Hardware for VirtualSwitch {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_switch(&self) -> Option<&dyn Switch> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl Switch for VirtualSwitch {
    async fn turn_on(&self) -> Result<()> {
        debug!("Virtual switch '{}' turned on", self.metadata.name);
        self.on.set(true);
        Ok(())
    }

    async fn turn_off(&self) -> Result<()> {
        debug!("Virtual switch '{}' turned off", self.metadata.name);
        self.on.set(false);
        Ok(())
    }
}

pub struct VirtualDimmable {
    metadata: HardwareMetadata,
    on: Cell<bool>,
    duty: Cell<u16>,
}

impl VirtualDimmable {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self {
            metadata,
            on: Cell::new(false),
            duty: Cell::new(0),
        }))
    }

    pub fn duty(&self) -> u16 {
        self.duty.get()
    }
}

impl Hardware for VirtualDimmable {
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
impl Switch for VirtualDimmable {
    async fn turn_on(&self) -> Result<()> {
        self.on.set(true);
        Ok(())
    }

    async fn turn_off(&self) -> Result<()> {
        self.on.set(false);
        Ok(())
    }
}

#[async_trait(?Send)]
impl Dimmer for VirtualDimmable {
    async fn set_pwm_duty(&self, duty_cycle_16b: u16) -> Result<()> {
        debug!(
            "Virtual dimmer '{}' set to duty {duty_cycle_16b}",
            self.metadata.name
        );
        self.duty.set(duty_cycle_16b);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum VirtualMeasureSet {
    Temperature,
    TemperatureHumidity,
    Moisture,
}

pub struct VirtualSensor {
    metadata: HardwareMetadata,
    measure_set: VirtualMeasureSet,
}

impl VirtualSensor {
    pub fn create_temperature(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self {
            metadata,
            measure_set: VirtualMeasureSet::Temperature,
        }))
    }

    pub fn create_temperature_humidity(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self {
            metadata,
            measure_set: VirtualMeasureSet::TemperatureHumidity,
        }))
    }

    pub fn create_moisture(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self {
            metadata,
            measure_set: VirtualMeasureSet::Moisture,
        }))
    }
}

impl Hardware for VirtualSensor {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_sensor(&self) -> Option<&dyn BaseSensor> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl BaseSensor for VirtualSensor {
    async fn get_data(&self) -> Result<Vec<SensorRecord>> {
        let now = Utc::now();
        let record = |measure: &str, value: f64| SensorRecord {
            sensor_uid: self.metadata.uid.clone(),
            measure: measure.to_string(),
            value,
            timestamp: Some(now),
        };
        Ok(match self.measure_set {
            VirtualMeasureSet::Temperature => {
                vec![record("temperature", noised(BASE_TEMPERATURE, 0.03))]
            }
            VirtualMeasureSet::TemperatureHumidity => vec![
                record("temperature", noised(BASE_TEMPERATURE, 0.03)),
                record("humidity", noised(BASE_HUMIDITY, 0.05)),
            ],
            VirtualMeasureSet::Moisture => {
                vec![record("moisture", noised(BASE_MOISTURE, 0.1))]
            }
        })
    }
}

pub struct VirtualLightSensor {
    metadata: HardwareMetadata,
}

impl VirtualLightSensor {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }

    fn lux() -> f64 {
        f64::from(rand::thread_rng().gen_range(1_000..100_000) / 10 * 10)
    }
}

impl Hardware for VirtualLightSensor {
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
impl BaseSensor for VirtualLightSensor {
    async fn get_data(&self) -> Result<Vec<SensorRecord>> {
        Ok(vec![SensorRecord {
            sensor_uid: self.metadata.uid.clone(),
            measure: "light".to_string(),
            value: Self::lux(),
            timestamp: Some(Utc::now()),
        }])
    }
}

#[async_trait(?Send)]
impl LightSensor for VirtualLightSensor {
    async fn get_lux(&self) -> Result<f64> {
        Ok(Self::lux())
    }
}

/// Produces a synthetic mostly-green frame, noised enough that the health
/// indices move between captures.
pub struct VirtualCamera {
    metadata: HardwareMetadata,
}

impl VirtualCamera {
    pub fn create(metadata: HardwareMetadata) -> Result<HardwareDriver> {
        Ok(Rc::new(Self { metadata }))
    }
}

impl Hardware for VirtualCamera {
    fn metadata(&self) -> &HardwareMetadata {
        &self.metadata
    }

    fn as_camera(&self) -> Option<&dyn Camera> {
        Some(self)
    }
}

#[async_trait(?Send)]
impl Camera for VirtualCamera {
    async fn capture(&self) -> Result<PixelFrame> {
        let width = 64;
        let height = 48;
        let mut rng = rand::thread_rng();
        let pixels = (0..width * height)
            .map(|_| Pixel {
                r: rng.gen_range(0.05..0.25),
                g: rng.gen_range(0.35..0.75),
                b: rng.gen_range(0.05..0.20),
                nir: rng.gen_range(0.55..0.85),
            })
            .collect();
        Ok(PixelFrame::new(width, height, pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::hardware::{HardwareLevel, HardwareType};
    use crate::config::hardware::HardwareAddress;

    fn metadata(h_type: HardwareType) -> HardwareMetadata {
        HardwareMetadata {
            uid: "abcdefgh12345678".to_string(),
            name: "virtual test".to_string(),
            ecosystem_uid: "aaaaaaaa".to_string(),
            address: "GPIO_17".parse::<HardwareAddress>().unwrap(),
            h_type,
            level: HardwareLevel::Environment,
            model: "virtualSwitch".to_string(),
            measures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn switch_remembers_state() {
        let switch = VirtualSwitch {
            metadata: metadata(HardwareType::Heater),
            on: Cell::new(false),
        };
        switch.turn_on().await.unwrap();
        assert!(switch.is_on());
        switch.turn_off().await.unwrap();
        assert!(!switch.is_on());
    }

    #[tokio::test]
    async fn sensors_produce_their_measures() {
        let sensor = VirtualSensor {
            metadata: metadata(HardwareType::Sensor),
            measure_set: VirtualMeasureSet::TemperatureHumidity,
        };
        let records = sensor.get_data().await.unwrap();
        let measures: Vec<&str> = records.iter().map(|r| r.measure.as_str()).collect();
        assert_eq!(measures, vec!["temperature", "humidity"]);
        for record in &records {
            assert!(record.value > 0.0);
        }
    }

    #[tokio::test]
    async fn camera_produces_full_frames() {
        let camera = VirtualCamera {
            metadata: metadata(HardwareType::Camera),
        };
        let frame = camera.capture().await.unwrap();
        assert_eq!(frame.pixels.len(), (frame.width * frame.height) as usize);
    }
}
