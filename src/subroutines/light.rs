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

//! The light subroutine: computes the "should be lit" status and desired
//! PWM level on every tick, and drives the light actuator handler through
//! its hysteretic PID.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveTime, Utc};
use futures_util::future::join_all;
use log::{info, warn};
use tokio::time::timeout;

use crate::config::ecosystem::{
    ClimateConfig, ClimateParameter, LightingHours, LightingMethod,
};
use crate::config::hardware::{HardwareType, HardwareUid};
use crate::ecosystem::Ecosystem;
use crate::hardware::{Hardware, HardwareDriver, LightSensor};
use crate::subroutines::{Subroutine, SubroutineCore, SubroutineKind};
use crate::utils::is_time_between;

/// The photon targets used when no `light` climate parameter is configured.
const DEFAULT_LIGHT_CLIMATE: ClimateConfig = ClimateConfig {
    day: 250_000.0,
    night: -30_000.0,
    hysteresis: 0.0,
    alarm: None,
};

pub struct Light {
    core: SubroutineCore,
    loop_period: Duration,
    /// Lazily cached list of owned light sensors, reset on refresh.
    light_sensors: RefCell<Option<Vec<HardwareDriver>>>,
    any_dimmable: Cell<Option<bool>>,
}

impl Light {
    pub fn new(ecosystem: Weak<Ecosystem>) -> Rc<Self> {
        let loop_period = ecosystem
            .upgrade()
            .map(|ecosystem| ecosystem.app_config().light_loop_period)
            .unwrap_or(Duration::from_millis(500));
        Rc::new(Self {
            core: SubroutineCore::new(SubroutineKind::Light, ecosystem),
            loop_period,
            light_sensors: RefCell::new(None),
            any_dimmable: Cell::new(None),
        })
    }

    fn reset_hardware_caches(&self) {
        *self.light_sensors.borrow_mut() = None;
        self.any_dimmable.set(None);
    }

    fn light_sensors(&self) -> Vec<HardwareDriver> {
        if self.light_sensors.borrow().is_none() {
            let sensors = self
                .core
                .ecosystem()
                .map(|ecosystem| {
                    ecosystem
                        .hardware_of_type(HardwareType::Sensor)
                        .into_iter()
                        .filter(|driver| driver.as_light_sensor().is_some())
                        .collect()
                })
                .unwrap_or_default();
            *self.light_sensors.borrow_mut() = Some(sensors);
        }
        self.light_sensors.borrow().clone().unwrap_or_default()
    }

    fn any_dimmable_light(&self) -> bool {
        if let Some(cached) = self.any_dimmable.get() {
            return cached;
        }
        let any_dimmable = self
            .core
            .hardware()
            .iter()
            .any(|driver| driver.as_dimmer().is_some());
        self.any_dimmable.set(Some(any_dimmable));
        any_dimmable
    }

    /// Whether the lights should be on at `now`, given the effective
    /// lighting method and hours.
    fn compute_target_status(method: LightingMethod, hours: &LightingHours, now: NaiveTime) -> bool {
        match method {
            LightingMethod::Elongate => {
                (hours.morning_start <= now && now <= hours.morning_end)
                    || (hours.evening_start <= now && now <= hours.evening_end)
            }
            LightingMethod::Fixed => {
                is_time_between(hours.morning_start, hours.evening_end, now)
            }
        }
    }

    /// The PID target and hysteresis for `now`: the day or night photon
    /// target, both scaled by the chaos factor.
    fn compute_target(&self, now: NaiveTime) -> Result<(f64, f64, bool)> {
        let config = self.core.config()?;
        let climate_cfg = config
            .get_climate_parameter(ClimateParameter::Light)
            .unwrap_or(DEFAULT_LIGHT_CLIMATE);
        let chaos_factor = config.get_chaos_factor(Utc::now());
        let target_status =
            Self::compute_target_status(config.lighting_method(), &config.lighting_hours(), now);
        let target = if target_status {
            climate_cfg.day * chaos_factor
        } else {
            climate_cfg.night * chaos_factor
        };
        let hysteresis = climate_cfg.hysteresis * chaos_factor;
        Ok((target, hysteresis, target_status))
    }

    /// Mean ambient lux over every owned light sensor, each read bounded to
    /// half the loop period. 0.0 without sensors or without a dimmable
    /// light to use the information.
    async fn get_ambient_light_level(&self) -> f64 {
        let sensors = self.light_sensors();
        if sensors.is_empty() || !self.any_dimmable_light() {
            return 0.0;
        }
        let budget = self.loop_period / 2;
        let reads = sensors.iter().map(|driver| {
            let driver = Rc::clone(driver);
            async move {
                let sensor = driver.as_light_sensor()?;
                match timeout(budget, sensor.get_lux()).await {
                    Ok(Ok(lux)) => Some(lux),
                    Ok(Err(err)) => {
                        warn!("Light sensor '{}' failed: {err}", driver.name());
                        None
                    }
                    Err(_) => {
                        warn!("Light sensor '{}' timed out", driver.name());
                        None
                    }
                }
            }
        });
        let values: Vec<f64> = join_all(reads).await.into_iter().flatten().collect();
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    async fn update_light_actuators(&self) -> Result<()> {
        let ecosystem = self.core.ecosystem()?;
        let handler = ecosystem.actuator_hub().get_handler(HardwareType::Light)?;
        let (target, hysteresis, _) = self.compute_target(Local::now().time())?;
        let ambient = self.get_ambient_light_level().await;
        let output = {
            let pid = handler.pid();
            let mut pid = pid.borrow_mut();
            pid.set_target(target);
            pid.set_hysteresis(hysteresis);
            pid.update_pid(ambient)
        };
        if handler.compute_expected_status(output) {
            handler.turn_on().await;
            handler.set_level(output.clamp(0.0, 100.0)).await;
        } else {
            handler.turn_off().await;
            handler.set_level(0.0).await;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Subroutine for Light {
    fn kind(&self) -> SubroutineKind {
        SubroutineKind::Light
    }

    fn core(&self) -> &SubroutineCore {
        &self.core
    }

    fn compute_if_manageable(&self) -> bool {
        let Ok(config) = self.core.config() else {
            return false;
        };
        if config.get_io_group_uids(HardwareType::Light).is_empty() {
            warn!(
                "No light hardware detected in ecosystem {}",
                self.core.ecosystem_name()
            );
            return false;
        }
        true
    }

    fn hardware_needed_uids(&self) -> HashSet<HardwareUid> {
        self.core
            .config()
            .map(|config| {
                config
                    .get_io_group_uids(HardwareType::Light)
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn start(self: Rc<Self>) -> Result<()> {
        let ecosystem = self.core.ecosystem()?;
        let needed = self.hardware_needed_uids();
        self.core.refresh_hardware(&needed).await?;
        // recompute the lighting hours before the first tick
        ecosystem.config().reset_nycthemeral_caches();
        let _ = ecosystem.config().lighting_hours();
        let handler = ecosystem.actuator_hub().get_handler(HardwareType::Light)?;
        handler.pid().borrow_mut().reset();
        handler.activate();
        info!(
            "Starting the light loop of {}. It will run every {:.2} s.",
            self.core.ecosystem_name(),
            self.loop_period.as_secs_f64()
        );
        self.core
            .spawn_routine_loop(Rc::clone(&self) as Rc<dyn Subroutine>, self.loop_period);
        self.core.started.set(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("Stopping the light loop of {}.", self.core.ecosystem_name());
        self.core.cancel_routine_loop();
        if let Ok(ecosystem) = self.core.ecosystem() {
            if let Ok(handler) = ecosystem.actuator_hub().get_handler(HardwareType::Light) {
                handler.deactivate();
                handler.pid().borrow_mut().reset();
            }
        }
        self.core.release_all_hardware().await;
        self.reset_hardware_caches();
        self.core.started.set(false);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let needed = self.hardware_needed_uids();
        self.core.refresh_hardware(&needed).await?;
        // hardware may have been swapped live
        self.reset_hardware_caches();
        if let Ok(ecosystem) = self.core.ecosystem() {
            if let Ok(handler) = ecosystem.actuator_hub().get_handler(HardwareType::Light) {
                handler.pid().borrow_mut().reset();
            }
            ecosystem.config().reset_nycthemeral_caches();
            let _ = ecosystem.config().lighting_hours();
        }
        Ok(())
    }

    async fn routine(&self) -> Result<()> {
        self.update_light_actuators().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn hours() -> LightingHours {
        LightingHours {
            morning_start: time(8, 0),
            morning_end: time(10, 0),
            evening_start: time(18, 0),
            evening_end: time(20, 0),
        }
    }

    #[test]
    fn fixed_method_lights_the_whole_span() {
        let hours = hours();
        for (now, lit) in [
            (time(7, 59), false),
            (time(8, 0), true),
            (time(12, 0), true),
            (time(19, 59), true),
            (time(20, 0), false),
        ] {
            assert_eq!(
                Light::compute_target_status(LightingMethod::Fixed, &hours, now),
                lit,
                "at {now}"
            );
        }
    }

    #[test]
    fn elongate_method_lights_morning_and_evening_only() {
        let hours = hours();
        for (now, lit) in [
            (time(7, 59), false),
            (time(9, 0), true),
            (time(10, 0), true),
            (time(12, 0), false),
            (time(18, 30), true),
            (time(20, 1), false),
        ] {
            assert_eq!(
                Light::compute_target_status(LightingMethod::Elongate, &hours, now),
                lit,
                "at {now}"
            );
        }
    }
}
