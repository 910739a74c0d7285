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

//! The climate subroutine: one hysteretic PID per regulated parameter,
//! fed from the shared reading cache and driving the increase/decrease
//! actuator couple.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveTime, Utc};
use log::{debug, error, info, warn};

use crate::actuators::ActuatorHandler;
use crate::config::ecosystem::{ClimateParameter, ManagementFlags, PeriodOfDay};
use crate::config::hardware::{HardwareType, HardwareUid};
use crate::ecosystem::Ecosystem;
use crate::subroutines::{Subroutine, SubroutineCore, SubroutineKind};
use crate::utils::is_time_between;

/// Consecutive empty readings tolerated before the subroutine stops itself.
const MISSES_BEFORE_STOP: u32 = 5;

/// The parameters a regulator couple exists for.
const REGULABLE: [ClimateParameter; 2] = [ClimateParameter::Temperature, ClimateParameter::Humidity];

pub struct Climate {
    core: SubroutineCore,
    loop_period: Duration,
    sensor_miss: Cell<u32>,
    regulated: RefCell<HashSet<ClimateParameter>>,
    activated_handlers: RefCell<Vec<HardwareType>>,
}

impl Climate {
    pub fn new(ecosystem: Weak<Ecosystem>) -> Rc<Self> {
        let loop_period = ecosystem
            .upgrade()
            .map(|ecosystem| ecosystem.app_config().climate_loop_period)
            .unwrap_or(Duration::from_secs(10));
        Rc::new(Self {
            core: SubroutineCore::new(SubroutineKind::Climate, ecosystem),
            loop_period,
            sensor_miss: Cell::new(0),
            regulated: RefCell::new(HashSet::new()),
            activated_handlers: RefCell::new(Vec::new()),
        })
    }

    pub fn regulated(&self) -> HashSet<ClimateParameter> {
        self.regulated.borrow().clone()
    }

    /// A parameter is regulated iff it has a climate target, at least one
    /// actuator of its couple, and a sensor measuring it.
    fn compute_regulated(&self) -> HashSet<ClimateParameter> {
        let Ok(config) = self.core.config() else {
            return HashSet::new();
        };
        let measures = config.sensor_measures();
        let mut regulated = HashSet::new();
        for parameter in REGULABLE {
            if config.get_climate_parameter(parameter).is_err() {
                continue;
            }
            let couple = parameter.actuator_couple();
            let has_actuator = !config.get_io_group_uids(couple.increase).is_empty()
                || couple
                    .decrease
                    .is_some_and(|decrease| !config.get_io_group_uids(decrease).is_empty());
            if !has_actuator {
                continue;
            }
            if !measures.iter().any(|measure| measure == &parameter.to_string()) {
                continue;
            }
            regulated.insert(parameter);
        }
        regulated
    }

    fn update_regulated(&self) {
        let regulated = self.compute_regulated();
        if regulated.is_empty() {
            debug!(
                "No regulable climate parameter found for ecosystem {}",
                self.core.ecosystem_name()
            );
        }
        *self.regulated.borrow_mut() = regulated;
    }

    /// Day or night, preferably from the light subroutine's lighting hours,
    /// falling back to the configured nycthemeral span.
    fn period_of_day(&self, now: NaiveTime) -> Result<PeriodOfDay> {
        let ecosystem = self.core.ecosystem()?;
        let config = ecosystem.config();
        if ecosystem.subroutine_is_started(SubroutineKind::Light) {
            let hours = config.lighting_hours();
            if is_time_between(hours.morning_start, hours.evening_end, now) {
                return Ok(PeriodOfDay::Day);
            }
            return Ok(PeriodOfDay::Night);
        }
        Ok(config.period_of_day(now))
    }

    async fn drive_couple(
        &self,
        increase: &Rc<ActuatorHandler>,
        decrease: Option<&Rc<ActuatorHandler>>,
        output: f64,
    ) {
        if increase.compute_expected_status(output) {
            increase.turn_on().await;
            increase.set_level(output.clamp(0.0, 100.0)).await;
        } else {
            increase.turn_off().await;
            increase.set_level(0.0).await;
        }
        if let Some(decrease) = decrease {
            // the decrease side sees the mirrored signal
            if decrease.compute_expected_status(-output) {
                decrease.turn_on().await;
                decrease.set_level((-output).clamp(0.0, 100.0)).await;
            } else {
                decrease.turn_off().await;
                decrease.set_level(0.0).await;
            }
        }
    }

    async fn regulate(&self) -> Result<()> {
        let ecosystem = self.core.ecosystem()?;
        let config = ecosystem.config();
        let Some(sensors_data) = ecosystem.sensors_data() else {
            let misses = self.sensor_miss.get() + 1;
            self.sensor_miss.set(misses);
            debug!(
                "No sensor data found, the climate routine will try again {} times \
                 before stopping.",
                MISSES_BEFORE_STOP.saturating_sub(misses)
            );
            return Ok(());
        };
        self.sensor_miss.set(0);
        let pod = self.period_of_day(Local::now().time())?;
        let chaos_factor = config.get_chaos_factor(Utc::now());
        for parameter in self.regulated() {
            let Some(value) = sensors_data.get_average(&parameter.to_string()) else {
                continue;
            };
            let climate_cfg = match config.get_climate_parameter(parameter) {
                Ok(climate_cfg) => climate_cfg,
                Err(_) => continue,
            };
            let target = match pod {
                PeriodOfDay::Day => climate_cfg.day,
                PeriodOfDay::Night => climate_cfg.night,
            } * chaos_factor;
            let couple = parameter.actuator_couple();
            let hub = ecosystem.actuator_hub();
            let increase = hub.get_handler(couple.increase)?;
            let decrease = couple
                .decrease
                .map(|decrease| hub.get_handler(decrease))
                .transpose()?;
            let output = {
                let pid = hub.get_pid(parameter);
                let mut pid = pid.borrow_mut();
                pid.set_target(target);
                pid.set_hysteresis(climate_cfg.hysteresis);
                pid.update_pid(value)
            };
            self.drive_couple(&increase, decrease.as_ref(), output).await;
        }
        Ok(())
    }

    fn activate_handlers(&self) -> Result<()> {
        let ecosystem = self.core.ecosystem()?;
        let hub = ecosystem.actuator_hub();
        let mut activated = self.activated_handlers.borrow_mut();
        for parameter in self.regulated() {
            let couple = parameter.actuator_couple();
            for h_type in [Some(couple.increase), couple.decrease].into_iter().flatten() {
                let handler = hub.get_handler(h_type)?;
                handler.activate();
                activated.push(h_type);
            }
        }
        Ok(())
    }

    fn deactivate_handlers(&self) {
        let Ok(ecosystem) = self.core.ecosystem() else {
            return;
        };
        let hub = ecosystem.actuator_hub();
        for h_type in self.activated_handlers.borrow_mut().drain(..) {
            if let Ok(handler) = hub.get_handler(h_type) {
                handler.deactivate();
            }
        }
    }

    /// Self-stop after too many missed readings: the loop dies and the
    /// actuators are left in their last state.
    async fn stop_after_miss_cascade(&self) {
        error!(
            "Maximum number of sensor data misses reached, stopping the climate \
             subroutine of {}.",
            self.core.ecosystem_name()
        );
        self.core.cancel_routine_loop();
        self.deactivate_handlers();
        self.core.release_all_hardware_quietly();
        self.regulated.borrow_mut().clear();
        self.core.started.set(false);
    }

    fn hardware_uids_of_couples(&self) -> HashSet<HardwareUid> {
        let Ok(config) = self.core.config() else {
            return HashSet::new();
        };
        let mut needed = HashSet::new();
        for parameter in REGULABLE {
            let couple = parameter.actuator_couple();
            for h_type in [Some(couple.increase), couple.decrease].into_iter().flatten() {
                needed.extend(config.get_io_group_uids(h_type));
            }
        }
        needed
    }
}

#[async_trait(?Send)]
impl Subroutine for Climate {
    fn kind(&self) -> SubroutineKind {
        SubroutineKind::Climate
    }

    fn core(&self) -> &SubroutineCore {
        &self.core
    }

    fn compute_if_manageable(&self) -> bool {
        if self.compute_regulated().is_empty() {
            warn!(
                "No parameter that could be regulated was found for ecosystem {}.",
                self.core.ecosystem_name()
            );
            return false;
        }
        true
    }

    fn hardware_needed_uids(&self) -> HashSet<HardwareUid> {
        self.hardware_uids_of_couples()
    }

    async fn start(self: Rc<Self>) -> Result<()> {
        self.update_regulated();
        let needed = self.hardware_needed_uids();
        self.core.refresh_hardware(&needed).await?;
        self.activate_handlers()?;
        self.sensor_miss.set(0);
        info!(
            "Starting the climate routine of {}. It will run every {:.0} s.",
            self.core.ecosystem_name(),
            self.loop_period.as_secs_f64()
        );
        self.core
            .spawn_routine_loop(Rc::clone(&self) as Rc<dyn Subroutine>, self.loop_period);
        self.core.started.set(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!(
            "Stopping the climate routine of {}.",
            self.core.ecosystem_name()
        );
        self.core.cancel_routine_loop();
        self.deactivate_handlers();
        self.core.release_all_hardware().await;
        self.regulated.borrow_mut().clear();
        self.core.started.set(false);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.deactivate_handlers();
        self.update_regulated();
        let needed = self.hardware_needed_uids();
        self.core.refresh_hardware(&needed).await?;
        self.activate_handlers()?;
        Ok(())
    }

    async fn routine(&self) -> Result<()> {
        if !self.core.started.get() {
            return Ok(());
        }
        self.regulate().await?;
        if self.sensor_miss.get() >= MISSES_BEFORE_STOP {
            self.stop_after_miss_cascade().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_temperature_and_humidity_are_regulable() {
        assert_eq!(
            REGULABLE,
            [ClimateParameter::Temperature, ClimateParameter::Humidity]
        );
    }
}
