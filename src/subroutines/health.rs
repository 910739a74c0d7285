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

//! The health subroutine: scheduled plant imaging and index scoring.
//!
//! Once a day each owned camera takes a frame, optionally under forced
//! lighting, and every enabled vegetation index is computed from the pixel
//! array into a `HealthRecord` per (camera, measure).

use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use log::{debug, error, info, warn};
use strum::IntoEnumIterator;
use tokio::time::sleep;

use crate::actuators::{ActuatorMode, ActuatorTurnTo};
use crate::config::ecosystem::ManagementFlags;
use crate::config::hardware::{HardwareType, HardwareUid};
use crate::database::Database;
use crate::ecosystem::Ecosystem;
use crate::events::payloads::{HealthData, HealthRecord};
use crate::hardware::{Camera, Hardware, HardwareDriver};
use crate::images::{image_mean_of_formula, HealthIndex};
use crate::subroutines::{Subroutine, SubroutineCore, SubroutineKind};

/// Settle time for camera auto-exposure after forcing the lights on.
const EXPOSURE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_LOGGING_TIME: NaiveTime = NaiveTime::MIN;

pub struct Health {
    core: SubroutineCore,
    logging_time: NaiveTime,
}

impl Health {
    pub fn new(ecosystem: Weak<Ecosystem>) -> Rc<Self> {
        let logging_time = ecosystem
            .upgrade()
            .and_then(|ecosystem| parse_hhmm(&ecosystem.app_config().health_logging_time))
            .unwrap_or(DEFAULT_LOGGING_TIME);
        Rc::new(Self {
            core: SubroutineCore::new(SubroutineKind::Health, ecosystem),
            logging_time,
        })
    }

    /// The indices a camera is configured to measure.
    fn enabled_indices(camera: &HardwareDriver) -> Vec<HealthIndex> {
        camera
            .metadata()
            .measures
            .iter()
            .filter_map(|spec| HealthIndex::from_str(&spec.measure).ok())
            .collect()
    }

    /// Remembers the light handler state, forces the lights on, and returns
    /// the restore action to run after the captures.
    async fn force_lights_on(&self) -> Result<Option<(ActuatorMode, bool)>> {
        let ecosystem = self.core.ecosystem()?;
        if !ecosystem.config().get_management(ManagementFlags::LIGHT) {
            return Ok(None);
        }
        let handler = ecosystem.actuator_hub().get_handler(HardwareType::Light)?;
        let previous = (handler.mode(), handler.status());
        handler.turn_to(ActuatorTurnTo::On, None).await;
        sleep(EXPOSURE_DELAY).await;
        Ok(Some(previous))
    }

    async fn restore_lights(&self, previous: Option<(ActuatorMode, bool)>) -> Result<()> {
        let Some((mode, status)) = previous else {
            return Ok(());
        };
        let ecosystem = self.core.ecosystem()?;
        let handler = ecosystem.actuator_hub().get_handler(HardwareType::Light)?;
        match mode {
            ActuatorMode::Automatic => handler.turn_to(ActuatorTurnTo::Automatic, None).await,
            ActuatorMode::Manual => {
                let turn_to = if status {
                    ActuatorTurnTo::On
                } else {
                    ActuatorTurnTo::Off
                };
                handler.turn_to(turn_to, None).await;
            }
        }
        Ok(())
    }

    /// Captures every owned camera concurrently and scores every enabled
    /// index per frame.
    async fn capture_and_score(&self) -> Vec<HealthRecord> {
        let timestamp = Utc::now();
        let records = std::cell::RefCell::new(Vec::new());
        moro_local::async_scope!(|scope| {
            for driver in self.core.hardware() {
                if driver.as_camera().is_none() {
                    continue;
                }
                let records = &records;
                scope.spawn(async move {
                    let camera = driver.as_camera().expect("checked above");
                    let frame = match camera.capture().await {
                        Ok(frame) => frame,
                        Err(err) => {
                            error!("Camera '{}' failed to capture: {err}", driver.name());
                            return;
                        }
                    };
                    for index in Self::enabled_indices(&driver) {
                        match image_mean_of_formula(&frame, index.formula()) {
                            Ok(value) => records.borrow_mut().push(HealthRecord {
                                camera_uid: driver.uid().clone(),
                                measure: index.to_string(),
                                value,
                                timestamp,
                            }),
                            Err(err) => {
                                warn!(
                                    "Could not compute {index} for '{}': {err}",
                                    driver.name()
                                );
                            }
                        }
                    }
                });
            }
        })
        .await;
        records.into_inner()
    }

    async fn update_health_data(&self) -> Result<()> {
        let ecosystem = self.core.ecosystem()?;
        let previous_light_state = self.force_lights_on().await?;
        let records = self.capture_and_score().await;
        self.restore_lights(previous_light_state).await?;
        if records.is_empty() {
            warn!(
                "The health routine of {} produced no record",
                self.core.ecosystem_name()
            );
            return Ok(());
        }
        let data = HealthData {
            timestamp: Utc::now(),
            records,
        };
        ecosystem.set_plants_health(Some(data.clone()));
        let Some(engine) = ecosystem.engine() else {
            return Ok(());
        };
        if let Some(database) = engine.database() {
            if let Err(err) = database.log_health_data(ecosystem.uid(), &data).await {
                error!("Encountered an error while logging health data: {err}");
            }
        }
        if let Some(event_handler) = engine.event_handler() {
            event_handler.send_health_data(ecosystem.uid(), &data).await;
        }
        Ok(())
    }
}

fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    let (hours, minutes) = raw.split_once(['h', 'H'])?;
    NaiveTime::from_hms_opt(hours.trim().parse().ok()?, minutes.trim().parse().ok()?, 0)
}

#[async_trait(?Send)]
impl Subroutine for Health {
    fn kind(&self) -> SubroutineKind {
        SubroutineKind::Health
    }

    fn core(&self) -> &SubroutineCore {
        &self.core
    }

    fn compute_if_manageable(&self) -> bool {
        let Ok(config) = self.core.config() else {
            return false;
        };
        let index_names: Vec<String> = HealthIndex::iter().map(|index| index.to_string()).collect();
        for camera_uid in config.get_io_group_uids(HardwareType::Camera) {
            let Ok(camera) = config.get_hardware_config(&camera_uid) else {
                continue;
            };
            if camera
                .measure_names()
                .any(|measure| index_names.iter().any(|index| index == measure))
            {
                return true;
            }
        }
        warn!(
            "No health camera detected in ecosystem {}",
            self.core.ecosystem_name()
        );
        false
    }

    fn hardware_needed_uids(&self) -> HashSet<HardwareUid> {
        self.core
            .config()
            .map(|config| {
                config
                    .get_io_group_uids(HardwareType::Camera)
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn start(self: Rc<Self>) -> Result<()> {
        let needed = self.hardware_needed_uids();
        self.core.refresh_hardware(&needed).await?;
        info!(
            "Starting the health subroutine of {}. It will run every day at {}.",
            self.core.ecosystem_name(),
            self.logging_time.format("%Hh%M")
        );
        self.core
            .spawn_daily_routine_loop(Rc::clone(&self) as Rc<dyn Subroutine>, self.logging_time);
        self.core.started.set(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!(
            "Stopping the health subroutine of {}.",
            self.core.ecosystem_name()
        );
        self.core.cancel_routine_loop();
        if let Ok(ecosystem) = self.core.ecosystem() {
            ecosystem.set_plants_health(None);
        }
        self.core.release_all_hardware().await;
        self.core.started.set(false);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let needed = self.hardware_needed_uids();
        self.core.refresh_hardware(&needed).await
    }

    async fn routine(&self) -> Result<()> {
        let start = tokio::time::Instant::now();
        debug!("Starting health data update routine ...");
        self.update_health_data().await?;
        debug!(
            "Health data update finished in {:.1} s.",
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("00h00"), NaiveTime::from_hms_opt(0, 0, 0));
        assert_eq!(parse_hhmm("6h30"), NaiveTime::from_hms_opt(6, 30, 0));
        assert_eq!(parse_hhmm("0630"), None);
    }
}
