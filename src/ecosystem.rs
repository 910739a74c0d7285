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

//! One isolated growing space: its subroutines, its live hardware and its
//! actuator hub.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info};

use crate::actuators::{ActuatorHub, ActuatorState, ActuatorTurnTo};
use crate::app_config::AppConfig;
use crate::config::ecosystem::{
    EcosystemConfig, EcosystemUid, EnvironmentConfig, ManagementConfig,
};
use crate::config::hardware::{HardwareConfig, HardwareType, HardwareUid};
use crate::engine::Engine;
use crate::errors::GaiaError;
use crate::events::payloads::{HealthData, LightData, SensorsData};
use crate::hardware::{Hardware, HardwareDriver};
use crate::subroutines::climate::Climate;
use crate::subroutines::health::Health;
use crate::subroutines::light::Light;
use crate::subroutines::sensors::Sensors;
use crate::subroutines::{Subroutine, SubroutineKind, SUBROUTINE_ORDER};

pub struct Ecosystem {
    config: Rc<EcosystemConfig>,
    app_config: Rc<AppConfig>,
    engine: Weak<Engine>,
    weak_self: Weak<Ecosystem>,
    started: Cell<bool>,
    subroutines: RefCell<HashMap<SubroutineKind, Rc<dyn Subroutine>>>,
    /// The live driver objects, keyed by hardware uid. Drivers are owned by
    /// exactly one subroutine; this map is the shared read view the
    /// actuator handlers go through.
    hardware: RefCell<HashMap<HardwareUid, HardwareDriver>>,
    actuator_hub: ActuatorHub,
    /// The shared reading cache: written by the sensors subroutine only.
    sensors_data: RefCell<Option<SensorsData>>,
    plants_health: RefCell<Option<HealthData>>,
}

impl Ecosystem {
    pub fn new(
        config: Rc<EcosystemConfig>,
        app_config: Rc<AppConfig>,
        engine: Weak<Engine>,
    ) -> Rc<Self> {
        let ecosystem = Rc::new_cyclic(|weak_self: &Weak<Ecosystem>| {
            let actuator_hub = ActuatorHub::new();
            actuator_hub.attach_ecosystem(weak_self);
            Self {
                config,
                app_config,
                engine,
                weak_self: weak_self.clone(),
                started: Cell::new(false),
                subroutines: RefCell::new(HashMap::new()),
                hardware: RefCell::new(HashMap::new()),
                actuator_hub,
                sensors_data: RefCell::new(None),
                plants_health: RefCell::new(None),
            }
        });
        ecosystem.init_subroutines();
        ecosystem
    }

    fn init_subroutines(&self) {
        let weak = self.weak_self.clone();
        let mut subroutines = self.subroutines.borrow_mut();
        subroutines.insert(
            SubroutineKind::Sensors,
            Sensors::new(weak.clone()) as Rc<dyn Subroutine>,
        );
        subroutines.insert(
            SubroutineKind::Light,
            Light::new(weak.clone()) as Rc<dyn Subroutine>,
        );
        subroutines.insert(
            SubroutineKind::Climate,
            Climate::new(weak.clone()) as Rc<dyn Subroutine>,
        );
        subroutines.insert(SubroutineKind::Health, Health::new(weak) as Rc<dyn Subroutine>);
    }

    // -----------------------------------------------------------------
    //  Accessors
    // -----------------------------------------------------------------

    pub fn uid(&self) -> &EcosystemUid {
        self.config.uid()
    }

    pub fn name(&self) -> String {
        self.config.name()
    }

    pub fn config(&self) -> Rc<EcosystemConfig> {
        Rc::clone(&self.config)
    }

    pub fn app_config(&self) -> &Rc<AppConfig> {
        &self.app_config
    }

    pub fn engine(&self) -> Option<Rc<Engine>> {
        self.engine.upgrade()
    }

    pub fn virtualization(&self) -> bool {
        self.app_config.virtualization
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn actuator_hub(&self) -> &ActuatorHub {
        &self.actuator_hub
    }

    pub fn get_subroutine(&self, kind: SubroutineKind) -> Option<Rc<dyn Subroutine>> {
        self.subroutines.borrow().get(&kind).cloned()
    }

    pub fn subroutine_is_started(&self, kind: SubroutineKind) -> bool {
        self.get_subroutine(kind)
            .map(|subroutine| subroutine.is_started())
            .unwrap_or(false)
    }

    pub fn subroutines_started(&self) -> Vec<SubroutineKind> {
        SUBROUTINE_ORDER
            .into_iter()
            .filter(|kind| self.subroutine_is_started(*kind))
            .collect()
    }

    /// The subroutines enabled by the management bitmap, in start order.
    pub fn enabled_subroutines(&self) -> Vec<SubroutineKind> {
        let flags = self.config.management_flags();
        SUBROUTINE_ORDER
            .into_iter()
            .filter(|kind| flags.contains(kind.management_flag()))
            .collect()
    }

    // -----------------------------------------------------------------
    //  Hardware map
    // -----------------------------------------------------------------

    pub fn mount_hardware(&self, driver: &HardwareDriver) {
        self.hardware
            .borrow_mut()
            .insert(driver.uid().clone(), Rc::clone(driver));
    }

    pub fn unmount_hardware(&self, uid: &str) {
        self.hardware.borrow_mut().remove(uid);
    }

    pub fn hardware_uids(&self) -> Vec<HardwareUid> {
        self.hardware.borrow().keys().cloned().collect()
    }

    pub fn hardware_of_type(&self, h_type: HardwareType) -> Vec<HardwareDriver> {
        self.hardware
            .borrow()
            .values()
            .filter(|driver| driver.h_type() == h_type)
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------
    //  Lifecycle
    // -----------------------------------------------------------------

    /// Starts the enabled subroutines in the fixed order. Raises
    /// `StoppingEcosystem` when nothing can run; a failing subroutine start
    /// stops those already started and re-raises.
    pub async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Err(anyhow::anyhow!(
                "Ecosystem {} is already running",
                self.name()
            ));
        }
        info!("Starting the ecosystem {}", self.name());
        let enabled = self.enabled_subroutines();
        if enabled.is_empty() {
            return Err(GaiaError::StoppingEcosystem.into());
        }
        let mut started: Vec<Rc<dyn Subroutine>> = Vec::new();
        for kind in enabled {
            let subroutine = self.get_subroutine(kind).expect("subroutines are initialized");
            subroutine.update_manageable();
            if !subroutine.is_manageable() {
                continue;
            }
            match Rc::clone(&subroutine).start().await {
                Ok(()) => started.push(subroutine),
                Err(err) => {
                    error!(
                        "Starting the {kind} subroutine of {} failed: {err}",
                        self.name()
                    );
                    for running in started.iter().rev() {
                        if let Err(stop_err) = running.stop().await {
                            error!(
                                "Could not undo the {} subroutine start: {stop_err}",
                                running.kind()
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        if started.is_empty() {
            return Err(GaiaError::StoppingEcosystem.into());
        }
        self.started.set(true);
        debug!("Ecosystem {} successfully started", self.name());
        Ok(())
    }

    /// Stops the subroutines in reverse order. If any refuses to stop the
    /// ecosystem stays "started" so the caller can retry.
    pub async fn stop(&self) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }
        info!("Stopping the ecosystem {}", self.name());
        for kind in SUBROUTINE_ORDER.into_iter().rev() {
            let Some(subroutine) = self.get_subroutine(kind) else {
                continue;
            };
            if !subroutine.is_started() {
                continue;
            }
            if let Err(err) = subroutine.stop().await {
                error!("Stopping the {kind} subroutine failed: {err}");
            }
        }
        if !self.subroutines_started().is_empty() {
            return Err(anyhow::anyhow!(
                "Failed to stop ecosystem {}",
                self.name()
            ));
        }
        self.started.set(false);
        debug!("Ecosystem {} successfully stopped", self.name());
        Ok(())
    }

    /// Reconciles the subroutines with the current config: stops the ones
    /// that became unmanageable, starts the newly enabled ones, refreshes
    /// the rest. Stops the whole ecosystem when nothing remains running.
    pub async fn refresh_subroutines(&self) -> Result<()> {
        for kind in SUBROUTINE_ORDER {
            let subroutine = self.get_subroutine(kind).expect("subroutines are initialized");
            subroutine.update_manageable();
            if subroutine.is_started() && !subroutine.is_manageable() {
                if let Err(err) = subroutine.stop().await {
                    error!("Stopping the unmanageable {kind} subroutine failed: {err}");
                }
            } else if !subroutine.is_started() && subroutine.is_manageable() {
                if let Err(err) = Rc::clone(&subroutine).start().await {
                    error!("Starting the {kind} subroutine failed: {err}");
                }
            } else if subroutine.is_started() {
                if let Err(err) = subroutine.refresh().await {
                    error!("Refreshing the {kind} subroutine failed: {err}");
                }
            }
        }
        if self.is_started() && self.subroutines_started().is_empty() {
            info!("No subroutine is running, stopping the ecosystem {}", self.name());
            self.started.set(false);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    //  Actuators
    // -----------------------------------------------------------------

    /// Turns one actuator type to the requested mode. Errors are logged,
    /// never raised to the caller.
    pub async fn turn_actuator(
        &self,
        h_type: HardwareType,
        turn_to: ActuatorTurnTo,
        countdown: Option<Duration>,
    ) {
        match self.actuator_hub.get_handler(h_type) {
            Ok(handler) => {
                handler.turn_to(turn_to, countdown).await;
                if h_type == HardwareType::Light {
                    self.broadcast_light_data();
                }
            }
            Err(err) => {
                error!(
                    "Cannot turn {h_type} to {turn_to} in ecosystem {}: {err}",
                    self.name()
                );
            }
        }
    }

    pub fn actuator_states(&self) -> HashMap<HardwareType, ActuatorState> {
        self.actuator_hub.as_states()
    }

    /// Fire-and-forget `actuator_data` broadcast, callable from
    /// non-async contexts (the handler's change detection).
    pub fn broadcast_actuator_data(&self) {
        let Some(engine) = self.engine() else {
            return;
        };
        let Some(event_handler) = engine.event_handler() else {
            return;
        };
        let Some(ecosystem) = self.weak_self.upgrade() else {
            return;
        };
        tokio::task::spawn_local(async move {
            event_handler.send_actuator_data(&ecosystem).await;
        });
    }

    pub fn broadcast_light_data(&self) {
        let Some(engine) = self.engine() else {
            return;
        };
        let Some(event_handler) = engine.event_handler() else {
            return;
        };
        let Some(ecosystem) = self.weak_self.upgrade() else {
            return;
        };
        tokio::task::spawn_local(async move {
            event_handler.send_light_data(&ecosystem).await;
        });
    }

    // -----------------------------------------------------------------
    //  Read accessors / payloads
    // -----------------------------------------------------------------

    pub fn sensors_data(&self) -> Option<SensorsData> {
        self.sensors_data.borrow().clone()
    }

    /// Atomically publishes a new reading. Only the sensors subroutine
    /// writes here.
    pub fn set_sensors_data(&self, data: Option<SensorsData>) {
        *self.sensors_data.borrow_mut() = data;
    }

    pub fn plants_health(&self) -> Option<HealthData> {
        self.plants_health.borrow().clone()
    }

    pub fn set_plants_health(&self, data: Option<HealthData>) {
        *self.plants_health.borrow_mut() = data;
    }

    pub fn light_info(&self) -> LightData {
        let cycle = self.config.nycthemeral_cycle();
        LightData {
            method: self.config.lighting_method(),
            span: self.config.nycthemeral_span_method(),
            target: cycle.target,
            lighting_hours: self.config.lighting_hours(),
        }
    }

    pub fn management(&self) -> ManagementConfig {
        self.config.management()
    }

    pub fn environmental_parameters(&self) -> EnvironmentConfig {
        self.config.environment()
    }

    pub fn hardware_info(&self) -> Vec<HardwareConfig> {
        self.config.hardware_configs()
    }

    /// Recomputes the lighting hours after a sun-time refresh or config
    /// reload, and lets the light and climate subroutines pick the new
    /// values up.
    pub fn refresh_lighting_hours(&self) {
        self.config.reset_nycthemeral_caches();
        let _ = self.config.lighting_hours();
        self.broadcast_light_data();
    }
}
