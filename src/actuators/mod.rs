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

//! Per-type actuator coordination.
//!
//! An [`ActuatorHandler`] turns a PID decision into driver calls for every
//! live hardware of its type, and arbitrates between the automatic mode and
//! manual overrides with an optional countdown. The [`ActuatorHub`] is the
//! ecosystem-scoped registry of handlers and their PIDs, refcounting the
//! subroutines that activate them.

pub mod pid;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::Result;
use log::{error, info};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoEnumIterator};
use tokio::time::Instant;

use crate::actuators::pid::HystericalPID;
use crate::config::ecosystem::ClimateParameter;
use crate::config::hardware::HardwareType;
use crate::ecosystem::Ecosystem;
use crate::errors::GaiaError;
use crate::hardware::{Dimmer, Hardware, HardwareDriver, Switch};

/// Countdowns this close to the deadline flip the mode back to automatic.
const COUNTDOWN_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActuatorMode {
    Automatic,
    Manual,
}

/// What an inbound command may turn an actuator to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActuatorTurnTo {
    On,
    Off,
    Automatic,
}

/// The observable state of one actuator handler, as broadcast in
/// `actuator_data` events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorState {
    pub active: bool,
    pub status: bool,
    pub level: Option<f64>,
    pub mode: ActuatorMode,
}

/// The increase/decrease actuator types regulating one climate parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorCouple {
    pub increase: HardwareType,
    pub decrease: Option<HardwareType>,
}

impl ClimateParameter {
    pub fn actuator_couple(self) -> ActuatorCouple {
        match self {
            ClimateParameter::Temperature => ActuatorCouple {
                increase: HardwareType::Heater,
                decrease: Some(HardwareType::Cooler),
            },
            ClimateParameter::Humidity => ActuatorCouple {
                increase: HardwareType::Humidifier,
                decrease: Some(HardwareType::Dehumidifier),
            },
            ClimateParameter::Light => ActuatorCouple {
                increase: HardwareType::Light,
                decrease: None,
            },
            ClimateParameter::Wind => ActuatorCouple {
                increase: HardwareType::Fan,
                decrease: None,
            },
        }
    }
}

/// The climate parameter an actuator type regulates.
pub fn regulated_parameter(h_type: HardwareType) -> Option<ClimateParameter> {
    ClimateParameter::iter().find(|parameter| {
        let couple = parameter.actuator_couple();
        couple.increase == h_type || couple.decrease == Some(h_type)
    })
}

/// Drives every live hardware of one type in one ecosystem.
pub struct ActuatorHandler {
    ecosystem: RefCell<Weak<Ecosystem>>,
    h_type: HardwareType,
    active_count: Cell<u32>,
    status: Cell<bool>,
    level: Cell<Option<f64>>,
    mode: Cell<ActuatorMode>,
    countdown_end: Cell<Option<Instant>>,
    last_status: Cell<bool>,
    last_mode: Cell<ActuatorMode>,
    pid: Rc<RefCell<HystericalPID>>,
}

impl ActuatorHandler {
    fn new(h_type: HardwareType, pid: Rc<RefCell<HystericalPID>>) -> Self {
        Self {
            ecosystem: RefCell::new(Weak::new()),
            h_type,
            active_count: Cell::new(0),
            status: Cell::new(false),
            level: Cell::new(None),
            mode: Cell::new(ActuatorMode::Automatic),
            countdown_end: Cell::new(None),
            last_status: Cell::new(false),
            last_mode: Cell::new(ActuatorMode::Automatic),
            pid,
        }
    }

    fn attach(&self, ecosystem: Weak<Ecosystem>) {
        *self.ecosystem.borrow_mut() = ecosystem;
    }

    pub fn hardware_type(&self) -> HardwareType {
        self.h_type
    }

    pub fn pid(&self) -> Rc<RefCell<HystericalPID>> {
        Rc::clone(&self.pid)
    }

    // -----------------------------------------------------------------
    //  Activation refcounting
    // -----------------------------------------------------------------

    pub fn is_active(&self) -> bool {
        self.active_count.get() > 0
    }

    pub fn activate(&self) {
        self.active_count.set(self.active_count.get() + 1);
    }

    pub fn deactivate(&self) {
        match self.active_count.get().checked_sub(1) {
            Some(count) => self.active_count.set(count),
            None => error!("Deactivating an inactive {} handler", self.h_type),
        }
    }

    // -----------------------------------------------------------------
    //  State accessors
    // -----------------------------------------------------------------

    pub fn status(&self) -> bool {
        self.status.get()
    }

    pub fn level(&self) -> Option<f64> {
        self.level.get()
    }

    pub fn mode(&self) -> ActuatorMode {
        self.mode.get()
    }

    pub fn last_status(&self) -> bool {
        self.last_status.get()
    }

    pub fn last_mode(&self) -> ActuatorMode {
        self.last_mode.get()
    }

    /// Seconds left on the manual-override countdown, if one is armed.
    pub fn countdown(&self) -> Option<f64> {
        self.countdown_end.get().map(|end| {
            let now = Instant::now();
            if end > now { (end - now).as_secs_f64() } else { 0.0 }
        })
    }

    pub fn reset_countdown(&self) {
        self.countdown_end.set(None);
    }

    fn arm_countdown(&self, countdown: Duration) {
        self.countdown_end.set(Some(Instant::now() + countdown));
    }

    pub fn as_state(&self) -> ActuatorState {
        ActuatorState {
            active: self.is_active(),
            status: self.status.get(),
            level: self.level.get(),
            mode: self.mode.get(),
        }
    }

    // -----------------------------------------------------------------
    //  Driving hardware
    // -----------------------------------------------------------------

    fn drivers(&self) -> Vec<HardwareDriver> {
        self.ecosystem
            .borrow()
            .upgrade()
            .map(|ecosystem| ecosystem.hardware_of_type(self.h_type))
            .unwrap_or_default()
    }

    /// Applies the desired on/off state to every live switch of this type.
    /// An inactive handler never drives hardware.
    pub async fn set_status(&self, status: bool) {
        if !self.is_active() {
            return;
        }
        self.apply_status(status).await;
        self.send_state_if_changed();
    }

    async fn apply_status(&self, status: bool) {
        self.status.set(status);
        if !self.is_active() {
            // the desired status is recorded, but an inactive handler
            // never drives hardware
            return;
        }
        for driver in self.drivers() {
            let Some(switch) = driver.as_switch() else {
                continue;
            };
            let result = if status {
                switch.turn_on().await
            } else {
                switch.turn_off().await
            };
            if let Err(err) = result {
                error!(
                    "Encountered an error while driving '{}': {err}",
                    driver.name()
                );
            }
        }
    }

    pub async fn turn_on(&self) {
        self.set_status(true).await;
    }

    pub async fn turn_off(&self) {
        self.set_status(false).await;
    }

    /// Applies a 0-100 % level to every live dimmer of this type.
    pub async fn set_level(&self, level: f64) {
        if !self.is_active() {
            return;
        }
        let level = level.clamp(0.0, 100.0);
        self.level.set(Some(level));
        let duty_cycle_16b = (level / 100.0 * f64::from(u16::MAX)).round() as u16;
        for driver in self.drivers() {
            let Some(dimmer) = driver.as_dimmer() else {
                continue;
            };
            if let Err(err) = dimmer.set_pwm_duty(duty_cycle_16b).await {
                error!(
                    "Encountered an error while dimming '{}': {err}",
                    driver.name()
                );
            }
        }
    }

    // -----------------------------------------------------------------
    //  Mode state machine
    // -----------------------------------------------------------------

    pub fn set_mode(&self, mode: ActuatorMode) {
        self.mode.set(mode);
        if mode == ActuatorMode::Automatic {
            // a countdown is only valid under manual mode
            self.reset_countdown();
        }
        self.send_state_if_changed();
    }

    /// Applies a manual override or returns the handler to automatic.
    ///
    /// A countdown arms a deadline after which the handler reverts to
    /// automatic by itself.
    pub async fn turn_to(&self, turn_to: ActuatorTurnTo, countdown: Option<Duration>) {
        match turn_to {
            ActuatorTurnTo::Automatic => {
                self.mode.set(ActuatorMode::Automatic);
                self.reset_countdown();
            }
            ActuatorTurnTo::On | ActuatorTurnTo::Off => {
                self.mode.set(ActuatorMode::Manual);
                self.apply_status(turn_to == ActuatorTurnTo::On).await;
                self.reset_countdown();
                if let Some(countdown) = countdown {
                    self.arm_countdown(countdown);
                }
            }
        }
        match countdown {
            Some(countdown) if turn_to != ActuatorTurnTo::Automatic => info!(
                "{} has been manually turned to '{turn_to}' for {:.0} seconds",
                self.h_type,
                countdown.as_secs_f64()
            ),
            _ => info!("{} has been manually turned to '{turn_to}'", self.h_type),
        }
        self.send_state_if_changed();
    }

    /// The status the handler should be driven to, given the latest PID
    /// output. Expired countdowns flip the mode back to automatic first.
    pub fn compute_expected_status(&self, pid_output: f64) -> bool {
        if let Some(remaining) = self.countdown() {
            if remaining <= COUNTDOWN_EPSILON {
                info!("{} countdown elapsed, back to automatic mode", self.h_type);
                self.reset_countdown();
                self.set_mode(ActuatorMode::Automatic);
            }
        }
        match self.mode.get() {
            ActuatorMode::Automatic => pid_output > 0.0,
            ActuatorMode::Manual => self.status.get(),
        }
    }

    /// Broadcasts an `actuator_data` event whenever status or mode differ
    /// from the last observed values.
    fn send_state_if_changed(&self) {
        let status_changed = self.status.get() != self.last_status.get();
        let mode_changed = self.mode.get() != self.last_mode.get();
        if !(status_changed || mode_changed) {
            return;
        }
        if status_changed {
            info!(
                "{} has been turned {}",
                self.h_type,
                if self.status.get() { "on" } else { "off" }
            );
        }
        if mode_changed {
            info!("{} has been set to '{}' mode", self.h_type, self.mode.get());
        }
        self.last_status.set(self.status.get());
        self.last_mode.set(self.mode.get());
        if let Some(ecosystem) = self.ecosystem.borrow().upgrade() {
            ecosystem.broadcast_actuator_data();
        }
    }
}

/// The ecosystem-scoped registry of actuator handlers and hysteretic PIDs.
///
/// Subroutines asking for the same hardware type share the same handler;
/// the handler's `active_count` refcounts the activations. A couple of
/// actuator types regulating the same parameter (heater/cooler) share one
/// PID.
pub struct ActuatorHub {
    handlers: HashMap<HardwareType, Rc<ActuatorHandler>>,
    pids: HashMap<ClimateParameter, Rc<RefCell<HystericalPID>>>,
}

impl ActuatorHub {
    pub fn new() -> Self {
        let mut pids = HashMap::new();
        for parameter in ClimateParameter::iter() {
            pids.insert(parameter, Rc::new(RefCell::new(HystericalPID::default())));
        }
        let mut handlers = HashMap::new();
        for h_type in HardwareType::iter().filter(|h_type| h_type.is_actuator()) {
            let parameter = regulated_parameter(h_type)
                .expect("every actuator type regulates a climate parameter");
            let handler = ActuatorHandler::new(h_type, Rc::clone(&pids[&parameter]));
            handlers.insert(h_type, Rc::new(handler));
        }
        Self { handlers, pids }
    }

    /// Wires the back-reference used to enumerate live drivers. Called once
    /// from `Ecosystem::new_cyclic`.
    pub fn attach_ecosystem(&self, ecosystem: &Weak<Ecosystem>) {
        for handler in self.handlers.values() {
            handler.attach(ecosystem.clone());
        }
    }

    pub fn get_handler(&self, h_type: HardwareType) -> Result<Rc<ActuatorHandler>> {
        self.handlers.get(&h_type).cloned().ok_or_else(|| {
            GaiaError::config(format!("'{h_type}' is not an actuator type")).into()
        })
    }

    pub fn get_pid(&self, parameter: ClimateParameter) -> Rc<RefCell<HystericalPID>> {
        Rc::clone(&self.pids[&parameter])
    }

    /// The full `actuator_data` payload body.
    pub fn as_states(&self) -> HashMap<HardwareType, ActuatorState> {
        self.handlers
            .iter()
            .map(|(h_type, handler)| (*h_type, handler.as_state()))
            .collect()
    }
}

impl Default for ActuatorHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn couples_are_fixed() {
        let temperature = ClimateParameter::Temperature.actuator_couple();
        assert_eq!(temperature.increase, HardwareType::Heater);
        assert_eq!(temperature.decrease, Some(HardwareType::Cooler));
        let light = ClimateParameter::Light.actuator_couple();
        assert_eq!(light.increase, HardwareType::Light);
        assert_eq!(light.decrease, None);
        assert_eq!(
            regulated_parameter(HardwareType::Dehumidifier),
            Some(ClimateParameter::Humidity)
        );
        assert_eq!(regulated_parameter(HardwareType::Sensor), None);
    }

    #[test]
    fn hub_rejects_non_actuator_types() {
        let hub = ActuatorHub::new();
        assert!(hub.get_handler(HardwareType::Sensor).is_err());
        assert!(hub.get_handler(HardwareType::Light).is_ok());
    }

    #[test]
    fn coupled_handlers_share_a_pid() {
        let hub = ActuatorHub::new();
        let heater = hub.get_handler(HardwareType::Heater).unwrap();
        let cooler = hub.get_handler(HardwareType::Cooler).unwrap();
        assert!(Rc::ptr_eq(&heater.pid(), &cooler.pid()));
        assert!(Rc::ptr_eq(
            &heater.pid(),
            &hub.get_pid(ClimateParameter::Temperature)
        ));
    }

    #[tokio::test]
    async fn inactive_handler_never_drives() {
        let hub = ActuatorHub::new();
        let handler = hub.get_handler(HardwareType::Heater).unwrap();
        assert!(!handler.is_active());
        handler.set_status(true).await;
        assert!(!handler.status());
        handler.set_level(50.0).await;
        assert_eq!(handler.level(), None);
    }

    #[tokio::test]
    async fn activation_refcounting() {
        let hub = ActuatorHub::new();
        let handler = hub.get_handler(HardwareType::Light).unwrap();
        handler.activate();
        handler.activate();
        assert!(handler.is_active());
        handler.deactivate();
        assert!(handler.is_active());
        handler.deactivate();
        assert!(!handler.is_active());
        // underflow is logged, not panicking
        handler.deactivate();
        assert!(!handler.is_active());
    }

    #[tokio::test]
    async fn manual_override_with_countdown_reverts() {
        tokio::time::pause();
        let hub = ActuatorHub::new();
        let handler = hub.get_handler(HardwareType::Light).unwrap();
        handler.activate();

        handler
            .turn_to(ActuatorTurnTo::On, Some(Duration::from_secs(30)))
            .await;
        assert!(handler.status());
        assert_eq!(handler.mode(), ActuatorMode::Manual);
        // manual mode pins the status regardless of the PID
        assert!(handler.compute_expected_status(-100.0));

        tokio::time::advance(Duration::from_secs(31)).await;
        // countdown elapsed: automatic again, PID decides
        assert!(!handler.compute_expected_status(-100.0));
        assert_eq!(handler.mode(), ActuatorMode::Automatic);
        assert_eq!(handler.countdown(), None);
    }

    #[tokio::test]
    async fn turn_to_automatic_is_idempotent() {
        let hub = ActuatorHub::new();
        let handler = hub.get_handler(HardwareType::Light).unwrap();
        handler.activate();
        handler.turn_to(ActuatorTurnTo::Automatic, None).await;
        let state_one = handler.as_state();
        handler.turn_to(ActuatorTurnTo::Automatic, None).await;
        assert_eq!(handler.as_state(), state_one);
        assert_eq!(handler.mode(), ActuatorMode::Automatic);
    }

    #[tokio::test]
    async fn expected_status_follows_pid_in_automatic() {
        let hub = ActuatorHub::new();
        let handler = hub.get_handler(HardwareType::Heater).unwrap();
        handler.activate();
        assert!(handler.compute_expected_status(12.5));
        assert!(!handler.compute_expected_status(0.0));
        assert!(!handler.compute_expected_status(-40.0));
    }
}
