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

//! The subroutine framework.
//!
//! A subroutine is one named control concern (sensors / light / climate /
//! health) running its own periodic routine inside an ecosystem. The
//! [`Subroutine`] trait is the start/stop/refresh contract the ecosystem
//! drives; [`SubroutineCore`] carries the state and hardware-ownership
//! plumbing every implementation shares.

pub mod climate;
pub mod health;
pub mod light;
pub mod sensors;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tokio_util::sync::CancellationToken;

use crate::config::ecosystem::{EcosystemConfig, ManagementFlags};
use crate::config::hardware::{HardwareConfig, HardwareUid};
use crate::ecosystem::Ecosystem;
use crate::hardware::{create_hardware, Dimmer, Hardware, HardwareDriver, Switch};

/// The four control concerns, in their fixed start order. Stop order is the
/// reverse.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubroutineKind {
    Sensors,
    Light,
    Climate,
    Health,
}

pub const SUBROUTINE_ORDER: [SubroutineKind; 4] = [
    SubroutineKind::Sensors,
    SubroutineKind::Light,
    SubroutineKind::Climate,
    SubroutineKind::Health,
];

impl SubroutineKind {
    pub fn management_flag(self) -> ManagementFlags {
        match self {
            SubroutineKind::Sensors => ManagementFlags::SENSORS,
            SubroutineKind::Light => ManagementFlags::LIGHT,
            SubroutineKind::Climate => ManagementFlags::CLIMATE,
            SubroutineKind::Health => ManagementFlags::HEALTH,
        }
    }
}

/// The contract every subroutine implements.
///
/// `routine()` is the periodic work unit; implementations must tolerate the
/// scheduler firing it while a previous run is still in flight (the shared
/// scaffolding skips overlapping ticks).
#[async_trait(?Send)]
pub trait Subroutine {
    fn kind(&self) -> SubroutineKind;

    fn core(&self) -> &SubroutineCore;

    /// `true` iff the subroutine can usefully do its job with the current
    /// config and hardware.
    fn compute_if_manageable(&self) -> bool;

    /// The hardware this subroutine wants to own right now.
    fn hardware_needed_uids(&self) -> HashSet<HardwareUid>;

    async fn start(self: Rc<Self>) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Re-sync a started subroutine with a changed config: hardware set,
    /// cached values, targets. Must be safe to call while running.
    async fn refresh(&self) -> Result<()>;

    /// One tick of the periodic work.
    async fn routine(&self) -> Result<()>;

    fn is_started(&self) -> bool {
        self.core().started.get()
    }

    fn is_manageable(&self) -> bool {
        self.core().manageable.get()
    }

    /// Whether this subroutine's management bit is set.
    fn is_enabled(&self) -> bool {
        self.core()
            .config()
            .map(|config| config.get_management(self.kind().management_flag()))
            .unwrap_or(false)
    }

    /// Re-evaluates `manageable` from config and hardware. A disabled
    /// subroutine is never manageable.
    fn update_manageable(&self) {
        let manageable = self.is_enabled() && self.compute_if_manageable();
        self.core().manageable.set(manageable);
    }
}

/// State and plumbing shared by every subroutine implementation.
pub struct SubroutineCore {
    pub kind: SubroutineKind,
    ecosystem: Weak<Ecosystem>,
    pub started: Cell<bool>,
    pub manageable: Cell<bool>,
    hardware: RefCell<HashMap<HardwareUid, HardwareDriver>>,
    routine_token: RefCell<Option<CancellationToken>>,
    routine_running: Cell<bool>,
}

impl SubroutineCore {
    pub fn new(kind: SubroutineKind, ecosystem: Weak<Ecosystem>) -> Self {
        Self {
            kind,
            ecosystem,
            started: Cell::new(false),
            manageable: Cell::new(false),
            hardware: RefCell::new(HashMap::new()),
            routine_token: RefCell::new(None),
            routine_running: Cell::new(false),
        }
    }

    pub fn ecosystem(&self) -> Result<Rc<Ecosystem>> {
        self.ecosystem
            .upgrade()
            .ok_or_else(|| anyhow!("The ecosystem of the {} subroutine is gone", self.kind))
    }

    pub fn config(&self) -> Result<Rc<EcosystemConfig>> {
        Ok(self.ecosystem()?.config())
    }

    pub fn ecosystem_name(&self) -> String {
        self.ecosystem()
            .map(|ecosystem| ecosystem.name())
            .unwrap_or_else(|_| "<gone>".to_string())
    }

    // -----------------------------------------------------------------
    //  Hardware ownership
    // -----------------------------------------------------------------

    pub fn owned_hardware_uids(&self) -> HashSet<HardwareUid> {
        self.hardware.borrow().keys().cloned().collect()
    }

    pub fn hardware(&self) -> Vec<HardwareDriver> {
        self.hardware.borrow().values().cloned().collect()
    }

    pub fn get_hardware(&self, uid: &str) -> Option<HardwareDriver> {
        self.hardware.borrow().get(uid).cloned()
    }

    /// Constructs and mounts the driver for one configured hardware.
    /// Switches come up off and dimmers at level zero.
    pub async fn add_hardware(&self, config: &HardwareConfig) -> Result<HardwareDriver> {
        let ecosystem = self.ecosystem()?;
        let virtualization = ecosystem.virtualization();
        let driver = create_hardware(config, ecosystem.uid(), virtualization)?;
        if let Some(switch) = driver.as_switch() {
            switch.turn_off().await?;
        }
        if let Some(dimmer) = driver.as_dimmer() {
            dimmer.set_pwm_duty(0).await?;
        }
        debug!("Hardware '{}' has been set up", driver.name());
        self.hardware
            .borrow_mut()
            .insert(config.uid.clone(), Rc::clone(&driver));
        ecosystem.mount_hardware(&driver);
        Ok(driver)
    }

    /// Unmounts one owned driver, turning it off first.
    pub async fn remove_hardware(&self, uid: &str) {
        let Some(driver) = self.hardware.borrow_mut().remove(uid) else {
            error!("Hardware '{uid}' is not managed by this subroutine");
            return;
        };
        if let Some(dimmer) = driver.as_dimmer() {
            if let Err(err) = dimmer.set_pwm_duty(0).await {
                warn!("Could not zero '{}' before release: {err}", driver.name());
            }
        }
        if let Some(switch) = driver.as_switch() {
            if let Err(err) = switch.turn_off().await {
                warn!("Could not turn '{}' off before release: {err}", driver.name());
            }
        }
        if let Ok(ecosystem) = self.ecosystem() {
            ecosystem.unmount_hardware(uid);
        }
    }

    /// Adds hardware that is needed but not owned, removes hardware owned
    /// but no longer needed. Safe to call on a started subroutine.
    pub async fn refresh_hardware(&self, needed: &HashSet<HardwareUid>) -> Result<()> {
        let config = self.config()?;
        let owned = self.owned_hardware_uids();
        for uid in needed.difference(&owned) {
            match config.get_hardware_config(uid) {
                Ok(hardware_config) => {
                    if let Err(err) = self.add_hardware(&hardware_config).await {
                        error!(
                            "Encountered an error while setting up hardware '{uid}': {err}"
                        );
                    }
                }
                Err(err) => error!("No config for needed hardware '{uid}': {err}"),
            }
        }
        for uid in owned.difference(needed) {
            self.remove_hardware(uid).await;
        }
        Ok(())
    }

    pub async fn release_all_hardware(&self) {
        let owned = self.owned_hardware_uids();
        for uid in owned {
            self.remove_hardware(&uid).await;
        }
    }

    /// Releases every owned driver without driving it, leaving actuators in
    /// their last state. Used by the climate subroutine's self-stop so a
    /// sensor outage does not flip every regulator off.
    pub fn release_all_hardware_quietly(&self) {
        let mut hardware = self.hardware.borrow_mut();
        let uids: Vec<HardwareUid> = hardware.keys().cloned().collect();
        for uid in uids {
            hardware.remove(&uid);
            if let Ok(ecosystem) = self.ecosystem() {
                ecosystem.unmount_hardware(&uid);
            }
        }
    }

    // -----------------------------------------------------------------
    //  Periodic loop
    // -----------------------------------------------------------------

    /// Installs the periodic routine task. Ticks that fire while the
    /// previous routine is still running are skipped.
    pub fn spawn_routine_loop(&self, subroutine: Rc<dyn Subroutine>, period: Duration) {
        let token = CancellationToken::new();
        self.routine_token.borrow_mut().replace(token.clone());
        let kind = self.kind;
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        run_guarded_routine(&subroutine).await;
                    }
                }
            }
            debug!("{kind} routine loop stopped");
        });
    }

    /// Installs a routine task that fires once a day at the given local
    /// wall-clock time.
    pub fn spawn_daily_routine_loop(&self, subroutine: Rc<dyn Subroutine>, at: chrono::NaiveTime) {
        let token = CancellationToken::new();
        self.routine_token.borrow_mut().replace(token.clone());
        let kind = self.kind;
        tokio::task::spawn_local(async move {
            loop {
                let wait = crate::utils::duration_until_next(at);
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(wait) => {
                        run_guarded_routine(&subroutine).await;
                    }
                }
            }
            debug!("{kind} daily routine loop stopped");
        });
    }

    pub fn cancel_routine_loop(&self) {
        if let Some(token) = self.routine_token.borrow_mut().take() {
            token.cancel();
        }
    }

    /// The overlap guard used by both the loop and external triggers.
    pub fn try_begin_routine(&self) -> bool {
        if self.routine_running.get() {
            return false;
        }
        self.routine_running.set(true);
        true
    }

    pub fn end_routine(&self) {
        self.routine_running.set(false);
    }
}

/// Runs one routine tick under the overlap guard, logging failures.
pub async fn run_guarded_routine(subroutine: &Rc<dyn Subroutine>) {
    let core = subroutine.core();
    if !core.try_begin_routine() {
        warn!(
            "The {} routine of '{}' is still running, skipping this tick",
            core.kind,
            core.ecosystem_name()
        );
        return;
    }
    let result = subroutine.routine().await;
    core.end_routine();
    if let Err(err) = result {
        error!(
            "Encountered an error while running the {} routine: {err}",
            core.kind
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_fixed() {
        assert_eq!(
            SUBROUTINE_ORDER,
            [
                SubroutineKind::Sensors,
                SubroutineKind::Light,
                SubroutineKind::Climate,
                SubroutineKind::Health,
            ]
        );
    }

    #[test]
    fn kinds_map_to_management_flags() {
        assert_eq!(
            SubroutineKind::Sensors.management_flag(),
            ManagementFlags::SENSORS
        );
        assert_eq!(
            SubroutineKind::Health.management_flag(),
            ManagementFlags::HEALTH
        );
    }

    #[test]
    fn overlap_guard_blocks_reentry() {
        let core = SubroutineCore::new(SubroutineKind::Sensors, Weak::new());
        assert!(core.try_begin_routine());
        assert!(!core.try_begin_routine());
        core.end_routine();
        assert!(core.try_begin_routine());
    }
}
