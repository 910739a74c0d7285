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

//! The engine: owns the ecosystems, reacts to config changes, and runs the
//! daily background jobs.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{NaiveTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::app_config::AppConfig;
use crate::config::ecosystem::{EcosystemUid, LightingMethod, NycthemeralSpanMethod};
use crate::config::EngineConfig;
use crate::database::{Database, JsonlDatabase};
use crate::ecosystem::Ecosystem;
use crate::errors::{is_stopping_ecosystem, GaiaError};
use crate::events::{EventDispatcher, EventHandler, NullDispatcher};

/// Loop-coalescing pause after each reconciliation round.
const LOOP_COALESCE_DELAY: Duration = Duration::from_millis(100);
const PING_PERIOD: Duration = Duration::from_secs(15);
const SUN_TIMES_REFRESH_HOUR: u32 = 1;
/// Daily chaos roll time (00:05 local).
const CHAOS_REFRESH_MINUTE: u32 = 5;

pub struct Engine {
    config: Rc<EngineConfig>,
    app_config: Rc<AppConfig>,
    weak_self: Weak<Engine>,
    ecosystems: RefCell<HashMap<EcosystemUid, Rc<Ecosystem>>>,
    event_handler: RefCell<Option<Rc<EventHandler>>>,
    database: RefCell<Option<Rc<dyn Database>>>,
    plugins_initialized: Cell<bool>,
    started: Cell<bool>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    run_token: RefCell<Option<CancellationToken>>,
    background_token: RefCell<Option<CancellationToken>>,
    stopped_notify: Notify,
}

impl Engine {
    pub fn new(config: Rc<EngineConfig>) -> Rc<Self> {
        let app_config = Rc::clone(config.app_config());
        Rc::new_cyclic(|weak_self| Self {
            config,
            app_config,
            weak_self: weak_self.clone(),
            ecosystems: RefCell::new(HashMap::new()),
            event_handler: RefCell::new(None),
            database: RefCell::new(None),
            plugins_initialized: Cell::new(false),
            started: Cell::new(false),
            running: Cell::new(false),
            stopped: Cell::new(false),
            run_token: RefCell::new(None),
            background_token: RefCell::new(None),
            stopped_notify: Notify::new(),
        })
    }

    // -----------------------------------------------------------------
    //  Accessors
    // -----------------------------------------------------------------

    pub fn uid(&self) -> &str {
        &self.app_config.engine_uid
    }

    pub fn config(&self) -> &Rc<EngineConfig> {
        &self.config
    }

    pub fn app_config(&self) -> &Rc<AppConfig> {
        &self.app_config
    }

    pub fn event_handler(&self) -> Option<Rc<EventHandler>> {
        self.event_handler.borrow().clone()
    }

    pub fn database(&self) -> Option<Rc<dyn Database>> {
        self.database.borrow().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    /// Started and not paused.
    pub fn is_running(&self) -> bool {
        self.running.get() && !self.stopped.get()
    }

    pub fn is_paused(&self) -> bool {
        self.started.get() && !self.running.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    pub fn ecosystems_uids(&self) -> Vec<EcosystemUid> {
        self.ecosystems.borrow().keys().cloned().collect()
    }

    pub fn ecosystems_started(&self) -> HashSet<EcosystemUid> {
        self.ecosystems
            .borrow()
            .iter()
            .filter(|(_, ecosystem)| ecosystem.is_started())
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    pub fn started_ecosystems(&self) -> Vec<Rc<Ecosystem>> {
        self.ecosystems
            .borrow()
            .values()
            .filter(|ecosystem| ecosystem.is_started())
            .cloned()
            .collect()
    }

    /// Looks an ecosystem up by uid or name.
    pub fn get_ecosystem(&self, id: &str) -> Result<Rc<Ecosystem>> {
        let ecosystems = self.ecosystems.borrow();
        if let Some(ecosystem) = ecosystems.get(id) {
            return Ok(Rc::clone(ecosystem));
        }
        ecosystems
            .values()
            .find(|ecosystem| ecosystem.name() == id)
            .cloned()
            .ok_or_else(|| {
                GaiaError::EcosystemNotFound {
                    id: id.to_string(),
                }
                .into()
            })
    }

    // -----------------------------------------------------------------
    //  Plugins
    // -----------------------------------------------------------------

    /// Wires the optional database and message broker according to the app
    /// config. Fails if called twice.
    pub async fn init_plugins(&self) -> Result<()> {
        if self.plugins_initialized.get() {
            return Err(anyhow!("Plugins have already been initialized"));
        }
        if self.app_config.use_database() {
            info!("Initializing the persistence plugin");
            let database = JsonlDatabase::open(self.app_config.base_dir.join("data")).await?;
            self.database.borrow_mut().replace(database);
        }
        if self.app_config.use_message_broker() {
            info!("Initializing the message broker plugin");
            // the transport is an external collaborator; deployments
            // inject a live dispatcher through `set_event_dispatcher`
            self.install_event_handler(Rc::new(NullDispatcher));
        }
        self.plugins_initialized.set(true);
        Ok(())
    }

    /// Swaps in a live dispatcher (a connected transport, or a test one).
    pub fn set_event_dispatcher(&self, dispatcher: Rc<dyn EventDispatcher>) {
        self.install_event_handler(dispatcher);
        self.plugins_initialized.set(true);
    }

    fn install_event_handler(&self, dispatcher: Rc<dyn EventDispatcher>) {
        let event_handler = EventHandler::new(
            self.app_config.engine_uid.clone(),
            dispatcher,
            self.database.borrow().clone(),
        );
        self.event_handler.borrow_mut().replace(event_handler);
    }

    /// Forwards one inbound aggregator event.
    pub async fn dispatch_inbound(&self, event: &str, payload: Value) {
        let Some(event_handler) = self.event_handler() else {
            warn!("Received '{event}' but no message broker is configured");
            return;
        };
        event_handler.handle_event(self, event, payload).await;
    }

    // -----------------------------------------------------------------
    //  Lifecycle
    // -----------------------------------------------------------------

    /// Loads the configs, starts the watchdog and background jobs, and
    /// spawns the engine loop. Refuses to restart a stopped engine.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.get() {
            return Err(anyhow!("Cannot restart a stopped engine"));
        }
        if self.started.get() {
            return Err(anyhow!("The engine can only be started once"));
        }
        info!("Starting Gaia ...");
        self.config.initialize_configs().await?;
        if self.app_config.virtualization {
            info!("Virtualization is enabled: hardware models are swapped for virtual ones");
        }
        self.config.start_watchdog();
        self.config.refresh_sun_times().await;
        self.update_chaos_time_windows().await;
        self.start_background_tasks();
        if let Some(event_handler) = self.event_handler() {
            event_handler.send_register_engine().await;
        }
        self.spawn_engine_loop();
        self.started.set(true);
        self.resume_internal();
        info!("Gaia started");
        Ok(())
    }

    /// The engine loop keeps running but skips the reconciliation while
    /// paused. The pause becomes observable within one notification round.
    pub fn pause(&self) {
        if !self.started.get() || self.stopped.get() {
            warn!("Cannot pause an engine that is not running");
            return;
        }
        info!("Pausing the engine");
        self.running.set(false);
        self.config.signal_new_config();
    }

    pub fn resume(&self) {
        if !self.started.get() || self.stopped.get() {
            warn!("Cannot resume an engine that is not running");
            return;
        }
        info!("Resuming the engine");
        self.resume_internal();
    }

    fn resume_internal(&self) {
        self.running.set(true);
        self.config.signal_new_config();
    }

    /// Cancels the engine loop, stops and dismounts every ecosystem, stops
    /// the plugins and background tasks. The engine is terminal afterwards.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.get() {
            return Ok(());
        }
        info!("Stopping Gaia ...");
        self.stopped.set(true);
        self.running.set(false);
        if let Some(token) = self.run_token.borrow_mut().take() {
            token.cancel();
        }
        if let Some(token) = self.background_token.borrow_mut().take() {
            token.cancel();
        }
        self.config.stop_watchdog();
        self.config.signal_new_config();
        let ecosystems: Vec<Rc<Ecosystem>> =
            self.ecosystems.borrow_mut().drain().map(|(_, e)| e).collect();
        for ecosystem in ecosystems {
            if let Err(err) = ecosystem.stop().await {
                error!("Encountered an error while stopping an ecosystem: {err}");
            }
        }
        if let Err(err) = self.config.save_chaos_memory().await {
            warn!("Could not persist the chaos memory: {err}");
        }
        self.stopped_notify.notify_waiters();
        info!("Gaia stopped");
        Ok(())
    }

    /// Blocks the caller until the engine is no longer running.
    pub async fn wait(&self) {
        while !self.stopped.get() {
            self.stopped_notify.notified().await;
        }
    }

    // -----------------------------------------------------------------
    //  Engine loop
    // -----------------------------------------------------------------

    /// Cooperative single task: waits on the `new_config` condition, then
    /// reconciles the ecosystems and re-emits their config. A short sleep
    /// coalesces notification bursts.
    fn spawn_engine_loop(&self) {
        let token = CancellationToken::new();
        self.run_token.borrow_mut().replace(token.clone());
        let weak_engine = self.weak_self.clone();
        tokio::task::spawn_local(async move {
            debug!("Engine loop started");
            loop {
                let Some(engine) = weak_engine.upgrade() else {
                    break;
                };
                tokio::select! {
                    () = token.cancelled() => break,
                    () = async { engine.config.new_config().notified().await } => {}
                }
                if token.is_cancelled() {
                    break;
                }
                if engine.running.get() {
                    if let Err(err) = engine.refresh_ecosystems().await {
                        error!("Encountered an error in the engine loop: {err}");
                    }
                    if let Some(event_handler) = engine.event_handler() {
                        if event_handler.is_connected() {
                            for ecosystem in engine.started_ecosystems() {
                                event_handler.send_full_config(&ecosystem).await;
                                event_handler.send_light_data(&ecosystem).await;
                            }
                        }
                    }
                }
                sleep(LOOP_COALESCE_DELAY).await;
            }
            debug!("Engine loop stopped");
        });
    }

    /// The central reconciler: creates, starts, stops, dismounts and
    /// refreshes ecosystems so that the live set matches the config.
    pub async fn refresh_ecosystems(&self) -> Result<()> {
        let config_uids: HashSet<EcosystemUid> =
            self.config.ecosystems_uids().into_iter().collect();
        let expected = self.config.get_ecosystems_expected_to_run();
        // create the ecosystems that appeared in the config
        for uid in &config_uids {
            if !self.ecosystems.borrow().contains_key(uid) {
                self.init_ecosystem(uid)?;
            }
        }
        let started_before = self.ecosystems_started();
        // start what is expected and not yet running
        for uid in expected.difference(&started_before) {
            self.start_ecosystem(uid).await;
        }
        // stop what is running and no longer expected
        for uid in started_before.difference(&expected) {
            self.stop_ecosystem(uid).await;
        }
        // refresh what was already running and did not stop
        for uid in started_before.intersection(&expected) {
            let ecosystem = self.get_ecosystem(uid)?;
            if ecosystem.is_started() {
                if let Err(err) = ecosystem.refresh_subroutines().await {
                    error!(
                        "Encountered an error while refreshing ecosystem {}: {err}",
                        ecosystem.name()
                    );
                }
            }
        }
        // dismount what left the config
        let existing: HashSet<EcosystemUid> =
            self.ecosystems.borrow().keys().cloned().collect();
        for uid in existing.difference(&config_uids) {
            self.stop_ecosystem(uid).await;
            self.dismount_ecosystem(uid);
        }
        Ok(())
    }

    fn init_ecosystem(&self, uid: &str) -> Result<Rc<Ecosystem>> {
        let ecosystem_config = self.config.get_ecosystem_config(uid)?;
        let ecosystem = Ecosystem::new(
            ecosystem_config,
            Rc::clone(&self.app_config),
            self.weak_self.clone(),
        );
        self.ecosystems
            .borrow_mut()
            .insert(uid.to_string(), Rc::clone(&ecosystem));
        debug!("Ecosystem {} has been created", ecosystem.name());
        Ok(ecosystem)
    }

    async fn start_ecosystem(&self, uid: &str) {
        let Ok(ecosystem) = self.get_ecosystem(uid) else {
            return;
        };
        if let Err(err) = ecosystem.start().await {
            if is_stopping_ecosystem(&err) {
                info!(
                    "Ecosystem {} isn't managing any subroutine, it will stay stopped",
                    ecosystem.name()
                );
            } else {
                error!(
                    "Encountered an error while starting ecosystem {}: {err}",
                    ecosystem.name()
                );
            }
        }
    }

    async fn stop_ecosystem(&self, uid: &str) {
        let Ok(ecosystem) = self.get_ecosystem(uid) else {
            return;
        };
        if let Err(err) = ecosystem.stop().await {
            error!(
                "Encountered an error while stopping ecosystem {}: {err}",
                ecosystem.name()
            );
        }
    }

    fn dismount_ecosystem(&self, uid: &str) {
        if self.ecosystems.borrow_mut().remove(uid).is_some() {
            info!("Ecosystem {uid} has been dismounted");
        }
    }

    // -----------------------------------------------------------------
    //  Background tasks
    // -----------------------------------------------------------------

    fn start_background_tasks(&self) {
        debug!("Starting the background tasks");
        let token = CancellationToken::new();
        self.background_token.borrow_mut().replace(token.clone());
        self.spawn_sun_times_refresh_task(token.clone());
        self.spawn_chaos_refresh_task(token.clone());
        if self.event_handler().is_some() {
            self.spawn_ping_task(token);
        }
    }

    /// Downloads fresh sun times once a day and propagates them to the
    /// lighting computation of every affected ecosystem.
    fn spawn_sun_times_refresh_task(&self, token: CancellationToken) {
        let weak_engine = self.weak_self.clone();
        let at = NaiveTime::from_hms_opt(SUN_TIMES_REFRESH_HOUR, 0, 0).unwrap();
        tokio::task::spawn_local(async move {
            loop {
                let wait = crate::utils::duration_until_next(at);
                tokio::select! {
                    () = token.cancelled() => break,
                    () = sleep(wait) => {}
                }
                let Some(engine) = weak_engine.upgrade() else {
                    break;
                };
                engine.refresh_sun_times().await;
            }
        });
    }

    /// Refreshes the sun times cache and the lighting hours of every
    /// ecosystem whose methods depend on a place.
    pub async fn refresh_sun_times(&self) {
        self.config.refresh_sun_times().await;
        for ecosystem in self.started_ecosystems() {
            let cycle = ecosystem.config().nycthemeral_cycle();
            if cycle.lighting == LightingMethod::Elongate
                || cycle.span == NycthemeralSpanMethod::Mimic
            {
                ecosystem.refresh_lighting_hours();
            }
        }
    }

    fn spawn_chaos_refresh_task(&self, token: CancellationToken) {
        let weak_engine = self.weak_self.clone();
        let at = NaiveTime::from_hms_opt(0, CHAOS_REFRESH_MINUTE, 0).unwrap();
        tokio::task::spawn_local(async move {
            loop {
                let wait = crate::utils::duration_until_next(at);
                tokio::select! {
                    () = token.cancelled() => break,
                    () = sleep(wait) => {}
                }
                let Some(engine) = weak_engine.upgrade() else {
                    break;
                };
                engine.update_chaos_time_windows().await;
            }
        });
    }

    /// The daily chaos roll for every ecosystem whose memory is out of
    /// date; run at 00:05 and on engine start.
    pub async fn update_chaos_time_windows(&self) {
        info!("Updating the ecosystems chaos time windows");
        let now = Utc::now();
        let mut any_changed = false;
        for ecosystem_config in self.config.ecosystems_configs() {
            match ecosystem_config.update_chaos_time_window(now) {
                Ok(changed) => any_changed |= changed,
                Err(err) => error!(
                    "Encountered an error while updating a chaos time window: {err}"
                ),
            }
        }
        if let Err(err) = self.config.save_chaos_memory().await {
            warn!("Could not persist the chaos memory: {err}");
        }
        if !any_changed {
            return;
        }
        if let Some(event_handler) = self.event_handler() {
            if event_handler.is_connected() {
                for ecosystem in self.started_ecosystems() {
                    event_handler.send_full_config(&ecosystem).await;
                }
            }
        }
    }

    fn spawn_ping_task(&self, token: CancellationToken) {
        let weak_engine = self.weak_self.clone();
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(PING_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(engine) = weak_engine.upgrade() else {
                    break;
                };
                if let Some(event_handler) = engine.event_handler() {
                    event_handler
                        .send_ping(engine.ecosystems_started().into_iter().collect())
                        .await;
                }
            }
        });
    }
}
