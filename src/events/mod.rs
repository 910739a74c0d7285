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

//! The aggregator event interface.
//!
//! The transport itself (socket, queue...) is an external collaborator
//! behind the [`EventDispatcher`] trait; the [`EventHandler`] builds the
//! outbound payloads, buffers undeliverable readings when the database is
//! enabled, and applies inbound commands to the engine.

pub mod payloads;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::config::ecosystem::{ClimateConfig, ECOSYSTEM_UID_LENGTH};
use crate::config::hardware::HardwareType;
use crate::config::{ConfigType, Coordinates};
use crate::database::Database;
use crate::ecosystem::Ecosystem;
use crate::engine::Engine;
use crate::errors::GaiaError;
use crate::events::payloads::{
    AckStatus, BaseInfo, BufferedDataAck, ChangeManagementPayload, ClimateParameterCrudData,
    CrudAction, CrudPayload, CrudResult, CrudTarget, EcosystemCrudData, EcosystemPayload,
    HealthData, PlaceCrudData, RegisterEngine, SensorsData, TurnActuatorPayload,
};

/// How the engine reaches the remote aggregator. Implementations must not
/// block: `emit` either delivers or fails fast.
#[async_trait(?Send)]
pub trait EventDispatcher {
    fn is_connected(&self) -> bool;
    async fn emit(&self, event: &str, payload: Value) -> Result<()>;
}

/// The stand-in dispatcher when no broker URL is configured.
pub struct NullDispatcher;

#[async_trait(?Send)]
impl EventDispatcher for NullDispatcher {
    fn is_connected(&self) -> bool {
        false
    }

    async fn emit(&self, _event: &str, _payload: Value) -> Result<()> {
        Err(GaiaError::BrokerDisconnected.into())
    }
}

/// Builds and sends outbound payloads; applies inbound commands.
pub struct EventHandler {
    engine_uid: String,
    dispatcher: Rc<dyn EventDispatcher>,
    database: Option<Rc<dyn Database>>,
    registered: Cell<bool>,
}

impl EventHandler {
    pub fn new(
        engine_uid: String,
        dispatcher: Rc<dyn EventDispatcher>,
        database: Option<Rc<dyn Database>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            engine_uid,
            dispatcher,
            database,
            registered: Cell::new(false),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        debug!("Emitting '{event}'");
        self.dispatcher.emit(event, payload).await
    }

    /// Emits if connected; inbound side effects aside, a disconnected broker
    /// is never an error for the caller.
    async fn emit_if_connected(&self, event: &str, payload: Value) {
        if !self.is_connected() {
            return;
        }
        if let Err(err) = self.emit(event, payload).await {
            error!("Encountered an error while sending '{event}': {err}");
        }
    }

    // -----------------------------------------------------------------
    //  Outbound
    // -----------------------------------------------------------------

    pub async fn send_register_engine(&self) {
        let payload = RegisterEngine {
            engine_uid: self.engine_uid.clone(),
            address: None,
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self.emit_if_connected("register_engine", value).await,
            Err(err) => error!("Unserializable register_engine payload: {err}"),
        }
    }

    pub async fn send_ping(&self, ecosystem_uids: Vec<String>) {
        self.emit_if_connected("ping", serde_json::json!({ "ecosystems": ecosystem_uids }))
            .await;
    }

    /// Sends a reading; when the broker is down, buffers it if the database
    /// is enabled and drops it otherwise.
    pub async fn send_sensors_data(&self, ecosystem_uid: &str, data: &SensorsData) {
        let payload = EcosystemPayload::wrap(ecosystem_uid.to_string(), data.clone());
        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(err) => {
                error!("Unserializable sensors_data payload: {err}");
                return;
            }
        };
        let delivery = if self.is_connected() {
            self.emit("sensors_data", value).await
        } else {
            Err(GaiaError::BrokerDisconnected.into())
        };
        if let Err(err) = delivery {
            let Some(database) = &self.database else {
                debug!("Dropping undeliverable sensors data: {err}");
                return;
            };
            match database.buffer_sensors_data(ecosystem_uid, data).await {
                Ok(uuid) => debug!("Buffered undeliverable sensors data as {uuid}"),
                Err(err) => error!("Could not buffer sensors data: {err}"),
            }
        }
    }

    /// Re-sends everything the buffer holds; each entry is cleared by the
    /// aggregator's `buffered_data_ack`.
    pub async fn send_buffered_sensors_data(&self) {
        let Some(database) = &self.database else {
            return;
        };
        if !self.is_connected() {
            return;
        }
        for buffered in database.buffered_sensors_data() {
            match serde_json::to_value(&buffered) {
                Ok(value) => self.emit_if_connected("buffered_sensors_data", value).await,
                Err(err) => error!("Unserializable buffered_sensors_data payload: {err}"),
            }
        }
    }

    pub async fn send_actuator_data(&self, ecosystem: &Ecosystem) {
        let payload =
            EcosystemPayload::wrap(ecosystem.uid().clone(), ecosystem.actuator_states());
        match serde_json::to_value(&payload) {
            Ok(value) => self.emit_if_connected("actuator_data", value).await,
            Err(err) => error!("Unserializable actuator_data payload: {err}"),
        }
    }

    pub async fn send_light_data(&self, ecosystem: &Ecosystem) {
        let payload = EcosystemPayload::wrap(ecosystem.uid().clone(), ecosystem.light_info());
        match serde_json::to_value(&payload) {
            Ok(value) => self.emit_if_connected("light_data", value).await,
            Err(err) => error!("Unserializable light_data payload: {err}"),
        }
    }

    pub async fn send_health_data(&self, ecosystem_uid: &str, data: &HealthData) {
        let payload = EcosystemPayload::wrap(ecosystem_uid.to_string(), data.clone());
        match serde_json::to_value(&payload) {
            Ok(value) => self.emit_if_connected("health_data", value).await,
            Err(err) => error!("Unserializable health_data payload: {err}"),
        }
    }

    /// Emits the whole config-shaped description of one ecosystem:
    /// `base_info`, `management`, `environmental_parameters` and `hardware`.
    pub async fn send_full_config(&self, ecosystem: &Ecosystem) {
        let uid = ecosystem.uid().clone();
        let base_info = BaseInfo {
            engine_uid: self.engine_uid.clone(),
            uid: uid.clone(),
            name: ecosystem.name(),
            status: ecosystem.is_started(),
        };
        let payloads: [(&str, Result<Value, serde_json::Error>); 4] = [
            ("base_info", serde_json::to_value(EcosystemPayload::wrap(uid.clone(), base_info))),
            (
                "management",
                serde_json::to_value(EcosystemPayload::wrap(uid.clone(), ecosystem.management())),
            ),
            (
                "environmental_parameters",
                serde_json::to_value(EcosystemPayload::wrap(
                    uid.clone(),
                    ecosystem.environmental_parameters(),
                )),
            ),
            (
                "hardware",
                serde_json::to_value(EcosystemPayload::wrap(uid, ecosystem.hardware_info())),
            ),
        ];
        for (event, payload) in payloads {
            match payload {
                Ok(value) => self.emit_if_connected(event, value).await,
                Err(err) => error!("Unserializable {event} payload: {err}"),
            }
        }
    }

    pub async fn send_crud_result(&self, result: CrudResult) {
        match serde_json::to_value(&result) {
            Ok(value) => self.emit_if_connected("crud_result", value).await,
            Err(err) => error!("Unserializable crud_result payload: {err}"),
        }
    }

    // -----------------------------------------------------------------
    //  Inbound
    // -----------------------------------------------------------------

    /// Applies one inbound event. Every event is idempotent except `crud`,
    /// which is acknowledged through `crud_result`.
    pub async fn handle_event(&self, engine: &Engine, event: &str, payload: Value) {
        let outcome = match event {
            "pong" => {
                debug!("Aggregator answered the ping");
                Ok(())
            }
            "register" => {
                self.send_register_engine().await;
                Ok(())
            }
            "registration_ack" => {
                info!("Registered with the aggregator");
                self.registered.set(true);
                for ecosystem in engine.started_ecosystems() {
                    self.send_full_config(&ecosystem).await;
                }
                self.send_buffered_sensors_data().await;
                Ok(())
            }
            "initialized_ack" => {
                debug!("Aggregator acknowledged the initial data");
                Ok(())
            }
            "turn_light" => {
                self.on_turn_actuator(engine, payload, Some(HardwareType::Light))
                    .await
            }
            "turn_actuator" => self.on_turn_actuator(engine, payload, None).await,
            "change_management" => self.on_change_management(engine, payload).await,
            "crud" => self.on_crud(engine, payload).await,
            "buffered_data_ack" => self.on_buffered_data_ack(payload).await,
            unknown => {
                warn!("Received an unknown event '{unknown}'");
                Ok(())
            }
        };
        if let Err(err) = outcome {
            error!("Encountered an error while handling '{event}': {err}");
        }
    }

    async fn on_turn_actuator(
        &self,
        engine: &Engine,
        payload: Value,
        default_actuator: Option<HardwareType>,
    ) -> Result<()> {
        let payload: TurnActuatorPayload = serde_json::from_value(payload)?;
        let actuator = payload
            .actuator
            .or(default_actuator)
            .ok_or_else(|| GaiaError::undefined("Missing actuator type"))?;
        let ecosystem = engine.get_ecosystem(&payload.ecosystem_uid)?;
        let countdown = payload
            .countdown
            .filter(|seconds| *seconds > 0.0)
            .map(Duration::from_secs_f64);
        ecosystem.turn_actuator(actuator, payload.mode, countdown).await;
        Ok(())
    }

    async fn on_change_management(&self, engine: &Engine, payload: Value) -> Result<()> {
        let payload: ChangeManagementPayload = serde_json::from_value(payload)?;
        let config = engine.config().get_ecosystem_config(&payload.ecosystem_uid)?;
        let mut data = config.data();
        data.management = payload.management;
        config.replace_data(data);
        engine.config().save(ConfigType::Ecosystems).await?;
        engine.config().signal_new_config();
        Ok(())
    }

    async fn on_buffered_data_ack(&self, payload: Value) -> Result<()> {
        let ack: BufferedDataAck = serde_json::from_value(payload)?;
        if let Some(database) = &self.database {
            database
                .ack_buffered_data(ack.uuid, ack.status == AckStatus::Success)
                .await?;
        }
        Ok(())
    }

    async fn on_crud(&self, engine: &Engine, payload: Value) -> Result<()> {
        let payload: CrudPayload = serde_json::from_value(payload)?;
        if payload.engine_uid != self.engine_uid {
            debug!("Ignoring a crud request addressed to another engine");
            return Ok(());
        }
        let uuid = payload.uuid;
        let result = match self.apply_crud(engine, payload).await {
            Ok(()) => CrudResult {
                uuid,
                status: AckStatus::Success,
                message: None,
            },
            Err(err) => CrudResult {
                uuid,
                status: AckStatus::Failure,
                message: Some(err.to_string()),
            },
        };
        self.send_crud_result(result).await;
        Ok(())
    }

    async fn apply_crud(&self, engine: &Engine, payload: CrudPayload) -> Result<()> {
        let config = engine.config();
        match payload.target {
            CrudTarget::Ecosystem => {
                let data: EcosystemCrudData = serde_json::from_value(payload.data)?;
                match payload.action {
                    CrudAction::Create => {
                        let name = data.name.unwrap_or_else(|| "New Ecosystem".to_string());
                        config.create_ecosystem(&name);
                    }
                    CrudAction::Update => {
                        let uid = required_uid(data.uid.as_deref(), payload.ecosystem_uid.as_deref())?;
                        let ecosystem_config = config.get_ecosystem_config(&uid)?;
                        if let Some(name) = data.name {
                            ecosystem_config.set_name(name);
                        }
                        if let Some(status) = data.status {
                            ecosystem_config.set_status(status);
                        }
                    }
                    CrudAction::Delete => {
                        let uid = required_uid(data.uid.as_deref(), payload.ecosystem_uid.as_deref())?;
                        config.delete_ecosystem(&uid)?;
                    }
                }
            }
            CrudTarget::Place => {
                let data: PlaceCrudData = serde_json::from_value(payload.data)?;
                match payload.action {
                    CrudAction::Create | CrudAction::Update => {
                        let coordinates = Coordinates {
                            latitude: data
                                .latitude
                                .ok_or_else(|| GaiaError::undefined("Missing latitude"))?,
                            longitude: data
                                .longitude
                                .ok_or_else(|| GaiaError::undefined("Missing longitude"))?,
                        };
                        if payload.action == CrudAction::Create {
                            config.set_place(&data.name, coordinates);
                        } else {
                            config.update_place(&data.name, coordinates)?;
                        }
                    }
                    CrudAction::Delete => config.delete_place(&data.name)?,
                }
                config.save(ConfigType::Private).await?;
                config.signal_new_config();
                return Ok(());
            }
            CrudTarget::ClimateParameter => {
                let uid = required_uid(None, payload.ecosystem_uid.as_deref())?;
                let ecosystem_config = config.get_ecosystem_config(&uid)?;
                let data: ClimateParameterCrudData = serde_json::from_value(payload.data)?;
                match payload.action {
                    CrudAction::Create | CrudAction::Update => {
                        let previous = ecosystem_config
                            .get_climate_parameter(data.parameter)
                            .unwrap_or(ClimateConfig {
                                day: 0.0,
                                night: 0.0,
                                hysteresis: 0.0,
                                alarm: None,
                            });
                        ecosystem_config.set_climate_parameter(
                            data.parameter,
                            ClimateConfig {
                                day: data.day.unwrap_or(previous.day),
                                night: data.night.unwrap_or(previous.night),
                                hysteresis: data.hysteresis.unwrap_or(previous.hysteresis),
                                alarm: data.alarm.or(previous.alarm),
                            },
                        );
                    }
                    CrudAction::Delete => {
                        ecosystem_config.delete_climate_parameter(data.parameter);
                    }
                }
            }
            CrudTarget::Hardware => {
                let uid = required_uid(None, payload.ecosystem_uid.as_deref())?;
                let ecosystem_config = config.get_ecosystem_config(&uid)?;
                match payload.action {
                    CrudAction::Create | CrudAction::Update => {
                        let mut hardware: crate::config::hardware::HardwareConfig =
                            serde_json::from_value(payload.data)?;
                        if hardware.uid.is_empty() {
                            hardware.uid = crate::utils::generate_uid(
                                crate::config::ecosystem::HARDWARE_UID_LENGTH,
                            );
                        }
                        hardware.parsed_address()?;
                        ecosystem_config.set_hardware(hardware);
                    }
                    CrudAction::Delete => {
                        let hardware_uid = payload
                            .data
                            .get("uid")
                            .and_then(Value::as_str)
                            .ok_or_else(|| GaiaError::undefined("Missing hardware uid"))?;
                        ecosystem_config.delete_hardware(hardware_uid)?;
                    }
                }
            }
        }
        config.save(ConfigType::Ecosystems).await?;
        config.signal_new_config();
        Ok(())
    }
}

fn required_uid(from_data: Option<&str>, from_routing: Option<&str>) -> Result<String> {
    from_data
        .or(from_routing)
        .filter(|uid| uid.len() == ECOSYSTEM_UID_LENGTH)
        .map(ToString::to_string)
        .ok_or_else(|| GaiaError::undefined("Missing or invalid ecosystem uid").into())
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Records everything emitted, for assertions.
    pub struct RecordingDispatcher {
        pub connected: Cell<bool>,
        pub emitted: RefCell<Vec<(String, Value)>>,
    }

    impl RecordingDispatcher {
        pub fn new(connected: bool) -> Rc<Self> {
            Rc::new(Self {
                connected: Cell::new(connected),
                emitted: RefCell::new(Vec::new()),
            })
        }

        pub fn events_named(&self, event: &str) -> Vec<Value> {
            self.emitted
                .borrow()
                .iter()
                .filter(|(name, _)| name == event)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    #[async_trait(?Send)]
    impl EventDispatcher for RecordingDispatcher {
        fn is_connected(&self) -> bool {
            self.connected.get()
        }

        async fn emit(&self, event: &str, payload: Value) -> Result<()> {
            if !self.connected.get() {
                return Err(GaiaError::BrokerDisconnected.into());
            }
            self.emitted.borrow_mut().push((event.to_string(), payload));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingDispatcher;
    use chrono::Utc;

    fn reading() -> SensorsData {
        SensorsData {
            timestamp: Utc::now(),
            records: vec![crate::hardware::SensorRecord {
                sensor_uid: "abcdefgh12345678".to_string(),
                measure: "temperature".to_string(),
                value: 21.0,
                timestamp: None,
            }],
            average: Vec::new(),
            alarms: Vec::new(),
        }
    }

    #[tokio::test]
    async fn sensors_data_is_emitted_when_connected() {
        let dispatcher = RecordingDispatcher::new(true);
        let handler = EventHandler::new("engine-1".to_string(), dispatcher.clone(), None);
        handler.send_sensors_data("aaaaaaaa", &reading()).await;
        let events = dispatcher.events_named("sensors_data");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["uid"], "aaaaaaaa");
    }

    #[tokio::test]
    async fn disconnected_broker_buffers_when_database_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let database = crate::database::JsonlDatabase::open(dir.path().to_path_buf())
            .await
            .unwrap();
        let dispatcher = RecordingDispatcher::new(false);
        let handler = EventHandler::new(
            "engine-1".to_string(),
            dispatcher.clone(),
            Some(database.clone() as Rc<dyn Database>),
        );
        handler.send_sensors_data("aaaaaaaa", &reading()).await;
        assert!(dispatcher.emitted.borrow().is_empty());
        assert_eq!(database.buffered_sensors_data().len(), 1);

        // once reconnected, the buffer is re-sent
        dispatcher.connected.set(true);
        handler.send_buffered_sensors_data().await;
        assert_eq!(dispatcher.events_named("buffered_sensors_data").len(), 1);
    }

    #[tokio::test]
    async fn disconnected_broker_drops_without_database() {
        let dispatcher = RecordingDispatcher::new(false);
        let handler = EventHandler::new("engine-1".to_string(), dispatcher.clone(), None);
        // must not error nor panic
        handler.send_sensors_data("aaaaaaaa", &reading()).await;
        assert!(dispatcher.emitted.borrow().is_empty());
    }
}
