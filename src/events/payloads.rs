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

//! The JSON payload models of the aggregator event interface.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::actuators::{ActuatorState, ActuatorTurnTo};
use crate::config::ecosystem::{
    ClimateParameter, EcosystemUid, EnvironmentConfig, LightingHours, LightingMethod,
    ManagementConfig, NycthemeralSpanMethod,
};
use crate::config::hardware::{HardwareConfig, HardwareType, HardwareUid};
use crate::hardware::SensorRecord;

/// Wraps a payload with the ecosystem it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcosystemPayload<T> {
    pub uid: EcosystemUid,
    pub data: T,
}

impl<T> EcosystemPayload<T> {
    pub fn wrap(uid: EcosystemUid, data: T) -> Self {
        Self { uid, data }
    }
}

// ---------------------------------------------------------------------
//  Sensors
// ---------------------------------------------------------------------

/// Per-measure mean across all contributing sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureAverage {
    pub measure: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Which side of the target band a reading fell out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Under,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Moderate,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorAlarm {
    pub sensor_uid: HardwareUid,
    pub measure: String,
    pub position: Position,
    pub delta: f64,
    pub level: WarningLevel,
}

/// One full sensors reading: raw records, per-measure averages and any
/// alarms raised. This is also the in-memory reading the climate
/// subroutine consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorsData {
    pub timestamp: DateTime<Utc>,
    pub records: Vec<SensorRecord>,
    pub average: Vec<MeasureAverage>,
    pub alarms: Vec<SensorAlarm>,
}

impl SensorsData {
    pub fn get_average(&self, measure: &str) -> Option<f64> {
        self.average
            .iter()
            .find(|average| average.measure == measure)
            .map(|average| average.value)
    }
}

// ---------------------------------------------------------------------
//  Light
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightData {
    pub method: LightingMethod,
    pub span: NycthemeralSpanMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub lighting_hours: LightingHours,
}

// ---------------------------------------------------------------------
//  Health
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub camera_uid: HardwareUid,
    pub measure: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthData {
    pub timestamp: DateTime<Utc>,
    pub records: Vec<HealthRecord>,
}

// ---------------------------------------------------------------------
//  Config-shaped payloads
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseInfo {
    pub engine_uid: String,
    pub uid: EcosystemUid,
    pub name: String,
    pub status: bool,
}

pub type ManagementPayload = ManagementConfig;
pub type EnvironmentalParameters = EnvironmentConfig;
pub type HardwarePayload = Vec<HardwareConfig>;
pub type ActuatorData = HashMap<HardwareType, ActuatorState>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEngine {
    pub engine_uid: String,
    pub address: Option<String>,
}

// ---------------------------------------------------------------------
//  Buffered data & acknowledgements
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedSensorsData {
    pub uuid: Uuid,
    pub ecosystem_uid: EcosystemUid,
    pub data: SensorsData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedDataAck {
    pub uuid: Uuid,
    pub status: AckStatus,
}

// ---------------------------------------------------------------------
//  Inbound commands
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnActuatorPayload {
    pub ecosystem_uid: EcosystemUid,
    /// Missing in `turn_light` payloads, which imply the light type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actuator: Option<HardwareType>,
    pub mode: ActuatorTurnTo,
    /// Manual-override countdown in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeManagementPayload {
    pub ecosystem_uid: EcosystemUid,
    pub management: ManagementConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CrudAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CrudTarget {
    Ecosystem,
    Place,
    ClimateParameter,
    Hardware,
}

/// A config mutation request. The only non-idempotent inbound event: it
/// carries a UUID acknowledged via `crud_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudPayload {
    pub uuid: Uuid,
    pub engine_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecosystem_uid: Option<EcosystemUid>,
    pub action: CrudAction,
    pub target: CrudTarget,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudResult {
    pub uuid: Uuid,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payloads used by crud requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcosystemCrudData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<EcosystemUid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceCrudData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateParameterCrudData {
    pub parameter: ClimateParameter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub night: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hysteresis: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_actuator_payload_round_trip() {
        let payload = TurnActuatorPayload {
            ecosystem_uid: "abcdefgh".to_string(),
            actuator: Some(HardwareType::Light),
            mode: ActuatorTurnTo::On,
            countdown: Some(30.0),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["actuator"], "light");
        assert_eq!(json["mode"], "on");
        let parsed: TurnActuatorPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, payload);

        // turn_light payloads omit the actuator entirely
        let light_only = serde_json::json!({
            "ecosystem_uid": "abcdefgh",
            "mode": "automatic",
        });
        let parsed: TurnActuatorPayload = serde_json::from_value(light_only).unwrap();
        assert_eq!(parsed.actuator, None);
    }

    #[test]
    fn sensors_data_average_lookup() {
        let data = SensorsData {
            timestamp: Utc::now(),
            records: Vec::new(),
            average: vec![MeasureAverage {
                measure: "temperature".to_string(),
                value: 21.5,
                timestamp: None,
            }],
            alarms: Vec::new(),
        };
        assert_eq!(data.get_average("temperature"), Some(21.5));
        assert_eq!(data.get_average("humidity"), None);
    }

    #[test]
    fn crud_payload_parses_snake_case_targets() {
        let json = serde_json::json!({
            "uuid": Uuid::new_v4(),
            "engine_uid": "engine-1",
            "action": "update",
            "target": "climate_parameter",
            "data": {"parameter": "temperature", "day": 26.0},
        });
        let payload: CrudPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.action, CrudAction::Update);
        assert_eq!(payload.target, CrudTarget::ClimateParameter);
    }
}
