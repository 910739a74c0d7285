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

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Result};
use bitflags::bitflags;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::config::hardware::{HardwareConfig, HardwareType, HardwareUid};
use crate::config::EngineConfig;
use crate::errors::GaiaError;
use crate::utils::is_time_between;

pub type EcosystemUid = String;

pub const ECOSYSTEM_UID_LENGTH: usize = 8;
pub const HARDWARE_UID_LENGTH: usize = 16;

bitflags! {
    /// The features enabled for an ecosystem. The first four bits enable
    /// subroutines, the rest auxiliary features.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ManagementFlags: u32 {
        const SENSORS  = 1;
        const LIGHT    = 2;
        const CLIMATE  = 4;
        const HEALTH   = 8;
        const ALARMS   = 16;
        const DATABASE = 32;
        const PICTURES = 64;
        const WEBCAM   = 128;
    }
}

/// The named-bool form the config file and the `management` payload use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub sensors: bool,
    pub light: bool,
    pub climate: bool,
    pub health: bool,
    pub alarms: bool,
    pub database: bool,
    pub pictures: bool,
    pub webcam: bool,
}

impl ManagementConfig {
    pub fn flags(&self) -> ManagementFlags {
        let mut flags = ManagementFlags::empty();
        flags.set(ManagementFlags::SENSORS, self.sensors);
        flags.set(ManagementFlags::LIGHT, self.light);
        flags.set(ManagementFlags::CLIMATE, self.climate);
        flags.set(ManagementFlags::HEALTH, self.health);
        flags.set(ManagementFlags::ALARMS, self.alarms);
        flags.set(ManagementFlags::DATABASE, self.database);
        flags.set(ManagementFlags::PICTURES, self.pictures);
        flags.set(ManagementFlags::WEBCAM, self.webcam);
        flags
    }

    pub fn set_flag(&mut self, flag: ManagementFlags, value: bool) {
        match flag {
            ManagementFlags::SENSORS => self.sensors = value,
            ManagementFlags::LIGHT => self.light = value,
            ManagementFlags::CLIMATE => self.climate = value,
            ManagementFlags::HEALTH => self.health = value,
            ManagementFlags::ALARMS => self.alarms = value,
            ManagementFlags::DATABASE => self.database = value,
            ManagementFlags::PICTURES => self.pictures = value,
            ManagementFlags::WEBCAM => self.webcam = value,
            _ => {}
        }
    }
}

/// Stochastic multiplicative perturbation of the climate and light targets,
/// to simulate weather variability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// 1-in-N chance of starting a chaos window on any daily roll.
    pub frequency: u32,
    /// Window length in days.
    pub duration: u32,
    /// Peak target multiplier, >= 1.0.
    pub intensity: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            frequency: 0,
            duration: 0,
            intensity: 1.0,
        }
    }
}

/// Both bounds set, or neither.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub beginning: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match (self.beginning, self.end) {
            (Some(beginning), Some(end)) => beginning <= now && now < end,
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.beginning = None;
        self.end = None;
    }
}

/// The persisted per-ecosystem chaos state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosMemory {
    pub time_window: TimeWindow,
    pub last_update: NaiveDate,
}

impl Default for ChaosMemory {
    fn default() -> Self {
        Self {
            time_window: TimeWindow::default(),
            // far enough in the past to force a roll on the first refresh
            last_update: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
        }
    }
}

/// Policy for the `day` and `night` boundaries of the nycthemeral cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NycthemeralSpanMethod {
    /// Use the configured clock times.
    Fixed,
    /// Copy a target place's sunrise and sunset.
    Mimic,
}

/// Policy for computing the morning/evening light transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LightingMethod {
    /// The whole day span is lit.
    Fixed,
    /// Light only around dawn and dusk, extending the home civil twilight.
    Elongate,
}

/// `HHhMM` (de)serialization for the nycthemeral day/night times.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%Hh%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid time '{raw}', expected 'HHhMM'"))
        })
    }

    pub fn parse(raw: &str) -> Option<NaiveTime> {
        let (hours, minutes) = raw.split_once(['h', 'H'])?;
        NaiveTime::from_hms_opt(hours.trim().parse().ok()?, minutes.trim().parse().ok()?, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NycthemeralCycleConfig {
    pub span: NycthemeralSpanMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(with = "hhmm")]
    pub day: NaiveTime,
    #[serde(with = "hhmm")]
    pub night: NaiveTime,
    pub lighting: LightingMethod,
}

impl Default for NycthemeralCycleConfig {
    fn default() -> Self {
        Self {
            span: NycthemeralSpanMethod::Fixed,
            target: None,
            day: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            night: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            lighting: LightingMethod::Fixed,
        }
    }
}

/// An environmental value the climate subroutine can regulate, or the light
/// subroutine in the case of `light`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ClimateParameter {
    Temperature,
    Humidity,
    Light,
    Wind,
}

/// Day/night targets for one climate parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimateConfig {
    pub day: f64,
    pub night: f64,
    #[serde(default)]
    pub hysteresis: f64,
    /// Alarm threshold beyond the hysteresis band; alarms are only produced
    /// when set and > 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub chaos: ChaosConfig,
    pub nycthemeral_cycle: NycthemeralCycleConfig,
    /// Keyed by climate parameter name.
    pub climate: BTreeMap<String, ClimateConfig>,
}

/// One entry of the `ecosystems.cfg` mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EcosystemConfigData {
    pub name: String,
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default, rename = "IO")]
    pub io: BTreeMap<HardwareUid, HardwareConfig>,
}

/// Daytime vs nighttime, derived from the nycthemeral span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeriodOfDay {
    Day,
    Night,
}

/// The four boundaries of the lit periods of a day.
///
/// Invariant: `morning_start <= morning_end <= evening_start <= evening_end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightingHours {
    pub morning_start: NaiveTime,
    pub morning_end: NaiveTime,
    pub evening_start: NaiveTime,
    pub evening_end: NaiveTime,
}

/// The resolved day/night boundaries, before the lighting method is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NycthemeralSpanHours {
    pub day: NaiveTime,
    pub night: NaiveTime,
}

/// A live view over one entry of the ecosystems config, with cached derived
/// values for the nycthemeral computation.
///
/// The caches are invalidated by the engine loop on config reloads and sun
/// time refreshes, never by a subroutine.
pub struct EcosystemConfig {
    uid: EcosystemUid,
    general: Weak<EngineConfig>,
    data: RefCell<EcosystemConfigData>,
    span_method_cache: Cell<Option<NycthemeralSpanMethod>>,
    span_hours_cache: Cell<Option<NycthemeralSpanHours>>,
    lighting_method_cache: Cell<Option<LightingMethod>>,
    lighting_hours_cache: Cell<Option<LightingHours>>,
}

impl EcosystemConfig {
    pub fn new(
        uid: EcosystemUid,
        general: Weak<EngineConfig>,
        data: EcosystemConfigData,
    ) -> Rc<Self> {
        Rc::new(Self {
            uid,
            general,
            data: RefCell::new(data),
            span_method_cache: Cell::new(None),
            span_hours_cache: Cell::new(None),
            lighting_method_cache: Cell::new(None),
            lighting_hours_cache: Cell::new(None),
        })
    }

    pub fn uid(&self) -> &EcosystemUid {
        &self.uid
    }

    fn general(&self) -> Result<Rc<EngineConfig>> {
        self.general
            .upgrade()
            .ok_or_else(|| anyhow!("EngineConfig has been dropped"))
    }

    pub fn data(&self) -> EcosystemConfigData {
        self.data.borrow().clone()
    }

    /// Replaces the whole entry, e.g. after a config file reload. Derived
    /// caches are reset.
    pub fn replace_data(&self, data: EcosystemConfigData) {
        *self.data.borrow_mut() = data;
        self.reset_nycthemeral_caches();
    }

    pub fn name(&self) -> String {
        self.data.borrow().name.clone()
    }

    pub fn set_name(&self, name: String) {
        self.data.borrow_mut().name = name;
    }

    /// Whether this ecosystem should be running.
    pub fn status(&self) -> bool {
        self.data.borrow().status
    }

    pub fn set_status(&self, status: bool) {
        self.data.borrow_mut().status = status;
    }

    pub fn management(&self) -> ManagementConfig {
        self.data.borrow().management
    }

    pub fn management_flags(&self) -> ManagementFlags {
        self.data.borrow().management.flags()
    }

    pub fn get_management(&self, flag: ManagementFlags) -> bool {
        self.management_flags().contains(flag)
    }

    pub fn set_management(&self, flag: ManagementFlags, value: bool) {
        self.data.borrow_mut().management.set_flag(flag, value);
    }

    pub fn environment(&self) -> EnvironmentConfig {
        self.data.borrow().environment.clone()
    }

    // ---------------------------------------------------------------------
    //  Climate parameters
    // ---------------------------------------------------------------------

    pub fn get_climate_parameter(&self, parameter: ClimateParameter) -> Result<ClimateConfig> {
        self.data
            .borrow()
            .environment
            .climate
            .get(&parameter.to_string())
            .copied()
            .ok_or_else(|| {
                GaiaError::undefined(format!(
                    "No climate parameter '{parameter}' found for ecosystem '{}'",
                    self.name()
                ))
                .into()
            })
    }

    pub fn set_climate_parameter(&self, parameter: ClimateParameter, config: ClimateConfig) {
        self.data
            .borrow_mut()
            .environment
            .climate
            .insert(parameter.to_string(), config);
    }

    pub fn delete_climate_parameter(&self, parameter: ClimateParameter) {
        self.data
            .borrow_mut()
            .environment
            .climate
            .remove(&parameter.to_string());
    }

    // ---------------------------------------------------------------------
    //  IO / hardware
    // ---------------------------------------------------------------------

    pub fn get_hardware_config(&self, uid: &str) -> Result<HardwareConfig> {
        self.data.borrow().io.get(uid).cloned().ok_or_else(|| {
            GaiaError::HardwareNotFound {
                uid: uid.to_string(),
            }
            .into()
        })
    }

    pub fn hardware_configs(&self) -> Vec<HardwareConfig> {
        self.data.borrow().io.values().cloned().collect()
    }

    /// The hardware uids of one type, in stable (config) order.
    pub fn get_io_group_uids(&self, h_type: HardwareType) -> Vec<HardwareUid> {
        self.data
            .borrow()
            .io
            .iter()
            .filter(|(_, hardware)| hardware.h_type == h_type)
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    /// The set of measures provided by all configured sensors.
    pub fn sensor_measures(&self) -> Vec<String> {
        let mut measures: Vec<String> = self
            .data
            .borrow()
            .io
            .values()
            .filter(|hardware| hardware.h_type == HardwareType::Sensor)
            .flat_map(HardwareConfig::measure_names)
            .map(ToString::to_string)
            .collect();
        measures.sort_unstable();
        measures.dedup();
        measures
    }

    pub fn set_hardware(&self, config: HardwareConfig) {
        self.data.borrow_mut().io.insert(config.uid.clone(), config);
    }

    pub fn delete_hardware(&self, uid: &str) -> Result<()> {
        self.data.borrow_mut().io.remove(uid).map(|_| ()).ok_or_else(|| {
            GaiaError::HardwareNotFound {
                uid: uid.to_string(),
            }
            .into()
        })
    }

    // ---------------------------------------------------------------------
    //  Nycthemeral cycle
    // ---------------------------------------------------------------------

    pub fn nycthemeral_cycle(&self) -> NycthemeralCycleConfig {
        self.data.borrow().environment.nycthemeral_cycle.clone()
    }

    pub fn nycthemeral_span_target(&self) -> Option<String> {
        self.data
            .borrow()
            .environment
            .nycthemeral_cycle
            .target
            .clone()
    }

    pub fn reset_nycthemeral_caches(&self) {
        self.span_method_cache.set(None);
        self.span_hours_cache.set(None);
        self.lighting_method_cache.set(None);
        self.lighting_hours_cache.set(None);
    }

    /// The effective span method. A configured `mimic` without a usable
    /// target place (coordinates + cached sun times) silently downgrades to
    /// `fixed` with a warning; the configured method is never mutated.
    pub fn nycthemeral_span_method(&self) -> NycthemeralSpanMethod {
        if let Some(method) = self.span_method_cache.get() {
            return method;
        }
        let configured = self.data.borrow().environment.nycthemeral_cycle.span;
        let method = match configured {
            NycthemeralSpanMethod::Fixed => NycthemeralSpanMethod::Fixed,
            NycthemeralSpanMethod::Mimic => {
                if self.target_sun_times().is_some() {
                    NycthemeralSpanMethod::Mimic
                } else {
                    warn!(
                        "Nycthemeral span method for ecosystem {} cannot be 'mimic' as the \
                         sun times of its target are not available. Will fall back to 'fixed'.",
                        self.name()
                    );
                    NycthemeralSpanMethod::Fixed
                }
            }
        };
        self.span_method_cache.set(Some(method));
        method
    }

    fn target_sun_times(&self) -> Option<crate::config::sun_times::SunTimes> {
        let target = self.nycthemeral_span_target()?;
        let general = self.general().ok()?;
        general.get_place(&target)?;
        general.cached_sun_times(&target)
    }

    /// The effective day and night boundaries.
    pub fn nycthemeral_span_hours(&self) -> NycthemeralSpanHours {
        if let Some(hours) = self.span_hours_cache.get() {
            return hours;
        }
        let cycle = self.nycthemeral_cycle();
        let hours = if self.nycthemeral_span_method() == NycthemeralSpanMethod::Mimic {
            let sun_times = self.target_sun_times();
            match sun_times.and_then(|st| st.sunrise.zip(st.sunset)) {
                Some((sunrise, sunset)) => NycthemeralSpanHours {
                    day: sunrise,
                    night: sunset,
                },
                None => NycthemeralSpanHours {
                    day: cycle.day,
                    night: cycle.night,
                },
            }
        } else {
            NycthemeralSpanHours {
                day: cycle.day,
                night: cycle.night,
            }
        };
        self.span_hours_cache.set(Some(hours));
        hours
    }

    /// The effective lighting method. `elongate` requires the home sun
    /// times; when unavailable it downgrades to `fixed` with a warning and
    /// without mutating the configured method.
    pub fn lighting_method(&self) -> LightingMethod {
        if let Some(method) = self.lighting_method_cache.get() {
            return method;
        }
        let configured = self.data.borrow().environment.nycthemeral_cycle.lighting;
        let method = match configured {
            LightingMethod::Fixed => LightingMethod::Fixed,
            LightingMethod::Elongate => {
                let home_sun_times = self
                    .general()
                    .ok()
                    .and_then(|general| general.cached_sun_times(crate::config::HOME_PLACE));
                if home_sun_times.is_some() {
                    LightingMethod::Elongate
                } else {
                    warn!(
                        "Lighting method for ecosystem {} cannot be 'elongate' as the sun \
                         times of 'home' weren't found. Will fall back to 'fixed'.",
                        self.name()
                    );
                    LightingMethod::Fixed
                }
            }
        };
        self.lighting_method_cache.set(Some(method));
        method
    }

    /// Computes (and caches) the lighting hours for the current effective
    /// span and lighting methods.
    pub fn lighting_hours(&self) -> LightingHours {
        if let Some(hours) = self.lighting_hours_cache.get() {
            return hours;
        }
        let span = self.nycthemeral_span_hours();
        let morning_start = span.day;
        let evening_end = span.night;
        let (morning_end, evening_start) = match self.lighting_method() {
            LightingMethod::Fixed => {
                // Lights stay on over the whole span: both inner boundaries
                // collapse onto the midpoint.
                let start = to_dt(morning_start);
                let day_span = to_dt(evening_end) - start;
                let half_day = start + day_span / 2;
                ((half_day - Duration::milliseconds(1)).time(), half_day.time())
            }
            LightingMethod::Elongate => {
                let home_sun_times = self
                    .general()
                    .ok()
                    .and_then(|general| general.cached_sun_times(crate::config::HOME_PLACE))
                    .unwrap_or_default();
                let offset = home_sun_times.twilight_offset();
                let sunrise = home_sun_times.sunrise.unwrap_or(morning_start);
                let sunset = home_sun_times.sunset.unwrap_or(evening_end);
                (
                    (to_dt(sunrise) + offset).time(),
                    (to_dt(sunset) - offset).time(),
                )
            }
        };
        // Keep morning_start <= morning_end <= evening_start <= evening_end
        let (morning_end, evening_start) = if morning_start <= evening_end {
            let morning_end = morning_end.clamp(morning_start, evening_end);
            let evening_start = evening_start
                .clamp(morning_start, evening_end)
                .max(morning_end);
            (morning_end, evening_start)
        } else {
            // overnight span; best effort only
            (morning_end.min(evening_end), evening_start.max(morning_start))
        };
        let hours = LightingHours {
            morning_start,
            morning_end,
            evening_start,
            evening_end,
        };
        self.lighting_hours_cache.set(Some(hours));
        hours
    }

    pub fn period_of_day(&self, now: NaiveTime) -> PeriodOfDay {
        let span = self.nycthemeral_span_hours();
        if is_time_between(span.day, span.night, now) {
            PeriodOfDay::Day
        } else {
            PeriodOfDay::Night
        }
    }

    // ---------------------------------------------------------------------
    //  Chaos
    // ---------------------------------------------------------------------

    pub fn chaos_config(&self) -> ChaosConfig {
        self.data.borrow().environment.chaos
    }

    pub fn set_chaos_config(&self, chaos: ChaosConfig) {
        self.data.borrow_mut().environment.chaos = chaos;
    }

    pub fn chaos_time_window(&self) -> TimeWindow {
        self.general()
            .map(|general| general.get_chaos_memory(&self.uid).time_window)
            .unwrap_or_default()
    }

    /// The daily chaos roll. Clears an elapsed window, otherwise draws
    /// `r ~ Uniform{1..frequency}` and opens a new window on `r == 1`.
    ///
    /// Returns `true` when the window changed. The caller is responsible for
    /// persisting the chaos memory afterwards.
    pub fn update_chaos_time_window(&self, now: DateTime<Utc>) -> Result<bool> {
        let frequency = self.chaos_config().frequency;
        let roll = if frequency > 0 {
            rand::thread_rng().gen_range(1..=frequency)
        } else {
            0
        };
        self.apply_chaos_roll(roll, now)
    }

    pub(crate) fn apply_chaos_roll(&self, roll: u32, now: DateTime<Utc>) -> Result<bool> {
        let general = self.general()?;
        let mut memory = general.get_chaos_memory(&self.uid);
        if memory.last_update >= now.date_naive() {
            return Ok(false);
        }
        let mut changed = false;
        let window = &mut memory.time_window;
        if let (Some(beginning), Some(end)) = (window.beginning, window.end) {
            if !(beginning <= now && now <= end) {
                window.clear();
                changed = true;
            }
        } else if roll == 1 {
            let beginning = now
                .date_naive()
                .and_hms_opt(14, 0, 0)
                .unwrap()
                .and_utc();
            window.beginning = Some(beginning);
            window.end = Some(beginning + Duration::days(i64::from(self.chaos_config().duration)));
            changed = true;
        }
        memory.last_update = now.date_naive();
        general.set_chaos_memory(&self.uid, memory);
        Ok(changed)
    }

    /// The multiplicative factor applied to climate and light targets:
    /// `sin(pi * elapsed_fraction) * (intensity - 1) + 1` inside the chaos
    /// window, 1.0 outside.
    pub fn get_chaos_factor(&self, now: DateTime<Utc>) -> f64 {
        let window = self.chaos_time_window();
        let (Some(beginning), Some(end)) = (window.beginning, window.end) else {
            return 1.0;
        };
        if !window.is_active(now) {
            return 1.0;
        }
        let window_seconds = (end - beginning).num_seconds() as f64;
        if window_seconds <= 0.0 {
            return 1.0;
        }
        let elapsed_seconds = (now - beginning).num_seconds() as f64;
        let fraction = elapsed_seconds / window_seconds;
        (fraction * PI).sin() * (self.chaos_config().intensity - 1.0) + 1.0
    }
}

fn to_dt(time: NaiveTime) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_time(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn management_flags_round_trip() {
        let management = ManagementConfig {
            sensors: true,
            climate: true,
            alarms: true,
            ..Default::default()
        };
        let flags = management.flags();
        assert!(flags.contains(ManagementFlags::SENSORS));
        assert!(flags.contains(ManagementFlags::CLIMATE));
        assert!(flags.contains(ManagementFlags::ALARMS));
        assert!(!flags.contains(ManagementFlags::LIGHT));

        let mut updated = management;
        updated.set_flag(ManagementFlags::LIGHT, true);
        updated.set_flag(ManagementFlags::ALARMS, false);
        assert!(updated.light);
        assert!(!updated.alarms);
    }

    #[test]
    fn hhmm_parses_both_paddings() {
        assert_eq!(hhmm::parse("8h00"), NaiveTime::from_hms_opt(8, 0, 0));
        assert_eq!(hhmm::parse("08h00"), NaiveTime::from_hms_opt(8, 0, 0));
        assert_eq!(hhmm::parse("22H30"), NaiveTime::from_hms_opt(22, 30, 0));
        assert_eq!(hhmm::parse("25h00"), None);
        assert_eq!(hhmm::parse("0800"), None);
    }

    #[test]
    fn time_window_activity() {
        let now = Utc::now();
        let mut window = TimeWindow {
            beginning: Some(now - Duration::hours(1)),
            end: Some(now + Duration::hours(1)),
        };
        assert!(window.is_active(now));
        assert!(!window.is_active(now + Duration::hours(2)));
        window.clear();
        assert!(!window.is_active(now));
    }

    #[test]
    fn ecosystem_data_toml_round_trip() {
        let toml_str = r#"
            name = "test ecosystem"
            status = true

            [management]
            sensors = true
            light = true

            [environment.chaos]
            frequency = 10
            duration = 2
            intensity = 1.5

            [environment.nycthemeral_cycle]
            span = "fixed"
            day = "8h00"
            night = "20h00"
            lighting = "elongate"

            [environment.climate.temperature]
            day = 25.0
            night = 20.0
            hysteresis = 1.0
            alarm = 2.0

            [IO.aBcDeFgH12345678]
            name = "heater"
            address = "GPIO_17"
            type = "heater"
            level = "environment"
            model = "gpioSwitch"
        "#;
        let data: EcosystemConfigData = toml::from_str(toml_str).unwrap();
        assert!(data.status);
        assert!(data.management.sensors);
        assert_eq!(data.environment.chaos.frequency, 10);
        assert_eq!(
            data.environment.nycthemeral_cycle.day,
            NaiveTime::from_hms_opt(8, 0, 0).unwrap()
        );
        assert_eq!(
            data.environment.nycthemeral_cycle.lighting,
            LightingMethod::Elongate
        );
        let climate = data.environment.climate.get("temperature").unwrap();
        assert_eq!(climate.alarm, Some(2.0));
        let hardware = data.io.get("aBcDeFgH12345678").unwrap();
        assert_eq!(hardware.h_type, HardwareType::Heater);

        let dumped = toml::to_string(&data).unwrap();
        let reloaded: EcosystemConfigData = toml::from_str(&dumped).unwrap();
        assert_eq!(reloaded, data);
    }
}
