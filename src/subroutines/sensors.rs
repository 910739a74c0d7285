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

//! The sensors subroutine: periodic polling of every owned sensor,
//! aggregation into the shared reading cache, alarm detection, and the
//! hand-off that paces the climate subroutine.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, Timelike, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

use crate::config::ecosystem::{ClimateParameter, ManagementFlags, PeriodOfDay};
use crate::config::hardware::{HardwareType, HardwareUid};
use crate::database::Database;
use crate::ecosystem::Ecosystem;
use crate::events::payloads::{
    MeasureAverage, Position, SensorAlarm, SensorsData, WarningLevel,
};
use crate::hardware::{BaseSensor, Hardware, SensorRecord};
use crate::subroutines::{run_guarded_routine, Subroutine, SubroutineCore, SubroutineKind};

/// The lower bound on the polling period.
const MIN_LOOP_PERIOD: Duration = Duration::from_secs(10);
/// How long a sensor may take before it is carried over to the next tick.
const SENSOR_TIMEOUT: Duration = Duration::from_secs(5);
/// Transient read failures are retried this many times before giving up.
const READ_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

type SensorFuture = JoinHandle<Option<Vec<SensorRecord>>>;

pub struct Sensors {
    core: SubroutineCore,
    loop_period: Duration,
    /// Reads that outlived the 5 s budget, kept for the next tick.
    slow_sensors: std::cell::RefCell<HashMap<HardwareUid, SensorFuture>>,
    climate_tick_counter: Cell<u32>,
    last_logged_minute: Cell<Option<i64>>,
}

impl Sensors {
    pub fn new(ecosystem: Weak<Ecosystem>) -> Rc<Self> {
        let loop_period = ecosystem
            .upgrade()
            .map(|ecosystem| ecosystem.app_config().sensors_loop_period)
            .unwrap_or(MIN_LOOP_PERIOD)
            .max(MIN_LOOP_PERIOD);
        Rc::new(Self {
            core: SubroutineCore::new(SubroutineKind::Sensors, ecosystem),
            loop_period,
            slow_sensors: std::cell::RefCell::new(HashMap::new()),
            climate_tick_counter: Cell::new(0),
            last_logged_minute: Cell::new(None),
        })
    }

    /// Spawns one resilient read per owned sensor that is not still busy
    /// from the previous tick.
    fn fire_sensor_reads(&self) -> HashMap<HardwareUid, SensorFuture> {
        let mut futures: HashMap<HardwareUid, SensorFuture> =
            std::mem::take(&mut *self.slow_sensors.borrow_mut());
        for driver in self.core.hardware() {
            if futures.contains_key(driver.uid()) {
                // still trying to get its measures, do not pile on
                continue;
            }
            if driver.as_sensor().is_none() {
                continue;
            }
            let uid = driver.uid().clone();
            let future = tokio::task::spawn_local(async move {
                let sensor = driver.as_sensor().expect("checked above");
                for attempt in 1..=READ_ATTEMPTS {
                    match sensor.get_data().await {
                        Ok(records) => return Some(records),
                        Err(err) if attempt < READ_ATTEMPTS => {
                            debug!(
                                "Sensor '{}' failed (attempt {attempt}): {err}",
                                driver.name()
                            );
                            sleep(RETRY_BACKOFF * attempt).await;
                        }
                        Err(err) => {
                            warn!(
                                "Sensor '{}' failed {READ_ATTEMPTS} times, emitting no \
                                 reading: {err}",
                                driver.name()
                            );
                        }
                    }
                }
                None
            });
            futures.insert(uid, future);
        }
        futures
    }

    /// Gathers all reads, giving each at most the 5 s budget. Futures still
    /// pending at the deadline are kept for the next tick.
    async fn gather_records(&self) -> Vec<SensorRecord> {
        let futures = self.fire_sensor_reads();
        let deadline = Instant::now() + SENSOR_TIMEOUT;
        let mut records = Vec::new();
        for (uid, mut future) in futures {
            match timeout_at(deadline, &mut future).await {
                Ok(Ok(Some(sensor_records))) => records.extend(sensor_records),
                Ok(Ok(None)) => {} // logged by the read task
                Ok(Err(join_err)) => error!("A sensor read task failed: {join_err}"),
                Err(_) => {
                    warn!(
                        "Sensor with uid '{uid}' took too long to fetch data. Will try \
                         to gather data during next routine."
                    );
                    self.slow_sensors.borrow_mut().insert(uid, future);
                }
            }
        }
        records
    }

    fn compute_averages(records: &[SensorRecord]) -> Vec<MeasureAverage> {
        let mut to_average: HashMap<&str, Vec<f64>> = HashMap::new();
        for record in records {
            to_average
                .entry(record.measure.as_str())
                .or_default()
                .push(record.value);
        }
        let mut averages: Vec<MeasureAverage> = to_average
            .into_iter()
            .map(|(measure, values)| MeasureAverage {
                measure: measure.to_string(),
                value: (values.iter().sum::<f64>() / values.len() as f64 * 100.0).round() / 100.0,
                timestamp: None,
            })
            .collect();
        averages.sort_by(|a, b| a.measure.cmp(&b.measure));
        averages
    }

    /// Produces an alarm for every record outside `target ± hysteresis` by
    /// more than the parameter's alarm threshold.
    fn compute_alarms(&self, records: &[SensorRecord]) -> Vec<SensorAlarm> {
        let Ok(config) = self.core.config() else {
            return Vec::new();
        };
        let pod = config.period_of_day(Local::now().time());
        let mut alarms = Vec::new();
        for record in records {
            let Ok(parameter) = ClimateParameter::from_str(&record.measure) else {
                continue;
            };
            let Ok(climate_cfg) = config.get_climate_parameter(parameter) else {
                continue;
            };
            let Some(threshold) = climate_cfg.alarm.filter(|threshold| *threshold > 0.0) else {
                continue;
            };
            let target = match pod {
                PeriodOfDay::Day => climate_cfg.day,
                PeriodOfDay::Night => climate_cfg.night,
            };
            let Some((position, delta, level)) =
                classify_alarm(record.value, target, climate_cfg.hysteresis, threshold)
            else {
                continue;
            };
            alarms.push(SensorAlarm {
                sensor_uid: record.sensor_uid.clone(),
                measure: record.measure.clone(),
                position,
                delta,
                level,
            });
        }
        alarms
    }

    async fn update_sensors_data(&self) -> Result<()> {
        let ecosystem = self.core.ecosystem()?;
        let records = self.gather_records().await;
        if records.is_empty() {
            ecosystem.set_sensors_data(None);
            return Ok(());
        }
        let average = Self::compute_averages(&records);
        let alarms = if ecosystem.config().get_management(ManagementFlags::ALARMS) {
            self.compute_alarms(&records)
        } else {
            Vec::new()
        };
        let data = SensorsData {
            timestamp: Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now),
            records,
            average,
            alarms,
        };
        self.log_to_database(&ecosystem, &data);
        ecosystem.set_sensors_data(Some(data.clone()));
        self.schedule_send_data(&ecosystem, data);
        Ok(())
    }

    /// Persists records on minute boundaries whose minute is a multiple of
    /// the logging period.
    fn log_to_database(&self, ecosystem: &Rc<Ecosystem>, data: &SensorsData) {
        let Some(engine) = ecosystem.engine() else {
            return;
        };
        let Some(database) = engine.database() else {
            return;
        };
        let period = ecosystem.app_config().sensors_logging_period.max(1);
        let minute_index = data.timestamp.timestamp() / 60;
        if data.timestamp.minute() % period != 0
            || self.last_logged_minute.get() == Some(minute_index)
        {
            return;
        }
        self.last_logged_minute.set(Some(minute_index));
        let ecosystem_uid = ecosystem.uid().clone();
        let data = data.clone();
        tokio::task::spawn_local(async move {
            if let Err(err) = database.log_sensors_data(&ecosystem_uid, &data).await {
                error!("Encountered an error while logging sensors data: {err}");
            }
        });
    }

    /// Non-blocking `sensors_data` emission; buffering on broker failure is
    /// handled by the event handler.
    fn schedule_send_data(&self, ecosystem: &Rc<Ecosystem>, data: SensorsData) {
        let Some(engine) = ecosystem.engine() else {
            return;
        };
        let Some(event_handler) = engine.event_handler() else {
            return;
        };
        let ecosystem_uid = ecosystem.uid().clone();
        tokio::task::spawn_local(async move {
            event_handler.send_sensors_data(&ecosystem_uid, &data).await;
        });
    }

    /// Triggers the climate routine roughly every
    /// `ceil(climate_loop_period / sensors_loop_period)` sensor ticks.
    async fn maybe_trigger_climate(&self) {
        let Ok(ecosystem) = self.core.ecosystem() else {
            return;
        };
        if !ecosystem.subroutine_is_started(SubroutineKind::Climate) {
            self.climate_tick_counter.set(0);
            return;
        }
        let climate_period = ecosystem.app_config().climate_loop_period.as_secs_f64();
        let ratio = (climate_period / self.loop_period.as_secs_f64()).ceil().max(1.0) as u32;
        let ticks = self.climate_tick_counter.get() + 1;
        if ticks < ratio {
            self.climate_tick_counter.set(ticks);
            return;
        }
        self.climate_tick_counter.set(0);
        if let Some(climate) = ecosystem.get_subroutine(SubroutineKind::Climate) {
            run_guarded_routine(&climate).await;
        }
    }
}

/// Where a value sits relative to `target ± hysteresis`, and how severe the
/// excursion is compared to the alarm threshold.
fn classify_alarm(
    value: f64,
    target: f64,
    hysteresis: f64,
    threshold: f64,
) -> Option<(Position, f64, WarningLevel)> {
    let (position, delta) = if value < target - hysteresis {
        (Position::Under, target - hysteresis - value)
    } else if value > target + hysteresis {
        (Position::Above, value - (target + hysteresis))
    } else {
        return None;
    };
    if delta <= threshold {
        return None;
    }
    let level = if delta <= 1.5 * threshold {
        WarningLevel::Moderate
    } else if delta <= 2.0 * threshold {
        WarningLevel::High
    } else {
        WarningLevel::Critical
    };
    Some((position, delta, level))
}

#[async_trait(?Send)]
impl Subroutine for Sensors {
    fn kind(&self) -> SubroutineKind {
        SubroutineKind::Sensors
    }

    fn core(&self) -> &SubroutineCore {
        &self.core
    }

    fn compute_if_manageable(&self) -> bool {
        let Ok(config) = self.core.config() else {
            return false;
        };
        if config.get_io_group_uids(HardwareType::Sensor).is_empty() {
            warn!("No sensor detected in ecosystem {}", self.core.ecosystem_name());
            return false;
        }
        true
    }

    fn hardware_needed_uids(&self) -> HashSet<HardwareUid> {
        self.core
            .config()
            .map(|config| {
                config
                    .get_io_group_uids(HardwareType::Sensor)
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn start(self: Rc<Self>) -> Result<()> {
        let needed = self.hardware_needed_uids();
        self.core.refresh_hardware(&needed).await?;
        info!(
            "Starting the sensors loop of {}. It will run every {:.1} s.",
            self.core.ecosystem_name(),
            self.loop_period.as_secs_f64()
        );
        self.core
            .spawn_routine_loop(Rc::clone(&self) as Rc<dyn Subroutine>, self.loop_period);
        self.core.started.set(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("Stopping the sensors loop of {}.", self.core.ecosystem_name());
        self.core.cancel_routine_loop();
        for (_, future) in self.slow_sensors.borrow_mut().drain() {
            // running reads are abandoned; their results are discarded
            future.abort();
        }
        if let Ok(ecosystem) = self.core.ecosystem() {
            // climate cannot run without readings
            if ecosystem.subroutine_is_started(SubroutineKind::Climate) {
                if let Some(climate) = ecosystem.get_subroutine(SubroutineKind::Climate) {
                    if let Err(err) = climate.stop().await {
                        error!("Stopping the climate subroutine failed: {err}");
                    }
                }
            }
            ecosystem.set_sensors_data(None);
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
        let start = Instant::now();
        debug!("Starting sensors data update routine ...");
        self.update_sensors_data().await?;
        let update_time = start.elapsed();
        debug!("Sensors data update finished in {:.1} s.", update_time.as_secs_f64());
        if update_time > self.loop_period {
            warn!(
                "The sensors routine took {:.1} s, longer than its period. This either \
                 indicates errors during data retrieval or a too short loop period.",
                update_time.as_secs_f64()
            );
        }
        self.maybe_trigger_climate().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(measure: &str, value: f64) -> SensorRecord {
        SensorRecord {
            sensor_uid: "abcdefgh12345678".to_string(),
            measure: measure.to_string(),
            value,
            timestamp: None,
        }
    }

    #[test]
    fn averages_are_per_measure_means() {
        let records = vec![
            record("temperature", 20.0),
            record("temperature", 22.0),
            record("humidity", 50.0),
        ];
        let averages = Sensors::compute_averages(&records);
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0].measure, "humidity");
        assert_eq!(averages[0].value, 50.0);
        assert_eq!(averages[1].measure, "temperature");
        assert_eq!(averages[1].value, 21.0);
    }

    #[test]
    fn zero_records_produce_no_averages() {
        assert!(Sensors::compute_averages(&[]).is_empty());
    }

    #[test]
    fn alarm_levels_scale_with_the_threshold() {
        // target 25, hysteresis 1, threshold 2: band edge at 26
        assert!(classify_alarm(25.5, 25.0, 1.0, 2.0).is_none());
        // outside the band but within the threshold
        assert!(classify_alarm(27.5, 25.0, 1.0, 2.0).is_none());
        let (position, delta, level) = classify_alarm(29.0, 25.0, 1.0, 2.0).unwrap();
        assert_eq!(position, Position::Above);
        assert_eq!(delta, 3.0);
        assert_eq!(level, WarningLevel::Moderate);
        let (_, _, level) = classify_alarm(29.5, 25.0, 1.0, 2.0).unwrap();
        assert_eq!(level, WarningLevel::High);
        let (position, _, level) = classify_alarm(17.0, 25.0, 1.0, 2.0).unwrap();
        assert_eq!(position, Position::Under);
        assert_eq!(level, WarningLevel::Critical);
    }
}
