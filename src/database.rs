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

//! The persistence collaborator interface.
//!
//! Persistence proper lives outside the engine; this module defines the
//! interface the subroutines talk to, plus a small append-only JSON-lines
//! implementation good enough for a single Raspberry Pi host: a
//! `sensors_history` log, a `health_history` log, and a uuid-keyed buffer
//! of readings that failed delivery to the broker, cleared by `ack`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ecosystem::EcosystemUid;
use crate::events::payloads::{BufferedSensorsData, HealthData, SensorsData};
use crate::gaia_fs;
use crate::hardware::SensorRecord;

const SENSORS_HISTORY_FILE: &str = "sensors_history.jsonl";
const HEALTH_HISTORY_FILE: &str = "health_history.jsonl";
const SENSORS_BUFFER_FILE: &str = "sensors_buffer.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SensorsHistoryRow {
    ecosystem_uid: EcosystemUid,
    sensor_uid: String,
    measure: String,
    timestamp: DateTime<Utc>,
    value: f64,
}

/// What the engine requires from a persistence backend.
#[async_trait(?Send)]
pub trait Database {
    /// Appends one reading's records to the sensors history.
    async fn log_sensors_data(&self, ecosystem_uid: &str, data: &SensorsData) -> Result<()>;

    async fn log_health_data(&self, ecosystem_uid: &str, data: &HealthData) -> Result<()>;

    /// Stores a reading that could not be delivered to the broker.
    async fn buffer_sensors_data(&self, ecosystem_uid: &str, data: &SensorsData) -> Result<Uuid>;

    /// All currently buffered readings, for re-delivery.
    fn buffered_sensors_data(&self) -> Vec<BufferedSensorsData>;

    /// Clears (on success) or keeps (on failure) one buffered reading.
    async fn ack_buffered_data(&self, uuid: Uuid, success: bool) -> Result<()>;
}

/// The JSON-lines backend.
pub struct JsonlDatabase {
    data_dir: PathBuf,
    buffer: RefCell<HashMap<Uuid, BufferedSensorsData>>,
}

impl JsonlDatabase {
    pub async fn open(data_dir: PathBuf) -> Result<Rc<Self>> {
        gaia_fs::create_dir_all(&data_dir)?;
        let database = Self {
            data_dir,
            buffer: RefCell::new(HashMap::new()),
        };
        if let Ok(raw) = gaia_fs::read_txt(database.buffer_path()).await {
            match serde_json::from_str::<HashMap<Uuid, BufferedSensorsData>>(&raw) {
                Ok(buffer) => *database.buffer.borrow_mut() = buffer,
                Err(err) => warn!("Discarding unreadable sensors buffer: {err}"),
            }
        }
        Ok(Rc::new(database))
    }

    fn buffer_path(&self) -> PathBuf {
        self.data_dir.join(SENSORS_BUFFER_FILE)
    }

    async fn append_line(&self, file_name: &str, line: String) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let path = self.data_dir.join(file_name);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Opening {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn persist_buffer(&self) -> Result<()> {
        let content = serde_json::to_string(&*self.buffer.borrow())?;
        gaia_fs::write_string(self.buffer_path(), content).await
    }

    fn history_row(ecosystem_uid: &str, record: &SensorRecord, fallback: DateTime<Utc>) -> SensorsHistoryRow {
        SensorsHistoryRow {
            ecosystem_uid: ecosystem_uid.to_string(),
            sensor_uid: record.sensor_uid.clone(),
            measure: record.measure.clone(),
            timestamp: record.timestamp.unwrap_or(fallback),
            value: record.value,
        }
    }
}

#[async_trait(?Send)]
impl Database for JsonlDatabase {
    async fn log_sensors_data(&self, ecosystem_uid: &str, data: &SensorsData) -> Result<()> {
        for record in &data.records {
            let row = Self::history_row(ecosystem_uid, record, data.timestamp);
            self.append_line(SENSORS_HISTORY_FILE, serde_json::to_string(&row)?)
                .await?;
        }
        Ok(())
    }

    async fn log_health_data(&self, ecosystem_uid: &str, data: &HealthData) -> Result<()> {
        for record in &data.records {
            let row = serde_json::json!({
                "ecosystem_uid": ecosystem_uid,
                "camera_uid": record.camera_uid,
                "measure": record.measure,
                "timestamp": record.timestamp,
                "value": record.value,
            });
            self.append_line(HEALTH_HISTORY_FILE, row.to_string()).await?;
        }
        Ok(())
    }

    async fn buffer_sensors_data(&self, ecosystem_uid: &str, data: &SensorsData) -> Result<Uuid> {
        let uuid = Uuid::new_v4();
        self.buffer.borrow_mut().insert(
            uuid,
            BufferedSensorsData {
                uuid,
                ecosystem_uid: ecosystem_uid.to_string(),
                data: data.clone(),
            },
        );
        self.persist_buffer().await?;
        Ok(uuid)
    }

    fn buffered_sensors_data(&self) -> Vec<BufferedSensorsData> {
        self.buffer.borrow().values().cloned().collect()
    }

    async fn ack_buffered_data(&self, uuid: Uuid, success: bool) -> Result<()> {
        if success {
            if self.buffer.borrow_mut().remove(&uuid).is_none() {
                warn!("Acknowledged an unknown buffered reading: {uuid}");
                return Ok(());
            }
            self.persist_buffer().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> SensorsData {
        SensorsData {
            timestamp: Utc::now(),
            records: vec![SensorRecord {
                sensor_uid: "abcdefgh12345678".to_string(),
                measure: "temperature".to_string(),
                value: 22.5,
                timestamp: None,
            }],
            average: Vec::new(),
            alarms: Vec::new(),
        }
    }

    #[tokio::test]
    async fn logs_sensor_rows_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let database = JsonlDatabase::open(dir.path().to_path_buf()).await.unwrap();
        database.log_sensors_data("aaaaaaaa", &reading()).await.unwrap();
        database.log_sensors_data("aaaaaaaa", &reading()).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join(SENSORS_HISTORY_FILE)).unwrap();
        assert_eq!(content.lines().count(), 2);
        let row: SensorsHistoryRow = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(row.measure, "temperature");
        assert_eq!(row.ecosystem_uid, "aaaaaaaa");
    }

    #[tokio::test]
    async fn buffer_survives_reopen_and_ack_clears() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = {
            let database = JsonlDatabase::open(dir.path().to_path_buf()).await.unwrap();
            database
                .buffer_sensors_data("aaaaaaaa", &reading())
                .await
                .unwrap()
        };
        let database = JsonlDatabase::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(database.buffered_sensors_data().len(), 1);

        // failure keeps the entry, success clears it
        database.ack_buffered_data(uuid, false).await.unwrap();
        assert_eq!(database.buffered_sensors_data().len(), 1);
        database.ack_buffered_data(uuid, true).await.unwrap();
        assert!(database.buffered_sensors_data().is_empty());
    }
}
