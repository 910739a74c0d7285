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

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const ENV_DIR: &str = "GAIA_DIR";
pub const ENV_LOG_DIR: &str = "GAIA_LOG_DIR";
pub const ENV_CACHE_DIR: &str = "GAIA_CACHE_DIR";
pub const ENV_DATABASE_URI: &str = "GAIA_DATABASE_URI";
pub const ENV_COMMUNICATION_URL: &str = "GAIA_COMMUNICATION_URL";
pub const ENV_SECRET_KEY: &str = "GAIA_SECRET_KEY";
pub const ENV_UID: &str = "GAIA_UID";
pub const ENV_VIRTUALIZATION: &str = "GAIA_VIRTUALIZATION";

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Process-wide application settings.
///
/// These are read once from the environment at startup. Everything that can
/// change at runtime lives in the config files instead (see `config`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// The engine data directory, containing the config files.
    pub base_dir: PathBuf,
    pub log_dir: PathBuf,
    pub cache_dir: PathBuf,

    /// A stable identifier for this engine instance.
    pub engine_uid: String,

    /// Connection URI for the optional persistence plugin.
    pub database_uri: Option<String>,
    /// Broker URL for the optional outbound event stream to the aggregator.
    pub communication_url: Option<String>,
    pub secret_key: Option<String>,

    /// Run with virtual hardware models instead of real drivers.
    pub virtualization: bool,

    pub config_watcher_period: Duration,
    pub sensors_loop_period: Duration,
    pub light_loop_period: Duration,
    pub climate_loop_period: Duration,
    /// Sensor records are persisted at minute boundaries that are multiples
    /// of this period (in minutes).
    pub sensors_logging_period: u32,
    /// Daily wall-clock time of the health routine, `HHhMM`.
    pub health_logging_time: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let base_dir = env::var(ENV_DIR)
            .map(PathBuf::from)
            .or_else(|_| env::current_dir())
            .with_context(|| "Determining the engine base directory")?;
        let log_dir = env::var(ENV_LOG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("logs"));
        let cache_dir = env::var(ENV_CACHE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join(".cache"));
        let engine_uid = match env::var(ENV_UID) {
            Ok(uid) => uid,
            Err(_) => machine_derived_uid(),
        };
        Ok(Self {
            base_dir,
            log_dir,
            cache_dir,
            engine_uid,
            database_uri: env::var(ENV_DATABASE_URI).ok(),
            communication_url: env::var(ENV_COMMUNICATION_URL).ok(),
            secret_key: env::var(ENV_SECRET_KEY).ok(),
            virtualization: env_flag(ENV_VIRTUALIZATION),
            config_watcher_period: Duration::from_millis(250),
            sensors_loop_period: Duration::from_secs(5),
            light_loop_period: Duration::from_millis(500),
            climate_loop_period: Duration::from_secs(10),
            sensors_logging_period: 10,
            health_logging_time: "00h00".to_string(),
        })
    }

    pub fn use_database(&self) -> bool {
        self.database_uri.is_some()
    }

    pub fn use_message_broker(&self) -> bool {
        self.communication_url.is_some()
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| {
        let value = value.trim().to_lowercase();
        !(value.is_empty() || value == "0" || value == "false" || value == "no")
    })
}

/// A stable fallback engine UID when `GAIA_UID` is not set.
fn machine_derived_uid() -> String {
    std::fs::read_to_string(MACHINE_ID_PATH)
        .map(|id| id.trim().to_string())
        .unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_without_env() {
        unsafe {
            env::remove_var(ENV_DIR);
            env::remove_var(ENV_DATABASE_URI);
            env::remove_var(ENV_COMMUNICATION_URL);
            env::remove_var(ENV_VIRTUALIZATION);
        }
        let config = AppConfig::from_env().unwrap();
        assert!(!config.use_database());
        assert!(!config.use_message_broker());
        assert!(!config.virtualization);
        assert_eq!(config.sensors_logging_period, 10);
        assert_eq!(config.log_dir, config.base_dir.join("logs"));
    }

    #[test]
    #[serial]
    fn virtualization_flag_parsing() {
        unsafe { env::set_var(ENV_VIRTUALIZATION, "1") };
        assert!(env_flag(ENV_VIRTUALIZATION));
        unsafe { env::set_var(ENV_VIRTUALIZATION, "false") };
        assert!(!env_flag(ENV_VIRTUALIZATION));
        unsafe { env::remove_var(ENV_VIRTUALIZATION) };
        assert!(!env_flag(ENV_VIRTUALIZATION));
    }
}
