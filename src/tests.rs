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

// ! These are somewhat "integration" tests for the control plane: the
// ! engine reconciler, the ecosystem lifecycle and the actuator override
// ! paths, run against virtual hardware.

use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use crate::actuators::{ActuatorMode, ActuatorTurnTo};
use crate::app_config::AppConfig;
use crate::config::ecosystem::{ClimateConfig, ClimateParameter};
use crate::config::{ConfigType, EngineConfig};
use crate::config::hardware::HardwareType;
use crate::engine::Engine;
use crate::gaia_fs;
use crate::subroutines::{Subroutine, SubroutineKind};

fn test_app_config(dir: &std::path::Path) -> Rc<AppConfig> {
    Rc::new(AppConfig {
        base_dir: dir.to_path_buf(),
        log_dir: dir.join("logs"),
        cache_dir: dir.join(".cache"),
        engine_uid: "test-engine".to_string(),
        database_uri: None,
        communication_url: None,
        secret_key: None,
        virtualization: true,
        config_watcher_period: Duration::from_millis(250),
        sensors_loop_period: Duration::from_secs(10),
        light_loop_period: Duration::from_millis(500),
        climate_loop_period: Duration::from_secs(10),
        sensors_logging_period: 10,
        health_logging_time: "00h00".to_string(),
    })
}

const TEST_ECOSYSTEMS_CFG: &str = r#"
[testEco1]
name = "test greenhouse"
status = true

[testEco1.management]
sensors = true
light = true
climate = true

[testEco1.environment.nycthemeral_cycle]
span = "fixed"
day = "8h00"
night = "20h00"
lighting = "fixed"

[testEco1.environment.climate.temperature]
day = 25.0
night = 20.0
hysteresis = 1.0

[testEco1.IO.sensorAht2000001]
name = "air sensor"
address = "I2C_default"
type = "sensor"
level = "environment"
model = "virtualAHT20"
measures = ["temperature|°C", "humidity|% humidity"]

[testEco1.IO.lightStrip000001]
name = "light strip"
address = "BCM_4"
type = "light"
level = "environment"
model = "virtualDimmable"

[testEco1.IO.heaterPlug000001]
name = "heater plug"
address = "BCM_17"
type = "heater"
level = "environment"
model = "virtualSwitch"
"#;

async fn engine_with_test_config(dir: &std::path::Path) -> Rc<Engine> {
    gaia_fs::create_dir_all(dir).unwrap();
    let app_config = test_app_config(dir);
    let config = EngineConfig::new(app_config);
    gaia_fs::write_string(
        config.get_file_path(ConfigType::Ecosystems),
        TEST_ECOSYSTEMS_CFG.to_string(),
    )
    .await
    .unwrap();
    config.initialize_configs().await.unwrap();
    Engine::new(config)
}

#[tokio::test]
async fn reconciler_matches_config() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine_with_test_config(dir.path()).await;
            engine.refresh_ecosystems().await.unwrap();

            // live set and started set follow the config
            assert_eq!(engine.ecosystems_uids(), vec!["testEco1".to_string()]);
            assert!(engine.ecosystems_started().contains("testEco1"));
            let ecosystem = engine.get_ecosystem("testEco1").unwrap();
            assert!(ecosystem.subroutine_is_started(SubroutineKind::Sensors));
            assert!(ecosystem.subroutine_is_started(SubroutineKind::Light));

            // every started subroutine owns only mounted hardware
            for kind in [SubroutineKind::Sensors, SubroutineKind::Light] {
                let subroutine = ecosystem.get_subroutine(kind).unwrap();
                let mounted: std::collections::HashSet<String> =
                    ecosystem.hardware_uids().into_iter().collect();
                for uid in subroutine.hardware_needed_uids() {
                    assert!(mounted.contains(&uid), "{kind} is missing {uid}");
                }
            }

            // flipping the status stops the ecosystem on the next round
            let ecosystem_config = engine.config().get_ecosystem_config("testEco1").unwrap();
            ecosystem_config.set_status(false);
            engine.refresh_ecosystems().await.unwrap();
            assert!(engine.ecosystems_started().is_empty());
            // the ecosystem itself is still mounted (present in the config)
            assert_eq!(engine.ecosystems_uids(), vec!["testEco1".to_string()]);
        })
        .await;
}

#[tokio::test]
async fn start_stop_round_trip_is_neutral() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine_with_test_config(dir.path()).await;
            engine.refresh_ecosystems().await.unwrap();
            let started_before = engine.ecosystems_started();

            let ecosystem = engine.get_ecosystem("testEco1").unwrap();
            ecosystem.stop().await.unwrap();
            assert!(engine.ecosystems_started().is_empty());
            ecosystem.start().await.unwrap();
            assert_eq!(engine.ecosystems_started(), started_before);
        })
        .await;
}

#[tokio::test]
async fn manual_override_with_countdown_reverts_to_automatic() {
    LocalSet::new()
        .run_until(async {
            tokio::time::pause();
            let dir = tempfile::tempdir().unwrap();
            let engine = engine_with_test_config(dir.path()).await;
            engine.refresh_ecosystems().await.unwrap();
            let ecosystem = engine.get_ecosystem("testEco1").unwrap();
            let handler = ecosystem
                .actuator_hub()
                .get_handler(HardwareType::Light)
                .unwrap();

            ecosystem
                .turn_actuator(
                    HardwareType::Light,
                    ActuatorTurnTo::On,
                    Some(Duration::from_secs(30)),
                )
                .await;
            assert!(handler.status());
            assert_eq!(handler.mode(), ActuatorMode::Manual);
            assert!(handler.countdown().unwrap() > 29.0);

            tokio::time::advance(Duration::from_secs(31)).await;
            // the countdown elapsed: the mode reverts and the PID decides
            assert!(!handler.compute_expected_status(-10.0));
            assert_eq!(handler.mode(), ActuatorMode::Automatic);
        })
        .await;
}

#[tokio::test]
async fn sensor_miss_cascade_stops_climate() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine_with_test_config(dir.path()).await;
            engine.refresh_ecosystems().await.unwrap();
            let ecosystem = engine.get_ecosystem("testEco1").unwrap();
            assert!(ecosystem.subroutine_is_started(SubroutineKind::Climate));

            // silence the polling loop, let any in-flight tick finish, then
            // clear the cache: the readings have gone missing
            let sensors = ecosystem.get_subroutine(SubroutineKind::Sensors).unwrap();
            sensors.core().cancel_routine_loop();
            tokio::time::sleep(Duration::from_millis(50)).await;
            ecosystem.set_sensors_data(None);
            let climate = ecosystem.get_subroutine(SubroutineKind::Climate).unwrap();
            for _ in 0..5 {
                climate.routine().await.unwrap();
            }
            assert!(!climate.is_started());
            // the other subroutines keep running
            assert!(ecosystem.subroutine_is_started(SubroutineKind::Sensors));
        })
        .await;
}

#[tokio::test]
async fn climate_regulates_only_measured_parameters() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine_with_test_config(dir.path()).await;
            engine.refresh_ecosystems().await.unwrap();
            let ecosystem = engine.get_ecosystem("testEco1").unwrap();
            let config = ecosystem.config();
            // a humidity target exists, but no humidifier hardware: only
            // temperature is regulated
            config.set_climate_parameter(
                ClimateParameter::Humidity,
                ClimateConfig {
                    day: 60.0,
                    night: 55.0,
                    hysteresis: 5.0,
                    alarm: None,
                },
            );
            ecosystem.refresh_subroutines().await.unwrap();
            let humidifier = ecosystem
                .actuator_hub()
                .get_handler(HardwareType::Humidifier)
                .unwrap();
            assert!(!humidifier.is_active());
            assert!(!humidifier.status());
        })
        .await;
}

#[tokio::test]
async fn pause_skips_reconciliation() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine_with_test_config(dir.path()).await;
            engine.refresh_ecosystems().await.unwrap();
            assert!(!engine.is_paused());
            // not started through `start()`: pause is refused
            engine.pause();
            assert!(!engine.is_paused());
        })
        .await;
}

#[tokio::test]
async fn turn_actuator_with_unknown_type_is_logged_not_raised() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine_with_test_config(dir.path()).await;
            engine.refresh_ecosystems().await.unwrap();
            let ecosystem = engine.get_ecosystem("testEco1").unwrap();
            // sensors are not actuators; this must not panic nor raise
            ecosystem
                .turn_actuator(HardwareType::Sensor, ActuatorTurnTo::On, None)
                .await;
        })
        .await;
}
