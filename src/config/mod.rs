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

pub mod ecosystem;
pub mod hardware;
pub mod sun_times;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::app_config::AppConfig;
use crate::config::ecosystem::{
    ChaosMemory, EcosystemConfig, EcosystemConfigData, EcosystemUid, LightingMethod,
    NycthemeralSpanMethod, ECOSYSTEM_UID_LENGTH, HARDWARE_UID_LENGTH,
};
use crate::config::hardware::I2C_DEFAULT;
use crate::config::sun_times::{SunTimes, SunTimesCache};
use crate::errors::GaiaError;
use crate::utils::{content_digest, generate_uid, is_valid_uid};
use crate::gaia_fs;

pub const HOME_PLACE: &str = "home";

const ECOSYSTEMS_CONFIG_FILE: &str = "ecosystems.cfg";
const PRIVATE_CONFIG_FILE: &str = "private.cfg";
const SUN_TIMES_CACHE_FILE: &str = "sun_times.json";
const CHAOS_CACHE_FILE: &str = "chaos.json";

const DEFAULT_PRIVATE_CONFIG: &[u8] = include_bytes!("../../resources/private-default.cfg");
const DEFAULT_ECOSYSTEM_NAME: &str = "Default Ecosystem";

/// A named (latitude, longitude) reference for sun time lookups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// The content of `private.cfg`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivateConfigData {
    pub places: BTreeMap<String, Coordinates>,
    pub units: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConfigType {
    Ecosystems,
    Private,
}

type EcosystemsRoot = BTreeMap<EcosystemUid, EcosystemConfigData>;

/// The process-wide configuration root: both config files, the sun times
/// and chaos caches, and the watcher that picks up live file edits.
///
/// Mutations are serialized by `files_lock`; cached derived values live on
/// the per-ecosystem views and are invalidated by the engine loop.
pub struct EngineConfig {
    app_config: Rc<AppConfig>,
    weak_self: Weak<EngineConfig>,
    ecosystems: RefCell<BTreeMap<EcosystemUid, Rc<EcosystemConfig>>>,
    private: RefCell<PrivateConfigData>,
    sun_times: RefCell<HashMap<String, SunTimesCache>>,
    chaos_memory: RefCell<HashMap<EcosystemUid, ChaosMemory>>,
    digests: RefCell<HashMap<ConfigType, String>>,
    files_lock: Mutex<()>,
    new_config: Notify,
    watcher_token: RefCell<Option<CancellationToken>>,
}

impl EngineConfig {
    pub fn new(app_config: Rc<AppConfig>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            app_config,
            weak_self: weak_self.clone(),
            ecosystems: RefCell::new(BTreeMap::new()),
            private: RefCell::new(PrivateConfigData::default()),
            sun_times: RefCell::new(HashMap::new()),
            chaos_memory: RefCell::new(HashMap::new()),
            digests: RefCell::new(HashMap::new()),
            files_lock: Mutex::new(()),
            new_config: Notify::new(),
            watcher_token: RefCell::new(None),
        })
    }

    pub fn app_config(&self) -> &Rc<AppConfig> {
        &self.app_config
    }

    pub fn get_file_path(&self, config_type: ConfigType) -> PathBuf {
        let file_name = match config_type {
            ConfigType::Ecosystems => ECOSYSTEMS_CONFIG_FILE,
            ConfigType::Private => PRIVATE_CONFIG_FILE,
        };
        self.app_config.base_dir.join(file_name)
    }

    fn sun_times_cache_path(&self) -> PathBuf {
        self.app_config.cache_dir.join(SUN_TIMES_CACHE_FILE)
    }

    fn chaos_cache_path(&self) -> PathBuf {
        self.app_config.cache_dir.join(CHAOS_CACHE_FILE)
    }

    /// The condition signalled whenever a config file changed on disk, or the
    /// engine lifecycle requires a reconciliation round.
    pub fn new_config(&self) -> &Notify {
        &self.new_config
    }

    pub fn signal_new_config(&self) {
        self.new_config.notify_one();
    }

    // ---------------------------------------------------------------------
    //  Loading & saving
    // ---------------------------------------------------------------------

    /// Loads both config files into memory, creating missing ones from the
    /// defaults, and loads the sun times and chaos caches.
    pub async fn initialize_configs(&self) -> Result<()> {
        gaia_fs::create_dir_all(&self.app_config.base_dir)?;
        gaia_fs::create_dir_all(&self.app_config.cache_dir)?;
        gaia_fs::create_dir_all(&self.app_config.log_dir)?;
        self.generate_missing_config_files(true, true).await?;

        let ecosystems_raw = gaia_fs::read_txt(self.get_file_path(ConfigType::Ecosystems))
            .await
            .with_context(|| "Reading ecosystems configuration file")?;
        let root: EcosystemsRoot = toml::from_str(&ecosystems_raw)
            .map_err(|err| GaiaError::config(format!("Parsing ecosystems.cfg: {err}")))?;
        validate_ecosystems_root(&root, None)?;
        self.digests
            .borrow_mut()
            .insert(ConfigType::Ecosystems, content_digest(&ecosystems_raw));
        self.apply_ecosystems_root(root);

        let private_raw = gaia_fs::read_txt(self.get_file_path(ConfigType::Private))
            .await
            .with_context(|| "Reading private configuration file")?;
        let private: PrivateConfigData = toml::from_str(&private_raw)
            .map_err(|err| GaiaError::config(format!("Parsing private.cfg: {err}")))?;
        self.digests
            .borrow_mut()
            .insert(ConfigType::Private, content_digest(&private_raw));
        *self.private.borrow_mut() = private;

        self.load_caches().await;
        info!("Configuration files check successful");
        Ok(())
    }

    /// Creates any missing config file. Used at startup and by the
    /// `generate_default_configs` command.
    pub async fn generate_missing_config_files(
        &self,
        ecosystems: bool,
        private: bool,
    ) -> Result<()> {
        if ecosystems {
            let path = self.get_file_path(ConfigType::Ecosystems);
            if !path.exists() {
                info!("Ecosystems config file not found. Creating a default one.");
                let mut root = EcosystemsRoot::new();
                root.insert(
                    generate_uid(ECOSYSTEM_UID_LENGTH),
                    EcosystemConfigData {
                        name: DEFAULT_ECOSYSTEM_NAME.to_string(),
                        ..Default::default()
                    },
                );
                gaia_fs::write_string(&path, toml::to_string(&root)?)
                    .await
                    .with_context(|| format!("Writing default config file: {path:?}"))?;
            }
        }
        if private {
            let path = self.get_file_path(ConfigType::Private);
            if !path.exists() {
                info!("Private config file not found. Creating a default one.");
                gaia_fs::write(&path, DEFAULT_PRIVATE_CONFIG.to_vec())
                    .await
                    .with_context(|| format!("Writing default config file: {path:?}"))?;
            }
        }
        Ok(())
    }

    /// Serializes the in-memory state of one config file back to disk.
    pub async fn save(&self, config_type: ConfigType) -> Result<()> {
        let _guard = self.files_lock.lock().await;
        let content = match config_type {
            ConfigType::Ecosystems => toml::to_string(&self.dump_ecosystems_root())?,
            ConfigType::Private => toml::to_string(&*self.private.borrow())?,
        };
        if content.trim().is_empty() && config_type == ConfigType::Ecosystems {
            error!("Ecosystems config is empty. Something has gone wrong, saving aborted.");
            return Err(GaiaError::config("Ecosystems config is empty").into());
        }
        // update the digest first so the watcher ignores our own write
        self.digests
            .borrow_mut()
            .insert(config_type, content_digest(&content));
        let path = self.get_file_path(config_type);
        gaia_fs::write_string(&path, content)
            .await
            .with_context(|| format!("Saving configuration file: {path:?}"))
    }

    fn dump_ecosystems_root(&self) -> EcosystemsRoot {
        self.ecosystems
            .borrow()
            .iter()
            .map(|(uid, config)| (uid.clone(), config.data()))
            .collect()
    }

    /// Syncs the per-ecosystem views with a freshly parsed root: existing
    /// entries keep their identity (their data is swapped and the derived
    /// caches reset), new entries are created, removed entries dropped.
    fn apply_ecosystems_root(&self, root: EcosystemsRoot) {
        let mut ecosystems = self.ecosystems.borrow_mut();
        ecosystems.retain(|uid, _| root.contains_key(uid));
        for (uid, mut data) in root {
            // the IO mapping key is authoritative for the hardware uid
            for (hardware_uid, hardware) in &mut data.io {
                hardware.uid = hardware_uid.clone();
            }
            let existing = ecosystems.get(&uid).cloned();
            match existing {
                Some(existing) => existing.replace_data(data),
                None => {
                    let config = EcosystemConfig::new(uid.clone(), self.weak_self.clone(), data);
                    ecosystems.insert(uid.clone(), config);
                }
            }
            self.chaos_memory.borrow_mut().entry(uid).or_default();
        }
    }

    async fn load_caches(&self) {
        if let Ok(raw) = gaia_fs::read_txt(self.sun_times_cache_path()).await {
            match serde_json::from_str::<HashMap<String, SunTimesCache>>(&raw) {
                Ok(cache) => *self.sun_times.borrow_mut() = cache,
                Err(err) => warn!("Discarding unreadable sun times cache: {err}"),
            }
        }
        if let Ok(raw) = gaia_fs::read_txt(self.chaos_cache_path()).await {
            match serde_json::from_str::<HashMap<EcosystemUid, ChaosMemory>>(&raw) {
                Ok(cache) => {
                    let mut chaos_memory = self.chaos_memory.borrow_mut();
                    for (uid, memory) in cache {
                        chaos_memory.insert(uid, memory);
                    }
                }
                Err(err) => warn!("Discarding unreadable chaos cache: {err}"),
            }
        }
    }

    // ---------------------------------------------------------------------
    //  File watcher
    // ---------------------------------------------------------------------

    /// Polls both config files, compares content digests and reloads the
    /// affected file on change, then signals `new_config`.
    ///
    /// Bursts of writes within one poll period coalesce into a single
    /// notification round.
    pub fn start_watchdog(&self) {
        if self.watcher_token.borrow().is_some() {
            warn!("Config watchdog is already running");
            return;
        }
        let Some(config) = self.weak_self.upgrade() else {
            return;
        };
        let token = CancellationToken::new();
        self.watcher_token.borrow_mut().replace(token.clone());
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(config.app_config.config_watcher_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!("Starting the config files watchdog");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        match config.reload_changed_files().await {
                            Ok(changed) if !changed.is_empty() => {
                                info!("Config file(s) changed on disk, signalling the engine");
                                config.signal_new_config();
                            }
                            Ok(_) => {}
                            Err(err) => error!("Error in the config watchdog: {err}"),
                        }
                    }
                }
            }
            debug!("Config files watchdog stopped");
        });
    }

    pub fn stop_watchdog(&self) {
        if let Some(token) = self.watcher_token.borrow_mut().take() {
            token.cancel();
        }
    }

    /// Reloads every config file whose on-disk digest differs from the one
    /// loaded. A file that no longer parses is logged and the previous
    /// config retained.
    pub async fn reload_changed_files(&self) -> Result<HashSet<ConfigType>> {
        let _guard = self.files_lock.lock().await;
        let mut changed = HashSet::new();
        for config_type in [ConfigType::Ecosystems, ConfigType::Private] {
            let path = self.get_file_path(config_type);
            let Ok(raw) = gaia_fs::read_txt(&path).await else {
                continue;
            };
            let digest = content_digest(&raw);
            if self.digests.borrow().get(&config_type) == Some(&digest) {
                continue;
            }
            // remember the digest even on failure so a broken edit is logged once
            self.digests.borrow_mut().insert(config_type, digest);
            match config_type {
                ConfigType::Ecosystems => match toml::from_str::<EcosystemsRoot>(&raw) {
                    Ok(root) => {
                        if let Err(err) = validate_ecosystems_root(&root, None) {
                            warn!("Retaining previous ecosystems config: {err}");
                            continue;
                        }
                        self.apply_ecosystems_root(root);
                        changed.insert(config_type);
                    }
                    Err(err) => {
                        warn!("Could not reload '{}': {err}. Retaining previous config.", path.display());
                    }
                },
                ConfigType::Private => match toml::from_str::<PrivateConfigData>(&raw) {
                    Ok(private) => {
                        *self.private.borrow_mut() = private;
                        changed.insert(config_type);
                    }
                    Err(err) => {
                        warn!("Could not reload '{}': {err}. Retaining previous config.", path.display());
                    }
                },
            }
        }
        Ok(changed)
    }

    // ---------------------------------------------------------------------
    //  Ecosystems
    // ---------------------------------------------------------------------

    pub fn ecosystems_uids(&self) -> Vec<EcosystemUid> {
        self.ecosystems.borrow().keys().cloned().collect()
    }

    pub fn ecosystems_configs(&self) -> Vec<Rc<EcosystemConfig>> {
        self.ecosystems.borrow().values().cloned().collect()
    }

    pub fn get_ecosystems_expected_to_run(&self) -> HashSet<EcosystemUid> {
        self.ecosystems
            .borrow()
            .iter()
            .filter(|(_, config)| config.status())
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    /// Looks an ecosystem config up by uid or by name.
    pub fn get_ecosystem_config(&self, id: &str) -> Result<Rc<EcosystemConfig>> {
        let ecosystems = self.ecosystems.borrow();
        if let Some(config) = ecosystems.get(id) {
            return Ok(Rc::clone(config));
        }
        ecosystems
            .values()
            .find(|config| config.name() == id)
            .cloned()
            .ok_or_else(|| {
                GaiaError::EcosystemNotFound {
                    id: id.to_string(),
                }
                .into()
            })
    }

    /// Creates a new ecosystem with a fresh 8-char base62 uid. The caller is
    /// responsible for saving afterwards.
    pub fn create_ecosystem(&self, name: &str) -> Rc<EcosystemConfig> {
        let uid = loop {
            let candidate = generate_uid(ECOSYSTEM_UID_LENGTH);
            if !self.ecosystems.borrow().contains_key(&candidate) {
                break candidate;
            }
        };
        info!("Creating a new ecosystem '{name}' with uid '{uid}'");
        let config = EcosystemConfig::new(
            uid.clone(),
            self.weak_self.clone(),
            EcosystemConfigData {
                name: name.to_string(),
                ..Default::default()
            },
        );
        self.ecosystems
            .borrow_mut()
            .insert(uid.clone(), Rc::clone(&config));
        self.chaos_memory.borrow_mut().entry(uid).or_default();
        config
    }

    pub fn delete_ecosystem(&self, uid: &str) -> Result<()> {
        let removed = self.ecosystems.borrow_mut().remove(uid);
        if removed.is_none() {
            return Err(GaiaError::EcosystemNotFound {
                id: uid.to_string(),
            }
            .into());
        }
        self.chaos_memory.borrow_mut().remove(uid);
        Ok(())
    }

    // ---------------------------------------------------------------------
    //  Places & units
    // ---------------------------------------------------------------------

    pub fn places(&self) -> BTreeMap<String, Coordinates> {
        self.private.borrow().places.clone()
    }

    pub fn get_place(&self, place: &str) -> Option<Coordinates> {
        self.private.borrow().places.get(place).copied()
    }

    pub fn set_place(&self, place: &str, coordinates: Coordinates) {
        self.private
            .borrow_mut()
            .places
            .insert(place.to_string(), coordinates);
    }

    pub fn update_place(&self, place: &str, coordinates: Coordinates) -> Result<()> {
        let mut private = self.private.borrow_mut();
        match private.places.get_mut(place) {
            Some(entry) => {
                *entry = coordinates;
                Ok(())
            }
            None => Err(GaiaError::undefined(format!("No place named '{place}'")).into()),
        }
    }

    pub fn delete_place(&self, place: &str) -> Result<()> {
        self.private
            .borrow_mut()
            .places
            .remove(place)
            .map(|_| ())
            .ok_or_else(|| GaiaError::undefined(format!("No place named '{place}'")).into())
    }

    pub fn home_coordinates(&self) -> Option<Coordinates> {
        self.get_place(HOME_PLACE)
    }

    pub fn units(&self) -> BTreeMap<String, String> {
        self.private.borrow().units.clone()
    }

    // ---------------------------------------------------------------------
    //  Sun times
    // ---------------------------------------------------------------------

    /// The cached sun times for a place, regardless of staleness. The daily
    /// refresh task keeps the cache current; a stale value beats none for
    /// the lighting computation.
    pub fn cached_sun_times(&self, place: &str) -> Option<SunTimes> {
        self.sun_times
            .borrow()
            .get(place)
            .map(|cache| cache.data)
    }

    /// Downloads the sun times of a place if the cache is older than today.
    /// Returns `None` when the place has no coordinates or the download
    /// failed and no cache exists.
    pub async fn get_sun_times(&self, place: &str) -> Option<SunTimes> {
        let today = Local::now().date_naive();
        let cached = self.sun_times.borrow().get(place).cloned();
        if let Some(cache) = &cached {
            if cache.last_update >= today {
                return Some(cache.data);
            }
        }
        let Some(coordinates) = self.get_place(place) else {
            return cached.map(|cache| cache.data);
        };
        match sun_times::fetch_sun_times(coordinates.latitude, coordinates.longitude).await {
            Ok(mut fetched) => {
                fetched.substitute_polar(coordinates.latitude, today, place);
                self.sun_times.borrow_mut().insert(
                    place.to_string(),
                    SunTimesCache {
                        last_update: today,
                        data: fetched,
                    },
                );
                if let Err(err) = self.save_sun_times_cache().await {
                    warn!("Could not persist the sun times cache: {err}");
                }
                Some(fetched)
            }
            Err(err) => {
                warn!("Failed to download sun times for '{place}': {err}");
                cached.map(|cache| cache.data)
            }
        }
    }

    /// Refreshes the sun times of every place referenced by any ecosystem.
    /// Returns the set of places that could not be refreshed.
    pub async fn refresh_sun_times(&self) -> HashSet<String> {
        info!("Refreshing sun times");
        let mut failed = HashSet::new();
        for place in self.referenced_places() {
            if self.get_sun_times(&place).await.is_none() {
                failed.insert(place);
            }
        }
        if !failed.is_empty() {
            warn!(
                "Failed to refresh the sun times of: {}. Some functionalities \
                 might not work as expected.",
                failed.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        failed
    }

    /// The places any ecosystem's nycthemeral configuration points at:
    /// `mimic` targets, plus `home` for every `elongate` ecosystem.
    pub fn referenced_places(&self) -> HashSet<String> {
        let mut places = HashSet::new();
        for config in self.ecosystems.borrow().values() {
            let cycle = config.nycthemeral_cycle();
            if cycle.span == NycthemeralSpanMethod::Mimic {
                if let Some(target) = cycle.target {
                    places.insert(target);
                }
            }
            if cycle.lighting == LightingMethod::Elongate {
                places.insert(HOME_PLACE.to_string());
            }
        }
        places
    }

    async fn save_sun_times_cache(&self) -> Result<()> {
        let content = serde_json::to_string(&*self.sun_times.borrow())?;
        gaia_fs::write_string(self.sun_times_cache_path(), content).await
    }

    #[cfg(test)]
    pub fn set_cached_sun_times(
        &self,
        place: &str,
        data: SunTimes,
        last_update: chrono::NaiveDate,
    ) {
        self.sun_times.borrow_mut().insert(
            place.to_string(),
            SunTimesCache { last_update, data },
        );
    }

    // ---------------------------------------------------------------------
    //  Chaos memory
    // ---------------------------------------------------------------------

    pub fn get_chaos_memory(&self, uid: &str) -> ChaosMemory {
        self.chaos_memory
            .borrow_mut()
            .entry(uid.to_string())
            .or_default()
            .clone()
    }

    pub fn set_chaos_memory(&self, uid: &str, memory: ChaosMemory) {
        self.chaos_memory
            .borrow_mut()
            .insert(uid.to_string(), memory);
    }

    pub async fn save_chaos_memory(&self) -> Result<()> {
        let content = serde_json::to_string(&*self.chaos_memory.borrow())?;
        gaia_fs::write_string(self.chaos_cache_path(), content).await
    }
}

/// Config-level validation: well-formed uids and unique hardware addresses
/// across the whole config, `I2C_default` excepted. When `known_models` is
/// given, every hardware model must be registered.
pub fn validate_ecosystems_root(
    root: &EcosystemsRoot,
    known_models: Option<&HashSet<String>>,
) -> Result<()> {
    let mut seen_addresses: HashMap<&str, &str> = HashMap::new();
    for (uid, data) in root {
        if !is_valid_uid(uid, ECOSYSTEM_UID_LENGTH) {
            return Err(GaiaError::config(format!(
                "Invalid ecosystem uid '{uid}': expected {ECOSYSTEM_UID_LENGTH} base62 chars"
            ))
            .into());
        }
        for (hardware_uid, hardware) in &data.io {
            if !is_valid_uid(hardware_uid, HARDWARE_UID_LENGTH) {
                return Err(GaiaError::config(format!(
                    "Invalid hardware uid '{hardware_uid}' in ecosystem '{uid}'"
                ))
                .into());
            }
            hardware.parsed_address().map_err(|err| {
                GaiaError::config(format!(
                    "Hardware '{hardware_uid}' in ecosystem '{uid}': {err}"
                ))
            })?;
            if hardware.address != I2C_DEFAULT {
                if let Some(other) = seen_addresses.insert(&hardware.address, hardware_uid) {
                    return Err(GaiaError::config(format!(
                        "Address '{}' is used by both '{other}' and '{hardware_uid}'",
                        hardware.address
                    ))
                    .into());
                }
            }
            if let Some(models) = known_models {
                if !models.contains(&hardware.model) {
                    return Err(GaiaError::config(format!(
                        "Unknown hardware model '{}' for '{hardware_uid}'",
                        hardware.model
                    ))
                    .into());
                }
            }
        }
    }
    Ok(())
}

/// Pretty check of both config files for the `validate_configs` command.
pub async fn validate_config_files(
    app_config: &Rc<AppConfig>,
    known_models: &HashSet<String>,
) -> Result<()> {
    let config = EngineConfig::new(Rc::clone(app_config));
    let ecosystems_path = config.get_file_path(ConfigType::Ecosystems);
    let raw = gaia_fs::read_txt(&ecosystems_path)
        .await
        .with_context(|| format!("Reading {}", ecosystems_path.display()))?;
    let root: EcosystemsRoot =
        toml::from_str(&raw).with_context(|| format!("Parsing {}", ecosystems_path.display()))?;
    validate_ecosystems_root(&root, Some(known_models))?;

    let private_path = config.get_file_path(ConfigType::Private);
    let raw = gaia_fs::read_txt(&private_path)
        .await
        .with_context(|| format!("Reading {}", private_path.display()))?;
    let _: PrivateConfigData =
        toml::from_str(&raw).with_context(|| format!("Parsing {}", private_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ecosystem::{ChaosConfig, ClimateParameter, TimeWindow};
    use crate::config::hardware::{HardwareConfig, HardwareLevel, HardwareType};
    use chrono::{Duration, NaiveTime, TimeZone, Utc};

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
            config_watcher_period: std::time::Duration::from_millis(250),
            sensors_loop_period: std::time::Duration::from_secs(10),
            light_loop_period: std::time::Duration::from_millis(500),
            climate_loop_period: std::time::Duration::from_secs(10),
            sensors_logging_period: 10,
            health_logging_time: "00h00".to_string(),
        })
    }

    fn hardware(uid: &str, address: &str, h_type: HardwareType) -> HardwareConfig {
        HardwareConfig {
            uid: uid.to_string(),
            name: format!("{h_type} hardware"),
            address: address.to_string(),
            h_type,
            level: HardwareLevel::Environment,
            model: "virtualSwitch".to_string(),
            measures: Vec::new(),
            plants: Vec::new(),
            multiplexer_model: None,
        }
    }

    fn root_with(uid: &str, io: Vec<HardwareConfig>) -> EcosystemsRoot {
        let mut root = EcosystemsRoot::new();
        root.insert(
            uid.to_string(),
            EcosystemConfigData {
                name: "test".to_string(),
                status: true,
                io: io.into_iter().map(|h| (h.uid.clone(), h)).collect(),
                ..Default::default()
            },
        );
        root
    }

    #[test]
    fn validation_rejects_duplicate_addresses() {
        let root = root_with(
            "aaaaaaaa",
            vec![
                hardware("aaaaaaaaaaaaaaaa", "GPIO_17", HardwareType::Heater),
                hardware("bbbbbbbbbbbbbbbb", "GPIO_17", HardwareType::Cooler),
            ],
        );
        let err = validate_ecosystems_root(&root, None).unwrap_err();
        assert!(err.to_string().contains("GPIO_17"));
    }

    #[test]
    fn validation_allows_duplicate_i2c_default() {
        let root = root_with(
            "aaaaaaaa",
            vec![
                hardware("aaaaaaaaaaaaaaaa", I2C_DEFAULT, HardwareType::Sensor),
                hardware("bbbbbbbbbbbbbbbb", I2C_DEFAULT, HardwareType::Sensor),
            ],
        );
        assert!(validate_ecosystems_root(&root, None).is_ok());
    }

    #[test]
    fn validation_rejects_bad_uids_and_unknown_models() {
        let root = root_with("short", Vec::new());
        assert!(validate_ecosystems_root(&root, None).is_err());

        let root = root_with(
            "aaaaaaaa",
            vec![hardware("aaaaaaaaaaaaaaaa", "GPIO_4", HardwareType::Heater)],
        );
        let known: HashSet<String> = ["gpioSwitch".to_string()].into_iter().collect();
        assert!(validate_ecosystems_root(&root, Some(&known)).is_err());
    }

    #[tokio::test]
    async fn initialize_creates_default_files_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        assert!(config.get_file_path(ConfigType::Ecosystems).exists());
        assert!(config.get_file_path(ConfigType::Private).exists());
        assert_eq!(config.ecosystems_uids().len(), 1);

        // loading, dumping, and reloading yields an equivalent config
        let dumped = config.dump_ecosystems_root();
        config.save(ConfigType::Ecosystems).await.unwrap();
        let reloaded = EngineConfig::new(test_app_config(dir.path()));
        reloaded.initialize_configs().await.unwrap();
        assert_eq!(reloaded.dump_ecosystems_root(), dumped);
    }

    #[tokio::test]
    async fn reload_keeps_previous_config_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();

        let path = config.get_file_path(ConfigType::Ecosystems);
        gaia_fs::write_string(&path, "not valid toml [".to_string())
            .await
            .unwrap();
        let changed = config.reload_changed_files().await.unwrap();
        assert!(changed.is_empty());
        assert_eq!(config.ecosystems_uids(), vec![uid]);
    }

    #[tokio::test]
    async fn reload_preserves_ecosystem_config_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();
        let view = config.get_ecosystem_config(&uid).unwrap();

        let mut root = config.dump_ecosystems_root();
        root.get_mut(&uid).unwrap().name = "renamed".to_string();
        gaia_fs::write_string(
            config.get_file_path(ConfigType::Ecosystems),
            toml::to_string(&root).unwrap(),
        )
        .await
        .unwrap();
        let changed = config.reload_changed_files().await.unwrap();
        assert!(changed.contains(&ConfigType::Ecosystems));
        // same Rc, new data
        assert_eq!(view.name(), "renamed");
    }

    #[tokio::test]
    async fn chaos_roll_and_factor() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();
        let ecosystem = config.get_ecosystem_config(&uid).unwrap();
        ecosystem.set_chaos_config(ChaosConfig {
            frequency: 10,
            duration: 2,
            intensity: 1.5,
        });

        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        // a winning roll opens a window from today 14:00 UTC
        assert!(ecosystem.apply_chaos_roll(1, now).unwrap());
        let window = ecosystem.chaos_time_window();
        let beginning = window.beginning.unwrap();
        assert_eq!(beginning, Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap());
        assert_eq!(window.end.unwrap(), beginning + Duration::days(2));

        // factor 1.0 outside, exactly intensity at the midpoint
        assert_eq!(ecosystem.get_chaos_factor(now), 1.0);
        let midpoint = beginning + Duration::days(1);
        let factor = ecosystem.get_chaos_factor(midpoint);
        assert!((factor - 1.5).abs() < 1e-9);
        for offset_hours in [1, 10, 30, 47] {
            let factor = ecosystem.get_chaos_factor(beginning + Duration::hours(offset_hours));
            assert!((1.0..=1.5).contains(&factor));
        }

        // the same day does not roll twice
        assert!(!ecosystem.apply_chaos_roll(1, now).unwrap());
    }

    #[tokio::test]
    async fn chaos_window_cleared_after_elapsing() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();
        let ecosystem = config.get_ecosystem_config(&uid).unwrap();

        let beginning = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap();
        config.set_chaos_memory(
            &uid,
            ChaosMemory {
                time_window: TimeWindow {
                    beginning: Some(beginning),
                    end: Some(beginning + Duration::days(2)),
                },
                last_update: beginning.date_naive(),
            },
        );
        let later = beginning + Duration::days(5);
        assert!(ecosystem.apply_chaos_roll(0, later).unwrap());
        assert_eq!(ecosystem.chaos_time_window(), TimeWindow::default());
    }

    #[tokio::test]
    async fn lighting_hours_fixed_midpoint_and_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();
        let ecosystem = config.get_ecosystem_config(&uid).unwrap();

        let hours = ecosystem.lighting_hours();
        assert_eq!(hours.morning_start, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(hours.evening_end, NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(hours.evening_start, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(
            hours.morning_end,
            NaiveTime::from_hms_milli_opt(13, 59, 59, 999).unwrap()
        );
        assert!(hours.morning_start <= hours.morning_end);
        assert!(hours.morning_end <= hours.evening_start);
        assert!(hours.evening_start <= hours.evening_end);
    }

    #[tokio::test]
    async fn elongate_downgrades_without_sun_times() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();
        let ecosystem = config.get_ecosystem_config(&uid).unwrap();
        let mut data = ecosystem.data();
        data.environment.nycthemeral_cycle.lighting = LightingMethod::Elongate;
        ecosystem.replace_data(data);

        // no sun times cached for home -> fixed
        assert_eq!(ecosystem.lighting_method(), LightingMethod::Fixed);
        // the configured value is untouched
        assert_eq!(
            ecosystem.nycthemeral_cycle().lighting,
            LightingMethod::Elongate
        );
    }

    #[tokio::test]
    async fn elongate_uses_twilight_offset() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();
        let ecosystem = config.get_ecosystem_config(&uid).unwrap();
        let mut data = ecosystem.data();
        data.environment.nycthemeral_cycle.lighting = LightingMethod::Elongate;
        data.environment.nycthemeral_cycle.day = NaiveTime::from_hms_opt(5, 0, 0).unwrap();
        data.environment.nycthemeral_cycle.night = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        ecosystem.replace_data(data);

        config.set_cached_sun_times(
            HOME_PLACE,
            SunTimes {
                twilight_begin: NaiveTime::from_hms_opt(5, 30, 0),
                sunrise: NaiveTime::from_hms_opt(6, 0, 0),
                sunset: NaiveTime::from_hms_opt(21, 0, 0),
                twilight_end: NaiveTime::from_hms_opt(21, 30, 0),
            },
            Local::now().date_naive(),
        );
        assert_eq!(ecosystem.lighting_method(), LightingMethod::Elongate);
        let hours = ecosystem.lighting_hours();
        // morning_end = sunrise + (sunrise - civil_dawn)
        assert_eq!(hours.morning_end, NaiveTime::from_hms_opt(6, 30, 0).unwrap());
        // evening_start = sunset - offset
        assert_eq!(hours.evening_start, NaiveTime::from_hms_opt(20, 30, 0).unwrap());
        assert!(hours.morning_start <= hours.morning_end);
        assert!(hours.morning_end <= hours.evening_start);
        assert!(hours.evening_start <= hours.evening_end);
    }

    #[tokio::test]
    async fn climate_parameter_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(test_app_config(dir.path()));
        config.initialize_configs().await.unwrap();
        let uid = config.ecosystems_uids().pop().unwrap();
        let ecosystem = config.get_ecosystem_config(&uid).unwrap();

        assert!(ecosystem
            .get_climate_parameter(ClimateParameter::Temperature)
            .is_err());
        ecosystem.set_climate_parameter(
            ClimateParameter::Temperature,
            crate::config::ecosystem::ClimateConfig {
                day: 25.0,
                night: 20.0,
                hysteresis: 1.0,
                alarm: None,
            },
        );
        let climate = ecosystem
            .get_climate_parameter(ClimateParameter::Temperature)
            .unwrap();
        assert_eq!(climate.day, 25.0);
    }
}
