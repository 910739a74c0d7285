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

use std::str::FromStr;

use anyhow::Result;
use env_logger::Logger;
use log::{info, LevelFilter, Log, Metadata, Record, SetLoggerError};
use systemd_journal_logger::{connected_to_journal, JournalLog};

use crate::{Args, LOG_ENV, VERSION};

pub fn setup_logging(cmd_args: &Args) -> Result<()> {
    let version = VERSION.unwrap_or("unknown");
    let log_level = if cmd_args.debug {
        LevelFilter::Debug
    } else if let Ok(log_lvl) = std::env::var(LOG_ENV) {
        LevelFilter::from_str(&log_lvl).unwrap_or(LevelFilter::Info)
    } else {
        LevelFilter::Info
    };
    GaiaLogger::new(log_level, version)?.init()?;
    info!("Logging Level: {}", log::max_level());
    Ok(())
}

/// This is our own Logger, which handles appropriate logging dependant on the environment.
struct GaiaLogger {
    max_level: LevelFilter,
    log_filter: Logger,
    logger: Box<dyn Log>,
}

impl GaiaLogger {
    fn new(max_level: LevelFilter, version: &str) -> Result<Self> {
        // set library logging levels to one level above the application's to keep chatter down
        let lib_log_level = if max_level == LevelFilter::Trace {
            LevelFilter::Debug
        } else if max_level == LevelFilter::Debug {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        };
        let timestamp_precision = if max_level == LevelFilter::Debug {
            env_logger::fmt::TimestampPrecision::Millis
        } else {
            env_logger::fmt::TimestampPrecision::Seconds
        };
        let logger: Box<dyn Log> = if connected_to_journal() {
            Box::new(JournalLog::new()?.with_extra_fields(vec![("VERSION", version)]))
        } else {
            Box::new(
                env_logger::Builder::new()
                    .filter_level(max_level)
                    .format_timestamp(Some(timestamp_precision))
                    .build(),
            )
        };
        Ok(Self {
            max_level,
            log_filter: env_logger::Builder::from_env(LOG_ENV)
                .filter_level(max_level)
                .filter_module("reqwest", lib_log_level)
                .filter_module("hyper", lib_log_level)
                .filter_module("tracing", lib_log_level)
                .build(),
            logger,
        })
    }

    fn init(self) -> Result<(), SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }
}

impl Log for GaiaLogger {
    /// Whether this logger is enabled.
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.log_filter.enabled(metadata)
    }

    /// Logs the messages and filters them by matching against the `env_logger` filter
    fn log(&self, record: &Record) {
        if self.log_filter.matches(record) {
            self.logger.log(record);
        }
    }

    /// Flush log records.
    ///
    /// A no-op for this implementation.
    fn flush(&self) {}
}
