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

use derive_more::{Display, Error};

/// The error kinds the engine distinguishes.
///
/// Propagation policy: subroutines swallow transient failures, surface
/// configuration failures, and re-raise cancellation. The engine always logs
/// and never crashes on a subroutine error.
#[derive(Debug, Clone, Display, Error)]
pub enum GaiaError {
    /// Malformed config file, duplicate hardware address, unknown model.
    /// Fatal at startup; during watcher reloads the old config is retained.
    #[display("Configuration error: {msg}")]
    ConfigError { msg: String },

    #[display("Hardware not found: {uid}")]
    HardwareNotFound { uid: String },

    #[display("Ecosystem not found: {id}")]
    EcosystemNotFound { id: String },

    /// An optional config sub-tree is missing; the caller decides whether to
    /// fall back or disable the feature.
    #[display("Undefined parameter: {msg}")]
    UndefinedParameter { msg: String },

    /// Not an error: the ecosystem has no subroutine to run and should
    /// gracefully stop.
    #[display("No subroutine needed, stopping ecosystem")]
    StoppingEcosystem,

    /// A sensor read failed after retries; a null reading is emitted and the
    /// loop continues.
    #[display("Transient hardware failure: {msg}")]
    TransientHardwareFailure { msg: String },

    /// The message broker is unreachable. Payloads are buffered if the
    /// database is enabled, dropped otherwise; never raised into the caller.
    #[display("Message broker disconnected")]
    BrokerDisconnected,
}

impl GaiaError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError { msg: msg.into() }
    }

    pub fn undefined(msg: impl Into<String>) -> Self {
        Self::UndefinedParameter { msg: msg.into() }
    }
}

/// `true` when the error chain signals a graceful ecosystem stop.
pub fn is_stopping_ecosystem(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref(), Some(GaiaError::StoppingEcosystem)))
}
