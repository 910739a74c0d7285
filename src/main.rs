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

use std::rc::Rc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};

use crate::app_config::AppConfig;
use crate::config::EngineConfig;
use crate::engine::Engine;

mod actuators;
mod app_config;
mod config;
mod database;
mod ecosystem;
mod engine;
mod errors;
mod events;
mod gaia_fs;
mod hardware;
mod images;
mod logger;
mod subroutines;
#[cfg(test)]
mod tests;
mod utils;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");
const LOG_ENV: &str = "GAIA_LOG";

/// The greenhouse automation engine
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
pub struct Args {
    /// Enable debug output
    #[clap(long)]
    debug: bool,

    /// Get current version info
    #[clap(long, short)]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and type-check both config files; exits non-zero on error
    #[command(name = "validate_configs")]
    ValidateConfigs {
        /// Show the validated content
        #[arg(short, long)]
        verbose: bool,
    },

    /// Create the missing default config files
    #[command(name = "generate_default_configs")]
    GenerateDefaultConfigs {
        /// Skip the ecosystems config file
        #[arg(long)]
        no_ecosystem: bool,

        /// Skip the private config file
        #[arg(long)]
        no_private: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    gaia_fs::runtime(run(args))
}

async fn run(args: Args) -> Result<()> {
    logger::setup_logging(&args)?;
    if args.version {
        println!("gaia {}", VERSION.unwrap_or("unknown"));
        return Ok(());
    }
    let app_config = Rc::new(AppConfig::from_env()?);
    match args.command {
        Some(Command::ValidateConfigs { verbose }) => {
            validate_configs(&app_config, verbose).await
        }
        Some(Command::GenerateDefaultConfigs {
            no_ecosystem,
            no_private,
        }) => {
            let config = EngineConfig::new(app_config);
            gaia_fs::create_dir_all(&config.app_config().base_dir)?;
            config
                .generate_missing_config_files(!no_ecosystem, !no_private)
                .await
        }
        None => run_engine(app_config).await,
    }
}

async fn validate_configs(app_config: &Rc<AppConfig>, verbose: bool) -> Result<()> {
    let known_models = hardware::available_models();
    match config::validate_config_files(app_config, &known_models).await {
        Ok(()) => {
            info!("Configuration files check successful");
            if verbose {
                let config = EngineConfig::new(Rc::clone(app_config));
                config.initialize_configs().await?;
                for ecosystem in config.ecosystems_configs() {
                    println!("{}: {:#?}", ecosystem.uid(), ecosystem.data());
                }
                println!("places: {:#?}", config.places());
            }
            Ok(())
        }
        Err(err) => {
            error!("Configuration files check failed: {err}");
            std::process::exit(1);
        }
    }
}

async fn run_engine(app_config: Rc<AppConfig>) -> Result<()> {
    info!("Initializing Gaia ...");
    let config = EngineConfig::new(app_config);
    let engine = Engine::new(config);
    engine.init_plugins().await?;
    engine.start().await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigquit.recv() => info!("Received SIGQUIT"),
        () = engine.wait() => {}
    }
    engine.stop().await
}
