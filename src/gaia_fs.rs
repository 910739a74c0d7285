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

//! File utilities for Gaia.
//!
//! The engine runs everything on a single-threaded cooperative scheduler.
//! The standard Tokio file utilities use a pool of blocking threads under the
//! hood; that pool is deliberately kept very small here, as the engine only
//! touches a handful of small files (config, caches) besides sensor buses.

use anyhow::Result;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::task::LocalSet;

/// Initialize and run the Tokio runtime.
///
/// Everything is spawned onto a `LocalSet`, so tasks may hold `Rc`/`RefCell`
/// state across await points. Callers must not assume more than one CPU of
/// parallelism.
pub fn runtime<F: Future>(future: F) -> F::Output {
    let rt = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        // These intervals prioritize local tasks over IO polling. A bit more
        // efficient for our use case.
        .event_interval(121)
        .global_queue_interval(61)
        // By default, this pool can grow large and fluctuate. We want efficiency over speed.
        .max_blocking_threads(2)
        .thread_keep_alive(Duration::from_secs(5))
        .thread_name("gaia-wrk")
        .build();
    rt.unwrap().block_on(LocalSet::new().run_until(future))
}

#[allow(dead_code)]
pub fn test_runtime<F: Future>(future: F) -> F::Output {
    let rt = Builder::new_current_thread().enable_all().build();
    rt.unwrap().block_on(LocalSet::new().run_until(future))
}

/// Reads the entire contents of a text file into a UTF-8 encoded string.
pub async fn read_txt(path: impl AsRef<Path>) -> Result<String> {
    Ok(tokio::fs::read_to_string(path).await?)
}

/// Writes the given string `txt` to a file at the given `path`.
pub async fn write_string(path: impl AsRef<Path>, txt: String) -> Result<()> {
    write(path, txt.into_bytes()).await
}

/// Writes the given `data` to a file at the given `path`.
pub async fn write(path: impl AsRef<Path>, data: Vec<u8>) -> Result<()> {
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// Recursively creates a directory and all of its parent components if they
/// are missing.
///
/// This is a wrapper for `std::fs::create_dir_all`.
pub fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    Ok(std::fs::create_dir_all(path)?)
}
