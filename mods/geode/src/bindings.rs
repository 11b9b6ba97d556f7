//! Sideband symbol-table management.
//!
//! Two plain-text address tables are cached under the config directory: one
//! for the main game executable and one for the framework DLL. The main
//! table is refreshed at startup when older than four hours; the framework
//! table is fetched once and kept. The crash handler itself only ever reads
//! the cached files.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crashlogs_core::SymbolTable;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::{HostError, Result};

/// Where the tables are published.
pub const BASE_URL: &str = "https://prevter.github.io/bindings-meta";

/// Main-module table refresh interval.
pub const REFRESH_INTERVAL_SECS: i64 = 4 * 60 * 60;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// File name of the framework DLL's table.
pub fn framework_table_name(game_version: &str) -> String {
    format!("libcocos2d-{game_version}.txt")
}

/// File name of the main module's table for the compile-time target.
pub fn main_table_name(game_version: &str) -> String {
    if cfg!(target_pointer_width = "64") {
        format!("Windows-{game_version}-x64.txt")
    } else {
        format!("Windows-{game_version}.txt")
    }
}

/// Download URL for a table file.
pub fn download_url(file_name: &str) -> String {
    format!("{BASE_URL}/{file_name}")
}

/// True when the main table should be re-fetched.
pub fn is_stale(last_update: i64, now: i64) -> bool {
    last_update == 0 || now - last_update >= REFRESH_INTERVAL_SECS
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Downloads one table into `config_dir`, replacing the cached copy.
pub fn fetch_to(file_name: &str, config_dir: &Path) -> Result<PathBuf> {
    let url = download_url(file_name);
    debug!("fetching symbol table from {url}");

    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| HostError::Download(e.to_string()))?;
    let response = client
        .get(&url)
        .send()
        .map_err(|e| HostError::Download(e.to_string()))?;
    if !response.status().is_success() {
        return Err(HostError::Download(format!(
            "{url} returned {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .map_err(|e| HostError::Download(e.to_string()))?;

    std::fs::create_dir_all(config_dir)?;
    let path = config_dir.join(file_name);
    std::fs::write(&path, body)?;
    info!("cached symbol table at {}", path.display());
    Ok(path)
}

/// Startup synchronization: refresh the main table when stale, fetch the
/// framework table when absent. Network failures leave the cached files in
/// place and are only logged.
pub fn sync_tables(config_dir: &Path, game_version: &str, config: &mut Config) {
    let main_name = main_table_name(game_version);
    if is_stale(config.last_bindings_update, unix_now())
        || !config_dir.join(&main_name).exists()
    {
        match fetch_to(&main_name, config_dir) {
            Ok(_) => {
                config.last_bindings_update = unix_now();
                if let Err(err) = config.save(config_dir) {
                    warn!("failed to persist bindings timestamp: {err}");
                }
            }
            Err(err) => warn!("main symbol table refresh failed: {err}"),
        }
    }

    let framework_name = framework_table_name(game_version);
    if !config_dir.join(&framework_name).exists() {
        if let Err(err) = fetch_to(&framework_name, config_dir) {
            warn!("framework symbol table fetch failed: {err}");
        }
    }
}

/// Loads the cached tables: `(main module, framework DLL)`.
///
/// A missing or malformed file simply yields `None` for that slot; the
/// resolver falls through to its prologue-scan fallback.
pub fn load_tables(
    config_dir: &Path,
    game_version: &str,
) -> (Option<SymbolTable>, Option<SymbolTable>) {
    let load = |name: String| {
        let path = config_dir.join(name);
        match SymbolTable::load(&path) {
            Ok(table) if !table.is_empty() => Some(table),
            Ok(_) => None,
            Err(err) => {
                debug!("no usable table at {}: {err}", path.display());
                None
            }
        }
    };
    (
        load(main_table_name(game_version)),
        load(framework_table_name(game_version)),
    )
}
