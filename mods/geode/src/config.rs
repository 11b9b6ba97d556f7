//! Persisted analyzer config.
//!
//! A flat `key=value` file at `<config>/config.ini`. Unknown keys and
//! malformed lines are skipped on load so an old or hand-edited file never
//! blocks startup; `save` always writes the full current set.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{HostError, Result};

const CONFIG_FILE: &str = "config.ini";

/// The analyzer's persisted settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Last window geometry.
    pub window_x: i32,
    pub window_y: i32,
    pub window_w: i32,
    pub window_h: i32,
    /// Restore maximized state.
    pub window_maximized: bool,
    /// Font-size multiplier.
    pub ui_scale: f32,
    /// Unix seconds of the last symbol-table fetch.
    pub last_bindings_update: i64,
    // Per-panel visibility.
    pub show_info: bool,
    pub show_meta: bool,
    pub show_registers: bool,
    pub show_mods: bool,
    pub show_stack: bool,
    pub show_stacktrace: bool,
    pub show_disassembly: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_x: 50,
            window_y: 50,
            window_w: 1280,
            window_h: 720,
            window_maximized: false,
            ui_scale: 1.0,
            last_bindings_update: 0,
            show_info: true,
            show_meta: true,
            show_registers: true,
            show_mods: true,
            show_stack: true,
            show_stacktrace: true,
            show_disassembly: true,
        }
    }
}

impl Config {
    /// Path of the config file inside `config_dir`.
    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILE)
    }

    /// Loads the config from `config_dir`, falling back to defaults for a
    /// missing file or unreadable entries.
    pub fn load(config_dir: &Path) -> Self {
        let mut config = Self::default();
        let Ok(contents) = fs::read_to_string(Self::path(config_dir)) else {
            debug!("no config file, using defaults");
            return config;
        };

        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "window_x" => parse_into(&mut config.window_x, value),
                "window_y" => parse_into(&mut config.window_y, value),
                "window_w" => parse_into(&mut config.window_w, value),
                "window_h" => parse_into(&mut config.window_h, value),
                "window_maximized" => config.window_maximized = value == "true",
                "ui_scale" => parse_into(&mut config.ui_scale, value),
                "last_bindings_update" => parse_into(&mut config.last_bindings_update, value),
                "show_info" => config.show_info = value == "true",
                "show_meta" => config.show_meta = value == "true",
                "show_registers" => config.show_registers = value == "true",
                "show_mods" => config.show_mods = value == "true",
                "show_stack" => config.show_stack = value == "true",
                "show_stacktrace" => config.show_stacktrace = value == "true",
                "show_disassembly" => config.show_disassembly = value == "true",
                _ => {}
            }
        }
        config
    }

    /// Writes the config to `config_dir`, creating it if needed.
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        fs::create_dir_all(config_dir)
            .map_err(|e| HostError::Config(format!("create {}: {e}", config_dir.display())))?;
        let contents = format!(
            "window_x={}\n\
             window_y={}\n\
             window_w={}\n\
             window_h={}\n\
             window_maximized={}\n\
             ui_scale={}\n\
             last_bindings_update={}\n\
             show_info={}\n\
             show_meta={}\n\
             show_registers={}\n\
             show_mods={}\n\
             show_stack={}\n\
             show_stacktrace={}\n\
             show_disassembly={}\n",
            self.window_x,
            self.window_y,
            self.window_w,
            self.window_h,
            self.window_maximized,
            self.ui_scale,
            self.last_bindings_update,
            self.show_info,
            self.show_meta,
            self.show_registers,
            self.show_mods,
            self.show_stack,
            self.show_stacktrace,
            self.show_disassembly,
        );
        fs::write(Self::path(config_dir), contents)
            .map_err(|e| HostError::Config(format!("write config: {e}")))?;
        Ok(())
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.window_w, 1280);
        assert_eq!(config.window_h, 720);
        assert!(!config.window_maximized);
        assert_eq!(config.ui_scale, 1.0);
        assert_eq!(config.last_bindings_update, 0);
        assert!(config.show_disassembly);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        assert_eq!(Config::load(dir.path()), Config::default());
    }

    #[test]
    fn round_trip() {
        let dir = tempdir().unwrap();
        let config = Config {
            window_x: 10,
            window_y: 20,
            window_w: 800,
            window_h: 600,
            window_maximized: true,
            ui_scale: 1.5,
            last_bindings_update: 1700000000,
            show_mods: false,
            ..Config::default()
        };
        config.save(dir.path()).unwrap();
        assert_eq!(Config::load(dir.path()), config);
    }

    #[test]
    fn malformed_lines_and_unknown_keys_are_skipped() {
        let dir = tempdir().unwrap();
        fs::write(
            Config::path(dir.path()),
            "garbage\nwindow_w=abc\nui_scale=2.0\nfuture_key=1\n",
        )
        .unwrap();
        let config = Config::load(dir.path());
        assert_eq!(config.window_w, 1280);
        assert_eq!(config.ui_scale, 2.0);
    }
}
