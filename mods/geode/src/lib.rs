//! Geode host integration for the crash analyzer.
//!
//! This crate is the glue between the host game process and
//! `crashlogs-core`: it installs the top-level exception filter, feeds the
//! analyzer with sideband symbol tables downloaded at startup, writes the
//! crash report (plus the `last-crashed` marker) to disk, and persists the
//! small key=value config the UI layer reads.

pub mod bindings;
pub mod config;
pub mod handler;
pub mod hwinfo;

use std::path::PathBuf;

use thiserror::Error;

/// Errors at the host-integration edges.
#[derive(Error, Debug)]
pub enum HostError {
    /// Failed to load or store the analyzer config.
    #[error("Config error: {0}")]
    Config(String),

    /// A sideband symbol-table download failed.
    #[error("Symbol table download failed: {0}")]
    Download(String),

    /// The exception filter could not be installed.
    #[error("Handler installation failed: {0}")]
    Install(String),

    /// An underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for host operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Everything the host hands us at startup.
///
/// The loader metadata and mod inventory are rendered by the host's plugin
/// framework; they are passed through into the report verbatim.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    /// Directory for crash report files.
    pub crashlogs_dir: PathBuf,
    /// Directory for config and cached symbol tables.
    pub config_dir: PathBuf,
    /// Host game version, e.g. "2.206". Selects the symbol-table files.
    pub game_version: String,
    /// Rendered loader metadata section.
    pub loader_metadata: String,
    /// Rendered installed-mod inventory section.
    pub mod_list: String,
}

impl HostEnv {
    /// Host environment rooted at the platform's data directory; used when
    /// the loader doesn't dictate paths.
    pub fn with_default_dirs(game_version: impl Into<String>) -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let root = base.join("crashlogs");
        Self {
            crashlogs_dir: root.join("crashlogs"),
            config_dir: root.join("config"),
            game_version: game_version.into(),
            loader_metadata: String::new(),
            mod_list: String::new(),
        }
    }
}

pub use handler::install;
