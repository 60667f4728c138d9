//! Configuration loading
//!
//! Optional TOML settings for the lowering driver. A file may put keys at the
//! top level or under a `[lowering]` section:
//!
//! ```toml
//! [lowering]
//! verbose = true
//! debug_export = "lowered.dot"
//! ```
//!
//! Configuration is looked up in `./tosa-lowering.toml`,
//! `./.tosa-lowering.toml`, then `~/.config/tosa-lowering/config.toml`; the
//! first file found wins. Every field is optional so a loaded file can be
//! overlaid on defaults or command-line choices with [`LoweringConfig::merge`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Driver settings, all optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoweringConfig {
    /// Log each rewrite at info level instead of debug
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,

    /// Write the lowered graph as Graphviz DOT to this path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_export: Option<PathBuf>,
}

/// Accepts both the sectioned and the top-level file layout
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    lowering: Option<LoweringConfig>,
    #[serde(flatten)]
    direct: LoweringConfig,
}

impl LoweringConfig {
    /// Read configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading configuration");
        let text =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        let root: RootConfig =
            toml::from_str(&text).map_err(|err| ConfigError::Parse(path.to_path_buf(), err))?;
        Ok(root.lowering.unwrap_or(root.direct))
    }

    /// Search the standard locations and load the first file found.
    ///
    /// A missing file is not an error; `None` means no configuration exists.
    pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
        for path in Self::standard_paths() {
            if path.exists() {
                return Self::load(&path).map(Some);
            }
        }
        Ok(None)
    }

    fn standard_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("tosa-lowering.toml"),
            PathBuf::from(".tosa-lowering.toml"),
        ];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("tosa-lowering").join("config.toml"));
        }
        paths
    }

    /// Write this configuration as TOML
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).map_err(|err| ConfigError::Io(path.to_path_buf(), err))
    }

    /// Overlay `other` on top of this configuration; set fields in `other`
    /// win
    pub fn merge(mut self, other: LoweringConfig) -> Self {
        if other.verbose.is_some() {
            self.verbose = other.verbose;
        }
        if other.debug_export.is_some() {
            self.debug_export = other.debug_export;
        }
        self
    }
}

/// Errors from reading or writing configuration files
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("i/o error at {0}: {1}")]
    Io(PathBuf, #[source] io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
