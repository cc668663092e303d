use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryModel;

fn default_gdb() -> String {
    "arm-none-eabi-gdb".to_owned()
}

fn default_remote() -> String {
    "localhost:2331".to_owned()
}

fn default_remote_mode() -> String {
    "extended-remote".to_owned()
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_run_timeout_ms() -> u64 {
    30000
}

fn default_max_nesting() -> usize {
    8
}

fn default_reset_command() -> String {
    "monitor reset".to_owned()
}

/// Everything needed to start a session, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_gdb")]
    pub gdb: String,
    /// Appended after the machine interface arguments.
    #[serde(default)]
    pub gdb_args: Vec<String>,

    #[serde(default = "default_remote")]
    pub remote: String,
    /// `remote` or `extended-remote`.
    #[serde(default = "default_remote_mode")]
    pub remote_mode: String,

    /// Firmware to download.
    #[serde(default)]
    pub image: Option<PathBuf>,
    /// File to read symbols from, defaults to `image`.
    #[serde(default)]
    pub symbols: Option<PathBuf>,

    #[serde(default)]
    pub memory_model: MemoryModel,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Used while the target executes a called function.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default = "default_max_nesting")]
    pub max_nesting: usize,

    #[serde(default = "default_reset_command")]
    pub reset_command: String,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            gdb: default_gdb(),
            gdb_args: vec![],
            remote: default_remote(),
            remote_mode: default_remote_mode(),
            image: None,
            symbols: None,
            memory_model: MemoryModel::default(),
            command_timeout_ms: default_command_timeout_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            max_nesting: default_max_nesting(),
            reset_command: default_reset_command(),
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> Result<SessionConfig> {
        let text = fs::read_to_string(path)?;
        SessionConfig::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<SessionConfig> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// The file symbols and types are read from.
    pub fn symbols_file(&self) -> Option<&Path> {
        self.symbols.as_deref().or_else(|| self.image.as_deref())
    }

    pub fn is_missing_config(&self) -> bool {
        self.image.is_none() || self.gdb.trim().is_empty()
    }

    pub fn missing_config(&self) -> String {
        if !self.is_missing_config() {
            return "No required configurations missing".to_owned();
        }

        let mut error = "Missing required configurations:".to_owned();
        if self.image.is_none() {
            error = format!("{}\n\t{}", error, "image");
        }
        if self.gdb.trim().is_empty() {
            error = format!("{}\n\t{}", error, "gdb");
        }

        error
    }

    /// Checks the settings a session cannot do without.
    pub fn validate(&self) -> Result<()> {
        if self.is_missing_config() {
            return Err(Error::Config(self.missing_config()));
        }
        if self.remote_mode != "remote" && self.remote_mode != "extended-remote" {
            return Err(Error::Config(format!(
                "unknown remote_mode `{}`",
                self.remote_mode
            )));
        }
        if self.max_nesting == 0 {
            return Err(Error::Config("max_nesting must be at least 1".to_owned()));
        }
        self.memory_model.validate()
    }
}
