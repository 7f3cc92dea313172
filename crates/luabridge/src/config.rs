//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! libraries = ["table", "string", "math"]
//!
//! [worker]
//! enabled = true
//! queue_capacity = 64
//! submit_timeout_ms = 1000
//!
//! [log]
//! level = "info"
//! install = true
//! ```

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use mlua::StdLib;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Standard libraries opened unless configured otherwise. `debug` is never
/// opened; the base library always is.
pub const DEFAULT_LIBRARIES: &[&str] = &[
    "coroutine",
    "table",
    "io",
    "os",
    "string",
    "utf8",
    "math",
    "package",
];

fn library(name: &str) -> Option<StdLib> {
    Some(match name {
        "coroutine" => StdLib::COROUTINE,
        "table" => StdLib::TABLE,
        "io" => StdLib::IO,
        "os" => StdLib::OS,
        "string" => StdLib::STRING,
        "utf8" => StdLib::UTF8,
        "math" => StdLib::MATH,
        "package" => StdLib::PACKAGE,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Lua standard libraries to open.
    pub libraries: Vec<String>,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            libraries: DEFAULT_LIBRARIES.iter().map(|s| (*s).to_string()).collect(),
            worker: WorkerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Asynchronous task worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Start a worker thread with the engine.
    pub enabled: bool,
    /// Tasks that may wait in the queue before `submit` blocks.
    pub queue_capacity: usize,
    /// How long `submit` blocks on a full queue before giving up.
    pub submit_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 64,
            submit_timeout_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

impl BridgeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.enabled && self.worker.queue_capacity == 0 {
            return Err(Error::Config(
                "worker.queue_capacity must be at least 1".to_string(),
            ));
        }
        self.std_libs()?;
        self.log
            .validate()
            .map_err(|err| Error::Config(err.to_string()))
    }

    /// The configured libraries as an `mlua` set.
    pub fn std_libs(&self) -> Result<StdLib> {
        self.libraries.iter().try_fold(StdLib::NONE, |libs, name| {
            library(name)
                .map(|lib| libs | lib)
                .ok_or_else(|| Error::Config(format!("unknown standard library {name:?}")))
        })
    }
}
