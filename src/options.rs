//! # StartupOptions: the immutable blob every child receives.
//!
//! The supervisor normalizes [`RawOptions`] once, validates the result, and then
//! serializes the same [`StartupOptions`] (camelCase JSON) as the sole argument of
//! every spawned child. Nothing mutates the options after spawn.
//!
//! ## Defaults
//! - `baseDir` → current working directory
//! - `port` → `7001`, or `8443` when `https` is on
//! - `workers` → number of available CPUs when unset or `0`
//!
//! ## Example
//! ```rust
//! use clustervisor::RawOptions;
//!
//! let opts = RawOptions {
//!     framework: Some("echo".into()),
//!     port: Some("7001".into()),
//!     workers: Some(3),
//!     ..Default::default()
//! }
//! .normalize()
//! .unwrap();
//!
//! assert_eq!(opts.port, 7001);
//! assert_eq!(opts.workers, 3);
//! assert!(opts.to_arg().unwrap().contains("\"baseDir\""));
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::unit::Frameworks;

const DEFAULT_PORT: u16 = 7001;
const DEFAULT_HTTPS_PORT: u16 = 8443;

/// Normalized, validated startup configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupOptions {
    /// Resolvable hosted-framework identifier.
    pub framework: String,
    pub base_dir: PathBuf,
    /// Listen port; `0` lets each worker bind an ephemeral port.
    pub port: u16,
    /// Number of application workers.
    pub workers: usize,
    #[serde(default)]
    pub https: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    /// Supervisor owns the public socket and hands connections to workers.
    #[serde(default)]
    pub sticky: bool,
}

/// Un-normalized options as they arrive from a launcher (CLI flags, embedding code).
#[derive(Clone, Debug, Default)]
pub struct RawOptions {
    pub framework: Option<String>,
    pub base_dir: Option<PathBuf>,
    /// Kept textual so that a non-numeric port is a validation error, not a parse panic.
    pub port: Option<String>,
    pub workers: Option<usize>,
    pub https: bool,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub sticky: bool,
}

impl RawOptions {
    /// Applies defaults and parses the port.
    pub fn normalize(self) -> Result<StartupOptions, ValidationError> {
        let port = match self.port.as_deref().map(str::trim) {
            None | Some("") if self.https => DEFAULT_HTTPS_PORT,
            None | Some("") => DEFAULT_PORT,
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| ValidationError::InvalidPort(p.to_string()))?,
        };
        let workers = match self.workers {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };
        let base_dir = match self.base_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|_| ValidationError::BaseDirMissing(PathBuf::from(".")))?,
        };

        Ok(StartupOptions {
            framework: self.framework.unwrap_or_default(),
            base_dir,
            port,
            workers,
            https: self.https,
            key: self.key,
            cert: self.cert,
            sticky: self.sticky,
        })
    }
}

impl StartupOptions {
    /// Checks everything that must hold before the first spawn.
    pub fn validate(&self, frameworks: &Frameworks) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::NoWorkers);
        }
        if !self.base_dir.is_dir() {
            return Err(ValidationError::BaseDirMissing(self.base_dir.clone()));
        }
        if self.https {
            check_readable("key", self.key.as_deref())?;
            check_readable("cert", self.cert.as_deref())?;
        }
        if !frameworks.contains(&self.framework) {
            return Err(ValidationError::UnknownFramework(self.framework.clone()));
        }
        Ok(())
    }

    /// Serializes into the single child-process argument.
    pub fn to_arg(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses the single child-process argument.
    pub fn from_arg(arg: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(arg)
    }
}

fn check_readable(which: &'static str, path: Option<&Path>) -> Result<(), ValidationError> {
    let path = path.ok_or(ValidationError::MissingTls { which })?;
    File::open(path)
        .map(drop)
        .map_err(|_| ValidationError::UnreadableTls {
            which,
            path: path.to_path_buf(),
        })
}
