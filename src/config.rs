//! Configuration for format conversion.

use crate::format::Format;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// How a module should be converted.
///
/// ```json
/// { "target": "nhwc", "in_place": false }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvertConfig {
    /// Layout every tensor ends up in.
    pub target: Format,
    /// Mutate the module instead of returning a converted copy.
    pub in_place: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            target: Format::Nhwc,
            in_place: true,
        }
    }
}

impl ConvertConfig {
    pub fn new(target: Format) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: Format) -> Self {
        self.target = target;
        self
    }

    pub fn with_in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}
