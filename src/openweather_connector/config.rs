// openweather_connector - OpenWeather observations connector
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::source::Location;
use serde::{Deserialize, Serialize};
use std::error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Parse(serde_yaml::Error),
    Missing(&'static str),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(p, e) => write!(f, "unable to read {}: {}", p.display(), e),
            Self::Parse(e) => write!(f, "invalid configuration: {}", e),
            Self::Missing(section) => write!(f, "configuration missing: {}", section),
            Self::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(_, e) => Some(e),
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

/// Secret string that never shows up in `Debug` output or logs.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        ApiKey(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(**********)")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
    Standard,
}

impl Units {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Imperial => "imperial",
            Self::Standard => "standard",
        }
    }
}

/// Whether readings that were already delivered are sent again.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Consult per-source state and only send readings newer than the last delivered one.
    #[default]
    Deduplicate,
    /// Send every reading fetched, state is neither read nor written.
    Always,
}

/// How upstream sections are laid out in the `additional` mapping of an observation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdditionalLayout {
    #[default]
    Nested,
    Flattened,
}

/// What a pull run does when the provider rejects the credential.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnauthorizedPolicy {
    #[default]
    Abort,
    Continue,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthConfig {
    pub api_key: ApiKey,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PullConfig {
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub units: Units,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default)]
    pub additional_layout: AdditionalLayout,
    #[serde(default)]
    pub on_unauthorized: UnauthorizedPolicy,
}

fn default_language() -> String {
    "en".to_owned()
}

impl PullConfig {
    pub fn new(locations: Vec<Location>) -> Self {
        PullConfig {
            locations,
            units: Units::default(),
            language: default_language(),
            delivery: DeliveryMode::default(),
            additional_layout: AdditionalLayout::default(),
            on_unauthorized: UnauthorizedPolicy::default(),
        }
    }

    /// Reject coordinates and settings the provider can't make sense of.
    ///
    /// An empty location list is allowed here, a pull run reports it instead of failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.language.trim().is_empty() {
            return Err(ConfigError::Invalid("language must not be empty".to_owned()));
        }

        for loc in &self.locations {
            if loc.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "location at ({}, {}) has an empty name",
                    loc.lat, loc.lon
                )));
            }

            if !loc.lat.is_finite() || !(-90.0..=90.0).contains(&loc.lat) {
                return Err(ConfigError::Invalid(format!(
                    "location {} has latitude {} outside [-90, 90]",
                    loc.name, loc.lat
                )));
            }

            if !loc.lon.is_finite() || !(-180.0..=180.0).contains(&loc.lon) {
                return Err(ConfigError::Invalid(format!(
                    "location {} has longitude {} outside [-180, 180]",
                    loc.name, loc.lon
                )));
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DownstreamConfig {
    pub url: String,
    pub api_key: ApiKey,
}

/// Everything configured for a single integration.
///
/// The `auth` and `pull_observations` sections are optional at parse time so that
/// their absence is reported when a pull run starts, as a fatal precondition of
/// that run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IntegrationConfig {
    pub integration_id: String,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub pull_observations: Option<PullConfig>,
    #[serde(default)]
    pub downstream: Option<DownstreamConfig>,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl IntegrationConfig {
    pub fn from_yaml(s: &str) -> Result<Self, ConfigError> {
        let config: IntegrationConfig = serde_yaml::from_str(s).map_err(ConfigError::Parse)?;
        if config.integration_id.trim().is_empty() {
            return Err(ConfigError::Invalid("integration_id must not be empty".to_owned()));
        }

        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_owned(), e))?;
        Self::from_yaml(&contents)
    }

    pub fn auth_config(&self) -> Result<&AuthConfig, ConfigError> {
        self.auth.as_ref().ok_or(ConfigError::Missing("auth"))
    }

    pub fn pull_config(&self) -> Result<&PullConfig, ConfigError> {
        self.pull_observations
            .as_ref()
            .ok_or(ConfigError::Missing("pull_observations"))
    }

    pub fn downstream_config(&self) -> Result<&DownstreamConfig, ConfigError> {
        self.downstream.as_ref().ok_or(ConfigError::Missing("downstream"))
    }
}
