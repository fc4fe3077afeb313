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

use crate::config::{ApiKey, Units};
use crate::retry::Retryable;
use crate::source::Location;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error;
use std::fmt;

pub const DEFAULT_API_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

/// Broad classification of a failure, shared by fetch, send and run errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The credential was rejected. Never retried.
    Unauthorized,
    /// Network failure, rate limiting or a 5xx response. Retried with backoff.
    Transient,
    /// The response could not be parsed or lacked mandatory fields. Not retried.
    MalformedResponse,
    /// Any other non-success response. Not retried.
    Rejected,
    /// Required configuration was absent, the run can't start.
    ConfigurationMissing,
}

#[derive(Debug)]
pub enum ClientError {
    Transport(reqwest::Error),
    Unauthorized(StatusCode),
    Unexpected(StatusCode, Url),
    Malformed(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) if e.is_builder() => ErrorKind::Rejected,
            Self::Transport(_) => ErrorKind::Transient,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Unexpected(status, _) if is_transient_status(*status) => ErrorKind::Transient,
            Self::Unexpected(_, _) => ErrorKind::Rejected,
            Self::Malformed(_) => ErrorKind::MalformedResponse,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Unauthorized(status) => write!(f, "credential rejected with status {}", status),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
            Self::Malformed(reason) => write!(f, "malformed response: {}", reason),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl Retryable for ClientError {
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Status codes worth another attempt: rate limiting and server side failures.
pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Source of raw weather payloads for a location.
///
/// Implementations make a single attempt, retries are applied by the caller with
/// a `RetryPolicy`.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, location: &Location, api_key: &ApiKey, units: Units, language: &str)
        -> Result<Value, ClientError>;
}

/// Client for the OpenWeather current weather endpoint.
#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    client: Client,
    base_url: Url,
}

impl OpenWeatherClient {
    const USER_AGENT: &'static str = concat!("openweather_connector/", env!("CARGO_PKG_VERSION"));
    const JSON_RESPONSE: &'static str = "application/json";

    // Any well known coordinate works, the response only matters for its status.
    const REFERENCE_LAT: f64 = 51.5074;
    const REFERENCE_LON: f64 = -0.1278;

    pub fn new(client: Client, base_url: Url) -> Self {
        OpenWeatherClient { client, base_url }
    }

    /// Fetch current conditions at the given coordinates, returning the parsed body as-is.
    pub async fn current_weather(
        &self,
        lat: f64,
        lon: f64,
        api_key: &ApiKey,
        units: Units,
        language: &str,
    ) -> Result<Value, ClientError> {
        tracing::debug!(message = "making current weather request", url = %self.base_url, lat = lat, lon = lon);

        let res = self
            .client
            .get(self.base_url.clone())
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("appid", api_key.expose().to_owned()),
                ("units", units.as_str().to_owned()),
                ("lang", language.to_owned()),
            ])
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.without_url()))?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized(status));
        } else if !status.is_success() {
            // The request URL carries the credential, only the base is reported
            return Err(ClientError::Unexpected(status, self.base_url.clone()));
        }

        let body = res
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.without_url()))?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Malformed(e.to_string()))
    }

    /// Check whether the provider accepts `api_key`.
    ///
    /// Returns `Ok(false)` only when the provider explicitly rejects the credential,
    /// every other failure is returned as an error since it says nothing about the key.
    pub async fn validate_api_key(&self, api_key: &ApiKey) -> Result<bool, ClientError> {
        match self
            .current_weather(
                Self::REFERENCE_LAT,
                Self::REFERENCE_LON,
                api_key,
                Units::default(),
                "en",
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(ClientError::Unauthorized(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherClient {
    async fn fetch(
        &self,
        location: &Location,
        api_key: &ApiKey,
        units: Units,
        language: &str,
    ) -> Result<Value, ClientError> {
        self.current_weather(location.lat, location.lon, api_key, units, language)
            .await
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResult {
    pub valid_credentials: bool,
}

/// Credential check exposed to operators, see `OpenWeatherClient::validate_api_key`.
pub async fn check_credentials(client: &OpenWeatherClient, api_key: &ApiKey) -> Result<AuthResult, ClientError> {
    let valid_credentials = client.validate_api_key(api_key).await?;
    tracing::info!(message = "checked provider credential", valid = valid_credentials);
    Ok(AuthResult { valid_credentials })
}
