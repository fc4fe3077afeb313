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

use crate::client::{is_transient_status, ErrorKind};
use crate::config::{ApiKey, DownstreamConfig};
use crate::retry::Retryable;
use crate::transform::Observation;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use std::error;
use std::fmt;

#[derive(Debug)]
pub enum SendError {
    Transport(reqwest::Error),
    Unauthorized(StatusCode),
    Rejected(StatusCode, Url),
    InvalidEndpoint(String),
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) if e.is_builder() => ErrorKind::Rejected,
            Self::Transport(_) => ErrorKind::Transient,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Rejected(status, _) if is_transient_status(*status) => ErrorKind::Transient,
            Self::Rejected(_, _) | Self::InvalidEndpoint(_) => ErrorKind::Rejected,
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Unauthorized(status) => write!(f, "downstream rejected credential with status {}", status),
            Self::Rejected(status, url) => write!(f, "unexpected status {} for {}", status, url),
            Self::InvalidEndpoint(reason) => write!(f, "invalid downstream endpoint: {}", reason),
        }
    }
}

impl error::Error for SendError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl Retryable for SendError {
    fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub accepted: usize,
}

/// Destination for normalized observations.
///
/// Implementations make a single attempt, retries are applied by the caller with
/// a `RetryPolicy`.
#[async_trait]
pub trait ObservationSender: Send + Sync {
    async fn send(&self, observations: &[Observation], integration_id: &str) -> Result<DeliveryReceipt, SendError>;
}

/// Sends observations as a JSON array to an HTTP ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpObservationSender {
    client: Client,
    url: Url,
    api_key: ApiKey,
}

impl HttpObservationSender {
    const USER_AGENT: &'static str = concat!("openweather_connector/", env!("CARGO_PKG_VERSION"));
    const INTEGRATION_HEADER: &'static str = "x-integration-id";

    pub fn new(client: Client, url: Url, api_key: ApiKey) -> Self {
        HttpObservationSender { client, url, api_key }
    }

    pub fn from_config(client: Client, config: &DownstreamConfig) -> Result<Self, SendError> {
        let url = Url::parse(&config.url).map_err(|e| SendError::InvalidEndpoint(e.to_string()))?;
        Ok(Self::new(client, url, config.api_key.clone()))
    }
}

#[async_trait]
impl ObservationSender for HttpObservationSender {
    async fn send(&self, observations: &[Observation], integration_id: &str) -> Result<DeliveryReceipt, SendError> {
        tracing::debug!(
            message = "sending observations",
            url = %self.url,
            count = observations.len(),
            integration_id = integration_id,
        );

        let res = self
            .client
            .post(self.url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key.expose()))
            .header(Self::INTEGRATION_HEADER, integration_id)
            .json(observations)
            .send()
            .await
            .map_err(SendError::Transport)?;

        let status = res.status();
        if status.is_success() {
            Ok(DeliveryReceipt {
                accepted: observations.len(),
            })
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(SendError::Unauthorized(status))
        } else {
            Err(SendError::Rejected(status, self.url.clone()))
        }
    }
}
