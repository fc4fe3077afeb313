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

//! One pull run over the configured locations.
//!
//! Each location goes through fetch, transform, the optional staleness check and the
//! downstream send on its own. A failure at any step is recorded for that location and
//! the run moves on to the next one. Only preconditions of the run itself (missing or
//! invalid configuration, and by default a rejected provider credential) fail the run.

use crate::client::{ClientError, ErrorKind, WeatherProvider};
use crate::config::{AuthConfig, ConfigError, DeliveryMode, IntegrationConfig, PullConfig, UnauthorizedPolicy};
use crate::retry::RetryPolicy;
use crate::sender::{ObservationSender, SendError};
use crate::source::{Location, SourceId};
use crate::state::{StalenessFilter, StateStore};
use crate::transform::Transformer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Instrument, Level};

pub const ACTION_ID: &str = "pull_observations";
pub const NO_LOCATIONS_MESSAGE: &str = "No locations configured";

#[derive(Debug)]
pub enum PullError {
    ConfigurationMissing(&'static str),
    InvalidConfiguration(String),
    Unauthorized(String),
}

impl PullError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            Self::InvalidConfiguration(_) => ErrorKind::Rejected,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
        }
    }
}

impl fmt::Display for PullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigurationMissing(section) => write!(f, "configuration missing: {}", section),
            Self::InvalidConfiguration(reason) => write!(f, "{}", reason),
            Self::Unauthorized(location) => write!(f, "provider rejected credential while fetching {}", location),
        }
    }
}

impl error::Error for PullError {}

impl From<ConfigError> for PullError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Missing(section) => PullError::ConfigurationMissing(section),
            other => PullError::InvalidConfiguration(other.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LocationStatus {
    Success,
    Skipped,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocationOutcome {
    pub location: String,
    pub source: SourceId,
    pub status: LocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LocationOutcome {
    fn new(location: &Location, status: LocationStatus) -> Self {
        LocationOutcome {
            location: location.name.clone(),
            source: location.source_id(),
            status,
            recorded_at: None,
            error: None,
        }
    }

    fn failed(location: &Location, err: &LocationError) -> Self {
        LocationOutcome {
            error: Some(err.to_string()),
            ..Self::new(location, LocationStatus::Error)
        }
    }
}

/// Summary of one pull run. `details` follows the configured location order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RunResult {
    pub observations_extracted: usize,
    pub details: Vec<LocationOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_locations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunResult {
    fn with_message<S: Into<String>>(message: S) -> Self {
        RunResult {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: LocationOutcome) {
        match outcome.status {
            LocationStatus::Success => self.observations_extracted += 1,
            LocationStatus::Error => self.failed_locations.push(outcome.location.clone()),
            LocationStatus::Skipped => {}
        }

        self.details.push(outcome);
    }
}

#[derive(Debug)]
enum LocationError {
    Fetch(ClientError),
    NoObservation,
    Send(SendError),
}

impl fmt::Display for LocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "fetch failed: {}", e),
            Self::NoObservation => write!(f, "response did not contain an observation"),
            Self::Send(e) => write!(f, "send failed: {}", e),
        }
    }
}

/// Everything a location needs from the run, borrowed for its duration.
struct RunContext<'a> {
    integration_id: &'a str,
    auth: &'a AuthConfig,
    pull: &'a PullConfig,
    transformer: Transformer,
    filter: Option<StalenessFilter<'a>>,
}

/// Fetches, transforms, filters and delivers observations for an integration.
pub struct PullAction {
    provider: Arc<dyn WeatherProvider>,
    sender: Arc<dyn ObservationSender>,
    state: Arc<dyn StateStore>,
    fetch_retry: RetryPolicy,
    send_retry: RetryPolicy,
}

impl PullAction {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        sender: Arc<dyn ObservationSender>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        PullAction {
            provider,
            sender,
            state,
            fetch_retry: RetryPolicy::fetch(),
            send_retry: RetryPolicy::send(),
        }
    }

    pub fn with_retry_policies(mut self, fetch: RetryPolicy, send: RetryPolicy) -> Self {
        self.fetch_retry = fetch;
        self.send_retry = send;
        self
    }

    pub async fn run(&self, config: &IntegrationConfig) -> Result<RunResult, PullError> {
        self.run_until(config, std::future::pending()).await
    }

    /// Run over every configured location, stopping early once `shutdown` completes.
    ///
    /// A location in flight when `shutdown` completes is abandoned and remaining locations
    /// are skipped. Outcomes collected up to that point are returned with a message saying
    /// how far the run got.
    pub async fn run_until<F>(&self, config: &IntegrationConfig, shutdown: F) -> Result<RunResult, PullError>
    where
        F: Future<Output = ()>,
    {
        let auth = config.auth_config()?;
        let pull = config.pull_config()?;
        pull.validate()?;

        if pull.locations.is_empty() {
            tracing::info!(message = "no locations configured", integration_id = %config.integration_id);
            return Ok(RunResult::with_message(NO_LOCATIONS_MESSAGE));
        }

        let ctx = RunContext {
            integration_id: &config.integration_id,
            auth,
            pull,
            transformer: Transformer::new(pull.additional_layout),
            filter: match pull.delivery {
                DeliveryMode::Deduplicate => {
                    Some(StalenessFilter::new(self.state.as_ref(), &config.integration_id, ACTION_ID))
                }
                DeliveryMode::Always => None,
            },
        };

        let total = pull.locations.len();
        let mut result = RunResult::default();
        tokio::pin!(shutdown);

        for (i, location) in pull.locations.iter().enumerate() {
            let res = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                res = self.pull_location(&ctx, location) => Some(res),
            };

            let outcome = match res {
                None => {
                    tracing::warn!(
                        message = "pull run cancelled",
                        integration_id = %config.integration_id,
                        completed = i,
                        total = total,
                    );
                    result.message = Some(format!("Run cancelled after {} of {} locations", i, total));
                    break;
                }
                Some(Ok(outcome)) => outcome,
                Some(Err(LocationError::Fetch(e)))
                    if e.kind() == ErrorKind::Unauthorized && pull.on_unauthorized == UnauthorizedPolicy::Abort =>
                {
                    tracing::error!(
                        message = "provider rejected credential, aborting run",
                        integration_id = %config.integration_id,
                        location = %location.name,
                        error = %e,
                    );
                    return Err(PullError::Unauthorized(location.name.clone()));
                }
                Some(Err(e)) => {
                    tracing::error!(
                        message = "failed to pull observation",
                        location = %location.name,
                        error = %e,
                    );
                    LocationOutcome::failed(location, &e)
                }
            };

            result.record(outcome);
        }

        tracing::info!(
            message = "pull run finished",
            integration_id = %config.integration_id,
            observations_extracted = result.observations_extracted,
            failed = result.failed_locations.len(),
            total = total,
        );

        Ok(result)
    }

    async fn pull_location(&self, ctx: &RunContext<'_>, location: &Location) -> Result<LocationOutcome, LocationError> {
        tracing::info!(
            message = "fetching weather",
            location = %location.name,
            lat = location.lat,
            lon = location.lon,
        );

        let payload = self
            .fetch_retry
            .retry(|| {
                self.provider
                    .fetch(location, &ctx.auth.api_key, ctx.pull.units, &ctx.pull.language)
            })
            .instrument(tracing::span!(Level::DEBUG, "openweather_fetch", location = %location.name))
            .await
            .map_err(LocationError::Fetch)?;

        let observation = ctx
            .transformer
            .transform(&payload, location)
            .ok_or(LocationError::NoObservation)?;

        if let Some(filter) = &ctx.filter {
            let emit = filter
                .should_emit(&observation.source, observation.recorded_at)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        message = "unable to read source state, sending anyway",
                        location = %location.name,
                        error = %e,
                    );
                    true
                });

            if !emit {
                tracing::debug!(
                    message = "skipping already delivered reading",
                    location = %location.name,
                    recorded_at = %observation.recorded_at,
                );

                return Ok(LocationOutcome {
                    recorded_at: Some(observation.recorded_at),
                    ..LocationOutcome::new(location, LocationStatus::Skipped)
                });
            }
        }

        self.send_retry
            .retry(|| self.sender.send(std::slice::from_ref(&observation), ctx.integration_id))
            .instrument(tracing::span!(Level::DEBUG, "observation_send", location = %location.name))
            .await
            .map_err(LocationError::Send)?;

        if let Some(filter) = &ctx.filter {
            if let Err(e) = filter.record(&observation.source, observation.recorded_at).await {
                tracing::error!(
                    message = "observation sent but source state not saved",
                    location = %location.name,
                    error = %e,
                );
            }
        }

        tracing::info!(
            message = "submitted observation",
            location = %location.name,
            source = %observation.source,
            recorded_at = %observation.recorded_at,
        );

        Ok(LocationOutcome {
            recorded_at: Some(observation.recorded_at),
            ..LocationOutcome::new(location, LocationStatus::Success)
        })
    }
}

/// Return once shutdown has been requested on `rx`, or its sender is gone.
pub async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Pull immediately and then every `refresh` until shutdown is requested on `shutdown`,
/// handing the outcome of every run to `report`.
///
/// A run in progress when shutdown is requested is cancelled and its partial result is
/// still reported before this returns.
pub async fn poll<F>(
    action: &PullAction,
    config: &IntegrationConfig,
    refresh: Duration,
    shutdown: watch::Receiver<bool>,
    mut report: F,
) where
    F: FnMut(Result<RunResult, PullError>),
{
    let mut interval = tokio::time::interval(refresh);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown.clone()) => break,
            _ = interval.tick() => {}
        }

        let res = action
            .run_until(config, shutdown_requested(shutdown.clone()))
            .instrument(tracing::span!(Level::DEBUG, "openweather_pull"))
            .await;
        report(res);
    }
}
