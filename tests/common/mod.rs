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

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use openweather_connector::client::{ClientError, WeatherProvider};
use openweather_connector::config::{ApiKey, IntegrationConfig, PullConfig, Units};
use openweather_connector::retry::RetryPolicy;
use openweather_connector::sender::{DeliveryReceipt, ObservationSender, SendError};
use openweather_connector::source::Location;
use openweather_connector::state::{MemoryStateStore, SourceState, StateError, StateStore};
use openweather_connector::transform::Observation;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

/// Serve `app` on an ephemeral local port, returning the address it's bound to.
pub async fn serve(app: Router) -> SocketAddr {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = axum::Server::bind(&addr).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter: Duration::ZERO,
    }
}

pub fn weather_payload(dt: i64, lat: f64, lon: f64) -> Value {
    json!({
        "coord": {"lon": lon, "lat": lat},
        "weather": [{"id": 500, "main": "Rain", "description": "light rain"}],
        "main": {"temp": 16.88, "humidity": 88, "pressure": 1016},
        "wind": {"speed": 0},
        "clouds": {"all": 100},
        "dt": dt,
        "sys": {"country": "MX"},
        "name": "Guadalajara"
    })
}

pub fn integration(locations: Vec<Location>) -> IntegrationConfig {
    IntegrationConfig {
        integration_id: "test_integration".to_owned(),
        auth: Some(openweather_connector::config::AuthConfig {
            api_key: ApiKey::new("test_api_key"),
        }),
        pull_observations: Some(PullConfig::new(locations)),
        downstream: None,
        state_path: None,
    }
}

enum Reply {
    Payload(Value),
    Fail(StatusCode),
    Hang,
}

/// Provider returning canned replies per location name, recording every call.
#[derive(Default)]
pub struct FakeProvider {
    replies: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply for `location`. The last queued reply repeats.
    pub fn reply(self, location: &str, payload: Value) -> Self {
        self.push(location, Reply::Payload(payload));
        self
    }

    /// Queue a failing reply with `status` for `location`. The last queued reply repeats.
    pub fn fail(self, location: &str, status: StatusCode) -> Self {
        self.push(location, Reply::Fail(status));
        self
    }

    /// Never answer for `location`.
    pub fn hang(self, location: &str) -> Self {
        self.push(location, Reply::Hang);
        self
    }

    pub fn set_reply(&self, location: &str, payload: Value) {
        let mut replies = self.replies.lock().unwrap();
        replies.insert(location.to_owned(), vec![Reply::Payload(payload)]);
    }

    fn push(&self, location: &str, reply: Reply) {
        let mut replies = self.replies.lock().unwrap();
        replies.entry(location.to_owned()).or_default().push(reply);
    }

    pub fn calls(&self, location: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == location).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl WeatherProvider for FakeProvider {
    async fn fetch(&self, location: &Location, _api_key: &ApiKey, _units: Units, _language: &str) -> Result<Value, ClientError> {
        self.calls.lock().unwrap().push(location.name.clone());

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            let queue = replies
                .get_mut(&location.name)
                .unwrap_or_else(|| panic!("no reply for {}", location.name));

            if queue.len() > 1 {
                queue.remove(0)
            } else {
                clone_reply(&queue[0])
            }
        };

        match reply {
            Reply::Payload(v) => Ok(v),
            Reply::Fail(StatusCode::UNAUTHORIZED) => Err(ClientError::Unauthorized(StatusCode::UNAUTHORIZED)),
            Reply::Fail(status) => Err(ClientError::Unexpected(
                status,
                Url::parse("https://api.openweathermap.org/data/2.5/weather").unwrap(),
            )),
            Reply::Hang => std::future::pending().await,
        }
    }
}

fn clone_reply(reply: &Reply) -> Reply {
    match reply {
        Reply::Payload(v) => Reply::Payload(v.clone()),
        Reply::Fail(s) => Reply::Fail(*s),
        Reply::Hang => Reply::Hang,
    }
}

/// Sender that keeps everything it was given, optionally failing the first few sends.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Observation>>,
    failures: Mutex<Vec<StatusCode>>,
    attempts: Mutex<usize>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next sends with these statuses, in order.
    pub fn failing_with(self, statuses: Vec<StatusCode>) -> Self {
        *self.failures.lock().unwrap() = statuses;
        self
    }

    pub fn sent(&self) -> Vec<Observation> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl ObservationSender for RecordingSender {
    async fn send(&self, observations: &[Observation], _integration_id: &str) -> Result<DeliveryReceipt, SendError> {
        *self.attempts.lock().unwrap() += 1;

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };

        if let Some(status) = failure {
            return Err(SendError::Rejected(
                status,
                Url::parse("https://ingest.example.com/v2/observations/").unwrap(),
            ));
        }

        self.sent.lock().unwrap().extend_from_slice(observations);
        Ok(DeliveryReceipt {
            accepted: observations.len(),
        })
    }
}

/// State store whose reads or writes fail with an I/O error, delegating the rest to memory.
#[derive(Default)]
pub struct FailingStateStore {
    fail_reads: bool,
    fail_writes: bool,
    inner: MemoryStateStore,
    writes: Mutex<usize>,
}

impl FailingStateStore {
    pub fn failing_reads() -> Self {
        FailingStateStore {
            fail_reads: true,
            ..Self::default()
        }
    }

    pub fn failing_writes() -> Self {
        FailingStateStore {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Attempted writes, failed or not.
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    pub fn stored(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl StateStore for FailingStateStore {
    async fn get_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
    ) -> Result<Option<SourceState>, StateError> {
        if self.fail_reads {
            return Err(StateError::Io(io::Error::new(io::ErrorKind::Other, "state unavailable")));
        }

        self.inner.get_state(integration_id, action_id, source_id).await
    }

    async fn set_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
        state: SourceState,
    ) -> Result<(), StateError> {
        *self.writes.lock().unwrap() += 1;
        if self.fail_writes {
            return Err(StateError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }

        self.inner.set_state(integration_id, action_id, source_id, state).await
    }
}
