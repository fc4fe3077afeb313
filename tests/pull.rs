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

mod common;

use common::{fast_retry, integration, weather_payload, FailingStateStore, FakeProvider, RecordingSender};
use openweather_connector::client::ErrorKind;
use openweather_connector::config::{DeliveryMode, UnauthorizedPolicy};
use openweather_connector::pull::{poll, LocationStatus, PullAction, PullError, ACTION_ID, NO_LOCATIONS_MESSAGE};
use openweather_connector::source::Location;
use openweather_connector::state::{MemoryStateStore, StateStore};
use reqwest::StatusCode;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn locations() -> Vec<Location> {
    vec![
        Location::new("Guadalajara", 20.659698, -103.349609),
        Location::new("Boston", 42.3601, -71.0589),
        Location::new("Oslo", 59.9139, 10.7522),
    ]
}

struct Harness {
    provider: Arc<FakeProvider>,
    sender: Arc<RecordingSender>,
    state: Arc<MemoryStateStore>,
    action: PullAction,
}

fn harness(provider: FakeProvider, sender: RecordingSender) -> Harness {
    let provider = Arc::new(provider);
    let sender = Arc::new(sender);
    let state = Arc::new(MemoryStateStore::new());
    let action = PullAction::new(provider.clone(), sender.clone(), state.clone())
        .with_retry_policies(fast_retry(), fast_retry());

    Harness {
        provider,
        sender,
        state,
        action,
    }
}

fn all_reply(dt: i64) -> FakeProvider {
    locations()
        .iter()
        .fold(FakeProvider::new(), |p, l| p.reply(&l.name, weather_payload(dt, l.lat, l.lon)))
}

#[tokio::test]
async fn test_all_locations_delivered() {
    let h = harness(all_reply(1760015910), RecordingSender::new());
    let config = integration(locations());

    let result = h.action.run(&config).await.unwrap();

    assert_eq!(3, result.observations_extracted);
    assert!(result.failed_locations.is_empty());
    assert!(result.message.is_none());
    assert_eq!(
        vec!["Guadalajara", "Boston", "Oslo"],
        result.details.iter().map(|d| d.location.as_str()).collect::<Vec<_>>()
    );
    assert!(result.details.iter().all(|d| d.status == LocationStatus::Success));

    let sent = h.sender.sent();
    assert_eq!(3, sent.len());
    assert_eq!(locations()[1].source_id(), sent[1].source);
    assert_eq!(3, h.state.len());
}

#[tokio::test]
async fn test_failing_location_isolated() {
    let provider = FakeProvider::new()
        .reply("Guadalajara", weather_payload(1760015910, 20.659698, -103.349609))
        .fail("Boston", StatusCode::SERVICE_UNAVAILABLE)
        .reply("Oslo", weather_payload(1760015910, 59.9139, 10.7522));
    let h = harness(provider, RecordingSender::new());

    let result = h.action.run(&integration(locations())).await.unwrap();

    assert_eq!(2, result.observations_extracted);
    assert_eq!(vec!["Boston".to_owned()], result.failed_locations);
    assert_eq!(LocationStatus::Error, result.details[1].status);
    assert!(result.details[1].error.is_some());
    assert_eq!(LocationStatus::Success, result.details[2].status);
    // Transient failures get the full retry budget
    assert_eq!(3, h.provider.calls("Boston"));
    assert_eq!(1, h.provider.calls("Oslo"));
}

#[tokio::test]
async fn test_transient_fetch_recovers() {
    let provider = FakeProvider::new()
        .fail("Boston", StatusCode::TOO_MANY_REQUESTS)
        .reply("Boston", weather_payload(1760015910, 42.3601, -71.0589));
    let h = harness(provider, RecordingSender::new());

    let result = h
        .action
        .run(&integration(vec![Location::new("Boston", 42.3601, -71.0589)]))
        .await
        .unwrap();

    assert_eq!(1, result.observations_extracted);
    assert_eq!(2, h.provider.calls("Boston"));
}

#[tokio::test]
async fn test_no_locations() {
    let h = harness(FakeProvider::new(), RecordingSender::new());

    let result = h.action.run(&integration(vec![])).await.unwrap();

    assert_eq!(0, result.observations_extracted);
    assert!(result.details.is_empty());
    assert_eq!(Some(NO_LOCATIONS_MESSAGE.to_owned()), result.message);
    assert_eq!(0, h.provider.total_calls());
}

#[tokio::test]
async fn test_missing_configuration() {
    let h = harness(FakeProvider::new(), RecordingSender::new());

    let mut no_auth = integration(locations());
    no_auth.auth = None;
    let err = h.action.run(&no_auth).await.unwrap_err();
    assert!(matches!(err, PullError::ConfigurationMissing("auth")));
    assert_eq!(ErrorKind::ConfigurationMissing, err.kind());

    let mut no_pull = integration(locations());
    no_pull.pull_observations = None;
    let err = h.action.run(&no_pull).await.unwrap_err();
    assert!(matches!(err, PullError::ConfigurationMissing("pull_observations")));

    assert_eq!(0, h.provider.total_calls());
}

#[tokio::test]
async fn test_invalid_location_fails_run() {
    let h = harness(FakeProvider::new(), RecordingSender::new());
    let config = integration(vec![Location::new("Nowhere", 91.0, 0.0)]);

    let err = h.action.run(&config).await.unwrap_err();

    assert!(matches!(err, PullError::InvalidConfiguration(_)));
    assert_eq!(0, h.provider.total_calls());
}

#[tokio::test]
async fn test_repeated_reading_skipped() {
    let h = harness(all_reply(1760015910), RecordingSender::new());
    let config = integration(locations());

    let first = h.action.run(&config).await.unwrap();
    let second = h.action.run(&config).await.unwrap();

    assert_eq!(3, first.observations_extracted);
    assert_eq!(0, second.observations_extracted);
    assert!(second.failed_locations.is_empty());
    assert!(second.details.iter().all(|d| d.status == LocationStatus::Skipped));
    assert_eq!(3, h.sender.sent().len());

    // A newer reading for one location goes through
    h.provider
        .set_reply("Oslo", weather_payload(1760015910 + 600, 59.9139, 10.7522));
    let third = h.action.run(&config).await.unwrap();

    assert_eq!(1, third.observations_extracted);
    assert_eq!(LocationStatus::Success, third.details[2].status);
    assert_eq!(4, h.sender.sent().len());
}

#[tokio::test]
async fn test_older_reading_skipped() {
    let h = harness(all_reply(1760015910), RecordingSender::new());
    let config = integration(vec![Location::new("Oslo", 59.9139, 10.7522)]);

    h.action.run(&config).await.unwrap();
    h.provider
        .set_reply("Oslo", weather_payload(1760015910 - 600, 59.9139, 10.7522));
    let result = h.action.run(&config).await.unwrap();

    assert_eq!(LocationStatus::Skipped, result.details[0].status);
    assert_eq!(1, h.sender.sent().len());
}

#[tokio::test]
async fn test_always_delivery_resends() {
    let h = harness(all_reply(1760015910), RecordingSender::new());
    let mut config = integration(locations());
    config.pull_observations.as_mut().unwrap().delivery = DeliveryMode::Always;

    h.action.run(&config).await.unwrap();
    let second = h.action.run(&config).await.unwrap();

    assert_eq!(3, second.observations_extracted);
    assert_eq!(6, h.sender.sent().len());
    assert!(h.state.is_empty());
}

#[tokio::test]
async fn test_failed_send_not_recorded() {
    let sender = RecordingSender::new().failing_with(vec![StatusCode::BAD_REQUEST]);
    let h = harness(all_reply(1760015910), sender);
    let location = Location::new("Oslo", 59.9139, 10.7522);
    let config = integration(vec![location.clone()]);

    let first = h.action.run(&config).await.unwrap();

    assert_eq!(0, first.observations_extracted);
    assert_eq!(vec!["Oslo".to_owned()], first.failed_locations);
    // Client errors from downstream are not retried
    assert_eq!(1, h.sender.attempts());
    let state = h
        .state
        .get_state(&config.integration_id, ACTION_ID, location.source_id().as_str())
        .await
        .unwrap();
    assert!(state.is_none());

    // The same reading is delivered on the next run since it was never confirmed
    let second = h.action.run(&config).await.unwrap();
    assert_eq!(1, second.observations_extracted);
    assert_eq!(1, h.sender.sent().len());
}

fn oslo_with_state(state: Arc<FailingStateStore>) -> (PullAction, Arc<RecordingSender>) {
    let provider = FakeProvider::new().reply("Oslo", weather_payload(1760015910, 59.9139, 10.7522));
    let sender = Arc::new(RecordingSender::new());
    let action = PullAction::new(Arc::new(provider), sender.clone(), state)
        .with_retry_policies(fast_retry(), fast_retry());
    (action, sender)
}

#[tokio::test]
async fn test_state_read_failure_still_sends() {
    let state = Arc::new(FailingStateStore::failing_reads());
    let (action, sender) = oslo_with_state(state.clone());

    let result = action
        .run(&integration(vec![Location::new("Oslo", 59.9139, 10.7522)]))
        .await
        .unwrap();

    assert_eq!(1, result.observations_extracted);
    assert_eq!(LocationStatus::Success, result.details[0].status);
    assert!(result.failed_locations.is_empty());
    assert_eq!(1, sender.sent().len());
    assert_eq!(1, sender.attempts());
    assert_eq!(1, state.stored());
}

#[tokio::test]
async fn test_state_write_failure_counts_as_sent() {
    let state = Arc::new(FailingStateStore::failing_writes());
    let (action, sender) = oslo_with_state(state.clone());

    let result = action
        .run(&integration(vec![Location::new("Oslo", 59.9139, 10.7522)]))
        .await
        .unwrap();

    assert_eq!(1, result.observations_extracted);
    assert_eq!(LocationStatus::Success, result.details[0].status);
    assert!(result.details[0].error.is_none());
    assert!(result.failed_locations.is_empty());
    assert_eq!(1, sender.sent().len());
    assert_eq!(1, sender.attempts());
    assert_eq!(1, state.writes());
    assert_eq!(0, state.stored());
}

#[tokio::test]
async fn test_transient_send_retried() {
    let sender = RecordingSender::new().failing_with(vec![StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE]);
    let h = harness(all_reply(1760015910), sender);

    let result = h
        .action
        .run(&integration(vec![Location::new("Oslo", 59.9139, 10.7522)]))
        .await
        .unwrap();

    assert_eq!(1, result.observations_extracted);
    assert_eq!(3, h.sender.attempts());
    assert_eq!(1, h.sender.sent().len());
}

#[tokio::test]
async fn test_unauthorized_aborts_run() {
    let provider = FakeProvider::new()
        .reply("Guadalajara", weather_payload(1760015910, 20.659698, -103.349609))
        .fail("Boston", StatusCode::UNAUTHORIZED)
        .reply("Oslo", weather_payload(1760015910, 59.9139, 10.7522));
    let h = harness(provider, RecordingSender::new());

    let err = h.action.run(&integration(locations())).await.unwrap_err();

    assert!(matches!(err, PullError::Unauthorized(ref name) if name == "Boston"));
    assert_eq!(ErrorKind::Unauthorized, err.kind());
    // Never retried
    assert_eq!(1, h.provider.calls("Boston"));
    assert_eq!(0, h.provider.calls("Oslo"));
}

#[tokio::test]
async fn test_unauthorized_continue() {
    let provider = FakeProvider::new()
        .reply("Guadalajara", weather_payload(1760015910, 20.659698, -103.349609))
        .fail("Boston", StatusCode::UNAUTHORIZED)
        .reply("Oslo", weather_payload(1760015910, 59.9139, 10.7522));
    let h = harness(provider, RecordingSender::new());
    let mut config = integration(locations());
    config.pull_observations.as_mut().unwrap().on_unauthorized = UnauthorizedPolicy::Continue;

    let result = h.action.run(&config).await.unwrap();

    assert_eq!(2, result.observations_extracted);
    assert_eq!(vec!["Boston".to_owned()], result.failed_locations);
    assert_eq!(1, h.provider.calls("Boston"));
}

#[tokio::test]
async fn test_payload_without_observation() {
    let provider = FakeProvider::new()
        .reply("Guadalajara", json!({"cod": "404", "message": "city not found"}))
        .reply("Boston", json!([1, 2, 3]))
        .reply("Oslo", weather_payload(1760015910, 59.9139, 10.7522));
    let h = harness(provider, RecordingSender::new());

    let result = h.action.run(&integration(locations())).await.unwrap();

    assert_eq!(1, result.observations_extracted);
    assert_eq!(vec!["Guadalajara".to_owned(), "Boston".to_owned()], result.failed_locations);
    assert_eq!(1, h.sender.sent().len());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = harness(all_reply(1760015910), RecordingSender::new());

    let result = h
        .action
        .run_until(&integration(locations()), std::future::ready(()))
        .await
        .unwrap();

    assert_eq!(0, result.observations_extracted);
    assert!(result.details.is_empty());
    assert_eq!(Some("Run cancelled after 0 of 3 locations".to_owned()), result.message);
    assert_eq!(0, h.provider.total_calls());
}

#[tokio::test]
async fn test_cancelled_mid_run() {
    let provider = FakeProvider::new()
        .reply("Guadalajara", weather_payload(1760015910, 20.659698, -103.349609))
        .hang("Boston")
        .reply("Oslo", weather_payload(1760015910, 59.9139, 10.7522));
    let h = harness(provider, RecordingSender::new());
    let (tx, mut rx) = tokio::sync::watch::channel(false);
    let sender = h.sender.clone();

    // Request shutdown as soon as the first observation is delivered
    tokio::spawn(async move {
        while sender.sent().is_empty() {
            tokio::task::yield_now().await;
        }
        let _ = tx.send(true);
    });

    let shutdown = async move {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    };

    let result = h.action.run_until(&integration(locations()), shutdown).await.unwrap();

    assert_eq!(1, result.observations_extracted);
    assert_eq!(1, result.details.len());
    assert_eq!(Some("Run cancelled after 1 of 3 locations".to_owned()), result.message);
    assert_eq!(1, h.provider.calls("Boston"));
    assert_eq!(0, h.provider.calls("Oslo"));
}

#[tokio::test]
async fn test_poll_reports_cancelled_run() {
    let provider = FakeProvider::new()
        .reply("Guadalajara", weather_payload(1760015910, 20.659698, -103.349609))
        .hang("Boston")
        .reply("Oslo", weather_payload(1760015910, 59.9139, 10.7522));
    let h = harness(provider, RecordingSender::new());
    let action = Arc::new(h.action);
    let reports = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = tokio::sync::watch::channel(false);

    let polling = {
        let action = action.clone();
        let reports = reports.clone();
        tokio::spawn(async move {
            let config = integration(locations());
            poll(&action, &config, Duration::from_secs(3600), rx, |res| {
                reports.lock().unwrap().push(res);
            })
            .await;
        })
    };

    while h.sender.sent().is_empty() {
        tokio::task::yield_now().await;
    }
    tx.send(true).unwrap();
    polling.await.unwrap();

    let reports = reports.lock().unwrap();
    assert_eq!(1, reports.len());
    let result = reports[0].as_ref().unwrap();
    assert_eq!(1, result.observations_extracted);
    assert_eq!(Some("Run cancelled after 1 of 3 locations".to_owned()), result.message);
    assert_eq!(0, h.provider.calls("Oslo"));
}

#[tokio::test]
async fn test_poll_stops_before_first_run() {
    let h = harness(all_reply(1760015910), RecordingSender::new());
    let (tx, rx) = tokio::sync::watch::channel(false);
    tx.send(true).unwrap();
    let mut runs = 0;

    poll(&h.action, &integration(locations()), Duration::from_secs(3600), rx, |_| runs += 1).await;

    assert_eq!(0, runs);
    assert_eq!(0, h.provider.total_calls());
}
