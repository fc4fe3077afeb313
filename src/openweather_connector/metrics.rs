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

use crate::pull::{LocationStatus, RunResult};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct LocationLabels {
    location: String,
}

/// Holder for metrics that are updated from the `RunResult` of each pull run.
///
/// All metrics are created and registered upon call to `PullMetrics::new()`. Metrics all
/// share the prefix "openweather_" and per-location metrics have a "location" label set to
/// the configured name of the location.
pub struct PullMetrics {
    runs: Counter,
    run_failures: Counter,
    observations_sent: Family<LocationLabels, Counter>,
    location_errors: Family<LocationLabels, Counter>,
    location_skipped: Family<LocationLabels, Counter>,
    last_run: Gauge,
}

impl PullMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let runs = Counter::default();
        let run_failures = Counter::default();
        let observations_sent = Family::<LocationLabels, Counter>::default();
        let location_errors = Family::<LocationLabels, Counter>::default();
        let location_skipped = Family::<LocationLabels, Counter>::default();
        let last_run = Gauge::default();

        reg.register("openweather_runs", "Completed pull runs", runs.clone());
        reg.register(
            "openweather_run_failures",
            "Pull runs that failed before processing locations",
            run_failures.clone(),
        );
        reg.register(
            "openweather_observations_sent",
            "Observations delivered downstream",
            observations_sent.clone(),
        );
        reg.register(
            "openweather_location_errors",
            "Locations that did not produce a deliverable observation",
            location_errors.clone(),
        );
        reg.register(
            "openweather_location_skipped",
            "Readings suppressed because they were already delivered",
            location_skipped.clone(),
        );
        reg.register(
            "openweather_last_run_timestamp_seconds",
            "Unix time of the last completed pull run",
            last_run.clone(),
        );

        Self {
            runs,
            run_failures,
            observations_sent,
            location_errors,
            location_skipped,
            last_run,
        }
    }

    /// Update counters from a completed run, finished at unix time `now`.
    pub fn observe(&self, result: &RunResult, now: i64) {
        self.runs.inc();
        self.last_run.set(now);

        for detail in &result.details {
            let labels = LocationLabels {
                location: detail.location.clone(),
            };

            let family = match detail.status {
                LocationStatus::Success => &self.observations_sent,
                LocationStatus::Error => &self.location_errors,
                LocationStatus::Skipped => &self.location_skipped,
            };

            family.get_or_create(&labels).inc();
        }
    }

    pub fn failure(&self) {
        self.run_failures.inc();
    }
}
