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

//! OpenWeather observations connector
//!
//! ## Features
//!
//! `openweather_connector` polls the [OpenWeather] current weather API for a set of named
//! locations, turns each response into a normalized observation, and forwards it to a
//! downstream ingestion service. Readings that were already delivered for a location are
//! not sent again (unless configured to), based on per-location state that is persisted
//! between runs.
//!
//! Each observation has the following shape.
//!
//! ```json
//! {
//!   "source": "openweather_6f1c...",
//!   "source_name": "Guadalajara",
//!   "type": "stationary-object",
//!   "subtype": "weather_station",
//!   "recorded_at": "2025-10-09T13:18:30Z",
//!   "location": {"lat": 20.659698, "lon": -103.349609},
//!   "additional": {"main": {"temp": 16.88, "humidity": 88}, "city_name": "Guadalajara"}
//! }
//! ```
//!
//! The `source` is derived from the coordinates of the location so it stays the same across
//! restarts and renames.
//!
//! [OpenWeather]: https://openweathermap.org/current
//!
//! ## Usage
//!
//! ### Configuration
//!
//! A single integration is described by a YAML file.
//!
//! ```yaml
//! integration_id: "b8d1f1d2-5d4c-4c48-9d0f-1d0b3c6c2a11"
//! auth:
//!   api_key: "YOUR_OPENWEATHER_KEY"
//! pull_observations:
//!   locations:
//!     - { name: "Guadalajara", lat: 20.659698, lon: -103.349609 }
//!   units: metric
//!   language: en
//! downstream:
//!   url: "https://ingest.example.com/v2/observations/"
//!   api_key: "YOUR_INGEST_KEY"
//! state_path: /var/lib/openweather_connector/state.json
//! ```
//!
//! ### Run
//!
//! ```text
//! ./openweather_connector --config /etc/openweather_connector.yaml
//! ```
//!
//! Locations are pulled immediately and then every `--refresh-secs` seconds. Use `--once`
//! to pull a single time and print the result of the run.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9783` at `/metrics`.
//!

pub mod client;
pub mod config;
pub mod http;
pub mod metrics;
pub mod pull;
pub mod retry;
pub mod sender;
pub mod source;
pub mod state;
pub mod transform;
