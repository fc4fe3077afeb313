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

//! Mapping of raw OpenWeather payloads to normalized observations.
//!
//! The `dt` and `coord` fields of a payload are consumed: `dt` becomes the `recorded_at`
//! timestamp and the observation location is taken from the configured `Location` (the
//! same coordinates its source identity is derived from). Every other upstream field ends
//! up in `additional`, renamed and converted according to `FIELD_MAPPINGS`, or verbatim
//! under its own name when it has no mapping. Null values are dropped rather than carried
//! as placeholders.

use crate::config::AdditionalLayout;
use crate::source::{GeoPoint, Location, SourceId};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OBSERVATION_TYPE: &str = "stationary-object";
pub const OBSERVATION_SUBTYPE: &str = "weather_station";

const CONSUMED_FIELDS: &[&str] = &["dt", "coord"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convert {
    Verbatim,
    /// Named fields of an object are unix timestamps to render as RFC 3339 UTC strings.
    UnixTimes(&'static [&'static str]),
}

#[derive(Debug)]
struct FieldMapping {
    upstream: &'static str,
    output: &'static str,
    convert: Convert,
}

const fn mapping(upstream: &'static str, output: &'static str, convert: Convert) -> FieldMapping {
    FieldMapping {
        upstream,
        output,
        convert,
    }
}

const FIELD_MAPPINGS: &[FieldMapping] = &[
    mapping("weather", "weather", Convert::Verbatim),
    mapping("main", "main", Convert::Verbatim),
    mapping("wind", "wind", Convert::Verbatim),
    mapping("rain", "rain", Convert::Verbatim),
    mapping("snow", "snow", Convert::Verbatim),
    mapping("clouds", "clouds", Convert::Verbatim),
    mapping("sys", "sys", Convert::UnixTimes(&["sunrise", "sunset"])),
    mapping("visibility", "visibility", Convert::Verbatim),
    mapping("name", "city_name", Convert::Verbatim),
    mapping("timezone", "timezone_offset", Convert::Verbatim),
    mapping("id", "city_id", Convert::Verbatim),
    mapping("base", "base", Convert::Verbatim),
];

/// A normalized weather reading ready for downstream ingestion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Observation {
    pub source: SourceId,
    pub source_name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub subtype: String,
    pub recorded_at: DateTime<Utc>,
    pub location: GeoPoint,
    pub additional: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Transformer {
    layout: AdditionalLayout,
}

impl Transformer {
    pub fn new(layout: AdditionalLayout) -> Self {
        Transformer { layout }
    }

    /// Build an observation from `payload`, or `None` if the payload isn't a non-empty
    /// object with an integer `dt` timestamp.
    ///
    /// The output depends only on the arguments, transforming the same payload twice
    /// yields identical observations.
    pub fn transform(&self, payload: &Value, location: &Location) -> Option<Observation> {
        let fields = payload.as_object().filter(|o| !o.is_empty())?;
        let recorded_at = fields.get("dt").and_then(unix_timestamp)?;

        let mut additional = Map::new();
        for (key, value) in fields {
            if CONSUMED_FIELDS.contains(&key.as_str()) {
                continue;
            }

            let (output, convert) = FIELD_MAPPINGS
                .iter()
                .find(|m| m.upstream == key.as_str())
                .map(|m| (m.output, m.convert))
                .unwrap_or((key.as_str(), Convert::Verbatim));

            if let Some(v) = convert_value(value, convert) {
                self.insert(&mut additional, output, v);
            }
        }

        Some(Observation {
            source: location.source_id(),
            source_name: location.name.clone(),
            type_: OBSERVATION_TYPE.to_owned(),
            subtype: OBSERVATION_SUBTYPE.to_owned(),
            recorded_at,
            location: location.point(),
            additional,
        })
    }

    fn insert(&self, additional: &mut Map<String, Value>, key: &str, value: Value) {
        match (self.layout, value) {
            (AdditionalLayout::Flattened, Value::Object(fields)) => {
                for (k, v) in fields {
                    additional.insert(format!("{}_{}", key, k), v);
                }
            }
            (_, v) => {
                additional.insert(key.to_owned(), v);
            }
        }
    }
}

/// Transform using the default (nested) layout of `additional`.
pub fn transform(payload: &Value, location: &Location) -> Option<Observation> {
    Transformer::default().transform(payload, location)
}

fn unix_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn convert_value(value: &Value, convert: Convert) -> Option<Value> {
    let mut value = without_nulls(value)?;
    if let (Convert::UnixTimes(names), Value::Object(fields)) = (convert, &mut value) {
        for name in names {
            let ts = fields.get(*name).and_then(unix_timestamp);
            if let Some(ts) = ts {
                fields.insert(
                    (*name).to_owned(),
                    Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
            }
        }
    }

    Some(value)
}

/// Copy of `value` with nulls removed from objects and lists, `None` if nothing is left.
fn without_nulls(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let pruned: Vec<Value> = items.iter().filter_map(without_nulls).collect();

            if pruned.is_empty() {
                None
            } else {
                Some(Value::Array(pruned))
            }
        }
        Value::Object(fields) => {
            let pruned: Map<String, Value> = fields
                .iter()
                .filter_map(|(k, v)| without_nulls(v).map(|v| (k.clone(), v)))
                .collect();

            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        v => Some(v.clone()),
    }
}
