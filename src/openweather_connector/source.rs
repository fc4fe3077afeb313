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

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const SOURCE_ID_PREFIX: &str = "openweather_";
const MICRODEGREES: f64 = 1_000_000.0;

/// A named point that weather readings are fetched for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Location {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new<S: Into<String>>(name: S, lat: f64, lon: f64) -> Self {
        Location {
            name: name.into(),
            lat,
            lon,
        }
    }

    /// Stable identity of this location, derived from its coordinates only.
    pub fn source_id(&self) -> SourceId {
        generate_source_id(self.lat, self.lon)
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

/// Derive the source identifier for a pair of coordinates.
///
/// Coordinates are rounded to six decimal places and rendered as whole micro-degrees
/// before hashing so that equivalent floating point values (`0.0` and `-0.0`, or values
/// that only differ past the sixth decimal place) produce the same identifier. The result
/// keeps the first 128 bits of the SHA-256 digest of that canonical form.
///
/// Coordinates are expected to be finite and in range, see `config::PullConfig::validate`.
pub fn generate_source_id(lat: f64, lon: f64) -> SourceId {
    let canonical = format!("{},{}", microdegrees(lat), microdegrees(lon));
    let digest = Sha256::digest(canonical.as_bytes());
    SourceId(format!("{}{}", SOURCE_ID_PREFIX, hex::encode(&digest[..16])))
}

fn microdegrees(v: f64) -> i64 {
    // `as` saturates and maps NaN to zero so this never panics
    (v * MICRODEGREES).round() as i64
}
