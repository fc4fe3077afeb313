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

use crate::source::SourceId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub enum StateError {
    Io(io::Error),
    Serialization(serde_json::Error),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "state store i/o: {}", e),
            Self::Serialization(e) => write!(f, "state store serialization: {}", e),
        }
    }
}

impl error::Error for StateError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serialization(e) => Some(e),
        }
    }
}

/// Last delivered reading for a source.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceState {
    pub latest_timestamp: DateTime<Utc>,
}

/// Identifies state owned by one source of one action of one integration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub integration_id: String,
    pub action_id: String,
    pub source_id: String,
}

impl StateKey {
    pub fn new(integration_id: &str, action_id: &str, source_id: &str) -> Self {
        StateKey {
            integration_id: integration_id.to_owned(),
            action_id: action_id.to_owned(),
            source_id: source_id.to_owned(),
        }
    }
}

/// Persisted per-source state. Writes to a single key are expected to come from one run
/// at a time so implementations only need single-key atomicity.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
    ) -> Result<Option<SourceState>, StateError>;

    async fn set_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
        state: SourceState,
    ) -> Result<(), StateError>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<StateKey, SourceState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
    ) -> Result<Option<SourceState>, StateError> {
        let key = StateKey::new(integration_id, action_id, source_id);
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&key).copied())
    }

    async fn set_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
        state: SourceState,
    ) -> Result<(), StateError> {
        let key = StateKey::new(integration_id, action_id, source_id);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, state);
        Ok(())
    }
}

/// State kept in a JSON file, rewritten in full on every update.
///
/// The file holds a list of entries, each carrying the integration, action and source ids
/// as separate fields. It's written to a temporary sibling and renamed into place so a
/// crash mid-write leaves the previous state intact.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<BTreeMap<StateKey, SourceState>>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    #[serde(flatten)]
    key: StateKey,
    #[serde(flatten)]
    state: SourceState,
}

fn to_entries(entries: &BTreeMap<StateKey, SourceState>) -> Vec<StoredEntry> {
    entries
        .iter()
        .map(|(key, state)| StoredEntry {
            key: key.clone(),
            state: *state,
        })
        .collect()
}

impl FileStateStore {
    /// Open the store at `path`, starting empty if the file doesn't exist yet.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let path = path.as_ref().to_owned();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<StoredEntry>>(&bytes)
                .map_err(StateError::Serialization)?
                .into_iter()
                .map(|e| (e.key, e.state))
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StateError::Io(e)),
        };

        Ok(FileStateStore {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
    ) -> Result<Option<SourceState>, StateError> {
        let key = StateKey::new(integration_id, action_id, source_id);
        Ok(self.entries.lock().await.get(&key).copied())
    }

    async fn set_state(
        &self,
        integration_id: &str,
        action_id: &str,
        source_id: &str,
        state: SourceState,
    ) -> Result<(), StateError> {
        let key = StateKey::new(integration_id, action_id, source_id);
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.clone(), state);

        let res = async {
            let bytes = serde_json::to_vec_pretty(&to_entries(&entries)).map_err(StateError::Serialization)?;
            let tmp = self.path.with_extension("tmp");
            tokio::fs::write(&tmp, &bytes).await.map_err(StateError::Io)?;
            tokio::fs::rename(&tmp, &self.path).await.map_err(StateError::Io)
        }
        .await;

        if res.is_err() {
            // Keep memory consistent with what's on disk
            match previous {
                Some(p) => entries.insert(key, p),
                None => entries.remove(&key),
            };
        }

        res
    }
}

/// Suppresses readings that are not newer than the last one delivered for their source.
pub struct StalenessFilter<'a> {
    store: &'a dyn StateStore,
    integration_id: &'a str,
    action_id: &'a str,
}

impl<'a> StalenessFilter<'a> {
    pub fn new(store: &'a dyn StateStore, integration_id: &'a str, action_id: &'a str) -> Self {
        StalenessFilter {
            store,
            integration_id,
            action_id,
        }
    }

    /// `true` when there's no prior state for the source or `recorded_at` is strictly
    /// newer than the last delivered reading. Equal timestamps are re-deliveries of the
    /// same reading and are suppressed.
    pub async fn should_emit(&self, source: &SourceId, recorded_at: DateTime<Utc>) -> Result<bool, StateError> {
        let prior = self
            .store
            .get_state(self.integration_id, self.action_id, source.as_str())
            .await?;

        Ok(match prior {
            None => true,
            Some(s) => recorded_at > s.latest_timestamp,
        })
    }

    /// Remember `recorded_at` as delivered. Call only after the downstream send succeeded.
    pub async fn record(&self, source: &SourceId, recorded_at: DateTime<Utc>) -> Result<(), StateError> {
        self.store
            .set_state(
                self.integration_id,
                self.action_id,
                source.as_str(),
                SourceState {
                    latest_timestamp: recorded_at,
                },
            )
            .await
    }
}
