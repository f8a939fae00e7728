use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use relaydesk_protocol::HostInfo;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Hosts currently reachable through the relay, keyed by host id.
#[derive(Default)]
pub(crate) struct AvailableHosts {
    hosts: HashMap<String, AnnouncedHost>,
}

struct AnnouncedHost {
    info: HostInfo,
    last_seen: Instant,
}

impl AvailableHosts {
    /// Insert or refresh a host announcement. Returns true if the host is new.
    pub(crate) fn announce(&mut self, info: HostInfo, now: Instant) -> bool {
        let id = info.id.clone();
        let is_new = self
            .hosts
            .insert(id.clone(), AnnouncedHost { info, last_seen: now })
            .is_none();
        debug!(host_id = %id, is_new, "Host announced");
        is_new
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<HostInfo> {
        self.hosts.remove(id).map(|h| h.info)
    }

    /// Drop hosts not re-announced within `max_age`. Returns removed ids.
    pub(crate) fn sweep_stale(&mut self, now: Instant, max_age: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, h)| now.saturating_duration_since(h.last_seen) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.hosts.remove(id);
            debug!(host_id = %id, "Discovered host went stale");
        }
        stale
    }

    pub(crate) fn get(&self, id: &str) -> Option<&HostInfo> {
        self.hosts.get(id).map(|h| &h.info)
    }

    /// Hosts sorted by display name, then id.
    pub(crate) fn list(&self) -> Vec<&HostInfo> {
        let mut hosts: Vec<&HostInfo> = self.hosts.values().map(|h| &h.info).collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        hosts
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.hosts.len()
    }
}

/// A host the viewer can reconnect to with a password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SavedHost {
    pub host_id: String,
    pub machine_id: String,
    pub name: String,
    pub last_connected: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt saved hosts file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode saved hosts: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Removal awaiting user confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingRemoval {
    pub machine_id: String,
    pub name: String,
}

/// Saved hosts persisted as a JSON array, keyed by machine id.
pub(crate) struct SavedHostStore {
    path: PathBuf,
    hosts: Vec<SavedHost>,
}

impl SavedHostStore {
    /// Default location under the platform data directory.
    pub(crate) fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("relaydesk")
            .join("saved_hosts.json")
    }

    /// Load the store. A missing file is an empty store.
    pub(crate) fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let hosts = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        info!(path = %path.display(), count = hosts.len(), "Loaded saved hosts");
        Ok(Self { path, hosts })
    }

    /// Load, falling back to an empty store (kept at the same path) when the
    /// file is unreadable or corrupt.
    pub(crate) fn load_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                warn!("{e}; starting with no saved hosts");
                Self {
                    path,
                    hosts: Vec::new(),
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub(crate) fn list(&self) -> &[SavedHost] {
        &self.hosts
    }

    pub(crate) fn get(&self, machine_id: &str) -> Option<&SavedHost> {
        self.hosts.iter().find(|h| h.machine_id == machine_id)
    }

    /// Insert or update in place by machine id, then persist.
    pub(crate) fn upsert(&mut self, host: SavedHost) -> Result<(), StoreError> {
        match self.hosts.iter_mut().find(|h| h.machine_id == host.machine_id) {
            Some(existing) => *existing = host,
            None => self.hosts.push(host),
        }
        self.persist()
    }

    /// Refresh `last_connected` for a known machine. No-op for unknown ids.
    pub(crate) fn touch(&mut self, machine_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(host) = self.hosts.iter_mut().find(|h| h.machine_id == machine_id) else {
            return Ok(false);
        };
        host.last_connected = at;
        self.persist()?;
        Ok(true)
    }

    /// First step of deletion; nothing is removed until [`Self::confirm_removal`].
    pub(crate) fn request_removal(&self, machine_id: &str) -> Option<PendingRemoval> {
        self.get(machine_id).map(|h| PendingRemoval {
            machine_id: h.machine_id.clone(),
            name: h.name.clone(),
        })
    }

    pub(crate) fn confirm_removal(&mut self, pending: PendingRemoval) -> Result<bool, StoreError> {
        let before = self.hosts.len();
        self.hosts.retain(|h| h.machine_id != pending.machine_id);
        if self.hosts.len() == before {
            return Ok(false);
        }
        self.persist()?;
        info!(machine_id = %pending.machine_id, "Saved host removed");
        Ok(true)
    }

    fn persist(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(&self.hosts).map_err(StoreError::Encode)?;
        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| StoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}
