//! Durable per-conversation resume storage
//!
//! Key space:
//! - `resume_index::{conversation}`: next event index to request
//! - `resume_snapshot::{conversation}`: serialized [`TurnSnapshot`]
//! - `resume_owner::{conversation}`: single-writer lease

use crate::assembler::TurnSnapshot;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Minimal string key/value storage
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-process storage; survives reconnects but not restarts
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Get the default resume directory
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("resume")
    }

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .replace("::", "__")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    owner: String,
    renewed_at: DateTime<Utc>,
}

fn index_key(conversation_id: &str) -> String {
    format!("resume_index::{}", conversation_id)
}

fn snapshot_key(conversation_id: &str) -> String {
    format!("resume_snapshot::{}", conversation_id)
}

fn owner_key(conversation_id: &str) -> String {
    format!("resume_owner::{}", conversation_id)
}

/// Typed access to resume state, plus the single-writer lease
#[derive(Clone)]
pub struct ResumeStorage {
    store: Arc<dyn KeyValueStore>,
    owner: String,
    lease_ttl: Duration,
}

impl ResumeStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, lease_ttl: Duration) -> Self {
        Self {
            store,
            owner: uuid::Uuid::new_v4().to_string(),
            lease_ttl,
        }
    }

    /// Identifier this client uses for leases
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn load_index(&self, conversation_id: &str) -> Result<Option<u64>> {
        match self.store.get(&index_key(conversation_id))? {
            Some(raw) => Ok(raw.trim().parse().ok()),
            None => Ok(None),
        }
    }

    /// Persist the next index and renew our lease
    pub fn save_index(&self, conversation_id: &str, index: u64) -> Result<()> {
        self.renew(conversation_id)?;
        self.store.put(&index_key(conversation_id), &index.to_string())
    }

    /// Load the snapshot; an unreadable snapshot is treated as absent
    pub fn load_snapshot(&self, conversation_id: &str) -> Result<Option<TurnSnapshot>> {
        let Some(raw) = self.store.get(&snapshot_key(conversation_id))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!("Discarding unreadable resume snapshot: {}", e);
                Ok(None)
            }
        }
    }

    /// Persist the snapshot and renew our lease
    pub fn save_snapshot(&self, conversation_id: &str, snapshot: &TurnSnapshot) -> Result<()> {
        let raw = serde_json::to_string(snapshot)?;
        self.renew(conversation_id)?;
        self.store.put(&snapshot_key(conversation_id), &raw)
    }

    /// Drop all resume state for the conversation
    pub fn clear(&self, conversation_id: &str) -> Result<()> {
        self.store.remove(&index_key(conversation_id))?;
        self.store.remove(&snapshot_key(conversation_id))?;
        self.release(conversation_id)
    }

    /// Take the stream lease, unless another live owner holds it
    pub fn claim(&self, conversation_id: &str) -> Result<()> {
        self.claim_at(conversation_id, Utc::now())
    }

    pub fn claim_at(&self, conversation_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(lease) = self.read_lease(conversation_id)? {
            let stale = (now - lease.renewed_at)
                .to_std()
                .map(|age| age > self.lease_ttl)
                .unwrap_or(false);
            if lease.owner != self.owner && !stale {
                return Err(Error::LeaseHeld { owner: lease.owner });
            }
        }
        self.write_lease(conversation_id, now)
    }

    /// Extend our lease. Fails with `LeaseHeld` once another client has
    /// claimed it, however stale its own lease has since become.
    pub fn renew(&self, conversation_id: &str) -> Result<()> {
        self.renew_at(conversation_id, Utc::now())
    }

    pub fn renew_at(&self, conversation_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(lease) = self.read_lease(conversation_id)? {
            if lease.owner != self.owner {
                return Err(Error::LeaseHeld { owner: lease.owner });
            }
        }
        self.write_lease(conversation_id, now)
    }

    /// Give up the lease if we hold it
    pub fn release(&self, conversation_id: &str) -> Result<()> {
        match self.read_lease(conversation_id)? {
            Some(lease) if lease.owner == self.owner => {
                self.store.remove(&owner_key(conversation_id))
            }
            _ => Ok(()),
        }
    }

    fn read_lease(&self, conversation_id: &str) -> Result<Option<Lease>> {
        match self.store.get(&owner_key(conversation_id))? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    fn write_lease(&self, conversation_id: &str, now: DateTime<Utc>) -> Result<()> {
        let lease = Lease {
            owner: self.owner.clone(),
            renewed_at: now,
        };
        self.store
            .put(&owner_key(conversation_id), &serde_json::to_string(&lease)?)
    }
}
