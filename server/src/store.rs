//! Persistence seam: roster, access control and the abstract store.
//!
//! The real persistence engine is an external collaborator; the server
//! only talks to the narrow [`UniverseStore`] query interface. The store
//! is written exclusively from the drain loop and scheduled maintenance;
//! other threads read slightly stale display snapshots.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use shared::payload::VersionedBlob;
use uuid::Uuid;

use crate::error::{Result, ServerError};

/// Persisted name ↔ token ↔ numeric-id mapping entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub token: Uuid,
    pub player_id: i32,
}

/// In-memory roster resolved against during handshake.
#[derive(Debug, Default)]
pub struct Roster {
    entries: Vec<RosterEntry>,
    next_player_id: i32,
}

impl Roster {
    pub fn from_entries(entries: Vec<RosterEntry>) -> Self {
        let next_player_id = entries.iter().map(|e| e.player_id + 1).max().unwrap_or(1);
        Self {
            entries,
            next_player_id,
        }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    /// Resolves a (name, token) pair to a numeric player id. A known
    /// token may rename itself; a known name presented with a different
    /// token is refused; a first-time token gets a fresh roster entry.
    pub fn resolve(&mut self, name: &str, token: &Uuid) -> std::result::Result<i32, String> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.token == *token) {
            if entry.name != name {
                entry.name = name.to_string();
            }
            return Ok(entry.player_id);
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err("username registered to another identifier".into());
        }
        let player_id = if self.next_player_id == 0 {
            1
        } else {
            self.next_player_id
        };
        self.next_player_id = player_id + 1;
        self.entries.push(RosterEntry {
            name: name.to_string(),
            token: *token,
            player_id,
        });
        Ok(player_id)
    }
}

/// Ban list and whitelist, persisted through the store as one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControl {
    banned_names: HashSet<String>,
    banned_tokens: HashSet<Uuid>,
    whitelist: HashSet<String>,
}

impl AccessControl {
    pub fn is_banned(&self, name: &str, token: &Uuid) -> bool {
        self.banned_names.contains(name) || self.banned_tokens.contains(token)
    }

    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.whitelist.contains(name)
    }

    pub fn ban_name(&mut self, name: &str) {
        self.banned_names.insert(name.to_string());
    }

    pub fn ban_token(&mut self, token: Uuid) {
        self.banned_tokens.insert(token);
    }

    pub fn add_whitelist(&mut self, name: &str) {
        self.whitelist.insert(name.to_string());
    }
}

/// Narrow query interface over the external transactional store. All
/// writes happen from the drain loop and scheduled maintenance tasks.
pub trait UniverseStore: Send + Sync {
    fn load_roster(&mut self) -> Result<Vec<RosterEntry>>;
    fn save_roster(&mut self, entries: &[RosterEntry]) -> Result<()>;
    fn load_access(&mut self) -> Result<AccessControl>;
    fn save_access(&mut self, access: &AccessControl) -> Result<()>;
    fn save_object(&mut self, id: Uuid, blob: &VersionedBlob) -> Result<()>;
    fn delete_object(&mut self, id: Uuid) -> Result<()>;
    fn save_craft(&mut self, owner: i32, name: &str, blob: &VersionedBlob) -> Result<()>;
    /// Commits buffered writes as one transaction.
    fn flush(&mut self) -> Result<()>;
}

/// Store implementation holding everything at rest as serialized bytes,
/// the way a real backing engine would receive them.
#[derive(Default)]
pub struct MemoryStore {
    roster: Vec<u8>,
    access: Vec<u8>,
    objects: HashMap<Uuid, Vec<u8>>,
    crafts: HashMap<(i32, String), Vec<u8>>,
    pub flushes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

fn storage_err(err: impl std::fmt::Display) -> ServerError {
    ServerError::Storage(err.to_string())
}

impl UniverseStore for MemoryStore {
    fn load_roster(&mut self) -> Result<Vec<RosterEntry>> {
        if self.roster.is_empty() {
            return Ok(Vec::new());
        }
        bincode::deserialize(&self.roster).map_err(storage_err)
    }

    fn save_roster(&mut self, entries: &[RosterEntry]) -> Result<()> {
        self.roster = bincode::serialize(entries).map_err(storage_err)?;
        Ok(())
    }

    fn load_access(&mut self) -> Result<AccessControl> {
        if self.access.is_empty() {
            return Ok(AccessControl::default());
        }
        bincode::deserialize(&self.access).map_err(storage_err)
    }

    fn save_access(&mut self, access: &AccessControl) -> Result<()> {
        self.access = bincode::serialize(access).map_err(storage_err)?;
        Ok(())
    }

    fn save_object(&mut self, id: Uuid, blob: &VersionedBlob) -> Result<()> {
        let bytes = bincode::serialize(blob).map_err(storage_err)?;
        self.objects.insert(id, bytes);
        Ok(())
    }

    fn delete_object(&mut self, id: Uuid) -> Result<()> {
        self.objects.remove(&id);
        Ok(())
    }

    fn save_craft(&mut self, owner: i32, name: &str, blob: &VersionedBlob) -> Result<()> {
        let bytes = bincode::serialize(blob).map_err(storage_err)?;
        self.crafts.insert((owner, name.to_string()), bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
