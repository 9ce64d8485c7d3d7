use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mesh_core::{load_json_or_default, save_json_atomic, MeshError};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// One enrolled node's pre-shared key record (spec §4.3). The PSK is never
/// surfaced through [`KeyStore::list`]; only [`KeyStore::get`] returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    psk: String,
    name: String,
    enrolled_at: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyStoreFile {
    #[serde(default)]
    keys: BTreeMap<String, KeyRecord>,
}

/// Summary row returned by [`KeyStore::list`]: node id, display name, and
/// enrollment timestamp, with the PSK itself withheld.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyStoreEntry {
    pub node_id: String,
    pub name: String,
    pub enrolled_at: f64,
}

/// Persists pre-shared keys for every enrolled node at a single JSON file
/// path with owner-only permissions (spec §4.3).
///
/// Not internally synchronized: the mesh channel is documented as the sole
/// writer, so no lock is taken here.
pub struct KeyStore {
    path: PathBuf,
    file: KeyStoreFile,
}

impl KeyStore {
    /// Loads `path` if present, otherwise starts with an empty store. A
    /// missing file is the normal first-run state, not an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref().to_path_buf();
        let file = load_json_or_default(&path)?;
        Ok(Self { path, file })
    }

    /// Atomically persists the current contents to disk with 0600
    /// permissions.
    pub fn save(&self) -> Result<(), MeshError> {
        save_json_atomic(&self.path, &self.file)
    }

    /// Generates a fresh random 32-byte PSK for `node_id`, records it, and
    /// persists the store. Re-adding an already-enrolled `node_id`
    /// **rotates** its key; the old PSK is discarded.
    pub fn add(&mut self, node_id: &str, display_name: &str, now: f64) -> Result<String, MeshError> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let psk = hex::encode(raw);
        self.file.keys.insert(
            node_id.to_string(),
            KeyRecord { psk: psk.clone(), name: display_name.to_string(), enrolled_at: now },
        );
        self.save()?;
        Ok(psk)
    }

    /// Removes `node_id`'s key, if any, and persists the change.
    pub fn remove(&mut self, node_id: &str) -> Result<(), MeshError> {
        self.file.keys.remove(node_id);
        self.save()
    }

    pub fn get(&self, node_id: &str) -> Option<&str> {
        self.file.keys.get(node_id).map(|r| r.psk.as_str())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.file.keys.contains_key(node_id)
    }

    /// Enrolled nodes without exposing any PSK.
    pub fn list(&self) -> Vec<KeyStoreEntry> {
        self.file
            .keys
            .iter()
            .map(|(node_id, record)| KeyStoreEntry {
                node_id: node_id.clone(),
                name: record.name.clone(),
                enrolled_at: record.enrolled_at,
            })
            .collect()
    }
}
