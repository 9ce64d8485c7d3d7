use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use mesh_core::MeshError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Manifest entry for one firmware image on disk (spec §4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareManifestEntry {
    pub firmware_id: String,
    pub version: String,
    pub device_type: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    firmware: BTreeMap<String, FirmwareManifestEntry>,
}

/// `firmware_dir/{firmware_id}.bin` images plus a JSON manifest. Chunks
/// are read from disk on demand — a firmware image is never buffered in
/// full in memory.
pub struct FirmwareStore {
    dir: PathBuf,
    manifest_path: PathBuf,
    manifest: BTreeMap<String, FirmwareManifestEntry>,
}

impl FirmwareStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MeshError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| MeshError::Io(err.to_string()))?;
        let manifest_path = dir.join("manifest.json");
        let manifest: ManifestFile = mesh_core::load_json_or_default(&manifest_path)?;
        Ok(Self { dir, manifest_path, manifest: manifest.firmware })
    }

    /// Writes `bytes` to `{firmware_id}.bin`, computes its SHA-256, and
    /// records the manifest entry.
    pub fn add_firmware(&mut self, firmware_id: &str, version: &str, device_type: &str, bytes: &[u8]) -> Result<(), MeshError> {
        let path = self.dir.join(format!("{firmware_id}.bin"));
        fs::write(&path, bytes).map_err(|err| MeshError::Io(err.to_string()))?;
        let sha256 = hex::encode(Sha256::digest(bytes));
        self.manifest.insert(
            firmware_id.to_string(),
            FirmwareManifestEntry {
                firmware_id: firmware_id.to_string(),
                version: version.to_string(),
                device_type: device_type.to_string(),
                size: bytes.len() as u64,
                sha256,
            },
        );
        mesh_core::save_json_atomic(&self.manifest_path, &ManifestFile { firmware: self.manifest.clone() })
    }

    pub fn manifest(&self, firmware_id: &str) -> Option<&FirmwareManifestEntry> {
        self.manifest.get(firmware_id)
    }

    /// Reads up to `size` bytes starting at `offset` from the firmware
    /// image, without loading the rest of the file.
    pub fn read_chunk(&self, firmware_id: &str, offset: u64, size: usize) -> Result<Vec<u8>, MeshError> {
        let path = self.dir.join(format!("{firmware_id}.bin"));
        let mut file = File::open(&path).map_err(|err| MeshError::Io(err.to_string()))?;
        file.seek(SeekFrom::Start(offset)).map_err(|err| MeshError::Io(err.to_string()))?;
        let mut buf = vec![0u8; size];
        let read = file.read(&mut buf).map_err(|err| MeshError::Io(err.to_string()))?;
        buf.truncate(read);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_firmware_writes_bytes_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FirmwareStore::open(dir.path()).unwrap();
        store.add_firmware("fw-1", "1.0.0", "esp32", b"binary-data").unwrap();
        let entry = store.manifest("fw-1").unwrap();
        assert_eq!(entry.size, 11);
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(b"binary-data")));
    }

    #[test]
    fn read_chunk_reads_from_arbitrary_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FirmwareStore::open(dir.path()).unwrap();
        store.add_firmware("fw-1", "1.0.0", "esp32", b"0123456789").unwrap();
        let chunk = store.read_chunk("fw-1", 3, 4).unwrap();
        assert_eq!(chunk, b"3456");
        let tail = store.read_chunk("fw-1", 8, 10).unwrap();
        assert_eq!(tail, b"89");
    }

    #[test]
    fn manifest_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FirmwareStore::open(dir.path()).unwrap();
            store.add_firmware("fw-1", "1.0.0", "esp32", b"data").unwrap();
        }
        let reloaded = FirmwareStore::open(dir.path()).unwrap();
        assert!(reloaded.manifest("fw-1").is_some());
    }
}
