//! Volume management

use crate::error::{MusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A materialized volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Directory the volume lives in
    pub mountpoint: PathBuf,
    /// Whether the mountpoint is a user-supplied device path
    pub device: bool,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Services currently attached
    pub services: BTreeSet<String>,
}

impl Volume {
    /// Create a managed volume under `base_path`
    pub fn new(name: &str, base_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            mountpoint: base_path.join(name),
            device: false,
            created_at: Utc::now(),
            services: BTreeSet::new(),
        }
    }

    /// Create a volume backed by a host device path
    pub fn with_device(name: &str, device: &Path) -> Self {
        Self {
            name: name.to_string(),
            mountpoint: device.to_path_buf(),
            device: true,
            created_at: Utc::now(),
            services: BTreeSet::new(),
        }
    }
}

/// Project volume store, rooted at `<project>/.muster/volumes`
pub struct VolumeStore {
    /// Volumes indexed by name
    volumes: Arc<RwLock<HashMap<String, Volume>>>,
    /// Base path for managed volumes
    base_path: PathBuf,
}

impl VolumeStore {
    /// Open the store, picking up volumes left by earlier runs
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;

        let mut volumes = HashMap::new();
        for entry in std::fs::read_dir(&base_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                volumes.insert(name.clone(), Volume::new(&name, &base_path));
            }
        }

        Ok(Self {
            volumes: Arc::new(RwLock::new(volumes)),
            base_path,
        })
    }

    /// Base path for managed volumes
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Return the named volume, creating its directory if needed.
    ///
    /// With a `device`, the device path backs the volume and is created when
    /// missing.
    pub fn ensure(&self, name: &str, device: Option<&Path>) -> Result<Volume> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| MusterError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes.entry(name.to_string()).or_insert_with(|| match device {
            Some(device) => Volume::with_device(name, device),
            None => Volume::new(name, &self.base_path),
        });

        if !volume.mountpoint.exists() {
            tracing::debug!("Creating volume {} at {}", name, volume.mountpoint.display());
            std::fs::create_dir_all(&volume.mountpoint)?;
        }

        Ok(volume.clone())
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Option<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| MusterError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes.get(name).cloned())
    }

    /// List all volumes
    pub fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| MusterError::Lock("Failed to acquire read lock".to_string()))?;

        let mut list: Vec<Volume> = volumes.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Record that `service` mounts `name`
    pub fn attach(&self, name: &str, service: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| MusterError::Lock("Failed to acquire write lock".to_string()))?;

        if let Some(volume) = volumes.get_mut(name) {
            volume.services.insert(service.to_string());
        }
        Ok(())
    }

    /// Forget every attachment of `service`
    pub fn detach_service(&self, service: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| MusterError::Lock("Failed to acquire write lock".to_string()))?;

        for volume in volumes.values_mut() {
            volume.services.remove(service);
        }
        Ok(())
    }

    /// Remove a managed volume. Device-backed volumes keep their data.
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| MusterError::Lock("Failed to acquire write lock".to_string()))?;

        let Some(volume) = volumes.get(name) else {
            return Ok(());
        };

        if !volume.services.is_empty() && !force {
            return Err(MusterError::Start {
                service: volume.services.iter().cloned().collect::<Vec<_>>().join(","),
                message: format!("volume {} is in use", name),
            });
        }

        if !volume.device && volume.mountpoint.exists() {
            std::fs::remove_dir_all(&volume.mountpoint)?;
        }

        volumes.remove(name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_creates_managed_volume() {
        let temp = tempdir().unwrap();
        let store = VolumeStore::new(temp.path().join("volumes")).unwrap();

        let volume = store.ensure("pgdata", None).unwrap();
        assert_eq!(volume.name, "pgdata");
        assert!(volume.mountpoint.exists());
        assert!(volume.mountpoint.starts_with(store.base_path()));

        let again = store.ensure("pgdata", None).unwrap();
        assert_eq!(again.mountpoint, volume.mountpoint);
    }

    #[test]
    fn test_device_volume_keeps_data_on_remove() {
        let temp = tempdir().unwrap();
        let store = VolumeStore::new(temp.path().join("volumes")).unwrap();
        let device = temp.path().join("static");

        let volume = store.ensure("static_volume", Some(&device)).unwrap();
        assert_eq!(volume.mountpoint, device);
        assert!(device.exists());

        store.remove("static_volume", false).unwrap();
        assert!(device.exists());
        assert!(store.get("static_volume").unwrap().is_none());
    }

    #[test]
    fn test_attached_volume_is_not_removed() {
        let temp = tempdir().unwrap();
        let store = VolumeStore::new(temp.path().to_path_buf()).unwrap();

        store.ensure("data", None).unwrap();
        store.attach("data", "db").unwrap();
        assert!(store.remove("data", false).is_err());

        store.detach_service("db").unwrap();
        store.remove("data", false).unwrap();
        assert!(!temp.path().join("data").exists());
    }

    #[test]
    fn test_reopen_finds_existing_volumes() {
        let temp = tempdir().unwrap();
        {
            let store = VolumeStore::new(temp.path().to_path_buf()).unwrap();
            store.ensure("cache", None).unwrap();
        }
        let store = VolumeStore::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
