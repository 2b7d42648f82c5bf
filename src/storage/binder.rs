//! Network and volume binding
//!
//! Resolves a service's declared mounts and networks against the manifest and
//! the volume store before the service leaves `pending`. Failures here are
//! contained to the one service being bound.

use super::volume::VolumeStore;
use crate::error::{MusterError, Result};
use crate::manifest::{Manifest, MountKind, Service};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A concrete mount handed to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundMount {
    /// Host directory, `None` for tmpfs
    pub source: Option<PathBuf>,
    /// Path inside the service
    pub target: String,
    /// Mounted read only
    pub read_only: bool,
}

/// Concrete resources for one service instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Binding {
    /// Mounts
    pub mounts: Vec<BoundMount>,
    /// Resolved network names
    pub networks: Vec<String>,
}

/// Binds services to volumes and networks
#[derive(Clone)]
pub struct Binder {
    manifest: Arc<Manifest>,
    store: Arc<VolumeStore>,
    /// Anonymous volumes created per service, removed on release
    anonymous: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl Binder {
    /// Create a binder over a manifest and volume store
    pub fn new(manifest: Arc<Manifest>, store: Arc<VolumeStore>) -> Self {
        Self {
            manifest,
            store,
            anonymous: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Volume store
    pub fn store(&self) -> &Arc<VolumeStore> {
        &self.store
    }

    /// Resolve every mount and network of `service`.
    pub fn bind(&self, service: &Service) -> Result<Binding> {
        let mut binding = Binding::default();

        for network in &service.networks {
            let decl = self.manifest.networks.get(network).ok_or_else(|| {
                MusterError::UnboundResource {
                    service: service.name.clone(),
                    kind: "network",
                    name: network.clone(),
                }
            })?;
            binding.networks.push(decl.name.clone());
        }

        for mount in &service.mounts {
            let source = match &mount.kind {
                MountKind::Volume { name } => {
                    let decl = self.manifest.volumes.get(name).ok_or_else(|| {
                        MusterError::UnboundResource {
                            service: service.name.clone(),
                            kind: "volume",
                            name: name.clone(),
                        }
                    })?;
                    let volume = if decl.external {
                        self.store.get(&decl.name)?.ok_or_else(|| MusterError::Start {
                            service: service.name.clone(),
                            message: format!("external volume '{}' does not exist", decl.name),
                        })?
                    } else {
                        self.store
                            .ensure(&decl.name, decl.device.as_deref())
                            .map_err(|e| start_error(service, e))?
                    };
                    self.store.attach(&volume.name, &service.name)?;
                    Some(volume.mountpoint)
                }
                MountKind::Bind {
                    source,
                    create_host_path,
                } => {
                    if !source.exists() {
                        if !*create_host_path {
                            return Err(MusterError::Start {
                                service: service.name.clone(),
                                message: format!(
                                    "bind source {} does not exist",
                                    source.display()
                                ),
                            });
                        }
                        tracing::debug!("Creating bind source {}", source.display());
                        std::fs::create_dir_all(source).map_err(|e| start_error(service, e.into()))?;
                    }
                    Some(source.clone())
                }
                MountKind::Anonymous => {
                    let name = format!(
                        "{}_{}",
                        service.name,
                        &Uuid::new_v4().simple().to_string()[..12]
                    );
                    let volume = self
                        .store
                        .ensure(&name, None)
                        .map_err(|e| start_error(service, e))?;
                    self.store.attach(&volume.name, &service.name)?;
                    self.anonymous()?
                        .entry(service.name.clone())
                        .or_default()
                        .push(volume.name.clone());
                    Some(volume.mountpoint)
                }
                MountKind::Tmpfs => None,
            };

            binding.mounts.push(BoundMount {
                source,
                target: mount.target.clone(),
                read_only: mount.read_only,
            });
        }

        Ok(binding)
    }

    /// Release the store attachments of `service` and drop its anonymous
    /// volumes.
    pub fn release(&self, service: &str) -> Result<()> {
        self.store.detach_service(service)?;
        let created = self.anonymous()?.remove(service).unwrap_or_default();
        for name in created {
            tracing::debug!("Removing anonymous volume {}", name);
            self.store.remove(&name, false)?;
        }
        Ok(())
    }

    fn anonymous(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<String>>>> {
        self.anonymous
            .lock()
            .map_err(|_| MusterError::Lock("Failed to acquire anonymous volume lock".to_string()))
    }
}

fn start_error(service: &Service, err: MusterError) -> MusterError {
    MusterError::Start {
        service: service.name.clone(),
        message: err.to_string(),
    }
}
