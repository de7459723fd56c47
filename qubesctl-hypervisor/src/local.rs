//! Local directory VM backend.
//!
//! Each VM lives in `<storage>/<pool>/<name>/`:
//!
//! ```text
//! vm.json       backend copy of the record
//! private.img   per-VM private volume (sparse)
//! root.img      root volume, only for VMs that own one (standalone / templates)
//! running       marker present while the VM is running
//! ```
//!
//! Suitable for development and single-host setups where another component
//! boots the images.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::VmManager;
use crate::types::*;

/// Default storage root for VM directories.
pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/qubesctl/vms";

/// Default size of a fresh private image.
pub const DEFAULT_PRIVATE_SIZE_MIB: u64 = 2048;

/// Default size of a fresh (non-cloned) root image.
pub const DEFAULT_ROOT_SIZE_MIB: u64 = 10240;

const CONFIG_FILE: &str = "vm.json";
const PRIVATE_IMAGE: &str = "private.img";
const ROOT_IMAGE: &str = "root.img";
const RUNNING_MARKER: &str = "running";

/// Local directory backend.
pub struct LocalBackend {
    /// Base path for VM directories
    base_path: PathBuf,
    /// Size of freshly allocated private images
    private_size_mib: u64,
    /// Size of freshly allocated root images
    root_size_mib: u64,
}

impl LocalBackend {
    /// Create a new local backend with the default path.
    pub fn new() -> Self {
        Self::with_path(DEFAULT_STORAGE_PATH)
    }

    /// Create a local backend with a custom base path.
    pub fn with_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            private_size_mib: DEFAULT_PRIVATE_SIZE_MIB,
            root_size_mib: DEFAULT_ROOT_SIZE_MIB,
        }
    }

    /// Set the size of freshly allocated private images.
    pub fn with_private_size(mut self, size_mib: u64) -> Self {
        self.private_size_mib = size_mib;
        self
    }

    /// Set the size of root images that are not cloned from a template.
    pub fn with_root_size(mut self, size_mib: u64) -> Self {
        self.root_size_mib = size_mib;
        self
    }

    /// Base path for VM directories.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding a VM's files.
    pub fn vm_dir(&self, record: &VmRecord) -> PathBuf {
        self.base_path.join(&record.pool).join(&record.name)
    }

    /// Mark a VM as running (the marker is what `is_running` reports).
    pub fn mark_running(&self, record: &VmRecord) -> Result<()> {
        let dir = self.existing_dir(record)?;
        File::create(dir.join(RUNNING_MARKER)).map_err(|e| {
            HypervisorError::Internal(format!("Failed to write running marker: {}", e))
        })?;
        Ok(())
    }

    fn existing_dir(&self, record: &VmRecord) -> Result<PathBuf> {
        let dir = self.vm_dir(record);
        if !dir.is_dir() {
            return Err(HypervisorError::VmNotFound(record.name.clone()));
        }
        Ok(dir)
    }

    fn write_config(&self, dir: &Path, record: &VmRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| HypervisorError::Internal(format!("Failed to encode VM config: {}", e)))?;
        fs::write(dir.join(CONFIG_FILE), json).map_err(|e| {
            HypervisorError::Internal(format!(
                "Failed to write {}: {}",
                dir.join(CONFIG_FILE).display(),
                e
            ))
        })
    }

    fn read_config(&self, dir: &Path) -> Result<VmRecord> {
        let bytes = fs::read(dir.join(CONFIG_FILE)).map_err(|e| {
            HypervisorError::Internal(format!(
                "Failed to read {}: {}",
                dir.join(CONFIG_FILE).display(),
                e
            ))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| HypervisorError::Internal(format!("Corrupt VM config: {}", e)))
    }

    /// Allocate a sparse image file.
    #[instrument(skip(self), fields(path = %path.display(), size_mib = size_mib))]
    fn create_sparse(&self, path: &Path, size_mib: u64) -> Result<()> {
        debug!("Allocating sparse image");
        let size_bytes = size_mib
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                HypervisorError::ProvisionFailed(format!(
                    "{}: image size of {} MiB is too large",
                    path.display(),
                    size_mib
                ))
            })?;
        let file = File::create(path).map_err(|e| {
            HypervisorError::ProvisionFailed(format!("{}: {}", path.display(), e))
        })?;
        file.set_len(size_bytes).map_err(|e| {
            HypervisorError::ProvisionFailed(format!("{}: {}", path.display(), e))
        })?;
        Ok(())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VmManager for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    #[instrument(skip(self, vm), fields(vm_name = %vm.name, pool = %vm.pool))]
    fn create(&self, vm: &NewVm) -> Result<VmRecord> {
        info!("Creating VM directory");

        let record = vm.clone().into_record();
        let dir = self.vm_dir(&record);
        if dir.exists() {
            return Err(HypervisorError::CreateFailed(format!(
                "{} already exists",
                dir.display()
            )));
        }

        fs::create_dir_all(&dir).map_err(|e| {
            HypervisorError::CreateFailed(format!(
                "Failed to create directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        self.write_config(&dir, &record)?;

        info!(path = %dir.display(), "VM directory created");
        Ok(record)
    }

    #[instrument(skip(self, record, source_template), fields(vm_name = %record.name))]
    fn provision_disk(&self, record: &VmRecord, source_template: Option<&VmRecord>) -> Result<()> {
        let dir = self
            .existing_dir(record)
            .map_err(|e| HypervisorError::ProvisionFailed(e.to_string()))?;

        self.create_sparse(&dir.join(PRIVATE_IMAGE), self.private_size_mib)?;

        // Template-based VMs share their template's root image.
        if record.properties.template.is_some() {
            return Ok(());
        }

        let root = dir.join(ROOT_IMAGE);
        let source_root = source_template.map(|t| self.vm_dir(t).join(ROOT_IMAGE));
        match source_root {
            Some(source) if source.is_file() => {
                info!(source = %source.display(), "Cloning root image from template");
                fs::copy(&source, &root).map_err(|e| {
                    HypervisorError::ProvisionFailed(format!(
                        "Failed to copy {}: {}",
                        source.display(),
                        e
                    ))
                })?;
            }
            Some(source) => {
                return Err(HypervisorError::ProvisionFailed(format!(
                    "Template root image missing: {}",
                    source.display()
                )));
            }
            None => self.create_sparse(&root, self.root_size_mib)?,
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(vm_name = %record.name))]
    fn force_shutdown(&self, record: &VmRecord) -> Result<()> {
        info!("Force stopping VM");
        let marker = self.vm_dir(record).join(RUNNING_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("VM was not running");
                Ok(())
            }
            Err(e) => Err(HypervisorError::StopFailed(format!(
                "{}: {}",
                marker.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, record), fields(vm_name = %record.name))]
    fn remove_from_disk(&self, record: &VmRecord) -> Result<()> {
        let dir = self.vm_dir(record);
        if !dir.exists() {
            warn!(path = %dir.display(), "VM directory already gone");
            return Ok(());
        }
        if dir.join(RUNNING_MARKER).exists() {
            return Err(HypervisorError::DeleteFailed(
                "VM must be stopped before deletion".to_string(),
            ));
        }

        info!(path = %dir.display(), "Removing VM directory");
        fs::remove_dir_all(&dir).map_err(|e| {
            HypervisorError::DeleteFailed(format!("{}: {}", dir.display(), e))
        })
    }

    #[instrument(skip(self, record, value), fields(vm_name = %record.name, property = %property, value = %value))]
    fn set_property(&self, record: &VmRecord, property: Property, value: &PropertyValue) -> Result<()> {
        let dir = self.existing_dir(record)?;
        let mut stored = self.read_config(&dir)?;
        stored.properties.set(property, value.clone())?;
        self.write_config(&dir, &stored)?;
        debug!("Property written");
        Ok(())
    }

    fn is_running(&self, record: &VmRecord) -> Result<bool> {
        Ok(self.vm_dir(record).join(RUNNING_MARKER).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_vm(qid: Qid, name: &str, kind: VmKind, template: Option<Qid>) -> NewVm {
        let mut properties = VmProperties::defaults_for(kind, Label::Black);
        properties.template = template;
        NewVm {
            qid,
            name: name.to_string(),
            kind,
            pool: "default".to_string(),
            properties,
        }
    }

    #[test]
    fn test_create_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path());

        let record = backend.create(&new_vm(1, "work", VmKind::AppVm, None)).unwrap();
        let vm_dir = dir.path().join("default").join("work");
        assert!(vm_dir.join("vm.json").is_file());
        assert_eq!(backend.read_config(&vm_dir).unwrap(), record);

        let err = backend.create(&new_vm(2, "work", VmKind::AppVm, None)).unwrap_err();
        assert!(matches!(err, HypervisorError::CreateFailed(_)));
    }

    #[test]
    fn test_provision_clones_template_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path())
            .with_private_size(1)
            .with_root_size(1);

        let template = backend
            .create(&new_vm(1, "fedora-23", VmKind::TemplateVm, None))
            .unwrap();
        backend.provision_disk(&template, None).unwrap();
        fs::write(backend.vm_dir(&template).join(ROOT_IMAGE), b"fedora root").unwrap();

        // Standalone copy owns a clone of the template's root.
        let standalone = backend
            .create(&new_vm(2, "standalone", VmKind::AppVm, None))
            .unwrap();
        backend.provision_disk(&standalone, Some(&template)).unwrap();
        let cloned = fs::read(backend.vm_dir(&standalone).join(ROOT_IMAGE)).unwrap();
        assert_eq!(cloned, b"fedora root");

        // Template-based VM only gets a private image.
        let based = backend
            .create(&new_vm(3, "work", VmKind::AppVm, Some(1)))
            .unwrap();
        backend.provision_disk(&based, Some(&template)).unwrap();
        let based_dir = backend.vm_dir(&based);
        assert_eq!(fs::metadata(based_dir.join(PRIVATE_IMAGE)).unwrap().len(), 1024 * 1024);
        assert!(!based_dir.join(ROOT_IMAGE).exists());
    }

    #[test]
    fn test_oversized_image_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path()).with_private_size(u64::MAX);

        let record = backend.create(&new_vm(1, "work", VmKind::AppVm, Some(9))).unwrap();
        let err = backend.provision_disk(&record, None).unwrap_err();
        assert!(matches!(err, HypervisorError::ProvisionFailed(_)));
        assert!(!backend.vm_dir(&record).join(PRIVATE_IMAGE).exists());
    }

    #[test]
    fn test_running_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path());
        let record = backend.create(&new_vm(1, "sys-net", VmKind::NetVm, None)).unwrap();

        assert!(!backend.is_running(&record).unwrap());
        backend.mark_running(&record).unwrap();
        assert!(backend.is_running(&record).unwrap());
        assert!(backend.remove_from_disk(&record).is_err());

        backend.force_shutdown(&record).unwrap();
        backend.remove_from_disk(&record).unwrap();
        assert!(!backend.vm_dir(&record).exists());
    }

    #[test]
    fn test_set_property_persists() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path());
        let record = backend.create(&new_vm(1, "work", VmKind::AppVm, None)).unwrap();

        backend
            .set_property(&record, Property::Vcpus, &PropertyValue::Int(4))
            .unwrap();
        let stored = backend.read_config(&backend.vm_dir(&record)).unwrap();
        assert_eq!(stored.properties.vcpus, 4);
    }
}
