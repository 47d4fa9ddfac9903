//! Disk registry
//!
//! A disk is a folder `<disk_root>/<id>` exported to the node that owns it.
//! The folder name is the disk id, so the in-memory index can always be
//! rebuilt by scanning the disk root.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, ResourceKind, Result};
use crate::exports::ExportCoordinator;
use crate::models::Disk;
use crate::template::{Template, TemplateMountPipeline};
use crate::utils::safe_join;

/// Placeholder image inside a disk created empty
pub const DISK_IMAGE: &str = "disk.img";

const MIB: u64 = 1024 * 1024;

/// Owns the set of provisioned disks
pub struct DiskRegistry {
    disk_root: PathBuf,
    pipeline: Arc<TemplateMountPipeline>,
    exports: Arc<ExportCoordinator>,
    disks: RwLock<BTreeMap<String, Disk>>,
}

impl DiskRegistry {
    /// Create the disk root if needed and index the disks already in it
    pub async fn open(
        disk_root: impl Into<PathBuf>,
        pipeline: Arc<TemplateMountPipeline>,
        exports: Arc<ExportCoordinator>,
    ) -> Result<Self> {
        let registry = Self {
            disk_root: disk_root.into(),
            pipeline,
            exports,
            disks: RwLock::new(BTreeMap::new()),
        };

        tokio::fs::create_dir_all(&registry.disk_root).await?;
        let count = registry.rescan().await?;
        info!(disk_root = %registry.disk_root.display(), disks = count, "Disk registry opened");

        Ok(registry)
    }

    pub fn disk_root(&self) -> &Path {
        &self.disk_root
    }

    /// Rebuild the index from the folders under the disk root
    pub async fn rescan(&self) -> Result<usize> {
        let mut disks = self.disks.write().await;
        disks.clear();

        let mut entries = tokio::fs::read_dir(&self.disk_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }

            let location = entry.path();
            let size_mib = image_size_mib(&location).await;
            disks.insert(id.clone(), Disk { id, location, size_mib });
        }

        Ok(disks.len())
    }

    /// Create a disk holding a sparse placeholder image of `size_mib` MiB
    #[instrument(skip(self))]
    pub async fn create_empty(&self, size_mib: i64) -> Result<Disk> {
        if size_mib <= 0 {
            return Err(Error::InvalidSize(size_mib));
        }
        let size_bytes = (size_mib as u64)
            .checked_mul(MIB)
            .ok_or(Error::InvalidSize(size_mib))?;

        let id = new_disk_id();
        let location = self.disk_root.join(&id);
        tokio::fs::create_dir_all(&location).await?;

        if let Err(e) = write_placeholder(&location.join(DISK_IMAGE), size_bytes).await {
            remove_folder(&location).await;
            return Err(e);
        }

        let disk = Disk {
            id: id.clone(),
            location,
            size_mib: Some(size_mib as u64),
        };
        self.disks.write().await.insert(id, disk.clone());

        info!(disk_id = %disk.id, size_mib, "Created empty disk");
        Ok(disk)
    }

    /// Create a disk holding a copy of the root partition of `template`.
    ///
    /// The disk is registered only after the copy succeeded; a failed copy
    /// leaves no folder behind.
    #[instrument(skip(self, template), fields(template = %template.name))]
    pub async fn clone_from_template(&self, template: &Template) -> Result<Disk> {
        let id = new_disk_id();
        let location = self.disk_root.join(&id);
        tokio::fs::create_dir_all(&location).await?;

        if let Err(e) = self.pipeline.clone_root(template, &location).await {
            remove_folder(&location).await;
            return Err(e);
        }

        let disk = Disk {
            id: id.clone(),
            location,
            size_mib: None,
        };
        self.disks.write().await.insert(id, disk.clone());
        info!(disk_id = %disk.id, "Cloned disk from template");

        self.exports.refresh().await;
        Ok(disk)
    }

    /// Drop a disk from the index and delete its folder.
    ///
    /// Idempotent: an id missing from the index still has its folder
    /// removed, and a folder that is already gone is not an error. The id
    /// must name a single folder directly under the disk root.
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let location = safe_join(&self.disk_root, id)?;
        if location.parent() != Some(self.disk_root.as_path()) {
            return Err(Error::InvalidPath(id.to_string()));
        }

        if self.disks.write().await.remove(id).is_none() {
            debug!(disk_id = %id, "Disk not indexed; removing folder only");
        }

        match tokio::fs::remove_dir_all(&location).await {
            Ok(()) => info!(disk_id = %id, "Destroyed disk"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(disk_id = %id, "Disk folder already gone");
            }
            Err(e) => return Err(e.into()),
        }

        self.exports.refresh().await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Disk> {
        self.disks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Disk, id))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.disks.read().await.contains_key(id)
    }

    /// All disks sorted by id
    pub async fn list(&self) -> Vec<Disk> {
        self.disks.read().await.values().cloned().collect()
    }

    /// Write `content` to `relative_path` inside the disk folder
    pub async fn put_file(&self, disk_id: &str, relative_path: &str, content: &[u8]) -> Result<()> {
        let disk = self.get(disk_id).await?;
        let path = safe_join(&disk.location, relative_path)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        debug!(disk_id, path = %path.display(), bytes = content.len(), "Wrote disk file");
        Ok(())
    }

    /// Read `relative_path` from inside the disk folder
    pub async fn get_file(&self, disk_id: &str, relative_path: &str) -> Result<Vec<u8>> {
        let disk = self.get(disk_id).await?;
        let path = safe_join(&disk.location, relative_path)?;

        match tokio::fs::read(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(ResourceKind::File, relative_path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn new_disk_id() -> String {
    Uuid::new_v4().to_string()
}

/// Extend a new file to `size_bytes` by writing its last byte
async fn write_placeholder(path: &Path, size_bytes: u64) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.seek(SeekFrom::Start(size_bytes - 1)).await?;
    file.write_all(&[0]).await?;
    file.sync_all().await?;
    Ok(())
}

async fn image_size_mib(location: &Path) -> Option<u64> {
    let meta = tokio::fs::metadata(location.join(DISK_IMAGE)).await.ok()?;
    meta.is_file().then(|| meta.len() / MIB)
}

async fn remove_folder(location: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(location).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %location.display(), error = %e, "Failed to remove partial disk folder");
        }
    }
}
