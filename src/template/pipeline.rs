//! Template mount pipeline
//!
//! Maps the two partitions of a template image to block devices, mounts
//! them, copies their content out, and tears the mapping down again. Every
//! operation holds the template's session mutex for its whole duration, so
//! two nodes baking from the same template are cloned one after the other.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::system::{BulkCopier, MountAttempt, Mounter, PartitionMapper};
use super::{MountSession, Template};
use crate::error::{Error, Result};
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Index of the boot partition in a mount session
pub const BOOT_PARTITION: usize = 0;
/// Index of the root partition in a mount session
pub const ROOT_PARTITION: usize = 1;

const REQUIRED_PARTITIONS: usize = 2;

static PARTITION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"loop\d+p\d+").expect("Invalid regex pattern"));

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent of the per-partition mount points
    pub mount_root: PathBuf,

    /// Where mapped partition devices appear
    pub device_dir: PathBuf,

    /// Upper bound on waiting for mapped devices to appear
    pub settle_timeout: Duration,

    pub settle_poll_interval: Duration,

    /// Filesystem types tried in order for each partition
    pub filesystems: Vec<String>,

    /// Retry policy for best-effort teardown after a failed copy
    pub teardown_retry: RetryConfig,
}

impl PipelineConfig {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            ..Default::default()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt"),
            device_dir: PathBuf::from("/dev/mapper"),
            settle_timeout: Duration::from_secs(5),
            settle_poll_interval: Duration::from_millis(100),
            filesystems: vec!["vfat".to_string(), "ext4".to_string()],
            teardown_retry: RetryConfig::default(),
        }
    }
}

/// Extract the partition device names from the mapper's output, in
/// discovery order
pub fn parse_partitions(output: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for found in PARTITION_REGEX.find_iter(output) {
        let name = found.as_str();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Drives the external tools through a template's mount session
pub struct TemplateMountPipeline {
    mapper: Arc<dyn PartitionMapper>,
    mounter: Arc<dyn Mounter>,
    copier: Arc<dyn BulkCopier>,
    config: PipelineConfig,
}

impl TemplateMountPipeline {
    pub fn new(
        mapper: Arc<dyn PartitionMapper>,
        mounter: Arc<dyn Mounter>,
        copier: Arc<dyn BulkCopier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            mapper,
            mounter,
            copier,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Mount both partitions of `template`, returning the mount points.
    ///
    /// Idempotent: an already mounted template is left as is.
    pub async fn mount(&self, template: &Template) -> Result<Vec<PathBuf>> {
        let mut session = template.session.lock().await;
        self.mount_session(template, &mut session).await?;
        Ok(session.targets.clone())
    }

    /// Unmount every recorded mount point and remove the partition mappings
    pub async fn unmount(&self, template: &Template) -> Result<()> {
        let mut session = template.session.lock().await;
        self.unmount_session(template, &mut session).await
    }

    /// Populate the boot artifact cache of `template` if it does not exist.
    ///
    /// Returns `true` when the artifacts were extracted by this call.
    #[instrument(skip(self, template), fields(template = %template.name))]
    pub async fn extract_boot_artifacts(&self, template: &Template) -> Result<bool> {
        let mut session = template.session.lock().await;
        let boot_dir = template.boot_artifacts_path.clone();

        if tokio::fs::try_exists(&boot_dir).await? {
            debug!(path = %boot_dir.display(), "Boot artifacts already cached");
            return Ok(false);
        }

        if let Err(e) = self.mount_session(template, &mut session).await {
            self.release(template, &mut session).await;
            return Err(e);
        }

        let copied = self
            .copy_partition(&session, BOOT_PARTITION, &boot_dir)
            .await;
        let released = self.unmount_session(template, &mut session).await;

        if let Err(e) = copied {
            if let Err(cleanup) = remove_dir_if_exists(&boot_dir).await {
                warn!(path = %boot_dir.display(), error = %cleanup, "Failed to remove partial boot artifacts");
            }
            return Err(e);
        }

        flatten_firmware(&boot_dir).await?;
        released?;

        info!(path = %boot_dir.display(), "Extracted boot artifacts");
        Ok(true)
    }

    /// Copy the root partition of `template` into `destination`.
    ///
    /// On failure the template is unmounted best-effort and the error is
    /// returned; `destination` may hold partial content.
    #[instrument(skip(self, template), fields(template = %template.name, destination = %destination.display()))]
    pub async fn clone_root(&self, template: &Template, destination: &Path) -> Result<()> {
        let mut session = template.session.lock().await;

        if let Err(e) = self.mount_session(template, &mut session).await {
            self.release(template, &mut session).await;
            return Err(e);
        }

        if let Err(e) = self
            .copy_partition(&session, ROOT_PARTITION, destination)
            .await
        {
            self.release(template, &mut session).await;
            return Err(e);
        }

        self.unmount_session(template, &mut session).await
    }

    async fn mount_session(&self, template: &Template, session: &mut MountSession) -> Result<()> {
        if session.targets.len() >= REQUIRED_PARTITIONS {
            debug!(template = %template.name, "Template already mounted");
            return Ok(());
        }

        let output = self.mapper.map(&template.image_path).await?;
        let partitions = parse_partitions(&output);

        if partitions.len() < REQUIRED_PARTITIONS {
            return Err(Error::Map {
                image: template.image_path.clone(),
                reason: format!(
                    "expected {REQUIRED_PARTITIONS} partitions, found {}",
                    partitions.len()
                ),
            });
        }

        let devices: Vec<PathBuf> = partitions
            .iter()
            .take(REQUIRED_PARTITIONS)
            .map(|name| self.config.device_dir.join(name))
            .collect();

        self.wait_for_devices(&template.image_path, &devices).await?;

        for (index, device) in devices.iter().enumerate() {
            let target = self
                .config
                .mount_root
                .join(format!("{}-{}", template.name, index));

            match tokio::fs::create_dir_all(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            self.mount_partition(device, &target).await?;

            if !session.targets.contains(&target) {
                session.targets.push(target);
            }
        }

        info!(template = %template.name, targets = ?session.targets, "Mounted template");
        Ok(())
    }

    async fn mount_partition(&self, device: &Path, target: &Path) -> Result<()> {
        let mut failures = Vec::new();

        for fs_type in &self.config.filesystems {
            match self.mounter.mount(device, target, fs_type).await {
                MountAttempt::Mounted => return Ok(()),
                MountAttempt::Busy => {
                    debug!(device = %device.display(), "Partition already mounted");
                    return Ok(());
                }
                MountAttempt::Failed(reason) => failures.push(format!("{fs_type}: {reason}")),
            }
        }

        Err(Error::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            reason: failures.join("; "),
        })
    }

    async fn wait_for_devices(&self, image: &Path, devices: &[PathBuf]) -> Result<()> {
        let deadline = Instant::now() + self.config.settle_timeout;

        loop {
            let mut missing = None;
            for device in devices {
                if !tokio::fs::try_exists(device).await.unwrap_or(false) {
                    missing = Some(device);
                    break;
                }
            }

            let Some(device) = missing else {
                return Ok(());
            };

            if Instant::now() >= deadline {
                return Err(Error::Map {
                    image: image.to_path_buf(),
                    reason: format!(
                        "device {} did not appear within {:?}",
                        device.display(),
                        self.config.settle_timeout
                    ),
                });
            }

            tokio::time::sleep(self.config.settle_poll_interval).await;
        }
    }

    async fn unmount_session(&self, template: &Template, session: &mut MountSession) -> Result<()> {
        while let Some(target) = session.targets.first().cloned() {
            self.mounter.unmount(&target).await?;
            session.targets.remove(0);
            debug!(target = %target.display(), "Unmounted partition");
        }

        self.mapper.unmap(&template.image_path).await?;
        debug!(template = %template.name, "Removed partition mappings");
        Ok(())
    }

    /// Best-effort teardown after a failure; errors are logged
    async fn release(&self, template: &Template, session: &mut MountSession) {
        while let Some(target) = session.targets.first().cloned() {
            let unmounted = with_retry_if(
                &self.config.teardown_retry,
                || self.mounter.unmount(&target),
                Error::is_recoverable,
            )
            .await;

            match unmounted {
                Ok(()) => {
                    session.targets.remove(0);
                }
                Err(e) => {
                    warn!(template = %template.name, target = %target.display(), error = %e, "Leaving template mounted");
                    return;
                }
            }
        }

        if let Err(e) = self.mapper.unmap(&template.image_path).await {
            warn!(template = %template.name, error = %e, "Failed to remove partition mappings");
        }
    }

    async fn copy_partition(
        &self,
        session: &MountSession,
        index: usize,
        destination: &Path,
    ) -> Result<()> {
        let source = session.targets.get(index).ok_or_else(|| {
            Error::other(format!("partition {index} is not mounted"))
        })?;
        self.copier.copy_tree(source, destination).await
    }
}

/// Move the entries of `<boot_dir>/firmware` up into `boot_dir` and remove
/// the emptied folder
async fn flatten_firmware(boot_dir: &Path) -> Result<()> {
    let firmware = boot_dir.join("firmware");
    match tokio::fs::metadata(&firmware).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Ok(()),
    }

    let mut entries = tokio::fs::read_dir(&firmware).await?;
    while let Some(entry) = entries.next_entry().await? {
        tokio::fs::rename(entry.path(), boot_dir.join(entry.file_name())).await?;
    }
    tokio::fs::remove_dir(&firmware).await?;

    debug!(path = %boot_dir.display(), "Flattened firmware folder");
    Ok(())
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
