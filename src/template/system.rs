//! External tools driven by the mount pipeline
//!
//! Each tool sits behind a trait so the pipeline can be exercised without
//! root privileges or loop devices. The production implementations shell
//! out to `kpartx`, `mount`/`umount` and `rsync`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::utils::process::{run_checked, run_command};

/// Maps the partitions of a raw disk image to block devices
#[async_trait]
pub trait PartitionMapper: Send + Sync {
    /// Create the mappings and return the tool's output, which names the
    /// created partition devices
    async fn map(&self, image: &Path) -> Result<String>;

    /// Remove every mapping of `image`
    async fn unmap(&self, image: &Path) -> Result<()>;
}

/// Result of one mount attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountAttempt {
    Mounted,
    /// The device is already mounted (device or resource busy)
    Busy,
    Failed(String),
}

/// Mounts and unmounts filesystems
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> MountAttempt;

    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// Recursive, attribute-preserving directory copy
#[async_trait]
pub trait BulkCopier: Send + Sync {
    /// Copy the content of `from` into `to`, creating `to` if needed
    async fn copy_tree(&self, from: &Path, to: &Path) -> Result<()>;
}

// ============================================================================
// kpartx
// ============================================================================

/// [`PartitionMapper`] backed by `kpartx`
#[derive(Debug, Clone)]
pub struct KpartxMapper {
    program: String,
    timeout: Duration,
}

impl KpartxMapper {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Default for KpartxMapper {
    fn default() -> Self {
        Self::new("kpartx", Duration::from_secs(60))
    }
}

#[async_trait]
impl PartitionMapper for KpartxMapper {
    async fn map(&self, image: &Path) -> Result<String> {
        let output = run_command(
            &self.program,
            [Path::new("-av").as_os_str(), image.as_os_str()],
            None,
            self.timeout,
        )
        .await
        .map_err(|e| Error::Map {
            image: image.to_path_buf(),
            reason: e.to_string(),
        })?;

        if !output.success() {
            return Err(Error::Map {
                image: image.to_path_buf(),
                reason: format!("{} exited with {}: {}", self.program, output.status, output.diagnostic()),
            });
        }

        // kpartx reports the created maps on stdout, some versions on stderr
        Ok(format!("{}\n{}", output.stdout, output.stderr))
    }

    async fn unmap(&self, image: &Path) -> Result<()> {
        run_checked(
            &self.program,
            [Path::new("-d").as_os_str(), image.as_os_str()],
            self.timeout,
        )
        .await
        .map(|_| ())
        .map_err(|e| Error::Unmount {
            target: image.to_path_buf(),
            reason: format!("failed to remove partition mappings: {e}"),
        })
    }
}

// ============================================================================
// mount(8) / umount(8)
// ============================================================================

/// [`Mounter`] backed by the `mount` and `umount` binaries
#[derive(Debug, Clone)]
pub struct SystemMounter {
    timeout: Duration,
}

impl SystemMounter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// mount(8) wording for a device that is already mounted
fn is_busy_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("busy") || message.contains("already mounted")
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> MountAttempt {
        let args = [
            Path::new("-t").as_os_str(),
            Path::new(fs_type).as_os_str(),
            device.as_os_str(),
            target.as_os_str(),
        ];

        match run_command("mount", args, None, self.timeout).await {
            Ok(output) if output.success() => MountAttempt::Mounted,
            Ok(output) if is_busy_message(&output.stderr) => MountAttempt::Busy,
            Ok(output) => MountAttempt::Failed(output.diagnostic()),
            Err(e) => MountAttempt::Failed(e.to_string()),
        }
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        run_checked("umount", [target.as_os_str()], self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| Error::Unmount {
                target: target.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// rsync
// ============================================================================

/// [`BulkCopier`] backed by `rsync -xa`
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    program: String,
    timeout: Duration,
}

impl RsyncCopier {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Default for RsyncCopier {
    fn default() -> Self {
        Self::new("rsync", Duration::from_secs(3600))
    }
}

#[async_trait]
impl BulkCopier for RsyncCopier {
    async fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        // The trailing slash copies the content of `from` rather than the folder itself
        let mut source = from.as_os_str().to_os_string();
        source.push("/");

        let copy_error = |reason: String| Error::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            reason,
        };

        let output = run_command(
            &self.program,
            [Path::new("-xa").as_os_str(), source.as_os_str(), to.as_os_str()],
            None,
            self.timeout,
        )
        .await
        .map_err(|e| copy_error(e.to_string()))?;

        if !output.success() {
            return Err(copy_error(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                output.diagnostic()
            )));
        }

        Ok(())
    }
}
