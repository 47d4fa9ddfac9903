//! Network filesystem export list
//!
//! The export file lists the folder of every disk referenced by a
//! provisioning or ready node. It is rewritten in full on every change; a
//! single async mutex serializes regenerations so concurrent bakes and
//! unbakes never interleave their writes.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::SharedNodeRepository;
use crate::utils::process::run_command;

/// Options appended to every exported path
pub const EXPORT_OPTIONS: &str = "*(rw,sync,no_subtree_check,no_root_squash)";

/// Export file location and reload hook
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// File rewritten on every regeneration
    pub path: PathBuf,

    /// Command run after a successful rewrite (e.g. `exportfs -ra`)
    pub reload_command: Option<Vec<String>>,

    pub reload_timeout: Duration,
}

impl ExportConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reload_command: None,
            reload_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_reload_command(mut self, command: Vec<String>) -> Self {
        self.reload_command = if command.is_empty() { None } else { Some(command) };
        self
    }
}

/// Outcome of the most recent regenerations
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatus {
    /// Number of regeneration attempts since startup
    pub generation: u64,
    pub exported: Vec<PathBuf>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Keeps the export file in sync with the disks referenced by active nodes
pub struct ExportCoordinator {
    repository: SharedNodeRepository,
    disk_root: PathBuf,
    config: ExportConfig,
    status: Mutex<ExportStatus>,
}

impl ExportCoordinator {
    pub fn new(repository: SharedNodeRepository, disk_root: impl Into<PathBuf>, config: ExportConfig) -> Self {
        Self {
            repository,
            disk_root: disk_root.into(),
            config,
            status: Mutex::new(ExportStatus::default()),
        }
    }

    pub fn export_path(&self) -> &Path {
        &self.config.path
    }

    /// Rewrite the export file from current node and disk state.
    ///
    /// Failures are recorded in [`ExportStatus`] and returned; nothing is
    /// rolled back.
    pub async fn regenerate(&self) -> Result<Vec<PathBuf>> {
        let mut status = self.status.lock().await;
        status.generation += 1;

        let result = self.write_exports().await;
        match &result {
            Ok(paths) => {
                status.exported = paths.clone();
                status.last_success = Some(Utc::now());
                status.last_error = None;
                metrics::record_export_regeneration(true);
                info!(
                    generation = status.generation,
                    exports = paths.len(),
                    "Regenerated exports"
                );
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                metrics::record_export_regeneration(false);
            }
        }

        result
    }

    /// Regenerate, logging a failure instead of returning it
    pub async fn refresh(&self) {
        if let Err(e) = self.regenerate().await {
            warn!(error = %e, path = %self.config.path.display(), "Export regeneration failed");
        }
    }

    pub async fn status(&self) -> ExportStatus {
        self.status.lock().await.clone()
    }

    /// Folders of disks referenced by active nodes that exist on disk
    pub async fn exported_paths(&self) -> Result<Vec<PathBuf>> {
        let nodes = self.repository.list_active()?;

        let mut paths = BTreeSet::new();
        for node in &nodes {
            for disk_id in &node.disks {
                let folder = self.disk_root.join(disk_id);
                if tokio::fs::try_exists(&folder).await.unwrap_or(false) {
                    paths.insert(folder);
                } else {
                    debug!(node_id = %node.id, disk_id = %disk_id, "Skipping missing disk folder");
                }
            }
        }

        Ok(paths.into_iter().collect())
    }

    async fn write_exports(&self) -> Result<Vec<PathBuf>> {
        let paths = self.exported_paths().await?;
        let content = render_exports(&paths);
        let export_error = |reason: String| Error::Export {
            path: self.config.path.clone(),
            reason,
        };

        if let Some(parent) = self.config.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| export_error(format!("failed to create parent directory: {e}")))?;
        }

        let mut temp: OsString = self.config.path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, content)
            .await
            .map_err(|e| export_error(format!("failed to write {}: {e}", temp.display())))?;
        tokio::fs::rename(&temp, &self.config.path)
            .await
            .map_err(|e| export_error(format!("failed to replace export file: {e}")))?;

        self.reload().await?;
        Ok(paths)
    }

    async fn reload(&self) -> Result<()> {
        let Some((program, args)) = self
            .config
            .reload_command
            .as_ref()
            .and_then(|command| command.split_first())
        else {
            return Ok(());
        };

        let output = run_command(program, args, None, self.config.reload_timeout)
            .await
            .map_err(|e| Error::Export {
                path: self.config.path.clone(),
                reason: format!("reload failed: {e}"),
            })?;

        if !output.success() {
            return Err(Error::Export {
                path: self.config.path.clone(),
                reason: format!(
                    "reload command {program} exited with {}: {}",
                    output.status,
                    output.diagnostic()
                ),
            });
        }

        Ok(())
    }
}

/// Render the export file content, one line per path
pub fn render_exports(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| format!("{} {EXPORT_OPTIONS}\n", path.display()))
        .collect()
}
