//! Node lifecycle manager
//!
//! Owns the node state machine:
//!
//! ```text
//!   Available --bake--> Provisioning --clone ok--> Ready --unbake--> Available
//!                            |
//!                            +--clone failed--> Available
//! ```
//!
//! Every mutating operation holds the node's lock from the first read to
//! the last write, so status checks and the transitions they guard are
//! atomic with respect to other operations on the same node.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::locks::NodeLocks;
use crate::disk::DiskRegistry;
use crate::error::{Error, ResourceKind, Result};
use crate::exports::ExportCoordinator;
use crate::metrics::{self, BakeOutcome};
use crate::models::{Disk, Node, NodeStatus};
use crate::power::PowerController;
use crate::storage::SharedNodeRepository;
use crate::template::TemplateCatalog;
use crate::utils::safe_join;

/// Folder on a node's root disk that receives uploaded files
pub const NODE_FILES_DIR: &str = "node-config";

/// Lifecycle tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pause between power off and power on
    pub power_cycle_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            power_cycle_delay: Duration::from_secs(3),
        }
    }
}

/// Where a booting node gets its files from
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootSource {
    pub node: Node,
    /// Boot artifact cache of the node's template
    pub boot_artifacts: PathBuf,
    /// Folder of the node's root disk, once it has one
    pub root_disk: Option<PathBuf>,
}

/// Orchestrates bake and unbake across disks, templates, exports and power
pub struct NodeLifecycleManager {
    repository: SharedNodeRepository,
    templates: Arc<TemplateCatalog>,
    disks: Arc<DiskRegistry>,
    exports: Arc<ExportCoordinator>,
    power: Arc<dyn PowerController>,
    locks: NodeLocks,
    /// Held from a disk or template reference check until the write it
    /// guards is done. Always taken after a node lock, never before.
    references: Mutex<()>,
    config: ManagerConfig,
}

impl NodeLifecycleManager {
    /// Create the manager and recover from an unclean shutdown.
    ///
    /// Nodes left in Provisioning by a previous run are returned to the
    /// fridge. Their disks are neither created nor destroyed.
    pub async fn new(
        repository: SharedNodeRepository,
        templates: Arc<TemplateCatalog>,
        disks: Arc<DiskRegistry>,
        exports: Arc<ExportCoordinator>,
        power: Arc<dyn PowerController>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let manager = Self {
            repository,
            templates,
            disks,
            exports,
            power,
            locks: NodeLocks::new(),
            references: Mutex::new(()),
            config,
        };

        let recovered = manager.recover()?;
        if recovered > 0 {
            warn!(nodes = recovered, "Reset interrupted bakes");
        }
        manager.exports.refresh().await;
        manager.update_gauges();

        Ok(manager)
    }

    fn recover(&self) -> Result<usize> {
        let stuck = self.repository.list_by_status(NodeStatus::Provisioning)?;
        for mut node in stuck.iter().cloned() {
            warn!(
                node_id = %node.id,
                bake_id = node.bake_id.as_deref().unwrap_or("unknown"),
                template = node.template.as_deref().unwrap_or(""),
                "Bake was interrupted; returning node to the fridge"
            );
            node.reset();
            node.updated_at = Utc::now();
            self.repository.upsert(&node)?;
        }
        Ok(stuck.len())
    }

    pub fn templates(&self) -> &Arc<TemplateCatalog> {
        &self.templates
    }

    pub fn disks(&self) -> &Arc<DiskRegistry> {
        &self.disks
    }

    pub fn exports(&self) -> &Arc<ExportCoordinator> {
        &self.exports
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_node(&self, node_id: &str) -> Result<Node> {
        self.repository
            .get(node_id)?
            .ok_or_else(|| Error::not_found(ResourceKind::Node, node_id))
    }

    /// Nodes in the fridge, sorted by id
    pub fn list_available(&self) -> Result<Vec<Node>> {
        self.repository.list_by_status(NodeStatus::Available)
    }

    /// Nodes in the oven (provisioning or ready), sorted by id
    pub fn list_active(&self) -> Result<Vec<Node>> {
        self.repository.list_active()
    }

    pub fn list_all(&self) -> Result<Vec<Node>> {
        self.repository.list_all()
    }

    /// Return the node, creating it as Available on first reference
    pub async fn register_node(&self, node_id: &str) -> Result<Node> {
        if node_id.trim().is_empty() {
            return Err(Error::InvalidPath(node_id.to_string()));
        }
        if let Some(node) = self.repository.get(node_id)? {
            return Ok(node);
        }

        let _guard = self.locks.acquire(node_id).await;
        if let Some(node) = self.repository.get(node_id)? {
            return Ok(node);
        }

        let mut node = Node::new(node_id);
        self.persist(&mut node)?;
        info!(node_id, "Registered node");
        Ok(node)
    }

    // ========================================================================
    // Bake / unbake
    // ========================================================================

    /// Provision `node_id` from `template_name`.
    ///
    /// The node ends up Ready with a freshly cloned root disk, or back in
    /// the fridge if the clone failed. A failed power cycle is returned as
    /// an error but leaves the node Ready.
    #[instrument(skip(self))]
    pub async fn bake(&self, node_id: &str, template_name: &str) -> Result<Node> {
        let _guard = self.locks.acquire(node_id).await;
        let references = self.references.lock().await;

        let template = self.templates.get(template_name).await?;
        let mut node = self.get_node(node_id)?;
        if node.status != NodeStatus::Available {
            return Err(Error::InvalidState {
                node: node.id,
                status: node.status,
                operation: "bake",
            });
        }

        let timer = metrics::BakeTimer::start();
        let bake_id = Uuid::new_v4().to_string();
        node.status = NodeStatus::Provisioning;
        node.template = Some(template.name.clone());
        node.disks.clear();
        node.bake_id = Some(bake_id.clone());
        self.persist(&mut node)?;
        drop(references);
        info!(node_id, template = %template.name, bake_id = %bake_id, "Bake started");

        let disk = match self.disks.clone_from_template(&template).await {
            Ok(disk) => disk,
            Err(e) => {
                error!(node_id, bake_id = %bake_id, error = %e, "Clone failed; returning node to the fridge");
                self.return_to_fridge(&mut node);
                metrics::record_bake(BakeOutcome::Failed);
                return Err(e);
            }
        };

        node.disks = vec![disk.id.clone()];
        node.status = NodeStatus::Ready;
        if let Err(e) = self.persist(&mut node) {
            error!(node_id, disk_id = %disk.id, error = %e, "Failed to record baked node");
            if let Err(cleanup) = self.disks.destroy(&disk.id).await {
                warn!(disk_id = %disk.id, error = %cleanup, "Failed to remove orphaned disk");
            }
            self.return_to_fridge(&mut node);
            metrics::record_bake(BakeOutcome::Failed);
            return Err(e);
        }
        timer.ready();
        info!(node_id, disk_id = %disk.id, bake_id = %bake_id, "Node is ready");

        self.exports.refresh().await;

        if let Err(e) = self
            .power
            .power_cycle(node_id, self.config.power_cycle_delay)
            .await
        {
            warn!(node_id, error = %e, "Node baked but power cycle failed");
            metrics::record_bake(BakeOutcome::PowerFailed);
            return Err(e);
        }

        metrics::record_bake(BakeOutcome::Success);
        Ok(node)
    }

    /// Pick a node and bake it in the background.
    ///
    /// Returns the node as it was before provisioning started; progress is
    /// observed through [`get_node`](Self::get_node).
    pub async fn start_bake(
        self: &Arc<Self>,
        template_name: &str,
        node_id: Option<&str>,
    ) -> Result<Node> {
        if !self.templates.contains(template_name).await {
            return Err(Error::not_found(ResourceKind::Template, template_name));
        }

        let node = match node_id {
            Some(id) => {
                let node = self.get_node(id)?;
                if node.status != NodeStatus::Available {
                    return Err(Error::InvalidState {
                        node: node.id,
                        status: node.status,
                        operation: "bake",
                    });
                }
                node
            }
            None => self
                .list_available()?
                .into_iter()
                .next()
                .ok_or_else(|| Error::not_found(ResourceKind::Node, "any available node"))?,
        };

        let manager = Arc::clone(self);
        let id = node.id.clone();
        let template = template_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.bake(&id, &template).await {
                error!(node_id = %id, template = %template, error = %e, "Background bake failed");
            }
        });

        Ok(node)
    }

    /// Return a ready node to the fridge and destroy its disks
    #[instrument(skip(self))]
    pub async fn unbake(&self, node_id: &str) -> Result<Node> {
        let _guard = self.locks.acquire(node_id).await;

        let mut node = self.get_node(node_id)?;
        if node.status != NodeStatus::Ready {
            return Err(Error::InvalidState {
                node: node.id,
                status: node.status,
                operation: "unbake",
            });
        }

        if let Err(e) = self.power.power_off(node_id).await {
            warn!(node_id, error = %e, "Power off failed; unbaking anyway");
        }

        let references = self.references.lock().await;
        let captured = std::mem::take(&mut node.disks);
        node.reset();
        self.persist(&mut node)?;

        for disk_id in &captured {
            if let Err(e) = self.disks.destroy(disk_id).await {
                warn!(node_id, disk_id = %disk_id, error = %e, "Failed to destroy disk");
            }
        }
        drop(references);

        self.exports.refresh().await;
        metrics::record_unbake();
        info!(node_id, disks = captured.len(), "Node unbaked");

        Ok(node)
    }

    // ========================================================================
    // Disks
    // ========================================================================

    /// Attach an existing disk to a ready node. Attaching twice is a no-op.
    pub async fn attach_disk(&self, node_id: &str, disk_id: &str) -> Result<Node> {
        let _guard = self.locks.acquire(node_id).await;

        let mut node = self.get_node(node_id)?;
        if node.status != NodeStatus::Ready {
            return Err(Error::InvalidState {
                node: node.id,
                status: node.status,
                operation: "attach a disk to",
            });
        }

        let _references = self.references.lock().await;
        if !self.disks.contains(disk_id).await {
            return Err(Error::not_found(ResourceKind::Disk, disk_id));
        }
        if node.disks.iter().any(|d| d == disk_id) {
            return Ok(node);
        }
        if let Some(owner) = self.owner_of(disk_id)? {
            return Err(Error::protected(
                ResourceKind::Disk,
                disk_id,
                format!("attached to node {owner}"),
            ));
        }

        node.disks.push(disk_id.to_string());
        self.persist(&mut node)?;
        self.exports.refresh().await;

        info!(node_id, disk_id, "Attached disk");
        Ok(node)
    }

    /// Detach a secondary disk. The root disk can never be detached.
    pub async fn detach_disk(&self, node_id: &str, disk_id: &str) -> Result<Node> {
        let _guard = self.locks.acquire(node_id).await;

        let mut node = self.get_node(node_id)?;
        match node.disks.iter().position(|d| d == disk_id) {
            Some(0) => {
                return Err(Error::protected(
                    ResourceKind::Disk,
                    disk_id,
                    format!("root disk of node {node_id}"),
                ));
            }
            Some(index) => {
                node.disks.remove(index);
            }
            None => return Err(Error::not_found(ResourceKind::Disk, disk_id)),
        }

        self.persist(&mut node)?;
        self.exports.refresh().await;

        info!(node_id, disk_id, "Detached disk");
        Ok(node)
    }

    pub async fn create_disk(&self, size_mib: i64) -> Result<Disk> {
        self.disks.create_empty(size_mib).await
    }

    /// Destroy a disk that no node references
    pub async fn destroy_disk(&self, disk_id: &str) -> Result<()> {
        let _references = self.references.lock().await;
        if !self.disks.contains(disk_id).await {
            return Err(Error::not_found(ResourceKind::Disk, disk_id));
        }
        if let Some(owner) = self.owner_of(disk_id)? {
            return Err(Error::protected(
                ResourceKind::Disk,
                disk_id,
                format!("attached to node {owner}"),
            ));
        }
        self.disks.destroy(disk_id).await
    }

    fn owner_of(&self, disk_id: &str) -> Result<Option<String>> {
        Ok(self
            .repository
            .list_all()?
            .into_iter()
            .find(|n| n.disks.iter().any(|d| d == disk_id))
            .map(|n| n.id))
    }

    // ========================================================================
    // Templates
    // ========================================================================

    /// Delete a template no active node was baked from
    pub async fn delete_template(&self, name: &str) -> Result<()> {
        let _references = self.references.lock().await;
        let users: Vec<String> = self
            .repository
            .list_active()?
            .into_iter()
            .filter(|n| n.template.as_deref() == Some(name))
            .map(|n| n.id)
            .collect();

        if !users.is_empty() {
            return Err(Error::protected(
                ResourceKind::Template,
                name,
                format!("in use by {}", users.join(", ")),
            ));
        }

        self.templates.delete(name).await
    }

    // ========================================================================
    // Power
    // ========================================================================

    pub async fn power_cycle_node(&self, node_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(node_id).await;
        self.get_node(node_id)?;
        self.power
            .power_cycle(node_id, self.config.power_cycle_delay)
            .await
    }

    // ========================================================================
    // Node files
    // ========================================================================

    /// Write a file below `node-config/` on the node's root disk
    pub async fn put_node_file(&self, node_id: &str, relative_path: &str, content: &[u8]) -> Result<()> {
        let _guard = self.locks.acquire(node_id).await;

        let node = self.get_node(node_id)?;
        let root_disk = self.ready_root_disk(&node, "upload files to")?;
        self.disks
            .put_file(&root_disk, &node_file_path(relative_path), content)
            .await
    }

    /// Read a file below `node-config/` on the node's root disk
    pub async fn get_node_file(&self, node_id: &str, relative_path: &str) -> Result<Vec<u8>> {
        let node = self.get_node(node_id)?;
        let root_disk = self.ready_root_disk(&node, "read files from")?;
        self.disks
            .get_file(&root_disk, &node_file_path(relative_path))
            .await
    }

    fn ready_root_disk(&self, node: &Node, operation: &'static str) -> Result<String> {
        match (node.status, node.root_disk()) {
            (NodeStatus::Ready, Some(disk)) => Ok(disk.to_string()),
            (status, _) => Err(Error::InvalidState {
                node: node.id.clone(),
                status,
                operation,
            }),
        }
    }

    // ========================================================================
    // Boot files
    // ========================================================================

    /// Resolve where `node_id` boots from, registering unknown nodes.
    ///
    /// Nodes in the fridge have nothing to boot and are rejected.
    pub async fn boot_source(&self, node_id: &str) -> Result<BootSource> {
        let node = self.register_node(node_id).await?;

        let template_name = match (node.status, node.template.as_deref()) {
            (NodeStatus::Available, _) | (_, None) => {
                return Err(Error::InvalidState {
                    node: node.id,
                    status: node.status,
                    operation: "boot",
                });
            }
            (_, Some(name)) => name.to_string(),
        };

        let template = self.templates.get(&template_name).await?;
        let root_disk = match node.root_disk() {
            Some(id) => self.disks.get(id).await.ok().map(|d| d.location),
            None => None,
        };

        Ok(BootSource {
            boot_artifacts: template.boot_artifacts_path.clone(),
            root_disk,
            node,
        })
    }

    /// Read one boot artifact for `node_id`
    pub async fn read_boot_file(&self, node_id: &str, file: &str) -> Result<Vec<u8>> {
        let source = self.boot_source(node_id).await?;
        let path = safe_join(&source.boot_artifacts, file)?;

        match tokio::fs::read(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(ResourceKind::File, file))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unmount every template; called once at shutdown
    pub async fn shutdown(&self) {
        self.templates.unmount_all().await;
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn persist(&self, node: &mut Node) -> Result<()> {
        node.updated_at = Utc::now();
        self.repository.upsert(node)?;
        self.update_gauges();
        Ok(())
    }

    /// Roll a failed bake back; the bake id is kept for correlation
    fn return_to_fridge(&self, node: &mut Node) {
        node.status = NodeStatus::Available;
        node.template = None;
        node.disks.clear();
        if let Err(e) = self.persist(node) {
            error!(node_id = %node.id, error = %e, "Failed to return node to the fridge");
        }
    }

    fn update_gauges(&self) {
        let Ok(nodes) = self.repository.list_all() else {
            return;
        };
        let count = |status| nodes.iter().filter(|n| n.status == status).count();
        metrics::set_node_counts(
            count(NodeStatus::Available),
            count(NodeStatus::Provisioning),
            count(NodeStatus::Ready),
        );
    }
}

fn node_file_path(relative_path: &str) -> String {
    format!("{NODE_FILES_DIR}/{}", relative_path.trim_start_matches('/'))
}
