// Core data structures for the provisioning controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle status of a node
///
/// The numeric codes are the values stored in the node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Resting in the fridge, free to be baked
    Available = 1,
    /// Baked: owns a root disk and a template reference
    Ready = 2,
    /// A bake is in flight
    Provisioning = 3,
}

impl NodeStatus {
    /// Stored integer code
    pub fn code(&self) -> i64 {
        *self as i64
    }

    /// Parse a stored integer code
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Available),
            2 => Some(Self::Ready),
            3 => Some(Self::Provisioning),
            _ => None,
        }
    }

    /// Occupied nodes (the oven): provisioning or ready
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Ready)
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Ready => "ready",
            Self::Provisioning => "provisioning",
        }
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Available
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "ready" => Ok(Self::Ready),
            "provisioning" => Ok(Self::Provisioning),
            other => Err(format!("unknown node status '{other}'")),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network-booted machine managed by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Caller-supplied identifier (e.g. board serial number)
    pub id: String,

    pub status: NodeStatus,

    /// Name of the template the node was baked from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Attached disk ids; index 0 is the root disk
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<String>,

    /// Correlation id of the most recent bake attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bake_id: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a fresh available node
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: NodeStatus::Available,
            template: None,
            disks: Vec::new(),
            bake_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Root disk id, if the node owns one
    pub fn root_disk(&self) -> Option<&str> {
        self.disks.first().map(String::as_str)
    }

    /// Check `Ready <=> disks non-empty and template set`
    pub fn is_consistent(&self) -> bool {
        let provisioned = !self.disks.is_empty() && self.template.is_some();
        (self.status == NodeStatus::Ready) == provisioned
    }

    /// Return the node to the fridge, dropping every provisioning reference
    pub fn reset(&mut self) {
        self.status = NodeStatus::Available;
        self.template = None;
        self.disks.clear();
        self.bake_id = None;
    }
}

/// A provisioned storage volume backed by one folder under the disk root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Generated id, also the folder name
    pub id: String,

    /// Backing folder
    pub location: PathBuf,

    /// Size of the placeholder image, for disks created empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mib: Option<u64>,
}

/// Serializable view of a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub name: String,
    pub image_path: PathBuf,
    pub boot_artifacts_path: PathBuf,
    pub boot_artifacts_ready: bool,
    pub mounted_on: Vec<PathBuf>,
}
