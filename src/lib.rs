//! bakery - Network boot provisioning for single-board computer clusters
//!
//! Nodes boot over the network from a controller that keeps a pool of
//! template images. Baking a node clones a template's root filesystem into a
//! fresh disk, exports it over NFS and power-cycles the node; unbaking powers
//! it off and returns it to the fridge.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Nodes, disks and template descriptions
//! - [`storage`] - Durable node records (SQLite)
//! - [`template`] - Template catalog and the map/mount/copy pipeline
//! - [`disk`] - Disk folders under the disk root
//! - [`exports`] - NFS export file regeneration
//! - [`power`] - External power controller
//! - [`provisioner`] - Node lifecycle manager and HTTP API
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use bakery::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!     println!("disks live in {}", config.storage.disk_root.display());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod exports;
pub mod metrics;
pub mod models;
pub mod power;
pub mod provisioner;
pub mod storage;
pub mod template;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::disk::DiskRegistry;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::exports::ExportCoordinator;
    pub use crate::models::{Disk, Node, NodeStatus, TemplateInfo};
    pub use crate::power::{PowerAction, PowerController};
    pub use crate::provisioner::NodeLifecycleManager;
    pub use crate::storage::{NodeRepository, SharedNodeRepository};
    pub use crate::template::{Template, TemplateCatalog, TemplateMountPipeline};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{Disk, Node, NodeStatus};
