//! Node provisioning service
//!
//! This module ties the disk registry, template pipeline and export
//! coordinator together behind the node lifecycle manager, and exposes it
//! over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           Provisioner Server             │
//! │                                          │
//! │  ┌────────────────────────────────────┐  │
//! │  │          REST API                  │  │
//! │  │  GET    /api/v1/fridge             │  │
//! │  │  GET    /api/v1/oven               │  │
//! │  │  POST   /api/v1/oven               │  │
//! │  │  DELETE /api/v1/oven/{id}          │  │
//! │  │  GET    /api/v1/boot/{id}/{*file}  │  │
//! │  └────────────────────────────────────┘  │
//! │                  │                       │
//! │  ┌────────────────────────────────────┐  │
//! │  │     Node Lifecycle Manager         │  │
//! │  │  - Per-node locks                  │  │
//! │  │  - Bake / unbake                   │  │
//! │  │  - Crash recovery                  │  │
//! │  └────────────────────────────────────┘  │
//! │       │            │             │       │
//! │  DiskRegistry  TemplateCatalog  Exports  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use bakery::provisioner::{ProvisionerServer, ServerConfig};
//!
//! let server = ProvisionerServer::new(ServerConfig::default(), manager)?;
//! server.start_with_shutdown(shutdown_signal()).await?;
//! ```

pub mod api;
pub mod config;
pub mod locks;
pub mod manager;
pub mod server;

// Re-export main types
pub use config::ServerConfig;
pub use locks::NodeLocks;
pub use manager::{BootSource, ManagerConfig, NodeLifecycleManager, NODE_FILES_DIR};
pub use server::{AppState, ProvisionerServer, ServerError};
