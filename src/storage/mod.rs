//! Durable storage for node records
//!
//! Only nodes are persisted. Disks and templates are rebuilt from the
//! filesystem at startup.

pub mod repository;

pub use repository::{
    create_mock_repository, create_sqlite_repository, MockNodeRepository, NodeRepository,
    SharedNodeRepository, SqliteNodeRepository,
};
