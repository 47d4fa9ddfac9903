pub mod inspect;
pub mod serve;

// Re-export command functions for convenience
pub use inspect::{nodes, templates};
pub use serve::{load_config, serve, ServeParams};
