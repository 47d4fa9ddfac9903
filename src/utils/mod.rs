//! Common utilities and helper functions
//!
//! This module provides shared utilities used across the application.

pub mod process;
pub mod retry;

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Join a caller-supplied relative path onto `base`, rejecting absolute
/// paths and any `..` component
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf> {
    let relative_path = Path::new(relative);
    let mut joined = base.to_path_buf();
    let mut pushed = false;

    for component in relative_path.components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(relative.to_string()));
            }
        }
    }

    if !pushed {
        return Err(Error::InvalidPath(relative.to_string()));
    }

    Ok(joined)
}
