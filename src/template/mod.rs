//! Templates (bakeforms) and the catalog that loads them
//!
//! A template is a read-only two-partition disk image stored as
//! `<template_dir>/<name>.img`. Its boot partition is copied once into
//! `<boot_root>/<name>` and served to booting nodes; its root partition is
//! cloned into a fresh disk for every bake.

pub mod pipeline;
pub mod system;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::{Error, ResourceKind, Result};
use crate::models::TemplateInfo;

pub use pipeline::{PipelineConfig, TemplateMountPipeline};
pub use system::{
    BulkCopier, KpartxMapper, MountAttempt, Mounter, PartitionMapper, RsyncCopier, SystemMounter,
};

const IMAGE_EXTENSION: &str = "img";

/// Mount points of an open mount session; index 0 is boot, index 1 is root
#[derive(Debug, Default)]
pub struct MountSession {
    pub(crate) targets: Vec<PathBuf>,
}

/// A loaded template image
#[derive(Debug)]
pub struct Template {
    pub name: String,
    pub image_path: PathBuf,
    pub boot_artifacts_path: PathBuf,
    pub(crate) session: Mutex<MountSession>,
}

impl Template {
    pub fn new(name: impl Into<String>, image_path: impl Into<PathBuf>, boot_root: &Path) -> Self {
        let name = name.into();
        Self {
            boot_artifacts_path: boot_root.join(&name),
            image_path: image_path.into(),
            name,
            session: Mutex::new(MountSession::default()),
        }
    }

    /// Build a template from an image path, or `None` if it is not a
    /// `*.img` file
    pub fn from_image(image_path: &Path, boot_root: &Path) -> Option<Self> {
        if image_path.extension().and_then(|e| e.to_str()) != Some(IMAGE_EXTENSION) {
            return None;
        }
        let name = image_path.file_stem()?.to_str()?;
        Some(Self::new(name, image_path, boot_root))
    }

    /// Currently recorded mount points
    pub async fn mount_targets(&self) -> Vec<PathBuf> {
        self.session.lock().await.targets.clone()
    }

    pub async fn info(&self) -> TemplateInfo {
        TemplateInfo {
            name: self.name.clone(),
            image_path: self.image_path.clone(),
            boot_artifacts_path: self.boot_artifacts_path.clone(),
            boot_artifacts_ready: tokio::fs::try_exists(&self.boot_artifacts_path)
                .await
                .unwrap_or(false),
            mounted_on: self.mount_targets().await,
        }
    }
}

/// Names become file names, so only a conservative character set is allowed
pub fn is_valid_template_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Templates found in the template directory, keyed by name
pub struct TemplateCatalog {
    template_dir: PathBuf,
    boot_root: PathBuf,
    pipeline: Arc<TemplateMountPipeline>,
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateCatalog {
    /// Scan `template_dir` for images and extract missing boot artifacts.
    ///
    /// Images whose partitions cannot be mapped are logged and skipped.
    pub async fn load(
        template_dir: impl Into<PathBuf>,
        boot_root: impl Into<PathBuf>,
        pipeline: Arc<TemplateMountPipeline>,
    ) -> Result<Self> {
        let catalog = Self {
            template_dir: template_dir.into(),
            boot_root: boot_root.into(),
            pipeline,
            templates: RwLock::new(HashMap::new()),
        };

        tokio::fs::create_dir_all(&catalog.template_dir).await?;
        tokio::fs::create_dir_all(&catalog.boot_root).await?;
        catalog.rescan().await?;

        Ok(catalog)
    }

    pub fn pipeline(&self) -> &Arc<TemplateMountPipeline> {
        &self.pipeline
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Re-read the template directory. Known templates keep their mount
    /// sessions; images that disappeared are dropped.
    pub async fn rescan(&self) -> Result<()> {
        let images = list_images(&self.template_dir).await?;
        let known = self.templates.read().await.clone();

        let mut next = HashMap::new();
        for image in images {
            let Some(template) = Template::from_image(&image, &self.boot_root) else {
                continue;
            };

            if let Some(existing) = known.get(&template.name) {
                next.insert(template.name.clone(), Arc::clone(existing));
                continue;
            }

            match self.pipeline.extract_boot_artifacts(&template).await {
                Ok(_) => {
                    info!(template = %template.name, "Loaded template");
                    next.insert(template.name.clone(), Arc::new(template));
                }
                Err(e) => {
                    error!(template = %template.name, error = %e, "Skipping unusable template");
                }
            }
        }

        *self.templates.write().await = next;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Template>> {
        self.templates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Template, name))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.templates.read().await.contains_key(name)
    }

    /// All templates sorted by name
    pub async fn list(&self) -> Vec<TemplateInfo> {
        let templates: Vec<Arc<Template>> = self.templates.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(templates.len());
        for template in templates {
            infos.push(template.info().await);
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Store a new image as `<name>.img` and extract its boot artifacts.
    ///
    /// An existing template of the same name is never overwritten. If the
    /// image turns out to be unusable the file is removed again.
    pub async fn upload(&self, name: &str, content: &[u8]) -> Result<TemplateInfo> {
        if !is_valid_template_name(name) {
            return Err(Error::InvalidPath(name.to_string()));
        }

        let image_path = self
            .template_dir
            .join(format!("{name}.{IMAGE_EXTENSION}"));

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&image_path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::protected(
                    ResourceKind::Template,
                    name,
                    "a template with this name already exists",
                ));
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);

        let template = Template::new(name, &image_path, &self.boot_root);
        if let Err(e) = self.pipeline.extract_boot_artifacts(&template).await {
            if let Err(cleanup) = tokio::fs::remove_file(&image_path).await {
                warn!(path = %image_path.display(), error = %cleanup, "Failed to remove rejected image");
            }
            return Err(e);
        }

        let template = Arc::new(template);
        let info = template.info().await;
        self.templates
            .write()
            .await
            .insert(name.to_string(), template);

        info!(template = %name, size = content.len(), "Uploaded template");
        Ok(info)
    }

    /// Unmount, drop the boot artifact cache and delete the image
    pub async fn delete(&self, name: &str) -> Result<()> {
        let template = self.get(name).await?;

        self.pipeline.unmount(&template).await?;

        match tokio::fs::remove_dir_all(&template.boot_artifacts_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(template = %name, error = %e, "Failed to remove boot artifacts");
            }
            _ => {}
        }

        match tokio::fs::remove_file(&template.image_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        self.templates.write().await.remove(name);
        info!(template = %name, "Deleted template");
        Ok(())
    }

    /// Tear down every open mount session; used at shutdown
    pub async fn unmount_all(&self) {
        let templates: Vec<Arc<Template>> = self.templates.read().await.values().cloned().collect();

        for template in templates {
            if template.mount_targets().await.is_empty() {
                continue;
            }
            if let Err(e) = self.pipeline.unmount(&template).await {
                warn!(template = %template.name, error = %e, "Failed to unmount template at shutdown");
            }
        }
    }
}

/// `*.img` files directly under `dir`, sorted
pub async fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(IMAGE_EXTENSION)
        {
            images.push(path);
        }
    }

    images.sort();
    Ok(images)
}
