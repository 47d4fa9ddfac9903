use anyhow::{Context, Result};

use bakery::config::Config;
use bakery::models::NodeStatus;
use bakery::storage::{NodeRepository, SqliteNodeRepository};
use bakery::template::list_images;

/// Print the node records, optionally filtered by status
pub fn nodes(config: &Config, status: Option<&str>) -> Result<()> {
    let repository = SqliteNodeRepository::new(&config.storage.database_path)
        .context("Failed to open node database")?;

    let nodes = match status {
        Some(raw) => {
            let status: NodeStatus = raw.parse().map_err(anyhow::Error::msg)?;
            repository.list_by_status(status)?
        }
        None => repository.list_all()?,
    };

    println!("Nodes ({})", nodes.len());
    println!("{:-<72}", "");
    println!("{:<20} {:<14} {:<20} {}", "ID", "STATUS", "TEMPLATE", "DISKS");
    for node in &nodes {
        println!(
            "{:<20} {:<14} {:<20} {}",
            node.id,
            node.status,
            node.template.as_deref().unwrap_or("-"),
            if node.disks.is_empty() {
                "-".to_string()
            } else {
                node.disks.join(",")
            }
        );
    }

    Ok(())
}

/// Print the template images found in the template folder
pub async fn templates(config: &Config) -> Result<()> {
    let dir = &config.images.template_dir;

    let images = list_images(dir)
        .await
        .with_context(|| format!("Failed to read template folder: {}", dir.display()))?;

    println!("Templates in {} ({})", dir.display(), images.len());
    println!("{:-<60}", "");
    for image in &images {
        let name = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size_mib = tokio::fs::metadata(image)
            .await
            .map(|m| m.len() / (1024 * 1024))
            .unwrap_or(0);
        let boot_ready = config.images.boot_root.join(&name).is_dir();
        println!(
            "{:<30} {:>10} MiB  boot artifacts: {}",
            name,
            size_mib,
            if boot_ready { "yes" } else { "no" }
        );
    }

    Ok(())
}
