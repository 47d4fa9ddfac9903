use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use bakery::config::Config;
use bakery::disk::DiskRegistry;
use bakery::exports::ExportCoordinator;
use bakery::power::{ExecPowerController, PowerController};
use bakery::provisioner::{NodeLifecycleManager, ProvisionerServer};
use bakery::storage::create_sqlite_repository;
use bakery::template::{
    KpartxMapper, RsyncCopier, SystemMounter, TemplateCatalog, TemplateMountPipeline,
};

/// Parameters for the serve command
#[derive(Debug, Clone)]
pub struct ServeParams {
    pub config: Config,

    /// Overrides `server.bind_address`
    pub bind: Option<String>,
}

/// Load configuration from a file, or from the environment when no file is
/// given
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Build the full provisioning stack on top of the host tools
pub async fn build_manager(config: &Config) -> Result<Arc<NodeLifecycleManager>> {
    let repository = create_sqlite_repository(&config.storage.database_path)
        .context("Failed to open node database")?;

    let exports = Arc::new(ExportCoordinator::new(
        repository.clone(),
        &config.storage.disk_root,
        config.export_config(),
    ));

    let pipeline = Arc::new(TemplateMountPipeline::new(
        Arc::new(KpartxMapper::new(
            config.images.mapper_program.clone(),
            config.command_timeout(),
        )),
        Arc::new(SystemMounter::new(config.command_timeout())),
        Arc::new(RsyncCopier::new(
            config.images.copy_program.clone(),
            config.copy_timeout(),
        )),
        config.pipeline_config(),
    ));

    let templates = Arc::new(
        TemplateCatalog::load(
            &config.images.template_dir,
            &config.images.boot_root,
            pipeline.clone(),
        )
        .await
        .context("Failed to load templates")?,
    );

    let disks = Arc::new(
        DiskRegistry::open(&config.storage.disk_root, pipeline, exports.clone())
            .await
            .context("Failed to open disk registry")?,
    );

    let power: Arc<dyn PowerController> = Arc::new(
        ExecPowerController::new(config.power.program.clone(), config.power_timeout())
            .with_args(config.power.args.clone()),
    );

    let manager = NodeLifecycleManager::new(
        repository,
        templates,
        disks,
        exports,
        power,
        config.manager_config(),
    )
    .await
    .context("Failed to start node lifecycle manager")?;

    Ok(Arc::new(manager))
}

/// Start the provisioning server
pub async fn serve(params: ServeParams) -> Result<()> {
    let mut config = params.config;
    if let Some(bind) = params.bind {
        config.server.bind_address = bind
            .parse()
            .with_context(|| format!("Invalid bind address: {bind}"))?;
    }

    println!("Starting Bakery Provisioning Server");
    println!("===================================");
    println!("  Database: {}", config.storage.database_path.display());
    println!("  Disk Root: {}", config.storage.disk_root.display());
    println!("  Templates: {}", config.images.template_dir.display());
    println!("  Boot Artifacts: {}", config.images.boot_root.display());
    println!("  Export File: {}", config.storage.export_file.display());
    println!("  Power Program: {}", config.power.program);
    println!();

    if let Err(e) = bakery::metrics::init_metrics() {
        tracing::warn!("Failed to initialize metrics: {}", e);
    }

    let manager = build_manager(&config).await?;
    let bind_address = config.server.bind_address;

    let server = ProvisionerServer::new(config.server.clone(), manager)
        .context("Failed to create provisioning server")?;

    println!("{}", server.info().display());
    println!();
    println!("API Endpoints:");
    println!("  GET    /api/health                        - Health check");
    println!("  GET    /metrics                           - Prometheus metrics endpoint");
    println!("  GET    /api/v1/fridge                     - Available nodes");
    println!("  GET    /api/v1/oven                       - Provisioning and ready nodes");
    println!("  POST   /api/v1/oven                       - Bake a node");
    println!("  DELETE /api/v1/oven/{{id}}                  - Unbake a node");
    println!("  GET    /api/v1/nodes                      - List all nodes");
    println!("  POST   /api/v1/nodes/{{id}}/reboot          - Power-cycle a node");
    println!("  POST   /api/v1/nodes/{{id}}/disks           - Attach a disk");
    println!("  PUT    /api/v1/nodes/{{id}}/files/{{*path}}   - Write a node file");
    println!("  GET    /api/v1/disks                      - List disks");
    println!("  POST   /api/v1/disks                      - Create an empty disk");
    println!("  GET    /api/v1/templates                  - List templates");
    println!("  PUT    /api/v1/templates/{{name}}           - Upload a template image");
    println!("  GET    /api/v1/boot/{{id}}/{{*file}}          - Serve a boot file");
    println!("  GET    /api/v1/exports                    - Export file status");
    println!();
    println!("Provisioning server listening on http://{bind_address}");
    println!("Press Ctrl+C to stop.\n");

    server
        .start_with_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                }
                Err(e) => {
                    tracing::error!("Failed to wait for Ctrl+C: {}", e);
                }
            }
        })
        .await?;

    println!("Provisioning server stopped.");
    Ok(())
}
