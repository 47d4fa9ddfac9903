//! Common test utilities
//!
//! Fakes for the external tools driven by the mount pipeline, and a harness
//! that wires a complete lifecycle manager inside a temporary directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use bakery::disk::DiskRegistry;
use bakery::error::{Error, Result};
use bakery::exports::{ExportConfig, ExportCoordinator};
use bakery::power::{MockPowerController, PowerController};
use bakery::provisioner::{ManagerConfig, NodeLifecycleManager, ProvisionerServer, ServerConfig};
use bakery::storage::{create_mock_repository, SharedNodeRepository};
use bakery::template::{
    BulkCopier, MountAttempt, Mounter, PartitionMapper, PipelineConfig, TemplateCatalog,
    TemplateMountPipeline,
};
use bakery::utils::retry::RetryConfig;

pub const TEMPLATE: &str = "raspbian";

// ============================================================================
// Fake partition mapper
// ============================================================================

/// Creates `loop<N>p<M>` device files the way kpartx announces them
pub struct FakeMapper {
    device_dir: PathBuf,
    partitions: AtomicUsize,
    create_devices: AtomicBool,
    loops: Mutex<HashMap<PathBuf, usize>>,
    pub map_calls: AtomicUsize,
    pub unmap_calls: AtomicUsize,
}

impl FakeMapper {
    pub fn new(device_dir: &Path) -> Self {
        std::fs::create_dir_all(device_dir).unwrap();
        Self {
            device_dir: device_dir.to_path_buf(),
            partitions: AtomicUsize::new(2),
            create_devices: AtomicBool::new(true),
            loops: Mutex::new(HashMap::new()),
            map_calls: AtomicUsize::new(0),
            unmap_calls: AtomicUsize::new(0),
        }
    }

    /// Number of partitions reported for every image
    pub fn set_partitions(&self, count: usize) {
        self.partitions.store(count, Ordering::SeqCst);
    }

    /// Report partitions without creating their device files
    pub fn set_create_devices(&self, create: bool) {
        self.create_devices.store(create, Ordering::SeqCst);
    }

    pub fn maps(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    fn loop_index(&self, image: &Path) -> usize {
        let mut loops = self.loops.lock().unwrap();
        let next = loops.len();
        *loops.entry(image.to_path_buf()).or_insert(next)
    }
}

#[async_trait]
impl PartitionMapper for FakeMapper {
    async fn map(&self, image: &Path) -> Result<String> {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        let index = self.loop_index(image);

        let mut output = String::new();
        for partition in 1..=self.partitions.load(Ordering::SeqCst) {
            let name = format!("loop{index}p{partition}");
            if self.create_devices.load(Ordering::SeqCst) {
                std::fs::write(self.device_dir.join(&name), b"")?;
            }
            output.push_str(&format!(
                "add map {name} (253:{partition}): 0 524288 linear 7:{index} 8192\n"
            ));
        }
        Ok(output)
    }

    async fn unmap(&self, image: &Path) -> Result<()> {
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);
        let index = self.loop_index(image);
        for partition in 1..=4 {
            let _ = std::fs::remove_file(self.device_dir.join(format!("loop{index}p{partition}")));
        }
        Ok(())
    }
}

// ============================================================================
// Fake mounter
// ============================================================================

/// "Mounts" a partition by copying a fixture tree into the target.
///
/// Partition 1 only accepts vfat and every other partition only ext4, so
/// the filesystem fallback is exercised.
pub struct FakeMounter {
    boot_fixture: PathBuf,
    root_fixture: PathBuf,
    mounted: Mutex<HashSet<PathBuf>>,
    fail_unmount: AtomicBool,
    pub mount_calls: AtomicUsize,
}

impl FakeMounter {
    pub fn new(boot_fixture: &Path, root_fixture: &Path) -> Self {
        Self {
            boot_fixture: boot_fixture.to_path_buf(),
            root_fixture: root_fixture.to_path_buf(),
            mounted: Mutex::new(HashSet::new()),
            fail_unmount: AtomicBool::new(false),
            mount_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        let mut mounted: Vec<PathBuf> = self.mounted.lock().unwrap().iter().cloned().collect();
        mounted.sort();
        mounted
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> MountAttempt {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);

        if !device.exists() {
            return MountAttempt::Failed(format!("special device {} does not exist", device.display()));
        }

        let is_boot = device.to_string_lossy().ends_with("p1");
        let expected = if is_boot { "vfat" } else { "ext4" };
        if fs_type != expected {
            return MountAttempt::Failed(format!("wrong fs type, bad superblock on {}", device.display()));
        }

        let mut mounted = self.mounted.lock().unwrap();
        if mounted.contains(target) {
            return MountAttempt::Busy;
        }

        let fixture = if is_boot { &self.boot_fixture } else { &self.root_fixture };
        if let Err(e) = copy_dir(fixture, target) {
            return MountAttempt::Failed(e.to_string());
        }
        mounted.insert(target.to_path_buf());
        MountAttempt::Mounted
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(Error::Unmount {
                target: target.to_path_buf(),
                reason: "target is busy".to_string(),
            });
        }

        if !self.mounted.lock().unwrap().remove(target) {
            return Err(Error::Unmount {
                target: target.to_path_buf(),
                reason: "not mounted".to_string(),
            });
        }

        std::fs::remove_dir_all(target)?;
        std::fs::create_dir_all(target)?;
        Ok(())
    }
}

// ============================================================================
// Fake copier
// ============================================================================

/// Recursive copy with failure injection and a concurrency probe
#[derive(Default)]
pub struct FakeCopier {
    fail: AtomicBool,
    delay: Mutex<Duration>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub copies: AtomicUsize,
}

impl FakeCopier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold every copy open for `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl BulkCopier for FakeCopier {
    async fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Copy {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                reason: "injected failure".to_string(),
            });
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let copied = copy_dir(from, to);

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.copies.fetch_add(1, Ordering::SeqCst);
        copied.map_err(Error::from)
    }
}

/// Copy the content of `from` into `to`
pub fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let destination = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), destination)?;
        }
    }
    Ok(())
}

// ============================================================================
// Harness
// ============================================================================

/// Write the partition fixtures of a small Raspberry Pi image
pub fn write_fixtures(root: &Path) -> (PathBuf, PathBuf) {
    let boot = root.join("fixtures/boot");
    let rootfs = root.join("fixtures/root");

    std::fs::create_dir_all(boot.join("firmware/overlays")).unwrap();
    std::fs::write(boot.join("firmware/start4.elf"), b"firmware").unwrap();
    std::fs::write(boot.join("firmware/overlays/dwc2.dtbo"), b"overlay").unwrap();
    std::fs::write(boot.join("kernel8.img"), b"kernel").unwrap();
    std::fs::write(boot.join("cmdline.txt"), b"console=serial0,115200 root=/dev/nfs").unwrap();

    std::fs::create_dir_all(rootfs.join("etc")).unwrap();
    std::fs::create_dir_all(rootfs.join("bin")).unwrap();
    std::fs::write(rootfs.join("etc/hostname"), b"raspberrypi\n").unwrap();
    std::fs::write(rootfs.join("bin/sh"), b"#!").unwrap();

    (boot, rootfs)
}

/// A complete lifecycle manager on top of the fakes
pub struct Harness {
    pub dir: TempDir,
    pub repository: SharedNodeRepository,
    pub mapper: Arc<FakeMapper>,
    pub mounter: Arc<FakeMounter>,
    pub copier: Arc<FakeCopier>,
    pub power: Arc<MockPowerController>,
    pub pipeline: Arc<TemplateMountPipeline>,
    pub manager: Arc<NodeLifecycleManager>,
}

impl Harness {
    /// Harness with an in-memory node store and the `raspbian` template
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::build(dir, create_mock_repository()).await
    }

    /// Harness over an existing directory and node store
    pub async fn build(dir: TempDir, repository: SharedNodeRepository) -> Self {
        let root = dir.path().to_path_buf();
        let (boot, rootfs) = write_fixtures(&root);

        let template_dir = root.join("templates");
        std::fs::create_dir_all(&template_dir).unwrap();
        let image = template_dir.join(format!("{TEMPLATE}.img"));
        if !image.exists() {
            std::fs::write(&image, b"raw image").unwrap();
        }

        let mapper = Arc::new(FakeMapper::new(&root.join("dev")));
        let mounter = Arc::new(FakeMounter::new(&boot, &rootfs));
        let copier = Arc::new(FakeCopier::new());
        let power = Arc::new(MockPowerController::new());

        let pipeline = Arc::new(TemplateMountPipeline::new(
            mapper.clone(),
            mounter.clone(),
            copier.clone(),
            PipelineConfig {
                mount_root: root.join("mnt"),
                device_dir: root.join("dev"),
                settle_timeout: Duration::from_millis(200),
                settle_poll_interval: Duration::from_millis(10),
                filesystems: vec!["vfat".to_string(), "ext4".to_string()],
                teardown_retry: RetryConfig::with_delays(1, 1, 5),
            },
        ));

        let exports = Arc::new(ExportCoordinator::new(
            repository.clone(),
            root.join("disks"),
            ExportConfig::new(root.join("exports/bakery.exports")),
        ));

        let templates = Arc::new(
            TemplateCatalog::load(&template_dir, root.join("boot"), pipeline.clone())
                .await
                .unwrap(),
        );
        let disks = Arc::new(
            DiskRegistry::open(root.join("disks"), pipeline.clone(), exports.clone())
                .await
                .unwrap(),
        );

        let power_controller: Arc<dyn PowerController> = power.clone();
        let manager = NodeLifecycleManager::new(
            repository.clone(),
            templates,
            disks,
            exports,
            power_controller,
            ManagerConfig {
                power_cycle_delay: Duration::ZERO,
            },
        )
        .await
        .unwrap();

        Self {
            dir,
            repository,
            mapper,
            mounter,
            copier,
            power,
            pipeline,
            manager: Arc::new(manager),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn disk_root(&self) -> PathBuf {
        self.root().join("disks")
    }

    pub fn export_file(&self) -> PathBuf {
        self.root().join("exports/bakery.exports")
    }

    /// Disk folders currently present under the disk root
    pub fn disk_folders(&self) -> Vec<String> {
        let mut folders: Vec<String> = std::fs::read_dir(self.disk_root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        folders.sort();
        folders
    }

    pub fn router(&self) -> axum::Router {
        let config = ServerConfig::listening_on("127.0.0.1:0").unwrap();
        ProvisionerServer::new(config, self.manager.clone())
            .unwrap()
            .build_router()
    }
}
