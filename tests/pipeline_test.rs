//! Integration tests for the template mount pipeline and catalog

mod common;

use std::sync::atomic::Ordering;

use bakery::error::{Error, ResourceKind};

use common::{Harness, TEMPLATE};

// ============================================================================
// Mount sessions
// ============================================================================

#[tokio::test]
async fn test_mount_unmount_and_remount() {
    let h = Harness::new().await;
    let template = h.manager.templates().get(TEMPLATE).await.unwrap();
    let maps_before = h.mapper.maps();

    let targets = h.pipeline.mount(&template).await.unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0], h.root().join("mnt/raspbian-0"));
    assert_eq!(targets[1], h.root().join("mnt/raspbian-1"));
    assert!(targets[0].join("kernel8.img").is_file());
    assert!(targets[1].join("etc/hostname").is_file());
    assert_eq!(h.mapper.maps(), maps_before + 1);

    // Mounting again reuses the open session
    let again = h.pipeline.mount(&template).await.unwrap();
    assert_eq!(again, targets);
    assert_eq!(h.mapper.maps(), maps_before + 1);

    h.pipeline.unmount(&template).await.unwrap();
    assert!(template.mount_targets().await.is_empty());
    assert!(h.mounter.mounted().is_empty());

    // A fresh mount maps the image again
    let remounted = h.pipeline.mount(&template).await.unwrap();
    assert_eq!(remounted, targets);
    assert_eq!(h.mapper.maps(), maps_before + 2);

    h.pipeline.unmount(&template).await.unwrap();
}

#[tokio::test]
async fn test_mount_with_one_partition_fails() {
    let h = Harness::new().await;
    let template = h.manager.templates().get(TEMPLATE).await.unwrap();
    h.mapper.set_partitions(1);

    let err = h.pipeline.mount(&template).await.unwrap_err();
    assert!(matches!(err, Error::Map { .. }));
    assert!(template.mount_targets().await.is_empty());
    assert!(h.mounter.mounted().is_empty());
}

#[tokio::test]
async fn test_missing_devices_time_out() {
    let h = Harness::new().await;
    let template = h.manager.templates().get(TEMPLATE).await.unwrap();
    h.mapper.set_create_devices(false);

    let err = h.pipeline.mount(&template).await.unwrap_err();
    match err {
        Error::Map { reason, .. } => assert!(reason.contains("did not appear")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(template.mount_targets().await.is_empty());
}

#[tokio::test]
async fn test_filesystem_fallback_mounts_root_as_ext4() {
    let h = Harness::new().await;
    let template = h.manager.templates().get(TEMPLATE).await.unwrap();
    let calls_before = h.mounter.mount_calls.load(Ordering::SeqCst);

    h.pipeline.mount(&template).await.unwrap();

    // boot: vfat; root: vfat (rejected) then ext4
    assert_eq!(h.mounter.mount_calls.load(Ordering::SeqCst), calls_before + 3);
    h.pipeline.unmount(&template).await.unwrap();
}

#[tokio::test]
async fn test_failed_teardown_keeps_recorded_targets() {
    let h = Harness::new().await;
    let template = h.manager.templates().get(TEMPLATE).await.unwrap();
    h.manager.register_node("pi-01").await.unwrap();

    h.copier.set_fail(true);
    h.mounter.set_fail_unmount(true);

    let err = h.manager.bake("pi-01", TEMPLATE).await.unwrap_err();
    assert!(matches!(err, Error::Copy { .. }));

    // Targets that could not be unmounted stay recorded for a later teardown
    assert_eq!(template.mount_targets().await.len(), 2);

    h.mounter.set_fail_unmount(false);
    h.pipeline.unmount(&template).await.unwrap();
    assert!(template.mount_targets().await.is_empty());
    assert!(h.mounter.mounted().is_empty());
}

// ============================================================================
// Catalog
// ============================================================================

#[tokio::test]
async fn test_catalog_extracts_boot_artifacts_at_load() {
    let h = Harness::new().await;
    let boot = h.root().join("boot/raspbian");

    assert!(boot.join("kernel8.img").is_file());
    assert!(boot.join("start4.elf").is_file());
    assert!(boot.join("overlays/dwc2.dtbo").is_file());
    assert!(!boot.join("firmware").exists());

    let templates = h.manager.templates().list().await;
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].name, TEMPLATE);
    assert!(h.mounter.mounted().is_empty());
}

#[tokio::test]
async fn test_upload_template() {
    let h = Harness::new().await;

    let info = h
        .manager
        .templates()
        .upload("ubuntu-22.04", b"another raw image")
        .await
        .unwrap();
    assert_eq!(info.name, "ubuntu-22.04");
    assert!(h.root().join("templates/ubuntu-22.04.img").is_file());
    assert!(h.root().join("boot/ubuntu-22.04/kernel8.img").is_file());

    let names: Vec<String> = h
        .manager
        .templates()
        .list()
        .await
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["raspbian", "ubuntu-22.04"]);
}

#[tokio::test]
async fn test_upload_never_overwrites() {
    let h = Harness::new().await;
    let image = h.root().join("templates/raspbian.img");
    let original = std::fs::read(&image).unwrap();

    let err = h
        .manager
        .templates()
        .upload(TEMPLATE, b"replacement")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProtectedResource { kind: ResourceKind::Template, .. }));
    assert_eq!(std::fs::read(&image).unwrap(), original);
}

#[tokio::test]
async fn test_upload_rejects_bad_names_and_images() {
    let h = Harness::new().await;

    let err = h.manager.templates().upload("../evil", b"x").await.unwrap_err();
    assert!(matches!(err, Error::InvalidPath(_)));

    h.mapper.set_partitions(1);
    let err = h.manager.templates().upload("broken", b"x").await.unwrap_err();
    assert!(matches!(err, Error::Map { .. }));
    assert!(!h.root().join("templates/broken.img").exists());
    assert!(!h.manager.templates().contains("broken").await);
}

#[tokio::test]
async fn test_rescan_skips_unusable_images() {
    let h = Harness::new().await;
    std::fs::write(h.root().join("templates/notes.txt"), b"not an image").unwrap();
    std::fs::write(h.root().join("templates/broken.img"), b"x").unwrap();
    h.mapper.set_partitions(0);

    h.manager.templates().rescan().await.unwrap();

    assert!(h.manager.templates().contains(TEMPLATE).await);
    assert!(!h.manager.templates().contains("broken").await);
    assert!(!h.manager.templates().contains("notes").await);
}
