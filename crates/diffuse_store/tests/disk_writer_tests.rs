//! Integration tests for the disk image writer.

use diffuse_store::{DiskImageWriter, ImageWriter, StoreError};

// 1x1 transparent PNG
const PIXEL: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

#[tokio::test]
async fn test_saves_every_image_under_day_directory() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("txt2img");

    let saved = DiskImageWriter::new()
        .save_images(&[PIXEL.to_string(), PIXEL.to_string()], &dest)
        .await
        .unwrap();

    assert_eq!(saved.saved_paths.len(), 2);
    for path in &saved.saved_paths {
        assert!(path.exists());
        assert_eq!(path.parent().unwrap().parent().unwrap(), dest);
        assert_eq!(path.extension().unwrap(), "png");
    }
    assert_eq!(saved.primary_path, saved.saved_paths[0].display().to_string());

    let bytes = saved.primary_image.unwrap();
    assert_eq!(&bytes[1..4], b"PNG");
    assert_eq!(std::fs::read(&saved.saved_paths[0]).unwrap(), bytes);
}

#[tokio::test]
async fn test_second_batch_does_not_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DiskImageWriter::new();

    let first = writer.save_images(&[PIXEL.to_string()], dir.path()).await.unwrap();
    let second = writer.save_images(&[PIXEL.to_string()], dir.path()).await.unwrap();

    assert_ne!(first.saved_paths[0], second.saved_paths[0]);
    assert!(first.saved_paths[0].exists());
    assert!(second.saved_paths[0].exists());
}

#[tokio::test]
async fn test_bad_payload_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("txt2img");

    let err = DiskImageWriter::new()
        .save_images(&[PIXEL.to_string(), "not base64!".to_string()], &dest)
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Decode { index: 1, .. }));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = DiskImageWriter::new().save_images(&[], dir.path()).await.unwrap_err();
    assert!(matches!(err, StoreError::Empty));
}
