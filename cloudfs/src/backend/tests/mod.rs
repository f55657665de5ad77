//! This contains test scenarios that a given [StorageBackend] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all backends we want to test
//! against, and then apply this template to all test functions.

use std::sync::Arc;

use bytes::Bytes;
use rstest::*;
use rstest_reuse::{self, *};

use super::StorageBackend;
use crate::backend::{self, SimpleFilesystemBackend};
use crate::fixtures::{BLOB_A, BLOB_B};

async fn make_simplefs_backend() -> Arc<dyn StorageBackend> {
    // Leaked on purpose, the directory needs to outlive the test case.
    let tmpdir = tempfile::TempDir::new().unwrap().into_path();
    Arc::new(SimpleFilesystemBackend::new(tmpdir).await.unwrap())
}

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(backend::from_addr("memory://").await.unwrap())]
#[case::objectstore_memory(backend::from_addr("objectstore+memory:///").await.unwrap())]
#[case::simplefs(make_simplefs_backend().await)]
pub fn backends(#[case] backend: Arc<dyn StorageBackend>) {}

/// Getting a missing key returns None, not an error.
#[apply(backends)]
#[tokio::test]
async fn get_nonexistent(backend: Arc<dyn StorageBackend>) {
    assert!(backend.get("blocks/1/missing").await.expect("must not fail").is_none());
    assert!(backend
        .size_of("blocks/1/missing")
        .await
        .expect("must not fail")
        .is_none());
}

/// Put an object, get it back, check its size.
#[apply(backends)]
#[tokio::test]
async fn put_get_size(backend: Arc<dyn StorageBackend>) {
    for (key, contents) in [("blocks/1/a", &*BLOB_A), ("blocks/1/b", &*BLOB_B)] {
        backend
            .put(key, contents.clone())
            .await
            .expect("put must succeed");

        assert_eq!(
            Some(contents.clone()),
            backend.get(key).await.expect("get must succeed")
        );
        assert_eq!(
            Some(contents.len() as u64),
            backend.size_of(key).await.expect("size_of must succeed")
        );
    }
}

/// Putting to an existing key replaces its contents.
#[apply(backends)]
#[tokio::test]
async fn put_overwrites(backend: Arc<dyn StorageBackend>) {
    backend.put("k", BLOB_B.clone()).await.unwrap();
    backend.put("k", BLOB_A.clone()).await.unwrap();

    assert_eq!(Some(BLOB_A.clone()), backend.get("k").await.unwrap());
}

/// Deleting is idempotent.
#[apply(backends)]
#[tokio::test]
async fn delete_idempotent(backend: Arc<dyn StorageBackend>) {
    backend.put("blocks/2/x", BLOB_A.clone()).await.unwrap();

    backend.delete("blocks/2/x").await.expect("delete must succeed");
    assert!(backend.get("blocks/2/x").await.unwrap().is_none());

    backend
        .delete("blocks/2/x")
        .await
        .expect("deleting again must succeed");
}

/// Listing only returns keys with the passed prefix, sorted.
#[apply(backends)]
#[tokio::test]
async fn list_keys_prefix(backend: Arc<dyn StorageBackend>) {
    for key in ["blocks/1/b", "blocks/1/a", "blocks/10/a", "blocks/2/a"] {
        backend.put(key, Bytes::from_static(b"x")).await.unwrap();
    }

    assert_eq!(
        vec!["blocks/1/a".to_string(), "blocks/1/b".to_string()],
        backend.list_keys("blocks/1/").await.expect("must succeed")
    );
    assert_eq!(
        4,
        backend.list_keys("blocks/").await.expect("must succeed").len()
    );
    assert!(backend
        .list_keys("blocks/3/")
        .await
        .expect("must succeed")
        .is_empty());
}

/// Keys with empty, `.` or `..` segments are rejected.
#[apply(backends)]
#[tokio::test]
async fn invalid_keys(backend: Arc<dyn StorageBackend>) {
    for key in ["", "a//b", "../a", "a/./b", "/a"] {
        backend
            .put(key, Bytes::from_static(b"x"))
            .await
            .expect_err("must fail");
    }
}

/// Deleting the last object below a directory removes the directory too.
#[tokio::test]
async fn simplefs_prunes_empty_directories() {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let backend = SimpleFilesystemBackend::new(tmpdir.path().to_path_buf())
        .await
        .unwrap();
    let objects = tmpdir.path().join("objects");

    backend.put("blocks/1/a", BLOB_A.clone()).await.unwrap();
    backend.put("blocks/1/b", BLOB_A.clone()).await.unwrap();
    backend.put("blocks/2/a", BLOB_A.clone()).await.unwrap();

    backend.delete("blocks/1/a").await.unwrap();
    assert!(objects.join("blocks/1").is_dir());

    backend.delete("blocks/1/b").await.unwrap();
    assert!(!objects.join("blocks/1").exists());
    assert!(objects.join("blocks/2").is_dir());

    backend.delete("blocks/2/a").await.unwrap();
    assert!(!objects.join("blocks").exists());
    assert!(objects.is_dir());

    // the directory is recreated on demand
    backend.put("blocks/1/a", BLOB_A.clone()).await.unwrap();
    assert_eq!(Some(BLOB_A.clone()), backend.get("blocks/1/a").await.unwrap());
}
