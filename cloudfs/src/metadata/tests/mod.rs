//! Test scenarios every [MetadataStore] needs to pass, applied to all
//! implementations through an [rstest_reuse] template.

use std::{sync::Arc, time::SystemTime};

use rstest::*;
use rstest_reuse::{self, *};

use super::{
    Block, MemoryMetadataStore, MetadataStore, NewNode, NodeId, NodeKind, NodeUpdate,
    RedbMetadataStore, ROOT_NODE_ID,
};
use crate::{B3Digest, Error};

#[template]
#[rstest]
#[case::memory(Arc::new(MemoryMetadataStore::default()))]
#[case::redb(Arc::new(RedbMetadataStore::new_temporary().unwrap()))]
pub fn metadata_stores(#[case] store: Arc<dyn MetadataStore>) {}

fn new_node(parent: NodeId, name: &str, kind: NodeKind) -> NewNode<'_> {
    NewNode {
        parent,
        name,
        kind,
        permissions: 0o644,
        now: SystemTime::now(),
    }
}

fn block(position: u64, contents: &[u8]) -> Block {
    Block {
        position,
        digest: B3Digest::of(contents),
        length: contents.len() as u64,
    }
}

async fn names(store: &Arc<dyn MetadataStore>, parent: NodeId) -> Vec<String> {
    store
        .list_children(parent)
        .await
        .expect("list_children must succeed")
        .into_iter()
        .map(|n| n.name)
        .collect()
}

/// A fresh store only contains the root directory.
#[apply(metadata_stores)]
#[tokio::test]
async fn root_exists(store: Arc<dyn MetadataStore>) {
    let root = store
        .get_node(ROOT_NODE_ID)
        .await
        .unwrap()
        .expect("root must exist");

    assert!(root.is_root());
    assert!(root.is_directory());
    assert_eq!(None, root.parent);
    assert!(names(&store, ROOT_NODE_ID).await.is_empty());
}

/// Inserted nodes can be looked up by id and by name.
#[apply(metadata_stores)]
#[tokio::test]
async fn insert_lookup(store: Arc<dyn MetadataStore>) {
    let dir = store
        .insert_node(new_node(ROOT_NODE_ID, "docs", NodeKind::Directory))
        .await
        .expect("insert must succeed");
    let file = store
        .insert_node(new_node(dir.id, "a.txt", NodeKind::File))
        .await
        .expect("insert must succeed");

    assert_ne!(dir.id, file.id);
    assert_eq!(Some(dir.id), file.parent);
    assert_eq!(Some(file.clone()), store.get_node(file.id).await.unwrap());
    assert_eq!(
        Some(file),
        store.lookup_child(dir.id, "a.txt").await.unwrap()
    );
    assert_eq!(None, store.lookup_child(dir.id, "b.txt").await.unwrap());
    assert_eq!(None, store.get_node(12345).await.unwrap());
}

#[apply(metadata_stores)]
#[tokio::test]
async fn insert_failures(store: Arc<dyn MetadataStore>) {
    let file = store
        .insert_node(new_node(ROOT_NODE_ID, "a", NodeKind::File))
        .await
        .unwrap();

    assert!(matches!(
        store
            .insert_node(new_node(ROOT_NODE_ID, "a", NodeKind::Directory))
            .await,
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(
        store.insert_node(new_node(file.id, "b", NodeKind::File)).await,
        Err(Error::NotADirectory(_))
    ));
    assert!(matches!(
        store.insert_node(new_node(999, "b", NodeKind::File)).await,
        Err(Error::NotFound(_))
    ));

    // failed inserts leave nothing behind
    assert_eq!(vec!["a".to_string()], names(&store, ROOT_NODE_ID).await);
}

/// Children are listed in creation order, not by name.
#[apply(metadata_stores)]
#[tokio::test]
async fn list_children_creation_order(store: Arc<dyn MetadataStore>) {
    for name in ["zeta", "alpha", "mu"] {
        store
            .insert_node(new_node(ROOT_NODE_ID, name, NodeKind::File))
            .await
            .unwrap();
    }

    assert_eq!(
        vec!["zeta".to_string(), "alpha".to_string(), "mu".to_string()],
        names(&store, ROOT_NODE_ID).await
    );
}

#[apply(metadata_stores)]
#[tokio::test]
async fn move_node(store: Arc<dyn MetadataStore>) {
    let a = store
        .insert_node(new_node(ROOT_NODE_ID, "a", NodeKind::Directory))
        .await
        .unwrap();
    let b = store
        .insert_node(new_node(ROOT_NODE_ID, "b", NodeKind::Directory))
        .await
        .unwrap();
    let f = store
        .insert_node(new_node(a.id, "f", NodeKind::File))
        .await
        .unwrap();
    store.put_block(f.id, block(0, b"data")).await.unwrap();

    store.move_node(f.id, b.id, "g").await.expect("move must succeed");

    assert!(names(&store, a.id).await.is_empty());
    assert_eq!(vec!["g".to_string()], names(&store, b.id).await);

    let moved = store.get_node(f.id).await.unwrap().unwrap();
    assert_eq!(Some(b.id), moved.parent);
    assert_eq!("g", moved.name);
    // blocks stay with the node
    assert_eq!(vec![block(0, b"data")], store.get_blocks(f.id).await.unwrap());

    // moving onto itself is a no-op
    store.move_node(f.id, b.id, "g").await.expect("must succeed");
    assert_eq!(vec!["g".to_string()], names(&store, b.id).await);
}

#[apply(metadata_stores)]
#[tokio::test]
async fn move_node_failures(store: Arc<dyn MetadataStore>) {
    let a = store
        .insert_node(new_node(ROOT_NODE_ID, "a", NodeKind::Directory))
        .await
        .unwrap();
    let sub = store
        .insert_node(new_node(a.id, "sub", NodeKind::Directory))
        .await
        .unwrap();
    let f = store
        .insert_node(new_node(ROOT_NODE_ID, "f", NodeKind::File))
        .await
        .unwrap();

    assert!(matches!(
        store.move_node(a.id, sub.id, "a").await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        store.move_node(a.id, a.id, "x").await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        store.move_node(ROOT_NODE_ID, a.id, "root").await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        store.move_node(f.id, ROOT_NODE_ID, "a").await,
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(
        store.move_node(sub.id, f.id, "sub").await,
        Err(Error::NotADirectory(_))
    ));
    assert!(matches!(
        store.move_node(999, ROOT_NODE_ID, "x").await,
        Err(Error::NotFound(_))
    ));

    assert_eq!(
        vec!["a".to_string(), "f".to_string()],
        names(&store, ROOT_NODE_ID).await
    );
    assert_eq!(vec!["sub".to_string()], names(&store, a.id).await);
}

#[apply(metadata_stores)]
#[tokio::test]
async fn remove_node(store: Arc<dyn MetadataStore>) {
    let dir = store
        .insert_node(new_node(ROOT_NODE_ID, "dir", NodeKind::Directory))
        .await
        .unwrap();
    let f = store
        .insert_node(new_node(dir.id, "f", NodeKind::File))
        .await
        .unwrap();
    store.put_block(f.id, block(0, b"abcd")).await.unwrap();

    assert!(matches!(
        store.remove_node(dir.id).await,
        Err(Error::NotEmpty(_))
    ));
    assert!(matches!(
        store.remove_node(ROOT_NODE_ID).await,
        Err(Error::InvalidRequest(_))
    ));

    assert_eq!(f, store.remove_node(f.id).await.expect("must succeed"));
    assert_eq!(None, store.get_node(f.id).await.unwrap());
    assert!(store.get_blocks(f.id).await.unwrap().is_empty());

    store.remove_node(dir.id).await.expect("must succeed");
    assert!(names(&store, ROOT_NODE_ID).await.is_empty());
    assert!(matches!(
        store.remove_node(dir.id).await,
        Err(Error::NotFound(_))
    ));

    // the name is free again, and ids are never reused
    let again = store
        .insert_node(new_node(ROOT_NODE_ID, "dir", NodeKind::File))
        .await
        .unwrap();
    assert!(again.id > f.id);
}

#[apply(metadata_stores)]
#[tokio::test]
async fn update_node(store: Arc<dyn MetadataStore>) {
    let f = store
        .insert_node(new_node(ROOT_NODE_ID, "f", NodeKind::File))
        .await
        .unwrap();
    let later = f.created_at + std::time::Duration::from_secs(10);

    let updated = store
        .update_node(
            f.id,
            NodeUpdate {
                permissions: Some(0o600),
                updated_at: Some(later),
                ..Default::default()
            },
        )
        .await
        .expect("must succeed");

    assert_eq!(0o600, updated.permissions);
    assert_eq!(later, updated.updated_at);
    assert_eq!(f.accessed_at, updated.accessed_at);
    assert_eq!(f.created_at, updated.created_at);
    assert_eq!(Some(updated), store.get_node(f.id).await.unwrap());

    assert!(matches!(
        store.update_node(999, NodeUpdate::default()).await,
        Err(Error::NotFound(_))
    ));
}

#[apply(metadata_stores)]
#[tokio::test]
async fn updates_of_different_fields_are_kept(store: Arc<dyn MetadataStore>) {
    let f = store
        .insert_node(new_node(ROOT_NODE_ID, "f", NodeKind::File))
        .await
        .unwrap();
    let later = f.created_at + std::time::Duration::from_secs(10);

    let (chmod, touch) = tokio::join!(
        store.update_node(
            f.id,
            NodeUpdate {
                permissions: Some(0o600),
                ..Default::default()
            },
        ),
        store.update_node(
            f.id,
            NodeUpdate {
                accessed_at: Some(later),
                ..Default::default()
            },
        )
    );
    chmod.unwrap();
    touch.unwrap();

    let node = store.get_node(f.id).await.unwrap().expect("must exist");
    assert_eq!(0o600, node.permissions);
    assert_eq!(later, node.accessed_at);
}

#[apply(metadata_stores)]
#[tokio::test]
async fn blocks(store: Arc<dyn MetadataStore>) {
    let f = store
        .insert_node(new_node(ROOT_NODE_ID, "f", NodeKind::File))
        .await
        .unwrap();

    assert!(store.get_blocks(f.id).await.unwrap().is_empty());

    assert_eq!(None, store.put_block(f.id, block(0, b"ABCD")).await.unwrap());
    assert_eq!(None, store.put_block(f.id, block(1, b"EFGH")).await.unwrap());

    // positions must stay contiguous
    assert!(matches!(
        store.put_block(f.id, block(3, b"XX")).await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        store.put_block(999, block(0, b"XX")).await,
        Err(Error::NotFound(_))
    ));

    assert_eq!(
        Some(block(1, b"EFGH")),
        store.put_block(f.id, block(1, b"EF")).await.unwrap()
    );
    assert_eq!(None, store.put_block(f.id, block(2, b"IJ")).await.unwrap());

    assert_eq!(
        vec![block(0, b"ABCD"), block(1, b"EF"), block(2, b"IJ")],
        store.get_blocks(f.id).await.unwrap()
    );

    assert_eq!(
        vec![block(1, b"EF"), block(2, b"IJ")],
        store.truncate_blocks(f.id, 1).await.unwrap()
    );
    assert!(store.truncate_blocks(f.id, 5).await.unwrap().is_empty());
    assert_eq!(vec![block(0, b"ABCD")], store.get_blocks(f.id).await.unwrap());
}

#[apply(metadata_stores)]
#[tokio::test]
async fn block_size(store: Arc<dyn MetadataStore>) {
    store.ensure_block_size(4).await.expect("first use must succeed");
    store.ensure_block_size(4).await.expect("same size must succeed");

    assert!(matches!(
        store.ensure_block_size(8).await,
        Err(Error::InvalidRequest(_))
    ));
}

/// Data written to a redb file survives reopening it.
#[tokio::test]
async fn redb_persistence() {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let path = tmpdir.path().join("meta.redb");

    let f = {
        let store = RedbMetadataStore::new(path.clone()).await.unwrap();
        store.ensure_block_size(4).await.unwrap();
        let f = store
            .insert_node(new_node(ROOT_NODE_ID, "f", NodeKind::File))
            .await
            .unwrap();
        store.put_block(f.id, block(0, b"ABCD")).await.unwrap();
        f
    };

    let store = RedbMetadataStore::new(path).await.unwrap();
    assert_eq!(
        Some(f.clone()),
        store.lookup_child(ROOT_NODE_ID, "f").await.unwrap()
    );
    assert_eq!(vec![block(0, b"ABCD")], store.get_blocks(f.id).await.unwrap());
    assert!(matches!(
        store.ensure_block_size(8).await,
        Err(Error::InvalidRequest(_))
    ));

    // ids keep counting up after reopening
    let g = store
        .insert_node(new_node(ROOT_NODE_ID, "g", NodeKind::File))
        .await
        .unwrap();
    assert!(g.id > f.id);
}
