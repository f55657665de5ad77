//! Persistence of the namespace tree and of the block lists of files.
//!
//! Two logical relations are kept:
//! - nodes: `(id, parent_id?, name, kind, permissions, created_at, updated_at, accessed_at)`,
//!   unique on `(parent_id, name)`.
//! - blocks: `(node_id, position, digest, length)`, unique on `(node_id, position)`.
//!
//! Every mutating call is applied atomically. That's what serializes
//! concurrent namespace mutations touching the same directory.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::{B3Digest, Error};

mod from_addr;
mod memory;
mod redb;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryMetadataStore;
pub use self::redb::RedbMetadataStore;

/// Identifies a node. Ids are allocated monotonically, so they also encode
/// creation order.
pub type NodeId = u64;

/// The id of the root directory, which always exists.
pub const ROOT_NODE_ID: NodeId = 1;

/// Permission bits the root directory is created with.
pub const ROOT_PERMISSIONS: u32 = 0o755;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// A file or directory in the namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    /// None only for the root.
    pub parent: Option<NodeId>,
    /// Empty only for the root.
    pub name: String,
    pub kind: NodeKind,
    pub permissions: u32,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub accessed_at: SystemTime,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_NODE_ID
    }

    /// The root directory, as created when a metadata store is initialized.
    pub(crate) fn root(now: SystemTime) -> Self {
        Self {
            id: ROOT_NODE_ID,
            parent: None,
            name: String::new(),
            kind: NodeKind::Directory,
            permissions: ROOT_PERMISSIONS,
            created_at: now,
            updated_at: now,
            accessed_at: now,
        }
    }
}

/// A chunk of a file's contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Zero-based index of the block inside its file.
    pub position: u64,
    /// Digest of the block's contents.
    pub digest: B3Digest,
    /// Length of the block's contents, in bytes.
    pub length: u64,
}

/// Parameters of a node to be inserted.
#[derive(Clone, Debug)]
pub struct NewNode<'a> {
    pub parent: NodeId,
    pub name: &'a str,
    pub kind: NodeKind,
    pub permissions: u32,
    pub now: SystemTime,
}

/// A change to the mutable fields of a node. `None` fields are left as they
/// are.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    pub permissions: Option<u32>,
    pub updated_at: Option<SystemTime>,
    pub accessed_at: Option<SystemTime>,
}

impl NodeUpdate {
    pub(crate) fn apply(&self, node: &mut Node) {
        if let Some(permissions) = self.permissions {
            node.permissions = permissions;
        }
        if let Some(updated_at) = self.updated_at {
            node.updated_at = updated_at;
        }
        if let Some(accessed_at) = self.accessed_at {
            node.accessed_at = accessed_at;
        }
    }
}

/// The trait all metadata stores need to implement.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Looks up a node by its id.
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, Error>;

    /// Looks up the child of `parent` with the given name.
    async fn lookup_child(&self, parent: NodeId, name: &str) -> Result<Option<Node>, Error>;

    /// Returns all direct children of `parent`, in creation order.
    async fn list_children(&self, parent: NodeId) -> Result<Vec<Node>, Error>;

    /// Inserts a new node below `new_node.parent`.
    /// Fails with [Error::NotFound] if the parent doesn't exist,
    /// [Error::NotADirectory] if it's a file, and [Error::AlreadyExists] if it
    /// already has a child with that name.
    async fn insert_node(&self, new_node: NewNode<'_>) -> Result<Node, Error>;

    /// Reattaches a node below `new_parent` as `new_name`, keeping its id,
    /// subtree and blocks.
    /// Fails like [MetadataStore::insert_node], and with
    /// [Error::InvalidRequest] when moving the root or moving a directory
    /// into its own subtree.
    async fn move_node(&self, id: NodeId, new_parent: NodeId, new_name: &str)
        -> Result<(), Error>;

    /// Removes a node and returns it.
    /// Fails with [Error::NotEmpty] for directories with children. Any blocks
    /// still recorded for the node are dropped along with it.
    async fn remove_node(&self, id: NodeId) -> Result<Node, Error>;

    /// Applies `update` to an existing node, and returns the node as stored
    /// afterwards. Fields not set in `update` keep their current value, so
    /// concurrent updates of different fields don't overwrite each other.
    /// Parent and name are left untouched, use [MetadataStore::move_node].
    async fn update_node(&self, id: NodeId, update: NodeUpdate) -> Result<Node, Error>;

    /// Returns the blocks of a node, ordered by position.
    async fn get_blocks(&self, node: NodeId) -> Result<Vec<Block>, Error>;

    /// Records a block for a node, replacing the one at the same position.
    /// Positions must stay contiguous, so `block.position` may at most be the
    /// current number of blocks.
    /// Returns the replaced block, if any.
    async fn put_block(&self, node: NodeId, block: Block) -> Result<Option<Block>, Error>;

    /// Removes all blocks at positions >= `keep`, and returns them.
    async fn truncate_blocks(&self, node: NodeId, keep: u64) -> Result<Vec<Block>, Error>;

    /// Records the block size on first use, and afterwards ensures it matches.
    async fn ensure_block_size(&self, block_size: u64) -> Result<(), Error>;
}

/// Checks the invariant for [MetadataStore::put_block].
pub(crate) fn check_block_position(node: NodeId, block: &Block, count: u64) -> Result<(), Error> {
    if block.position > count {
        return Err(Error::InvalidRequest(format!(
            "block position {} of node {} would leave a gap after {} blocks",
            block.position, node, count
        )));
    }
    Ok(())
}

/// Checks the invariant for [MetadataStore::ensure_block_size].
pub(crate) fn check_block_size(recorded: u64, requested: u64) -> Result<(), Error> {
    if recorded != requested {
        return Err(Error::InvalidRequest(format!(
            "filesystem was created with block size {}, not {}",
            recorded, requested
        )));
    }
    Ok(())
}

pub(crate) fn to_unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

pub(crate) fn from_unix_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}
