//! The POSIX-shaped filesystem call surface, and its FUSE binding.

mod file_attr;

#[cfg(feature = "fuse")]
pub mod fuse;


use std::{io, sync::Arc};

use bytes::Bytes;
use tracing::{debug, instrument};

pub use self::file_attr::{file_type, unix_time, FileAttr, StatFs, STATFS};
use crate::{
    backend::StorageBackend,
    blocks::{BlockStore, Config},
    metadata::{MetadataStore, Node, NodeId, NodeKind},
    namespace::{Namespace, Touch},
    path, Error,
};

/// The filesystem call surface, on top of a [Namespace] and a [BlockStore].
///
/// There's two sets of entry points:
/// - path based ones (`getattr`, `read`, `mkdir`, …), which resolve an
///   absolute path and return POSIX errors as [io::Error].
/// - node based ones (`*_node`), which take node ids and return [Error].
///   The FUSE binding uses these, node ids are used as inode numbers.
///
/// Path based calls resolve the path and then delegate to the node based
/// ones.
#[derive(Clone)]
pub struct CloudFs {
    namespace: Namespace,
    blocks: BlockStore,
}

impl CloudFs {
    /// Sets up a filesystem on the passed backend and metadata store.
    /// Fails if the metadata store was used with a different block size
    /// before.
    pub async fn new(
        backend: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        config: Config,
    ) -> Result<Self, Error> {
        config.validate()?;
        metadata.ensure_block_size(config.block_size).await?;

        Ok(Self {
            namespace: Namespace::new(metadata.clone()),
            blocks: BlockStore::new(backend, metadata, config),
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    async fn attr_of(&self, node: &Node) -> Result<FileAttr, Error> {
        match node.kind {
            NodeKind::Directory => {
                let children = self.namespace.children_of(node.id).await?;
                Ok(FileAttr::new(node, 0, 2 + children.len() as u32))
            }
            NodeKind::File => Ok(FileAttr::new(node, self.blocks.size(node.id).await?, 1)),
        }
    }

    /// Resolves the parent directory of `path`, and returns it along with the
    /// final segment.
    async fn resolve_parent<'p>(&self, path: &'p str) -> Result<(Node, &'p str), Error> {
        let (parent, name) = path::split_parent(path)?;
        Ok((self.namespace.resolve(parent).await?, name))
    }

    async fn file(&self, id: NodeId) -> Result<Node, Error> {
        let node = self.namespace.get(id).await?;
        if node.is_directory() {
            return Err(Error::IsADirectory(node.name));
        }
        Ok(node)
    }

    pub async fn getattr_node(&self, id: NodeId) -> Result<FileAttr, Error> {
        self.attr_of(&self.namespace.get(id).await?).await
    }

    pub async fn lookup_node(&self, parent: NodeId, name: &str) -> Result<FileAttr, Error> {
        let node = self
            .namespace
            .lookup(parent, name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        self.attr_of(&node).await
    }

    /// Lists the children of a directory, in creation order.
    pub async fn readdir_node(&self, id: NodeId) -> Result<Vec<Node>, Error> {
        self.namespace.children_of(id).await
    }

    #[instrument(skip(self), err)]
    pub async fn create_node(
        &self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        mode: u32,
    ) -> Result<FileAttr, Error> {
        let node = self
            .namespace
            .create_child(parent, name, kind, mode & 0o7777)
            .await?;
        self.attr_of(&node).await
    }

    /// Refreshes the access time of a file, and returns its id as handle.
    pub async fn open_node(&self, id: NodeId) -> Result<NodeId, Error> {
        let node = self.namespace.touch(id, Touch::Accessed).await?;
        Ok(node.id)
    }

    pub async fn read_node(&self, id: NodeId, offset: u64, size: u64) -> Result<Bytes, Error> {
        self.file(id).await?;
        self.blocks.read_range(id, offset, size).await
    }

    pub async fn write_node(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize, Error> {
        self.file(id).await?;
        let written = self.blocks.write_range(id, offset, data).await?;
        self.namespace.touch(id, Touch::Updated).await?;

        Ok(written)
    }

    pub async fn truncate_node(&self, id: NodeId, length: u64) -> Result<FileAttr, Error> {
        self.file(id).await?;
        self.blocks.truncate(id, length).await?;
        let node = self.namespace.touch(id, Touch::Updated).await?;

        self.attr_of(&node).await
    }

    pub async fn chmod_node(&self, id: NodeId, mode: u32) -> Result<FileAttr, Error> {
        let node = self.namespace.set_permissions(id, mode & 0o7777).await?;
        self.attr_of(&node).await
    }

    /// Removes a file, releasing its blocks first.
    #[instrument(skip(self), err)]
    pub async fn unlink_node(&self, parent: NodeId, name: &str) -> Result<(), Error> {
        let node = self
            .namespace
            .lookup(parent, name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        if node.is_directory() {
            return Err(Error::IsADirectory(node.name));
        }

        self.blocks.delete_all_blocks(node.id).await?;
        self.namespace.delete(node.id).await?;
        debug!(node.id = node.id, "unlinked");

        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn rmdir_node(&self, parent: NodeId, name: &str) -> Result<(), Error> {
        let node = self
            .namespace
            .lookup(parent, name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        if !node.is_directory() {
            return Err(Error::NotADirectory(node.name));
        }

        self.namespace.delete(node.id).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn rename_node(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), Error> {
        let node = self
            .namespace
            .lookup(parent, name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;

        self.namespace.move_node(node.id, new_parent, new_name).await
    }

    #[instrument(skip(self), err)]
    pub async fn getattr(&self, path: &str) -> io::Result<FileAttr> {
        let node = self.namespace.resolve(path).await?;
        Ok(self.attr_of(&node).await?)
    }

    /// Returns `.`, `..` and the names of all children, oldest first.
    #[instrument(skip(self), err)]
    pub async fn readdir(&self, path: &str) -> io::Result<Vec<String>> {
        let node = self.namespace.resolve(path).await?;
        let children = self.readdir_node(node.id).await?;

        Ok([".".to_string(), "..".to_string()]
            .into_iter()
            .chain(children.into_iter().map(|c| c.name))
            .collect())
    }

    #[instrument(skip(self), err)]
    pub async fn mkdir(&self, path: &str, mode: u32) -> io::Result<FileAttr> {
        let (parent, name) = self.resolve_parent(path).await?;
        Ok(self
            .create_node(parent.id, name, NodeKind::Directory, mode)
            .await?)
    }

    /// Creates an empty file.
    #[instrument(skip(self), err)]
    pub async fn create(&self, path: &str, mode: u32) -> io::Result<FileAttr> {
        let (parent, name) = self.resolve_parent(path).await?;
        Ok(self
            .create_node(parent.id, name, NodeKind::File, mode)
            .await?)
    }

    /// Opens a node, returning its id as handle.
    #[instrument(skip(self), err)]
    pub async fn open(&self, path: &str) -> io::Result<NodeId> {
        let node = self.namespace.resolve(path).await?;
        Ok(self.open_node(node.id).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn read(&self, path: &str, size: u64, offset: u64) -> io::Result<Bytes> {
        let node = self.namespace.resolve(path).await?;
        Ok(self.read_node(node.id, offset, size).await?)
    }

    #[instrument(skip(self, data), fields(data.len = data.len()), err)]
    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> io::Result<usize> {
        let node = self.namespace.resolve(path).await?;
        Ok(self.write_node(node.id, offset, data).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn truncate(&self, path: &str, length: u64) -> io::Result<()> {
        let node = self.namespace.resolve(path).await?;
        self.truncate_node(node.id, length).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        let node = self.namespace.resolve(old).await?;
        let (new_parent, new_name) = self.resolve_parent(new).await?;

        Ok(self
            .namespace
            .move_node(node.id, new_parent.id, new_name)
            .await?)
    }

    #[instrument(skip(self), err)]
    pub async fn statfs(&self, path: &str) -> io::Result<StatFs> {
        self.namespace.resolve(path).await?;
        Ok(STATFS)
    }

    /// Removes a file and releases its blocks.
    #[instrument(skip(self), err)]
    pub async fn unlink(&self, path: &str) -> io::Result<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        Ok(self.unlink_node(parent.id, name).await?)
    }

    /// Removes an empty directory.
    #[instrument(skip(self), err)]
    pub async fn rmdir(&self, path: &str) -> io::Result<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        Ok(self.rmdir_node(parent.id, name).await?)
    }

    /// Records new permission bits. They're not enforced.
    #[instrument(skip(self), err)]
    pub async fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        let node = self.namespace.resolve(path).await?;
        self.chmod_node(node.id, mode).await?;
        Ok(())
    }
}
