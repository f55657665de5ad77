//! Maps byte ranges of files onto fixed-size, content-addressed blocks.
//!
//! Block `p` of a file covers bytes `[p * block_size, (p + 1) * block_size)`.
//! All blocks but the last one of a file are full, so the size of a file is
//! the sum of its block lengths.
//!
//! Block contents are stored in a [StorageBackend] at
//! `blocks/<node id>/<hex blake3 digest>`. Two blocks of the same file with
//! identical contents share one object, which is only released once no block
//! of that file refers to it anymore.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_retry::Retry;
use tracing::{debug, instrument, warn};

use crate::{
    backend::StorageBackend,
    metadata::{Block, MetadataStore, NodeId},
    B3Digest, Error,
};


pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;
pub const DEFAULT_WRITE_ATTEMPTS: usize = 3;

/// Tunables of a filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Size of a full block, in bytes. Fixed once a filesystem has been
    /// created.
    pub block_size: u64,
    /// How often a block upload is attempted before giving up.
    pub write_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 {
            return Err(Error::InvalidRequest("block size must be > 0".to_string()));
        }
        if self.write_attempts == 0 {
            return Err(Error::InvalidRequest(
                "write attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// The prefix all objects of a node are stored under.
pub fn node_prefix(node: NodeId) -> String {
    format!("blocks/{}/", node)
}

/// The key the contents of a block are stored at.
pub fn block_key(node: NodeId, digest: &B3Digest) -> String {
    format!("blocks/{}/{}", node, digest.to_hex())
}

fn total_size(blocks: &[Block]) -> u64 {
    blocks.iter().map(|b| b.length).sum()
}

type NodeLocks = Arc<parking_lot::Mutex<HashMap<NodeId, Arc<RwLock<()>>>>>;

/// Holds the lock of a node. On drop, the lock is forgotten if nobody else
/// holds or waits for it.
struct NodeGuard<G> {
    node: NodeId,
    locks: NodeLocks,
    guard: Option<G>,
}

impl<G> Drop for NodeGuard<G> {
    fn drop(&mut self) {
        // releases our reference to the lock before counting
        self.guard.take();

        let mut locks = self.locks.lock();
        if locks
            .get(&self.node)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.node);
        }
    }
}

#[derive(Clone)]
pub struct BlockStore {
    backend: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    config: Config,
    /// Readers of a node share its lock, block list mutations hold it
    /// exclusively.
    locks: NodeLocks,
}

impl BlockStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        config: Config,
    ) -> Self {
        Self {
            backend,
            metadata,
            config,
            locks: Default::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn node_lock(&self, node: NodeId) -> Arc<RwLock<()>> {
        self.locks.lock().entry(node).or_default().clone()
    }

    async fn read_lock(&self, node: NodeId) -> NodeGuard<OwnedRwLockReadGuard<()>> {
        let guard = self.node_lock(node).read_owned().await;
        NodeGuard {
            node,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    async fn write_lock(&self, node: NodeId) -> NodeGuard<OwnedRwLockWriteGuard<()>> {
        let guard = self.node_lock(node).write_owned().await;
        NodeGuard {
            node,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Returns the size of a file, in bytes.
    #[instrument(skip(self), err)]
    pub async fn size(&self, node: NodeId) -> Result<u64, Error> {
        Ok(total_size(&self.metadata.get_blocks(node).await?))
    }

    /// Reads up to `length` bytes starting at `offset`.
    /// Reads past the end of the file are short, reads starting at or after
    /// it return no bytes.
    /// A read overlapping a write sees the contents from before or after it.
    #[instrument(skip(self), err)]
    pub async fn read_range(&self, node: NodeId, offset: u64, length: u64) -> Result<Bytes, Error> {
        let _guard = self.read_lock(node).await;

        let blocks = self.metadata.get_blocks(node).await?;
        let size = total_size(&blocks);

        if length == 0 || offset >= size {
            return Ok(Bytes::new());
        }

        let bs = self.config.block_size;
        let end = offset.saturating_add(length).min(size);
        let first = offset / bs;
        let last = (end - 1) / bs;

        let wanted = blocks
            .get(first as usize..=last as usize)
            .ok_or_else(|| {
                Error::StorageError(format!("block list of node {} is inconsistent", node))
            })?;
        debug!(first, last, "fetching blocks");

        let contents = try_join_all(wanted.iter().map(|block| self.fetch_block(node, block))).await?;

        let mut out = BytesMut::with_capacity((end - offset) as usize);
        for (block, data) in wanted.iter().zip(contents) {
            let block_start = block.position * bs;
            let from = offset.saturating_sub(block_start) as usize;
            let to = ((end - block_start) as usize).min(data.len());
            out.extend_from_slice(&data[from..to]);
        }

        Ok(out.freeze())
    }

    /// Writes `data` at `offset`, growing the file as needed. Any gap between
    /// the previous end of the file and `offset` is filled with zeroes.
    ///
    /// Blocks are committed one by one. If uploading one fails, the blocks
    /// before it stay written.
    #[instrument(skip(self, data), fields(data.len = data.len()), err)]
    pub async fn write_range(&self, node: NodeId, offset: u64, data: &[u8]) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        let data_end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::InvalidRequest("write past the maximum file size".to_string()))?;

        let _guard = self.write_lock(node).await;

        let mut blocks = self.metadata.get_blocks(node).await?;
        let new_end = data_end.max(total_size(&blocks));
        self.splice(node, &mut blocks, offset, data, new_end).await?;

        Ok(data.len())
    }

    /// Sets the size of a file. Shrinking drops data past `new_length`,
    /// growing pads with zeroes.
    #[instrument(skip(self), err)]
    pub async fn truncate(&self, node: NodeId, new_length: u64) -> Result<(), Error> {
        let _guard = self.write_lock(node).await;

        let mut blocks = self.metadata.get_blocks(node).await?;
        let size = total_size(&blocks);

        if new_length > size {
            return self
                .splice(node, &mut blocks, new_length, &[], new_length)
                .await;
        }
        if new_length == size {
            return Ok(());
        }

        let bs = self.config.block_size;
        let keep = new_length.div_ceil(bs);
        let tail = new_length % bs;

        if tail != 0 {
            // The new last block keeps only a prefix of its contents.
            let last = blocks.get(keep as usize - 1).cloned().ok_or_else(|| {
                Error::StorageError(format!("block list of node {} is inconsistent", node))
            })?;
            let data = self.fetch_block(node, &last).await?;
            self.store_block(node, &mut blocks, keep - 1, data.slice(..tail as usize))
                .await?;
        }

        let removed = self.metadata.truncate_blocks(node, keep).await?;
        blocks.truncate(keep as usize);
        debug!(removed = removed.len(), "dropped blocks");

        let digests: HashSet<&B3Digest> = removed.iter().map(|b| &b.digest).collect();
        for digest in digests {
            self.release_if_unused(node, &blocks, digest).await;
        }

        Ok(())
    }

    /// Drops all blocks of a node, and releases their objects.
    /// Failing to delete objects is only logged.
    #[instrument(skip(self), err)]
    pub async fn delete_all_blocks(&self, node: NodeId) -> Result<(), Error> {
        let _guard = self.write_lock(node).await;

        let removed = self.metadata.truncate_blocks(node, 0).await?;

        let mut keys: HashSet<String> = removed
            .iter()
            .map(|b| block_key(node, &b.digest))
            .collect();
        // also pick up objects of uploads that never made it into the metadata
        match self.backend.list_keys(&node_prefix(node)).await {
            Ok(listed) => keys.extend(listed),
            Err(e) => warn!(err=%e, "failed to list objects of node"),
        }

        for key in keys {
            if let Err(e) = self.backend.delete(&key).await {
                warn!(err=%e, key, "failed to delete block object");
            }
        }

        Ok(())
    }

    /// Rewrites positions covering `[min(offset, size), max(data_end, new_end))`
    /// so the file ends at `new_end` and contains `data` at `offset`.
    async fn splice(
        &self,
        node: NodeId,
        blocks: &mut Vec<Block>,
        offset: u64,
        data: &[u8],
        new_end: u64,
    ) -> Result<(), Error> {
        let bs = self.config.block_size;
        let size = total_size(blocks);
        let data_end = offset + data.len() as u64;

        let start = offset.min(size);
        let touched_end = if new_end > size { new_end } else { data_end };
        if start >= touched_end {
            return Ok(());
        }

        let first = start / bs;
        let last = (touched_end - 1) / bs;
        debug!(first, last, size, new_end, "splicing blocks");

        for position in first..=last {
            let block_start = position * bs;
            let block_end = (block_start + bs).min(new_end);
            let block_len = (block_end - block_start) as usize;

            let covered = offset <= block_start && data_end >= block_end;
            let mut buf = match blocks.get(position as usize) {
                Some(existing) if !covered => self.fetch_block(node, existing).await?.to_vec(),
                _ => Vec::with_capacity(block_len),
            };
            buf.resize(block_len, 0);

            let from = offset.max(block_start);
            let to = data_end.min(block_end);
            if from < to {
                buf[(from - block_start) as usize..(to - block_start) as usize]
                    .copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);
            }

            self.store_block(node, blocks, position, buf.into()).await?;
        }

        Ok(())
    }

    /// Uploads the contents of a block and records it at `position`,
    /// releasing the object of the block it replaces if that's unused now.
    async fn store_block(
        &self,
        node: NodeId,
        blocks: &mut Vec<Block>,
        position: u64,
        data: Bytes,
    ) -> Result<(), Error> {
        let block = Block {
            position,
            digest: B3Digest::of(&data),
            length: data.len() as u64,
        };

        if blocks.get(position as usize) == Some(&block) {
            debug!(block.position = position, "block unchanged");
            return Ok(());
        }

        let key = block_key(node, &block.digest);
        self.put_with_retries(&key, data).await?;

        let replaced = self.metadata.put_block(node, block.clone()).await?;
        match blocks.get_mut(position as usize) {
            Some(slot) => *slot = block,
            None => blocks.push(block),
        }

        if let Some(replaced) = replaced {
            self.release_if_unused(node, blocks, &replaced.digest).await;
        }

        Ok(())
    }

    async fn put_with_retries(&self, key: &str, data: Bytes) -> Result<(), Error> {
        let attempts = self.config.write_attempts.max(1);
        let strategy = std::iter::repeat(Duration::ZERO).take(attempts - 1);

        Retry::spawn(strategy, || {
            let data = data.clone();
            async move {
                self.backend.put(key, data).await.map_err(|e| {
                    warn!(err=%e, key, "failed to put block");
                    e
                })
            }
        })
        .await
        .map_err(|e| {
            Error::Io(format!(
                "failed to put {} after {} attempts: {}",
                key, attempts, e
            ))
        })
    }

    /// Fetches the contents of a block, and checks they match its digest.
    async fn fetch_block(&self, node: NodeId, block: &Block) -> Result<Bytes, Error> {
        let key = block_key(node, &block.digest);

        let data = self
            .backend
            .get(&key)
            .await
            .map_err(|e| Error::Io(format!("failed to get {}: {}", key, e)))?
            .ok_or_else(|| Error::Io(format!("object {} is missing", key)))?;

        let actual = B3Digest::of(&data);
        if actual != block.digest {
            warn!(key, actual=%actual, "block has the wrong digest");
            return Err(Error::Corruption {
                key,
                expected: block.digest.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(data)
    }

    async fn release_if_unused(&self, node: NodeId, blocks: &[Block], digest: &B3Digest) {
        if blocks.iter().any(|b| &b.digest == digest) {
            return;
        }

        let key = block_key(node, digest);
        if let Err(e) = self.backend.delete(&key).await {
            warn!(err=%e, key, "failed to delete block object");
        }
    }
}
