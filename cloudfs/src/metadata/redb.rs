use std::{path::PathBuf, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{instrument, warn};

use super::{
    check_block_position, check_block_size, from_unix_nanos, to_unix_nanos, Block,
    MetadataStore, NewNode, Node, NodeId, NodeKind, NodeUpdate, ROOT_NODE_ID,
};
use crate::{B3Digest, Error};

/// node id -> protobuf-encoded [NodeRecord]
const NODE_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("node");
/// (parent id, name) -> child id
const CHILDREN_TABLE: TableDefinition<(u64, &str), u64> = TableDefinition::new("children");
/// (node id, position) -> protobuf-encoded [BlockRecord]
const BLOCK_TABLE: TableDefinition<(u64, u64), Vec<u8>> = TableDefinition::new("block");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_NEXT_NODE_ID: &str = "next_node_id";
const META_BLOCK_SIZE: &str = "block_size";

#[derive(Clone, PartialEq, Message)]
struct NodeRecord {
    #[prost(uint64, optional, tag = "1")]
    parent: Option<u64>,
    #[prost(string, tag = "2")]
    name: String,
    #[prost(bool, tag = "3")]
    directory: bool,
    #[prost(uint32, tag = "4")]
    permissions: u32,
    /// nanoseconds since the unix epoch
    #[prost(uint64, tag = "5")]
    created_at: u64,
    #[prost(uint64, tag = "6")]
    updated_at: u64,
    #[prost(uint64, tag = "7")]
    accessed_at: u64,
}

#[derive(Clone, PartialEq, Message)]
struct BlockRecord {
    #[prost(bytes = "bytes", tag = "1")]
    digest: Bytes,
    #[prost(uint64, tag = "2")]
    length: u64,
}

impl From<&Node> for NodeRecord {
    fn from(node: &Node) -> Self {
        Self {
            parent: node.parent,
            name: node.name.clone(),
            directory: node.is_directory(),
            permissions: node.permissions,
            created_at: to_unix_nanos(node.created_at),
            updated_at: to_unix_nanos(node.updated_at),
            accessed_at: to_unix_nanos(node.accessed_at),
        }
    }
}

impl NodeRecord {
    fn into_node(self, id: NodeId) -> Node {
        Node {
            id,
            parent: self.parent,
            name: self.name,
            kind: if self.directory {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            permissions: self.permissions,
            created_at: from_unix_nanos(self.created_at),
            updated_at: from_unix_nanos(self.updated_at),
            accessed_at: from_unix_nanos(self.accessed_at),
        }
    }
}

fn encode_block(block: &Block) -> Vec<u8> {
    BlockRecord {
        digest: block.digest.clone().into(),
        length: block.length,
    }
    .encode_to_vec()
}

fn decode_block(position: u64, data: &[u8]) -> Result<Block, Error> {
    let record = BlockRecord::decode(data)?;
    let digest = B3Digest::try_from(record.digest).map_err(|e| {
        warn!(err=%e, block.position = position, "invalid digest in block record");
        Error::StorageError(format!("invalid block record: {}", e))
    })?;

    Ok(Block {
        position,
        digest,
        length: record.length,
    })
}

fn load_node(
    table: &impl ReadableTable<u64, Vec<u8>>,
    id: NodeId,
) -> Result<Option<Node>, Error> {
    match table.get(id)? {
        None => Ok(None),
        Some(data) => Ok(Some(NodeRecord::decode(data.value().as_slice())?.into_node(id))),
    }
}

/// Loads a node which is about to receive children.
fn load_directory(table: &impl ReadableTable<u64, Vec<u8>>, id: NodeId) -> Result<Node, Error> {
    let node = load_node(table, id)?.ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
    if !node.is_directory() {
        return Err(Error::NotADirectory(format!("node {}", id)));
    }
    Ok(node)
}

fn has_children(table: &impl ReadableTable<(u64, &'static str), u64>, id: NodeId) -> Result<bool, Error> {
    Ok(table.range((id, "")..(id + 1, ""))?.next().is_some())
}

fn load_blocks(
    table: &impl ReadableTable<(u64, u64), Vec<u8>>,
    node: NodeId,
    from: u64,
) -> Result<Vec<Block>, Error> {
    let mut blocks = Vec::new();
    for entry in table.range((node, from)..(node + 1, 0))? {
        let (key, data) = entry?;
        blocks.push(decode_block(key.value().1, data.value().as_slice())?);
    }
    Ok(blocks)
}

/// Keeps all metadata in a [redb] database, on disk or in memory.
/// Every mutation happens in a single write transaction.
#[derive(Clone)]
pub struct RedbMetadataStore {
    // We wrap the db in an Arc to be able to move it into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    db: Arc<Database>,
}

impl RedbMetadataStore {
    /// Constructs a new instance using the specified filesystem path for
    /// storage.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking(|| -> Result<_, Error> {
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn read<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTransaction) -> Result<T, Error> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<T, Error> {
            let txn = db.begin_read()?;
            f(&txn)
        })
        .await?
    }

    /// Runs `f` in a write transaction, which is only committed if `f`
    /// succeeds.
    async fn write<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&WriteTransaction) -> Result<T, Error> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<T, Error> {
            let txn = db.begin_write()?;
            let result = f(&txn)?;
            txn.commit()?;
            Ok(result)
        })
        .await?
    }
}

/// Ensures all tables are present, and the root directory exists.
fn create_schema(db: &redb::Database) -> Result<(), Error> {
    let txn = db.begin_write()?;
    {
        let mut nodes = txn.open_table(NODE_TABLE)?;
        txn.open_table(CHILDREN_TABLE)?;
        txn.open_table(BLOCK_TABLE)?;
        let mut meta = txn.open_table(META_TABLE)?;

        if nodes.get(ROOT_NODE_ID)?.is_none() {
            let root = Node::root(SystemTime::now());
            nodes.insert(ROOT_NODE_ID, NodeRecord::from(&root).encode_to_vec())?;
            meta.insert(META_NEXT_NODE_ID, ROOT_NODE_ID + 1)?;
        }
    }
    txn.commit()?;

    Ok(())
}

#[async_trait]
impl MetadataStore for RedbMetadataStore {
    #[instrument(skip(self), err)]
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, Error> {
        self.read(move |txn| load_node(&txn.open_table(NODE_TABLE)?, id))
            .await
    }

    #[instrument(skip(self), err)]
    async fn lookup_child(&self, parent: NodeId, name: &str) -> Result<Option<Node>, Error> {
        let name = name.to_owned();
        self.read(move |txn| {
            let child = txn
                .open_table(CHILDREN_TABLE)?
                .get((parent, name.as_str()))?
                .map(|id| id.value());

            match child {
                None => Ok(None),
                Some(id) => load_node(&txn.open_table(NODE_TABLE)?, id),
            }
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_children(&self, parent: NodeId) -> Result<Vec<Node>, Error> {
        self.read(move |txn| {
            let nodes = txn.open_table(NODE_TABLE)?;
            let children = txn.open_table(CHILDREN_TABLE)?;

            let mut out = Vec::new();
            for entry in children.range((parent, "")..(parent + 1, ""))? {
                let (_, id) = entry?;
                let id = id.value();
                match load_node(&nodes, id)? {
                    Some(node) => out.push(node),
                    None => {
                        warn!(node.id = id, "dangling child entry");
                        return Err(Error::StorageError(format!("node {} is missing", id)));
                    }
                }
            }
            out.sort_by_key(|n| n.id);

            Ok(out)
        })
        .await
    }

    #[instrument(skip(self, new_node), fields(parent = new_node.parent, name = new_node.name), err)]
    async fn insert_node(&self, new_node: NewNode<'_>) -> Result<Node, Error> {
        let NewNode {
            parent,
            kind,
            permissions,
            now,
            ..
        } = new_node;
        let name = new_node.name.to_owned();

        self.write(move |txn| {
            let mut nodes = txn.open_table(NODE_TABLE)?;
            let mut children = txn.open_table(CHILDREN_TABLE)?;
            let mut meta = txn.open_table(META_TABLE)?;

            load_directory(&nodes, parent)?;
            if children.get((parent, name.as_str()))?.is_some() {
                return Err(Error::AlreadyExists(name));
            }

            let id = meta
                .get(META_NEXT_NODE_ID)?
                .map(|v| v.value())
                .unwrap_or(ROOT_NODE_ID + 1);
            meta.insert(META_NEXT_NODE_ID, id + 1)?;

            children.insert((parent, name.as_str()), id)?;
            let node = Node {
                id,
                parent: Some(parent),
                name,
                kind,
                permissions,
                created_at: now,
                updated_at: now,
                accessed_at: now,
            };
            nodes.insert(id, NodeRecord::from(&node).encode_to_vec())?;

            Ok(node)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn move_node(
        &self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), Error> {
        if id == ROOT_NODE_ID {
            return Err(Error::InvalidRequest("cannot move the root".to_string()));
        }
        let new_name = new_name.to_owned();

        self.write(move |txn| {
            let mut nodes = txn.open_table(NODE_TABLE)?;
            let mut children = txn.open_table(CHILDREN_TABLE)?;

            let mut node =
                load_node(&nodes, id)?.ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
            load_directory(&nodes, new_parent)?;

            if node.parent == Some(new_parent) && node.name == new_name {
                return Ok(());
            }

            // Walk up from the destination, it may not be inside the moved node.
            let mut cursor = Some(new_parent);
            while let Some(ancestor) = cursor {
                if ancestor == id {
                    return Err(Error::InvalidRequest(format!(
                        "cannot move node {} into its own subtree",
                        id
                    )));
                }
                cursor = load_node(&nodes, ancestor)?.and_then(|n| n.parent);
            }

            if children.get((new_parent, new_name.as_str()))?.is_some() {
                return Err(Error::AlreadyExists(new_name));
            }

            if let Some(old_parent) = node.parent {
                children.remove((old_parent, node.name.as_str()))?;
            }
            children.insert((new_parent, new_name.as_str()), id)?;

            node.parent = Some(new_parent);
            node.name = new_name;
            nodes.insert(id, NodeRecord::from(&node).encode_to_vec())?;

            Ok(())
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn remove_node(&self, id: NodeId) -> Result<Node, Error> {
        if id == ROOT_NODE_ID {
            return Err(Error::InvalidRequest("cannot remove the root".to_string()));
        }

        self.write(move |txn| {
            let mut nodes = txn.open_table(NODE_TABLE)?;
            let mut children = txn.open_table(CHILDREN_TABLE)?;
            let mut blocks = txn.open_table(BLOCK_TABLE)?;

            let node =
                load_node(&nodes, id)?.ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
            if node.is_directory() && has_children(&children, id)? {
                return Err(Error::NotEmpty(node.name));
            }

            if let Some(parent) = node.parent {
                children.remove((parent, node.name.as_str()))?;
            }
            nodes.remove(id)?;

            let leftover = load_blocks(&blocks, id, 0)?;
            if !leftover.is_empty() {
                warn!(node.id = id, blocks = leftover.len(), "removed node still had blocks");
            }
            for block in leftover {
                blocks.remove((id, block.position))?;
            }

            Ok(node)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn update_node(&self, id: NodeId, update: NodeUpdate) -> Result<Node, Error> {
        self.write(move |txn| {
            let mut nodes = txn.open_table(NODE_TABLE)?;
            let mut node =
                load_node(&nodes, id)?.ok_or_else(|| Error::NotFound(format!("node {}", id)))?;

            update.apply(&mut node);
            nodes.insert(id, NodeRecord::from(&node).encode_to_vec())?;

            Ok(node)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn get_blocks(&self, node: NodeId) -> Result<Vec<Block>, Error> {
        self.read(move |txn| load_blocks(&txn.open_table(BLOCK_TABLE)?, node, 0))
            .await
    }

    #[instrument(skip(self, block), fields(block.position = block.position), err)]
    async fn put_block(&self, node: NodeId, block: Block) -> Result<Option<Block>, Error> {
        self.write(move |txn| {
            let nodes = txn.open_table(NODE_TABLE)?;
            let mut blocks = txn.open_table(BLOCK_TABLE)?;

            if nodes.get(node)?.is_none() {
                return Err(Error::NotFound(format!("node {}", node)));
            }

            let count = match blocks.range((node, 0)..(node + 1, 0))?.next_back() {
                Some(last) => last?.0.value().1 + 1,
                None => 0,
            };
            check_block_position(node, &block, count)?;

            let replaced = blocks
                .insert((node, block.position), encode_block(&block))?
                .map(|data| decode_block(block.position, data.value().as_slice()))
                .transpose()?;

            Ok(replaced)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn truncate_blocks(&self, node: NodeId, keep: u64) -> Result<Vec<Block>, Error> {
        self.write(move |txn| {
            let mut blocks = txn.open_table(BLOCK_TABLE)?;

            let removed = load_blocks(&blocks, node, keep)?;
            for block in &removed {
                blocks.remove((node, block.position))?;
            }

            Ok(removed)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn ensure_block_size(&self, block_size: u64) -> Result<(), Error> {
        self.write(move |txn| {
            let mut meta = txn.open_table(META_TABLE)?;
            let recorded = meta.get(META_BLOCK_SIZE)?.map(|v| v.value());

            match recorded {
                Some(recorded) => check_block_size(recorded, block_size),
                None => {
                    meta.insert(META_BLOCK_SIZE, block_size)?;
                    Ok(())
                }
            }
        })
        .await
    }
}
