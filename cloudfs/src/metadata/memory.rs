use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use super::{
    check_block_position, check_block_size, Block, MetadataStore, NewNode, Node, NodeId,
    NodeUpdate, ROOT_NODE_ID,
};
use crate::Error;

struct Tables {
    nodes: BTreeMap<NodeId, Node>,
    /// (parent, name) -> child
    children: BTreeMap<(NodeId, String), NodeId>,
    blocks: BTreeMap<NodeId, Vec<Block>>,
    next_id: NodeId,
    block_size: Option<u64>,
}

impl Tables {
    fn new() -> Self {
        Self {
            nodes: BTreeMap::from([(ROOT_NODE_ID, Node::root(SystemTime::now()))]),
            children: BTreeMap::new(),
            blocks: BTreeMap::new(),
            next_id: ROOT_NODE_ID + 1,
            block_size: None,
        }
    }

    /// Returns the parent node, ensuring it exists and is a directory.
    fn directory(&self, id: NodeId) -> Result<&Node, Error> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
        if !node.is_directory() {
            return Err(Error::NotADirectory(format!("node {}", id)));
        }
        Ok(node)
    }
}

/// Keeps all metadata in memory, behind a single lock, so every call is
/// atomic with respect to all others.
#[derive(Clone)]
pub struct MemoryMetadataStore {
    db: Arc<RwLock<Tables>>,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self {
            db: Arc::new(RwLock::new(Tables::new())),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    #[instrument(skip(self))]
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, Error> {
        Ok(self.db.read().nodes.get(&id).cloned())
    }

    #[instrument(skip(self))]
    async fn lookup_child(&self, parent: NodeId, name: &str) -> Result<Option<Node>, Error> {
        let db = self.db.read();
        Ok(db
            .children
            .get(&(parent, name.to_owned()))
            .and_then(|id| db.nodes.get(id))
            .cloned())
    }

    #[instrument(skip(self))]
    async fn list_children(&self, parent: NodeId) -> Result<Vec<Node>, Error> {
        let db = self.db.read();
        let mut children: Vec<Node> = db
            .children
            .range((parent, String::new())..)
            .take_while(|((p, _), _)| *p == parent)
            .filter_map(|(_, id)| db.nodes.get(id))
            .cloned()
            .collect();
        children.sort_by_key(|n| n.id);

        Ok(children)
    }

    #[instrument(skip(self, new_node), fields(parent = new_node.parent, name = new_node.name), err)]
    async fn insert_node(&self, new_node: NewNode<'_>) -> Result<Node, Error> {
        let mut db = self.db.write();

        db.directory(new_node.parent)?;
        let key = (new_node.parent, new_node.name.to_owned());
        if db.children.contains_key(&key) {
            return Err(Error::AlreadyExists(new_node.name.to_owned()));
        }

        let node = Node {
            id: db.next_id,
            parent: Some(new_node.parent),
            name: new_node.name.to_owned(),
            kind: new_node.kind,
            permissions: new_node.permissions,
            created_at: new_node.now,
            updated_at: new_node.now,
            accessed_at: new_node.now,
        };

        db.next_id += 1;
        db.children.insert(key, node.id);
        db.nodes.insert(node.id, node.clone());

        Ok(node)
    }

    #[instrument(skip(self), err)]
    async fn move_node(
        &self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), Error> {
        let mut db = self.db.write();

        if id == ROOT_NODE_ID {
            return Err(Error::InvalidRequest("cannot move the root".to_string()));
        }
        let node = db
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;
        db.directory(new_parent)?;

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
            cursor = db.nodes.get(&ancestor).and_then(|n| n.parent);
        }

        let new_key = (new_parent, new_name.to_owned());
        if db.children.contains_key(&new_key) {
            return Err(Error::AlreadyExists(new_name.to_owned()));
        }

        if let Some(old_parent) = node.parent {
            db.children.remove(&(old_parent, node.name.clone()));
        }
        db.children.insert(new_key, id);
        if let Some(node) = db.nodes.get_mut(&id) {
            node.parent = Some(new_parent);
            node.name = new_name.to_owned();
        }

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn remove_node(&self, id: NodeId) -> Result<Node, Error> {
        let mut db = self.db.write();

        if id == ROOT_NODE_ID {
            return Err(Error::InvalidRequest("cannot remove the root".to_string()));
        }
        let node = db
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;

        if node.is_directory()
            && db
                .children
                .range((id, String::new())..)
                .next()
                .is_some_and(|((p, _), _)| *p == id)
        {
            return Err(Error::NotEmpty(node.name));
        }

        if let Some(parent) = node.parent {
            db.children.remove(&(parent, node.name.clone()));
        }
        db.nodes.remove(&id);
        if let Some(blocks) = db.blocks.remove(&id) {
            if !blocks.is_empty() {
                warn!(node.id = id, blocks = blocks.len(), "removed node still had blocks");
            }
        }

        Ok(node)
    }

    #[instrument(skip(self), err)]
    async fn update_node(&self, id: NodeId, update: NodeUpdate) -> Result<Node, Error> {
        let mut db = self.db.write();
        let node = db
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))?;

        update.apply(node);
        Ok(node.clone())
    }

    #[instrument(skip(self))]
    async fn get_blocks(&self, node: NodeId) -> Result<Vec<Block>, Error> {
        Ok(self.db.read().blocks.get(&node).cloned().unwrap_or_default())
    }

    #[instrument(skip(self, block), fields(block.position = block.position), err)]
    async fn put_block(&self, node: NodeId, block: Block) -> Result<Option<Block>, Error> {
        let mut db = self.db.write();
        if !db.nodes.contains_key(&node) {
            return Err(Error::NotFound(format!("node {}", node)));
        }

        let blocks = db.blocks.entry(node).or_default();
        check_block_position(node, &block, blocks.len() as u64)?;

        let position = block.position as usize;
        if position == blocks.len() {
            blocks.push(block);
            Ok(None)
        } else {
            Ok(Some(std::mem::replace(&mut blocks[position], block)))
        }
    }

    #[instrument(skip(self), err)]
    async fn truncate_blocks(&self, node: NodeId, keep: u64) -> Result<Vec<Block>, Error> {
        let mut db = self.db.write();
        Ok(match db.blocks.get_mut(&node) {
            Some(blocks) if (keep as usize) < blocks.len() => blocks.split_off(keep as usize),
            _ => vec![],
        })
    }

    #[instrument(skip(self), err)]
    async fn ensure_block_size(&self, block_size: u64) -> Result<(), Error> {
        let mut db = self.db.write();
        match db.block_size {
            Some(recorded) => check_block_size(recorded, block_size),
            None => {
                db.block_size = Some(block_size);
                Ok(())
            }
        }
    }
}
