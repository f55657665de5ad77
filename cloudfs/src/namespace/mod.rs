//! The tree of files and directories, on top of a [MetadataStore].

use std::{sync::Arc, time::SystemTime};

use tracing::{debug, instrument};

use crate::{
    metadata::{MetadataStore, NewNode, Node, NodeId, NodeKind, NodeUpdate, ROOT_NODE_ID},
    path, Error,
};


/// Which timestamp of a node to refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Touch {
    Accessed,
    Updated,
}

#[derive(Clone)]
pub struct Namespace {
    metadata: Arc<dyn MetadataStore>,
}

impl Namespace {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Returns the node with the given id.
    pub async fn get(&self, id: NodeId) -> Result<Node, Error> {
        self.metadata
            .get_node(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))
    }

    /// Walks an absolute path down from the root.
    /// Every intermediate segment needs to be a directory, otherwise the path
    /// doesn't exist.
    #[instrument(skip(self), err)]
    pub async fn resolve(&self, path: &str) -> Result<Node, Error> {
        let mut node = self.get(ROOT_NODE_ID).await?;

        for segment in path::components(path)? {
            if !node.is_directory() {
                return Err(Error::NotFound(path.to_owned()));
            }
            node = self
                .metadata
                .lookup_child(node.id, segment)
                .await?
                .ok_or_else(|| Error::NotFound(path.to_owned()))?;
        }

        Ok(node)
    }

    /// Looks up a direct child by name.
    pub async fn lookup(&self, parent: NodeId, name: &str) -> Result<Option<Node>, Error> {
        self.metadata.lookup_child(parent, name).await
    }

    /// Creates a new, empty file or directory below `parent`.
    #[instrument(skip(self), err)]
    pub async fn create_child(
        &self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        permissions: u32,
    ) -> Result<Node, Error> {
        let node = self
            .metadata
            .insert_node(NewNode {
                parent,
                name: path::validate_name(name)?,
                kind,
                permissions,
                now: SystemTime::now(),
            })
            .await?;

        debug!(node.id = node.id, "created node");
        Ok(node)
    }

    /// Lists the children of a directory, oldest first.
    pub async fn children_of(&self, id: NodeId) -> Result<Vec<Node>, Error> {
        let node = self.get(id).await?;
        if !node.is_directory() {
            return Err(Error::NotADirectory(node.name));
        }

        self.metadata.list_children(id).await
    }

    /// Moves a node below `new_parent`, naming it `new_name`.
    #[instrument(skip(self), err)]
    pub async fn move_node(
        &self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), Error> {
        self.metadata
            .move_node(id, new_parent, path::validate_name(new_name)?)
            .await
    }

    /// Removes a node from the tree. Directories need to be empty.
    /// The blocks of a file need to be released before.
    #[instrument(skip(self), err)]
    pub async fn delete(&self, id: NodeId) -> Result<Node, Error> {
        self.metadata.remove_node(id).await
    }

    /// Sets a timestamp of the node to now.
    #[instrument(skip(self), err)]
    pub async fn touch(&self, id: NodeId, which: Touch) -> Result<Node, Error> {
        let now = SystemTime::now();
        let update = match which {
            Touch::Accessed => NodeUpdate {
                accessed_at: Some(now),
                ..Default::default()
            },
            Touch::Updated => NodeUpdate {
                updated_at: Some(now),
                ..Default::default()
            },
        };

        self.metadata.update_node(id, update).await
    }

    /// Stores new permission bits. They're recorded, but not enforced.
    #[instrument(skip(self), err)]
    pub async fn set_permissions(&self, id: NodeId, permissions: u32) -> Result<Node, Error> {
        self.metadata
            .update_node(
                id,
                NodeUpdate {
                    permissions: Some(permissions),
                    updated_at: Some(SystemTime::now()),
                    ..Default::default()
                },
            )
            .await
    }
}
