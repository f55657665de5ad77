use std::{collections::BTreeMap, io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::{validate_key, StorageBackend};

/// Keeps all objects in memory. Contents are lost when the last clone is
/// dropped.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    db: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> io::Result<Option<Bytes>> {
        validate_key(key)?;
        Ok(self.db.read().get(key).cloned())
    }

    #[instrument(skip(self, data), fields(data.len = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> io::Result<()> {
        validate_key(key)?;
        self.db.write().insert(key.to_owned(), data);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> io::Result<()> {
        validate_key(key)?;
        self.db.write().remove(key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        let db = self.db.read();
        Ok(db
            .range(prefix.to_owned()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    #[instrument(skip(self))]
    async fn size_of(&self, key: &str) -> io::Result<Option<u64>> {
        validate_key(key)?;
        Ok(self.db.read().get(key).map(|v| v.len() as u64))
    }
}
