use std::io;

use async_trait::async_trait;
use bytes::Bytes;

mod from_addr;
mod memory;
mod object_store;
mod simplefs;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryBackend;
pub use self::object_store::ObjectStoreBackend;
pub use self::simplefs::SimpleFilesystemBackend;

/// The trait all storage backends need to implement.
///
/// A backend is a flat key/blob store. It has no notion of ordering or
/// hierarchy; all of that is reconstructed from the metadata store. Keys are
/// `/`-separated strings, but a `/` carries no meaning beyond what the
/// implementation needs to lay out its data.
///
/// Backends are treated as shared, externally consistent storage. They don't
/// need to provide any locking.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves the bytes stored at the given key.
    /// Returns Ok(None) if there's nothing stored at that key.
    async fn get(&self, key: &str) -> io::Result<Option<Bytes>>;

    /// Stores the passed bytes at the given key, replacing existing contents.
    async fn put(&self, key: &str, data: Bytes) -> io::Result<()>;

    /// Deletes the object stored at the given key.
    /// Deleting a key that doesn't exist is not an error.
    async fn delete(&self, key: &str) -> io::Result<()>;

    /// Lists all keys starting with the passed prefix, in lexicographic order.
    async fn list_keys(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Returns the size of the object stored at the given key, or Ok(None)
    /// if there's nothing stored there.
    async fn size_of(&self, key: &str) -> io::Result<Option<u64>>;
}

#[async_trait]
impl<A> StorageBackend for A
where
    A: AsRef<dyn StorageBackend> + Send + Sync,
{
    async fn get(&self, key: &str) -> io::Result<Option<Bytes>> {
        self.as_ref().get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> io::Result<()> {
        self.as_ref().put(key, data).await
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        self.as_ref().delete(key).await
    }

    async fn list_keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        self.as_ref().list_keys(prefix).await
    }

    async fn size_of(&self, key: &str) -> io::Result<Option<u64>> {
        self.as_ref().size_of(key).await
    }
}

/// Ensures a key is usable by all backends: non-empty, and free of empty,
/// `.` and `..` segments.
pub(crate) fn validate_key(key: &str) -> io::Result<()> {
    if key.is_empty()
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid key: {:?}", key),
        ));
    }
    Ok(())
}
