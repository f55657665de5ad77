use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{path::Path, ObjectStore};
use tracing::{debug, instrument, Level};
use url::Url;

use super::{validate_key, StorageBackend};

/// Uses any object storage supported by the [object_store] crate as a
/// [StorageBackend].
///
/// # Data format
/// Each key is stored as-is at `${base_path}/$key`, uncompressed. Block keys
/// already carry the digest of their contents, so objects are never
/// rewritten with different contents under the same key.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    object_store: Arc<dyn ObjectStore>,
    base_path: Path,
}

impl ObjectStoreBackend {
    /// Constructs a new [ObjectStoreBackend] from a [Url] supported by
    /// [object_store].
    /// Any path suffix becomes the base path of the object store.
    /// additional options, the same as in [object_store::parse_url_opts] can
    /// be passed.
    pub fn parse_url_opts<I, K, V>(url: &Url, options: I) -> Result<Self, object_store::Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (object_store, path) = object_store::parse_url_opts(url, options)?;

        Ok(Self {
            object_store: Arc::new(object_store),
            base_path: path,
        })
    }

    /// Like [Self::parse_url_opts], except without the options.
    pub fn parse_url(url: &Url) -> Result<Self, object_store::Error> {
        Self::parse_url_opts(url, Vec::<(String, String)>::new())
    }

    #[instrument(level=Level::TRACE, skip(self), fields(base_path=%self.base_path), ret(Display), err)]
    fn derive_path(&self, key: &str) -> io::Result<Path> {
        validate_key(key)?;
        Ok(key
            .split('/')
            .fold(self.base_path.clone(), |path, segment| path.child(segment)))
    }

    /// Strips the base path from a location returned by the object store.
    fn location_to_key(&self, location: &Path) -> Option<String> {
        let parts = location.prefix_match(&self.base_path)?;
        Some(
            parts
                .map(|part| part.as_ref().to_owned())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> io::Result<Option<Bytes>> {
        match self.object_store.get(&self.derive_path(key)?).await {
            Ok(res) => Ok(Some(res.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, data), fields(data.len = data.len()), err)]
    async fn put(&self, key: &str, data: Bytes) -> io::Result<()> {
        self.object_store
            .put(&self.derive_path(key)?, data.into())
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> io::Result<()> {
        match self.object_store.delete(&self.derive_path(key)?).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!("already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        // object_store lists by path segments, so list below the deepest
        // directory fully named by the prefix and filter the rest.
        let list_root = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.derive_path(dir)?,
            None => self.base_path.clone(),
        };

        let metas: Vec<_> = self
            .object_store
            .list(Some(&list_root))
            .try_collect()
            .await?;

        let mut keys: Vec<String> = metas
            .iter()
            .filter_map(|meta| self.location_to_key(&meta.location))
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();

        Ok(keys)
    }

    #[instrument(skip(self), err)]
    async fn size_of(&self, key: &str) -> io::Result<Option<u64>> {
        match self.object_store.head(&self.derive_path(key)?).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
