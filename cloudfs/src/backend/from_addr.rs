use std::sync::Arc;

use url::Url;

use crate::Error;

use super::{MemoryBackend, ObjectStoreBackend, SimpleFilesystemBackend, StorageBackend};

/// Constructs a new instance of a [StorageBackend] from an URI.
///
/// The following schemes are supported by the following backends:
/// - `memory://` ([MemoryBackend])
/// - `simplefs:///absolute/path` ([SimpleFilesystemBackend])
/// - `objectstore+*://` ([ObjectStoreBackend]), e.g.
///   `objectstore+s3://bucket/prefix` or `objectstore+file:///some/path`.
pub async fn from_addr(uri: &str) -> Result<Arc<dyn StorageBackend>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    let backend: Arc<dyn StorageBackend> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidRequest("invalid url".to_string()));
            }
            Arc::<MemoryBackend>::default()
        }
        "simplefs" => {
            if url.has_host() {
                return Err(Error::InvalidRequest("no host allowed".to_string()));
            }
            if url.path().is_empty() || url.path() == "/" {
                return Err(Error::InvalidRequest(
                    "cowardly refusing to use / with simplefs".to_string(),
                ));
            }
            Arc::new(SimpleFilesystemBackend::new(url.path().into()).await?)
        }
        scheme if scheme.starts_with("objectstore+") => {
            // We need to convert the URL to string, strip the prefix there, and then
            // parse it back as url, as Url::set_scheme() rejects some of the transitions we want to do.
            let trimmed_url = uri
                .strip_prefix("objectstore+")
                .map(Url::parse)
                .ok_or_else(|| Error::InvalidRequest("invalid url".to_string()))?
                .map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

            Arc::new(
                ObjectStoreBackend::parse_url(&trimmed_url)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?,
            )
        }
        scheme => {
            return Err(Error::InvalidRequest(format!(
                "unknown scheme: {}",
                scheme
            )))
        }
    };

    Ok(backend)
}
