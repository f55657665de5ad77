use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{instrument, warn};

use super::{validate_key, StorageBackend};

/// Stores objects as plain files below an existing path on a POSIX-compliant
/// filesystem.
///
/// It takes an existing path, builds a `tmp` directory and an `objects`
/// directory inside of it. All objects received are staged in that `tmp`
/// directory, then they are moved **atomically** into `objects/$key`, with
/// `/` in the key becoming directory separators.
///
/// **Disclaimer** : This very simple implementation is subject to change and
/// does not give any final guarantees on the on-disk format.
#[derive(Clone)]
pub struct SimpleFilesystemBackend {
    /// Where the objects are located on a filesystem already mounted.
    path: PathBuf,
}

impl SimpleFilesystemBackend {
    pub async fn new(path: PathBuf) -> io::Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::create_dir_all(path.join("tmp")).await?;
        tokio::fs::create_dir_all(path.join("objects")).await?;

        Ok(Self { path })
    }

    fn objects_root(&self) -> PathBuf {
        self.path.join("objects")
    }

    fn derive_path(&self, key: &str) -> io::Result<PathBuf> {
        validate_key(key)?;
        Ok(self.objects_root().join(key))
    }

    /// Removes the directories above a deleted object that became empty,
    /// stopping at the objects root.
    async fn prune_empty_dirs(&self, path: &Path) {
        let root = self.objects_root();
        let mut dir = path.parent();

        while let Some(d) = dir.filter(|d| *d != root.as_path() && d.starts_with(&root)) {
            // fails if the directory still has entries, which ends the walk
            if tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// Turns a path below `root` back into a key.
fn path_to_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}

#[async_trait]
impl StorageBackend for SimpleFilesystemBackend {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> io::Result<Option<Bytes>> {
        match tokio::fs::read(self.derive_path(key)?).await {
            Ok(contents) => Ok(Some(contents.into())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, data), fields(data.len = data.len()), err)]
    async fn put(&self, key: &str, data: Bytes) -> io::Result<()> {
        let dst_path = self.derive_path(key)?;
        let tmp_dir = self.path.join("tmp");

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut file = tempfile::NamedTempFile::new_in(tmp_dir)?;
            file.write_all(&data)?;
            file.as_file().sync_all()?;

            if let Some(parent) = dst_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = match file.persist(&dst_path) {
                Ok(_) => return Ok(()),
                // a concurrent delete pruned the directory in between
                Err(e) if e.error.kind() == io::ErrorKind::NotFound => e.file,
                Err(e) => return Err(e.error),
            };
            if let Some(parent) = dst_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            file.persist(&dst_path).map_err(|e| e.error)?;

            Ok(())
        })
        .await?
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> io::Result<()> {
        let path = self.derive_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }

        self.prune_empty_dirs(&path).await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        let root = self.objects_root();
        // Only walk below the deepest directory fully named by the prefix.
        let start = match prefix.rsplit_once('/') {
            Some((dir, _)) => {
                validate_key(dir)?;
                root.join(dir)
            }
            None => root.clone(),
        };
        let prefix = prefix.to_owned();

        tokio::task::spawn_blocking(move || -> io::Result<Vec<String>> {
            if !start.is_dir() {
                return Ok(vec![]);
            }

            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&start) {
                let entry = entry.map_err(io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                match path_to_key(&root, entry.path()) {
                    Some(key) if key.starts_with(&prefix) => keys.push(key),
                    Some(_) => {}
                    None => warn!(path=?entry.path(), "skipping non-utf8 path"),
                }
            }
            keys.sort();

            Ok(keys)
        })
        .await?
    }

    #[instrument(skip(self), err)]
    async fn size_of(&self, key: &str) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(self.derive_path(key)?).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
