//! Content-addressed asset store
//!
//! Binary assets (cover art, mostly) are stored once per distinct content
//! hash at `{root}/{id}`, with no extension. The index lives next to them in
//! `index.json` and records, per asset, its hash, sniffed content type and
//! how many catalog entries currently point at it.
//!
//! Every `store` call counts as one new reference; `release` drops one and
//! deletes the bytes when none are left.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, Result};

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

/// Identity of a stored asset, as handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAsset {
    /// Store-local id, assigned once per unique hash
    pub id: u64,
    /// Hex MD5 of the content
    pub hash: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    asset: StoredAsset,
    references: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreIndex {
    version: u32,
    next_id: u64,
    assets: BTreeMap<u64, IndexEntry>,
    #[serde(skip)]
    by_hash: HashMap<String, u64>,
}

impl Default for StoreIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            next_id: 1,
            assets: BTreeMap::new(),
            by_hash: HashMap::new(),
        }
    }
}

impl StoreIndex {
    fn rebuild_hashes(&mut self) {
        self.by_hash = self
            .assets
            .values()
            .map(|e| (e.asset.hash.clone(), e.asset.id))
            .collect();
    }
}

/// Deterministic content fingerprint
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content type is recovered from the bytes, never from a file name
fn sniff_content_type(bytes: &[u8]) -> String {
    image::guess_format(bytes)
        .map(|f| f.to_mime_type().to_string())
        .unwrap_or_else(|_| "application/octet-stream".to_string())
}

struct StoreInner {
    root: PathBuf,
    index: Mutex<StoreIndex>,
}

/// Deduplicating asset store. Clones share the same index.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<StoreInner>,
}

impl ContentStore {
    /// Open (or create) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let index_path = root.join(INDEX_FILE);
        let mut index = if index_path.exists() {
            let contents = fs::read_to_string(&index_path).await?;
            serde_json::from_str::<StoreIndex>(&contents).map_err(|e| {
                DownloadError::io(format!("Corrupt store index {}: {}", index_path.display(), e))
            })?
        } else {
            StoreIndex::default()
        };
        index.rebuild_hashes();

        debug!(
            "Opened content store at {} ({} assets)",
            root.display(),
            index.assets.len()
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                index: Mutex::new(index),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Location of an asset's bytes
    pub fn path_of(&self, id: u64) -> PathBuf {
        self.inner.root.join(id.to_string())
    }

    /// Store bytes, reusing the existing asset when the hash is already known
    pub async fn store(&self, bytes: &[u8]) -> Result<StoredAsset> {
        let hash = content_hash(bytes);

        // Held for the whole operation: two stores of the same bytes can't both write
        let mut index = self.inner.index.lock().await;

        if let Some(id) = index.by_hash.get(&hash).copied() {
            if let Some(entry) = index.assets.get_mut(&id) {
                entry.references += 1;
                let asset = entry.asset.clone();
                let snapshot = index.clone();
                if let Err(e) = self.persist(&snapshot).await {
                    if let Some(entry) = index.assets.get_mut(&id) {
                        entry.references -= 1;
                    }
                    return Err(e);
                }
                debug!("Reusing asset {} for hash {}", id, hash);
                return Ok(asset);
            }
        }

        let id = index.next_id;
        let asset = StoredAsset {
            id,
            hash: hash.clone(),
            content_type: sniff_content_type(bytes),
            size: bytes.len() as u64,
        };

        self.write_bytes(id, bytes).await?;

        index.next_id += 1;
        index.assets.insert(
            id,
            IndexEntry {
                asset: asset.clone(),
                references: 1,
            },
        );
        index.by_hash.insert(hash, id);

        let snapshot = index.clone();
        if let Err(e) = self.persist(&snapshot).await {
            // Undo so the index never names bytes that were rolled back
            index.assets.remove(&id);
            index.by_hash.remove(&asset.hash);
            index.next_id -= 1;
            let _ = fs::remove_file(self.path_of(id)).await;
            return Err(e);
        }

        info!("Stored asset {} ({} bytes, {})", id, asset.size, asset.content_type);
        Ok(asset)
    }

    /// Read a file and store its contents
    pub async fn store_from_path(&self, path: &Path) -> Result<StoredAsset> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::not_found(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        self.store(&bytes).await
    }

    /// Drop one reference; delete the asset when none remain.
    ///
    /// Unknown ids and already-released assets are ignored.
    pub async fn release(&self, id: u64) -> Result<()> {
        let mut index = self.inner.index.lock().await;

        let remaining = match index.assets.get_mut(&id) {
            Some(entry) if entry.references > 0 => {
                entry.references -= 1;
                entry.references
            }
            _ => {
                debug!("Release of asset {} ignored, no references left", id);
                return Ok(());
            }
        };

        if remaining > 0 {
            debug!("Asset {} still has {} references", id, remaining);
            let snapshot = index.clone();
            return self.persist(&snapshot).await;
        }

        match fs::remove_file(self.path_of(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Asset {} bytes were already gone", id);
            }
            Err(e) => {
                if let Some(entry) = index.assets.get_mut(&id) {
                    entry.references += 1;
                }
                return Err(e.into());
            }
        }

        if let Some(entry) = index.assets.remove(&id) {
            index.by_hash.remove(&entry.asset.hash);
        }
        let snapshot = index.clone();
        self.persist(&snapshot).await?;

        info!("Deleted asset {}", id);
        Ok(())
    }

    /// Look up an asset by id
    pub async fn get(&self, id: u64) -> Option<StoredAsset> {
        let index = self.inner.index.lock().await;
        index.assets.get(&id).map(|e| e.asset.clone())
    }

    /// Number of references an asset currently has (0 if unknown)
    pub async fn usage(&self, id: u64) -> u32 {
        let index = self.inner.index.lock().await;
        index.assets.get(&id).map(|e| e.references).unwrap_or(0)
    }

    /// Number of stored assets
    pub async fn len(&self) -> usize {
        self.inner.index.lock().await.assets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write through a temp file so a failed write leaves nothing behind
    async fn write_bytes(&self, id: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(id);
        let tmp = self.inner.root.join(format!("{}.tmp", id));

        if let Err(e) = fs::write(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(DownloadError::io(format!(
                "Failed to write asset {}: {}",
                id, e
            )));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(DownloadError::io(format!(
                "Failed to move asset {} into place: {}",
                id, e
            )));
        }
        Ok(())
    }

    async fn persist(&self, index: &StoreIndex) -> Result<()> {
        let path = self.inner.root.join(INDEX_FILE);
        let tmp = self.inner.root.join(format!("{}.tmp", INDEX_FILE));

        let contents = serde_json::to_string_pretty(index)
            .map_err(|e| DownloadError::io(format!("Failed to serialize store index: {}", e)))?;
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    /// Asset files on disk, excluding the index
    fn asset_files(root: &Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != INDEX_FILE)
            .count()
    }

    #[tokio::test]
    async fn test_identical_bytes_share_one_asset() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let a = store.store(b"cover art").await.unwrap();
        let b = store.store(b"cover art").await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.hash, b.hash);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.usage(a.id).await, 2);
        assert_eq!(asset_files(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_stores() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.store(b"same bytes").await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().id);
        }

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.usage(ids[0]).await, 8);
        assert_eq!(asset_files(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_layout_and_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let png = store.store(PNG_MAGIC).await.unwrap();
        let blob = store.store(b"not an image").await.unwrap();

        assert_eq!(png.content_type, "image/png");
        assert_eq!(blob.content_type, "application/octet-stream");
        assert_eq!(store.path_of(png.id), dir.path().join(png.id.to_string()));
        assert_eq!(std::fs::read(store.path_of(blob.id)).unwrap(), b"not an image");
    }

    #[tokio::test]
    async fn test_release_keeps_bytes_while_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let asset = store.store(b"shared").await.unwrap();
        store.store(b"shared").await.unwrap();

        store.release(asset.id).await.unwrap();
        assert!(store.path_of(asset.id).exists());
        assert!(store.get(asset.id).await.is_some());

        store.release(asset.id).await.unwrap();
        assert!(!store.path_of(asset.id).exists());
        assert!(store.get(asset.id).await.is_none());

        // Releasing again is a no-op
        store.release(asset.id).await.unwrap();
        store.release(9999).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_after_delete_gets_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let first = store.store(b"bytes").await.unwrap();
        store.release(first.id).await.unwrap();
        let second = store.store(b"bytes").await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.hash, second.hash);
    }

    #[tokio::test]
    async fn test_store_from_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("store")).await.unwrap();

        let err = store
            .store_from_path(&dir.path().join("nope.jpg"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_store_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("store")).await.unwrap();
        let file = dir.path().join("cover.jpg");
        std::fs::write(&file, b"jpeg-ish").unwrap();

        let from_file = store.store_from_path(&file).await.unwrap();
        let from_bytes = store.store(b"jpeg-ish").await.unwrap();
        assert_eq!(from_file.id, from_bytes.id);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ContentStore::open(dir.path()).await.unwrap();
            store.store(b"persisted").await.unwrap().id
        };

        let reopened = ContentStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.usage(id).await, 1);
        let again = reopened.store(b"persisted").await.unwrap();
        assert_eq!(again.id, id);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_index_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        // A directory where the asset file should go makes the rename fail
        std::fs::create_dir(dir.path().join("1")).unwrap();
        std::fs::write(dir.path().join("1").join("x"), b"x").unwrap();

        let err = store.store(b"doomed").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert_eq!(store.len().await, 0);
        assert!(!dir.path().join("1.tmp").exists());
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
