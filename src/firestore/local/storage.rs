use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::firestore::error::{data_loss, FirestoreResult};

/// One staged change of a storage transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageWrite {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl StorageWrite {
    pub fn key(&self) -> &str {
        match self {
            StorageWrite::Put { key, .. } | StorageWrite::Delete { key } => key,
        }
    }
}

/// Durable ordered key-value storage underneath the local store.
///
/// `commit` must apply all writes or none of them: after a failed commit the previously committed
/// image stays visible, including to a process that reopens the storage.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> FirestoreResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>>;

    fn commit(&self, writes: Vec<StorageWrite>) -> FirestoreResult<()>;

    fn clear(&self) -> FirestoreResult<()>;
}

type Image = BTreeMap<String, Vec<u8>>;

fn apply_writes(image: &mut Image, writes: Vec<StorageWrite>) {
    for write in writes {
        match write {
            StorageWrite::Put { key, value } => {
                image.insert(key, value);
            }
            StorageWrite::Delete { key } => {
                image.remove(&key);
            }
        }
    }
}

fn scan_image(image: &Image, prefix: &str) -> Vec<(String, Vec<u8>)> {
    image
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn lock_image(image: &Mutex<Image>) -> FirestoreResult<MutexGuard<'_, Image>> {
    image
        .lock()
        .map_err(|_| data_loss("Storage lock poisoned by a panicked writer"))
}

/// Volatile storage; state lives as long as the value (or a clone of it).
#[derive(Clone, Default)]
pub struct MemoryStorage {
    image: Arc<Mutex<Image>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Debug for MemoryStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let entries = self.image.lock().map(|image| image.len()).unwrap_or_default();
        f.debug_struct("MemoryStorage").field("entries", &entries).finish()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> FirestoreResult<Option<Vec<u8>>> {
        Ok(lock_image(&self.image)?.get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>> {
        Ok(scan_image(&*lock_image(&self.image)?, prefix))
    }

    fn commit(&self, writes: Vec<StorageWrite>) -> FirestoreResult<()> {
        apply_writes(&mut *lock_image(&self.image)?, writes);
        Ok(())
    }

    fn clear(&self) -> FirestoreResult<()> {
        lock_image(&self.image)?.clear();
        Ok(())
    }
}

/// Storage persisted as a single JSON image (`{key: base64(value)}`).
///
/// Every commit writes a complete new image next to the target path and renames it into place, so
/// readers only ever observe whole commits.
#[derive(Clone)]
pub struct FileStorage {
    path: Arc<PathBuf>,
    image: Arc<Mutex<Image>>,
}

impl Debug for FileStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStorage").field("path", &self.path).finish()
    }
}

impl FileStorage {
    /// Opens (or lazily creates) the image at `path`.
    pub fn open(path: impl AsRef<Path>) -> FirestoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let image = if path.exists() {
            read_image(&path)?
        } else {
            Image::new()
        };
        Ok(Self {
            path: Arc::new(path),
            image: Arc::new(Mutex::new(image)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_image(&self, image: &Image) -> FirestoreResult<()> {
        let encoded: BTreeMap<&str, String> = image
            .iter()
            .map(|(key, value)| (key.as_str(), STANDARD.encode(value)))
            .collect();
        let serialized = serde_json::to_vec(&encoded)
            .map_err(|err| data_loss(format!("Failed to serialize storage image: {err}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                data_loss(format!("Failed to create storage directory: {err}"))
            })?;
        }
        let staging = self.path.with_extension("tmp");
        let mut file = File::create(&staging)
            .map_err(|err| data_loss(format!("Failed to create storage image: {err}")))?;
        file.write_all(&serialized)
            .and_then(|_| file.sync_all())
            .map_err(|err| data_loss(format!("Failed to write storage image: {err}")))?;
        fs::rename(&staging, &*self.path)
            .map_err(|err| data_loss(format!("Failed to replace storage image: {err}")))
    }
}

fn read_image(path: &Path) -> FirestoreResult<Image> {
    let buffer = fs::read(path)
        .map_err(|err| data_loss(format!("Failed to read storage image '{}': {err}", path.display())))?;
    if buffer.is_empty() {
        return Ok(Image::new());
    }
    let encoded: BTreeMap<String, String> = serde_json::from_slice(&buffer)
        .map_err(|err| data_loss(format!("Failed to parse storage image: {err}")))?;
    encoded
        .into_iter()
        .map(|(key, value)| {
            STANDARD
                .decode(value)
                .map(|bytes| (key, bytes))
                .map_err(|err| data_loss(format!("Corrupt storage entry: {err}")))
        })
        .collect()
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> FirestoreResult<Option<Vec<u8>>> {
        Ok(lock_image(&self.image)?.get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>> {
        Ok(scan_image(&*lock_image(&self.image)?, prefix))
    }

    fn commit(&self, writes: Vec<StorageWrite>) -> FirestoreResult<()> {
        let mut image = lock_image(&self.image)?;
        let mut next = image.clone();
        apply_writes(&mut next, writes);
        self.write_image(&next)?;
        *image = next;
        Ok(())
    }

    fn clear(&self) -> FirestoreResult<()> {
        let mut image = lock_image(&self.image)?;
        if self.path.exists() {
            fs::remove_file(&*self.path)
                .map_err(|err| data_loss(format!("Failed to remove storage image: {err}")))?;
        }
        image.clear();
        Ok(())
    }
}

/// Buffered writes against a backend, with reads that observe the buffer.
pub struct StorageTransaction<'a> {
    backend: &'a dyn StorageBackend,
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl<'a> StorageTransaction<'a> {
    pub fn new(backend: &'a dyn StorageBackend) -> Self {
        Self {
            backend,
            staged: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> FirestoreResult<Option<Vec<u8>>> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.backend.get(key),
        }
    }

    pub fn scan(&self, prefix: &str) -> FirestoreResult<Vec<(String, Vec<u8>)>> {
        let mut merged: Image = self.backend.scan(prefix)?.into_iter().collect();
        for (key, staged) in self
            .staged
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match staged {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.staged.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.staged.insert(key.into(), None);
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Hands every staged write to the backend in a single atomic commit.
    pub fn commit(self) -> FirestoreResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let writes = self
            .staged
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => StorageWrite::Put { key, value },
                None => StorageWrite::Delete { key },
            })
            .collect();
        self.backend.commit(writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("firestore-storage-test-{}-{}.json", name, std::process::id()));
        path
    }

    #[test]
    fn scan_returns_prefix_in_key_order() {
        let storage = MemoryStorage::new();
        storage
            .commit(vec![
                StorageWrite::Put { key: "b/2".into(), value: vec![2] },
                StorageWrite::Put { key: "b/1".into(), value: vec![1] },
                StorageWrite::Put { key: "c/1".into(), value: vec![3] },
            ])
            .unwrap();
        let keys: Vec<_> = storage.scan("b/").unwrap().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["b/1".to_string(), "b/2".to_string()]);
    }

    #[test]
    fn transactions_read_their_own_writes() {
        let storage = MemoryStorage::new();
        storage
            .commit(vec![StorageWrite::Put { key: "a/1".into(), value: vec![1] }])
            .unwrap();

        let mut txn = StorageTransaction::new(&storage);
        txn.delete("a/1");
        txn.put("a/2", vec![2]);
        assert_eq!(txn.get("a/1").unwrap(), None);
        assert_eq!(txn.scan("a/").unwrap(), vec![("a/2".to_string(), vec![2])]);
        assert_eq!(storage.get("a/1").unwrap(), Some(vec![1]));

        txn.commit().unwrap();
        assert_eq!(storage.get("a/1").unwrap(), None);
        assert_eq!(storage.get("a/2").unwrap(), Some(vec![2]));
    }

    #[test]
    fn file_storage_survives_reopen() {
        let path = temp_path("reopen");
        let _ = fs::remove_file(&path);

        let storage = FileStorage::open(&path).unwrap();
        storage
            .commit(vec![StorageWrite::Put { key: "k".into(), value: vec![0, 255] }])
            .unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some(vec![0, 255]));

        reopened.clear().unwrap();
        assert!(!path.exists());
        assert!(reopened.scan("").unwrap().is_empty());
    }

    #[test]
    fn unreadable_image_is_data_loss() {
        let path = temp_path("corrupt");
        fs::write(&path, b"not json").unwrap();
        let error = FileStorage::open(&path).unwrap_err();
        assert_eq!(error.code, crate::firestore::error::FirestoreErrorCode::DataLoss);
        let _ = fs::remove_file(path);
    }
}
