use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Context, Result};
use effect_ledger_core::{canonical_json, content_id_for_bytes, ContentId};
use serde_json::Value;
use ulid::Ulid;

/// Outcome of re-hashing a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentIntegrity {
    Intact,
    Missing,
    Corrupt { actual: ContentId },
}

/// Content-addressed blob storage. Blobs are immutable once written and
/// keyed by the SHA-256 of their bytes.
pub trait ContentStore: Send + Sync {
    /// Stores `bytes` and returns their content id. Storing identical bytes
    /// twice is a no-op.
    fn put(&self, bytes: &[u8]) -> Result<ContentId>;

    /// Raw bytes as stored, without integrity verification.
    fn read_raw(&self, id: &ContentId) -> Result<Option<Vec<u8>>>;

    /// Bytes for `id`, verified against the id before they are returned.
    ///
    /// # Errors
    /// Fails when the stored bytes no longer hash to `id`.
    fn get(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        let Some(bytes) = self.read_raw(id)? else {
            return Ok(None);
        };
        let actual = content_id_for_bytes(&bytes);
        if &actual != id {
            bail!("content {id} failed integrity check: stored bytes hash to {actual}");
        }
        Ok(Some(bytes))
    }

    fn verify(&self, id: &ContentId) -> Result<ContentIntegrity> {
        let Some(bytes) = self.read_raw(id)? else {
            return Ok(ContentIntegrity::Missing);
        };
        let actual = content_id_for_bytes(&bytes);
        if &actual == id {
            Ok(ContentIntegrity::Intact)
        } else {
            Ok(ContentIntegrity::Corrupt { actual })
        }
    }

    /// Stores the canonical (sorted-key) encoding of `value`.
    fn put_json(&self, value: &Value) -> Result<ContentId> {
        let canonical = canonical_json(value)?;
        self.put(canonical.as_bytes())
    }

    fn get_json(&self, id: &ContentId) -> Result<Option<Value>> {
        let Some(bytes) = self.get(id)? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("content {id} is not valid JSON"))?;
        Ok(Some(value))
    }
}

/// Blob store on the local filesystem, laid out as
/// `<root>/sha256/<first two hex chars>/<hex digest>`.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create content directory {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, id: &ContentId) -> PathBuf {
        let digest = id.digest();
        self.root
            .join("sha256")
            .join(&digest[..2])
            .join(digest)
    }
}

impl ContentStore for FsContentStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentId> {
        let id = content_id_for_bytes(bytes);
        let path = self.path_for(&id);
        if path.exists() {
            return Ok(id);
        }

        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("content path {} has no parent", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let temp = parent.join(format!(".{}.tmp-{}", id.digest(), Ulid::new()));
        let mut file = fs::File::create(&temp)
            .with_context(|| format!("failed to create {}", temp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", temp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", temp.display()))?;
        drop(file);

        fs::rename(&temp, &path).with_context(|| {
            format!("failed to move {} into place at {}", temp.display(), path.display())
        })?;
        tracing::debug!(content_id = %id, bytes = bytes.len(), "stored content blob");
        Ok(id)
    }

    fn read_raw(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

/// In-process blob store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryContentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        Ok(blobs.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentId> {
        let id = content_id_for_bytes(bytes);
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        blobs.entry(id.clone()).or_insert_with(|| bytes.to_vec());
        Ok(id)
    }

    fn read_raw(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| anyhow!("content store lock poisoned"))?;
        Ok(blobs.get(id).cloned())
    }
}
