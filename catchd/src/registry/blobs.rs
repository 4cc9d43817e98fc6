//! Content-addressed blob storage for the embedded registry.
//!
//! Blobs live under `blobs/sha256/<xx>/<hash>`, sharded by the first two
//! hex characters. Content is verified against its digest before the file
//! becomes visible; writes go through a temp file + rename so a crash never
//! leaves a partial blob behind.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<BlobStore> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sha256")).context("creating blob directory")?;
        Ok(BlobStore { root })
    }

    /// Validate a `sha256:<hex>` digest and return its hash part.
    fn hash_of(digest: &str) -> Result<&str> {
        let Some(hash) = digest.strip_prefix("sha256:") else {
            bail!("unsupported digest: {digest:?}");
        };
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("malformed digest: {digest:?}");
        }
        Ok(hash)
    }

    fn path_for(&self, digest: &str) -> Result<PathBuf> {
        let hash = Self::hash_of(digest)?;
        Ok(self.root.join("sha256").join(&hash[..2]).join(hash))
    }

    pub fn has(&self, digest: &str) -> bool {
        self.path_for(digest).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn size(&self, digest: &str) -> Result<u64> {
        let path = self.path_for(digest)?;
        Ok(std::fs::metadata(path)?.len())
    }

    pub fn open(&self, digest: &str) -> Result<std::fs::File> {
        let path = self.path_for(digest)?;
        std::fs::File::open(&path).with_context(|| format!("opening blob {digest}"))
    }

    /// Move the staged upload at `src` into the store, verifying that its
    /// content matches `digest`.
    pub fn put_file(&self, digest: &str, src: &Path) -> Result<()> {
        let actual = {
            use std::io::Read;
            let mut file = std::fs::File::open(src).context("opening staged blob")?;
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            format!("sha256:{}", hex::encode(hasher.finalize()))
        };
        if actual != digest {
            bail!("digest mismatch: got {actual}, want {digest}");
        }
        let dst = self.path_for(digest)?;
        std::fs::create_dir_all(dst.parent().expect("sharded path has a parent"))?;
        // Rename first; fall back to copy for cross-device staging dirs.
        if std::fs::rename(src, &dst).is_err() {
            std::fs::copy(src, &dst).context("copying blob into store")?;
            let _ = std::fs::remove_file(src);
        }
        Ok(())
    }

    /// Store a small in-memory blob (manifests).
    pub fn put_bytes(&self, content: &[u8]) -> Result<String> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(content)));
        let dst = self.path_for(&digest)?;
        if !dst.exists() {
            std::fs::create_dir_all(dst.parent().expect("sharded path has a parent"))?;
            let tmp = dst.with_extension("tmp");
            std::fs::write(&tmp, content)?;
            std::fs::rename(&tmp, &dst)?;
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).unwrap();
        let digest = store.put_bytes(b"layer data").unwrap();
        assert!(store.has(&digest));
        assert_eq!(store.size(&digest).unwrap(), 10);
        use std::io::Read;
        let mut content = String::new();
        store.open(&digest).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "layer data");
    }

    #[test]
    fn put_file_rejects_digest_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).unwrap();
        let staged = dir.path().join("upload");
        std::fs::write(&staged, b"actual content").unwrap();
        let bogus = format!("sha256:{}", "0".repeat(64));
        assert!(store.put_file(&bogus, &staged).is_err());
        assert!(!store.has(&bogus));
    }

    #[test]
    fn malformed_digests_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).unwrap();
        assert!(!store.has("sha256:../../etc/passwd"));
        assert!(!store.has("md5:abcd"));
        assert!(store.open("sha256:zz").is_err());
    }
}
