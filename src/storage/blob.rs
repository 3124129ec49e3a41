//! Content-addressed store for extracted files
//!
//! Files live at `<root>/<first two uid chars>/<uid>`. Storing the same uid
//! twice is a no-op, so parallel workers extracting identical content do not
//! fight over the destination.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, uid: &str) -> PathBuf {
        let prefix = uid.get(..2).unwrap_or(uid);
        self.root.join(prefix).join(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.path_for(uid).is_file()
    }

    /// Copy `source` into the store under `uid` and return the stored path
    pub fn store_file(&self, source: &Path, uid: &str) -> io::Result<PathBuf> {
        let destination = self.path_for(uid);
        if destination.is_file() {
            return Ok(destination);
        }
        let dir = destination
            .parent()
            .ok_or_else(|| io::Error::other("blob path has no parent"))?;
        fs::create_dir_all(dir)?;

        // Copy next to the destination first so readers never see a partial file
        let staging = tempfile::NamedTempFile::new_in(dir)?;
        fs::copy(source, staging.path())?;
        match staging.persist(&destination) {
            Ok(_) => Ok(destination),
            Err(_) if destination.is_file() => Ok(destination),
            Err(e) => Err(e.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::create_uid;
    use tempfile::TempDir;

    #[test]
    fn test_store_is_content_addressed() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path().join("blobs")).unwrap();

        let source = temp_dir.path().join("payload");
        fs::write(&source, b"payload").unwrap();
        let uid = create_uid(b"payload");

        assert!(!store.contains(&uid));
        let stored = store.store_file(&source, &uid).unwrap();
        assert!(store.contains(&uid));
        assert_eq!(stored, store.path_for(&uid));
        assert!(stored.starts_with(store.root().join(&uid[..2])));
        assert_eq!(fs::read(&stored).unwrap(), b"payload");

        // a second store of the same uid keeps the first copy
        let again = store.store_file(&source, &uid).unwrap();
        assert_eq!(again, stored);
    }
}
