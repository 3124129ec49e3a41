//! Storage contract used by the pipeline
//!
//! The schedulers only ever call [`BackendStorage::add_object`] and
//! [`BackendStorage::add_analysis`]. [`MemoryStorage`] is the in-process
//! backend used by the CLI and the tests.

use crate::objects::{AnalysisEntry, FileObject};
use anyhow::{Result, anyhow};
use parking_lot::RwLock;
use std::collections::HashMap;

pub mod blob;

pub use blob::BlobStore;

pub trait BackendStorage: Send + Sync {
    /// Insert an object, or merge locations into an existing record of the same uid
    fn add_object(&self, object: &FileObject) -> Result<()>;

    /// Store one plugin's entry for an object that was added before
    fn add_analysis(&self, uid: &str, plugin: &str, entry: &AnalysisEntry) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, FileObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &str) -> Option<FileObject> {
        self.objects.read().get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Snapshot of every stored object ordered by depth, then uid
    pub fn objects(&self) -> Vec<FileObject> {
        let mut objects: Vec<FileObject> = self.objects.read().values().cloned().collect();
        objects.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.uid.cmp(&b.uid)));
        objects
    }
}

impl BackendStorage for MemoryStorage {
    fn add_object(&self, object: &FileObject) -> Result<()> {
        let mut objects = self.objects.write();
        match objects.get_mut(&object.uid) {
            Some(existing) => existing.absorb(object),
            None => {
                objects.insert(object.uid.clone(), object.clone());
            }
        }
        Ok(())
    }

    fn add_analysis(&self, uid: &str, plugin: &str, entry: &AnalysisEntry) -> Result<()> {
        let mut objects = self.objects.write();
        let object = objects
            .get_mut(uid)
            .ok_or_else(|| anyhow!("cannot store {plugin} result: object {uid} not found"))?;
        object
            .processed_analysis
            .insert(plugin.to_string(), entry.clone());
        if let Some(message) = &entry.failed {
            object.analysis_exception = Some((plugin.to_string(), message.clone()));
        }
        Ok(())
    }
}
