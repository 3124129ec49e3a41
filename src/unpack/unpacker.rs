use super::extractors::{ExtractedFile, ExtractionMethod, default_methods};
use super::locks::UnpackingLockManager;
use crate::error::ExtractionError;
use crate::objects::mime::detect_mime_of_file;
use crate::objects::{AnalysisEntry, FileObject, uid_of_file};
use crate::storage::BlobStore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key of the unpacker's own entry in `processed_analysis`
pub const UNPACKER_KEY: &str = "unpacker";
pub const UNPACKER_VERSION: &str = "1.0";
pub const DEPTH_LIMIT_INFO: &str = "Unpacking stopped because maximum unpacking depth was reached";

/// Bookkeeping the unpacker leaves on every object it touches
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UnpackMeta {
    pub plugin_used: Option<String>,
    pub number_of_unpacked_files: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl UnpackMeta {
    fn info(message: impl Into<String>) -> Self {
        Self {
            info: Some(message.into()),
            ..Default::default()
        }
    }

    /// Read the meta back from an object, if the unpacker has run on it
    pub fn of(object: &FileObject) -> Option<Self> {
        let entry = object.processed_analysis.get(UNPACKER_KEY)?;
        serde_json::from_value(entry.result.clone()).ok()
    }
}

/// One extraction step: container in, deduplicated children out
pub struct Unpacker {
    max_depth: usize,
    methods: Vec<Box<dyn ExtractionMethod>>,
    locks: Arc<UnpackingLockManager>,
    blobs: BlobStore,
    scratch_root: PathBuf,
}

impl Unpacker {
    pub fn new(max_depth: usize, locks: Arc<UnpackingLockManager>, blobs: BlobStore) -> Self {
        let scratch_root = blobs.root().join(".scratch");
        Self {
            max_depth,
            methods: default_methods(),
            locks,
            blobs,
            scratch_root,
        }
    }

    pub fn with_methods(mut self, methods: Vec<Box<dyn ExtractionMethod>>) -> Self {
        self.methods = methods;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Extract `object` and return its children in discovery order
    ///
    /// Failures are recorded in the object's `unpacker` entry and yield no
    /// children; nothing is propagated to the caller.
    pub fn unpack(&self, object: &mut FileObject) -> Vec<FileObject> {
        if object.depth >= self.max_depth {
            debug!(uid = %object.uid, depth = object.depth, "maximum unpacking depth reached");
            record_meta(object, UnpackMeta::info(DEPTH_LIMIT_INFO));
            return Vec::new();
        }

        let _guard = self.locks.lock(&object.uid);
        match self.extract_children(object) {
            Ok((method, unpacked, children)) => {
                for child in &children {
                    object.files_included.insert(child.uid.clone());
                }
                debug!(
                    uid = %object.uid,
                    method,
                    unpacked,
                    children = children.len(),
                    "unpacked container"
                );
                record_meta(
                    object,
                    UnpackMeta {
                        plugin_used: Some(method.to_string()),
                        number_of_unpacked_files: unpacked,
                        info: None,
                    },
                );
                children
            }
            Err(e) => {
                match &e {
                    ExtractionError::Unsupported { .. } => debug!(uid = %object.uid, "{e}"),
                    _ => warn!(uid = %object.uid, error = %e, "extraction failed"),
                }
                record_meta(object, UnpackMeta::info(e.to_string()));
                Vec::new()
            }
        }
    }

    /// Record that the object's mime type is not extracted
    pub fn mark_skipped(&self, object: &mut FileObject) {
        let message = format!("Unpacking skipped for mime type {}", object.mime);
        record_meta(object, UnpackMeta::info(message));
    }

    fn extract_children(
        &self,
        object: &FileObject,
    ) -> Result<(&'static str, usize, Vec<FileObject>), ExtractionError> {
        let method = self
            .methods
            .iter()
            .find(|m| m.handles(&object.mime))
            .ok_or_else(|| ExtractionError::Unsupported {
                mime: object.mime.clone(),
            })?;

        fs::create_dir_all(&self.scratch_root)
            .map_err(|e| ExtractionError::io(&self.scratch_root, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("unpack-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| ExtractionError::io(&self.scratch_root, e))?;

        let extracted = method.extract(&object.file_path, scratch.path())?;
        let children = self.generate_file_objects(&extracted, object)?;
        Ok((method.name(), extracted.len(), remove_cycles(children, object)))
    }

    /// Hash and store extracted files, one object per distinct uid
    ///
    /// Empty files are dropped. A uid seen twice in the same container only
    /// gains another virtual path.
    pub fn generate_file_objects(
        &self,
        extracted: &[ExtractedFile],
        parent: &FileObject,
    ) -> Result<Vec<FileObject>, ExtractionError> {
        let stored: Vec<Result<Option<FileObject>, ExtractionError>> = extracted
            .par_iter()
            .map(|file| self.store_child(file, parent))
            .collect();

        let mut children: Vec<FileObject> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for result in stored {
            let Some(child) = result? else {
                continue;
            };
            match positions.get(&child.uid) {
                Some(&index) => {
                    if let Some(paths) = child.virtual_file_path.get(&parent.uid) {
                        for path in paths {
                            children[index].add_virtual_file_path(&parent.uid, path);
                        }
                    }
                }
                None => {
                    positions.insert(child.uid.clone(), children.len());
                    children.push(child);
                }
            }
        }
        Ok(children)
    }

    fn store_child(
        &self,
        file: &ExtractedFile,
        parent: &FileObject,
    ) -> Result<Option<FileObject>, ExtractionError> {
        let (uid, size) = uid_of_file(&file.path).map_err(|e| ExtractionError::io(&file.path, e))?;
        if size == 0 {
            debug!(path = %file.relative_path, "skipping empty file");
            return Ok(None);
        }
        let mime = detect_mime_of_file(&file.path).map_err(|e| ExtractionError::io(&file.path, e))?;
        let stored = self
            .blobs
            .store_file(&file.path, &uid)
            .map_err(|e| ExtractionError::io(&file.path, e))?;
        Ok(Some(FileObject::child_of(
            parent,
            uid,
            size,
            stored,
            &file.relative_path,
            mime,
        )))
    }
}

/// Drop children equal to the parent or to any of its ancestors
pub fn remove_cycles(children: Vec<FileObject>, parent: &FileObject) -> Vec<FileObject> {
    children
        .into_iter()
        .filter(|child| {
            let cyclic = child.uid == parent.uid || parent.is_descendant_of(&child.uid);
            if cyclic {
                debug!(uid = %child.uid, parent = %parent.uid, "dropping self-referencing child");
            }
            !cyclic
        })
        .collect()
}

fn record_meta(object: &mut FileObject, meta: UnpackMeta) {
    let summary = meta
        .plugin_used
        .clone()
        .unwrap_or_else(|| "not unpacked".to_string());
    let result = serde_json::to_value(&meta).unwrap_or_default();
    object.processed_analysis.insert(
        UNPACKER_KEY.to_string(),
        AnalysisEntry::new(UNPACKER_VERSION, result, summary),
    );
}
