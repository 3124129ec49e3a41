//! File objects flowing through the pipeline
//!
//! A [`FileObject`] is the content-addressed record of one file or container
//! anywhere in the extraction tree. Its uid is derived from the bytes alone, so
//! identical content found through different containers collapses into one
//! object with several virtual paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub mod mime;

/// Version stamped into every analysis entry
pub const SYSTEM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compute the uid of a byte buffer: hex sha256, underscore, byte size
pub fn create_uid(data: &[u8]) -> String {
    format!("{}_{}", hex::encode(Sha256::digest(data)), data.len())
}

/// Stream a file through sha256 and return its uid and size
pub fn uid_of_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((format!("{}_{}", hex::encode(hasher.finalize()), size), size))
}

/// One plugin's result for one object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisEntry {
    pub plugin_version: String,
    pub system_version: String,
    pub analysis_date: DateTime<Utc>,
    pub summary: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
}

impl AnalysisEntry {
    pub fn new(plugin_version: &str, result: Value, summary: String) -> Self {
        Self {
            plugin_version: plugin_version.to_string(),
            system_version: SYSTEM_VERSION.to_string(),
            analysis_date: Utc::now(),
            summary,
            result,
            failed: None,
        }
    }

    /// Entry recorded when a plugin timed out, failed or could not run
    pub fn failure(plugin_version: &str, message: impl Into<String>) -> Self {
        Self {
            plugin_version: plugin_version.to_string(),
            system_version: SYSTEM_VERSION.to_string(),
            analysis_date: Utc::now(),
            summary: String::new(),
            result: Value::Null,
            failed: Some(message.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

/// Content-addressed record for one file or container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileObject {
    pub uid: String,
    pub file_name: String,
    /// Re-openable location of the bytes
    pub file_path: PathBuf,
    pub size: u64,
    pub depth: usize,
    pub mime: String,
    pub root_uid: String,
    /// uids from the submitted artifact down to the direct parent
    #[serde(default)]
    pub ancestry: Vec<String>,
    pub virtual_file_path: BTreeMap<String, Vec<String>>,
    pub files_included: BTreeSet<String>,
    pub processed_analysis: BTreeMap<String, AnalysisEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_exception: Option<(String, String)>,
}

impl FileObject {
    /// Build a root object (depth 0) for a file on disk
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let (uid, size) = uid_of_file(path)?;
        let mime = mime::detect_mime_of_file(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| uid.clone());

        let mut virtual_file_path = BTreeMap::new();
        virtual_file_path.insert(uid.clone(), vec![file_name.clone()]);

        Ok(Self {
            root_uid: uid.clone(),
            uid,
            file_name,
            file_path: path.to_path_buf(),
            size,
            depth: 0,
            mime,
            ancestry: Vec::new(),
            virtual_file_path,
            files_included: BTreeSet::new(),
            processed_analysis: BTreeMap::new(),
            analysis_exception: None,
        })
    }

    /// Build a child found at `relative_path` inside `parent`
    pub fn child_of(
        parent: &FileObject,
        uid: String,
        size: u64,
        file_path: PathBuf,
        relative_path: &str,
        mime: String,
    ) -> Self {
        let file_name = Path::new(relative_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative_path.to_string());

        let mut ancestry = parent.ancestry.clone();
        ancestry.push(parent.uid.clone());

        let mut child = Self {
            uid,
            file_name,
            file_path,
            size,
            depth: parent.depth + 1,
            mime,
            root_uid: parent.root_uid.clone(),
            ancestry,
            virtual_file_path: BTreeMap::new(),
            files_included: BTreeSet::new(),
            processed_analysis: BTreeMap::new(),
            analysis_exception: None,
        };
        child.add_virtual_file_path(&parent.uid, &virtual_path(&parent.uid, relative_path));
        child
    }

    /// Record another location; existing entries are not duplicated
    pub fn add_virtual_file_path(&mut self, parent_uid: &str, path: &str) {
        let paths = self
            .virtual_file_path
            .entry(parent_uid.to_string())
            .or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }

    /// Fold the locations and children of another record of the same content into this one
    pub fn merge_from(&mut self, other: &FileObject) {
        for (parent, paths) in &other.virtual_file_path {
            for path in paths {
                self.add_virtual_file_path(parent, path);
            }
        }
        self.files_included
            .extend(other.files_included.iter().cloned());
    }

    /// Merge a full record of the same content, entries included
    ///
    /// Existing analysis entries win, unless `other` was found at a shallower
    /// depth: that record was unpacked further, so its depth and entries replace ours.
    pub fn absorb(&mut self, other: &FileObject) {
        self.merge_from(other);
        let shallower = other.depth < self.depth;
        if shallower {
            self.depth = other.depth;
        }
        for (plugin, entry) in &other.processed_analysis {
            if shallower {
                self.processed_analysis.insert(plugin.clone(), entry.clone());
            } else {
                self.processed_analysis
                    .entry(plugin.clone())
                    .or_insert_with(|| entry.clone());
            }
        }
    }

    /// All virtual paths, flattened
    pub fn virtual_paths(&self) -> Vec<&str> {
        self.virtual_file_path
            .values()
            .flat_map(|paths| paths.iter().map(String::as_str))
            .collect()
    }

    pub fn has_successful_analysis(&self, plugin: &str) -> bool {
        self.processed_analysis
            .get(plugin)
            .is_some_and(|entry| !entry.is_failed())
    }

    pub fn is_descendant_of(&self, uid: &str) -> bool {
        self.ancestry.iter().any(|a| a == uid)
    }
}

/// Virtual path of a file found at `relative_path` inside the container `parent_uid`
pub fn virtual_path(parent_uid: &str, relative_path: &str) -> String {
    format!("|{}|/{}", parent_uid, relative_path.trim_start_matches('/'))
}
