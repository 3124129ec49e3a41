use crate::plugins::{AnalysisPlugin, AnalysisTarget, PluginMetadata};
use regex::bytes::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;
use std::time::Duration;

const MIN_LENGTH: usize = 8;
const MAX_REPORTED: usize = 100;

static PRINTABLE_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("[\\x20-\\x7e]{{{MIN_LENGTH},}}")).expect("printable run pattern is valid")
});

/// Runs of printable ASCII, like `strings(1)`
pub struct PrintableStringsPlugin {
    meta: PluginMetadata,
}

impl PrintableStringsPlugin {
    pub fn new() -> Self {
        Self {
            meta: PluginMetadata {
                name: "printable_strings",
                description: "extract printable ASCII strings",
                version: "1.0",
                dependencies: vec!["file_type"],
                mime_whitelist: Vec::new(),
                mime_blacklist: vec!["image/*", "audio/*", "video/*", "inode/x-empty"],
                timeout: Duration::from_secs(60),
                process_count: 1,
            },
        }
    }
}

impl Default for PrintableStringsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisPlugin for PrintableStringsPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    fn analyze(&self, target: &AnalysisTarget) -> anyhow::Result<Value> {
        let data = target.read()?;
        let mut count = 0usize;
        let mut strings = Vec::new();
        for found in PRINTABLE_RUN.find_iter(&data) {
            count += 1;
            if strings.len() < MAX_REPORTED {
                strings.push(String::from_utf8_lossy(found.as_bytes()).into_owned());
            }
        }
        Ok(json!({
            "count": count,
            "strings": strings,
            "file_type": target.dependencies.get("file_type").and_then(|r| r.get("mime")).cloned(),
        }))
    }

    fn summarize(&self, result: &Value) -> String {
        format!("{} strings", result["count"].as_u64().unwrap_or(0))
    }
}
