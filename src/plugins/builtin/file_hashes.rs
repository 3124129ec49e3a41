use crate::plugins::{AnalysisPlugin, AnalysisTarget, PluginMetadata};
use serde_json::{Value, json};
use sha2::{Digest, Sha256, Sha512};
use std::io::{BufReader, Read};
use std::time::Duration;

const CHUNK_SIZE: usize = 64 * 1024;

pub struct FileHashesPlugin {
    meta: PluginMetadata,
}

impl FileHashesPlugin {
    pub fn new() -> Self {
        Self {
            meta: PluginMetadata {
                name: "file_hashes",
                description: "sha256 and sha512 digests of the content",
                version: "1.0",
                dependencies: Vec::new(),
                mime_whitelist: Vec::new(),
                mime_blacklist: Vec::new(),
                timeout: Duration::from_secs(120),
                process_count: 2,
            },
        }
    }
}

impl Default for FileHashesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisPlugin for FileHashesPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    fn analyze(&self, target: &AnalysisTarget) -> anyhow::Result<Value> {
        let mut reader = BufReader::new(target.open()?);
        let mut sha256 = Sha256::new();
        let mut sha512 = Sha512::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            sha256.update(&buffer[..read]);
            sha512.update(&buffer[..read]);
        }
        Ok(json!({
            "sha256": hex::encode(sha256.finalize()),
            "sha512": hex::encode(sha512.finalize()),
        }))
    }

    fn summarize(&self, result: &Value) -> String {
        format!("sha256: {}", result["sha256"].as_str().unwrap_or_default())
    }
}
