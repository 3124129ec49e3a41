use crate::objects::mime::{HEADER_LEN, detect_mime};
use crate::plugins::{AnalysisPlugin, AnalysisTarget, PluginMetadata};
use serde_json::{Value, json};
use std::io::Read;
use std::time::Duration;

/// Magic-byte mime detection with a human readable label
pub struct FileTypePlugin {
    meta: PluginMetadata,
}

impl FileTypePlugin {
    pub fn new() -> Self {
        Self {
            meta: PluginMetadata {
                name: "file_type",
                description: "identify the file type from magic bytes",
                version: "1.0",
                dependencies: Vec::new(),
                mime_whitelist: Vec::new(),
                mime_blacklist: Vec::new(),
                timeout: Duration::from_secs(30),
                process_count: 2,
            },
        }
    }
}

impl Default for FileTypePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisPlugin for FileTypePlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    fn analyze(&self, target: &AnalysisTarget) -> anyhow::Result<Value> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        target.open()?.take(HEADER_LEN as u64).read_to_end(&mut header)?;

        let mime = detect_mime(&header);
        let description = match infer::get(&header) {
            Some(kind) => format!("{} data", kind.extension().to_uppercase()),
            None if mime == crate::objects::mime::TEXT_MIME => "text".to_string(),
            None if header.is_empty() => "empty".to_string(),
            None if mime == crate::objects::mime::TAR_MIME => "TAR archive".to_string(),
            None => "data".to_string(),
        };
        Ok(json!({
            "mime": mime,
            "full": description,
            "size": target.size,
        }))
    }

    fn summarize(&self, result: &Value) -> String {
        result["mime"].as_str().unwrap_or("unknown").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn target(temp_dir: &TempDir, data: &[u8]) -> AnalysisTarget {
        let path = temp_dir.path().join("sample");
        fs::write(&path, data).unwrap();
        AnalysisTarget {
            uid: "uid".into(),
            path,
            mime: String::new(),
            size: data.len() as u64,
            dependencies: BTreeMap::new(),
        }
    }

    #[test]
    fn test_detects_gzip() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = FileTypePlugin::new();
        let result = plugin
            .analyze(&target(&temp_dir, &[0x1f, 0x8b, 0x08, 0x00, 0x00]))
            .unwrap();
        assert_eq!(result["mime"], "application/gzip");
        assert_eq!(result["full"], "GZ data");
        assert_eq!(plugin.summarize(&result), "application/gzip");
    }

    #[test]
    fn test_detects_text() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = FileTypePlugin::new();
        let result = plugin.analyze(&target(&temp_dir, b"hello\n")).unwrap();
        assert_eq!(result["mime"], "text/plain");
        assert_eq!(result["full"], "text");
        assert_eq!(result["size"], 6);
    }
}
