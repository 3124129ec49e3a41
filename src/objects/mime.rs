//! Mime type detection from magic bytes
//!
//! Uses the `infer` crate on the first few KiB of a file. Tar archives are
//! recognized by their `ustar` marker before infer runs, and unknown content
//! falls back to a text/binary guess from `content_inspector`.

use crate::error::ConfigError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const EMPTY_MIME: &str = "inode/x-empty";
pub const TEXT_MIME: &str = "text/plain";
pub const BINARY_MIME: &str = "application/octet-stream";
pub const TAR_MIME: &str = "application/x-tar";

/// Bytes read from the start of a file for detection
pub const HEADER_LEN: usize = 8192;

const USTAR_OFFSET: usize = 257;

/// Detect the mime type of a header buffer
pub fn detect_mime(header: &[u8]) -> String {
    if header.is_empty() {
        return EMPTY_MIME.to_string();
    }
    if is_tar(header) {
        return TAR_MIME.to_string();
    }
    if let Some(kind) = infer::get(header) {
        return kind.mime_type().to_string();
    }
    if content_inspector::inspect(header).is_text() {
        TEXT_MIME.to_string()
    } else {
        BINARY_MIME.to_string()
    }
}

/// Read the header of a file and detect its mime type
pub fn detect_mime_of_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut header)?;
    Ok(detect_mime(&header))
}

fn is_tar(header: &[u8]) -> bool {
    header.len() >= USTAR_OFFSET + 5 && &header[USTAR_OFFSET..USTAR_OFFSET + 5] == b"ustar"
}

/// Glob based mime matcher, e.g. `text/*` or `application/zip`
#[derive(Debug, Clone)]
pub struct MimeFilter {
    patterns: Vec<String>,
    set: GlobSet,
}

impl MimeFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| ConfigError::Pattern {
                pattern: pattern.to_string(),
                reason: e.kind().to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| ConfigError::Pattern {
            pattern: patterns
                .iter()
                .map(|p| p.as_ref())
                .collect::<Vec<_>>()
                .join(","),
            reason: e.to_string(),
        })?;

        Ok(Self {
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            set,
        })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_match(&self, mime: &str) -> bool {
        self.set.is_match(mime)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detect_known_magic() {
        let gzip = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(detect_mime(&gzip), "application/gzip");

        let zip = [0x50, 0x4b, 0x03, 0x04, 0x14, 0x00, 0x00, 0x00];
        assert_eq!(detect_mime(&zip), "application/zip");
    }

    #[test]
    fn test_detect_tar_marker() {
        let mut header = vec![0u8; 512];
        header[..8].copy_from_slice(b"file.txt");
        header[USTAR_OFFSET..USTAR_OFFSET + 6].copy_from_slice(b"ustar\0");
        assert_eq!(detect_mime(&header), TAR_MIME);
    }

    #[test]
    fn test_detect_fallbacks() {
        assert_eq!(detect_mime(b""), EMPTY_MIME);
        assert_eq!(detect_mime(b"plain words in a file\n"), TEXT_MIME);
        assert_eq!(detect_mime(&[0x00, 0x01, 0x02, 0x03, 0xfe]), BINARY_MIME);
    }

    #[test]
    fn test_detect_mime_of_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello firmware\n").unwrap();
        assert_eq!(detect_mime_of_file(file.path()).unwrap(), TEXT_MIME);
    }

    #[test]
    fn test_mime_filter() {
        let filter = MimeFilter::new(&["text/*", "application/pdf"]).unwrap();
        assert!(filter.is_match("text/plain"));
        assert!(filter.is_match("application/pdf"));
        assert!(!filter.is_match("application/zip"));
        assert_eq!(filter.patterns().len(), 2);

        let empty = MimeFilter::empty();
        assert!(empty.is_empty());
        assert!(!empty.is_match("text/plain"));
    }

    #[test]
    fn test_mime_filter_rejects_bad_pattern() {
        assert!(MimeFilter::new(&["text/["]).is_err());
    }
}
