//! Extraction methods selected by mime type
//!
//! Methods are tried in registration order; the first whose predicate accepts
//! the container's mime type does the work. Every method writes regular files
//! below the target directory and reports their paths relative to it.

use crate::error::ExtractionError;
use crate::objects::mime::{self, TAR_MIME};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

/// One regular file written by an extraction method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub path: PathBuf,
    pub relative_path: String,
}

pub trait ExtractionMethod: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, mime: &str) -> bool;

    fn extract(&self, source: &Path, target: &Path) -> Result<Vec<ExtractedFile>, ExtractionError>;
}

/// Registered methods in selection order
pub fn default_methods() -> Vec<Box<dyn ExtractionMethod>> {
    vec![
        Box::new(TarExtractor),
        Box::new(GzipExtractor),
        Box::new(ZipExtractor),
    ]
}

/// Keep only normal components; absolute paths and `..` are rejected
pub fn sanitize_entry_path(raw: &Path) -> Result<PathBuf, ExtractionError> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractionError::UnsafeEntry {
                    entry: raw.display().to_string(),
                });
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ExtractionError::UnsafeEntry {
            entry: raw.display().to_string(),
        });
    }
    Ok(clean)
}

fn write_entry(
    target: &Path,
    raw: &Path,
    reader: &mut dyn Read,
) -> Result<ExtractedFile, ExtractionError> {
    let relative = sanitize_entry_path(raw)?;
    let path = target.join(&relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ExtractionError::io(parent, e))?;
    }
    let mut out = File::create(&path).map_err(|e| ExtractionError::io(&path, e))?;
    io::copy(reader, &mut out).map_err(|e| ExtractionError::corrupt(raw, e))?;
    Ok(ExtractedFile {
        path,
        relative_path: relative.to_string_lossy().replace('\\', "/"),
    })
}

pub struct TarExtractor;

impl TarExtractor {
    fn extract_from<R: Read>(
        reader: R,
        source: &Path,
        target: &Path,
    ) -> Result<Vec<ExtractedFile>, ExtractionError> {
        let mut archive = tar::Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|e| ExtractionError::corrupt(source, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let mut entry = entry.map_err(|e| ExtractionError::corrupt(source, e))?;
            // links and devices carry no content of their own
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw = entry
                .path()
                .map_err(|e| ExtractionError::corrupt(source, e))?
                .into_owned();
            match write_entry(target, &raw, &mut entry) {
                Ok(file) => files.push(file),
                Err(ExtractionError::UnsafeEntry { entry }) => {
                    tracing::warn!(container = %source.display(), entry = %entry, "skipping unsafe tar entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(files)
    }
}

impl ExtractionMethod for TarExtractor {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn handles(&self, mime: &str) -> bool {
        mime == TAR_MIME
    }

    fn extract(&self, source: &Path, target: &Path) -> Result<Vec<ExtractedFile>, ExtractionError> {
        let file = File::open(source).map_err(|e| ExtractionError::io(source, e))?;
        Self::extract_from(BufReader::new(file), source, target)
    }
}

/// Decompresses gzip; a compressed tar is unpacked in the same step
pub struct GzipExtractor;

impl ExtractionMethod for GzipExtractor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn handles(&self, mime: &str) -> bool {
        mime == "application/gzip"
    }

    fn extract(&self, source: &Path, target: &Path) -> Result<Vec<ExtractedFile>, ExtractionError> {
        let file = File::open(source).map_err(|e| ExtractionError::io(source, e))?;
        let name = decompressed_name(source);
        let payload = target.join(&name);
        {
            let mut decoder = GzDecoder::new(BufReader::new(file));
            let mut out = File::create(&payload).map_err(|e| ExtractionError::io(&payload, e))?;
            io::copy(&mut decoder, &mut out).map_err(|e| ExtractionError::corrupt(source, e))?;
        }

        let payload_mime =
            mime::detect_mime_of_file(&payload).map_err(|e| ExtractionError::io(&payload, e))?;
        if payload_mime != TAR_MIME {
            return Ok(vec![ExtractedFile {
                path: payload,
                relative_path: name,
            }]);
        }

        let tar_dir = target.join("unpacked.d");
        fs::create_dir_all(&tar_dir).map_err(|e| ExtractionError::io(&tar_dir, e))?;
        let tar_file = File::open(&payload).map_err(|e| ExtractionError::io(&payload, e))?;
        let files = TarExtractor::extract_from(BufReader::new(tar_file), source, &tar_dir)?;
        fs::remove_file(&payload).map_err(|e| ExtractionError::io(&payload, e))?;
        Ok(files)
    }
}

fn decompressed_name(source: &Path) -> String {
    match source.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.ends_with(".tgz") => format!("{}.tar", name.trim_end_matches(".tgz")),
        Some(name) if name.ends_with(".gz") && name.len() > 3 => {
            name.trim_end_matches(".gz").to_string()
        }
        _ => "gzip-payload".to_string(),
    }
}

pub struct ZipExtractor;

impl ExtractionMethod for ZipExtractor {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn handles(&self, mime: &str) -> bool {
        mime == "application/zip"
    }

    fn extract(&self, source: &Path, target: &Path) -> Result<Vec<ExtractedFile>, ExtractionError> {
        let file = File::open(source).map_err(|e| ExtractionError::io(source, e))?;
        let mut archive =
            zip::ZipArchive::new(BufReader::new(file)).map_err(|e| ExtractionError::corrupt(source, e))?;

        let mut files = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| ExtractionError::corrupt(source, e))?;
            if entry.is_dir() {
                continue;
            }
            let Some(raw) = entry.enclosed_name() else {
                tracing::warn!(container = %source.display(), entry = entry.name(), "skipping unsafe zip entry");
                continue;
            };
            files.push(write_entry(target, &raw, &mut entry)?);
        }
        Ok(files)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Archive builders shared by the unpacking tests

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}
