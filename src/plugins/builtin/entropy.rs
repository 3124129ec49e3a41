use crate::plugins::{AnalysisPlugin, AnalysisTarget, PluginMetadata};
use serde_json::{Value, json};
use std::io::{BufReader, Read};
use std::time::Duration;

/// Entropy above this (bits per byte) usually means compressed or encrypted content
const HIGH_ENTROPY: f64 = 7.5;

/// Shannon entropy of a byte histogram in bits per byte
pub fn shannon_entropy(counts: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

pub struct EntropyPlugin {
    meta: PluginMetadata,
}

impl EntropyPlugin {
    pub fn new() -> Self {
        Self {
            meta: PluginMetadata {
                name: "entropy",
                description: "byte entropy of the whole file",
                version: "1.0",
                dependencies: Vec::new(),
                mime_whitelist: Vec::new(),
                mime_blacklist: vec!["inode/x-empty"],
                timeout: Duration::from_secs(60),
                process_count: 1,
            },
        }
    }
}

impl Default for EntropyPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisPlugin for EntropyPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    fn analyze(&self, target: &AnalysisTarget) -> anyhow::Result<Value> {
        let mut counts = [0u64; 256];
        let mut total = 0u64;
        let mut reader = BufReader::new(target.open()?);
        let mut buffer = [0u8; 8192];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            for &byte in &buffer[..read] {
                counts[byte as usize] += 1;
            }
            total += read as u64;
        }

        let entropy = shannon_entropy(&counts, total);
        Ok(json!({
            "entropy": (entropy * 1000.0).round() / 1000.0,
            "distinct_bytes": counts.iter().filter(|&&c| c > 0).count(),
            "likely_packed": entropy >= HIGH_ENTROPY,
        }))
    }

    fn summarize(&self, result: &Value) -> String {
        if result["likely_packed"].as_bool().unwrap_or(false) {
            "high entropy (compressed or encrypted)".to_string()
        } else {
            "low entropy".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(data: &[u8]) -> [u64; 256] {
        let mut counts = [0u64; 256];
        for &b in data {
            counts[b as usize] += 1;
        }
        counts
    }

    #[test]
    fn test_uniform_bytes_have_zero_entropy() {
        let data = [b'a'; 64];
        assert_eq!(shannon_entropy(&histogram(&data), 64), 0.0);
        assert_eq!(shannon_entropy(&[0; 256], 0), 0.0);
    }

    #[test]
    fn test_all_byte_values_have_max_entropy() {
        let data: Vec<u8> = (0..=255).collect();
        let entropy = shannon_entropy(&histogram(&data), 256);
        assert!((entropy - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_symbols_have_one_bit() {
        let entropy = shannon_entropy(&histogram(b"abababab"), 8);
        assert!((entropy - 1.0).abs() < 1e-9);
    }
}
