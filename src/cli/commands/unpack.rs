//! `firmflow unpack`: run one firmware image through the whole pipeline

use crate::cli::{Output, OutputFormat};
use crate::config::FirmflowConfig;
use crate::objects::FileObject;
use crate::pipeline::Pipeline;
use crate::plugins::PluginRegistry;
use crate::storage::MemoryStorage;
use crate::unpack::{UNPACKER_KEY, UnpackMeta};
use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Args, Debug)]
pub struct UnpackArgs {
    /// Firmware image or archive to process
    pub file: PathBuf,

    /// Maximum unpacking depth
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Number of unpack workers (0 = auto)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Plugins to run (comma-separated, dependencies are added automatically)
    #[arg(long, value_delimiter = ',')]
    pub plugins: Vec<String>,

    /// Give up waiting for the pipeline after this many seconds
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,
}

#[derive(Serialize)]
struct UnpackReport {
    root_uid: String,
    elapsed_ms: u128,
    objects: Vec<FileObject>,
}

pub fn execute(args: UnpackArgs, mut config: FirmflowConfig, format: OutputFormat, output: &Output) -> Result<()> {
    if !args.file.is_file() {
        bail!("{} is not a file", args.file.display());
    }
    if let Some(depth) = args.max_depth {
        config.unpack.max_depth = depth;
    }
    if let Some(threads) = args.threads {
        config.unpack.threads = threads;
    }
    if !args.plugins.is_empty() {
        config.analysis.default_plugins = args.plugins.clone();
    }

    let storage = Arc::new(MemoryStorage::new());
    let pipeline = Pipeline::new(&config, PluginRegistry::builtin(), storage.clone())
        .context("Failed to set up the pipeline")?;

    let started = Instant::now();
    pipeline.start()?;
    let root_uid = match pipeline.submit(&args.file) {
        Ok(uid) => uid,
        Err(e) => {
            pipeline.shutdown();
            return Err(e).with_context(|| format!("Failed to submit {}", args.file.display()));
        }
    };
    let finished = pipeline.wait_until_idle(Duration::from_secs(args.timeout_secs));
    pipeline.shutdown();

    if !finished? {
        bail!("Pipeline did not finish within {}s", args.timeout_secs);
    }

    let report = UnpackReport {
        root_uid,
        elapsed_ms: started.elapsed().as_millis(),
        objects: storage.objects(),
    };
    match format {
        OutputFormat::Json => output.json(&report),
        OutputFormat::Text => {
            print_report(&report, output);
            Ok(())
        }
    }
}

fn print_report(report: &UnpackReport, output: &Output) {
    output.header(&format!("Unpacked {}", report.root_uid));

    let mut failures = 0;
    for object in &report.objects {
        let detail = format!("{} {} bytes {}", object.mime, object.size, object.uid);
        output.tree_item(object.depth, &object.file_name, &detail);

        if let Some(meta) = UnpackMeta::of(object) {
            if let Some(info) = &meta.info {
                output.indent(object.depth, info);
            } else if let Some(method) = &meta.plugin_used {
                output.indent(object.depth, &format!("{method}: {} files", meta.number_of_unpacked_files));
            }
        }
        for (plugin, entry) in &object.processed_analysis {
            if plugin == UNPACKER_KEY {
                continue;
            }
            if let Some(message) = &entry.failed {
                failures += 1;
                output.indent(object.depth, &format!("{plugin}: failed: {message}"));
            } else if !entry.summary.is_empty() {
                output.verbose(&format!("{}{plugin}: {}", "  ".repeat(object.depth + 1), entry.summary));
            }
        }
    }

    output.blank_line();
    output.count("📦", "Objects", report.objects.len());
    output.table_row("Elapsed", &format!("{}ms", report.elapsed_ms));
    if failures > 0 {
        output.warning(&format!("{failures} analysis failures recorded"));
    } else {
        output.success("All analyses completed");
    }
}
