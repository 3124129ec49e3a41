//! # firmflow - recursive firmware unpacking and analysis
//!
//! Submitted images are unpacked recursively into content-addressed objects.
//! Every object is then analyzed by a set of plugins in dependency order and
//! the results are handed to a storage backend.
//!
//! ```no_run
//! use firmflow::{FirmflowConfig, Pipeline, PluginRegistry, storage::MemoryStorage};
//! use std::{path::Path, sync::Arc, time::Duration};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = FirmflowConfig::load()?;
//! let storage = Arc::new(MemoryStorage::new());
//! let pipeline = Pipeline::new(&config, PluginRegistry::builtin(), storage.clone())?;
//! pipeline.start()?;
//! pipeline.submit(Path::new("firmware.tar.gz"))?;
//! pipeline.wait_until_idle(Duration::from_secs(60))?;
//! pipeline.shutdown();
//! println!("{} objects", storage.len());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod objects;
pub mod pipeline;
pub mod plugins;
pub mod process;
pub mod scheduler;
pub mod storage;
pub mod unpack;

pub use cli::{Cli, Output};
pub use config::FirmflowConfig;
pub use error::{FirmflowError, Result};
pub use objects::FileObject;
pub use pipeline::Pipeline;
pub use plugins::PluginRegistry;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
