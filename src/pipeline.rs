//! End-to-end wiring: unpacking feeds analysis, analysis feeds storage
//!
//! ```text
//! submit -> UnpackingScheduler --post_unpack--> AnalysisScheduler --hooks--> BackendStorage
//!                 ^    |                                  |
//!                 +----+ children                         +--> completed objects
//! ```

use crate::config::FirmflowConfig;
use crate::error::{FirmflowError, WorkerError};
use crate::objects::{AnalysisEntry, FileObject};
use crate::plugins::PluginRegistry;
use crate::scheduler::{
    AnalysisHooks, AnalysisScheduler, AnalysisSettings, SchedulerState, ThreadSleeper,
    UnpackingScheduler, UnpackingSettings,
};
use crate::storage::{BackendStorage, BlobStore};
use crate::unpack::Unpacker;
use crossbeam::channel::{self, Receiver};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Consecutive idle observations required before the pipeline counts as drained
const IDLE_CHECKS: usize = 3;

pub struct Pipeline {
    state: Arc<SchedulerState>,
    blobs: BlobStore,
    unpacking: UnpackingScheduler,
    analysis: Arc<AnalysisScheduler>,
    completed: Receiver<FileObject>,
    poll_delay: Duration,
}

impl Pipeline {
    pub fn new(
        config: &FirmflowConfig,
        registry: PluginRegistry,
        storage: Arc<dyn BackendStorage>,
    ) -> Result<Self, FirmflowError> {
        config.validate()?;
        let registry = registry.configure(&config.analysis)?;
        for (plugin, dependency) in registry.missing_dependencies() {
            warn!(plugin, dependency, "plugin depends on an unregistered plugin");
        }

        let data_dir = config.data_dir().join("blobs");
        let blobs = BlobStore::new(&data_dir).map_err(|e| FirmflowError::io(&data_dir, e))?;
        let state = SchedulerState::new();

        let (completed_tx, completed) = channel::unbounded();
        let pre_storage = Arc::clone(&storage);
        let post_storage = Arc::clone(&storage);
        let hooks = AnalysisHooks {
            pre_analysis: Arc::new(move |object: &FileObject| {
                if let Err(e) = pre_storage.add_object(object) {
                    error!(uid = %object.uid, error = %e, "failed to store object");
                }
            }),
            post_analysis: Arc::new(move |object: &FileObject, plugin: &str, entry: &AnalysisEntry| {
                if let Err(e) = post_storage.add_analysis(&object.uid, plugin, entry) {
                    error!(uid = %object.uid, plugin, error = %e, "failed to store analysis");
                }
            }),
            on_complete: Arc::new(move |object: FileObject| {
                // nobody listening is fine, results are in storage
                let _ = completed_tx.send(object);
            }),
        };

        let analysis = Arc::new(AnalysisScheduler::new(
            AnalysisSettings::from_config(config),
            Arc::new(registry),
            Arc::clone(&state),
            hooks,
            Arc::new(ThreadSleeper),
        ));

        let forward = Arc::clone(&analysis);
        let post_unpack = Arc::new(move |object: FileObject| {
            let uid = object.uid.clone();
            if let Err(e) = forward.add_task(object) {
                debug!(%uid, error = %e, "object not handed to analysis");
            }
        });

        let unpacker = Unpacker::new(config.unpack.max_depth, Arc::clone(&state.locks), blobs.clone());
        let unpacking = UnpackingScheduler::new(
            UnpackingSettings::from_config(config)?,
            unpacker,
            Arc::clone(&state),
            post_unpack,
            Arc::new(ThreadSleeper),
        );

        Ok(Self {
            state,
            blobs,
            unpacking,
            analysis,
            completed,
            poll_delay: config.scheduler.block_delay(),
        })
    }

    /// Start analysis first so unpacked objects always have somewhere to go
    pub fn start(&self) -> Result<(), WorkerError> {
        self.analysis.start()?;
        self.unpacking.start()?;
        info!("pipeline started");
        Ok(())
    }

    /// Copy a file into the blob store and queue it as a root object
    ///
    /// Returns the uid of the submitted content.
    pub fn submit(&self, path: &Path) -> Result<String, FirmflowError> {
        let mut object = FileObject::from_path(path).map_err(|e| FirmflowError::io(path, e))?;
        object.file_path = self
            .blobs
            .store_file(path, &object.uid)
            .map_err(|e| FirmflowError::io(path, e))?;
        let uid = object.uid.clone();
        info!(%uid, file = %path.display(), size = object.size, "submitting firmware");
        self.unpacking.add_task(object)?;
        Ok(uid)
    }

    /// Wait until nothing is queued, unpacking, or pending analysis
    ///
    /// Returns `Ok(false)` when `timeout` elapsed first and an error when a
    /// worker pool failed under the fail-fast policy.
    pub fn wait_until_idle(&self, timeout: Duration) -> Result<bool, FirmflowError> {
        let deadline = Instant::now() + timeout;
        let mut idle_checks = 0;
        while Instant::now() < deadline {
            if let Some(e) = self.health() {
                return Err(e.into());
            }
            if self.is_idle() {
                idle_checks += 1;
                if idle_checks >= IDLE_CHECKS {
                    return Ok(true);
                }
            } else {
                idle_checks = 0;
            }
            thread::sleep(self.poll_delay);
        }
        Ok(false)
    }

    pub fn is_idle(&self) -> bool {
        self.state.is_idle() && self.unpacking.queue_len() == 0 && self.analysis.pending() == 0
    }

    /// Objects whose analysis finished, in completion order
    pub fn completed(&self) -> &Receiver<FileObject> {
        &self.completed
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub fn unpacking(&self) -> &UnpackingScheduler {
        &self.unpacking
    }

    pub fn analysis(&self) -> &AnalysisScheduler {
        &self.analysis
    }

    /// First fatal worker failure of either stage
    pub fn health(&self) -> Option<WorkerError> {
        self.unpacking
            .fatal_error()
            .or_else(|| self.analysis.fatal_error())
    }

    pub fn shutdown(&self) {
        info!("shutting down pipeline");
        self.unpacking.shutdown();
        self.analysis.shutdown();
    }
}
