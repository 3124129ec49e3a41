//! Worker pool bound to one analysis plugin
//!
//! Each of the plugin's `process_count` workers pulls tasks from the runner's
//! queue and runs the plugin under a deadline. A plugin call that overruns
//! its timeout is abandoned; the worker records the timeout and moves on.

use super::{AnalysisTarget, RegisteredPlugin, get_analysis};
use crate::error::{AnalysisError, WorkerError};
use crate::objects::AnalysisEntry;
use crate::process::{CrashPolicy, ExceptionSafeProcess, ProcessGroup, panic_message};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One object to analyze with the runner's plugin
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    pub target: AnalysisTarget,
}

/// Finished (or failed) plugin run for one object
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub uid: String,
    pub plugin: &'static str,
    pub result: Result<AnalysisEntry, AnalysisError>,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Bounded wait on the task queue
    pub poll_delay: Duration,
    pub crash_policy: CrashPolicy,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_millis(100),
            crash_policy: CrashPolicy::Restart,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunnerStats {
    pub completed: AtomicU64,
    pub timeouts: AtomicU64,
    pub failures: AtomicU64,
}

struct WorkerContext {
    plugin: Arc<RegisteredPlugin>,
    tasks: Receiver<AnalysisTask>,
    results: Sender<PluginOutcome>,
    shutdown: Arc<AtomicBool>,
    poll_delay: Duration,
    stats: Arc<RunnerStats>,
}

pub struct PluginRunner {
    plugin: Arc<RegisteredPlugin>,
    task_tx: Sender<AnalysisTask>,
    context: Arc<WorkerContext>,
    workers: ProcessGroup,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunnerStats>,
}

impl PluginRunner {
    pub fn new(
        plugin: Arc<RegisteredPlugin>,
        settings: RunnerSettings,
        results: Sender<PluginOutcome>,
    ) -> Self {
        let (task_tx, task_rx) = channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RunnerStats::default());
        let context = Arc::new(WorkerContext {
            plugin: Arc::clone(&plugin),
            tasks: task_rx,
            results,
            shutdown: Arc::clone(&shutdown),
            poll_delay: settings.poll_delay,
            stats: Arc::clone(&stats),
        });
        let workers = ProcessGroup::new(format!("Analysis {}", plugin.name()), settings.crash_policy);
        Self {
            plugin,
            task_tx,
            context,
            workers,
            shutdown,
            stats,
        }
    }

    pub fn name(&self) -> &'static str {
        self.plugin.name()
    }

    pub fn plugin(&self) -> &Arc<RegisteredPlugin> {
        &self.plugin
    }

    /// Spawn the plugin's workers
    pub fn start(&self) -> Result<(), WorkerError> {
        for index in 0..self.plugin.process_count() {
            let context = Arc::clone(&self.context);
            let name = format!("{}-{}", self.plugin.name(), index);
            self.workers
                .spawn(ExceptionSafeProcess::new(name, move || worker_loop(&context)))?;
        }
        debug!(plugin = self.plugin.name(), workers = self.plugin.process_count(), "plugin runner started");
        Ok(())
    }

    pub fn submit(&self, task: AnalysisTask) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::QueueClosed);
        }
        self.task_tx.send(task).map_err(|_| WorkerError::QueueClosed)
    }

    pub fn queue_len(&self) -> usize {
        self.task_tx.len()
    }

    pub fn workers(&self) -> &ProcessGroup {
        &self.workers
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    /// Ask workers to stop and wait for them up to `timeout` each
    pub fn shutdown(&self, timeout: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        let detached = self.workers.join_all(timeout);
        if detached > 0 {
            warn!(plugin = self.plugin.name(), detached, "plugin workers still busy at shutdown");
        }
    }
}

fn worker_loop(context: &WorkerContext) -> anyhow::Result<()> {
    while !context.shutdown.load(Ordering::Relaxed) {
        let task = match context.tasks.recv_timeout(context.poll_delay) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let uid = task.target.uid.clone();
        let started = Instant::now();
        let result = run_with_deadline(&context.plugin, task.target);
        match &result {
            Ok(_) => {
                context.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(plugin = context.plugin.name(), %uid, elapsed_ms = started.elapsed().as_millis() as u64, "analysis finished");
            }
            Err(e) => {
                if e.is_timeout() {
                    context.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                } else {
                    context.stats.failures.fetch_add(1, Ordering::Relaxed);
                }
                warn!(plugin = context.plugin.name(), %uid, error = %e, "analysis failed");
            }
        }

        let outcome = PluginOutcome {
            uid,
            plugin: context.plugin.name(),
            result,
        };
        if context.results.send(outcome).is_err() {
            // collector is gone, nothing left to report to
            break;
        }
    }
    Ok(())
}

/// Run one plugin call on a helper thread and wait at most the plugin's timeout
///
/// An overrunning call is abandoned: its thread finishes in the background and
/// its result is dropped.
pub fn run_with_deadline(
    plugin: &Arc<RegisteredPlugin>,
    target: AnalysisTarget,
) -> Result<AnalysisEntry, AnalysisError> {
    let name = plugin.name();
    let timeout = plugin.timeout();
    let (tx, rx) = channel::bounded(1);
    let call_plugin = Arc::clone(plugin);

    thread::Builder::new()
        .name(format!("{name}-call"))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                get_analysis(call_plugin.plugin(), &target)
            }));
            // the receiver is gone when the deadline already fired
            let _ = tx.send(outcome);
        })
        .map_err(|e| AnalysisError::Exception {
            plugin: name.to_string(),
            reason: format!("could not start analysis thread: {e}"),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(Ok(entry))) => Ok(entry),
        Ok(Ok(Err(e))) => Err(AnalysisError::Exception {
            plugin: name.to_string(),
            reason: format!("{e:#}"),
        }),
        Ok(Err(payload)) => Err(AnalysisError::Exception {
            plugin: name.to_string(),
            reason: panic_message(payload.as_ref()),
        }),
        Err(RecvTimeoutError::Timeout) => Err(AnalysisError::Timeout {
            plugin: name.to_string(),
            timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(AnalysisError::Exception {
            plugin: name.to_string(),
            reason: "analysis thread exited without a result".to_string(),
        }),
    }
}
