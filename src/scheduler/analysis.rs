//! Analysis stage
//!
//! Every eligible plugin runs exactly once per object. Plugins are dispatched
//! as soon as their dependencies have succeeded; a single collector thread
//! merges finished runs, dispatches whatever became ready and fires the
//! completion hook once nothing is owed or running for an object.
//!
//! A plugin whose dependency failed, or whose dependency can never run for
//! the object, is recorded as failed rather than left pending.

use super::workload::{AdmissionGate, SchedulerState, Sleeper};
use crate::config::FirmflowConfig;
use crate::error::{AnalysisError, FirmflowError, WorkerError};
use crate::objects::{AnalysisEntry, FileObject};
use crate::plugins::{
    AnalysisTarget, AnalysisTask, PluginOutcome, PluginRegistry, PluginRunner, RegisteredPlugin,
    RunnerSettings,
};
use crate::process::CrashPolicy;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type PreAnalysisHook = Arc<dyn Fn(&FileObject) + Send + Sync>;
pub type PostAnalysisHook = Arc<dyn Fn(&FileObject, &str, &AnalysisEntry) + Send + Sync>;
pub type CompletionHook = Arc<dyn Fn(FileObject) + Send + Sync>;

/// Callbacks invoked at fixed points of an object's analysis
#[derive(Clone)]
pub struct AnalysisHooks {
    pub pre_analysis: PreAnalysisHook,
    pub post_analysis: PostAnalysisHook,
    pub on_complete: CompletionHook,
}

impl Default for AnalysisHooks {
    fn default() -> Self {
        Self {
            pre_analysis: Arc::new(|_| {}),
            post_analysis: Arc::new(|_, _, _| {}),
            on_complete: Arc::new(|_| {}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub throttle_limit: i64,
    pub poll_delay: Duration,
    pub throttle_pause: Duration,
    pub supervisor_interval: Duration,
    pub crash_policy: CrashPolicy,
    /// Plugins scheduled for every object, empty selects all
    pub default_plugins: Vec<String>,
}

impl AnalysisSettings {
    pub fn from_config(config: &FirmflowConfig) -> Self {
        Self {
            throttle_limit: config.analysis.throttle_limit,
            poll_delay: config.scheduler.block_delay(),
            throttle_pause: config.scheduler.throttle_pause(),
            supervisor_interval: config.scheduler.supervisor_interval(),
            crash_policy: config.scheduler.crash_policy,
            default_plugins: config.analysis.default_plugins.clone(),
        }
    }
}

struct PendingObject {
    object: FileObject,
    owed: BTreeSet<&'static str>,
    running: BTreeSet<&'static str>,
}

impl PendingObject {
    fn is_finished(&self) -> bool {
        self.owed.is_empty() && self.running.is_empty()
    }
}

#[derive(Default)]
struct PendingTable {
    objects: HashMap<String, PendingObject>,
    /// uids whose dispatch waits for their unpacking lock
    deferred: HashSet<String>,
}

/// Results to publish once the table lock is released
struct Progress {
    object: FileObject,
    reports: Vec<(&'static str, AnalysisEntry)>,
    finished: bool,
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(AnalysisError),
}

struct Inner {
    settings: AnalysisSettings,
    registry: Arc<PluginRegistry>,
    runners: BTreeMap<&'static str, PluginRunner>,
    outcomes: Receiver<PluginOutcome>,
    table: Mutex<PendingTable>,
    /// Every uid ever scheduled. Never pruned, so it grows with every distinct
    /// file for the lifetime of the scheduler.
    known: Mutex<HashSet<String>>,
    state: Arc<SchedulerState>,
    gate: AdmissionGate,
    hooks: AnalysisHooks,
    shutdown: Arc<AtomicBool>,
    completed: AtomicU64,
}

pub struct AnalysisScheduler {
    inner: Arc<Inner>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalysisScheduler {
    pub fn new(
        settings: AnalysisSettings,
        registry: Arc<PluginRegistry>,
        state: Arc<SchedulerState>,
        hooks: AnalysisHooks,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let (outcome_tx, outcomes) = channel::unbounded();
        let runner_settings = RunnerSettings {
            poll_delay: settings.poll_delay,
            crash_policy: settings.crash_policy,
        };
        let runners = registry
            .iter()
            .map(|plugin| {
                (
                    plugin.name(),
                    PluginRunner::new(Arc::clone(plugin), runner_settings.clone(), outcome_tx.clone()),
                )
            })
            .collect();
        let gate = AdmissionGate::new(settings.throttle_limit, settings.throttle_pause, sleeper);

        Self {
            inner: Arc::new(Inner {
                settings,
                registry,
                runners,
                outcomes,
                table: Mutex::new(PendingTable::default()),
                known: Mutex::new(HashSet::new()),
                state,
                gate,
                hooks,
                shutdown: Arc::new(AtomicBool::new(false)),
                completed: AtomicU64::new(0),
            }),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start every plugin runner, the result collector and the runner supervisor
    pub fn start(&self) -> Result<(), WorkerError> {
        for runner in self.inner.runners.values() {
            runner.start()?;
        }

        let inner = Arc::clone(&self.inner);
        let collector = thread::Builder::new()
            .name("analysis-collector".to_string())
            .spawn(move || inner.collect_loop())
            .map_err(|e| WorkerError::SpawnFailed {
                name: "analysis-collector".to_string(),
                reason: e.to_string(),
            })?;

        let inner = Arc::clone(&self.inner);
        let supervisor = thread::Builder::new()
            .name("analysis-supervisor".to_string())
            .spawn(move || inner.supervise_loop())
            .map_err(|e| WorkerError::SpawnFailed {
                name: "analysis-supervisor".to_string(),
                reason: e.to_string(),
            })?;

        self.background.lock().extend([collector, supervisor]);
        info!(plugins = ?self.inner.registry.names(), "analysis scheduler started");
        Ok(())
    }

    /// Schedule every eligible plugin for `object`
    ///
    /// Content that was scheduled before only goes through `pre_analysis`,
    /// so the storage can merge the new location. A copy arriving while the
    /// first is still pending is folded into it as well.
    pub fn add_task(&self, object: FileObject) -> Result<(), FirmflowError> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Relaxed) {
            return Err(FirmflowError::ShuttingDown);
        }
        if !inner.known.lock().insert(object.uid.clone()) {
            debug!(uid = %object.uid, "content already scheduled, recording location only");
            if let Some(pending) = inner.table.lock().objects.get_mut(&object.uid) {
                pending.object.absorb(&object);
            }
            (inner.hooks.pre_analysis)(&object);
            return Ok(());
        }

        let pauses = inner
            .gate
            .wait_for_capacity(|| inner.state.analysis.get(), &inner.shutdown);
        if pauses > 0 {
            debug!(uid = %object.uid, pauses, "analysis admission was throttled");
        }

        (inner.hooks.pre_analysis)(&object);
        let owed = inner.plan(&object);
        let uid = object.uid.clone();
        debug!(%uid, plugins = ?owed, "scheduling analysis");

        let progress = {
            let mut table = inner.table.lock();
            table.objects.insert(
                uid.clone(),
                PendingObject {
                    object,
                    owed,
                    running: BTreeSet::new(),
                },
            );
            inner.advance(&mut table, &uid, Vec::new())
        };
        if let Some(progress) = progress {
            inner.publish(progress);
        }
        Ok(())
    }

    /// Objects admitted but not yet complete
    pub fn pending(&self) -> usize {
        self.inner.table.lock().objects.len()
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn is_throttled(&self) -> bool {
        self.inner.gate.is_throttled()
    }

    pub fn runner(&self, plugin: &str) -> Option<&PluginRunner> {
        self.inner.runners.get(plugin)
    }

    /// First fail-fast crash of any plugin pool
    pub fn fatal_error(&self) -> Option<WorkerError> {
        self.inner
            .runners
            .values()
            .find_map(|runner| runner.workers().fatal_error())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let grace = self.inner.settings.poll_delay * 10 + Duration::from_secs(1);
        for runner in self.inner.runners.values() {
            runner.shutdown(grace);
        }
        for handle in self.background.lock().drain(..) {
            let _ = handle.join();
        }
        debug!("analysis scheduler stopped");
    }
}

impl Inner {
    /// Plugins owed for an object: the selection closed over dependencies, filtered by mime
    fn plan(&self, object: &FileObject) -> BTreeSet<&'static str> {
        self.registry
            .with_dependencies(&self.settings.default_plugins)
            .into_iter()
            .filter(|name| !object.processed_analysis.contains_key(*name))
            .filter(|name| {
                self.registry
                    .get(name)
                    .is_some_and(|plugin| plugin.accepts_mime(&object.mime))
            })
            .collect()
    }

    fn collect_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.outcomes.recv_timeout(self.settings.poll_delay) {
                Ok(outcome) => self.handle_outcome(outcome),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.retry_deferred();
        }
    }

    fn supervise_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(self.settings.supervisor_interval);
            for runner in self.runners.values() {
                if let Err(e) = runner.workers().check() {
                    error!(plugin = runner.name(), error = %e, "plugin pool failed, shutting down");
                    self.shutdown.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn handle_outcome(&self, outcome: PluginOutcome) {
        self.state.analysis.decrement();
        let PluginOutcome { uid, plugin, result } = outcome;

        let progress = {
            let mut table = self.table.lock();
            let Some(pending) = table.objects.get_mut(&uid) else {
                warn!(%uid, plugin, "result for an object that is not pending");
                return;
            };
            pending.running.remove(plugin);
            pending.owed.remove(plugin);

            let record = match result {
                Ok(entry) => entry,
                Err(e) => {
                    let version = self.registry.get(plugin).map_or("unknown", |p| p.version());
                    pending.object.analysis_exception = Some((plugin.to_string(), e.to_string()));
                    AnalysisEntry::failure(version, e.to_string())
                }
            };
            pending
                .object
                .processed_analysis
                .insert(plugin.to_string(), record.clone());
            self.advance(&mut table, &uid, vec![(plugin, record)])
        };
        if let Some(progress) = progress {
            self.publish(progress);
        }
    }

    fn retry_deferred(&self) {
        let ready: Vec<String> = {
            let table = self.table.lock();
            table
                .deferred
                .iter()
                .filter(|uid| !self.state.locks.is_locked(uid))
                .cloned()
                .collect()
        };
        for uid in ready {
            let progress = self.advance(&mut self.table.lock(), &uid, Vec::new());
            if let Some(progress) = progress {
                self.publish(progress);
            }
        }
    }

    /// Dispatch what is ready for `uid` and take it out of the table when done
    fn advance(
        &self,
        table: &mut PendingTable,
        uid: &str,
        mut reports: Vec<(&'static str, AnalysisEntry)>,
    ) -> Option<Progress> {
        let pending = table.objects.get_mut(uid)?;

        if self.state.locks.is_locked(uid) {
            debug!(uid, "object is still being unpacked, deferring dispatch");
            table.deferred.insert(uid.to_string());
        } else {
            table.deferred.remove(uid);
            reports.extend(self.dispatch(pending));
        }

        if pending.is_finished() {
            let done = table.objects.remove(uid)?;
            return Some(Progress {
                object: done.object,
                reports,
                finished: true,
            });
        }
        if reports.is_empty() {
            return None;
        }
        Some(Progress {
            object: pending.object.clone(),
            reports,
            finished: false,
        })
    }

    fn dispatch(&self, pending: &mut PendingObject) -> Vec<(&'static str, AnalysisEntry)> {
        let mut reports = Vec::new();
        loop {
            let mut progressed = false;
            let idle: Vec<&'static str> = pending
                .owed
                .iter()
                .filter(|name| !pending.running.contains(*name))
                .copied()
                .collect();

            for name in idle {
                let Some(plugin) = self.registry.get(name) else {
                    continue;
                };
                let verdict = match readiness(&pending.object, plugin, &pending.owed) {
                    Readiness::Ready => match self.submit(plugin, &pending.object) {
                        Ok(()) => {
                            pending.running.insert(name);
                            continue;
                        }
                        Err(e) => Readiness::Blocked(e),
                    },
                    other => other,
                };
                if let Readiness::Blocked(reason) = verdict {
                    reports.push(record_failure(pending, plugin, &reason));
                    progressed = true;
                }
            }

            // owed plugins that wait on each other with nothing running can never start
            if !progressed && pending.running.is_empty() && !pending.owed.is_empty() {
                let stuck: Vec<&'static str> = pending.owed.iter().copied().collect();
                for name in stuck {
                    if let Some(plugin) = self.registry.get(name) {
                        let dependency = plugin
                            .dependencies()
                            .iter()
                            .find(|dep| !pending.object.has_successful_analysis(dep))
                            .copied()
                            .unwrap_or(name);
                        let reason = AnalysisError::DependencyUnavailable {
                            plugin: name.to_string(),
                            dependency: dependency.to_string(),
                        };
                        reports.push(record_failure(pending, plugin, &reason));
                    }
                }
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
        reports
    }

    fn submit(&self, plugin: &RegisteredPlugin, object: &FileObject) -> Result<(), AnalysisError> {
        let runner = self
            .runners
            .get(plugin.name())
            .ok_or_else(|| AnalysisError::NoRunner {
                plugin: plugin.name().to_string(),
            })?;
        let target = AnalysisTarget::for_object(object, plugin.dependencies());
        self.state.analysis.increment();
        runner.submit(AnalysisTask { target }).map_err(|e| {
            self.state.analysis.decrement();
            AnalysisError::Exception {
                plugin: plugin.name().to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn publish(&self, progress: Progress) {
        let Progress {
            object,
            reports,
            finished,
        } = progress;
        for (plugin, entry) in &reports {
            (self.hooks.post_analysis)(&object, plugin, entry);
        }
        if finished {
            self.completed.fetch_add(1, Ordering::Relaxed);
            debug!(uid = %object.uid, plugins = object.processed_analysis.len(), "analysis complete");
            (self.hooks.on_complete)(object);
        }
    }
}

fn readiness(object: &FileObject, plugin: &RegisteredPlugin, owed: &BTreeSet<&'static str>) -> Readiness {
    let mut waiting = false;
    for dependency in plugin.dependencies() {
        match object.processed_analysis.get(*dependency) {
            Some(entry) if entry.is_failed() => {
                return Readiness::Blocked(AnalysisError::DependencyFailed {
                    plugin: plugin.name().to_string(),
                    dependency: dependency.to_string(),
                });
            }
            Some(_) => {}
            None if owed.contains(dependency) => waiting = true,
            None => {
                return Readiness::Blocked(AnalysisError::DependencyUnavailable {
                    plugin: plugin.name().to_string(),
                    dependency: dependency.to_string(),
                });
            }
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

fn record_failure(
    pending: &mut PendingObject,
    plugin: &RegisteredPlugin,
    reason: &AnalysisError,
) -> (&'static str, AnalysisEntry) {
    let name = plugin.name();
    let message = reason.to_string();
    debug!(uid = %pending.object.uid, plugin = name, reason = %message, "plugin will not run");
    let entry = AnalysisEntry::failure(plugin.version(), message.clone());
    pending.owed.remove(name);
    pending
        .object
        .processed_analysis
        .insert(name.to_string(), entry.clone());
    pending.object.analysis_exception = Some((name.to_string(), message));
    (name, entry)
}
