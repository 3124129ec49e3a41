//! Unpacking stage
//!
//! Objects move Queued -> Unpacking -> ChildrenForwarded (or
//! DepthLimitReached). Every object, container or not, is handed to the
//! `post_unpack` hook once its own unpack step is done; its children are
//! queued afterwards so they never reach analysis before their parent.

use super::workload::{AdmissionGate, SchedulerState, Sleeper};
use crate::config::FirmflowConfig;
use crate::error::{ConfigError, FirmflowError, WorkerError};
use crate::objects::FileObject;
use crate::objects::mime::MimeFilter;
use crate::process::{CrashPolicy, ExceptionSafeProcess, ProcessGroup, panic_message};
use crate::unpack::{UNPACKER_KEY, Unpacker};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Called with every object leaving the unpacking stage
pub type PostUnpackHook = Arc<dyn Fn(FileObject) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UnpackingSettings {
    pub threads: usize,
    pub throttle_limit: i64,
    pub poll_delay: Duration,
    pub monitor_interval: Duration,
    pub throttle_pause: Duration,
    pub supervisor_interval: Duration,
    pub crash_policy: CrashPolicy,
    /// Mime types forwarded to analysis without extraction
    pub skip: MimeFilter,
}

impl UnpackingSettings {
    pub fn from_config(config: &FirmflowConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            threads: config.unpack_threads(),
            throttle_limit: config.unpack.throttle_limit,
            poll_delay: config.scheduler.block_delay(),
            monitor_interval: config.scheduler.monitor_interval(),
            throttle_pause: config.scheduler.throttle_pause(),
            supervisor_interval: config.scheduler.supervisor_interval(),
            crash_policy: config.scheduler.crash_policy,
            skip: config.skip_filter()?,
        })
    }
}

#[derive(Debug, Default)]
pub struct UnpackStats {
    pub unpacked: AtomicU64,
    pub duplicates: AtomicU64,
    pub skipped: AtomicU64,
    pub crashed: AtomicU64,
}

struct Inner {
    settings: UnpackingSettings,
    unpacker: Unpacker,
    state: Arc<SchedulerState>,
    gate: AdmissionGate,
    queue_tx: Sender<FileObject>,
    queue_rx: Receiver<FileObject>,
    post_unpack: PostUnpackHook,
    shutdown: Arc<AtomicBool>,
    /// Shallowest depth each uid was claimed at. Never pruned, so it grows with
    /// every distinct file for the lifetime of the scheduler.
    seen: Mutex<HashMap<String, usize>>,
    stats: UnpackStats,
}

pub struct UnpackingScheduler {
    inner: Arc<Inner>,
    workers: ProcessGroup,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl UnpackingScheduler {
    pub fn new(
        settings: UnpackingSettings,
        unpacker: Unpacker,
        state: Arc<SchedulerState>,
        post_unpack: PostUnpackHook,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let (queue_tx, queue_rx) = channel::unbounded();
        let gate = AdmissionGate::new(settings.throttle_limit, settings.throttle_pause, sleeper);
        let workers = ProcessGroup::new("Unpacking", settings.crash_policy);
        Self {
            inner: Arc::new(Inner {
                settings,
                unpacker,
                state,
                gate,
                queue_tx,
                queue_rx,
                post_unpack,
                shutdown: Arc::new(AtomicBool::new(false)),
                seen: Mutex::new(HashMap::new()),
                stats: UnpackStats::default(),
            }),
            workers,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start workers, the workload monitor and the worker supervisor
    pub fn start(&self) -> Result<(), WorkerError> {
        self.start_workers()?;
        self.start_monitor()?;
        let supervisor = self
            .workers
            .spawn_supervisor(self.inner.settings.supervisor_interval, Arc::clone(&self.inner.shutdown))?;
        self.background.lock().push(supervisor);
        info!(workers = self.inner.settings.threads, "unpacking scheduler started");
        Ok(())
    }

    pub fn start_workers(&self) -> Result<(), WorkerError> {
        for index in 0..self.inner.settings.threads.max(1) {
            let inner = Arc::clone(&self.inner);
            self.workers
                .spawn(ExceptionSafeProcess::new(format!("unpack-{index}"), move || {
                    inner.worker_loop();
                    Ok(())
                }))?;
        }
        Ok(())
    }

    /// Periodically recompute the combined backlog and raise the throttle indicator
    pub fn start_monitor(&self) -> Result<(), WorkerError> {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("unpack-monitor".to_string())
            .spawn(move || {
                while !inner.shutdown.load(Ordering::Relaxed) {
                    let backlog = inner.state.combined_backlog();
                    inner.gate.monitor_tick(backlog);
                    sleep_unless(&inner.shutdown, inner.settings.monitor_interval);
                }
            })
            .map_err(|e| WorkerError::SpawnFailed {
                name: "unpack-monitor".to_string(),
                reason: e.to_string(),
            })?;
        self.background.lock().push(handle);
        Ok(())
    }

    /// Admit an object, waiting while the combined backlog is above the limit
    pub fn add_task(&self, object: FileObject) -> Result<(), FirmflowError> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Relaxed) {
            return Err(FirmflowError::ShuttingDown);
        }
        let pauses = inner
            .gate
            .wait_for_capacity(|| inner.state.combined_backlog(), &inner.shutdown);
        if pauses > 0 {
            debug!(uid = %object.uid, pauses, "admission was throttled");
        }
        if inner.shutdown.load(Ordering::Relaxed) {
            return Err(FirmflowError::ShuttingDown);
        }
        inner.enqueue(object)?;
        Ok(())
    }

    pub fn is_throttled(&self) -> bool {
        self.inner.gate.is_throttled()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue_rx.len()
    }

    pub fn stats(&self) -> &UnpackStats {
        &self.inner.stats
    }

    pub fn workers(&self) -> &ProcessGroup {
        &self.workers
    }

    pub fn fatal_error(&self) -> Option<WorkerError> {
        self.workers.fatal_error()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let grace = self.inner.settings.poll_delay * 10 + Duration::from_secs(1);
        self.workers.join_all(grace);
        for handle in self.background.lock().drain(..) {
            let _ = handle.join();
        }
        debug!("unpacking scheduler stopped");
    }
}

impl Inner {
    fn enqueue(&self, object: FileObject) -> Result<(), WorkerError> {
        self.state.unpacking.increment();
        if self.queue_tx.send(object).is_err() {
            self.state.unpacking.decrement();
            return Err(WorkerError::QueueClosed);
        }
        Ok(())
    }

    fn worker_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.queue_rx.recv_timeout(self.settings.poll_delay) {
                Ok(object) => {
                    let _slot = self.state.unpacking.slot();
                    self.process(object);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Whether this occurrence of the content should be unpacked
    ///
    /// Content is unpacked once, unless the earlier pass stopped at the depth
    /// limit and this occurrence sits above it.
    fn claim(&self, object: &FileObject) -> bool {
        let max_depth = self.unpacker.max_depth();
        match self.seen.lock().entry(object.uid.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(object.depth);
                true
            }
            Entry::Occupied(mut slot) => {
                if *slot.get() >= max_depth && object.depth < max_depth {
                    debug!(uid = %object.uid, depth = object.depth, "content reached above the depth limit, unpacking again");
                    slot.insert(object.depth);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn forward(&self, object: FileObject) {
        let uid = object.uid.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.post_unpack)(object))) {
            error!(%uid, error = %panic_message(payload.as_ref()), "post_unpack hook crashed");
            self.stats.crashed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn process(&self, mut object: FileObject) {
        if !self.claim(&object) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(uid = %object.uid, "content already unpacked, forwarding new location only");
            self.forward(object);
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.unpacker.unpack(&mut object)));
        let children = match outcome {
            Ok(children) => children,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(uid = %object.uid, error = %message, "unpacking crashed");
                self.stats.crashed.fetch_add(1, Ordering::Relaxed);
                object.analysis_exception = Some((UNPACKER_KEY.to_string(), message));
                Vec::new()
            }
        };
        self.stats.unpacked.fetch_add(1, Ordering::Relaxed);

        let uid = object.uid.clone();
        self.forward(object);

        for mut child in children {
            if self.settings.skip.is_match(&child.mime) {
                self.unpacker.mark_skipped(&mut child);
                self.seen.lock().entry(child.uid.clone()).or_insert(child.depth);
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.forward(child);
            } else if let Err(e) = self.enqueue(child) {
                error!(parent = %uid, error = %e, "could not queue child");
            }
        }
    }
}

fn sleep_unless(shutdown: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(10);
    let mut slept = Duration::ZERO;
    while slept < total && !shutdown.load(Ordering::Relaxed) {
        thread::sleep(step.min(total - slept));
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionError;
    use crate::objects::create_uid;
    use crate::scheduler::workload::ThreadSleeper;
    use crate::scheduler::workload::testing::RecordingSleeper;
    use crate::storage::BlobStore;
    use crate::unpack::extractors::fixtures::tar_bytes;
    use crate::unpack::{ExtractedFile, ExtractionMethod, UnpackMeta};
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::TempDir;

    fn settings() -> UnpackingSettings {
        UnpackingSettings {
            threads: 2,
            throttle_limit: -1,
            poll_delay: Duration::from_millis(10),
            monitor_interval: Duration::from_millis(10),
            throttle_pause: Duration::from_millis(5),
            supervisor_interval: Duration::from_millis(20),
            crash_policy: CrashPolicy::Restart,
            skip: MimeFilter::new(&["text/*"]).unwrap(),
        }
    }

    struct Harness {
        temp_dir: TempDir,
        scheduler: UnpackingScheduler,
        forwarded: Receiver<FileObject>,
        state: Arc<SchedulerState>,
    }

    fn harness(settings: UnpackingSettings, sleeper: Arc<dyn Sleeper>) -> Harness {
        harness_with(settings, sleeper, None)
    }

    fn harness_with(
        settings: UnpackingSettings,
        sleeper: Arc<dyn Sleeper>,
        methods: Option<Vec<Box<dyn ExtractionMethod>>>,
    ) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let state = SchedulerState::new();
        let blobs = BlobStore::new(temp_dir.path().join("blobs")).unwrap();
        let mut unpacker = Unpacker::new(3, Arc::clone(&state.locks), blobs);
        if let Some(methods) = methods {
            unpacker = unpacker.with_methods(methods);
        }
        let (tx, forwarded) = channel::unbounded();
        let hook: PostUnpackHook = Arc::new(move |object: FileObject| {
            let _ = tx.send(object);
        });
        let scheduler = UnpackingScheduler::new(settings, unpacker, Arc::clone(&state), hook, sleeper);
        Harness {
            temp_dir,
            scheduler,
            forwarded,
            state,
        }
    }

    fn root(temp_dir: &TempDir, name: &str, data: &[u8]) -> FileObject {
        let path = temp_dir.path().join(name);
        fs::write(&path, data).unwrap();
        FileObject::from_path(&path).unwrap()
    }

    fn collect(rx: &Receiver<FileObject>, count: usize) -> Vec<FileObject> {
        (0..count)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).expect("object forwarded"))
            .collect()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_nested_archive_scenario() {
        let h = harness(settings(), Arc::new(ThreadSleeper));
        h.scheduler.start().unwrap();

        let leaf_bytes: &[u8] = b"leaf file content\n";
        let inner = tar_bytes(&[("leaf.txt", leaf_bytes)]);
        let outer = tar_bytes(&[("inner.tar", &inner)]);
        let outer_object = root(&h.temp_dir, "outer.tar", &outer);
        h.scheduler.add_task(outer_object.clone()).unwrap();

        let objects: HashMap<usize, FileObject> = collect(&h.forwarded, 3)
            .into_iter()
            .map(|o| (o.depth, o))
            .collect();

        let outer = &objects[&0];
        let inner = &objects[&1];
        let leaf = &objects[&2];
        assert_eq!(outer.uid, outer_object.uid);
        assert_eq!(outer.files_included.len(), 1);
        assert_eq!(inner.files_included.len(), 1);
        assert!(outer.files_included.contains(&inner.uid));
        assert!(inner.files_included.contains(&leaf.uid));
        assert_eq!(leaf.depth, 2);
        assert_eq!(leaf.uid, create_uid(leaf_bytes));
        assert!(UnpackMeta::of(leaf).unwrap().info.unwrap().contains("skipped"));

        wait_until(|| h.state.unpacking.get() == 0);
        assert!(!h.state.locks.is_locked(&outer.uid));
        h.scheduler.shutdown();
    }

    #[test]
    fn test_duplicate_content_is_unpacked_once() {
        let h = harness(settings(), Arc::new(ThreadSleeper));
        h.scheduler.start().unwrap();

        let shared: &[u8] = b"\x00\x01shared binary\xff";
        let a = tar_bytes(&[("shared.bin", shared)]);
        let b = tar_bytes(&[("copy/shared.bin", shared)]);
        let outer = tar_bytes(&[("a.tar", &a), ("b.tar", &b)]);
        h.scheduler.add_task(root(&h.temp_dir, "outer.tar", &outer)).unwrap();

        // outer, a, b, and the shared blob reached through both
        let objects = collect(&h.forwarded, 5);
        let shared_uid = create_uid(shared);
        let copies: Vec<&FileObject> = objects.iter().filter(|o| o.uid == shared_uid).collect();
        assert_eq!(copies.len(), 2);
        let paths: HashSet<&str> = copies.iter().flat_map(|o| o.virtual_paths()).collect();
        assert_eq!(paths.len(), 2);

        wait_until(|| h.state.unpacking.get() == 0);
        assert_eq!(h.scheduler.stats().duplicates.load(Ordering::Relaxed), 1);
        h.scheduler.shutdown();
    }

    #[test]
    fn test_depth_limited_objects_are_still_forwarded() {
        let h = harness(settings(), Arc::new(ThreadSleeper));
        h.scheduler.start().unwrap();

        let mut object = root(&h.temp_dir, "deep.tar", &tar_bytes(&[("x.bin", b"\x00\x01")]));
        object.depth = 3;
        h.scheduler.add_task(object).unwrap();

        let forwarded = collect(&h.forwarded, 1);
        assert!(forwarded[0].files_included.is_empty());
        let meta = UnpackMeta::of(&forwarded[0]).unwrap();
        assert!(meta.info.unwrap().contains("maximum unpacking depth"));
        h.scheduler.shutdown();
    }

    #[test]
    fn test_container_stopped_at_depth_limit_is_unpacked_when_reached_higher() {
        let h = harness(settings(), Arc::new(ThreadSleeper));
        h.scheduler.start().unwrap();

        let data = tar_bytes(&[("x.bin", b"\x00\x01payload")]);
        let mut deep = root(&h.temp_dir, "inner.tar", &data);
        deep.depth = 3;
        h.scheduler.add_task(deep.clone()).unwrap();
        let first = collect(&h.forwarded, 1);
        assert!(first[0].files_included.is_empty());

        let mut shallow = deep.clone();
        shallow.depth = 0;
        h.scheduler.add_task(shallow).unwrap();
        let objects = collect(&h.forwarded, 2);
        let container = objects.iter().find(|o| o.uid == deep.uid).unwrap();
        assert_eq!(container.depth, 0);
        assert_eq!(container.files_included.len(), 1);
        let meta = UnpackMeta::of(container).unwrap();
        assert_eq!(meta.plugin_used.as_deref(), Some("tar"));
        assert!(objects.iter().any(|o| o.file_name == "x.bin" && o.depth == 1));

        // once unpacked, deeper copies are plain duplicates
        h.scheduler.add_task(deep).unwrap();
        let again = collect(&h.forwarded, 1);
        assert!(again[0].files_included.is_empty());
        assert!(UnpackMeta::of(&again[0]).is_none());
        wait_until(|| h.state.unpacking.get() == 0);
        assert_eq!(h.scheduler.stats().duplicates.load(Ordering::Relaxed), 1);
        h.scheduler.shutdown();
    }

    #[test]
    fn test_post_unpack_panic_releases_in_flight_slot() {
        let mut settings = settings();
        settings.threads = 1;

        let temp_dir = TempDir::new().unwrap();
        let state = SchedulerState::new();
        let blobs = BlobStore::new(temp_dir.path().join("blobs")).unwrap();
        let unpacker = Unpacker::new(3, Arc::clone(&state.locks), blobs);
        let (tx, forwarded) = channel::unbounded();
        let hook: PostUnpackHook = Arc::new(move |object: FileObject| {
            if object.file_name == "bad.tar" {
                panic!("storage backend unavailable");
            }
            let _ = tx.send(object);
        });
        let scheduler = UnpackingScheduler::new(settings, unpacker, Arc::clone(&state), hook, Arc::new(ThreadSleeper));
        scheduler.start().unwrap();

        let bad = tar_bytes(&[("inner.bin", b"\x00\x02inner payload")]);
        scheduler.add_task(root(&temp_dir, "bad.tar", &bad)).unwrap();
        scheduler.add_task(root(&temp_dir, "good.txt", b"good")).unwrap();

        let names: HashSet<String> = collect(&forwarded, 2).into_iter().map(|o| o.file_name).collect();
        assert!(names.contains("inner.bin"));
        assert!(names.contains("good.txt"));

        wait_until(|| state.unpacking.get() == 0);
        assert_eq!(scheduler.stats().crashed.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler.workers().len(), 1);
        assert!(scheduler.fatal_error().is_none());
        scheduler.shutdown();
    }

    #[test]
    fn test_in_flight_slot_released_on_unwind() {
        let state = SchedulerState::new();
        state.unpacking.increment();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _slot = state.unpacking.slot();
            panic!("worker died");
        }));
        assert!(result.is_err());
        assert_eq!(state.unpacking.get(), 0);
    }

    #[test]
    fn test_throttled_admission_pauses() {
        let mut settings = settings();
        settings.throttle_limit = 0;
        settings.threads = 1;

        // the hook blocks the only worker until the gate has paused once
        let (release_tx, release_rx) = channel::bounded::<()>(1);
        let sleeper = RecordingSleeper::with_callback(move || {
            let _ = release_tx.try_send(());
        });

        let temp_dir = TempDir::new().unwrap();
        let state = SchedulerState::new();
        let blobs = BlobStore::new(temp_dir.path().join("blobs")).unwrap();
        let unpacker = Unpacker::new(3, Arc::clone(&state.locks), blobs);
        let hook: PostUnpackHook = Arc::new(move |object: FileObject| {
            if object.file_name == "one.txt" {
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
            }
        });
        let scheduler = UnpackingScheduler::new(settings, unpacker, state, hook, sleeper.clone());
        scheduler.start_workers().unwrap();

        scheduler.add_task(root(&temp_dir, "one.txt", b"first")).unwrap();
        scheduler.add_task(root(&temp_dir, "two.txt", b"second")).unwrap();

        assert!(sleeper.calls() >= 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_disabled_throttle_never_pauses() {
        let sleeper = RecordingSleeper::new();
        let h = harness(settings(), sleeper.clone());
        h.scheduler.start_monitor().unwrap();

        for _ in 0..1000 {
            h.state.analysis.increment();
        }
        for index in 0..5 {
            let name = format!("f{index}.txt");
            h.scheduler.add_task(root(&h.temp_dir, &name, name.as_bytes())).unwrap();
        }
        thread::sleep(Duration::from_millis(50));

        assert_eq!(sleeper.calls(), 0);
        assert!(!h.scheduler.is_throttled());
        h.scheduler.shutdown();
    }

    #[test]
    fn test_monitor_raises_throttle_indicator() {
        let mut settings = settings();
        settings.throttle_limit = 3;
        let sleeper = RecordingSleeper::new();
        let h = harness(settings, sleeper.clone());

        for _ in 0..10 {
            h.state.analysis.increment();
        }
        h.scheduler.start_monitor().unwrap();

        wait_until(|| sleeper.calls() >= 1);
        assert!(h.scheduler.is_throttled());

        for _ in 0..10 {
            h.state.analysis.decrement();
        }
        wait_until(|| !h.scheduler.is_throttled());
        h.scheduler.shutdown();
    }

    struct PanickingExtractor;

    impl ExtractionMethod for PanickingExtractor {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn handles(&self, mime: &str) -> bool {
            mime == "application/octet-stream"
        }

        fn extract(&self, _source: &Path, _target: &Path) -> Result<Vec<ExtractedFile>, ExtractionError> {
            panic!("extractor bug");
        }
    }

    #[test]
    fn test_unpack_panic_is_recorded_and_worker_continues() {
        let mut settings = settings();
        settings.threads = 1;
        let h = harness_with(settings, Arc::new(ThreadSleeper), Some(vec![Box::new(PanickingExtractor) as Box<dyn ExtractionMethod>]));
        h.scheduler.start().unwrap();

        h.scheduler.add_task(root(&h.temp_dir, "a.bin", b"\x00\x01\x02")).unwrap();
        h.scheduler.add_task(root(&h.temp_dir, "b.bin", b"\x00\x01\x03")).unwrap();

        let objects = collect(&h.forwarded, 2);
        for object in &objects {
            let (source, message) = object.analysis_exception.clone().unwrap();
            assert_eq!(source, UNPACKER_KEY);
            assert_eq!(message, "extractor bug");
        }
        assert!(!h.state.locks.is_locked(&objects[0].uid));
        assert_eq!(h.scheduler.stats().crashed.load(Ordering::Relaxed), 2);
        assert_eq!(h.scheduler.workers().len(), 1);
        h.scheduler.shutdown();
    }

    #[test]
    fn test_add_task_after_shutdown() {
        let h = harness(settings(), Arc::new(ThreadSleeper));
        h.scheduler.start().unwrap();
        h.scheduler.shutdown();
        assert!(h.scheduler.is_shut_down());
        let result = h.scheduler.add_task(root(&h.temp_dir, "late.txt", b"late"));
        assert!(matches!(result, Err(FirmflowError::ShuttingDown)));
    }
}
