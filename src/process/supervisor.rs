use super::{CrashPolicy, ExceptionSafeProcess};
use crate::error::WorkerError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, warn};

/// Scan `processes` for workers that died with a captured failure
///
/// Under [`CrashPolicy::Restart`] each one is replaced in place by a freshly
/// started equivalent and the number of restarts is returned. Under
/// [`CrashPolicy::FailFast`] the first failed worker is removed from the list
/// and reported as [`WorkerError::Crashed`].
pub fn check_worker_exceptions(
    processes: &mut Vec<ExceptionSafeProcess>,
    worker_label: &str,
    policy: CrashPolicy,
) -> Result<usize, WorkerError> {
    let mut restarted = 0;
    for index in 0..processes.len() {
        if processes[index].is_alive() {
            continue;
        }
        let Some(failure) = processes[index].exception() else {
            continue;
        };
        error!(
            worker = processes[index].name(),
            error = %failure.message,
            "Exception in {worker_label}"
        );

        match policy {
            CrashPolicy::FailFast => {
                let mut failed = processes.remove(index);
                failed.join();
                return Err(WorkerError::Crashed {
                    label: worker_label.to_string(),
                    name: failed.name().to_string(),
                    message: failure.message,
                });
            }
            CrashPolicy::Restart => {
                warn!(worker = processes[index].name(), "restarting {worker_label}");
                let mut replacement = processes[index].respawn();
                replacement.start()?;
                let mut failed = std::mem::replace(&mut processes[index], replacement);
                failed.join();
                restarted += 1;
            }
        }
    }
    Ok(restarted)
}

/// A supervised pool of workers sharing one label and crash policy
#[derive(Clone)]
pub struct ProcessGroup {
    label: String,
    policy: CrashPolicy,
    processes: Arc<Mutex<Vec<ExceptionSafeProcess>>>,
    fatal: Arc<Mutex<Option<WorkerError>>>,
}

impl ProcessGroup {
    pub fn new(label: impl Into<String>, policy: CrashPolicy) -> Self {
        Self {
            label: label.into(),
            policy,
            processes: Arc::new(Mutex::new(Vec::new())),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Start `process` and add it to the pool
    pub fn spawn(&self, mut process: ExceptionSafeProcess) -> Result<(), WorkerError> {
        process.start()?;
        self.processes.lock().push(process);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    pub fn alive(&self) -> usize {
        self.processes
            .lock()
            .iter()
            .filter(|p| p.is_alive())
            .count()
    }

    /// Run one supervision pass over the pool
    pub fn check(&self) -> Result<usize, WorkerError> {
        let result = check_worker_exceptions(&mut self.processes.lock(), &self.label, self.policy);
        if let Err(e) = &result {
            self.fatal.lock().get_or_insert_with(|| e.clone());
        }
        result
    }

    /// First fail-fast error seen by [`check`](Self::check)
    pub fn fatal_error(&self) -> Option<WorkerError> {
        self.fatal.lock().clone()
    }

    /// Check the pool every `interval` until `shutdown` is raised
    ///
    /// A fail-fast crash raises `shutdown` itself so the owning pipeline stops.
    pub fn spawn_supervisor(
        &self,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, WorkerError> {
        let group = self.clone();
        let name = format!("{}-supervisor", self.label.to_lowercase());
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = group.check() {
                        error!(error = %e, "{} pool failed, shutting down", group.label);
                        shutdown.store(true, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| WorkerError::SpawnFailed {
                name,
                reason: e.to_string(),
            })
    }

    /// Join every worker, detaching any that outlive `timeout`
    pub fn join_all(&self, timeout: Duration) -> usize {
        let mut processes = self.processes.lock();
        processes
            .iter_mut()
            .map(|p| p.join_timeout(timeout))
            .filter(|stopped| !stopped)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::new_worker_was_started;
    use anyhow::bail;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn started(name: &str, fail: bool) -> ExceptionSafeProcess {
        let mut process = if fail {
            ExceptionSafeProcess::new(name, || bail!("test error"))
        } else {
            ExceptionSafeProcess::new(name, || Ok(()))
        };
        process.start().unwrap();
        wait_until(|| !process.is_alive());
        process
    }

    #[test]
    fn test_no_failure_no_restart() {
        let mut processes = vec![started("worker-0", false), started("worker-1", false)];
        let restarted = check_worker_exceptions(&mut processes, "Unpacking", CrashPolicy::Restart).unwrap();
        assert_eq!(restarted, 0);
        assert_eq!(processes.len(), 2);
    }

    #[test]
    fn test_restart_replaces_failed_worker_in_place() {
        let mut processes = vec![started("worker-0", false), started("worker-1", true)];
        let failed_id = processes[1].id();

        let restarted = check_worker_exceptions(&mut processes, "Unpacking", CrashPolicy::Restart).unwrap();

        assert_eq!(restarted, 1);
        assert_eq!(processes.len(), 2);
        assert_ne!(processes[1].id(), failed_id);
        assert_eq!(processes[1].name(), "worker-1");
        assert!(processes[1].is_started());
    }

    #[test]
    fn test_replacement_is_new_worker() {
        let old = started("worker", true);
        let old_id = old.id();
        let mut processes = vec![old];
        check_worker_exceptions(&mut processes, "Analysis", CrashPolicy::Restart).unwrap();

        let probe = ExceptionSafeProcess::new("probe", || Ok(()));
        assert!(new_worker_was_started(&probe, &processes[0]));
        assert_ne!(processes[0].id(), old_id);
    }

    #[test]
    fn test_fail_fast_surfaces_crash() {
        let mut processes = vec![started("worker-0", true), started("worker-1", false)];

        let result = check_worker_exceptions(&mut processes, "Analysis", CrashPolicy::FailFast);

        match result {
            Err(WorkerError::Crashed { label, name, message }) => {
                assert_eq!(label, "Analysis");
                assert_eq!(name, "worker-0");
                assert_eq!(message, "test error");
            }
            other => panic!("expected crash, got {other:?}"),
        }
        assert_eq!(processes.len(), 1);
    }

    #[test]
    fn test_group_supervisor_keeps_worker_count() {
        let group = ProcessGroup::new("Test", CrashPolicy::Restart);
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        group
            .spawn(ExceptionSafeProcess::new("steady", move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }))
            .unwrap();
        group
            .spawn(ExceptionSafeProcess::new("flaky", || bail!("flaky worker")))
            .unwrap();

        wait_until(|| group.check().unwrap() > 0);
        assert_eq!(group.len(), 2);
        assert!(group.fatal_error().is_none());

        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(group.join_all(Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_group_records_fatal_error() {
        let group = ProcessGroup::new("Test", CrashPolicy::FailFast);
        group
            .spawn(ExceptionSafeProcess::new("doomed", || bail!("boom")))
            .unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let supervisor = group
            .spawn_supervisor(Duration::from_millis(10), Arc::clone(&shutdown))
            .unwrap();

        wait_until(|| shutdown.load(Ordering::SeqCst));
        supervisor.join().unwrap();
        assert!(matches!(group.fatal_error(), Some(WorkerError::Crashed { .. })));
        assert!(group.is_empty());
    }
}
