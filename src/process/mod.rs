//! Exception-safe workers and their supervision
//!
//! An [`ExceptionSafeProcess`] runs its body on a dedicated named thread and
//! captures whatever ends it abnormally, an `Err` return or a panic, so the
//! supervisor can inspect it instead of the worker vanishing silently.

use crate::error::WorkerError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub mod supervisor;

pub use supervisor::{ProcessGroup, check_worker_exceptions};

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// What to do when a supervised worker dies with a captured failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashPolicy {
    /// Replace the worker with a fresh equivalent
    Restart,
    /// Surface the failure to the owner of the pool
    FailFast,
}

pub type ProcessBody = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Failure captured from a worker body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    pub message: String,
    pub panicked: bool,
}

pub struct ExceptionSafeProcess {
    id: u64,
    name: String,
    body: ProcessBody,
    handle: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<ProcessFailure>>>,
}

impl ExceptionSafeProcess {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::from_body(name, Arc::new(body))
    }

    pub fn from_body(name: impl Into<String>, body: ProcessBody) -> Self {
        Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            body,
            handle: None,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let body = Arc::clone(&self.body);
        let failure = Arc::clone(&self.failure);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body()));
                let captured = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(ProcessFailure {
                        message: format!("{e:#}"),
                        panicked: false,
                    }),
                    Err(payload) => Some(ProcessFailure {
                        message: panic_message(payload.as_ref()),
                        panicked: true,
                    }),
                };
                *failure.lock() = captured;
            })
            .map_err(|e| WorkerError::SpawnFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Failure captured when the body ended abnormally
    pub fn exception(&self) -> Option<ProcessFailure> {
        self.failure.lock().clone()
    }

    /// A fresh, not yet started process running the same body
    pub fn respawn(&self) -> Self {
        Self::from_body(self.name.clone(), Arc::clone(&self.body))
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            // the body runs under catch_unwind, so the thread itself never panics
            let _ = handle.join();
        }
    }

    /// Wait up to `timeout`; a worker still running afterwards is detached
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive() {
            if Instant::now() >= deadline {
                tracing::warn!(worker = %self.name, "worker did not stop in time, detaching");
                self.handle = None;
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.join();
        true
    }
}

impl std::fmt::Debug for ExceptionSafeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionSafeProcess")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// True when `new` is a different worker than `old`
pub fn new_worker_was_started(old: &ExceptionSafeProcess, new: &ExceptionSafeProcess) -> bool {
    old.id() != new.id()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn finished(process: &mut ExceptionSafeProcess) {
        assert!(process.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_successful_body_has_no_exception() {
        let mut process = ExceptionSafeProcess::new("ok", || Ok(()));
        process.start().unwrap();
        finished(&mut process);
        assert!(process.exception().is_none());
        assert!(!process.is_alive());
    }

    #[test]
    fn test_error_is_captured() {
        let mut process = ExceptionSafeProcess::new("failing", || bail!("test error"));
        process.start().unwrap();
        finished(&mut process);

        let failure = process.exception().expect("failure should be captured");
        assert_eq!(failure.message, "test error");
        assert!(!failure.panicked);
    }

    #[test]
    fn test_panic_is_captured() {
        let mut process = ExceptionSafeProcess::new("panicking", || panic!("worker exploded"));
        process.start().unwrap();
        finished(&mut process);

        let failure = process.exception().unwrap();
        assert_eq!(failure.message, "worker exploded");
        assert!(failure.panicked);
    }

    #[test]
    fn test_respawn_is_a_new_worker() {
        let process = ExceptionSafeProcess::new("worker", || Ok(()));
        let replacement = process.respawn();
        assert!(new_worker_was_started(&process, &replacement));
        assert!(!new_worker_was_started(&process, &process));
        assert_eq!(replacement.name(), "worker");
        assert!(!replacement.is_started());
    }

    #[test]
    fn test_panic_message_fallback() {
        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }
}
