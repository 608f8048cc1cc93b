//! Single-assignment completion cell.
//!
//! `FutureCell` is the asynchronous completion primitive used for both
//! primitive remote calls and remote-reference creation: it starts
//! pending, transitions exactly once to a value or an error, and supports
//! any number of waiters and completion callbacks.

use crate::types::{RpcError, RpcResult};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::warn;

type Callback<T> = Box<dyn FnOnce(&RpcResult<T>) + Send>;

struct Inner<T> {
    result: Option<RpcResult<T>>,
    callbacks: Vec<Callback<T>>,
}

/// A thread-safe, single-assignment result cell.
///
/// The transition from pending to completed is irreversible and visible
/// to all observers: completion happens-before any `wait` return or
/// callback invocation. A second completion attempt is ignored.
pub struct FutureCell<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Clone + Send + 'static> FutureCell<T> {
    /// Create a new pending cell.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                result: None,
                callbacks: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Complete the cell with a value.
    ///
    /// Logs and ignores the attempt if the cell is already completed.
    pub fn complete(&self, value: T) {
        if !self.finish(Ok(value)) {
            warn!("ignoring completion of an already-completed future");
        }
    }

    /// Complete the cell with an error.
    ///
    /// Logs and ignores the attempt if the cell is already completed.
    pub fn fail(&self, err: RpcError) {
        if !self.finish(Err(err)) {
            warn!("ignoring error completion of an already-completed future");
        }
    }

    /// Complete the cell with an error only if it is still pending.
    ///
    /// Returns `true` if this call performed the transition. Used by
    /// timeout watchdogs racing against the real response.
    pub fn fail_if_pending(&self, err: RpcError) -> bool {
        self.finish(Err(err))
    }

    /// Complete the cell with a value only if it is still pending.
    ///
    /// Returns `true` if this call performed the transition. Used by
    /// responders that may lose the race against a timeout watchdog.
    pub fn complete_if_pending(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    fn finish(&self, result: RpcResult<T>) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock().expect("future lock poisoned");
            if inner.result.is_some() {
                return false;
            }
            inner.result = Some(result.clone());
            std::mem::take(&mut inner.callbacks)
        };

        // Callbacks and waiters run outside the lock so they may touch
        // the cell again.
        for cb in callbacks {
            cb(&result);
        }
        self.notify.notify_waiters();
        true
    }

    /// Whether the cell has completed (with a value or an error).
    pub fn is_ready(&self) -> bool {
        self.inner
            .lock()
            .expect("future lock poisoned")
            .result
            .is_some()
    }

    /// Get the result without waiting, if completed.
    pub fn try_result(&self) -> Option<RpcResult<T>> {
        self.inner
            .lock()
            .expect("future lock poisoned")
            .result
            .clone()
    }

    /// Wait for completion and return a clone of the result.
    ///
    /// Any number of tasks may wait concurrently; all observe the same
    /// result.
    pub async fn wait(&self) -> RpcResult<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Register a callback to run on completion.
    ///
    /// Runs immediately on the calling thread if the cell has already
    /// completed, otherwise on the completing thread.
    pub fn add_callback(&self, cb: impl FnOnce(&RpcResult<T>) + Send + 'static) {
        let mut inner = self.inner.lock().expect("future lock poisoned");
        match inner.result.as_ref() {
            Some(result) => {
                let result = result.clone();
                drop(inner);
                cb(&result);
            }
            None => inner.callbacks.push(Box::new(cb)),
        }
    }
}

impl<T: Clone + Send + 'static> Default for FutureCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FutureCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = self
            .inner
            .lock()
            .map(|inner| inner.result.is_some())
            .unwrap_or(false);
        f.debug_struct("FutureCell").field("ready", &ready).finish()
    }
}
