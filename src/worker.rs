//! Named background threads with cooperative shutdown

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::types::ReaderError;

/// A background thread that runs until its shutdown flag is raised.
///
/// The body receives the flag and is expected to check it at least once per
/// poll interval. The thread is joined on [`stop`](Self::stop) or drop.
#[derive(Debug)]
pub struct WorkerThread {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    name: String,
}

impl WorkerThread {
    pub fn spawn<F>(name: &str, body: F) -> Result<Self, ReaderError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))
            .map_err(|e| ReaderError::Worker(format!("failed to spawn {name}: {e}")))?;

        debug!("Started worker {}", name);
        Ok(Self {
            handle: Some(handle),
            shutdown,
            name: name.to_string(),
        })
    }

    /// Signal the worker to stop and wait for it to finish
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker {} panicked", self.name);
            } else {
                debug!("Stopped worker {}", self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}
