//! Serialized RFID command pipeline.
//!
//! The RFID module accepts one command at a time. Commands are queued and a
//! single worker sends them in order, holding each one "in flight" until the
//! uplink side reports it finished or a watchdog gives up on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::transport::{BleTransport, WriteMode};
use crate::types::ReaderError;

/// Outcome of a command sent with a completion attached.
///
/// Resolves to the success flag of the next command-end packet, or `false`
/// if the command could not be sent or timed out.
#[derive(Debug)]
pub struct CommandCompletion {
    rx: Receiver<bool>,
}

impl CommandCompletion {
    /// Block for at most `timeout`; `None` if still pending
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        match self.rx.recv_timeout(timeout) {
            Ok(success) => Some(success),
            Err(RecvTimeoutError::Timeout) => None,
            // Driver dropped the completion without resolving it
            Err(RecvTimeoutError::Disconnected) => Some(false),
        }
    }

    pub fn try_result(&self) -> Option<bool> {
        match self.rx.try_recv() {
            Ok(success) => Some(success),
            Err(channel::TryRecvError::Empty) => None,
            Err(channel::TryRecvError::Disconnected) => Some(false),
        }
    }
}

#[derive(Debug)]
struct QueuedCommand {
    frame: Vec<u8>,
    completion: Option<Sender<bool>>,
}

/// Timing for the pipeline worker
#[derive(Debug, Clone, Copy)]
pub struct PipelineTiming {
    /// Watchdog for a command in flight
    pub command_timeout: Duration,
    /// How often the worker checks for shutdown
    pub poll_interval: Duration,
}

/// The queue and in-flight bookkeeping, shared by the API, the uplink worker
/// and the command worker
#[derive(Debug)]
pub struct CommandPipeline {
    queue_tx: Sender<QueuedCommand>,
    queue_rx: Receiver<QueuedCommand>,
    cleared_tx: Sender<()>,
    cleared_rx: Receiver<()>,
    pending: Mutex<Option<Sender<bool>>>,
    in_flight: AtomicBool,
    enqueue_timeout: Duration,
}

impl CommandPipeline {
    pub fn new(capacity: usize, enqueue_timeout: Duration) -> Self {
        let (queue_tx, queue_rx) = channel::bounded(capacity);
        let (cleared_tx, cleared_rx) = channel::bounded(1);
        Self {
            queue_tx,
            queue_rx,
            cleared_tx,
            cleared_rx,
            pending: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            enqueue_timeout,
        }
    }

    pub fn enqueue(&self, frame: Vec<u8>) -> Result<(), ReaderError> {
        self.push(QueuedCommand {
            frame,
            completion: None,
        })
    }

    /// Enqueue a command whose outcome is reported by the next command-end
    pub fn enqueue_with_completion(&self, frame: Vec<u8>) -> Result<CommandCompletion, ReaderError> {
        let (tx, rx) = channel::bounded(1);
        self.push(QueuedCommand {
            frame,
            completion: Some(tx),
        })?;
        Ok(CommandCompletion { rx })
    }

    fn push(&self, command: QueuedCommand) -> Result<(), ReaderError> {
        self.queue_tx
            .send_timeout(command, self.enqueue_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ReaderError::QueueFull,
                SendTimeoutError::Disconnected(_) => ReaderError::QueueClosed,
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }

    /// The in-flight command was acknowledged; let the next one go
    pub fn command_cleared(&self) {
        self.in_flight.store(false, Ordering::Release);
        // A full slot already carries the same signal
        let _ = self.cleared_tx.try_send(());
    }

    /// A command-end packet arrived
    pub fn command_ended(&self, success: bool) {
        self.command_cleared();
        if let Some(completion) = self.pending.lock().take() {
            debug!("Resolving command completion: success={}", success);
            let _ = completion.send(success);
        }
    }

    /// Discard everything still queued (link lost)
    pub fn clear_queue(&self) {
        let mut dropped = 0;
        while let Ok(command) = self.queue_rx.try_recv() {
            if let Some(completion) = command.completion {
                let _ = completion.send(false);
            }
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {} queued RFID commands", dropped);
        }
    }

    /// Worker loop. Runs until `shutdown` is raised; `on_idle` is called
    /// whenever a poll interval passes with nothing queued.
    pub fn run<T, F>(
        &self,
        transport: &T,
        link_ready: &AtomicBool,
        shutdown: &AtomicBool,
        timing: PipelineTiming,
        mut on_idle: F,
    ) where
        T: BleTransport,
        F: FnMut(),
    {
        while !shutdown.load(Ordering::Acquire) {
            match self.queue_rx.recv_timeout(timing.poll_interval) {
                Ok(command) => self.dispatch(command, transport, link_ready, shutdown, timing),
                Err(RecvTimeoutError::Timeout) => on_idle(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Command pipeline stopped");
    }

    fn dispatch<T: BleTransport>(
        &self,
        command: QueuedCommand,
        transport: &T,
        link_ready: &AtomicBool,
        shutdown: &AtomicBool,
        timing: PipelineTiming,
    ) {
        // Acks that arrived for a previous, already timed out command
        while self.cleared_rx.try_recv().is_ok() {}

        if !link_ready.load(Ordering::Acquire) {
            debug!("Link not ready; dropping RFID command");
            if let Some(completion) = command.completion {
                let _ = completion.send(false);
            }
            return;
        }

        self.in_flight.store(true, Ordering::Release);
        let attached = command.completion.is_some();
        if let Some(completion) = command.completion {
            if self.pending.lock().replace(completion).is_some() {
                warn!("Replacing an unresolved command completion");
            }
        }

        trace!("Sending RFID command {:02X?}", command.frame);
        if let Err(e) = transport.send_down(&command.frame, WriteMode::WithResponse) {
            error!("Failed to send RFID command: {:?}", e);
            self.in_flight.store(false, Ordering::Release);
            if attached {
                self.fail_pending();
            }
            return;
        }

        let deadline = Instant::now() + timing.command_timeout;
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let wake = deadline.min(Instant::now() + timing.poll_interval);
            match self.cleared_rx.recv_deadline(wake) {
                Ok(()) => return,
                Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                    warn!(
                        "RFID command not acknowledged within {:?}; moving on",
                        timing.command_timeout
                    );
                    self.in_flight.store(false, Ordering::Release);
                    if attached {
                        self.fail_pending();
                    }
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Resolve the pending completion, if any, as failed
    pub(crate) fn fail_pending(&self) {
        if let Some(completion) = self.pending.lock().take() {
            let _ = completion.send(false);
        }
    }
}
