//! Single-worker job queue
//!
//! Every structural decision of the engine runs on one dedicated thread,
//! fed through an unbounded FIFO channel. Producers never block on
//! enqueue. The worker survives failing and panicking jobs: both are logged
//! and counted, and the next job runs normally.
//!
//! ## Waiting for the worker
//!
//! [`WorkQueue::flush`] waits for everything enqueued before the call, plus
//! anything those jobs enqueued in turn. Called from the worker itself it
//! returns immediately, since the worker cannot wait on its own backlog.

use crate::errors::QueueError;
use parking_lot::Mutex;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};

enum Message<J> {
    Job(J),
    Barrier(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    /// Jobs enqueued but not yet finished
    pub pending: usize,
    /// Jobs finished, successfully or not
    pub processed: u64,
    /// Jobs that returned an error or panicked
    pub failed: u64,
}

/// FIFO queue drained by one named worker thread
pub struct WorkQueue<J: Send + 'static> {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Message<J>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Arc<OnceLock<ThreadId>>,
    counters: Arc<Counters>,
}

impl<J: Send + 'static> WorkQueue<J> {
    /// Spawn the worker thread
    pub fn start<E, F>(name: impl Into<String>, mut handler: F) -> Result<Self, QueueError>
    where
        E: Display,
        F: FnMut(J) -> Result<(), E> + Send + 'static,
    {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message<J>>();
        let counters = Arc::new(Counters::default());
        let worker_id = Arc::new(OnceLock::new());

        let thread_counters = counters.clone();
        let thread_id = worker_id.clone();
        let thread_name = name.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _ = thread_id.set(thread::current().id());
                tracing::debug!(worker = %thread_name, "work queue started");
                while let Some(message) = receiver.blocking_recv() {
                    match message {
                        Message::Barrier(done) => {
                            let _ = done.send(());
                        }
                        Message::Job(job) => {
                            let outcome = catch_unwind(AssertUnwindSafe(|| handler(job)));
                            match outcome {
                                Ok(Ok(())) => {}
                                Ok(Err(error)) => {
                                    thread_counters.failed.fetch_add(1, Ordering::Relaxed);
                                    tracing::error!(worker = %thread_name, %error, "job failed");
                                }
                                Err(payload) => {
                                    thread_counters.failed.fetch_add(1, Ordering::Relaxed);
                                    let error = crate::errors::HookError::from_panic(payload.as_ref());
                                    tracing::error!(worker = %thread_name, %error, "job panicked");
                                }
                            }
                            thread_counters.processed.fetch_add(1, Ordering::Relaxed);
                            thread_counters.pending.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                }
                tracing::debug!(worker = %thread_name, "work queue drained");
            })
            .map_err(|e| QueueError::Spawn(e.to_string()))?;

        // The id is also recorded by the thread itself; whichever lands
        // first wins and both are the same value.
        let _ = worker_id.set(worker.thread().id());

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_id,
            counters,
        })
    }

    /// Worker thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a job without blocking
    pub fn enqueue(&self, job: J) -> Result<(), QueueError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(QueueError::Closed)?;
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(Message::Job(job)).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Whether the calling thread is the worker
    pub fn is_worker_thread(&self) -> bool {
        self.worker_id.get() == Some(&thread::current().id())
    }

    /// Whether the queue still accepts jobs
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Block until the queue has no pending work
    ///
    /// Must not be called from inside an async runtime.
    pub fn flush(&self) -> Result<(), QueueError> {
        if self.is_worker_thread() {
            return Ok(());
        }
        loop {
            let (done, wait) = oneshot::channel();
            {
                let sender = self.sender.lock();
                let Some(sender) = sender.as_ref() else {
                    // Closed queues are drained by `close`
                    return Ok(());
                };
                sender
                    .send(Message::Barrier(done))
                    .map_err(|_| QueueError::Closed)?;
            }
            wait.blocking_recv().map_err(|_| QueueError::Closed)?;
            if self.counters.pending.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
        }
    }

    /// Stop accepting jobs, drain what is queued and join the worker
    ///
    /// Called on the worker thread this only stops intake; the worker exits
    /// once the current job returns and the backlog is drained.
    pub fn close(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        if self.is_worker_thread() {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!(worker = %self.name, "work queue thread panicked");
            }
        }
        tracing::debug!(worker = %self.name, "work queue closed");
    }

    /// Current statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.counters.pending.load(Ordering::Acquire),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl<J: Send + 'static> Drop for WorkQueue<J> {
    fn drop(&mut self) {
        self.close();
    }
}
