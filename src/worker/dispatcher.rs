//! Message dispatch inside the worker process.
//!
//! The dispatcher owns the process's main thread: it reads the inbound
//! channel, files tasks into the shared [`TaskQueue`], and spawns the worker
//! threads announced by `Startup`. Media probes ride the same queue and
//! round-robin cursor as everything else, but only ever execute here, each
//! bracketed by status pings so the supervisor can spot a hung probe from
//! outside the process.
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::error::MedleyResult;
use crate::ipc::{ReplySender, WorkerConnection};
use crate::protocol::{FromWorker, TaskFailure, TaskKind, TaskPayload, TaskValue, ToWorker};
use crate::worker::handlers::TaskHandlers;
use crate::worker::queue::{QueuedTask, TaskQueue};

/// Default wall-clock budget for one tag extraction.
pub const DEFAULT_TAG_DEADLINE: Duration = Duration::from_secs(2);

/// Knobs local to the worker process.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Budget for a single tag extraction before it is failed with a
    /// deadline marker. Tag readers chew on malformed files for a long time;
    /// the library caps them instead of letting one bad file stall a worker
    /// thread.
    pub tag_deadline: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            tag_deadline: DEFAULT_TAG_DEADLINE,
        }
    }
}

/// The worker process's main loop: channel reader, task router, and service
/// thread for main-thread-only jobs.
pub struct Dispatcher {
    conn: WorkerConnection,
    replies: ReplySender,
    queue: Arc<TaskQueue>,
    handlers: Arc<dyn TaskHandlers>,
    options: DispatcherOptions,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Wrap a connected channel. Worker threads are spawned later, when the
    /// `Startup` message announces how many.
    pub fn new(
        conn: WorkerConnection,
        handlers: Arc<dyn TaskHandlers>,
        options: DispatcherOptions,
    ) -> Self {
        let replies = conn.reply_sender();
        Self {
            conn,
            replies,
            queue: Arc::new(TaskQueue::new()),
            handlers,
            options,
            threads: Vec::new(),
        }
    }

    /// Run until the main process orders a shutdown or closes the channel.
    /// Must be called on the process's main thread.
    pub fn run(mut self) -> MedleyResult<()> {
        let result = self.serve();
        self.queue.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        result
    }

    fn serve(&mut self) -> MedleyResult<()> {
        loop {
            self.service_main_thread()?;
            match self.conn.recv() {
                Ok(Some(msg)) => {
                    if !self.dispatch(msg)? {
                        log::info!("worker received shutdown");
                        return Ok(());
                    }
                }
                Ok(None) => {
                    log::info!("channel closed; worker shutting down");
                    return Ok(());
                }
                // A frame that cannot be decoded terminates the channel.
                Err(e) => return Err(e),
            }
        }
    }

    /// Classify one inbound message. Returns `false` on orderly shutdown.
    fn dispatch(&mut self, msg: ToWorker) -> MedleyResult<bool> {
        match msg {
            ToWorker::Startup { thread_count } => {
                self.spawn_worker_threads(thread_count)?;
                self.replies.send(&FromWorker::Ready)?;
            }
            ToWorker::Task { id, payload } => self.route_task(QueuedTask { id, payload })?,
            ToWorker::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn route_task(&mut self, task: QueuedTask) -> MedleyResult<()> {
        match task.payload {
            // Cancellation takes effect immediately, ahead of anything queued.
            TaskPayload::CancelPaths { .. } => {
                let reply = self.cancel_paths(task);
                self.replies.send(&reply)?;
            }
            // Probes included: they share the queue's cursor, and the pool
            // threads know not to take them.
            _ => self.queue.push(task),
        }
        Ok(())
    }

    fn cancel_paths(&self, task: QueuedTask) -> FromWorker {
        let TaskPayload::CancelPaths { paths } = &task.payload else {
            return FromWorker::TaskReply {
                id: task.id,
                outcome: Ok(TaskValue::Cancelled { removed: 0 }),
            };
        };

        let removed = self
            .queue
            .filter(&[TaskKind::TagExtract, TaskKind::MediaProbe], |payload| {
                match payload.source_path() {
                    Some(path) => !paths.contains(path),
                    None => true,
                }
            });

        log::info!("cancelled {} queued tasks for {} paths", removed, paths.len());
        FromWorker::TaskReply {
            id: task.id,
            outcome: Ok(TaskValue::Cancelled { removed }),
        }
    }

    /// Run every queued main-thread task, each at its cursor turn, between
    /// channel reads. Waiting here while the cursor has pool work ahead is
    /// what keeps tag/probe alternation independent of how frames happened
    /// to arrive. Each probe is bracketed by its own ping pair so the
    /// supervisor's cursor is accurate even while this loop waits.
    fn service_main_thread(&mut self) -> MedleyResult<()> {
        if self.threads.is_empty() {
            // Nothing can drain pool work ahead of a probe before startup.
            return Ok(());
        }
        while let Some(task) = self.queue.next_main_thread() {
            self.replies.send(&FromWorker::StatusPing {
                probing: Some(task.id),
            })?;
            let reply = run_task(&self.handlers, task, &self.options);
            self.replies.send(&reply)?;
            self.replies.send(&FromWorker::StatusPing { probing: None })?;
        }
        Ok(())
    }

    fn spawn_worker_threads(&mut self, thread_count: usize) -> MedleyResult<()> {
        for i in 0..thread_count {
            let queue = Arc::clone(&self.queue);
            let handlers = Arc::clone(&self.handlers);
            let replies = self.replies.clone();
            let options = self.options.clone();
            let handle = thread::Builder::new()
                .name(format!("medley-worker-{}", i))
                .spawn(move || worker_loop(queue, handlers, replies, options))?;
            self.threads.push(handle);
        }
        log::info!("spawned {} worker threads", thread_count);
        Ok(())
    }
}

/// Thread loop for the pool: pull, run, publish, until shutdown.
fn worker_loop(
    queue: Arc<TaskQueue>,
    handlers: Arc<dyn TaskHandlers>,
    replies: ReplySender,
    options: DispatcherOptions,
) {
    while let Some(task) = queue.next() {
        let reply = run_task(&handlers, task, &options);
        if replies.send(&reply).is_err() {
            log::warn!("reply channel closed; worker thread exiting");
            break;
        }
    }
}

/// Run one task to a reply. A handler error or panic becomes a failure
/// outcome; the worker process itself never dies for a bad task.
fn run_task(
    handlers: &Arc<dyn TaskHandlers>,
    task: QueuedTask,
    options: &DispatcherOptions,
) -> FromWorker {
    log::info!("starting task: {}", task.payload);
    let id = task.id;
    let outcome = match task.payload {
        TaskPayload::FeedParse { html } => {
            guarded(|| handlers.feed_parse(&html)).map(TaskValue::Feed)
        }
        TaskPayload::TagExtract {
            source_path,
            cover_art_dir,
        } => {
            let handlers = Arc::clone(handlers);
            run_with_deadline(options.tag_deadline, move || {
                handlers.tag_extract(&source_path, &cover_art_dir)
            })
            .map(TaskValue::Tags)
        }
        TaskPayload::MediaProbe {
            source_path,
            screenshot_dir,
        } => guarded(|| handlers.media_probe(&source_path, &screenshot_dir)).map(TaskValue::Probe),
        // Cancellations are handled inline by the dispatcher; one that
        // reaches an execution path had nothing left to remove.
        TaskPayload::CancelPaths { .. } => Ok(TaskValue::Cancelled { removed: 0 }),
    };
    match &outcome {
        Ok(_) => log::info!("task {} finished", id),
        Err(failure) => log::info!("task {} error: {}", id, failure.message),
    }
    FromWorker::TaskReply { id, outcome }
}

/// Invoke a handler, converting an error or a panic into the portable
/// failure form.
fn guarded<T>(job: impl FnOnce() -> anyhow::Result<T>) -> Result<T, TaskFailure> {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskFailure::handler(&err)),
        Err(panic) => Err(TaskFailure::handler(&anyhow::anyhow!(
            "handler panicked: {}",
            panic_message(&panic)
        ))),
    }
}

/// Run a handler under a wall-clock deadline. On expiry the runaway handler
/// keeps its thread, but its eventual result is discarded and the task is
/// failed with the deadline marker.
fn run_with_deadline<T: Send + 'static>(
    deadline: Duration,
    job: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> Result<T, TaskFailure> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("medley-deadline".into())
        .spawn(move || {
            let _ = tx.send(guarded(job));
        });
    let watchdog = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            return Err(TaskFailure::handler(&anyhow::anyhow!(
                "cannot spawn deadline thread: {}",
                e
            )));
        }
    };
    match rx.recv_timeout(deadline) {
        Ok(result) => {
            let _ = watchdog.join();
            result
        }
        Err(RecvTimeoutError::Timeout) => Err(TaskFailure::deadline(deadline)),
        Err(RecvTimeoutError::Disconnected) => Err(TaskFailure::handler(&anyhow::anyhow!(
            "deadline thread exited without a result"
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
