//! Main-process client API for the worker subsystem.
//!
//! [`WorkerService`] is a cheap clonable handle. Submissions return a
//! [`TaskHandle`] that resolves to exactly one outcome: the task's value, its
//! failure, or [`crate::error::MedleyError::ServiceStopped`] if the whole
//! service was shut down first. A worker crash or hang never loses a
//! submission: pending work is replayed into the replacement process.
//!
//! # Examples
//!
//! ```rust,no_run
//! use medley_worker::config::WorkerConfig;
//! use medley_worker::protocol::TaskPayload;
//! use medley_worker::service::WorkerService;
//!
//! # async fn example() -> medley_worker::Result<()> {
//! let service = WorkerService::start(WorkerConfig::default())?;
//! let handle = service.submit(TaskPayload::FeedParse {
//!     html: b"<rss>...</rss>".to_vec(),
//! })?;
//! let parsed = handle.wait().await?;
//! println!("parsed: {:?}", parsed);
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::WorkerConfig;
use crate::error::{MedleyError, MedleyResult};
use crate::protocol::{TaskId, TaskOutcome, TaskPayload, TaskValue, next_task_id};

pub mod launcher;
pub mod registry;
pub mod supervisor;

pub use launcher::{ProcessLauncher, WorkerChild, WorkerLauncher, WorkerLink};

use supervisor::{Command, Supervisor};

/// Client handle to the worker subsystem.
#[derive(Clone)]
pub struct WorkerService {
    commands: mpsc::UnboundedSender<Command>,
}

impl WorkerService {
    /// Launch the worker process and its supervisor. Must be called from
    /// within a tokio runtime.
    pub fn start(config: WorkerConfig) -> MedleyResult<Self> {
        let launcher = Arc::new(ProcessLauncher::from_config(&config)?);
        Self::start_with_launcher(config, launcher)
    }

    /// Like [`WorkerService::start`], with a caller-provided launcher. This
    /// is the seam tests use to substitute a scripted worker.
    pub fn start_with_launcher(
        config: WorkerConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> MedleyResult<Self> {
        config.validate()?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(config, launcher, commands_rx);
        tokio::spawn(supervisor.run());
        Ok(Self { commands })
    }

    /// Submit a task. The returned handle resolves once the worker (or the
    /// supervisor, for a hung probe) produces the task's single outcome.
    pub fn submit(&self, payload: TaskPayload) -> MedleyResult<TaskHandle> {
        let id = next_task_id();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit { id, payload, reply })
            .map_err(|_| MedleyError::ServiceStopped)?;
        Ok(TaskHandle { id, rx })
    }

    /// Cancel every queued tag extraction or media probe for the given
    /// paths. Running tasks finish and still deliver their replies; this
    /// only empties the queues. The cancel message's own reply is ignored.
    pub fn cancel_for_paths<I>(&self, paths: I) -> MedleyResult<()>
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
    {
        let paths: BTreeSet<PathBuf> = paths.into_iter().map(Into::into).collect();
        let _ = self.submit(TaskPayload::CancelPaths { paths })?;
        Ok(())
    }

    /// Kill and respawn the worker process. Pending tasks are replayed into
    /// the replacement.
    pub fn restart(&self) -> MedleyResult<()> {
        self.commands
            .send(Command::Restart)
            .map_err(|_| MedleyError::ServiceStopped)
    }

    /// Orderly teardown: stop scheduling, close the channel, reap the
    /// process. Outstanding handles resolve to
    /// [`MedleyError::ServiceStopped`].
    pub async fn shutdown(&self) -> MedleyResult<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { ack })
            .map_err(|_| MedleyError::ServiceStopped)?;
        done.await.map_err(|_| MedleyError::ServiceStopped)
    }
}

/// One submission's pending outcome.
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// The id assigned to this submission.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Await the task's single outcome. A task failure surfaces as
    /// [`MedleyError::Task`]; a service shutdown as
    /// [`MedleyError::ServiceStopped`].
    pub async fn wait(self) -> MedleyResult<TaskValue> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(MedleyError::Task(failure)),
            Err(_) => Err(MedleyError::ServiceStopped),
        }
    }
}
