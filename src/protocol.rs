//! Wire protocol between the main process and the worker process.
//!
//! The message set is a closed discriminated union: every task kind and its
//! priority is known statically, which lets the worker queue size its
//! priority buckets at construction instead of discovering message classes at
//! runtime. Payloads are serialized as JSON inside length-prefixed frames
//! (see [`crate::ipc`]).
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a single submission. Monotonically increasing and never
/// reused within one main-process lifetime.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next process-unique task id.
pub fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Discriminator for a task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// RSS/Atom feed parsing.
    FeedParse,
    /// Audio tag and cover art extraction.
    TagExtract,
    /// Media metadata probing. Main-thread-only inside the worker.
    MediaProbe,
    /// Bulk cancellation of queued path-keyed tasks.
    CancelPaths,
}

impl TaskKind {
    /// The closed set of kinds. The queue iterates this to build one FIFO per
    /// `(priority, kind)` pair.
    pub const ALL: [TaskKind; 4] = [
        TaskKind::FeedParse,
        TaskKind::TagExtract,
        TaskKind::MediaProbe,
        TaskKind::CancelPaths,
    ];

    /// Scheduling priority. Higher values are served first.
    pub fn priority(self) -> u8 {
        match self {
            TaskKind::FeedParse => 20,
            TaskKind::TagExtract | TaskKind::MediaProbe => 10,
            TaskKind::CancelPaths => 0,
        }
    }

    /// Whether this kind carries a `source_path` usable as a cancellation
    /// key.
    pub fn cancellable_by_path(self) -> bool {
        matches!(self, TaskKind::TagExtract | TaskKind::MediaProbe)
    }

    /// Whether this kind may only execute on the worker process's main
    /// thread. The queue never hands such a task to a pool thread.
    pub fn main_thread_only(self) -> bool {
        matches!(self, TaskKind::MediaProbe)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::FeedParse => "feed-parse",
            TaskKind::TagExtract => "tag-extract",
            TaskKind::MediaProbe => "media-probe",
            TaskKind::CancelPaths => "cancel-paths",
        };
        f.write_str(name)
    }
}

/// A unit of work submitted by the main process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPayload {
    /// Parse downloaded feed bytes into a structured feed.
    FeedParse {
        /// Raw feed document, in whatever encoding the server sent.
        html: Vec<u8>,
    },
    /// Read audio tags from `source_path`, writing any embedded cover art
    /// into `cover_art_dir`.
    TagExtract {
        source_path: PathBuf,
        cover_art_dir: PathBuf,
    },
    /// Probe `source_path` for duration and stream layout. The probing
    /// library is not thread-safe, so this kind only ever runs on the worker
    /// process's main thread.
    MediaProbe {
        source_path: PathBuf,
        screenshot_dir: PathBuf,
    },
    /// Drop all queued `TagExtract`/`MediaProbe` tasks whose `source_path`
    /// is in `paths`. In-flight tasks are not interrupted.
    CancelPaths { paths: BTreeSet<PathBuf> },
}

impl TaskPayload {
    /// The discriminator for this payload.
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::FeedParse { .. } => TaskKind::FeedParse,
            TaskPayload::TagExtract { .. } => TaskKind::TagExtract,
            TaskPayload::MediaProbe { .. } => TaskKind::MediaProbe,
            TaskPayload::CancelPaths { .. } => TaskKind::CancelPaths,
        }
    }

    /// Scheduling priority, delegated to the kind.
    pub fn priority(&self) -> u8 {
        self.kind().priority()
    }

    /// The cancellation key, for the kinds that carry one.
    pub fn source_path(&self) -> Option<&Path> {
        match self {
            TaskPayload::TagExtract { source_path, .. }
            | TaskPayload::MediaProbe { source_path, .. } => Some(source_path),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPayload::FeedParse { html } => write!(f, "feed-parse ({} bytes)", html.len()),
            TaskPayload::TagExtract { source_path, .. } => {
                write!(f, "tag-extract (path: {})", source_path.display())
            }
            TaskPayload::MediaProbe { source_path, .. } => {
                write!(f, "media-probe (path: {})", source_path.display())
            }
            TaskPayload::CancelPaths { paths } => {
                write!(f, "cancel-paths ({} paths)", paths.len())
            }
        }
    }
}

/// Messages sent from the main process to the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToWorker {
    /// First message after connecting: spawn this many worker threads and
    /// answer with [`FromWorker::Ready`].
    Startup { thread_count: usize },
    /// A task to schedule.
    Task { id: TaskId, payload: TaskPayload },
    /// Orderly teardown: stop pulling work and exit cleanly.
    Shutdown,
}

/// Messages sent from the worker process to the main process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FromWorker {
    /// Worker threads are up; the supervisor may replay pending tasks.
    Ready,
    /// Outcome of one task.
    TaskReply { id: TaskId, outcome: TaskOutcome },
    /// Emitted with `Some(id)` just before a media probe runs on the main
    /// thread and with `None` right after its reply, so the supervisor can
    /// tell which probe (if any) is currently executing.
    StatusPing { probing: Option<TaskId> },
}

/// Outcome of a task: a kind-specific value or a portable failure.
pub type TaskOutcome = Result<TaskValue, TaskFailure>;

/// Successful task values, one variant per task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskValue {
    /// Result of [`TaskPayload::FeedParse`].
    Feed(ParsedFeed),
    /// Result of [`TaskPayload::TagExtract`].
    Tags(TagBundle),
    /// Result of [`TaskPayload::MediaProbe`].
    Probe(ProbeReport),
    /// Result of [`TaskPayload::CancelPaths`]: how many queued tasks were
    /// dropped. Callers usually ignore this reply.
    Cancelled { removed: usize },
}

/// A parsed feed: channel title plus entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<FeedEntry>,
}

/// One item or entry of a feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub title: Option<String>,
    /// Enclosure or link URL, already validated.
    pub url: Option<String>,
}

/// Tags read from an audio file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagBundle {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<f64>,
    /// Where embedded cover art was written, if any was found.
    pub cover_art: Option<PathBuf>,
}

/// Metadata probed from a media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub duration_secs: Option<f64>,
    pub track_count: usize,
    pub sample_rate: Option<u32>,
    /// Where a representative frame was written, if the prober produced one.
    pub screenshot: Option<PathBuf>,
}

/// How a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The handler returned an error or panicked.
    Handler,
    /// The handler exceeded its in-worker wall-clock deadline. A
    /// handler-side failure, distinguished so clients can tell slow files
    /// from broken ones.
    Deadline,
    /// Supervisor-synthesized: the worker stopped responding while this task
    /// was executing and was restarted.
    Timeout,
}

/// Portable failure form carried in replies. Arbitrary handler errors are
/// flattened to this before they cross the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Rendered error chain, for logs and bug reports.
    pub trace: String,
}

impl TaskFailure {
    /// Build a failure from a handler error, keeping its rendered chain.
    pub fn handler(err: &anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Handler,
            message: err.to_string(),
            trace: format!("{:?}", err),
        }
    }

    /// Build a deadline-expiry failure.
    pub fn deadline(limit: std::time::Duration) -> Self {
        Self {
            kind: FailureKind::Deadline,
            message: format!("handler exceeded {:?} deadline", limit),
            trace: String::new(),
        }
    }

    /// Build a supervisor-synthesized timeout failure.
    pub fn timeout(elapsed: std::time::Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("worker did not respond for {:?}; restarted", elapsed),
            trace: String::new(),
        }
    }
}
