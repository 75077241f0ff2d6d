//! Shared helpers: a scripted in-process stand-in for the worker process.
//!
//! Each script plays one lifetime of the worker over a real socket pair, so
//! supervisor tests exercise the actual framing, replay, and restart logic
//! without spawning OS processes.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use medley_worker::config::WorkerConfig;
use medley_worker::error::{MedleyError, MedleyResult};
use medley_worker::ipc;
use medley_worker::protocol::{
    FromWorker, ParsedFeed, ProbeReport, TagBundle, TaskId, TaskPayload, TaskValue, ToWorker,
};
use medley_worker::service::{WorkerChild, WorkerLauncher, WorkerLink, WorkerService};

/// One worker lifetime, as a closure over its end of the channel.
pub type Script = Box<dyn FnOnce(PeerLink) -> BoxFuture<'static, ()> + Send>;

/// Wrap an async closure as a [`Script`].
#[allow(dead_code)]
pub fn script<F, Fut>(f: F) -> Script
where
    F: FnOnce(PeerLink) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Box::new(move |peer| Box::pin(f(peer)))
}

/// Launcher that hands out one script per (re)start, in order.
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedLauncher {
    #[allow(dead_code)]
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&self) -> MedleyResult<WorkerLink> {
        let next = self.scripts.lock().unwrap().pop_front();
        let play = next.ok_or_else(|| MedleyError::spawn("no scripted worker left"))?;
        let (ours, theirs) = UnixStream::pair()?;
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            play(PeerLink::new(theirs)).await;
            let _ = exit_tx.send(0);
        });
        Ok(WorkerLink {
            stream: ours,
            child: Box::new(ScriptedChild {
                exit: Some(exit_rx),
            }),
        })
    }
}

struct ScriptedChild {
    exit: Option<oneshot::Receiver<i32>>,
}

#[async_trait]
impl WorkerChild for ScriptedChild {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.exit.take() {
            Some(exit) => exit.await.ok(),
            None => Some(0),
        }
    }

    // Nothing to signal: the supervisor dropping its stream halves ends the
    // script's read loop.
    async fn kill(&mut self) {
        self.exit = None;
    }
}

/// The scripted worker's end of the channel.
pub struct PeerLink {
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

impl PeerLink {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: ipc::framed_reader(read_half),
            writer: ipc::framed_writer(write_half),
        }
    }

    #[allow(dead_code)]
    pub async fn recv(&mut self) -> Option<ToWorker> {
        match self.reader.next().await {
            Some(Ok(frame)) => ipc::decode(&frame).ok(),
            _ => None,
        }
    }

    #[allow(dead_code)]
    pub async fn send(&mut self, msg: &FromWorker) {
        let _ = self.writer.send(ipc::encode(msg).unwrap()).await;
    }

    /// Consume the `Startup` message and answer `Ready`.
    #[allow(dead_code)]
    pub async fn handshake(&mut self) -> usize {
        match self.recv().await {
            Some(ToWorker::Startup { thread_count }) => {
                self.send(&FromWorker::Ready).await;
                thread_count
            }
            other => panic!("expected startup, got {:?}", other),
        }
    }

    /// Next task, or `None` on shutdown or channel close.
    #[allow(dead_code)]
    pub async fn next_task(&mut self) -> Option<(TaskId, TaskPayload)> {
        loop {
            match self.recv().await {
                Some(ToWorker::Task { id, payload }) => return Some((id, payload)),
                Some(ToWorker::Startup { .. }) => continue,
                Some(ToWorker::Shutdown) | None => return None,
            }
        }
    }

    /// Reply success with a value of the right shape for the payload.
    #[allow(dead_code)]
    pub async fn reply_ok(&mut self, id: TaskId, payload: &TaskPayload) {
        self.send(&FromWorker::TaskReply {
            id,
            outcome: Ok(stub_value(payload)),
        })
        .await;
    }
}

/// A plausible success value for each payload kind.
#[allow(dead_code)]
pub fn stub_value(payload: &TaskPayload) -> TaskValue {
    match payload {
        TaskPayload::FeedParse { .. } => TaskValue::Feed(ParsedFeed::default()),
        TaskPayload::TagExtract { .. } => TaskValue::Tags(TagBundle::default()),
        TaskPayload::MediaProbe { .. } => TaskValue::Probe(ProbeReport::default()),
        TaskPayload::CancelPaths { .. } => TaskValue::Cancelled { removed: 0 },
    }
}

/// Configuration with timers shrunk for tests.
#[allow(dead_code)]
pub fn fast_config() -> WorkerConfig {
    let mut config = WorkerConfig::default()
        .with_thread_count(1)
        .with_probe_timeout(Duration::from_millis(50), Duration::from_millis(100));
    config.restart_backoff = Duration::from_millis(20);
    config.shutdown_grace = Duration::from_millis(200);
    config
}

/// Start a service driven by the given scripts.
#[allow(dead_code)]
pub fn scripted_service(config: WorkerConfig, scripts: Vec<Script>) -> WorkerService {
    WorkerService::start_with_launcher(config, ScriptedLauncher::new(scripts)).unwrap()
}

/// A feed-parse payload for tests that only care about routing.
#[allow(dead_code)]
pub fn feed_payload(marker: &str) -> TaskPayload {
    TaskPayload::FeedParse {
        html: marker.as_bytes().to_vec(),
    }
}
