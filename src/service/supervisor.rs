//! Supervision of the worker process.
//!
//! One tokio task owns everything: the registry, the child process, the
//! write half of the channel, the probe cursor, and the link state machine
//! (*Stopped → Starting → Running*, back through *Stopped* on every
//! restart). Inbound frames are pumped into a single-consumer event channel
//! tagged with a connection epoch, so a reader that outlives its connection
//! cannot confuse the current one.
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::config::WorkerConfig;
use crate::error::{MedleyError, MedleyResult};
use crate::ipc;
use crate::protocol::{FromWorker, TaskFailure, TaskId, TaskOutcome, TaskPayload, ToWorker};
use crate::service::launcher::{WorkerChild, WorkerLauncher};
use crate::service::registry::TaskRegistry;

/// Requests from [`crate::service::WorkerService`] handles.
pub(crate) enum Command {
    Submit {
        id: TaskId,
        payload: TaskPayload,
        reply: oneshot::Sender<TaskOutcome>,
    },
    Restart,
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

enum WorkerEvent {
    Inbound(FromWorker),
    ChannelClosed(Option<String>),
    RetryLaunch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Stopped,
    Starting,
    Running,
}

/// Which probe the worker is executing right now, per its status pings.
struct ProbeCursor {
    task_id: TaskId,
    started_at: Instant,
}

enum Turn {
    Command(Option<Command>),
    Event(u64, WorkerEvent),
    HangCheck,
}

pub(crate) struct Supervisor {
    config: WorkerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    registry: TaskRegistry,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<(u64, WorkerEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, WorkerEvent)>,
    writer: Option<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    child: Option<Box<dyn WorkerChild>>,
    /// Bumped on every launch; events carrying an older epoch are stale.
    epoch: u64,
    state: LinkState,
    probe_cursor: Option<ProbeCursor>,
}

impl Supervisor {
    pub(crate) fn new(
        config: WorkerConfig,
        launcher: Arc<dyn WorkerLauncher>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            launcher,
            registry: TaskRegistry::new(),
            commands,
            events_tx,
            events_rx,
            writer: None,
            child: None,
            epoch: 0,
            state: LinkState::Stopped,
            probe_cursor: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut hang_timer = tokio::time::interval(self.config.hang_check_interval);
        hang_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.start_worker().await;
        loop {
            let turn = tokio::select! {
                cmd = self.commands.recv() => Turn::Command(cmd),
                Some((epoch, event)) = self.events_rx.recv() => Turn::Event(epoch, event),
                _ = hang_timer.tick() => Turn::HangCheck,
            };
            match turn {
                Turn::Command(Some(Command::Submit { id, payload, reply })) => {
                    self.submit(id, payload, reply).await;
                }
                Turn::Command(Some(Command::Restart)) => {
                    self.restart_worker("explicit restart requested").await;
                }
                Turn::Command(Some(Command::Shutdown { ack })) => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    return;
                }
                // Every service handle is gone; tear down silently.
                Turn::Command(None) => {
                    self.shutdown().await;
                    return;
                }
                Turn::Event(epoch, event) => self.handle_event(epoch, event).await,
                Turn::HangCheck => self.check_hang().await,
            }
        }
    }

    /// Record a submission; forward it immediately when the worker is up.
    /// Otherwise it rides along with the replay on the next `Ready`.
    async fn submit(
        &mut self,
        id: TaskId,
        payload: TaskPayload,
        reply: oneshot::Sender<TaskOutcome>,
    ) {
        self.registry.insert(id, payload.clone(), reply);
        if self.state == LinkState::Running {
            if let Err(e) = self.send(&ToWorker::Task { id, payload }).await {
                log::warn!("task send failed: {}", e);
                self.restart_worker("channel write failed").await;
            }
        }
    }

    async fn handle_event(&mut self, epoch: u64, event: WorkerEvent) {
        if epoch != self.epoch {
            return;
        }
        match event {
            WorkerEvent::Inbound(FromWorker::Ready) => {
                log::info!(
                    "worker ready; replaying {} pending tasks",
                    self.registry.len()
                );
                self.state = LinkState::Running;
                self.replay_pending().await;
            }
            WorkerEvent::Inbound(FromWorker::TaskReply { id, outcome }) => {
                if !self.registry.complete(id, outcome) {
                    log::debug!("dropping stale reply for task {}", id);
                }
            }
            WorkerEvent::Inbound(FromWorker::StatusPing { probing }) => {
                self.probe_cursor = probing.map(|task_id| ProbeCursor {
                    task_id,
                    started_at: Instant::now(),
                });
            }
            WorkerEvent::ChannelClosed(reason) => {
                log::warn!(
                    "worker channel closed ({})",
                    reason.as_deref().unwrap_or("eof")
                );
                if let Some(child) = &mut self.child {
                    // Exit status is informational; don't stall on a process
                    // that closed its socket but lingers.
                    let grace = std::time::Duration::from_millis(100);
                    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                        log::info!("worker exit status: {:?}", status);
                    }
                }
                self.restart_worker("worker channel lost").await;
            }
            WorkerEvent::RetryLaunch => {
                if self.state == LinkState::Stopped {
                    self.start_worker().await;
                }
            }
        }
    }

    /// Re-send every registry entry to a freshly started worker.
    async fn replay_pending(&mut self) {
        for (id, payload) in self.registry.pending_requests() {
            if let Err(e) = self.send(&ToWorker::Task { id, payload }).await {
                log::warn!("replay failed: {}", e);
                self.restart_worker("channel write failed during replay").await;
                return;
            }
        }
    }

    /// Fired by the periodic timer: if the probe the worker last announced
    /// has been running past its budget, fail it here and restart. Only
    /// probes are watchdogged; they are the only kind known to hang.
    async fn check_hang(&mut self) {
        let Some((task_id, started_at)) = self
            .probe_cursor
            .as_ref()
            .map(|c| (c.task_id, c.started_at))
        else {
            return;
        };
        let elapsed = started_at.elapsed();
        if elapsed <= self.config.probe_timeout {
            return;
        }
        log::warn!(
            "worker is hanging on media probe task {} ({:?}); restarting",
            task_id,
            elapsed
        );
        if !self.registry.complete(task_id, Err(TaskFailure::timeout(elapsed))) {
            log::debug!("hung probe {} was already resolved", task_id);
        }
        self.restart_worker("media probe hung").await;
    }

    async fn start_worker(&mut self) {
        self.epoch += 1;
        self.state = LinkState::Starting;
        self.probe_cursor = None;

        let link = match self.launcher.launch().await {
            Ok(link) => link,
            Err(e) => {
                log::error!("worker launch failed: {}", e);
                self.state = LinkState::Stopped;
                self.schedule_retry();
                return;
            }
        };

        log::info!("worker up (pid {:?})", link.child.id());
        let (read_half, write_half) = link.stream.into_split();
        self.writer = Some(ipc::framed_writer(write_half));
        self.child = Some(link.child);
        tokio::spawn(pump_events(read_half, self.epoch, self.events_tx.clone()));

        let startup = ToWorker::Startup {
            thread_count: self.config.thread_count,
        };
        if let Err(e) = self.send(&startup).await {
            log::warn!("failed to send startup message: {}", e);
            self.drop_link().await;
            self.schedule_retry();
        }
    }

    async fn restart_worker(&mut self, reason: &str) {
        log::warn!("restarting worker: {}", reason);
        self.drop_link().await;
        self.start_worker().await;
    }

    async fn drop_link(&mut self) {
        self.writer = None;
        self.probe_cursor = None;
        self.state = LinkState::Stopped;
        if let Some(mut child) = self.child.take() {
            child.kill().await;
        }
    }

    fn schedule_retry(&self) {
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        let backoff = self.config.restart_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.send((epoch, WorkerEvent::RetryLaunch));
        });
    }

    /// Orderly teardown: ask the worker to exit, give it a moment, reap or
    /// kill, and clear the registry. Awaiting handles observe the closed
    /// reply channels.
    async fn shutdown(&mut self) {
        log::info!("shutting down worker service");
        if self.state != LinkState::Stopped {
            let _ = self.send(&ToWorker::Shutdown).await;
        }
        self.writer = None;
        self.probe_cursor = None;
        if let Some(mut child) = self.child.take() {
            let grace = self.config.shutdown_grace;
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                log::warn!("worker did not exit within {:?}; killing", grace);
                child.kill().await;
            }
        }
        self.state = LinkState::Stopped;
        self.registry.reset();
    }

    async fn send(&mut self, msg: &ToWorker) -> MedleyResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| MedleyError::protocol("worker channel is down"))?;
        writer.send(ipc::encode(msg)?).await?;
        Ok(())
    }
}

/// Per-connection reader: decodes frames into events until the channel ends,
/// then reports the closure. The epoch tag lets the supervisor ignore a
/// pump that belongs to a connection it already abandoned.
async fn pump_events(
    read_half: OwnedReadHalf,
    epoch: u64,
    events: mpsc::UnboundedSender<(u64, WorkerEvent)>,
) {
    let mut frames = ipc::framed_reader(read_half);
    loop {
        match frames.next().await {
            Some(Ok(frame)) => match ipc::decode::<FromWorker>(&frame) {
                Ok(msg) => {
                    if events.send((epoch, WorkerEvent::Inbound(msg))).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events.send((epoch, WorkerEvent::ChannelClosed(Some(e.to_string()))));
                    return;
                }
            },
            Some(Err(e)) => {
                let _ = events.send((epoch, WorkerEvent::ChannelClosed(Some(e.to_string()))));
                return;
            }
            None => {
                let _ = events.send((epoch, WorkerEvent::ChannelClosed(None)));
                return;
            }
        }
    }
}
