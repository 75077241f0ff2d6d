//! Spawning the worker process and connecting its channel.
//!
//! The supervisor binds a transient Unix socket, spawns `medley-workerd`
//! pointed at it, and waits (bounded) for the worker to connect back. The
//! [`WorkerLauncher`] trait is the seam the tests use to stand in a scripted
//! in-process peer for the real child process.
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};

use crate::config::WorkerConfig;
use crate::error::{MedleyError, MedleyResult};

/// Produces a connected worker on demand. Called once at startup and again
/// on every restart.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> MedleyResult<WorkerLink>;
}

/// A live worker: its channel plus a handle on its lifetime.
pub struct WorkerLink {
    pub stream: UnixStream,
    pub child: Box<dyn WorkerChild>,
}

/// Lifetime control over whatever is on the other end of the link.
#[async_trait]
pub trait WorkerChild: Send {
    /// Process id, when the worker is a real OS process.
    fn id(&self) -> Option<u32>;
    /// Wait for exit. The code is informational only.
    async fn wait(&mut self) -> Option<i32>;
    /// Force-terminate, best effort.
    async fn kill(&mut self);
}

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

/// A socket path no other worker of this process is using.
fn transient_socket_path() -> PathBuf {
    let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "medley-worker-{}-{}.sock",
        std::process::id(),
        seq
    ))
}

/// Spawns the real `medley-workerd` binary.
pub struct ProcessLauncher {
    program: PathBuf,
    spawn_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, spawn_timeout: Duration) -> Self {
        Self {
            program,
            spawn_timeout,
        }
    }

    /// Resolve the worker binary from the configuration, defaulting to
    /// `medley-workerd` beside the current executable.
    pub fn from_config(config: &WorkerConfig) -> MedleyResult<Self> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => {
                let exe = std::env::current_exe()?;
                let dir = exe.parent().ok_or_else(|| {
                    MedleyError::spawn("cannot locate the current executable's directory")
                })?;
                dir.join("medley-workerd")
            }
        };
        Ok(Self::new(program, config.spawn_timeout))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> MedleyResult<WorkerLink> {
        let socket_path = transient_socket_path();
        let listener = UnixListener::bind(&socket_path)?;

        let spawned = Command::new(&self.program)
            .arg("--socket-path")
            .arg(&socket_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&socket_path);
                return Err(MedleyError::spawn(format!(
                    "cannot spawn {}: {}",
                    self.program.display(),
                    e
                )));
            }
        };

        let accepted = tokio::time::timeout(self.spawn_timeout, listener.accept()).await;
        // The rendezvous is done (or failed); the path is no longer needed.
        let _ = std::fs::remove_file(&socket_path);

        match accepted {
            Ok(Ok((stream, _addr))) => Ok(WorkerLink {
                stream,
                child: Box::new(ProcessChild { child }),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(MedleyError::spawn(format!(
                "worker did not connect within {:?}",
                self.spawn_timeout
            ))),
        }
    }
}

struct ProcessChild {
    child: Child,
}

#[async_trait]
impl WorkerChild for ProcessChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}
