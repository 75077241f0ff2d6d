//! Worker subsystem configuration.
use crate::error::MedleyError;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the worker process and its supervisor.
///
/// The defaults match production behavior: three worker threads, a 90 second
/// hang check around media probes, and a 10 second allowance for the spawned
/// process to connect back. Tests shrink the timers through the `with_*`
/// builders.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads spawned inside the worker process.
    pub thread_count: usize,
    /// How often the supervisor inspects the probe cursor.
    pub hang_check_interval: Duration,
    /// Wall-clock budget for a single media probe before the worker is
    /// declared hung and restarted.
    pub probe_timeout: Duration,
    /// How long to wait for a freshly spawned worker to connect back.
    pub spawn_timeout: Duration,
    /// Delay before retrying a failed worker launch.
    pub restart_backoff: Duration,
    /// Grace period for the worker to exit on orderly shutdown before it is
    /// killed.
    pub shutdown_grace: Duration,
    /// Worker binary to spawn. `None` resolves to `medley-workerd` next to
    /// the current executable.
    pub worker_program: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_count: 3,
            hang_check_interval: Duration::from_secs(90),
            probe_timeout: Duration::from_secs(90),
            spawn_timeout: Duration::from_secs(10),
            restart_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            worker_program: None,
        }
    }
}

impl WorkerConfig {
    /// Construct a configuration sized to the host: one worker thread per
    /// core, clamped to a sane range for a desktop application.
    pub fn scaled_to_cpus() -> Self {
        Self {
            thread_count: num_cpus::get().clamp(2, 8),
            ..Self::default()
        }
    }

    /// Set the worker thread count.
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Set both the hang check interval and the probe timeout.
    pub fn with_probe_timeout(mut self, interval: Duration, timeout: Duration) -> Self {
        self.hang_check_interval = interval;
        self.probe_timeout = timeout;
        self
    }

    /// Set the spawn timeout.
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Set the worker binary path.
    pub fn with_worker_program(mut self, program: PathBuf) -> Self {
        self.worker_program = Some(program);
        self
    }

    /// Validate configuration values for correctness.
    pub fn validate(&self) -> Result<(), MedleyError> {
        if self.thread_count == 0 {
            return Err(MedleyError::config(
                "worker thread count (thread_count) must be greater than 0",
            ));
        }
        if self.hang_check_interval.is_zero() {
            return Err(MedleyError::config(
                "hang check interval (hang_check_interval) must be non-zero",
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(MedleyError::config(
                "probe timeout (probe_timeout) must be non-zero",
            ));
        }
        if self.spawn_timeout.is_zero() {
            return Err(MedleyError::config(
                "spawn timeout (spawn_timeout) must be non-zero",
            ));
        }
        Ok(())
    }
}
