//! Host process supervisor.
//!
//! Launches the host with piped standard streams, connects a [`Transport`]
//! to them and tracks the lifecycle:
//!
//! ```text
//! idle --start--> running --stop--> stopping --(exit | timeout+kill)--> stopped
//! ```
//!
//! A supervisor runs one process. `stopped` is final; restarting requires a
//! new [`Supervisor`]. A background monitor owns the child: when it exits
//! (naturally or killed) the monitor drains the readers, fails every
//! outstanding call with [`AppError::ProcessTerminated`] and publishes
//! `stopped`.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::client::transport::{Transport, TransportOptions};
use crate::{AppError, Result};

/// How long the monitor lets readers drain after the child exits.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not started yet.
    Idle,
    /// Child launched and connected.
    Running,
    /// Stop or kill requested, child not yet reaped.
    Stopping,
    /// Child reaped; final.
    Stopped,
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of [`Supervisor::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The child exited on its own after its input closed.
    Graceful,
    /// The grace period elapsed and the child was killed.
    Forced,
    /// Nothing was running.
    AlreadyStopped,
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

/// Launch settings.
#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    /// Options for the connected transport.
    pub transport: TransportOptions,
    /// Working directory of the child; inherits ours when absent.
    pub current_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
}

/// Owner of one host process.
#[derive(Debug)]
pub struct Supervisor {
    state: Arc<watch::Sender<ProcessState>>,
    exit: Arc<watch::Sender<Option<ExitInfo>>>,
    transport: Mutex<Option<Arc<Transport>>>,
    pid: Mutex<Option<u32>>,
    kill: CancellationToken,
    options: SupervisorOptions,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorOptions::default())
    }
}

impl Supervisor {
    /// Create an idle supervisor.
    #[must_use]
    pub fn new(options: SupervisorOptions) -> Self {
        let (state, _) = watch::channel(ProcessState::Idle);
        let (exit, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            exit: Arc::new(exit),
            transport: Mutex::new(None),
            pid: Mutex::new(None),
            kill: CancellationToken::new(),
            options,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Receiver observing state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// OS process id while running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exit details once the child has been reaped.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    /// Transport connected to the running child.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProcessNotRunning`] unless the state is `running`.
    pub fn transport(&self) -> Result<Arc<Transport>> {
        if self.state() != ProcessState::Running {
            return Err(AppError::ProcessNotRunning);
        }
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AppError::ProcessNotRunning)
    }

    // ── Start ─────────────────────────────────────────────────────────────────

    /// Launch `command` (program followed by arguments).
    ///
    /// # Errors
    ///
    /// - [`AppError::AlreadyRunning`] if the state is `running` or `stopping`.
    /// - [`AppError::Spawn`] if the supervisor already ran a process, the
    ///   command is empty or the OS refuses to launch it. Launch failures
    ///   leave the supervisor `stopped` with the failure published as its
    ///   exit, so [`wait`](Self::wait) returns.
    pub fn start(&self, command: &[String]) -> Result<Arc<Transport>> {
        let mut previous = ProcessState::Idle;
        let claimed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ProcessState::Idle {
                *state = ProcessState::Running;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match previous {
                ProcessState::Stopped => AppError::Spawn(
                    "supervisor already stopped; create a new one to restart".into(),
                ),
                _ => AppError::AlreadyRunning,
            });
        }

        match self.launch(command) {
            Ok(transport) => Ok(transport),
            Err(err) => {
                self.exit.send_replace(Some(ExitInfo {
                    code: None,
                    reason: err.to_string(),
                }));
                self.state.send_replace(ProcessState::Stopped);
                Err(err)
            }
        }
    }

    fn launch(&self, command: &[String]) -> Result<Arc<Transport>> {
        let Some((program, args)) = command.split_first() else {
            return Err(AppError::Spawn("no command specified".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.options.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.options.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to start {program}: {err}")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(AppError::Spawn("failed to capture host stdio".into()));
        };

        let pid = child.id();
        let transport = Transport::connect(stdin, stdout, self.options.transport.clone());
        transport.attach_stderr(stderr);

        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = pid;
        *self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&transport));

        info!(program = %program, pid, "host process started");

        let span = info_span!("host_monitor", pid);
        tokio::spawn(
            monitor(
                child,
                Arc::clone(&transport),
                Arc::clone(&self.state),
                Arc::clone(&self.exit),
                self.kill.clone(),
            )
            .instrument(span),
        );

        Ok(transport)
    }

    // ── Stop / kill ───────────────────────────────────────────────────────────

    fn begin_stopping(&self) -> ProcessState {
        let mut previous = ProcessState::Idle;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ProcessState::Running {
                *state = ProcessState::Stopping;
                true
            } else {
                false
            }
        });
        previous
    }

    async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ProcessState::Stopped).await;
    }

    /// Close the child's input and wait up to `grace` for it to exit, then
    /// kill it.
    ///
    /// Calling `stop` on an idle or stopped supervisor is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for platform failures.
    pub async fn stop(&self, grace: Duration) -> Result<StopOutcome> {
        match self.begin_stopping() {
            ProcessState::Idle | ProcessState::Stopped => return Ok(StopOutcome::AlreadyStopped),
            ProcessState::Running | ProcessState::Stopping => {}
        }

        let transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(transport) = transport {
            transport.close_input().await;
        }

        if tokio::time::timeout(grace, self.wait_stopped()).await.is_ok() {
            info!("host process exited after input closed");
            return Ok(StopOutcome::Graceful);
        }

        warn!(?grace, "host process did not exit in time, killing");
        self.kill.cancel();
        self.wait_stopped().await;
        Ok(StopOutcome::Forced)
    }

    /// Kill the child immediately and wait until it is reaped.
    ///
    /// Idempotent; a no-op when idle or stopped.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for platform failures.
    pub async fn kill(&self) -> Result<()> {
        match self.begin_stopping() {
            ProcessState::Idle | ProcessState::Stopped => return Ok(()),
            ProcessState::Running | ProcessState::Stopping => {}
        }
        self.kill.cancel();
        self.wait_stopped().await;
        Ok(())
    }

    /// Wait for the child to exit on its own.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProcessNotRunning`] if nothing was started.
    pub async fn wait(&self) -> Result<ExitInfo> {
        if self.state() == ProcessState::Idle {
            return Err(AppError::ProcessNotRunning);
        }
        let mut rx = self.exit.subscribe();
        let info = rx
            .wait_for(Option::is_some)
            .await
            .map(|info| info.clone())
            .ok()
            .flatten();
        Ok(info.unwrap_or_else(|| ExitInfo {
            code: None,
            reason: "host never launched".into(),
        }))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Reap `child`, then tear down its transport and publish `stopped`.
async fn monitor(
    mut child: Child,
    transport: Arc<Transport>,
    state: Arc<watch::Sender<ProcessState>>,
    exit: Arc<watch::Sender<Option<ExitInfo>>>,
    kill: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill host process");
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => {
            let code = status.code();
            let reason = code.map_or_else(
                || "process terminated by signal".to_owned(),
                |c| format!("process exited with code {c}"),
            );
            ExitInfo { code, reason }
        }
        Err(err) => {
            warn!(%err, "error waiting for host process");
            ExitInfo {
                code: None,
                reason: format!("wait error: {err}"),
            }
        }
    };
    info!(code = ?info.code, reason = %info.reason, "host process exited");

    transport.join_readers(READER_DRAIN).await;
    transport
        .shutdown(AppError::ProcessTerminated(info.reason.clone()))
        .await;

    exit.send_replace(Some(info));
    state.send_replace(ProcessState::Stopped);
}
