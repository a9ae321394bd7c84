//! Spawning service processes and talking to them.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::controller::ControllerId;
use crate::error::{Error, Result};
use crate::protocol::{ExitReason, HostMessage, ProcessEvent, ServiceMessage};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Directory of the service being hosted.
    pub service_dir: PathBuf,
    /// Directory of the provider, for dependent services.
    pub provider_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl SpawnRequest {
    pub fn new(service_dir: impl Into<PathBuf>) -> Self {
        Self {
            service_dir: service_dir.into(),
            provider_dir: None,
            log_level: None,
        }
    }

    pub fn with_provider(mut self, provider_dir: impl Into<PathBuf>) -> Self {
        self.provider_dir = Some(provider_dir.into());
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Command-line arguments for the runner.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--service-dir".into(), self.service_dir.clone().into()];
        if let Some(provider) = &self.provider_dir {
            args.push("--provider-path".into());
            args.push(provider.clone().into());
        }
        if let Some(level) = &self.log_level {
            args.push("--log-level".into());
            args.push(level.into());
        }
        args
    }
}

/// Output of a process, tagged with the controller that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerEvent {
    pub controller: ControllerId,
    pub event: ProcessEvent,
}

/// Outbound half of a connection to a running service process.
pub trait ServiceLink: Send {
    /// Queue a message for the process.
    fn send(&self, message: HostMessage) -> Result<()>;

    /// Terminate the process if it has not exited on its own within
    /// `grace`. An [`ProcessEvent::Ended`] still follows.
    fn kill(&mut self, grace: Duration);
}

/// Starts service processes.
///
/// Everything the process says, and finally its exit, is delivered on
/// `events` tagged with `controller`.
pub trait ProcessHost: Send + Sync {
    fn spawn(
        &self,
        controller: ControllerId,
        request: &SpawnRequest,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<Box<dyn ServiceLink>>;
}

/// Runs every service through one runner executable, speaking
/// newline-delimited JSON over its stdin and stdout.
#[derive(Debug, Clone)]
pub struct TokioProcessHost {
    runner: PathBuf,
    leading_args: Vec<OsString>,
}

impl TokioProcessHost {
    pub fn new(runner: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the per-service ones, for runners that are
    /// themselves scripts behind an interpreter.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn runner(&self) -> &Path {
        &self.runner
    }
}

impl ProcessHost for TokioProcessHost {
    fn spawn(
        &self,
        controller: ControllerId,
        request: &SpawnRequest,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<Box<dyn ServiceLink>> {
        let spawn_err = |source: std::io::Error| Error::ProcessSpawnFailure {
            runner: self.runner.clone(),
            service_dir: request.service_dir.clone(),
            source,
        };

        let mut child = Command::new(&self.runner)
            .args(&self.leading_args)
            .args(request.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let missing = || spawn_err(std::io::Error::other("child stdio not captured"));
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        debug!(
            %controller,
            pid = ?child.id(),
            dir = %request.service_dir.display(),
            "spawned service process"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(writer_loop(controller, stdin, outbound_rx));
        tokio::spawn(reader_loop(controller, child, stdout, kill_rx, events));

        Ok(Box::new(ChildLink {
            outbound: outbound_tx,
            kill: Some(kill_tx),
        }))
    }
}

struct ChildLink {
    outbound: mpsc::UnboundedSender<HostMessage>,
    kill: Option<oneshot::Sender<Duration>>,
}

impl ServiceLink for ChildLink {
    fn send(&self, message: HostMessage) -> Result<()> {
        self.outbound.send(message).map_err(|_| Error::ChannelClosed)
    }

    fn kill(&mut self, grace: Duration) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(grace);
        }
    }
}

async fn writer_loop(
    controller: ControllerId,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<HostMessage>,
) {
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(%controller, error = %e, "failed to encode message for service");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            debug!(%controller, error = %e, "service stdin closed");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

/// Decodes stdout until EOF or an expired kill request, then reaps the
/// child and reports how it ended. Dropping the link counts as a kill
/// request without grace.
async fn reader_loop(
    controller: ControllerId,
    mut child: Child,
    stdout: ChildStdout,
    mut kill_rx: oneshot::Receiver<Duration>,
    events: mpsc::UnboundedSender<RunnerEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut broken: Option<String> = None;
    let mut deadline: Option<Instant> = None;

    let killed = loop {
        tokio::select! {
            grace = &mut kill_rx, if deadline.is_none() => {
                let grace = grace.unwrap_or_default();
                if grace.is_zero() {
                    break true;
                }
                debug!(%controller, ?grace, "waiting for service process to exit");
                deadline = Some(Instant::now() + grace);
            }
            _ = expired(deadline) => break true,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<ServiceMessage>(&line) {
                    Ok(message) => {
                        let event = RunnerEvent {
                            controller,
                            event: ProcessEvent::Message(message),
                        };
                        if events.send(event).is_err() {
                            break true;
                        }
                    }
                    Err(e) => warn!(
                        %controller,
                        error = %e,
                        "undecodable message from service, dropping"
                    ),
                },
                Ok(None) => break false,
                Err(e) => {
                    broken = Some(e.to_string());
                    break false;
                }
            },
        }
    };

    let reason = if killed {
        let _ = child.start_kill();
        let _ = child.wait().await;
        ExitReason::Killed
    } else if let Some(e) = broken {
        let _ = child.start_kill();
        let _ = child.wait().await;
        ExitReason::Io(e)
    } else {
        match child.wait().await {
            Ok(status) => ExitReason::Exited(status.code()),
            Err(e) => ExitReason::Io(e.to_string()),
        }
    };
    debug!(%controller, %reason, "service process ended");
    let _ = events.send(RunnerEvent {
        controller,
        event: ProcessEvent::Ended(reason),
    });
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
