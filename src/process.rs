//! Child process ownership: spawning, output streaming, and reaping.
//!
//! A [`ProcessHandle`] owns one spawned OS process. Output and exit are
//! delivered as a single typed event stream; termination is requested
//! through an idempotent [`kill`](ProcessControl::kill) and completion is
//! observed through [`wait`](ProcessControl::wait), so a caller can always
//! guarantee the child has been reaped before moving on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{HubError, Result};

/// Exit code and/or terminating signal reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: Option<ExitStatus>) -> Self {
        match status {
            Some(status) => {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;

                Self {
                    code: status.code(),
                    signal,
                }
            }
            None => Self {
                code: None,
                signal: None,
            },
        }
    }

    /// The numeric result `stop()` reports; 0 when the OS gave us no code.
    pub fn code_or_zero(&self) -> i32 {
        self.code.unwrap_or(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "Exit code: {code}"),
            (None, Some(signal)) => write!(f, "Terminated by signal {signal}"),
            (None, None) => write!(f, "Exit code: unknown"),
        }
    }
}

/// One observation from a running child process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// First bytes observed on a stream, possibly ahead of any complete
    /// line. Emitted at most once per stream.
    OutputStarted,
    Stdout(String),
    Stderr(String),
    /// The stdout pipe reached EOF.
    StdoutClosed,
    /// The stderr pipe reached EOF. May arrive before or after `Exited`;
    /// a final diagnostic chunk can flush after the exit notification.
    StderrClosed,
    /// Reported exactly once per process.
    Exited(ExitInfo),
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Clonable control surface for a spawned process: kill and wait.
#[derive(Clone)]
pub struct ProcessControl {
    pid: u32,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Request termination. Idempotent and non-blocking; killing a process
    /// that has already exited is a no-op.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Await the exit notification. Safe to call after [`kill`](Self::kill);
    /// returns immediately if the process already exited.
    pub async fn wait(&self) -> Result<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let observed = rx.wait_for(|v| v.is_some()).await.map_err(|_| {
            HubError::Lifecycle("process monitor terminated without reporting exit".to_string())
        })?;
        Ok(observed.unwrap_or(ExitInfo {
            code: None,
            signal: None,
        }))
    }

    /// Exit info if the process has already been reaped.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }
}

/// An owned, spawned OS process.
pub struct ProcessHandle {
    control: ProcessControl,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
}

impl ProcessHandle {
    /// Spawn a process with piped stdout/stderr. The only synchronous
    /// failure is the OS refusing to create the process (missing
    /// executable, permission denied).
    pub fn spawn(command: &Path, args: &[String], opts: &SpawnOptions) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &opts.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            HubError::Spawn(format!("failed to start {}: {e}", command.display()))
        })?;
        let pid = child.id().unwrap_or(0);
        debug!("Spawned {} (PID: {})", command.display(), pid);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, event_tx.clone(), LineStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, event_tx.clone(), LineStream::Stderr);
        }

        // Monitor task exclusively owns the child: reaps it and serializes
        // kill requests so the OS kill is issued at most once.
        tokio::spawn(async move {
            let mut killed = false;
            let mut kill_closed = false;
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let info = ExitInfo::from_status(status.ok());
                        debug!("Process {} exited: {}", pid, info);
                        let _ = exit_tx.send(Some(info));
                        let _ = event_tx.send(ProcessEvent::Exited(info));
                        break;
                    }
                    req = kill_rx.recv(), if !kill_closed => {
                        match req {
                            Some(()) if !killed => {
                                killed = true;
                                let _ = child.start_kill();
                            }
                            Some(()) => {}
                            None => kill_closed = true,
                        }
                    }
                }
            }
        });

        Ok(Self {
            control: ProcessControl {
                pid,
                kill_tx,
                exit_rx,
            },
            events: Some(event_rx),
        })
    }

    pub fn pid(&self) -> u32 {
        self.control.pid
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    pub fn kill(&self) {
        self.control.kill();
    }

    pub async fn wait(&self) -> Result<ExitInfo> {
        self.control.wait().await
    }

    /// Receive the next event. `None` once all streams closed and exit was
    /// delivered.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        match &mut self.events {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Detach the event stream, leaving only the control surface behind.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }
}

enum LineStream {
    Stdout,
    Stderr,
}

fn pump_lines(
    reader: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    stream: LineStream,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        // A banner may arrive without a trailing newline; surface the first
        // bytes before line framing so readiness is not held up until EOF.
        if let Ok(data) = reader.fill_buf().await {
            if !data.is_empty() {
                let _ = tx.send(ProcessEvent::OutputStarted);
            }
        }
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match stream {
                LineStream::Stdout => ProcessEvent::Stdout(line),
                LineStream::Stderr => ProcessEvent::Stderr(line),
            };
            if tx.send(event).is_err() {
                return;
            }
        }
        let closed = match stream {
            LineStream::Stdout => ProcessEvent::StdoutClosed,
            LineStream::Stderr => ProcessEvent::StderrClosed,
        };
        let _ = tx.send(closed);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delivers_stdout_then_exit() {
        let (cmd, args) = sh("echo hello");
        let mut handle = ProcessHandle::spawn(&cmd, &args, &SpawnOptions::default()).unwrap();

        let mut saw_line = false;
        let mut exit = None;
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::Stdout(line) => {
                    assert_eq!(line, "hello");
                    saw_line = true;
                }
                ProcessEvent::Exited(info) => exit = Some(info),
                _ => {}
            }
            if saw_line && exit.is_some() {
                break;
            }
        }
        assert!(saw_line);
        assert_eq!(exit.unwrap().code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_reported() {
        let (cmd, args) = sh("exit 7");
        let handle = ProcessHandle::spawn(&cmd, &args, &SpawnOptions::default()).unwrap();
        let info = handle.wait().await.unwrap();
        assert_eq!(info.code, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_is_idempotent_after_exit() {
        let (cmd, args) = sh("exit 0");
        let handle = ProcessHandle::spawn(&cmd, &args, &SpawnOptions::default()).unwrap();
        handle.wait().await.unwrap();
        // Both calls are no-ops; neither may panic or error.
        handle.kill();
        handle.kill();
        let info = handle.wait().await.unwrap();
        assert_eq!(info.code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_long_running_process() {
        let (cmd, args) = sh("sleep 30");
        let handle = ProcessHandle::spawn(&cmd, &args, &SpawnOptions::default()).unwrap();
        handle.kill();
        let info = handle.wait().await.unwrap();
        assert!(info.code.is_none() || info.code != Some(0));
    }

    #[tokio::test]
    async fn spawn_missing_executable_fails_synchronously() {
        let result = ProcessHandle::spawn(
            Path::new("/nonexistent/definitely-not-a-driver"),
            &[],
            &SpawnOptions::default(),
        );
        match result {
            Err(HubError::Spawn(msg)) => assert!(msg.contains("definitely-not-a-driver")),
            Err(other) => panic!("expected spawn error, got {other}"),
            Ok(_) => panic!("expected spawn error, got a handle"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn first_output_is_signalled_before_line_framing() {
        // printf emits no trailing newline, so no complete line exists
        // until the stream closes.
        let (cmd, args) = sh("printf banner; sleep 30");
        let mut handle = ProcessHandle::spawn(&cmd, &args, &SpawnOptions::default()).unwrap();

        let mut saw_started = false;
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::OutputStarted => {
                    saw_started = true;
                    break;
                }
                ProcessEvent::Exited(_) => break,
                _ => {}
            }
        }
        assert!(saw_started);
        handle.kill();
        handle.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_close_is_observed() {
        let (cmd, args) = sh("echo oops >&2; exit 2");
        let mut handle = ProcessHandle::spawn(&cmd, &args, &SpawnOptions::default()).unwrap();

        let mut saw_stderr = false;
        let mut saw_stderr_closed = false;
        let mut saw_exit = false;
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::Stderr(line) => saw_stderr = line.contains("oops"),
                ProcessEvent::StderrClosed => saw_stderr_closed = true,
                ProcessEvent::Exited(_) => saw_exit = true,
                _ => {}
            }
            if saw_stderr && saw_stderr_closed && saw_exit {
                break;
            }
        }
        assert!(saw_stderr && saw_stderr_closed && saw_exit);
    }
}
