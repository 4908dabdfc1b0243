//! TunnelProcess: the download -> spawn -> detect -> running -> stop state
//! machine that owns one driver/tunnel subprocess.
//!
//! Lifecycle: `Idle -> Downloading -> Starting -> Running -> Stopping ->
//! Idle`, with `Starting -> Idle` on failure or cancellation. At most one
//! of Starting/Running/Stopping is active per instance; a second `start()`
//! while one is in flight joins the existing attempt instead of spawning a
//! second OS process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::detect::{DetectorState, StartupDetector, StartupPolicy};
use crate::error::{HubError, Result};
use crate::install::{self, ArtifactSpec};
use crate::poll::FileTouchWatch;
use crate::process::{ExitInfo, ProcessControl, ProcessEvent, ProcessHandle, SpawnOptions};
use crate::provider::{ProviderConfig, build_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Downloading,
    Starting,
    Running,
    Stopping,
}

/// Typed lifecycle notifications, consumed by whoever subscribes. There is
/// no untyped event bus.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Downloading,
    Starting,
    Ready { port: u16 },
    Stopped { exit_code: i32 },
    StartFailed { reason: String },
    /// The process died while `Running` with no stop() pending.
    UnsolicitedExit { exit: ExitInfo },
}

#[derive(Debug, Clone)]
enum StartOutcome {
    Ready,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    pub spawn: SpawnOptions,
    pub policy: StartupPolicy,
    pub artifact: Option<ArtifactSpec>,
    pub install_dir: PathBuf,
    pub ready_poll_interval: Duration,
}

impl TunnelConfig {
    pub fn from_provider(provider: &ProviderConfig, install_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            name: provider.browser_name.clone(),
            command: provider.executable.clone(),
            args: build_args(provider),
            port: provider.port,
            spawn: SpawnOptions {
                working_dir: provider.working_dir.clone(),
                env: provider.env.clone(),
            },
            policy: provider.startup_policy()?,
            artifact: provider.artifact.clone(),
            install_dir,
            ready_poll_interval: provider.ready_poll_interval,
        })
    }
}

struct InFlight {
    outcome_rx: watch::Receiver<Option<StartOutcome>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    state: LifecycleState,
    control: Option<ProcessControl>,
    inflight: Option<InFlight>,
    /// Incremented per spawn so a stale exit monitor never clears state
    /// belonging to a newer process.
    epoch: u64,
}

pub struct TunnelProcess {
    config: TunnelConfig,
    client: reqwest::Client,
    inner: Mutex<Inner>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelProcess {
    pub fn new(config: TunnelConfig, client: reqwest::Client) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            config,
            client,
            inner: Mutex::new(Inner {
                state: LifecycleState::Idle,
                control: None,
                inflight: None,
                epoch: 0,
            }),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    /// Ensure required artifacts exist locally; a no-op when already
    /// present unless `force` is set, and when no artifact is configured.
    pub async fn download(&self, force: bool) -> Result<()> {
        if let Some(artifact) = &self.config.artifact {
            install::ensure_installed(&self.client, artifact, &self.config.install_dir, force)
                .await?;
        }
        Ok(())
    }

    /// Start the process and resolve once the startup detector reports
    /// READY. Joins the in-flight attempt when one exists.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut outcome_rx = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                LifecycleState::Running => {
                    return Err(HubError::Lifecycle(format!(
                        "{} is already running",
                        self.config.name
                    )));
                }
                LifecycleState::Stopping => {
                    return Err(HubError::Lifecycle(format!(
                        "{}: previous instance still terminating",
                        self.config.name
                    )));
                }
                LifecycleState::Downloading | LifecycleState::Starting => {
                    match &inner.inflight {
                        Some(inflight) => inflight.outcome_rx.clone(),
                        None => {
                            return Err(HubError::Lifecycle(format!(
                                "{}: start attempt in flight but untracked",
                                self.config.name
                            )));
                        }
                    }
                }
                LifecycleState::Idle => {
                    let (outcome_tx, outcome_rx) = watch::channel(None);
                    let (cancel_tx, cancel_rx) = oneshot::channel();
                    inner.state = LifecycleState::Downloading;
                    inner.inflight = Some(InFlight {
                        outcome_rx: outcome_rx.clone(),
                        cancel_tx: Some(cancel_tx),
                    });
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.run_start_attempt(outcome_tx, cancel_rx).await;
                    });
                    outcome_rx
                }
            }
        };

        let outcome = outcome_rx
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| {
                HubError::Lifecycle(format!(
                    "{}: start attempt vanished without an outcome",
                    self.config.name
                ))
            })?
            .clone();
        match outcome {
            Some(StartOutcome::Ready) => Ok(()),
            Some(StartOutcome::Failed(reason)) => Err(HubError::Startup(reason)),
            Some(StartOutcome::Cancelled) | None => Err(HubError::Lifecycle(format!(
                "{}: start was cancelled",
                self.config.name
            ))),
        }
    }

    /// Send a termination signal and wait for exit. Resolves with the
    /// observed exit code (0 when the OS reported none). Cancels an
    /// in-flight start; a stop that itself errors leaves the instance
    /// `Running` so it can be retried.
    pub async fn stop(self: &Arc<Self>) -> Result<i32> {
        enum Plan {
            CancelStart(Option<oneshot::Sender<()>>, watch::Receiver<Option<StartOutcome>>),
            Kill(ProcessControl),
        }

        let plan = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                LifecycleState::Stopping => {
                    return Err(HubError::Lifecycle(format!(
                        "{} is already terminating",
                        self.config.name
                    )));
                }
                LifecycleState::Idle => {
                    return Err(HubError::Lifecycle(format!(
                        "{} is not running",
                        self.config.name
                    )));
                }
                LifecycleState::Downloading | LifecycleState::Starting => {
                    match inner.inflight.as_mut() {
                        Some(inflight) => Plan::CancelStart(
                            inflight.cancel_tx.take(),
                            inflight.outcome_rx.clone(),
                        ),
                        None => {
                            return Err(HubError::Lifecycle(format!(
                                "{}: start attempt in flight but untracked",
                                self.config.name
                            )));
                        }
                    }
                }
                LifecycleState::Running => {
                    let control = match inner.control.clone() {
                        Some(control) => control,
                        None => {
                            return Err(HubError::Lifecycle(format!(
                                "{}: running without a process handle",
                                self.config.name
                            )));
                        }
                    };
                    inner.state = LifecycleState::Stopping;
                    Plan::Kill(control)
                }
            }
        };

        match plan {
            Plan::CancelStart(cancel_tx, mut outcome_rx) => {
                if let Some(tx) = cancel_tx {
                    let _ = tx.send(());
                }
                // Cancellation is complete only once the attempt has killed
                // and reaped whatever it spawned.
                let outcome = outcome_rx
                    .wait_for(|o| o.is_some())
                    .await
                    .ok()
                    .and_then(|o| o.clone());
                match outcome {
                    // The attempt reached Running before the cancel landed;
                    // the caller asked for a stopped process, so stop it.
                    Some(StartOutcome::Ready) => Box::pin(self.stop()).await,
                    _ => Ok(0),
                }
            }
            Plan::Kill(control) => {
                info!("Stopping {} (PID: {})", self.config.name, control.pid());
                control.kill();
                match control.wait().await {
                    Ok(exit) => {
                        let mut inner = self.inner.lock().await;
                        inner.state = LifecycleState::Idle;
                        inner.control = None;
                        drop(inner);
                        let code = exit.code_or_zero();
                        let _ = self.events.send(TunnelEvent::Stopped { exit_code: code });
                        Ok(code)
                    }
                    Err(e) => {
                        // Stop is retryable.
                        let mut inner = self.inner.lock().await;
                        inner.state = LifecycleState::Running;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn run_start_attempt(
        self: Arc<Self>,
        outcome_tx: watch::Sender<Option<StartOutcome>>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let _ = self.events.send(TunnelEvent::Downloading);
        if let Err(e) = self.download(false).await {
            self.conclude_failed(&outcome_tx, e.to_string()).await;
            return;
        }

        if cancel_rx.try_recv().is_ok() {
            self.conclude(&outcome_tx, StartOutcome::Cancelled).await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = LifecycleState::Starting;
            inner.epoch += 1;
        }
        let _ = self.events.send(TunnelEvent::Starting);
        debug!(
            "Spawning {} {:?} for {}",
            self.config.command.display(),
            self.config.args,
            self.config.name
        );

        let mut handle =
            match ProcessHandle::spawn(&self.config.command, &self.config.args, &self.config.spawn)
            {
                Ok(handle) => handle,
                Err(e) => {
                    self.conclude_failed(&outcome_tx, e.to_string()).await;
                    return;
                }
            };
        let control = handle.control();

        let mut detector = StartupDetector::new(self.config.policy.clone());
        let mut fallback_timer = detector
            .fallback_delay()
            .map(|delay| Box::pin(tokio::time::sleep(delay)));
        let ready_watch = detector.ready_file().map(FileTouchWatch::new);
        let mut poll_tick = tokio::time::interval(self.config.ready_poll_interval);
        let mut events_done = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Kill errors are swallowed: cancellation must always
                    // be able to complete, and the process is reaped below.
                    control.kill();
                    let _ = control.wait().await;
                    self.conclude(&outcome_tx, StartOutcome::Cancelled).await;
                    return;
                }
                event = handle.next_event(), if !events_done => {
                    match event {
                        Some(event) => { detector.observe(&event); }
                        None => { events_done = true; }
                    }
                }
                _ = async {
                    match fallback_timer.as_mut() {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                }, if fallback_timer.is_some() => {
                    detector.observe_timer_elapsed();
                    fallback_timer = None;
                }
                _ = poll_tick.tick(), if ready_watch.is_some() => {
                    if ready_watch.as_ref().is_some_and(|w| w.touched()) {
                        detector.observe_file_touched();
                    }
                }
            }

            match detector.state() {
                DetectorState::Waiting => continue,
                DetectorState::Ready => break,
                DetectorState::Failed(reason) => {
                    let reason = reason.clone();
                    control.kill();
                    let _ = control.wait().await;
                    self.conclude_failed(&outcome_tx, reason).await;
                    return;
                }
            }
        }

        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.state = LifecycleState::Running;
            inner.control = Some(control.clone());
            inner.inflight = None;
            inner.epoch
        };
        if let Some(events) = handle.take_events() {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.monitor_running(events, epoch).await;
            });
        }
        info!(
            "{} ready on port {} (PID: {})",
            self.config.name,
            self.config.port,
            control.pid()
        );
        let _ = outcome_tx.send(Some(StartOutcome::Ready));
        let _ = self.events.send(TunnelEvent::Ready {
            port: self.config.port,
        });
    }

    /// Watch the remaining event stream of a running process for a crash.
    async fn monitor_running(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        epoch: u64,
    ) {
        while let Some(event) = events.recv().await {
            if let ProcessEvent::Exited(exit) = event {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch && inner.state == LifecycleState::Running {
                    inner.state = LifecycleState::Idle;
                    inner.control = None;
                    drop(inner);
                    warn!("{} exited unexpectedly: {}", self.config.name, exit);
                    let _ = self.events.send(TunnelEvent::UnsolicitedExit { exit });
                }
                return;
            }
        }
    }

    async fn conclude_failed(&self, outcome_tx: &watch::Sender<Option<StartOutcome>>, reason: String) {
        warn!("{} failed to start: {}", self.config.name, reason);
        let _ = self.events.send(TunnelEvent::StartFailed {
            reason: reason.clone(),
        });
        self.conclude(outcome_tx, StartOutcome::Failed(reason)).await;
    }

    async fn conclude(&self, outcome_tx: &watch::Sender<Option<StartOutcome>>, outcome: StartOutcome) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = LifecycleState::Idle;
            inner.control = None;
            inner.inflight = None;
        }
        let _ = outcome_tx.send(Some(outcome));
    }
}
