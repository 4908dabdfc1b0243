//! Startup detection: deciding READY / FAILED from process side channels.
//!
//! None of the wrapped executables expose a synchronous "ready" handshake,
//! so readiness is inferred from stdout/stderr text, a ready-file touch, or
//! a fallback timer, depending on the provider. Detection is a monotonic
//! state machine: once `Ready` or `Failed` is reached no further input
//! changes the outcome.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

use crate::error::Result;
use crate::process::{ExitInfo, ProcessEvent};

/// A case-sensitive line matcher: plain substring or compiled regex.
#[derive(Debug, Clone)]
pub enum Pattern {
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    pub fn substring(text: impl Into<String>) -> Self {
        Self::Substring(text.into())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(Self::Regex(Regex::new(pattern)?))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Substring(text) => line.contains(text.as_str()),
            Self::Regex(re) => re.is_match(line),
        }
    }
}

/// How a provider signals successful startup.
#[derive(Debug, Clone)]
pub enum StartupPolicy {
    /// Ready as soon as any line arrives on stdout or stderr. The default,
    /// intentionally permissive policy for executables that print a banner.
    AnyOutput,
    /// Ready/failed on matching output lines.
    LineMatch {
        ready: Vec<Pattern>,
        failed: Vec<Pattern>,
    },
    /// Ready when an external watcher sees the file touched; output lines
    /// can still signal failure.
    ReadyFile { path: PathBuf, failed: Vec<Pattern> },
    /// Ready once the delay elapses without an error, for executables with
    /// no reliable output at all.
    FixedDelay(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorState {
    Waiting,
    Ready,
    Failed(String),
}

pub struct StartupDetector {
    policy: StartupPolicy,
    state: DetectorState,
    /// Buffered stderr (plus stdout for ready-file providers), used as the
    /// failure diagnostic when the process exits before READY.
    diagnostics: String,
    exited: Option<ExitInfo>,
    stderr_closed: bool,
}

impl StartupDetector {
    pub fn new(policy: StartupPolicy) -> Self {
        Self {
            policy,
            state: DetectorState::Waiting,
            diagnostics: String::new(),
            exited: None,
            stderr_closed: false,
        }
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    /// The fallback timer this detector wants armed, if any.
    pub fn fallback_delay(&self) -> Option<Duration> {
        match &self.policy {
            StartupPolicy::FixedDelay(delay) => Some(*delay),
            _ => None,
        }
    }

    /// The file an external watcher should poll for mtime changes, if any.
    pub fn ready_file(&self) -> Option<&Path> {
        match &self.policy {
            StartupPolicy::ReadyFile { path, .. } => Some(path.as_path()),
            _ => None,
        }
    }

    /// Feed one process event through the transition function.
    pub fn observe(&mut self, event: &ProcessEvent) -> &DetectorState {
        if self.state != DetectorState::Waiting {
            return &self.state;
        }
        match event {
            ProcessEvent::OutputStarted => {
                if matches!(self.policy, StartupPolicy::AnyOutput) {
                    self.state = DetectorState::Ready;
                }
            }
            ProcessEvent::Stdout(line) => {
                if matches!(self.policy, StartupPolicy::ReadyFile { .. }) {
                    self.buffer_line(line);
                }
                self.observe_line(line);
            }
            ProcessEvent::Stderr(line) => {
                self.buffer_line(line);
                self.observe_line(line);
            }
            ProcessEvent::StdoutClosed => {}
            ProcessEvent::StderrClosed => {
                self.stderr_closed = true;
                self.conclude_exit_if_complete();
            }
            ProcessEvent::Exited(info) => {
                self.exited = Some(*info);
                self.conclude_exit_if_complete();
            }
        }
        &self.state
    }

    /// The provider's fallback timer elapsed with no failure observed.
    pub fn observe_timer_elapsed(&mut self) -> &DetectorState {
        if self.state == DetectorState::Waiting
            && matches!(self.policy, StartupPolicy::FixedDelay(_))
        {
            self.state = DetectorState::Ready;
        }
        &self.state
    }

    /// The external watcher saw the ready file touched.
    pub fn observe_file_touched(&mut self) -> &DetectorState {
        if self.state == DetectorState::Waiting
            && matches!(self.policy, StartupPolicy::ReadyFile { .. })
        {
            self.state = DetectorState::Ready;
        }
        &self.state
    }

    fn buffer_line(&mut self, line: &str) {
        if !self.diagnostics.is_empty() {
            self.diagnostics.push('\n');
        }
        self.diagnostics.push_str(line);
    }

    fn observe_line(&mut self, line: &str) {
        match &self.policy {
            StartupPolicy::AnyOutput => {
                self.state = DetectorState::Ready;
            }
            StartupPolicy::LineMatch { ready, failed } => {
                if failed.iter().any(|p| p.matches(line)) {
                    self.state = DetectorState::Failed(line.to_string());
                } else if ready.iter().any(|p| p.matches(line)) {
                    self.state = DetectorState::Ready;
                }
            }
            StartupPolicy::ReadyFile { failed, .. } => {
                if failed.iter().any(|p| p.matches(line)) {
                    self.state = DetectorState::Failed(line.to_string());
                }
            }
            StartupPolicy::FixedDelay(_) => {}
        }
    }

    /// The process exited before READY. Do not conclude until the stderr
    /// stream has also closed: the final buffered chunk can flush after the
    /// exit notification, and the diagnostic must not be truncated.
    fn conclude_exit_if_complete(&mut self) {
        if self.state != DetectorState::Waiting {
            return;
        }
        let Some(info) = self.exited else { return };
        if !self.stderr_closed {
            return;
        }
        let reason = if self.diagnostics.trim().is_empty() {
            info.to_string()
        } else {
            self.diagnostics.clone()
        };
        self.state = DetectorState::Failed(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ProcessEvent {
        ProcessEvent::Exited(ExitInfo {
            code: Some(code),
            signal: None,
        })
    }

    fn jvm_policy() -> StartupPolicy {
        StartupPolicy::LineMatch {
            ready: vec![Pattern::substring("Server is up and running")],
            failed: vec![
                Pattern::substring("Address already in use"),
                Pattern::regex(r"port \d+ is busy").unwrap(),
            ],
        }
    }

    #[test]
    fn any_output_is_ready_on_first_line() {
        let mut detector = StartupDetector::new(StartupPolicy::AnyOutput);
        let state = detector.observe(&ProcessEvent::Stdout("banner".to_string()));
        assert_eq!(*state, DetectorState::Ready);
    }

    #[test]
    fn any_output_is_ready_on_first_bytes_without_a_line() {
        let mut detector = StartupDetector::new(StartupPolicy::AnyOutput);
        let state = detector.observe(&ProcessEvent::OutputStarted);
        assert_eq!(*state, DetectorState::Ready);
    }

    #[test]
    fn line_policies_ignore_bare_output_signal() {
        let mut detector = StartupDetector::new(jvm_policy());
        detector.observe(&ProcessEvent::OutputStarted);
        assert_eq!(*detector.state(), DetectorState::Waiting);
    }

    #[test]
    fn jvm_ready_phrase_succeeds() {
        let mut detector = StartupDetector::new(jvm_policy());
        detector.observe(&ProcessEvent::Stderr("starting...".to_string()));
        assert_eq!(*detector.state(), DetectorState::Waiting);
        detector.observe(&ProcessEvent::Stderr(
            "INFO - Selenium Server is up and running".to_string(),
        ));
        assert_eq!(*detector.state(), DetectorState::Ready);
    }

    #[test]
    fn jvm_bind_exception_fails_before_ready() {
        let mut detector = StartupDetector::new(jvm_policy());
        detector.observe(&ProcessEvent::Stderr(
            "java.net.BindException: Address already in use".to_string(),
        ));
        match detector.state() {
            DetectorState::Failed(reason) => assert!(reason.contains("BindException")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn vendor_banner_error_pattern_fails() {
        let mut detector = StartupDetector::new(StartupPolicy::LineMatch {
            ready: vec![Pattern::substring("you may start your tests")],
            failed: vec![Pattern::regex(r"\*\*\* Error: (.+)").unwrap()],
        });
        detector.observe(&ProcessEvent::Stdout("*** Error: invalid key".to_string()));
        match detector.state() {
            DetectorState::Failed(reason) => assert!(reason.contains("invalid key")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn exit_before_ready_uses_accumulated_stderr() {
        let mut detector = StartupDetector::new(jvm_policy());
        detector.observe(&ProcessEvent::Stderr("fatal: bad config".to_string()));
        detector.observe(&exited(1));
        // Not concluded yet: stderr is still open.
        assert_eq!(*detector.state(), DetectorState::Waiting);
        detector.observe(&ProcessEvent::StderrClosed);
        match detector.state() {
            DetectorState::Failed(reason) => assert!(reason.contains("bad config")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn trailing_stderr_chunk_after_exit_is_not_truncated() {
        let mut detector = StartupDetector::new(jvm_policy());
        detector.observe(&exited(1));
        detector.observe(&ProcessEvent::Stderr("late diagnostic detail".to_string()));
        detector.observe(&ProcessEvent::StderrClosed);
        match detector.state() {
            DetectorState::Failed(reason) => assert!(reason.contains("late diagnostic detail")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn exit_with_empty_stderr_reports_exit_code() {
        let mut detector = StartupDetector::new(jvm_policy());
        detector.observe(&ProcessEvent::StderrClosed);
        detector.observe(&exited(3));
        assert_eq!(
            *detector.state(),
            DetectorState::Failed("Exit code: 3".to_string())
        );
    }

    #[test]
    fn detector_is_monotonic_after_ready() {
        let mut detector = StartupDetector::new(jvm_policy());
        detector.observe(&ProcessEvent::Stdout(
            "Server is up and running".to_string(),
        ));
        assert_eq!(*detector.state(), DetectorState::Ready);
        detector.observe(&ProcessEvent::Stderr(
            "Address already in use".to_string(),
        ));
        detector.observe(&ProcessEvent::StderrClosed);
        detector.observe(&exited(1));
        assert_eq!(*detector.state(), DetectorState::Ready);
    }

    #[test]
    fn fixed_delay_ready_on_timer() {
        let mut detector =
            StartupDetector::new(StartupPolicy::FixedDelay(Duration::from_millis(100)));
        detector.observe(&ProcessEvent::Stdout("noise".to_string()));
        assert_eq!(*detector.state(), DetectorState::Waiting);
        detector.observe_timer_elapsed();
        assert_eq!(*detector.state(), DetectorState::Ready);
    }

    #[test]
    fn ready_file_touch_wins_but_severe_line_fails() {
        let failed = vec![
            Pattern::substring("SEVERE:"),
            Pattern::substring("Error: response:"),
        ];
        let mut detector = StartupDetector::new(StartupPolicy::ReadyFile {
            path: PathBuf::from("/tmp/ready"),
            failed: failed.clone(),
        });
        detector.observe_file_touched();
        assert_eq!(*detector.state(), DetectorState::Ready);

        let mut detector = StartupDetector::new(StartupPolicy::ReadyFile {
            path: PathBuf::from("/tmp/ready"),
            failed,
        });
        detector.observe(&ProcessEvent::Stderr(
            "SEVERE: tunnel handshake rejected".to_string(),
        ));
        match detector.state() {
            DetectorState::Failed(reason) => assert!(reason.contains("handshake rejected")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn ready_file_buffers_stdout_for_diagnostics() {
        let mut detector = StartupDetector::new(StartupPolicy::ReadyFile {
            path: PathBuf::from("/tmp/ready"),
            failed: vec![Pattern::substring("SEVERE:")],
        });
        detector.observe(&ProcessEvent::Stdout("negotiating tunnel".to_string()));
        detector.observe(&ProcessEvent::StderrClosed);
        detector.observe(&exited(9));
        match detector.state() {
            DetectorState::Failed(reason) => assert!(reason.contains("negotiating tunnel")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
