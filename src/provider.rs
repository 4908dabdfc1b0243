//! Provider catalog: which executable serves a browser kind, the argument
//! table for spawning it, and the startup policy that watches it.
//!
//! Providers are a closed set of tagged variants selected by configuration.
//! Each variant carries its own argument builder and detector selection;
//! there is no per-vendor subclassing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::detect::{Pattern, StartupPolicy};
use crate::error::{HubError, Result};
use crate::install::{ArtifactSpec, ExtractMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    /// A plain driver binary that prints a banner; ready on first output.
    Generic,
    /// A JVM-hosted driver server (Selenium standalone).
    JvmHosted,
    /// A vendor tunnel announcing success with a stdout phrase.
    VendorBanner,
    /// A vendor tunnel that touches a ready file on successful startup.
    ReadyFile,
    /// An executable with no reliable output; ready after a fixed delay.
    Silent,
}

/// Fully merged configuration for one spawnable provider instance.
/// Built once by [`ProviderConfig::for_browser`]; fields are never injected
/// at runtime.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub browser_name: String,
    pub kind: TunnelKind,
    pub executable: PathBuf,
    pub port: u16,
    /// Server jar for JVM-hosted providers.
    pub jar_path: Option<PathBuf>,
    /// Ready-file path for providers that signal through the filesystem.
    pub ready_file: Option<PathBuf>,
    pub access_key: Option<String>,
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub silent_delay: Duration,
    pub artifact: Option<ArtifactSpec>,
    pub ready_poll_interval: Duration,
}

impl ProviderConfig {
    /// Merge-with-defaults constructor: resolve a browser kind requested in
    /// capabilities into a spawnable provider bound to `port`.
    pub async fn for_browser(browser_name: &str, port: u16, config: &Config) -> Result<Self> {
        let silent_delay = Duration::from_millis(config.silent_startup_delay_ms);
        let base = Self {
            browser_name: browser_name.to_lowercase(),
            kind: TunnelKind::Generic,
            executable: PathBuf::new(),
            port,
            jar_path: None,
            ready_file: None,
            access_key: config.credentials.as_ref().map(|c| c.access_key.clone()),
            extra_args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            silent_delay,
            artifact: None,
            ready_poll_interval: Duration::from_millis(250),
        };

        match browser_name.to_lowercase().as_str() {
            "chrome" | "chromium" => Ok(Self {
                executable: locate_executable(executable_name("chromedriver"), &config.install_dir)
                    .await,
                ..base
            }),
            "firefox" | "gecko" => Ok(Self {
                executable: locate_executable(executable_name("geckodriver"), &config.install_dir)
                    .await,
                ..base
            }),
            "edge" | "msedge" => Ok(Self {
                executable: locate_executable(executable_name("msedgedriver"), &config.install_dir)
                    .await,
                ..base
            }),
            "selenium" | "selenium-server" => Ok(Self {
                kind: TunnelKind::JvmHosted,
                executable: locate_executable(executable_name("java"), &config.install_dir).await,
                jar_path: Some(config.install_dir.join("selenium-server-standalone.jar")),
                ..base
            }),
            "sauce" | "sauce-connect" => Ok(Self {
                kind: TunnelKind::VendorBanner,
                executable: locate_executable(executable_name("sc"), &config.install_dir).await,
                ..base
            }),
            "browserstack" | "browserstack-local" => Ok(Self {
                kind: TunnelKind::ReadyFile,
                executable: locate_executable(
                    executable_name("BrowserStackLocal"),
                    &config.install_dir,
                )
                .await,
                ready_file: Some(config.install_dir.join(format!("bs-ready-{port}"))),
                ..base
            }),
            "testingbot" => Ok(Self {
                kind: TunnelKind::Silent,
                executable: locate_executable(
                    executable_name("testingbot-tunnel"),
                    &config.install_dir,
                )
                .await,
                ..base
            }),
            other => Err(HubError::Config(format!("unknown browser kind '{other}'"))),
        }
    }

    /// The startup detector policy for this provider, per kind.
    pub fn startup_policy(&self) -> Result<StartupPolicy> {
        match self.kind {
            TunnelKind::Generic => Ok(StartupPolicy::AnyOutput),
            TunnelKind::JvmHosted => Ok(StartupPolicy::LineMatch {
                ready: vec![Pattern::substring("Server is up and running")],
                failed: vec![
                    Pattern::substring("Address already in use"),
                    Pattern::regex(r"port \d+ is busy")?,
                ],
            }),
            TunnelKind::VendorBanner => Ok(StartupPolicy::LineMatch {
                ready: vec![Pattern::substring("you may start your tests")],
                failed: vec![Pattern::regex(r"\*\*\* Error: (.+)")?],
            }),
            TunnelKind::ReadyFile => {
                let path = self
                    .ready_file
                    .clone()
                    .ok_or_else(|| {
                        HubError::Config(format!(
                            "provider '{}' requires a ready file path",
                            self.browser_name
                        ))
                    })?;
                Ok(StartupPolicy::ReadyFile {
                    path,
                    failed: vec![
                        Pattern::substring("SEVERE:"),
                        Pattern::substring("Error: response:"),
                    ],
                })
            }
            TunnelKind::Silent => Ok(StartupPolicy::FixedDelay(self.silent_delay)),
        }
    }
}

/// Pure argument table: provider config in, argv out. No side effects.
pub fn build_args(config: &ProviderConfig) -> Vec<String> {
    let port = config.port;
    let mut args = match config.kind {
        TunnelKind::Generic => generic_driver_args(config),
        TunnelKind::JvmHosted => {
            let jar = config
                .jar_path
                .as_deref()
                .unwrap_or_else(|| Path::new("selenium-server-standalone.jar"));
            vec![
                "-jar".to_string(),
                jar.to_string_lossy().into_owned(),
                "-port".to_string(),
                port.to_string(),
            ]
        }
        TunnelKind::VendorBanner => {
            let mut args = Vec::new();
            if let Some(key) = &config.access_key {
                args.push("--api-key".to_string());
                args.push(key.clone());
            }
            args.push("--se-port".to_string());
            args.push(port.to_string());
            args
        }
        TunnelKind::ReadyFile => {
            let mut args = Vec::new();
            if let Some(key) = &config.access_key {
                args.push("--key".to_string());
                args.push(key.clone());
            }
            if let Some(ready) = &config.ready_file {
                args.push("--ready-file".to_string());
                args.push(ready.to_string_lossy().into_owned());
            }
            args
        }
        TunnelKind::Silent => vec!["--port".to_string(), port.to_string()],
    };
    args.extend(config.extra_args.iter().cloned());
    args
}

fn generic_driver_args(config: &ProviderConfig) -> Vec<String> {
    let port = config.port;
    let file_name = config
        .executable
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file_name.as_str() {
        "geckodriver" => vec![
            "--port".to_string(),
            port.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
        ],
        // chromedriver-style flag shape, shared by msedgedriver
        _ => vec![
            format!("--port={port}"),
            "--whitelisted-ips=127.0.0.1".to_string(),
        ],
    }
}

fn executable_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

/// Find an executable: PATH first, then common install locations, then the
/// hub's install dir. Falls back to the bare name so a later spawn reports
/// the real OS error. The which/where probe and the path checks touch the
/// filesystem, so they run off the async threads.
async fn locate_executable(exe_name: String, install_dir: &Path) -> PathBuf {
    let fallback = PathBuf::from(&exe_name);
    let install_dir = install_dir.to_path_buf();
    match tokio::task::spawn_blocking(move || locate_blocking(&exe_name, &install_dir)).await {
        Ok(path) => path,
        Err(_) => fallback,
    }
}

fn locate_blocking(exe_name: &str, install_dir: &Path) -> PathBuf {
    let which_cmd = if cfg!(windows) { "where" } else { "which" };
    if let Ok(output) = Command::new(which_cmd).arg(&exe_name).output() {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(first) = stdout.lines().next() {
                if !first.trim().is_empty() {
                    return PathBuf::from(first.trim());
                }
            }
        }
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/usr/local/bin").join(&exe_name));
        candidates.push(PathBuf::from("/opt/homebrew/bin").join(&exe_name));
    } else if cfg!(windows) {
        candidates.push(PathBuf::from("C:\\WebDrivers").join(&exe_name));
    } else {
        candidates.push(PathBuf::from("/usr/bin").join(&exe_name));
        candidates.push(PathBuf::from("/usr/local/bin").join(&exe_name));
        candidates.push(PathBuf::from("/snap/bin").join(&exe_name));
    }
    candidates.push(install_dir.join(&exe_name));

    for candidate in &candidates {
        if candidate.exists() {
            debug!("Found {} at {:?}", exe_name, candidate);
            return candidate.clone();
        }
    }
    PathBuf::from(exe_name)
}

/// Convenience for providers whose artifact is known ahead of time.
pub fn artifact_for(url: &str, executable: &str) -> ArtifactSpec {
    let extract = if url.ends_with(".zip") {
        ExtractMode::Zip
    } else if url.ends_with(".tar.gz") || url.ends_with(".tgz") {
        ExtractMode::TarGz
    } else {
        ExtractMode::DontExtract
    };
    ArtifactSpec {
        url: url.to_string(),
        executable: executable.to_string(),
        extract,
    }
}
