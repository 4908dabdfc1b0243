mod config;
mod detect;
mod environments;
mod error;
mod install;
mod poll;
mod pool;
mod process;
mod provider;
pub mod proxy;
mod tunnel;

pub use config::{Config, ProviderCredentials};
pub use detect::{DetectorState, Pattern, StartupDetector, StartupPolicy};
pub use environments::{BrowserEnvironment, fetch_environments, resolve_version_alias};
pub use error::{HubError, Result};
pub use install::{ArtifactSpec, ExtractMode, ensure_installed};
pub use poll::{FileTouchWatch, poll_until};
pub use pool::{DriverPool, ProcessRef};
pub use process::{ExitInfo, ProcessControl, ProcessEvent, ProcessHandle, SpawnOptions};
pub use provider::{ProviderConfig, TunnelKind, artifact_for, build_args};
pub use proxy::ProxyState;
pub use tunnel::{LifecycleState, TunnelConfig, TunnelEvent, TunnelProcess};
