//! DriverPool: one lazily-spawned TunnelProcess per browser kind, each on
//! its own monotonically allocated port.
//!
//! Policy: a live process is shared across sequential sessions of its
//! browser kind. A fresh spawn after a failure gets a new port so it never
//! races a lingering half-dead process still bound to the old one. Drivers
//! started outside the hub can be registered as external entries and are
//! routed to without any process management.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{HubError, Result};
use crate::provider::ProviderConfig;
use crate::tunnel::{LifecycleState, TunnelConfig, TunnelProcess};

/// Reference handed to the proxy: enough to route traffic to the process.
#[derive(Clone)]
pub struct ProcessRef {
    pub browser: String,
    pub port: u16,
    pub url: String,
    tunnel: Option<Arc<TunnelProcess>>,
}

impl std::fmt::Debug for ProcessRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRef")
            .field("browser", &self.browser)
            .field("port", &self.port)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl ProcessRef {
    /// The owning tunnel; `None` for externally managed drivers.
    pub fn tunnel(&self) -> Option<&Arc<TunnelProcess>> {
        self.tunnel.as_ref()
    }
}

struct PoolEntry {
    /// `None` for drivers started outside the hub.
    tunnel: Option<Arc<TunnelProcess>>,
    port: u16,
    failures: u32,
}

struct PoolInner {
    next_port: u16,
    entries: HashMap<String, PoolEntry>,
}

pub struct DriverPool {
    config: Config,
    client: reqwest::Client,
    inner: Mutex<PoolInner>,
}

impl DriverPool {
    pub fn new(config: Config, client: reqwest::Client) -> Self {
        let next_port = config.base_port;
        Self {
            config,
            client,
            inner: Mutex::new(PoolInner {
                next_port,
                entries: HashMap::new(),
            }),
        }
    }

    /// Look up or lazily create the driver process for `browser`, starting
    /// it when not already running. Fails permanently for a kind once its
    /// failure counter reaches the configured maximum, until `reset`.
    pub async fn acquire(&self, browser: &str) -> Result<ProcessRef> {
        let key = browser.to_lowercase();

        let tunnel = {
            let mut inner = self.inner.lock().await;

            if let Some(entry) = inner.entries.get(&key) {
                if entry.failures >= self.config.max_start_attempts {
                    return Err(HubError::Lifecycle(format!(
                        "{} failed to start {} times; reset required",
                        key, entry.failures
                    )));
                }
                if entry.tunnel.is_none() {
                    // External driver; nothing to start.
                    return Ok(Self::external_ref(&key, entry.port));
                }
            }

            let reusable = match inner.entries.get(&key).and_then(|e| e.tunnel.as_ref()) {
                Some(tunnel) => tunnel.lifecycle().await != LifecycleState::Idle,
                None => false,
            };

            if reusable {
                // Running, or a start is in flight we can join.
                inner
                    .entries
                    .get(&key)
                    .and_then(|e| e.tunnel.clone())
                    .ok_or_else(|| HubError::Lifecycle(format!("{key}: pool entry vanished")))?
            } else {
                // Fresh spawn on a fresh port.
                let port = inner.next_port;
                let provider = ProviderConfig::for_browser(&key, port, &self.config).await?;
                let tunnel_config =
                    TunnelConfig::from_provider(&provider, self.config.install_dir.clone())?;
                inner.next_port += 1;
                let tunnel = TunnelProcess::new(tunnel_config, self.client.clone());
                let failures = inner.entries.get(&key).map(|e| e.failures).unwrap_or(0);
                info!("Allocated port {} for {}", port, key);
                inner.entries.insert(
                    key.clone(),
                    PoolEntry {
                        tunnel: Some(Arc::clone(&tunnel)),
                        port,
                        failures,
                    },
                );
                tunnel
            }
        };

        if tunnel.lifecycle().await == LifecycleState::Running {
            return Ok(Self::managed_ref(&key, &tunnel));
        }

        match tunnel.start().await {
            Ok(()) => Ok(Self::managed_ref(&key, &tunnel)),
            Err(HubError::Lifecycle(msg)) if msg.contains("already running") => {
                Ok(Self::managed_ref(&key, &tunnel))
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.entries.get_mut(&key) {
                    if entry
                        .tunnel
                        .as_ref()
                        .is_some_and(|t| Arc::ptr_eq(t, &tunnel))
                    {
                        entry.failures += 1;
                    }
                }
                Err(e)
            }
        }
    }

    fn managed_ref(key: &str, tunnel: &Arc<TunnelProcess>) -> ProcessRef {
        let port = tunnel.port();
        ProcessRef {
            browser: key.to_string(),
            port,
            url: format!("http://localhost:{port}"),
            tunnel: Some(Arc::clone(tunnel)),
        }
    }

    fn external_ref(key: &str, port: u16) -> ProcessRef {
        ProcessRef {
            browser: key.to_string(),
            port,
            url: format!("http://localhost:{port}"),
            tunnel: None,
        }
    }

    /// Register a driver already listening on `port`, started outside the
    /// hub's process management.
    pub async fn register_external(&self, browser: &str, port: u16) {
        let key = browser.to_lowercase();
        let mut inner = self.inner.lock().await;
        info!("Registered external {} driver on port {}", key, port);
        inner.entries.insert(
            key,
            PoolEntry {
                tunnel: None,
                port,
                failures: 0,
            },
        );
    }

    /// Whether the pool currently tracks an entry for `browser`.
    pub async fn is_managed(&self, browser: &str) -> bool {
        let key = browser.to_lowercase();
        self.inner.lock().await.entries.contains_key(&key)
    }

    /// Count a driver-reported failure against `browser`'s entry.
    pub async fn record_failure(&self, browser: &str) -> u32 {
        let key = browser.to_lowercase();
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.failures += 1;
                entry.failures
            }
            None => 0,
        }
    }

    /// Clear the failure counter so `acquire` may try again.
    pub async fn reset(&self, browser: &str) {
        let key = browser.to_lowercase();
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.failures = 0;
        }
    }

    /// Stop the live process for `browser`, if any. Used when session
    /// creation against it is exhausted. External entries are dropped from
    /// the pool instead of being signalled.
    pub async fn stop_browser(&self, browser: &str) -> Result<i32> {
        let key = browser.to_lowercase();
        let tunnel = {
            let mut inner = self.inner.lock().await;
            match inner.entries.get(&key) {
                Some(entry) => match &entry.tunnel {
                    Some(tunnel) => Arc::clone(tunnel),
                    None => {
                        inner.entries.remove(&key);
                        return Ok(0);
                    }
                },
                None => {
                    return Err(HubError::Lifecycle(format!("no pool entry for {key}")));
                }
            }
        };
        tunnel.stop().await
    }

    /// Stop every live process, tolerating individual failures.
    pub async fn release_all(&self) {
        let tunnels: Vec<(String, Arc<TunnelProcess>)> = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .iter()
                .filter_map(|(k, e)| e.tunnel.as_ref().map(|t| (k.clone(), Arc::clone(t))))
                .collect()
        };
        for (name, tunnel) in tunnels {
            match tunnel.stop().await {
                Ok(code) => info!("Stopped {} (exit code {})", name, code),
                Err(e) => warn!("Failed to stop {}: {}", name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> DriverPool {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            base_port: 9700,
            max_start_attempts: 3,
            // An empty install dir guarantees the executables are absent.
            install_dir: dir.keep(),
            ..Config::default()
        };
        DriverPool::new(config, reqwest::Client::new())
    }

    async fn entry_port(pool: &DriverPool, browser: &str) -> Option<u16> {
        pool.inner.lock().await.entries.get(browser).map(|e| e.port)
    }

    async fn entry_failures(pool: &DriverPool, browser: &str) -> Option<u32> {
        pool.inner
            .lock()
            .await
            .entries
            .get(browser)
            .map(|e| e.failures)
    }

    #[tokio::test]
    async fn unknown_browser_is_rejected_without_allocating() {
        let pool = pool();
        assert!(pool.acquire("netscape").await.is_err());
        assert_eq!(pool.inner.lock().await.next_port, 9700);
    }

    // The testingbot executable does not exist in the test environment, so
    // each acquire attempt fails at spawn and exercises the retry rules.
    #[tokio::test]
    async fn failed_spawn_increments_counter_and_reallocates_port() {
        let pool = pool();
        assert!(pool.acquire("testingbot").await.is_err());
        assert_eq!(entry_port(&pool, "testingbot").await, Some(9700));
        assert_eq!(entry_failures(&pool, "testingbot").await, Some(1));

        // Retry gets a fresh port; the old one is never reused.
        assert!(pool.acquire("testingbot").await.is_err());
        assert_eq!(entry_port(&pool, "testingbot").await, Some(9701));
        assert_eq!(entry_failures(&pool, "testingbot").await, Some(2));
    }

    #[tokio::test]
    async fn acquire_fails_permanently_after_max_attempts_until_reset() {
        let pool = pool();
        for _ in 0..3 {
            assert!(pool.acquire("testingbot").await.is_err());
        }
        let err = pool.acquire("testingbot").await.unwrap_err();
        assert!(err.to_string().contains("reset required"));
        // Port allocation stopped with the third attempt.
        assert_eq!(entry_port(&pool, "testingbot").await, Some(9702));

        pool.reset("testingbot").await;
        // After reset, attempts resume (and still fail to spawn).
        let err = pool.acquire("testingbot").await.unwrap_err();
        assert!(!err.to_string().contains("reset required"));
    }

    #[tokio::test]
    async fn distinct_browser_kinds_never_share_ports() {
        let pool = pool();
        let _ = pool.acquire("testingbot").await;
        let _ = pool.acquire("sauce").await;
        let first = entry_port(&pool, "testingbot").await.unwrap();
        let second = entry_port(&pool, "sauce").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn external_entries_are_returned_without_spawning() {
        let pool = pool();
        pool.register_external("chrome", 12345).await;
        let reference = pool.acquire("chrome").await.unwrap();
        assert_eq!(reference.port, 12345);
        assert_eq!(reference.url, "http://localhost:12345");
        assert!(reference.tunnel().is_none());
    }

    #[tokio::test]
    async fn stopping_external_entry_drops_it() {
        let pool = pool();
        pool.register_external("chrome", 12345).await;
        assert_eq!(pool.stop_browser("chrome").await.unwrap(), 0);
        assert!(!pool.is_managed("chrome").await);
    }

    #[tokio::test]
    async fn release_all_tolerates_stopped_entries() {
        let pool = pool();
        let _ = pool.acquire("testingbot").await;
        // Nothing is running; release_all must still complete cleanly.
        pool.release_all().await;
    }
}
