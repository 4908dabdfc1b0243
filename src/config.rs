use std::env;
use std::path::PathBuf;

/// Credentials for a cloud tunnel provider, resolved once at configuration
/// load time. The core state machines never read the environment directly.
#[derive(Clone, Debug)]
pub struct ProviderCredentials {
    pub username: String,
    pub access_key: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Address the reverse proxy binds to.
    pub bind: String,
    /// Path prefix the proxy serves under, e.g. `/wd/hub`.
    pub path_prefix: String,
    /// First port handed out to spawned driver processes.
    pub base_port: u16,
    /// How many failed spawns per browser kind before acquire fails permanently.
    pub max_start_attempts: u32,
    /// How many times a new-session request is retried against one process.
    pub max_connect_attempts: u32,
    /// Directory downloaded driver artifacts are installed into.
    pub install_dir: PathBuf,
    /// Ready delay for providers with no usable output signal.
    pub silent_startup_delay_ms: u64,
    pub credentials: Option<ProviderCredentials>,
}

impl Config {
    pub fn from_env() -> Self {
        let credentials = match (env::var("HUB_TUNNEL_USER"), env::var("HUB_TUNNEL_KEY")) {
            (Ok(username), Ok(access_key)) => Some(ProviderCredentials {
                username,
                access_key,
            }),
            _ => None,
        };

        Self {
            bind: env::var("HUB_BIND").unwrap_or_else(|_| "127.0.0.1:4444".to_string()),
            path_prefix: env::var("HUB_PATH_PREFIX").unwrap_or_else(|_| "/wd/hub".to_string()),
            base_port: env::var("HUB_BASE_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(9515),
            max_start_attempts: env::var("HUB_MAX_START_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            max_connect_attempts: env::var("HUB_MAX_CONNECT_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            install_dir: env::var("HUB_INSTALL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    env::temp_dir().join("webdriver-hub")
                }),
            silent_startup_delay_ms: env::var("HUB_SILENT_STARTUP_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5000),
            credentials,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.path_prefix.starts_with('/') {
            return Err(format!(
                "Invalid path prefix '{}'. Must start with '/'",
                self.path_prefix
            ));
        }

        if self.path_prefix.ends_with('/') {
            return Err(format!(
                "Invalid path prefix '{}'. Must not end with '/'",
                self.path_prefix
            ));
        }

        if self.base_port == 0 {
            return Err("Base port must be greater than 0".to_string());
        }

        if self.max_connect_attempts == 0 {
            return Err("Max connect attempts must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4444".to_string(),
            path_prefix: "/wd/hub".to_string(),
            base_port: 9515,
            max_start_attempts: 3,
            max_connect_attempts: 3,
            install_dir: env::temp_dir().join("webdriver-hub"),
            silent_startup_delay_ms: 5000,
            credentials: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_prefix_without_leading_slash() {
        let config = Config {
            path_prefix: "wd/hub".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_trailing_slash_prefix() {
        let config = Config {
            path_prefix: "/wd/hub/".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_connect_attempts() {
        let config = Config {
            max_connect_attempts: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
