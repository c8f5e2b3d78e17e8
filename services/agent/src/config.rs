//! Agent configuration.
//!
//! Everything comes from environment variables so the agent can run under a
//! supervisor without a config file.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Agent configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Local address to listen on (example: 127.0.0.1:3000).
    pub listen_addr: SocketAddr,

    /// Human-readable name of the forwarded service.
    pub name: String,

    /// Host the remote port lives on.
    pub remote_host: String,

    /// Remote port to expose.
    pub remote_port: u16,

    /// Connect timeout for each remote channel.
    pub connect_timeout: Duration,

    /// Per-direction copy buffer size.
    pub buffer_size: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("PORTFWD_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:0".to_string())
            .parse()
            .context("PORTFWD_LISTEN_ADDR must be a socket address (host:port).")?;

        let name = var("PORTFWD_NAME").unwrap_or_else(|| "forward".to_string());

        let remote_host = var("PORTFWD_REMOTE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let remote_port: u16 = var("PORTFWD_REMOTE_PORT")
            .context("Missing remote port. Set PORTFWD_REMOTE_PORT.")?
            .parse()
            .context("PORTFWD_REMOTE_PORT must be a port number.")?;

        let connect_timeout_ms: u64 = var("PORTFWD_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PORTFWD_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(50));

        let buffer_size: usize = var("PORTFWD_BUFFER_SIZE")
            .map(|v| v.parse())
            .transpose()
            .context("PORTFWD_BUFFER_SIZE must be an integer (bytes).")?
            .unwrap_or(portfwd::forwarder::DEFAULT_BUFFER_SIZE)
            .clamp(1024, 1024 * 1024);

        let log_level = var("PORTFWD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            name,
            remote_host,
            remote_port,
            connect_timeout,
            buffer_size,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("PORTFWD_REMOTE_PORT", "8080")]).unwrap();
        assert_eq!(config.remote_port, 8080);
        assert_eq!(config.name, "forward");
        assert_eq!(config.remote_host, "127.0.0.1");
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_remote_port_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("PORTFWD_REMOTE_PORT"));
    }

    #[test]
    fn test_clamps_values() {
        let config = load(&[
            ("PORTFWD_REMOTE_PORT", "5432"),
            ("PORTFWD_CONNECT_TIMEOUT_MS", "1"),
            ("PORTFWD_BUFFER_SIZE", "16"),
        ])
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(50));
        assert_eq!(config.buffer_size, 1024);
    }

    #[test]
    fn test_rejects_bad_listen_addr() {
        let err = load(&[
            ("PORTFWD_REMOTE_PORT", "5432"),
            ("PORTFWD_LISTEN_ADDR", "not-an-addr"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("PORTFWD_LISTEN_ADDR"));
    }
}
