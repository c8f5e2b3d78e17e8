//! Direct TCP session for development and loopback setups.
//!
//! Sharing a port records `host:port` as the target; each channel is a fresh
//! TCP connection to it. There is no multiplexing involved, which makes this
//! useful for exercising the forwarder against ordinary services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::debug;

use crate::session::{ChannelId, Session};

/// Default connect timeout for channel connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Target registered by `start_sharing`.
#[derive(Debug, Clone)]
struct SharedPort {
    name: String,
    target: String,
}

/// Session that opens channels as direct TCP connections.
pub struct DirectSession {
    /// Host the shared ports live on.
    host: String,
    /// Connect timeout for each channel.
    connect_timeout: Duration,
    /// Counter for generating channel IDs.
    next_id: AtomicU64,
    /// Shared ports keyed by channel ID.
    shared: RwLock<HashMap<ChannelId, SharedPort>>,
}

impl DirectSession {
    /// Create a session for ports on `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_timeout(host, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a session with a custom connect timeout.
    pub fn with_timeout(host: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            connect_timeout,
            next_id: AtomicU64::new(1),
            shared: RwLock::new(HashMap::new()),
        }
    }

    /// Number of ports shared so far.
    pub async fn shared_count(&self) -> usize {
        self.shared.read().await.len()
    }

    fn target_for(&self, remote_port: u16) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, remote_port)
        } else {
            format!("{}:{}", self.host, remote_port)
        }
    }
}

#[async_trait]
impl Session for DirectSession {
    type Channel = TcpStream;

    async fn start_sharing(&self, name: &str, remote_port: u16) -> Result<ChannelId> {
        if remote_port == 0 {
            return Err(anyhow!("port 0 cannot be shared"));
        }

        let id = ChannelId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let target = self.target_for(remote_port);
        debug!(name, target = %target, channel_id = %id, "Registered shared port");

        self.shared.write().await.insert(
            id,
            SharedPort {
                name: name.to_string(),
                target,
            },
        );
        Ok(id)
    }

    async fn open_streaming_channel(&self, id: &ChannelId) -> Result<TcpStream> {
        let port = self
            .shared
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown channel id {id}"))?;

        debug!(name = %port.name, target = %port.target, "Connecting channel");

        match timeout(self.connect_timeout, TcpStream::connect(port.target.as_str())).await {
            Ok(result) => result.with_context(|| format!("connect to {}", port.target)),
            Err(_) => Err(anyhow!("connect to {} timed out", port.target)),
        }
    }
}
