//! In-memory session for testing and development.
//!
//! Channels are `tokio::io::duplex` pairs: the forwarder gets one end, the
//! other end is queued for the test to play the remote service.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::session::{ChannelId, Session};

/// Capacity of each in-memory channel pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Mock session.
pub struct MockSession {
    /// Counter for generating channel IDs.
    next_id: AtomicU64,
    /// Number of `start_sharing` calls.
    shares: AtomicU64,
    /// Number of successful `open_streaming_channel` calls.
    opens: AtomicU64,
    /// Whether sharing should fail.
    fail_sharing: bool,
    /// Whether opening channels should fail.
    fail_opens: bool,
    /// Remote ends of opened channels.
    remote_tx: mpsc::UnboundedSender<DuplexStream>,
    remote_rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl MockSession {
    /// Create a mock session where every call succeeds.
    pub fn new() -> Self {
        Self::build(false, false)
    }

    /// Create a mock session that rejects every `start_sharing`.
    pub fn failing_share() -> Self {
        Self::build(true, false)
    }

    /// Create a mock session that shares ports but cannot open channels.
    pub fn failing_open() -> Self {
        Self::build(false, true)
    }

    fn build(fail_sharing: bool, fail_opens: bool) -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicU64::new(1),
            shares: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            fail_sharing,
            fail_opens,
            remote_tx,
            remote_rx: Mutex::new(remote_rx),
        }
    }

    /// Number of times a port was announced.
    pub fn share_count(&self) -> u64 {
        self.shares.load(Ordering::SeqCst)
    }

    /// Number of channels opened.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Wait for the remote end of the next opened channel.
    pub async fn next_remote(&self) -> Option<DuplexStream> {
        self.remote_rx.lock().await.recv().await
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for MockSession {
    type Channel = DuplexStream;

    async fn start_sharing(&self, name: &str, remote_port: u16) -> Result<ChannelId> {
        self.shares.fetch_add(1, Ordering::SeqCst);
        if self.fail_sharing {
            anyhow::bail!("[MOCK] session rejected sharing of port {remote_port}");
        }

        let id = ChannelId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(name, remote_port, channel_id = %id, "[MOCK] Port shared");
        Ok(id)
    }

    async fn open_streaming_channel(&self, id: &ChannelId) -> Result<DuplexStream> {
        if self.fail_opens {
            anyhow::bail!("[MOCK] no streaming channel for {id}");
        }

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.remote_tx
            .send(far)
            .map_err(|_| anyhow::anyhow!("[MOCK] remote end receiver dropped"))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(channel_id = %id, "[MOCK] Streaming channel opened");
        Ok(near)
    }
}
