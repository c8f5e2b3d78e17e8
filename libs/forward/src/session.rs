//! Session capability consumed by the forwarder.
//!
//! A session is an already established, multiplexed connection to the far
//! side. The forwarder only needs two things from it:
//! - announce a remote port under a logical name
//! - open a new virtual channel against a previously announced port
//!
//! Authentication and the multiplexing protocol live behind this trait.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Opaque token correlating channel-open requests with a shared remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Wrap a raw identifier handed out by a session.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan_{:08x}", self.0)
    }
}

/// Duplex byte stream usable on either side of a forward.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> DuplexStream for T {}

/// Session interface.
///
/// Implementations are shared across every connection handler of a
/// forwarder, so both calls take `&self`. The forwarder bounds each call with
/// its cancellation token; implementations need not watch for cancellation.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Stream type of an opened channel.
    type Channel: DuplexStream;

    /// Register intent to expose `remote_port` under `name`.
    async fn start_sharing(&self, name: &str, remote_port: u16) -> Result<ChannelId>;

    /// Open one virtual connection against a shared port.
    async fn open_streaming_channel(&self, id: &ChannelId) -> Result<Self::Channel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_display() {
        assert_eq!(ChannelId::new(0x2a).to_string(), "chan_0000002a");
        assert_eq!(ChannelId::new(7).get(), 7);
    }
}
