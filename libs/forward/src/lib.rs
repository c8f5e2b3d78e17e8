//! Connection forwarding over shared remote ports.
//!
//! This library relays byte streams between local endpoints and a remote
//! port reachable only through an established multiplexed session:
//! - Listener mode: every connection accepted on a bound listener gets its own
//!   remote channel
//! - Stream mode: a single caller-supplied duplex stream is forwarded
//!
//! ## Usage
//!
//! ```ignore
//! use portfwd::{DirectSession, PortForwarder};
//! use tokio_util::sync::CancellationToken;
//!
//! let session = Arc::new(DirectSession::new("127.0.0.1"));
//! let forwarder = PortForwarder::new(session, "web", 8080);
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//!
//! let cancel = CancellationToken::new();
//! let reason = forwarder.forward_to_listener(&cancel, &listener).await;
//! cancel.cancel();
//! ```
//!
//! ## Modules
//!
//! - `session`: the session capability the forwarder consumes
//! - `forwarder`: accept loop, connection handler, bidirectional relay
//! - `listener`: listeners the forwarder can accept from
//! - `mock`, `direct`: session implementations for tests and development

pub mod direct;
pub mod error;
pub mod forwarder;
pub mod listener;
pub mod mock;
pub mod session;

mod slot;

pub use direct::DirectSession;
pub use error::{ForwardError, Result, StreamSide};
pub use forwarder::{ForwarderConfig, ForwarderStats, PortForwarder};
pub use listener::ConnectionListener;
pub use mock::MockSession;
pub use session::{ChannelId, DuplexStream, Session};
