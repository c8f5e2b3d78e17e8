//! Port forwarder: the accept/dispatch loop and per-connection relay.
//!
//! ## Architecture
//!
//! ```text
//! Listener -> accept loop -> handler task (per connection) -> Session channel
//!                 |                 |
//!                 +----> error slot <----+  (first error wins)
//! ```
//!
//! Both entry points announce the remote port once, then hand each local
//! connection to its own handler task. A handler opens a channel, copies bytes
//! in both directions until the token is cancelled, then closes both streams.

use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::error::{ForwardError, Result, StreamSide};
use crate::listener::ConnectionListener;
use crate::session::{ChannelId, DuplexStream, Session};
use crate::slot::{error_slot, ErrorReporter};

/// Default per-direction copy buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default upper bound on closing one stream.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tuning knobs for a forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Buffer size used by each copy direction.
    pub buffer_size: usize,
    /// How long closing a single stream may take before it counts as failed.
    ///
    /// A failed or timed-out close is logged. It is only returned when no
    /// earlier outcome exists, and every handler records cancellation or a
    /// channel-open failure before closing, so in practice it never is.
    pub close_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Statistics for a forwarder.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    /// Connections handed to a handler (accepted or supplied).
    pub connections_accepted: AtomicU64,
    /// Handlers currently running.
    pub connections_active: AtomicU64,
    /// Handlers that finished and closed their streams.
    pub connections_closed: AtomicU64,
    /// Remote channels successfully opened.
    pub channels_opened: AtomicU64,
    /// Remote channel open failures.
    pub channel_open_failures: AtomicU64,
    /// Bytes copied from local connections to remote channels.
    pub bytes_to_remote: AtomicU64,
    /// Bytes copied from remote channels to local connections.
    pub bytes_from_remote: AtomicU64,
    /// Error reports discarded because the slot was already resolved.
    pub errors_dropped: AtomicU64,
}

/// Forwards connections to one remote port exposed through a session.
///
/// The session is owned elsewhere; the forwarder only holds a shared handle
/// and never shuts it down. Cloning is cheap and clones share statistics.
pub struct PortForwarder<S: Session> {
    session: Arc<S>,
    name: Arc<str>,
    remote_port: u16,
    config: ForwarderConfig,
    stats: Arc<ForwarderStats>,
}

impl<S: Session> Clone for PortForwarder<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            name: Arc::clone(&self.name),
            remote_port: self.remote_port,
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: Session> PortForwarder<S> {
    /// Create a forwarder for `remote_port`. `name` describes the forwarded service.
    pub fn new(session: Arc<S>, name: impl Into<String>, remote_port: u16) -> Self {
        Self::with_config(session, name, remote_port, ForwarderConfig::default())
    }

    /// Create a forwarder with custom tuning.
    pub fn with_config(
        session: Arc<S>,
        name: impl Into<String>,
        remote_port: u16,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            session,
            name: Arc::from(name.into()),
            remote_port,
            config,
            stats: Arc::new(ForwarderStats::default()),
        }
    }

    /// Name of the forwarded service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote port being exposed.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Get forwarder statistics.
    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    /// Tuning this forwarder was built with.
    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Wait until no handler is running, for at most `limit`.
    ///
    /// Handlers keep closing their streams after an entry point returns, so
    /// callers that exit afterwards should wait here first. Returns `false` if
    /// handlers were still active when the limit expired.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let idle = async {
            while self.stats.connections_active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(limit, idle).await.is_ok()
    }

    /// Forward every connection accepted on `listener` to the remote port.
    ///
    /// The listener must already be bound; the caller keeps ownership of it.
    /// Runs until the token is cancelled or the first terminating error from
    /// the accept loop or any connection handler, and returns that reason.
    /// Handlers still running at that point wind down once the token is
    /// cancelled, so callers should cancel it after this returns.
    pub async fn forward_to_listener<L>(
        &self,
        cancel: &CancellationToken,
        listener: &L,
    ) -> ForwardError
    where
        L: ConnectionListener,
    {
        let id = match self.share_remote_port(cancel).await {
            Ok(id) => id,
            Err(e) => return e,
        };

        let (reporter, receiver) = error_slot(Arc::clone(&self.stats));
        let accept_loop = self.accept_loop(cancel, listener, id, reporter);

        tokio::select! {
            err = receiver.wait(cancel) => err,
            never = accept_loop => match never {},
        }
    }

    /// Forward a single duplex stream to the remote port.
    ///
    /// The stream is always closed by the time forwarding for it ends, even
    /// when the port cannot be shared. Returns the handler's terminating error,
    /// or [`ForwardError::Cancelled`] if the token fires first.
    pub async fn forward<C>(&self, cancel: &CancellationToken, conn: C) -> ForwardError
    where
        C: DuplexStream,
    {
        let id = match self.share_remote_port(cancel).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(close_err) = close_stream(conn, self.config.close_timeout).await {
                    debug!(error = %close_err, "Closing unforwarded stream failed");
                }
                return e;
            }
        };

        let (reporter, receiver) = error_slot(Arc::clone(&self.stats));
        self.spawn_handler(cancel, id, conn, "stream".to_string(), reporter);

        receiver.wait(cancel).await
    }

    /// Announce the remote port to the session.
    async fn share_remote_port(&self, cancel: &CancellationToken) -> Result<ChannelId> {
        let shared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
            shared = self.session.start_sharing(&self.name, self.remote_port) => shared,
        };

        match shared {
            Ok(id) => {
                info!(
                    name = %self.name,
                    remote_port = self.remote_port,
                    channel_id = %id,
                    "Remote port shared"
                );
                Ok(id)
            }
            Err(source) => {
                warn!(
                    name = %self.name,
                    remote_port = self.remote_port,
                    error = %source,
                    "Failed to share remote port"
                );
                Err(ForwardError::Share {
                    port: self.remote_port,
                    source,
                })
            }
        }
    }

    /// Accept connections until the listener fails, dispatching each to a
    /// handler task. The accept error goes through the slot like any other.
    async fn accept_loop<L>(
        &self,
        cancel: &CancellationToken,
        listener: &L,
        id: ChannelId,
        reporter: ErrorReporter,
    ) -> Infallible
    where
        L: ConnectionListener,
    {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    debug!(peer = %peer, channel_id = %id, "Accepted connection");
                    self.spawn_handler(cancel, id, conn, peer, reporter.clone());
                }
                Err(e) => {
                    warn!(error = %e, "Accept error, stopping accept loop");
                    reporter.report(ForwardError::Accept(e));
                    break;
                }
            }
        }

        // Stay pending so the reporter remains alive until the caller returns.
        std::future::pending().await
    }

    fn spawn_handler<C>(
        &self,
        cancel: &CancellationToken,
        id: ChannelId,
        conn: C,
        peer: String,
        reporter: ErrorReporter,
    ) where
        C: DuplexStream,
    {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let fwd = self.clone();
        let cancel = cancel.clone();
        let span = tracing::info_span!("connection", peer = %peer, channel_id = %id);

        tokio::spawn(
            async move {
                let err = fwd.handle_connection(&cancel, id, conn).await;
                if err.is_cancelled() {
                    debug!("Connection handler stopped on cancellation");
                } else {
                    warn!(error = %err, reason = err.reason_code(), "Connection handler failed");
                }

                fwd.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                fwd.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                reporter.report(err);
            }
            .instrument(span),
        );
    }

    /// Handle one connection: open a channel, relay until cancelled, close both.
    ///
    /// The returned error is the first of: channel-open failure, cancellation,
    /// first recorded close error. Each stream is shut down exactly once on
    /// every path, either by the copy that reached EOF or by the final close.
    async fn handle_connection<C>(
        &self,
        cancel: &CancellationToken,
        id: ChannelId,
        conn: C,
    ) -> ForwardError
    where
        C: DuplexStream,
    {
        let mut outcome: Option<ForwardError> = None;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForwardError::Cancelled),
            opened = self.session.open_streaming_channel(&id) => {
                opened.map_err(ForwardError::OpenChannel)
            }
        };

        let conn = match opened {
            Ok(channel) => {
                self.stats.channels_opened.fetch_add(1, Ordering::Relaxed);
                debug!("Streaming channel opened");

                let relayed = self.relay(cancel, conn, channel).await;
                record(&mut outcome, ForwardError::Cancelled);

                // A direction that hit EOF already shut its destination down;
                // that counts as the close, so the stream is only dropped.
                if !relayed.remote_closed {
                    if let Err(e) = close_remote(relayed.channel, self.config.close_timeout).await
                    {
                        record(&mut outcome, e);
                    }
                }
                (!relayed.local_closed).then_some(relayed.conn)
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.stats
                        .channel_open_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
                record(&mut outcome, e);
                Some(conn)
            }
        };

        if let Some(conn) = conn {
            if let Err(source) = close_stream(conn, self.config.close_timeout).await {
                record(
                    &mut outcome,
                    ForwardError::Close {
                        side: StreamSide::Local,
                        source,
                    },
                );
            }
        }

        outcome.unwrap_or(ForwardError::Cancelled)
    }

    /// Copy in both directions until the token is cancelled, then hand both
    /// streams back for closing. The copies are abandoned together.
    async fn relay<C, R>(&self, cancel: &CancellationToken, conn: C, channel: R) -> Relayed<C, R>
    where
        C: DuplexStream,
        R: DuplexStream,
    {
        let (mut local_read, mut local_write) = tokio::io::split(conn);
        let (mut remote_read, mut remote_write) = tokio::io::split(channel);
        let mut remote_closed = false;
        let mut local_closed = false;

        {
            let buffer_size = self.config.buffer_size;
            let to_remote = copy_direction(
                &mut local_read,
                &mut remote_write,
                buffer_size,
                &self.stats.bytes_to_remote,
                &mut remote_closed,
            );
            let from_remote = copy_direction(
                &mut remote_read,
                &mut local_write,
                buffer_size,
                &self.stats.bytes_from_remote,
                &mut local_closed,
            );

            let copies = async {
                let (to_remote, from_remote) = tokio::join!(to_remote, from_remote);
                // Copy errors are left to the endpoints' own protocols.
                match (&to_remote, &from_remote) {
                    (Ok(sent), Ok(received)) => {
                        debug!(
                            bytes_to_remote = sent,
                            bytes_from_remote = received,
                            "Both directions finished"
                        );
                    }
                    _ => {
                        debug!(
                            to_remote = ?to_remote.as_ref().err(),
                            from_remote = ?from_remote.as_ref().err(),
                            "Copy direction ended with error"
                        );
                    }
                }
                std::future::pending::<()>().await
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = copies => {}
            }
        }

        Relayed {
            conn: local_read.unsplit(local_write),
            channel: remote_read.unsplit(remote_write),
            local_closed,
            remote_closed,
        }
    }
}

/// Streams handed back by a finished relay.
struct Relayed<C, R> {
    conn: C,
    channel: R,
    /// The remote-to-local copy already shut the local connection down.
    local_closed: bool,
    /// The local-to-remote copy already shut the remote channel down.
    remote_closed: bool,
}

/// Store `err` unless an earlier outcome was already recorded.
fn record(outcome: &mut Option<ForwardError>, err: ForwardError) {
    match outcome {
        Some(first) => {
            if !err.is_cancelled() {
                debug!(error = %err, first = %first, "Discarding later handler error");
            }
        }
        None => *outcome = Some(err),
    }
}

/// Copy `reader` into `writer` until EOF, then shut the writer down.
///
/// `shut_down` is set as soon as the shutdown is issued, whatever its result,
/// so the caller never closes the same stream a second time.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &AtomicU64,
    shut_down: &mut bool,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
    *shut_down = true;
    writer.shutdown().await?;
    Ok(total)
}

/// Shut a stream down within `timeout`, then drop it.
async fn close_stream<T>(mut stream: T, timeout: Duration) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, stream.shutdown()).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "close timed out")),
    }
}

/// Close a remote channel. Some transports report `UnexpectedEof` from close
/// when the peer closed first; that case counts as a clean close.
async fn close_remote<T>(channel: T, timeout: Duration) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    match close_stream(channel, timeout).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!("Ignoring EOF reported by remote channel close");
            Ok(())
        }
        Err(source) => Err(ForwardError::Close {
            side: StreamSide::Remote,
            source,
        }),
    }
}
