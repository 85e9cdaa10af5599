//! Bidirectional byte forwarding between the two legs of a connection.
//!
//! Each direction runs in its own task. When one direction reaches EOF its
//! destination is half-closed and the other direction gets the close grace
//! period to finish before it is aborted. Errors and idle timeouts end both
//! directions at once.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace};

use super::context::TrafficCounters;
use crate::error::ProxyError;
use crate::events::CloseReason;

const BUFFER_SIZE: usize = 16 * 1024;

/// Forwarding knobs.
#[derive(Debug, Clone, Copy)]
pub struct ForwardSettings {
    /// Close both halves after this long without traffic in either direction.
    pub idle_timeout: Option<Duration>,
    /// How long the second direction may run after the first hit EOF.
    pub close_grace: Duration,
}

/// How one direction ended.
#[derive(Debug)]
enum PumpEnd {
    Eof,
    Idle,
    Failed(io::Error),
}

/// Last time any byte moved, shared by both directions.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

fn is_eof(err: &io::Error) -> bool {
    // Peers that close without close_notify.
    err.kind() == io::ErrorKind::UnexpectedEof
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counter: Arc<TrafficCounters>,
    inbound: bool,
    activity: Arc<Activity>,
    idle_timeout: Option<Duration>,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let bytes = if inbound {
        &counter.bytes_in
    } else {
        &counter.bytes_out
    };

    loop {
        let read = match idle_timeout {
            Some(limit) => {
                let remaining = limit.saturating_sub(activity.idle_for());
                if remaining.is_zero() {
                    return PumpEnd::Idle;
                }
                match tokio::time::timeout(remaining, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    // Re-check: the other direction may have moved bytes.
                    Err(_) => continue,
                }
            }
            None => reader.read(&mut buf).await,
        };

        match read {
            Ok(0) => {
                // Half-close so the far side sees EOF too.
                let _ = writer.shutdown().await;
                return PumpEnd::Eof;
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return PumpEnd::Failed(e);
                }
                if let Err(e) = writer.flush().await {
                    return PumpEnd::Failed(e);
                }
                bytes.fetch_add(n as u64, Ordering::Relaxed);
                activity.touch();
                trace!(bytes = n, inbound, "forwarded");
            }
            Err(e) if is_eof(&e) => {
                let _ = writer.shutdown().await;
                return PumpEnd::Eof;
            }
            Err(e) => return PumpEnd::Failed(e),
        }
    }
}

fn joined(result: Result<PumpEnd, JoinError>) -> PumpEnd {
    result.unwrap_or_else(|e| PumpEnd::Failed(io::Error::new(io::ErrorKind::Other, e)))
}

/// Copy bytes between `accepted` and `target` until both directions end.
///
/// Returns the close reason, or [`ProxyError::ForwardingIo`] when a
/// direction failed with an I/O error.
///
/// # Errors
///
/// See above. A cancelled `cancel` token yields `Ok(CloseReason::Shutdown)`.
pub async fn forward<A, B>(
    accepted: A,
    target: B,
    counters: Arc<TrafficCounters>,
    settings: ForwardSettings,
    cancel: CancellationToken,
) -> Result<CloseReason, ProxyError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (accepted_read, accepted_write) = tokio::io::split(accepted);
    let (target_read, target_write) = tokio::io::split(target);
    let activity = Arc::new(Activity::new());

    // Pumps die with this future, even if the caller drops it mid-copy.
    let mut inbound = AbortOnDropHandle::new(tokio::spawn(pump(
        accepted_read,
        target_write,
        counters.clone(),
        true,
        activity.clone(),
        settings.idle_timeout,
    )));
    let mut outbound = AbortOnDropHandle::new(tokio::spawn(pump(
        target_read,
        accepted_write,
        counters,
        false,
        activity,
        settings.idle_timeout,
    )));

    let (first, mut other) = tokio::select! {
        result = &mut inbound => (joined(result), outbound),
        result = &mut outbound => (joined(result), inbound),
        () = cancel.cancelled() => {
            inbound.abort();
            outbound.abort();
            return Ok(CloseReason::Shutdown);
        }
    };

    match first {
        PumpEnd::Eof => {}
        PumpEnd::Idle => {
            other.abort();
            return Ok(CloseReason::IdleTimeout);
        }
        PumpEnd::Failed(e) if is_disconnect(&e) => {
            debug!(error = %e, "peer disconnected");
            other.abort();
            return Ok(CloseReason::Completed);
        }
        PumpEnd::Failed(e) => {
            other.abort();
            return Err(ProxyError::ForwardingIo(e));
        }
    }

    tokio::select! {
        result = tokio::time::timeout(settings.close_grace, &mut other) => match result {
            Ok(result) => match joined(result) {
                PumpEnd::Eof => Ok(CloseReason::Completed),
                PumpEnd::Idle => Ok(CloseReason::IdleTimeout),
                PumpEnd::Failed(e) if is_disconnect(&e) => Ok(CloseReason::Completed),
                PumpEnd::Failed(e) => Err(ProxyError::ForwardingIo(e)),
            },
            Err(_) => {
                debug!(grace = ?settings.close_grace, "close grace elapsed, aborting");
                other.abort();
                Ok(CloseReason::Completed)
            }
        },
        () = cancel.cancelled() => {
            other.abort();
            Ok(CloseReason::Shutdown)
        }
    }
}
