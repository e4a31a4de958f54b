//! Exclusive access to one physical communication channel.
//!
//! Serial and USB channels are inherently single-writer: interleaved writes
//! corrupt framing at the hardware level, not just at the protocol level.
//! [`TransportGuard`] wraps exactly one channel behind an async mutex with a
//! bounded acquire timeout; the [`TransportPermit`] it hands out releases the
//! channel on every exit path — normal return, error, or task cancellation —
//! through ordinary RAII.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::BoxFuture;

/// Wire-protocol codec for microcontroller-class peripherals.
pub mod wire;

/// Transport-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Exclusive ownership could not be obtained within the timeout.
    #[error("transport contention: channel not acquired within {0:?}")]
    Contention(Duration),

    /// I/O error on an open channel (includes per-operation timeouts).
    #[error("transport failure: {0}")]
    Failure(#[from] std::io::Error),

    /// The peripheral's response does not match the expected wire format.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The channel is closed (peripheral detached or transport shut down).
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Short classification used in status fields and command error details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Contention(_) => "contention",
            Self::Failure(_) => "failure",
            Self::Protocol(_) => "protocol",
            Self::Closed => "closed",
        }
    }
}

/// One physical channel carrying newline-terminated lines.
///
/// Implementations live outside the engine (a char-device transport in the
/// CLI, a scripted mock in the test utilities) and are injected through the
/// manager's transport factory. Methods take `&mut self`: exclusivity is the
/// guard's job, not the implementation's.
pub trait Transport: Send {
    /// Send one line (without the trailing newline).
    fn send_line<'a>(&'a mut self, line: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Receive one line (without the trailing newline).
    fn recv_line(&mut self) -> BoxFuture<'_, Result<String, TransportError>>;
}

/// Mutual-exclusion wrapper around one [`Transport`].
///
/// Each peripheral daemon exclusively owns its guard; two concurrent acquire
/// attempts are serialized, and a caller that cannot acquire within the
/// timeout gets [`TransportError::Contention`] instead of hanging.
#[derive(Clone)]
pub struct TransportGuard {
    channel: Arc<Mutex<Box<dyn Transport>>>,
    acquire_timeout: Duration,
    io_timeout: Duration,
}

impl TransportGuard {
    /// Wrap a transport with the given acquire and per-operation timeouts.
    pub fn new(transport: Box<dyn Transport>, acquire_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            channel: Arc::new(Mutex::new(transport)),
            acquire_timeout,
            io_timeout,
        }
    }

    /// Obtain exclusive ownership of the channel.
    ///
    /// Blocks up to the acquire timeout; contention past that is reported as
    /// an error, never silent interleaving or an indefinite wait.
    pub async fn acquire(&self) -> Result<TransportPermit, TransportError> {
        let lock = Arc::clone(&self.channel).lock_owned();
        match tokio::time::timeout(self.acquire_timeout, lock).await {
            Ok(guard) => {
                trace!("transport acquired");
                Ok(TransportPermit {
                    guard,
                    io_timeout: self.io_timeout,
                })
            }
            Err(_) => Err(TransportError::Contention(self.acquire_timeout)),
        }
    }
}

/// Scoped exclusive ownership of a channel.
///
/// Dropping the permit releases the channel exactly once, including when the
/// owning future is cancelled mid-operation.
pub struct TransportPermit {
    guard: OwnedMutexGuard<Box<dyn Transport>>,
    io_timeout: Duration,
}

impl TransportPermit {
    /// Send one line, bounded by the I/O timeout.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        match tokio::time::timeout(self.io_timeout, self.guard.send_line(line)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("write timed out after {:?}", self.io_timeout),
            )
            .into()),
        }
    }

    /// Receive one line, bounded by the I/O timeout.
    pub async fn recv_line(&mut self) -> Result<String, TransportError> {
        match tokio::time::timeout(self.io_timeout, self.guard.recv_line()).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("read timed out after {:?}", self.io_timeout),
            )
            .into()),
        }
    }

    /// Receive one line with a caller-chosen timeout (long-running actions
    /// such as frequency scans report progress slower than ordinary reads).
    pub async fn recv_line_within(&mut self, timeout: Duration) -> Result<String, TransportError> {
        match tokio::time::timeout(timeout, self.guard.recv_line()).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("read timed out after {timeout:?}"),
            )
            .into()),
        }
    }

    /// Send a request line and read the single reply line.
    pub async fn request(&mut self, line: &str) -> Result<String, TransportError> {
        self.send_line(line).await?;
        self.recv_line().await
    }
}
