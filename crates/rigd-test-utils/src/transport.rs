//! Scripted mock hardware.
//!
//! [`MockHub`] stands in for the serial/USB layer: each peripheral name maps
//! to a scripted line channel that answers requests from a reply table,
//! records everything sent, and can be killed mid-test to simulate an
//! unplugged cable.
//!
//! An unscripted request leaves the reply queue empty, so the next receive
//! reports a timed-out read, the same shape a silent device produces.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rigd_core::manager::TransportFactory;
use rigd_core::peripheral::PeripheralDescriptor;
use rigd_core::transport::{Transport, TransportError};
use rigd_core::BoxFuture;

#[derive(Default)]
struct Inner {
    /// One-shot reply batches, consumed front-first per request line.
    queued: HashMap<String, VecDeque<Vec<String>>>,
    /// Repeatable replies, used when no one-shot batch is queued.
    canned: HashMap<String, Vec<String>>,
    /// Lines waiting to be received.
    pending: VecDeque<String>,
    /// Every line sent to the device, in order.
    sent: Vec<String>,
    /// Simulates an unplugged cable: all I/O fails until revived.
    dead: bool,
    /// Added before every receive.
    latency: Duration,
}

/// Test-side control over one mock channel.
///
/// Cloning is cheap; all clones script the same channel.
#[derive(Clone, Default)]
pub struct MockTransportHandle {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransportHandle {
    /// Script a one-shot reply batch for `request`. Queued batches are
    /// consumed in order, before any repeatable reply.
    pub fn reply_once<I, S>(&self, request: &str, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let batch: Vec<String> = replies.into_iter().map(Into::into).collect();
        self.inner
            .lock()
            .expect("mock transport lock poisoned")
            .queued
            .entry(request.to_string())
            .or_default()
            .push_back(batch);
    }

    /// Script a repeatable reply for `request`, returned on every match.
    pub fn reply_with<I, S>(&self, request: &str, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let batch: Vec<String> = replies.into_iter().map(Into::into).collect();
        self.inner
            .lock()
            .expect("mock transport lock poisoned")
            .canned
            .insert(request.to_string(), batch);
    }

    /// Queue a raw line for the next receive, bypassing the reply table.
    pub fn push_line(&self, line: &str) {
        self.inner
            .lock()
            .expect("mock transport lock poisoned")
            .pending
            .push_back(line.to_string());
    }

    /// Every line sent so far, in order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("mock transport lock poisoned")
            .sent
            .clone()
    }

    /// Fail all subsequent I/O, as if the cable were pulled.
    pub fn kill(&self) {
        self.inner
            .lock()
            .expect("mock transport lock poisoned")
            .dead = true;
    }

    /// Undo [`kill`](Self::kill).
    pub fn revive(&self) {
        self.inner
            .lock()
            .expect("mock transport lock poisoned")
            .dead = false;
    }

    /// Delay every receive by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .lock()
            .expect("mock transport lock poisoned")
            .latency = latency;
    }
}

/// The device side of a scripted channel.
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl Transport for MockTransport {
    fn send_line<'a>(&'a mut self, line: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("mock transport lock poisoned");
            if inner.dead {
                return Err(TransportError::Failure(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "mock transport killed",
                )));
            }
            inner.sent.push(line.to_string());

            let batch = match inner.queued.get_mut(line).and_then(VecDeque::pop_front) {
                Some(batch) => Some(batch),
                None => inner.canned.get(line).cloned(),
            };
            if let Some(batch) = batch {
                inner.pending.extend(batch);
            }
            Ok(())
        })
    }

    fn recv_line(&mut self) -> BoxFuture<'_, Result<String, TransportError>> {
        Box::pin(async move {
            let latency = self
                .inner
                .lock()
                .expect("mock transport lock poisoned")
                .latency;
            if latency > Duration::ZERO {
                tokio::time::sleep(latency).await;
            }

            let mut inner = self.inner.lock().expect("mock transport lock poisoned");
            if inner.dead {
                return Err(TransportError::Failure(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "mock transport killed",
                )));
            }
            match inner.pending.pop_front() {
                Some(line) => Ok(line),
                // A silent device looks like a read timeout.
                None => Err(TransportError::Failure(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no scripted reply",
                ))),
            }
        })
    }
}

#[derive(Default)]
struct HubInner {
    handles: HashMap<String, MockTransportHandle>,
    unopenable: HashSet<String>,
}

/// Mock transport factory keyed by peripheral name.
///
/// Re-opening the same name (after re-discovery, say) shares the original
/// channel state, so scripts written before a reconnect still apply.
#[derive(Clone, Default)]
pub struct MockHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MockHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// The scripting handle for `name`, created on first use.
    pub fn handle(&self, name: &str) -> MockTransportHandle {
        self.inner
            .lock()
            .expect("mock hub lock poisoned")
            .handles
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Make every open attempt for `name` fail.
    pub fn set_unopenable(&self, name: &str) {
        self.inner
            .lock()
            .expect("mock hub lock poisoned")
            .unopenable
            .insert(name.to_string());
    }
}

impl TransportFactory for MockHub {
    fn open<'a>(
        &'a self,
        descriptor: &'a PeripheralDescriptor,
    ) -> BoxFuture<'a, Result<Box<dyn Transport>, TransportError>> {
        Box::pin(async move {
            let handle = {
                let mut inner = self.inner.lock().expect("mock hub lock poisoned");
                if inner.unopenable.contains(&descriptor.name) {
                    return Err(TransportError::Failure(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no such device: {}", descriptor.address),
                    )));
                }
                inner
                    .handles
                    .entry(descriptor.name.clone())
                    .or_default()
                    .clone()
            };
            Ok(Box::new(MockTransport {
                inner: handle.inner,
            }) as Box<dyn Transport>)
        })
    }
}
