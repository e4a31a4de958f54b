#![deny(unsafe_code)]

//! rigd orchestration engine.
//!
//! Turns raw peripheral I/O into shared state that downstream consumers
//! (visualization, voice/text interfaces, behavior logic) read and act upon.
//! One daemon task owns each attached peripheral; the [`state::WorldState`]
//! and [`bus::EventBus`] are the only synchronization points between them.
//! Failure isolation is per peripheral: a [`breaker::CircuitBreaker`] keeps a
//! wedged device from being hammered, and a [`transport::TransportGuard`]
//! keeps two writers off the same physical channel.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the standard return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits produces opaque return types that are **not**
/// object-safe. Traits consumed via `Box<dyn Trait>` or `&dyn Trait` must
/// return a concrete `Pin<Box<dyn Future>>` instead. This alias keeps those
/// signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Publish/subscribe event bus with bounded, drop-oldest buffering.
pub mod bus;
/// Per-peripheral circuit breaker (closed → open → half-open).
pub mod breaker;
/// Command dispatch and lifecycle tracking.
pub mod command;
/// Generic peripheral-daemon lifecycle runner.
pub mod daemon;
/// Concrete peripheral drivers (closed set).
pub mod daemons;
/// Hardware discovery, daemon factory, and group supervision.
pub mod manager;
/// Peripheral descriptors, kinds, and readings.
pub mod peripheral;
/// Versioned, path-addressed shared world state.
pub mod state;
/// Exclusive transport locking and the line-oriented wire protocol.
pub mod transport;

pub use breaker::{BreakerState, CircuitBreaker};
pub use bus::{Event, EventBus, Subscription};
pub use command::{ActionCommand, CommandDispatcher, CommandId, CommandState, CommandTracker};
pub use daemon::{DaemonHandle, DaemonState, PeripheralDriver};
pub use manager::{DaemonManager, DiscoveryProbe, TransportFactory};
pub use peripheral::{PeripheralDescriptor, PeripheralKind, Reading};
pub use state::WorldState;
pub use transport::{Transport, TransportError, TransportGuard};
