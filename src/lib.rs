//! Non-blocking, single-threaded, multi-connection network I/O multiplexing
//! library. The [`Selector`] owns a set of TCP connections, each addressed by
//! an opaque string id, and drives all of them through a single [`Selector::poll`]
//! call: completing connects, advancing transport handshakes, moving
//! size-delimited frames ([`FrameSend`], [`FrameReceive`]) in both directions
//! and reaping connections which stayed idle for too long.
//!
//! Completed I/O is batched into per-poll result lists which stay valid until
//! the next `poll` call.
//!
//! The selector is intentionally not thread-safe: all of its methods must be
//! called from the thread owning it. The only cross-thread entry point is the
//! [`Waker`] handle, which interrupts a blocking poll.

#[macro_use]
extern crate amplify;

pub mod poller;
mod channel;
mod clock;
mod frame;
mod lru;
mod metrics;
mod nonblock;
mod selector;
mod transport;

pub use channel::{Channel, ChannelBuilder, NetChannel, PlaintextBuilder, SetSendError};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use frame::{FrameReceive, FrameSend};
pub use metrics::{MetricName, Metrics, Sensor, Stat};
pub use nonblock::{IoStatus, ReadNonblocking, WriteNonblocking};
pub use selector::{Error, Selector, SelectorConfig, Waker};
pub use transport::{PlaintextTransport, Transport};
