// Non-blocking multi-connection I/O multiplexing library.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::{Channel, ChannelBuilder, SetSendError};
use crate::clock::Clock;
use crate::frame::{FrameReceive, FrameSend};
use crate::lru::LruTracker;
use crate::metrics::{MetricName, Metrics, Sensor, Stat};
use crate::poller::{IoType, Poll};

/// Selector errors.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// there is already a connection with id {0}
    DuplicateId(String),

    /// no open connection with id {0}
    NoSuchConnection(String),

    /// a send is already in flight for connection {0}
    SendInProgress(String),

    /// I/O failure in the selector. Details: {0}
    #[from]
    Io(io::Error),
}

/// Construction-time selector configuration.
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Largest frame accepted from a peer; `None` lifts the limit.
    pub max_receive_size: Option<usize>,
    /// Connections idle for longer than this get reaped.
    pub connection_max_idle: Duration,
    /// Prefix for the metric group names.
    pub metric_group_prefix: String,
    /// Tags attached to every registered metric.
    pub metric_tags: Vec<(String, String)>,
    /// Whether to maintain per-connection sensors alongside the aggregate
    /// ones.
    pub metrics_per_connection: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            max_receive_size: None,
            connection_max_idle: Duration::from_secs(9 * 60),
            metric_group_prefix: s!("selector"),
            metric_tags: vec![],
            metrics_per_connection: true,
        }
    }
}

/// Cloneable handle interrupting a blocking [`Selector::poll`].
///
/// The only part of the selector which may be used from threads other than
/// the one owning it.
#[derive(Clone)]
pub struct Waker {
    writer: Arc<Mutex<UnixStream>>,
}

impl Waker {
    /// Makes a concurrent blocking poll return early. No-op when no poll is
    /// in progress: the wake byte stays queued and the next poll consumes it.
    pub fn wake(&self) -> io::Result<()> {
        use io::ErrorKind::*;

        let mut writer = self.writer.lock().map_err(|_| io::Error::from(WouldBlock))?;
        loop {
            match writer.write_all(&[0x1]) {
                Ok(()) => return Ok(()),
                // A full wake queue already holds plenty of pending wake
                // signals; nothing more to do
                Err(err) if err.kind() == WouldBlock => return Ok(()),
                Err(err) if err.kind() == Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// A selector for doing non-blocking multi-connection network I/O on a single
/// thread.
///
/// Works with [`FrameSend`] and [`FrameReceive`] to transmit size-delimited
/// frames. A connection is added with [`Selector::connect`]; the call only
/// *initiates* the connection, which completes during a subsequent
/// [`Selector::poll`]:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use selector::*;
/// # fn main() -> Result<(), Error> {
/// # let config = SelectorConfig::default();
/// # let clock = Arc::new(MonotonicClock::new());
/// # let metrics = Arc::new(Metrics::new());
/// let mut selector = Selector::new(config, PlaintextBuilder, clock, metrics)?;
/// selector.connect("42", "192.0.2.7:9092".parse().unwrap(), None, None)?;
/// selector.send(FrameSend::new("42", b"ping".to_vec()))?;
/// selector.poll(Duration::from_millis(500))?;
/// for id in selector.connected() {
///     println!("established {id}");
/// }
/// # Ok(()) }
/// ```
///
/// Completed sends, completed receives, new connections and disconnections
/// accumulate into per-poll lists available through the accessors; the lists
/// are cleared at the beginning of each `poll` call and stay valid until the
/// next one.
///
/// The selector is not thread safe. The single cross-thread entry point is
/// the [`Waker`] returned by [`Selector::waker`].
pub struct Selector<B: ChannelBuilder, P: Poll> {
    poller: P,
    channel_builder: B,
    clock: Arc<dyn Clock>,
    channels: HashMap<String, B::Channel>,
    fd_index: HashMap<RawFd, String>,
    staged_receives: HashMap<String, VecDeque<FrameReceive>>,
    immediately_connected: HashSet<String>,
    completed_sends: Vec<FrameSend>,
    completed_receives: Vec<FrameReceive>,
    connected: Vec<String>,
    disconnected: Vec<String>,
    failed_sends: Vec<String>,
    lru: LruTracker,
    sensors: SelectorSensors,
    connection_count: Arc<AtomicUsize>,
    waker_reader: UnixStream,
    waker: Waker,
    max_receive_size: Option<usize>,
    max_idle_nanos: u64,
    current_time_nanos: u64,
    next_idle_close_check: u64,
}

#[cfg(feature = "popol")]
impl<B: ChannelBuilder> Selector<B, crate::poller::popol::Poller> {
    /// Creates a selector polling through the poll(2) syscall.
    pub fn new(
        config: SelectorConfig,
        channel_builder: B,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> io::Result<Self> {
        Selector::with(config, channel_builder, crate::poller::popol::Poller::new(), clock, metrics)
    }
}

impl<B: ChannelBuilder, P: Poll> Selector<B, P> {
    /// Creates a selector on top of the given readiness multiplexer.
    pub fn with(
        config: SelectorConfig,
        channel_builder: B,
        mut poller: P,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> io::Result<Self> {
        let (waker_writer, waker_reader) = UnixStream::pair()?;
        waker_reader.set_nonblocking(true)?;
        waker_writer.set_nonblocking(true)?;
        poller.register(&waker_reader, IoType::read_only());

        let connection_count = Arc::new(AtomicUsize::new(0));
        let sensors = SelectorSensors::register(metrics, &config, connection_count.clone());

        let now = clock.nanos();
        let max_idle_nanos = config.connection_max_idle.as_nanos() as u64;
        Ok(Selector {
            poller,
            channel_builder,
            clock,
            channels: empty!(),
            fd_index: empty!(),
            staged_receives: empty!(),
            immediately_connected: empty!(),
            completed_sends: vec![],
            completed_receives: vec![],
            connected: vec![],
            disconnected: vec![],
            failed_sends: vec![],
            lru: LruTracker::new(),
            sensors,
            connection_count,
            waker_reader,
            waker: Waker {
                writer: Arc::new(Mutex::new(waker_writer)),
            },
            max_receive_size: config.max_receive_size,
            max_idle_nanos,
            current_time_nanos: now,
            next_idle_close_check: now.saturating_add(max_idle_nanos),
        })
    }

    /// Begins connecting to the given address and associates the connection
    /// with the given id.
    ///
    /// The call only initiates the connection; it completes on a future
    /// [`Selector::poll`], after which the id shows up in
    /// [`Selector::connected`]. `send_buffer`/`receive_buffer` override the
    /// OS socket buffer sizes when set.
    pub fn connect(
        &mut self,
        id: &str,
        address: SocketAddr,
        send_buffer: Option<usize>,
        receive_buffer: Option<usize>,
    ) -> Result<(), Error> {
        if self.channels.contains_key(id) {
            return Err(Error::DuplicateId(id.to_string()));
        }

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_keepalive(true)?;
        if let Some(size) = send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = receive_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        socket.set_nodelay(true)?;

        // On failure the socket is dropped here, leaving no state behind
        let connected = match socket.connect(&address.into()) {
            Ok(()) => true,
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => false,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(err) => return Err(err.into()),
        };

        let channel = self.channel_builder.build_channel(id, socket.into(), self.max_receive_size)?;
        let fd = channel.as_raw_fd();
        if connected {
            // The kernel never reports a connect event for sockets which
            // connected synchronously; simulate one on the next poll instead
            #[cfg(feature = "log")]
            log::debug!(target: "selector", "Immediately connected to {id} ({address})");
            self.poller.register(&fd, IoType::none());
            self.immediately_connected.insert(id.to_string());
        } else {
            self.poller.register(&fd, IoType::write_only());
        }
        self.insert_channel(id, fd, channel);
        Ok(())
    }

    /// Registers an already-connected socket with the selector, as when a
    /// connection was accepted by a listener elsewhere.
    ///
    /// The id is not checked for uniqueness: the caller guarantees it.
    pub fn register(&mut self, id: &str, stream: TcpStream) -> Result<(), Error> {
        stream.set_nonblocking(true)?;
        let channel = self.channel_builder.build_channel(id, stream, self.max_receive_size)?;
        let fd = channel.as_raw_fd();
        self.poller.register(&fd, IoType::read_only());
        self.insert_channel(id, fd, channel);
        Ok(())
    }

    fn insert_channel(&mut self, id: &str, fd: RawFd, channel: B::Channel) {
        self.fd_index.insert(fd, id.to_string());
        self.lru.insert(id, self.current_time_nanos);
        self.channels.insert(id.to_string(), channel);
        self.connection_count.store(self.channels.len(), Ordering::Relaxed);
    }

    /// Queues the given frame for sending on subsequent [`Selector::poll`]
    /// calls. No bytes are transmitted here.
    ///
    /// At most one send may be in flight per connection; a second one is
    /// rejected with [`Error::SendInProgress`] until the first shows up in
    /// [`Selector::completed_sends`].
    pub fn send(&mut self, send: FrameSend) -> Result<(), Error> {
        let id = send.destination().to_string();
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(Error::NoSuchConnection(id));
        };
        match channel.set_send(send) {
            Ok(()) => {
                let fd = channel.as_raw_fd();
                let interest = channel.interest();
                self.poller.set_interest(&fd, interest);
                Ok(())
            }
            Err(SetSendError::InProgress) => Err(Error::SendInProgress(id)),
            Err(SetSendError::Disconnected) => {
                // The failure is reported through `disconnected` at the next
                // poll boundary
                #[cfg(feature = "log")]
                log::debug!(target: "selector", "Send to {id} failed: connection already severed");
                self.failed_sends.push(id.clone());
                self.close_channel(&id);
                Ok(())
            }
        }
    }

    /// Does whatever I/O can be done on each connection without blocking for
    /// longer than `timeout`: completing connections, advancing handshakes,
    /// making progress on in-flight sends and receives, reaping idle
    /// connections.
    ///
    /// Clears the per-poll result lists at entry and repopulates them; check
    /// [`Selector::completed_sends`], [`Selector::completed_receives`],
    /// [`Selector::connected`] and [`Selector::disconnected`] after the call.
    pub fn poll(&mut self, timeout: Duration) -> Result<(), Error> {
        self.clear();

        // Buffered progress must surface without waiting for the kernel
        let timeout = if self.has_staged_receives() || !self.immediately_connected.is_empty() {
            Duration::ZERO
        } else {
            timeout
        };

        let start_select = self.clock.nanos();
        let ready = self.poller.select(timeout)?;
        let end_select = self.clock.nanos();
        self.current_time_nanos = end_select;
        self.sensors.select_time.record((end_select - start_select) as f64, self.clock.millis());

        if ready > 0 || !self.immediately_connected.is_empty() {
            self.dispatch_ready_keys();
            self.dispatch_immediately_connected();
        }

        self.drain_staged_receives();

        let end_io = self.clock.nanos();
        self.sensors.io_time.record((end_io - end_select) as f64, self.clock.millis());

        self.maybe_close_oldest_connection();
        Ok(())
    }

    /// Clears the results of the previous poll and surfaces sends which
    /// failed outside of it.
    fn clear(&mut self) {
        self.completed_sends.clear();
        self.completed_receives.clear();
        self.connected.clear();
        self.disconnected.clear();
        self.disconnected.append(&mut self.failed_sends);
    }

    fn dispatch_ready_keys(&mut self) {
        let waker_fd = self.waker_reader.as_raw_fd();
        while let Some((fd, res)) = self.poller.next() {
            if fd == waker_fd {
                #[cfg(feature = "log")]
                log::trace!(target: "selector", "Awoken by the waker");
                let _ = reset_fd(&self.waker_reader);
                continue;
            }
            let Some(id) = self.fd_index.get(&fd).cloned() else {
                // Stale event for a connection closed earlier in this pass
                continue;
            };
            match res {
                Ok(readiness) => self.dispatch_key(&id, fd, readiness, false),
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "selector", "Connection with {id} failed at poll: {err}");
                    self.close_channel(&id);
                    self.disconnected.push(id);
                }
            }
        }
    }

    fn dispatch_immediately_connected(&mut self) {
        let pending = std::mem::take(&mut self.immediately_connected);
        for id in pending {
            let Some(channel) = self.channels.get(&id) else {
                continue;
            };
            let fd = channel.as_raw_fd();
            self.dispatch_key(&id, fd, IoType::none(), true);
        }
    }

    fn dispatch_key(&mut self, id: &str, fd: RawFd, readiness: IoType, immediate: bool) {
        self.sensors.maybe_register_connection_metrics(id);
        self.lru.touch(id, self.current_time_nanos);

        match self.service_channel(id, readiness, immediate) {
            Ok(()) => {
                if let Some(channel) = self.channels.get(id) {
                    self.poller.set_interest(&fd, channel.interest());
                }
            }
            Err(err) => {
                let desc = self
                    .channels
                    .get(id)
                    .map(|channel| channel.socket_description())
                    .unwrap_or_default();
                if is_disconnect(&err) {
                    #[cfg(feature = "log")]
                    log::debug!(target: "selector", "Connection with {desc} disconnected: {err}");
                } else {
                    #[cfg(feature = "log")]
                    log::warn!(target: "selector", "Unexpected error from {desc}; closing connection: {err}");
                }
                self.close_channel(id);
                self.disconnected.push(id.to_string());
            }
        }
    }

    /// Per-connection part of the poll: connect completion, handshake
    /// advance, read drain, write advance. Any error severs the connection
    /// (handled by the caller) without disturbing other channels.
    fn service_channel(&mut self, id: &str, readiness: IoType, immediate: bool) -> io::Result<()> {
        let Some(channel) = self.channels.get_mut(id) else {
            return Ok(());
        };

        /* complete any connection which finished its TCP handshake, normally or immediately */
        if immediate || (!channel.is_connected() && readiness.write) {
            if channel.finish_connect()? {
                #[cfg(feature = "log")]
                log::debug!(target: "selector", "Connection with {} established", channel.socket_description());
                self.connected.push(id.to_string());
                self.sensors.connection_created.record(1.0, self.clock.millis());
            } else {
                return Ok(());
            }
        }

        /* if the channel is not ready, keep preparing its transport */
        if channel.is_connected() && !channel.is_ready() {
            channel.prepare()?;
        }

        /* drain every frame the transport has buffered: the kernel will not
         * report readiness for them again */
        if channel.is_ready() && readiness.read && !self.staged_receives.contains_key(id) {
            let mut staged = VecDeque::new();
            while let Some(receive) = channel.read()? {
                staged.push_back(receive);
            }
            if !staged.is_empty() {
                self.staged_receives.insert(id.to_string(), staged);
            }
        }

        /* advance the in-flight send, if any */
        if channel.is_ready() && readiness.write {
            if let Some(send) = channel.write()? {
                self.sensors.record_bytes_sent(id, send.size() as f64, self.clock.millis());
                self.completed_sends.push(send);
            }
        }

        Ok(())
    }

    /// Whether any unmuted channel holds staged receives.
    fn has_staged_receives(&self) -> bool {
        self.staged_receives
            .keys()
            .any(|id| self.channels.get(id).map_or(false, |channel| !channel.is_mute()))
    }

    /// Moves at most one staged receive per unmuted channel into the
    /// completed list, giving every peer fair progress.
    fn drain_staged_receives(&mut self) {
        if self.staged_receives.is_empty() {
            return;
        }
        let channels = &self.channels;
        let completed = &mut self.completed_receives;
        let sensors = &self.sensors;
        let now_ms = self.clock.millis();
        self.staged_receives.retain(|id, deque| {
            let Some(channel) = channels.get(id) else {
                return false;
            };
            if channel.is_mute() {
                return true;
            }
            if let Some(receive) = deque.pop_front() {
                sensors.record_bytes_received(id, receive.size() as f64, now_ms);
                completed.push(receive);
            }
            !deque.is_empty()
        });
    }

    /// Amortized idle reaping: inspects the LRU only past the scheduled
    /// check time and closes at most one connection per poll.
    fn maybe_close_oldest_connection(&mut self) {
        if self.current_time_nanos <= self.next_idle_close_check {
            return;
        }
        if self.lru.is_empty() {
            self.next_idle_close_check = self.current_time_nanos + self.max_idle_nanos;
            return;
        }
        let (id, last_active) = self.lru.oldest().expect("LRU is not empty");
        let id = id.to_string();
        self.next_idle_close_check = last_active.saturating_add(self.max_idle_nanos);
        if self.current_time_nanos > self.next_idle_close_check {
            #[cfg(feature = "log")]
            log::trace!(
                target: "selector",
                "Closing connection {id} after {}ms of inactivity",
                (self.current_time_nanos - last_active) / 1_000_000
            );
            self.disconnected.push(id.clone());
            self.close_channel(&id);
        }
    }

    /// Suspends read delivery from the given connection; its inbound frames
    /// stay buffered until [`Selector::unmute`].
    pub fn mute(&mut self, id: &str) -> Result<(), Error> {
        let Some(channel) = self.channels.get_mut(id) else {
            return Err(Error::NoSuchConnection(id.to_string()));
        };
        channel.mute();
        let fd = channel.as_raw_fd();
        let interest = channel.interest();
        self.poller.set_interest(&fd, interest);
        Ok(())
    }

    /// Resumes read delivery from the given connection.
    ///
    /// Frames staged before the connection was muted surface on the next
    /// polls, oldest first, so unmuting may deliver data received a while
    /// ago.
    pub fn unmute(&mut self, id: &str) -> Result<(), Error> {
        let Some(channel) = self.channels.get_mut(id) else {
            return Err(Error::NoSuchConnection(id.to_string()));
        };
        channel.unmute();
        let fd = channel.as_raw_fd();
        let interest = channel.interest();
        self.poller.set_interest(&fd, interest);
        Ok(())
    }

    pub fn mute_all(&mut self) {
        for channel in self.channels.values_mut() {
            channel.mute();
            let fd = channel.as_raw_fd();
            self.poller.set_interest(&fd, channel.interest());
        }
    }

    pub fn unmute_all(&mut self) {
        for channel in self.channels.values_mut() {
            channel.unmute();
            let fd = channel.as_raw_fd();
            self.poller.set_interest(&fd, channel.interest());
        }
    }

    /// Interrupts a concurrent blocking [`Selector::poll`].
    pub fn wakeup(&self) -> io::Result<()> { self.waker.wake() }

    /// Detached wake handle for use from other threads.
    pub fn waker(&self) -> Waker { self.waker.clone() }

    /// Closes the connection with the given id. Unknown ids are a no-op.
    pub fn close(&mut self, id: &str) { self.close_channel(id); }

    /// Closes every live connection and tears down the channel builder and
    /// the selector metrics.
    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self.channels.keys().cloned().collect();
        for id in ids {
            self.close_channel(&id);
        }
        self.channel_builder.close();
        self.sensors.close();
    }

    fn close_channel(&mut self, id: &str) {
        let Some(mut channel) = self.channels.remove(id) else {
            return;
        };
        let fd = channel.as_raw_fd();
        self.poller.unregister(&fd);
        if let Err(err) = channel.close() {
            #[cfg(feature = "log")]
            log::error!(target: "selector", "Error closing connection {id}: {err}");
        }
        self.fd_index.remove(&fd);
        self.staged_receives.remove(id);
        self.immediately_connected.remove(id);
        self.lru.remove(id);
        self.connection_count.store(self.channels.len(), Ordering::Relaxed);
        self.sensors.connection_closed.record(1.0, self.clock.millis());
    }

    /// Frames fully flushed to their sockets during the last poll.
    pub fn completed_sends(&self) -> &[FrameSend] { &self.completed_sends }

    /// Frames fully received during the last poll, at most one per
    /// connection.
    pub fn completed_receives(&self) -> &[FrameReceive] { &self.completed_receives }

    /// Connections which finished establishing during the last poll.
    pub fn connected(&self) -> &[String] { &self.connected }

    /// Connections lost during the last poll (or whose send failed just
    /// before it).
    pub fn disconnected(&self) -> &[String] { &self.disconnected }

    /// The channel with the given id, if the connection is live.
    pub fn channel(&self, id: &str) -> Option<&B::Channel> { self.channels.get(id) }

    /// All live channels.
    pub fn channels(&self) -> impl Iterator<Item = (&str, &B::Channel)> {
        self.channels.iter().map(|(id, channel)| (id.as_str(), channel))
    }

    /// Whether the connection is established and its transport ready to
    /// carry user data.
    pub fn is_channel_ready(&self, id: &str) -> bool {
        self.channels.get(id).map_or(false, |channel| channel.is_ready())
    }
}

/// Distinguishes ordinary peer disconnects (logged at debug) from unexpected
/// failures (logged at warn).
fn is_disconnect(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        UnexpectedEof
            | ConnectionReset
            | ConnectionAborted
            | ConnectionRefused
            | BrokenPipe
            | NotConnected
            | TimedOut
    )
}

/// Drains all pending bytes from a non-blocking fd.
fn reset_fd(fd: &impl AsRawFd) -> io::Result<()> {
    let mut buf = [0u8; 4096];

    loop {
        // We use a low-level "read" here because the alternative is to create
        // a `UnixStream` from the `RawFd`, which has "drop" semantics which we
        // want to avoid.
        match unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        } {
            -1 => match io::Error::last_os_error() {
                err if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                err => return Err(err),
            },
            0 => return Ok(()),
            _ => continue,
        }
    }
}

/// Sensors maintained by the selector inside the metrics registry.
struct SelectorSensors {
    metrics: Arc<Metrics>,
    node_group: String,
    tags: Vec<(String, String)>,
    per_connection: bool,
    connection_closed: Arc<Sensor>,
    connection_created: Arc<Sensor>,
    bytes_sent: Arc<Sensor>,
    bytes_received: Arc<Sensor>,
    select_time: Arc<Sensor>,
    io_time: Arc<Sensor>,
    connection_count_gauge: MetricName,
    sensor_names: Mutex<Vec<String>>,
}

impl SelectorSensors {
    fn register(
        metrics: Arc<Metrics>,
        config: &SelectorConfig,
        connection_count: Arc<AtomicUsize>,
    ) -> Self {
        let group = format!("{}-metrics", config.metric_group_prefix);
        let node_group = format!("{}-node-metrics", config.metric_group_prefix);
        let tags = config.metric_tags.clone();
        let mut suffix = String::new();
        for (key, value) in &tags {
            suffix.push_str(key);
            suffix.push('-');
            suffix.push_str(value);
        }
        let mut names = vec![];
        let mut sensor = |name: &str, parents: &[Arc<Sensor>]| {
            let name = format!("{name}:{suffix}");
            let sensor = metrics.sensor(&name, parents);
            names.push(name);
            sensor
        };

        let connection_closed = sensor("connections-closed", &[]);
        connection_closed.add(
            MetricName::new(
                "connection-close-rate",
                &group,
                "Connections closed per second in the window.",
                tags.clone(),
            ),
            Stat::Rate,
        );

        let connection_created = sensor("connections-created", &[]);
        connection_created.add(
            MetricName::new(
                "connection-creation-rate",
                &group,
                "New connections established per second in the window.",
                tags.clone(),
            ),
            Stat::Rate,
        );

        let bytes_transferred = sensor("bytes-sent-received", &[]);
        bytes_transferred.add(
            MetricName::new(
                "network-io-rate",
                &group,
                "The average number of network operations (reads or writes) on all connections \
                 per second.",
                tags.clone(),
            ),
            Stat::CountRate,
        );

        let bytes_sent = sensor("bytes-sent", &[bytes_transferred.clone()]);
        bytes_sent.add(
            MetricName::new(
                "outgoing-byte-rate",
                &group,
                "The average number of outgoing bytes sent per second to all servers.",
                tags.clone(),
            ),
            Stat::Rate,
        );
        bytes_sent.add(
            MetricName::new(
                "request-rate",
                &group,
                "The average number of requests sent per second.",
                tags.clone(),
            ),
            Stat::CountRate,
        );
        bytes_sent.add(
            MetricName::new(
                "request-size-avg",
                &group,
                "The average size of all requests in the window.",
                tags.clone(),
            ),
            Stat::Avg,
        );
        bytes_sent.add(
            MetricName::new(
                "request-size-max",
                &group,
                "The maximum size of any request sent in the window.",
                tags.clone(),
            ),
            Stat::Max,
        );

        let bytes_received = sensor("bytes-received", &[bytes_transferred]);
        bytes_received.add(
            MetricName::new(
                "incoming-byte-rate",
                &group,
                "Bytes per second read off all sockets.",
                tags.clone(),
            ),
            Stat::Rate,
        );
        bytes_received.add(
            MetricName::new(
                "response-rate",
                &group,
                "Responses received per second.",
                tags.clone(),
            ),
            Stat::CountRate,
        );

        let select_time = sensor("select-time", &[]);
        select_time.add(
            MetricName::new(
                "select-rate",
                &group,
                "Number of times the I/O layer checked for new I/O to perform per second.",
                tags.clone(),
            ),
            Stat::CountRate,
        );
        select_time.add(
            MetricName::new(
                "io-wait-time-ns-avg",
                &group,
                "The average length of time the I/O thread spent waiting for a socket ready for \
                 reads or writes in nanoseconds.",
                tags.clone(),
            ),
            Stat::Avg,
        );
        select_time.add(
            MetricName::new(
                "io-wait-ratio",
                &group,
                "The fraction of time the I/O thread spent waiting.",
                tags.clone(),
            ),
            Stat::NanoRatio,
        );

        let io_time = sensor("io-time", &[]);
        io_time.add(
            MetricName::new(
                "io-time-ns-avg",
                &group,
                "The average length of time for I/O per select call in nanoseconds.",
                tags.clone(),
            ),
            Stat::Avg,
        );
        io_time.add(
            MetricName::new(
                "io-ratio",
                &group,
                "The fraction of time the I/O thread spent doing I/O.",
                tags.clone(),
            ),
            Stat::NanoRatio,
        );

        let connection_count_gauge = MetricName::new(
            "connection-count",
            &group,
            "The current number of active connections.",
            tags.clone(),
        );
        metrics.add_gauge(connection_count_gauge.clone(), move || {
            connection_count.load(Ordering::Relaxed) as f64
        });

        SelectorSensors {
            metrics,
            node_group,
            tags,
            per_connection: config.metrics_per_connection,
            connection_closed,
            connection_created,
            bytes_sent,
            bytes_received,
            select_time,
            io_time,
            connection_count_gauge,
            sensor_names: Mutex::new(names),
        }
    }

    /// One-shot registration of the per-connection sensors, performed the
    /// first time a connection shows readiness.
    fn maybe_register_connection_metrics(&self, id: &str) {
        if !self.per_connection || id.is_empty() {
            return;
        }
        // If one sensor of the connection has been registered, all of them
        // have been
        let request_name = format!("node-{id}.bytes-sent");
        if self.metrics.get_sensor(&request_name).is_some() {
            return;
        }

        let mut tags = self.tags.clone();
        tags.push((s!("node-id"), format!("node-{id}")));

        let request = self.metrics.sensor(&request_name, &[]);
        request.add(
            MetricName::new("outgoing-byte-rate", &self.node_group, "", tags.clone()),
            Stat::Rate,
        );
        request.add(
            MetricName::new(
                "request-rate",
                &self.node_group,
                "The average number of requests sent per second.",
                tags.clone(),
            ),
            Stat::CountRate,
        );
        request.add(
            MetricName::new(
                "request-size-avg",
                &self.node_group,
                "The average size of all requests in the window.",
                tags.clone(),
            ),
            Stat::Avg,
        );
        request.add(
            MetricName::new(
                "request-size-max",
                &self.node_group,
                "The maximum size of any request sent in the window.",
                tags.clone(),
            ),
            Stat::Max,
        );

        let response_name = format!("node-{id}.bytes-received");
        let response = self.metrics.sensor(&response_name, &[]);
        response.add(
            MetricName::new("incoming-byte-rate", &self.node_group, "", tags.clone()),
            Stat::Rate,
        );
        response.add(
            MetricName::new(
                "response-rate",
                &self.node_group,
                "The average number of responses received per second.",
                tags.clone(),
            ),
            Stat::CountRate,
        );

        // Latency sensors are recorded by the request layer above, not here
        let latency_name = format!("node-{id}.latency");
        let latency = self.metrics.sensor(&latency_name, &[]);
        latency.add(
            MetricName::new("request-latency-avg", &self.node_group, "", tags.clone()),
            Stat::Avg,
        );
        latency.add(MetricName::new("request-latency-max", &self.node_group, "", tags), Stat::Max);

        if let Ok(mut names) = self.sensor_names.lock() {
            names.extend([request_name, response_name, latency_name]);
        }
    }

    fn record_bytes_sent(&self, id: &str, bytes: f64, now_ms: u64) {
        self.bytes_sent.record(bytes, now_ms);
        if !id.is_empty() {
            if let Some(sensor) = self.metrics.get_sensor(&format!("node-{id}.bytes-sent")) {
                sensor.record(bytes, now_ms);
            }
        }
    }

    fn record_bytes_received(&self, id: &str, bytes: f64, now_ms: u64) {
        self.bytes_received.record(bytes, now_ms);
        if !id.is_empty() {
            if let Some(sensor) = self.metrics.get_sensor(&format!("node-{id}.bytes-received")) {
                sensor.record(bytes, now_ms);
            }
        }
    }

    fn close(&self) {
        if let Ok(mut names) = self.sensor_names.lock() {
            for name in names.drain(..) {
                self.metrics.remove_sensor(&name);
            }
        }
        self.metrics.remove_gauge(&self.connection_count_gauge);
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::io::Read;
    use std::net::{Shutdown, TcpListener};
    use std::rc::Rc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::poller::popol::Poller;

    enum MockRead {
        Frame(FrameReceive),
        Fail(io::ErrorKind),
    }

    /// Channel with scripted read results over a real socket (so that the
    /// poller has a file descriptor to watch).
    struct MockChannel {
        id: String,
        stream: TcpStream,
        reads: VecDeque<MockRead>,
        send: Option<FrameSend>,
        mute: bool,
        severed: bool,
    }

    impl AsRawFd for MockChannel {
        fn as_raw_fd(&self) -> RawFd { self.stream.as_raw_fd() }
    }

    impl Channel for MockChannel {
        fn id(&self) -> &str { &self.id }

        fn interest(&self) -> IoType {
            IoType {
                read: !self.mute,
                write: self.send.is_some(),
            }
        }

        fn finish_connect(&mut self) -> io::Result<bool> { Ok(true) }

        fn is_connected(&self) -> bool { true }

        fn prepare(&mut self) -> io::Result<()> { Ok(()) }

        fn is_ready(&self) -> bool { true }

        fn read(&mut self) -> io::Result<Option<FrameReceive>> {
            let mut buf = [0u8; 64];
            let _ = self.stream.read(&mut buf);
            match self.reads.pop_front() {
                Some(MockRead::Frame(receive)) => Ok(Some(receive)),
                Some(MockRead::Fail(kind)) => Err(kind.into()),
                None => Ok(None),
            }
        }

        fn write(&mut self) -> io::Result<Option<FrameSend>> { Ok(self.send.take()) }

        fn set_send(&mut self, send: FrameSend) -> Result<(), SetSendError> {
            if self.severed {
                return Err(SetSendError::Disconnected);
            }
            if self.send.is_some() {
                return Err(SetSendError::InProgress);
            }
            self.send = Some(send);
            Ok(())
        }

        fn mute(&mut self) { self.mute = true; }

        fn unmute(&mut self) { self.mute = false; }

        fn is_mute(&self) -> bool { self.mute }

        fn close(&mut self) -> io::Result<()> {
            let _ = self.stream.shutdown(Shutdown::Both);
            Ok(())
        }

        fn socket_description(&self) -> String { format!("mock({})", self.id) }
    }

    #[derive(Clone, Default)]
    struct MockBuilder {
        scripts: Rc<RefCell<HashMap<String, VecDeque<MockRead>>>>,
        severed: Rc<RefCell<HashSet<String>>>,
    }

    impl MockBuilder {
        fn script(&self, id: &str, reads: Vec<MockRead>) {
            self.scripts.borrow_mut().insert(id.to_string(), reads.into());
        }

        fn sever(&self, id: &str) { self.severed.borrow_mut().insert(id.to_string()); }
    }

    impl ChannelBuilder for MockBuilder {
        type Channel = MockChannel;

        fn build_channel(
            &self,
            id: &str,
            stream: TcpStream,
            _max_receive_size: Option<usize>,
        ) -> io::Result<MockChannel> {
            Ok(MockChannel {
                id: id.to_string(),
                stream,
                reads: self.scripts.borrow_mut().remove(id).unwrap_or_default(),
                send: None,
                mute: false,
                severed: self.severed.borrow().contains(id),
            })
        }
    }

    /// A connected TCP pair; the second half triggers readiness on the first.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn mock_selector(
        builder: &MockBuilder,
        config: SelectorConfig,
        clock: Arc<dyn Clock>,
    ) -> Selector<MockBuilder, Poller> {
        Selector::new(config, builder.clone(), clock, Arc::new(Metrics::new())).unwrap()
    }

    fn receive(source: &str, payload: &[u8]) -> MockRead {
        MockRead::Frame(FrameReceive::completed(source, payload))
    }

    fn received_payloads(selector: &Selector<MockBuilder, Poller>) -> Vec<Vec<u8>> {
        selector.completed_receives().iter().map(|receive| receive.payload().to_vec()).collect()
    }

    #[test]
    fn staged_receives_drain_one_per_poll() {
        let builder = MockBuilder::default();
        builder.script("a", vec![receive("a", b"one"), receive("a", b"two"), receive("a", b"three")]);
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (local, mut peer) = tcp_pair();
        selector.register("a", local).unwrap();
        peer.write_all(&[0x1]).unwrap();

        // One readiness event stages all three frames, delivered one per poll
        selector.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(received_payloads(&selector), [b"one".to_vec()]);

        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(received_payloads(&selector), [b"two".to_vec()]);

        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(received_payloads(&selector), [b"three".to_vec()]);

        selector.poll(Duration::ZERO).unwrap();
        assert!(selector.completed_receives().is_empty());
    }

    #[test]
    fn muted_channel_retains_staged_receives() {
        let builder = MockBuilder::default();
        builder.script("a", vec![receive("a", b"first"), receive("a", b"second")]);
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (local, mut peer) = tcp_pair();
        selector.register("a", local).unwrap();
        peer.write_all(&[0x1]).unwrap();

        selector.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(received_payloads(&selector), [b"first".to_vec()]);

        selector.mute("a").unwrap();
        selector.poll(Duration::ZERO).unwrap();
        assert!(selector.completed_receives().is_empty());
        selector.poll(Duration::ZERO).unwrap();
        assert!(selector.completed_receives().is_empty());

        selector.unmute("a").unwrap();
        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(received_payloads(&selector), [b"second".to_vec()]);
    }

    #[test]
    fn read_failure_severs_only_the_failed_channel() {
        let builder = MockBuilder::default();
        builder.script("bad", vec![MockRead::Fail(io::ErrorKind::ConnectionReset)]);
        builder.script("good", vec![receive("good", b"payload")]);
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (bad_local, mut bad_peer) = tcp_pair();
        let (good_local, mut good_peer) = tcp_pair();
        selector.register("bad", bad_local).unwrap();
        selector.register("good", good_local).unwrap();
        bad_peer.write_all(&[0x1]).unwrap();
        good_peer.write_all(&[0x1]).unwrap();

        // Both events usually surface in one pass, but nothing guarantees it:
        // accumulate across polls
        let mut disconnected = vec![];
        let mut payloads = vec![];
        for _ in 0..10 {
            selector.poll(Duration::from_millis(200)).unwrap();
            disconnected.extend(selector.disconnected().iter().cloned());
            payloads.extend(received_payloads(&selector));
            if !disconnected.is_empty() && !payloads.is_empty() {
                break;
            }
        }

        assert_eq!(disconnected, [s!("bad")]);
        assert!(selector.channel("bad").is_none());
        assert_eq!(payloads, [b"payload".to_vec()]);
        assert!(selector.channel("good").is_some());
    }

    #[test]
    fn completed_send_is_reported() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (local, _peer) = tcp_pair();
        selector.register("a", local).unwrap();
        selector.send(FrameSend::new("a", b"request".to_vec())).unwrap();

        selector.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(selector.completed_sends().len(), 1);
        assert_eq!(selector.completed_sends()[0].destination(), "a");
        assert_eq!(selector.completed_sends()[0].payload(), b"request");
    }

    #[test]
    fn second_send_in_flight_is_rejected() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (local, _peer) = tcp_pair();
        selector.register("a", local).unwrap();
        selector.send(FrameSend::new("a", b"first".to_vec())).unwrap();
        assert!(matches!(
            selector.send(FrameSend::new("a", b"second".to_vec())),
            Err(Error::SendInProgress(id)) if id == "a"
        ));
    }

    #[test]
    fn send_to_unknown_connection_fails() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );
        assert!(matches!(
            selector.send(FrameSend::new("nobody", vec![])),
            Err(Error::NoSuchConnection(id)) if id == "nobody"
        ));
        assert!(matches!(selector.mute("nobody"), Err(Error::NoSuchConnection(_))));
        assert!(matches!(selector.unmute("nobody"), Err(Error::NoSuchConnection(_))));
    }

    #[test]
    fn failed_send_surfaces_as_disconnect_on_next_poll() {
        let builder = MockBuilder::default();
        builder.sever("a");
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (local, _peer) = tcp_pair();
        selector.register("a", local).unwrap();
        selector.send(FrameSend::new("a", b"lost".to_vec())).unwrap();

        assert!(selector.channel("a").is_none());
        assert!(selector.disconnected().is_empty());

        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(selector.disconnected(), [s!("a")]);
    }

    #[test]
    fn immediately_connected_keys_surface_without_kernel_events() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (local, _peer) = tcp_pair();
        selector.register("a", local).unwrap();
        selector.immediately_connected.insert(s!("a"));

        // The pending connect collapses the timeout, so the poll must not
        // block anywhere near the full 30 seconds
        let start = Instant::now();
        selector.poll(Duration::from_secs(30)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(selector.connected(), [s!("a")]);
        assert!(selector.immediately_connected.is_empty());
    }

    #[test]
    fn idle_connections_reaped_one_per_poll_in_lru_order() {
        let clock = Arc::new(ManualClock::new(0));
        let builder = MockBuilder::default();
        let config = SelectorConfig {
            connection_max_idle: Duration::from_millis(10),
            ..SelectorConfig::default()
        };
        let mut selector = mock_selector(&builder, config, clock.clone());

        let (a_local, _a_peer) = tcp_pair();
        selector.register("a", a_local).unwrap();

        clock.set(5_000_000);
        selector.poll(Duration::ZERO).unwrap();
        let (b_local, _b_peer) = tcp_pair();
        selector.register("b", b_local).unwrap();

        // Past a's deadline but not b's
        clock.set(12_000_000);
        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(selector.disconnected(), [s!("a")]);
        assert!(selector.channel("a").is_none());
        assert!(selector.channel("b").is_some());

        clock.set(17_000_000);
        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(selector.disconnected(), [s!("b")]);
        assert!(selector.channel("b").is_none());
    }

    #[test]
    fn mass_idleness_drains_one_connection_per_poll() {
        let clock = Arc::new(ManualClock::new(0));
        let builder = MockBuilder::default();
        let config = SelectorConfig {
            connection_max_idle: Duration::from_millis(10),
            ..SelectorConfig::default()
        };
        let mut selector = mock_selector(&builder, config, clock.clone());

        let (a_local, _a_peer) = tcp_pair();
        let (b_local, _b_peer) = tcp_pair();
        selector.register("a", a_local).unwrap();
        selector.register("b", b_local).unwrap();

        // Both long past the deadline, yet reaped across two polls
        clock.set(50_000_000);
        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(selector.disconnected(), [s!("a")]);
        selector.poll(Duration::ZERO).unwrap();
        assert_eq!(selector.disconnected(), [s!("b")]);
    }

    #[test]
    fn waker_interrupts_blocking_poll() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let waker = selector.waker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            waker.wake().unwrap();
        });

        let start = Instant::now();
        selector.poll(Duration::from_secs(30)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_updates_connection_count() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (local, _peer) = tcp_pair();
        selector.register("a", local).unwrap();
        assert_eq!(selector.connection_count.load(Ordering::Relaxed), 1);

        selector.close("a");
        assert!(selector.channel("a").is_none());
        assert_eq!(selector.connection_count.load(Ordering::Relaxed), 0);

        // Closing an unknown id is a no-op
        selector.close("a");
        selector.close("never-existed");
    }

    #[test]
    fn shutdown_closes_every_connection() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (a_local, _a_peer) = tcp_pair();
        let (b_local, _b_peer) = tcp_pair();
        selector.register("a", a_local).unwrap();
        selector.register("b", b_local).unwrap();

        selector.shutdown();
        assert_eq!(selector.channels().count(), 0);
        assert_eq!(selector.connection_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn mute_all_and_unmute_all_cover_every_channel() {
        let builder = MockBuilder::default();
        let mut selector = mock_selector(
            &builder,
            SelectorConfig::default(),
            Arc::new(MonotonicClock::new()),
        );

        let (a_local, _a_peer) = tcp_pair();
        let (b_local, _b_peer) = tcp_pair();
        selector.register("a", a_local).unwrap();
        selector.register("b", b_local).unwrap();

        selector.mute_all();
        assert!(selector.channel("a").unwrap().is_mute());
        assert!(selector.channel("b").unwrap().is_mute());

        selector.unmute_all();
        assert!(!selector.channel("a").unwrap().is_mute());
        assert!(!selector.channel("b").unwrap().is_mute());
    }
}
