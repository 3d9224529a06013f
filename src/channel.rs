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

use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::frame::{FrameReceive, FrameSend};
use crate::poller::IoType;
use crate::transport::{PlaintextTransport, Transport};

/// Failure of [`Channel::set_send`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum SetSendError {
    /// a previous send is still in flight on this channel
    InProgress,
    /// the channel is already severed from its peer
    Disconnected,
}

/// A single connection managed by the selector: one socket plus framing plus
/// transport state.
///
/// Channels never talk to the multiplexer themselves; instead they declare
/// the readiness subscription they currently want through
/// [`Channel::interest`] and the selector applies it after every call which
/// may have changed it.
pub trait Channel: AsRawFd {
    /// Id of the connection carried by the channel.
    fn id(&self) -> &str;

    /// Readiness subscription the channel wants given its current state.
    fn interest(&self) -> IoType;

    /// Completes a pending non-blocking connect; `true` once established.
    fn finish_connect(&mut self) -> io::Result<bool>;

    /// Whether the TCP connection is established.
    fn is_connected(&self) -> bool;

    /// Advances any transport handshake. Idempotent.
    fn prepare(&mut self) -> io::Result<()>;

    /// Whether the channel may carry user data.
    fn is_ready(&self) -> bool;

    /// Makes read progress, returning a complete inbound frame when one is
    /// available.
    ///
    /// Must be called in a loop until it returns `Ok(None)`: a buffering
    /// transport may hold several complete frames after a single readiness
    /// event, and the kernel will not report readiness for them again.
    fn read(&mut self) -> io::Result<Option<FrameReceive>>;

    /// Makes write progress on the in-flight send, returning it once fully
    /// flushed.
    fn write(&mut self) -> io::Result<Option<FrameSend>>;

    /// Accepts a frame for sending. At most one send may be in flight.
    fn set_send(&mut self, send: FrameSend) -> Result<(), SetSendError>;

    /// Suspends read delivery (back-pressure).
    fn mute(&mut self);

    fn unmute(&mut self);

    fn is_mute(&self) -> bool;

    /// Closes the underlying socket. Idempotent.
    fn close(&mut self) -> io::Result<()>;

    /// Human-readable socket description for logs.
    fn socket_description(&self) -> String;
}

/// Factory instantiating channels for newly created or accepted sockets.
pub trait ChannelBuilder {
    type Channel: Channel;

    /// Wraps a non-blocking socket into a channel. The socket may still be
    /// mid-connect when coming from the outbound path.
    fn build_channel(
        &self,
        id: &str,
        stream: TcpStream,
        max_receive_size: Option<usize>,
    ) -> io::Result<Self::Channel>;

    /// Tears down any state shared between the built channels.
    fn close(&mut self) {}
}

/// Standard channel over a pluggable [`Transport`].
pub struct NetChannel<T: Transport> {
    id: String,
    transport: T,
    max_receive_size: Option<usize>,
    send: Option<FrameSend>,
    receive: Option<FrameReceive>,
    mute: bool,
    severed: bool,
}

impl<T: Transport> NetChannel<T> {
    pub fn new(id: impl ToString, transport: T, max_receive_size: Option<usize>) -> Self {
        Self {
            id: id.to_string(),
            transport,
            max_receive_size,
            send: None,
            receive: None,
            mute: false,
            severed: false,
        }
    }

    pub fn transport(&self) -> &T { &self.transport }
}

impl<T: Transport> Channel for NetChannel<T> {
    fn id(&self) -> &str { &self.id }

    fn interest(&self) -> IoType {
        if !self.transport.is_connected() {
            // Connect completion surfaces as writability
            return IoType::write_only();
        }
        IoType {
            read: !self.mute,
            write: self.send.is_some(),
        }
    }

    fn finish_connect(&mut self) -> io::Result<bool> { self.transport.finish_connect() }

    fn is_connected(&self) -> bool { self.transport.is_connected() }

    fn prepare(&mut self) -> io::Result<()> { self.transport.prepare() }

    fn is_ready(&self) -> bool { self.transport.is_ready() }

    fn read(&mut self) -> io::Result<Option<FrameReceive>> {
        let receive = self
            .receive
            .get_or_insert_with(|| FrameReceive::new(&self.id, self.max_receive_size));
        if let Err(err) = receive.read_from(&mut self.transport) {
            self.severed = true;
            return Err(err);
        }
        if receive.complete() {
            Ok(self.receive.take())
        } else {
            Ok(None)
        }
    }

    fn write(&mut self) -> io::Result<Option<FrameSend>> {
        let Some(send) = self.send.as_mut() else {
            return Ok(None);
        };
        if let Err(err) = send.write_to(&mut self.transport) {
            self.severed = true;
            return Err(err);
        }
        if send.completed() {
            Ok(self.send.take())
        } else {
            Ok(None)
        }
    }

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
        self.severed = true;
        self.transport.shutdown()
    }

    fn socket_description(&self) -> String { self.transport.peer_description() }
}

impl<T: Transport> AsRawFd for NetChannel<T> {
    fn as_raw_fd(&self) -> RawFd { self.transport.as_raw_fd() }
}

/// Builder producing plaintext channels.
pub struct PlaintextBuilder;

impl ChannelBuilder for PlaintextBuilder {
    type Channel = NetChannel<PlaintextTransport>;

    fn build_channel(
        &self,
        id: &str,
        stream: TcpStream,
        max_receive_size: Option<usize>,
    ) -> io::Result<Self::Channel> {
        Ok(NetChannel::new(id, PlaintextTransport::new(stream), max_receive_size))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    /// In-memory transport scripted from byte buffers.
    struct PipeTransport {
        inbound: Vec<u8>,
        pos: usize,
        outbound: Vec<u8>,
        ready: bool,
    }

    impl PipeTransport {
        fn new(inbound: Vec<u8>) -> Self {
            Self {
                inbound,
                pos: 0,
                outbound: vec![],
                ready: true,
            }
        }
    }

    impl Read for PipeTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.inbound.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let len = buf.len().min(self.inbound.len() - self.pos);
            buf[..len].copy_from_slice(&self.inbound[self.pos..self.pos + len]);
            self.pos += len;
            Ok(len)
        }
    }

    impl Write for PipeTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    impl AsRawFd for PipeTransport {
        fn as_raw_fd(&self) -> RawFd { -1 }
    }

    impl Transport for PipeTransport {
        fn finish_connect(&mut self) -> io::Result<bool> { Ok(true) }
        fn is_connected(&self) -> bool { true }
        fn prepare(&mut self) -> io::Result<()> { Ok(()) }
        fn is_ready(&self) -> bool { self.ready }
        fn shutdown(&mut self) -> io::Result<()> { Ok(()) }
        fn peer_description(&self) -> String { s!("pipe") }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut data = (payload.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn reads_multiple_buffered_frames() {
        let mut inbound = frame(b"first");
        inbound.extend(frame(b"second"));
        let mut channel = NetChannel::new("c", PipeTransport::new(inbound), None);

        let first = channel.read().unwrap().expect("complete frame");
        assert_eq!(first.source(), "c");
        assert_eq!(first.payload(), b"first");

        let second = channel.read().unwrap().expect("complete frame");
        assert_eq!(second.payload(), b"second");

        assert!(channel.read().unwrap().is_none());
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut inbound = frame(b"truncated");
        inbound.truncate(7);
        let mut channel = NetChannel::new("c", PipeTransport::new(inbound), None);

        assert!(channel.read().unwrap().is_none());
        // Remainder arrives later
        channel.transport.inbound.extend_from_slice(&frame(b"truncated")[7..]);
        let receive = channel.read().unwrap().expect("complete frame");
        assert_eq!(receive.payload(), b"truncated");
    }

    #[test]
    fn one_send_in_flight() {
        let mut channel = NetChannel::new("c", PipeTransport::new(vec![]), None);
        channel.set_send(FrameSend::new("c", b"one".to_vec())).unwrap();
        assert_eq!(
            channel.set_send(FrameSend::new("c", b"two".to_vec())),
            Err(SetSendError::InProgress)
        );

        let sent = channel.write().unwrap().expect("completed send");
        assert_eq!(sent.payload(), b"one");
        assert_eq!(channel.transport.outbound, frame(b"one"));

        // The slot is free again once the send completed
        channel.set_send(FrameSend::new("c", b"two".to_vec())).unwrap();
    }

    #[test]
    fn interest_follows_state() {
        let mut channel = NetChannel::new("c", PipeTransport::new(vec![]), None);
        assert_eq!(channel.interest(), IoType::read_only());

        channel.set_send(FrameSend::new("c", vec![])).unwrap();
        assert_eq!(channel.interest(), IoType::read_write());

        channel.mute();
        assert_eq!(channel.interest(), IoType::write_only());
        assert!(channel.is_mute());

        channel.unmute();
        channel.write().unwrap();
        assert_eq!(channel.interest(), IoType::read_only());
    }

    #[test]
    fn closed_channel_rejects_sends() {
        let mut channel = NetChannel::new("c", PipeTransport::new(vec![]), None);
        channel.close().unwrap();
        assert_eq!(
            channel.set_send(FrameSend::new("c", vec![])),
            Err(SetSendError::Disconnected)
        );
    }
}
