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

//! Pluggable byte-level transport under a channel. The plaintext variant
//! ships here; transports with a handshake (encryption etc.) implement the
//! same seam and report readiness only once the handshake completes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// Byte stream carrying a single connection, plus its connection lifecycle.
pub trait Transport: Read + Write + AsRawFd {
    /// Completes a pending non-blocking connect.
    ///
    /// Returns `true` once the TCP handshake is done; `false` while it is
    /// still in progress. Surfaces the connection error when the connect has
    /// failed. Idempotent once connected.
    fn finish_connect(&mut self) -> io::Result<bool>;

    /// Whether the TCP connection is established.
    fn is_connected(&self) -> bool;

    /// Advances any transport-level handshake. No-op once ready.
    fn prepare(&mut self) -> io::Result<()>;

    /// Whether the transport can carry user data.
    fn is_ready(&self) -> bool;

    /// Shuts the transport down. Idempotent.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Human-readable peer description for logs.
    fn peer_description(&self) -> String;
}

/// Transport passing bytes to the socket as-is.
pub struct PlaintextTransport {
    stream: TcpStream,
    connected: bool,
}

impl PlaintextTransport {
    /// Wraps a (possibly still connecting) non-blocking TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        let connected = stream.peer_addr().is_ok();
        Self { stream, connected }
    }

    pub fn stream(&self) -> &TcpStream { &self.stream }
}

impl Transport for PlaintextTransport {
    fn finish_connect(&mut self) -> io::Result<bool> {
        if self.connected {
            return Ok(true);
        }
        // A failed connect parks its error in SO_ERROR
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_connected(&self) -> bool { self.connected }

    fn prepare(&mut self) -> io::Result<()> { Ok(()) }

    fn is_ready(&self) -> bool { self.connected }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Shutting down a never-connected or already-reset socket is fine
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn peer_description(&self) -> String {
        match self.stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => format!("fd {}", self.stream.as_raw_fd()),
        }
    }
}

impl Read for PlaintextTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { self.stream.read(buf) }
}

impl Write for PlaintextTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.stream.write(buf) }

    fn flush(&mut self) -> io::Result<()> { self.stream.flush() }
}

impl AsRawFd for PlaintextTransport {
    fn as_raw_fd(&self) -> RawFd { self.stream.as_raw_fd() }
}
