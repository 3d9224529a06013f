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

//! Size-delimited framing: each frame is a 4-byte big-endian length prefix
//! followed by the payload. Both directions track their own progress so a
//! frame can be resumed across multiple readiness events.

use std::io::{self, Read, Write};

use crate::nonblock::{IoStatus, ReadNonblocking, WriteNonblocking};

const HEADER_SIZE: usize = 4;

/// A single outbound frame addressed to a connection id.
///
/// The frame keeps its own write cursor: [`FrameSend::write_to`] makes as
/// much progress as the sink accepts without blocking and may be called any
/// number of times until [`FrameSend::completed`].
#[derive(Clone, Debug)]
pub struct FrameSend {
    destination: String,
    buf: Vec<u8>,
    written: usize,
}

impl FrameSend {
    pub fn new(destination: impl ToString, payload: Vec<u8>) -> Self {
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Self {
            destination: destination.to_string(),
            buf,
            written: 0,
        }
    }

    /// Id of the connection this frame is addressed to.
    pub fn destination(&self) -> &str { &self.destination }

    /// On-wire size of the frame, header included.
    pub fn size(&self) -> usize { self.buf.len() }

    pub fn payload(&self) -> &[u8] { &self.buf[HEADER_SIZE..] }

    pub fn completed(&self) -> bool { self.written == self.buf.len() }

    /// Writes the remaining part of the frame, returning the number of bytes
    /// accepted by the sink during this call.
    pub fn write_to(&mut self, writer: &mut impl Write) -> io::Result<usize> {
        let before = self.written;
        while self.written < self.buf.len() {
            match writer.write_nonblocking(&self.buf[self.written..]) {
                IoStatus::Success(len) => self.written += len,
                IoStatus::WouldBlock => break,
                IoStatus::Shutdown => return Err(io::ErrorKind::ConnectionAborted.into()),
                IoStatus::Err(err) => return Err(err),
            }
        }
        Ok(self.written - before)
    }
}

/// A single inbound frame parsed incrementally from a connection.
///
/// [`FrameReceive::read_from`] consumes whatever the source has buffered,
/// first the length header and then the payload, and may be called any number
/// of times until [`FrameReceive::complete`].
#[derive(Debug)]
pub struct FrameReceive {
    source: String,
    max_size: Option<usize>,
    header: [u8; HEADER_SIZE],
    header_read: usize,
    payload: Vec<u8>,
    payload_read: usize,
}

impl FrameReceive {
    pub fn new(source: impl ToString, max_size: Option<usize>) -> Self {
        Self {
            source: source.to_string(),
            max_size,
            header: [0u8; HEADER_SIZE],
            header_read: 0,
            payload: vec![],
            payload_read: 0,
        }
    }

    /// Id of the connection this frame arrived from.
    pub fn source(&self) -> &str { &self.source }

    /// On-wire size of the frame, header included. Meaningful only once the
    /// header has been parsed.
    pub fn size(&self) -> usize { HEADER_SIZE + self.payload.len() }

    pub fn payload(&self) -> &[u8] { &self.payload[..self.payload_read] }

    pub fn into_payload(self) -> Vec<u8> { self.payload }

    pub fn complete(&self) -> bool {
        self.header_read == HEADER_SIZE && self.payload_read == self.payload.len()
    }

    /// Reads as much of the frame as the source has available, returning the
    /// number of bytes consumed during this call.
    ///
    /// An orderly shutdown by the peer surfaces as [`io::ErrorKind::UnexpectedEof`];
    /// a declared length above the configured maximum as
    /// [`io::ErrorKind::InvalidData`].
    pub fn read_from(&mut self, reader: &mut impl Read) -> io::Result<usize> {
        let mut total = 0;

        while self.header_read < HEADER_SIZE {
            match reader.read_nonblocking(&mut self.header[self.header_read..]) {
                IoStatus::Success(len) => {
                    self.header_read += len;
                    total += len;
                }
                IoStatus::WouldBlock => return Ok(total),
                IoStatus::Shutdown => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "remote peer closed the connection",
                    ))
                }
                IoStatus::Err(err) => return Err(err),
            }
            if self.header_read == HEADER_SIZE {
                let length = u32::from_be_bytes(self.header) as usize;
                if let Some(limit) = self.max_size {
                    if length > limit {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "frame of {length} bytes exceeds the receive limit of {limit} \
                                 bytes"
                            ),
                        ));
                    }
                }
                self.payload = vec![0u8; length];
            }
        }

        while self.payload_read < self.payload.len() {
            match reader.read_nonblocking(&mut self.payload[self.payload_read..]) {
                IoStatus::Success(len) => {
                    self.payload_read += len;
                    total += len;
                }
                IoStatus::WouldBlock => return Ok(total),
                IoStatus::Shutdown => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "remote peer closed the connection",
                    ))
                }
                IoStatus::Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    #[cfg(test)]
    pub(crate) fn completed(source: &str, payload: &[u8]) -> Self {
        Self {
            source: source.to_string(),
            max_size: None,
            header: (payload.len() as u32).to_be_bytes(),
            header_read: HEADER_SIZE,
            payload: payload.to_vec(),
            payload_read: payload.len(),
        }
    }
}
