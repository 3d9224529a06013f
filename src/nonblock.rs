use std::io::{self, Read, Write};

/// Outcome of a single non-blocking I/O attempt.
pub enum IoStatus {
    /// Progress was made; carries the number of bytes transferred.
    Success(usize),
    /// The operation can't proceed right now; retry on the next readiness
    /// event.
    WouldBlock,
    /// Orderly shutdown of the stream by the remote peer.
    Shutdown,
    /// Hard I/O failure.
    Err(io::Error),
}

pub trait ReadNonblocking: Read {
    /// Reads from a non-blocking source, classifying the outcome.
    ///
    /// A zero-byte read into a non-empty buffer means the peer has closed the
    /// stream and maps to [`IoStatus::Shutdown`].
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> IoStatus {
        match self.read(buf) {
            Ok(0) if !buf.is_empty() => IoStatus::Shutdown,
            Ok(len) => IoStatus::Success(len),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => IoStatus::WouldBlock,
            Err(err) => IoStatus::Err(err),
        }
    }
}

impl<T: Read + ?Sized> ReadNonblocking for T {}

pub trait WriteNonblocking: Write {
    /// Writes to a non-blocking sink, classifying the outcome.
    fn write_nonblocking(&mut self, buf: &[u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Success(0);
        }
        match self.write(buf) {
            Ok(0) => IoStatus::WouldBlock,
            Ok(len) => IoStatus::Success(len),
            Err(err) if err.kind() == io::ErrorKind::WriteZero => IoStatus::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => IoStatus::WouldBlock,
            Err(err) => IoStatus::Err(err),
        }
    }
}

impl<T: Write + ?Sized> WriteNonblocking for T {}
