//! Stream handle helpers
//!
//! `StreamHandle` wraps a non-blocking stream socket and keeps the two
//! flags the loop turns into poller interest: reading and waiting for
//! writability.
//!
//! Reads report one of four statuses. `Empty` means the socket had no
//! bytes and no end-of-stream (a would-block read); only `Eof` ends the
//! read side.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::event::Source;
use mio::Interest;
use nix::errno::Errno;

use crate::sys::errno_of;

/// Result of one native read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were read into the buffer
    Data(usize),
    /// No bytes and no end-of-stream
    Empty,
    /// Peer closed its write side
    Eof,
    /// Read failed
    Error(Errno),
}

/// Result of one native write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// This many bytes were accepted by the kernel
    Written(usize),
    /// Send buffer full
    Blocked,
    /// Write failed
    Error(Errno),
}

/// Stream sockets the loop can drive
pub trait StreamIo: Source + Read + Write {
    /// Half-close the write side
    fn shutdown_write(&self) -> io::Result<()>;
}

impl StreamIo for mio::net::TcpStream {
    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl StreamIo for mio::net::UnixStream {
    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

/// A stream socket plus its read/write interest flags
pub struct StreamHandle<S> {
    io: S,
    reading: bool,
    want_write: bool,
    write_shut: bool,
}

impl<S: StreamIo> StreamHandle<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            reading: false,
            want_write: false,
            write_shut: false,
        }
    }

    #[inline]
    pub fn get_ref(&self) -> &S {
        &self.io
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Start delivering readable events. Idempotent.
    #[inline]
    pub fn read_start(&mut self) {
        self.reading = true;
    }

    /// Stop delivering readable events. Idempotent.
    #[inline]
    pub fn read_stop(&mut self) {
        self.reading = false;
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// Ask for (or stop asking for) writable events
    #[inline]
    pub fn set_want_write(&mut self, on: bool) {
        self.want_write = on;
    }

    #[inline]
    pub fn wants_write(&self) -> bool {
        self.want_write
    }

    /// Interest matching the current flags
    pub fn interest(&self) -> Option<Interest> {
        match (self.reading, self.want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// One read into `buf`
    pub fn read_into(&mut self, buf: &mut [u8]) -> ReadStatus {
        loop {
            match self.io.read(buf) {
                Ok(0) if !buf.is_empty() => return ReadStatus::Eof,
                Ok(0) => return ReadStatus::Empty,
                Ok(n) => return ReadStatus::Data(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadStatus::Empty,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadStatus::Error(errno_of(&e)),
            }
        }
    }

    /// One write of `data`
    pub fn try_write(&mut self, data: &[u8]) -> WriteStatus {
        loop {
            match self.io.write(data) {
                Ok(n) => return WriteStatus::Written(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return WriteStatus::Blocked,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return WriteStatus::Error(errno_of(&e)),
            }
        }
    }

    /// Send FIN. Only the first call reaches the socket.
    pub fn shutdown_write(&mut self) -> Result<(), Errno> {
        if self.write_shut {
            return Ok(());
        }
        self.write_shut = true;
        self.want_write = false;
        match self.io.shutdown_write() {
            Ok(()) => Ok(()),
            // peer already gone, nothing left to half-close
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(errno_of(&e)),
        }
    }

    #[inline]
    pub fn is_write_shut(&self) -> bool {
        self.write_shut
    }
}
