//! The IEC protocol engine.
//!
//! [`ProtocolHandler`] sits between a host transport (typically USB bulk
//! endpoints) and the [`IecDriver`].  The host enqueues one command at a
//! time into the single shared buffer - an asynchronous write, a plain
//! write, or a read - then calls [`ProtocolHandler::handle`] to execute
//! it on the bus, and collects the outcome with
//! [`ProtocolHandler::get_result`] or drains read data with
//! [`ProtocolHandler::read`].
//!
//! Only one command is in flight at a time; enqueueing replaces whatever
//! earlier result was pending.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod driver;
pub mod iec;
mod read;
mod write;

use bitflags::bitflags;
use heapless::Vec;

use crate::constants::IO_BUFFER_SIZE;
use crate::fmt::{debug, info, trace, warn};
use crate::infra::watchdog::Watchdog;
use crate::util::time::yield_us;
use driver::DriverError;
use iec::{BusLine, IecDriver, IEC_ATN, IEC_CLOCK, IEC_DATA, IEC_RESET};

bitflags! {
    /// Modifiers for a bus write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolFlags: u8 {
        const NONE = 0x00;

        /// Perform the talk handover after the write, leaving the device
        /// as talker and us as listener.
        const CBM_TALK = 0x01;

        /// Assert ATN for the duration of the write (the bytes are a bus
        /// command, not data).
        const CBM_ATN = 0x02;
    }
}

impl ProtocolFlags {
    pub fn is_atn(&self) -> bool {
        self.contains(Self::CBM_ATN)
    }

    pub fn is_talk(&self) -> bool {
        self.contains(Self::CBM_TALK)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ProtocolFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ProtocolFlags(0x{:02x})", self.bits());
    }
}

/// The host side of the engine: how staged write data arrives and read
/// data leaves.
///
/// Both calls are all-or-nothing and return whether the transfer
/// completed.  A failed transfer leaves the engine's state untouched so
/// the host can retry.
pub trait HostTransport {
    /// Sends `data` to the host.
    fn write_block(&mut self, data: &[u8]) -> bool;

    /// Fills `buf` from the host.
    fn read_block(&mut self, buf: &mut [u8]) -> bool;
}

/// The externally visible state of the command slot, as reported to the
/// host by [`ProtocolHandler::get_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RequestState {
    /// No command pending and no un-collected result.
    Idle = 0,

    /// An asynchronous write is queued but not yet executed.
    Async = 1,

    /// A write is queued but not yet executed.
    Write = 2,

    /// A read is queued but not yet executed.
    Read = 3,

    /// A read has completed; data is waiting to be drained.
    ReadDone = 4,

    /// A write has completed; the result byte is valid.
    Result = 5,
}

/// The pending command, including its parameters.  Collapses to a
/// [`RequestState`] for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Idle,
    Async { flags: ProtocolFlags },
    Write,
    Read { len: usize },
    ReadDone,
    Result,
}

impl Request {
    fn state(&self) -> RequestState {
        match self {
            Request::Idle => RequestState::Idle,
            Request::Async { .. } => RequestState::Async,
            Request::Write => RequestState::Write,
            Request::Read { .. } => RequestState::Read,
            Request::ReadDone => RequestState::ReadDone,
            Request::Result => RequestState::Result,
        }
    }
}

/// The protocol engine.  Owns the bus driver, the host transport and the
/// single command slot.
pub struct ProtocolHandler<L: BusLine, W: Watchdog, T: HostTransport> {
    driver: IecDriver<L, W>,
    transport: T,
    request: Request,
    buffer: Vec<u8, IO_BUFFER_SIZE>,
    result: u8,
}

impl<L: BusLine, W: Watchdog, T: HostTransport> ProtocolHandler<L, W, T> {
    pub fn new(driver: IecDriver<L, W>, transport: T) -> Self {
        Self {
            driver,
            transport,
            request: Request::Idle,
            buffer: Vec::new(),
            result: 0,
        }
    }

    /// Puts the engine and the bus into a known state: command slot
    /// empty, all lines released.
    pub async fn init(&mut self) {
        debug!("Protocol handler - init");
        self.request = Request::Idle;
        self.result = 0;
        self.buffer.clear();
        self.driver.clear_eoi();
        self.driver
            .setrelease(0, IEC_DATA | IEC_CLOCK | IEC_ATN | IEC_RESET);
        yield_us!(100);
    }

    /// Resets the bus.  A timeout waiting for the bus to become free is
    /// expected when no devices are attached, so it is only logged.
    pub async fn reset(&mut self) {
        debug!("Protocol handler - reset");
        if let Err(e) = self.driver.reset(false).await {
            match e {
                DriverError::Timeout => {
                    debug!("Timeout resetting the bus - expected if no devices attached")
                }
                _ => warn!("Hit error resetting the bus {}", e),
            }
        }
    }

    /// Stages an asynchronous write: `payload` is copied into the command
    /// buffer (truncated to its capacity) and executed on the next
    /// [`Self::handle`].  The result is a bare success/failure code.
    pub fn request_async(&mut self, payload: &[u8], flags: ProtocolFlags) {
        let len = payload.len().min(self.buffer.capacity());
        debug!("Request async write: {} bytes, {}", len, flags.bits());
        self.buffer.clear();
        let _ = self.buffer.extend_from_slice(&payload[..len]);
        self.request = Request::Async { flags };
    }

    /// Stages a write of `len` bytes (clamped to the buffer capacity),
    /// pulling the data from the host transport.  Returns the number of
    /// bytes staged, or zero - leaving the slot untouched - if the
    /// transport failed.
    pub fn request_write(&mut self, len: usize) -> usize {
        let len = len.min(self.buffer.capacity());
        debug!("Request write: {} bytes", len);
        self.buffer.clear();
        let _ = self.buffer.resize(len, 0);
        if !self.transport.read_block(&mut self.buffer) {
            warn!("Request write: host transport failed");
            self.buffer.clear();
            return 0;
        }
        self.request = Request::Write;
        len
    }

    /// Stages a read of up to `len` bytes (clamped to the buffer
    /// capacity), executed on the next [`Self::handle`].
    pub fn request_read(&mut self, len: usize) {
        let len = len.min(self.buffer.capacity());
        debug!("Request read: {} bytes", len);
        self.request = Request::Read { len };
    }

    /// Executes the pending command, if any.  No-op when the slot is
    /// idle or holds an un-collected result.
    pub async fn handle(&mut self) {
        match self.request {
            Request::Async { flags } => {
                trace!("Handle: async write of {} bytes", self.buffer.len());
                let result = self.driver.raw_write(&self.buffer, flags).await;
                self.result = u8::from(result.is_err());
                self.request = Request::Result;
            }
            Request::Write => {
                trace!("Handle: write of {} bytes", self.buffer.len());
                let written = self
                    .driver
                    .raw_write(&self.buffer, ProtocolFlags::NONE)
                    .await
                    .unwrap_or(0);
                self.result = written as u8;
                self.request = Request::Result;
            }
            Request::Read { len } => {
                trace!("Handle: read of up to {} bytes", len);
                self.buffer.clear();
                let _ = self.buffer.resize(len, 0);
                let count = match self.driver.raw_read(&mut self.buffer).await {
                    Ok(count) => count,
                    Err((e, count)) => {
                        info!("Read failed after {} bytes: {}", count, e);
                        count
                    }
                };
                self.buffer.truncate(count);
                self.result = count as u8;
                self.request = Request::ReadDone;
            }
            Request::Idle | Request::ReadDone | Request::Result => {}
        }
    }

    /// Drains up to `len` bytes of completed read data to the host
    /// transport and empties the slot.  Returns the number of bytes sent,
    /// or zero - leaving the slot untouched - if no read has completed or
    /// the transport failed.
    pub fn read(&mut self, len: usize) -> usize {
        if self.request != Request::ReadDone {
            warn!("Read drain with no completed read, state {}", self.request.state() as u8);
            return 0;
        }
        let len = len.min(self.buffer.len());
        if !self.transport.write_block(&self.buffer[..len]) {
            warn!("Read drain: host transport failed");
            return 0;
        }
        self.buffer.clear();
        self.request = Request::Idle;
        len
    }

    /// Reports the slot state and the result byte.  For writes the result
    /// is the byte count (or zero on failure); for asynchronous writes it
    /// is zero on success, one on failure; for reads it is the byte
    /// count.
    pub fn get_result(&self) -> (RequestState, u8) {
        (self.request.state(), self.result)
    }

    /// Waits until the given logical line reaches the given state.
    pub async fn wait(&mut self, line: u8, state: u8) -> Result<(), DriverError> {
        self.driver.wait(line, state).await
    }

    /// Returns the logical lines currently asserted on the bus.
    pub fn poll(&self) -> u8 {
        self.driver.poll()
    }

    /// Asserts then releases the given logical lines.
    pub fn set_release(&mut self, set: u8, release: u8) {
        self.driver.setrelease(set, release);
    }

    /// Whether the last read ended with the talker signalling EOI.
    pub fn get_eoi(&self) -> bool {
        self.driver.get_eoi()
    }

    /// Clears the sticky EOI flag.
    pub fn clear_eoi(&mut self) {
        self.driver.clear_eoi();
    }

    /// Access to the underlying bus driver, for operations outside the
    /// command slot such as a full bus reset that never times out.
    pub fn driver(&mut self) -> &mut IecDriver<L, W> {
        &mut self.driver
    }
}
