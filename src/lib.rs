//! cbm-iec - a Commodore IEC serial bus protocol engine.
//!
//! Implements the device side of a USB-to-IEC adapter: the bit and byte
//! level transfer state machines, bus reset and negotiation, and a
//! single-slot command engine that lets a host stage one bus operation
//! at a time and collect its outcome.
//!
//! The crate is `no_std` and hardware agnostic.  Embedders supply the
//! four open-collector bus lines through the [`BusLine`] trait, the host
//! link through [`HostTransport`], and optionally a hardware watchdog
//! through [`Watchdog`].  Timing uses `embassy-time`, so any target with
//! an embassy time driver works, including the host for tests.
//!
//! ```ignore
//! let bus = IecBus::new(clock, data, atn, reset);
//! let driver = IecDriver::new(bus, watchdog);
//! let mut handler = ProtocolHandler::new(driver, transport);
//!
//! handler.init().await;
//! handler.request_async(&[0x28, 0xf0], ProtocolFlags::CBM_ATN);
//! handler.handle().await;
//! let (state, result) = handler.get_result();
//! ```

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![cfg_attr(not(test), no_std)]

mod constants;
mod fmt;
mod infra;
mod protocol;
mod util;

pub use constants::IO_BUFFER_SIZE;
pub use infra::watchdog::{NoopWatchdog, Watchdog};
pub use protocol::driver::DriverError;
pub use protocol::iec::{
    BusLine, IecBus, IecDriver, IEC_ATN, IEC_CLOCK, IEC_DATA, IEC_RESET,
};
pub use protocol::{HostTransport, ProtocolFlags, ProtocolHandler, RequestState};
