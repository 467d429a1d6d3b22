//! Protocol driver error type.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

/// Errors the bus driver can hit during a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    /// No device responded when the bus was claimed - nothing asserted
    /// DATA after ATN/CLOCK went active.
    NoDevices,

    /// A device was present at the start of the transfer but disappeared
    /// part way through.
    NoDevice,

    /// A line handshake did not complete in time.
    Timeout,

    /// The device did not acknowledge a byte.
    Io,
}
