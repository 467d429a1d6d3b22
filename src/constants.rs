//! Crate-wide constants.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Duration;
use static_assertions::const_assert;

/// Size of the single command buffer shared by writes and reads.
pub const IO_BUFFER_SIZE: usize = 64;

// The result byte doubles as a transfer count, so the buffer must fit in
// a u8, and the protocol assumes at least a couple of bytes of headroom.
const_assert!(IO_BUFFER_SIZE <= u8::MAX as usize);
const_assert!(IO_BUFFER_SIZE >= 2);

/// How long protocol loops pause for when yielding, to allow other tasks
/// to run.
pub(crate) const PROTOCOL_YIELD_TIMER_US: u64 = 10;

/// [`PROTOCOL_YIELD_TIMER_US`] as a [`Duration`].
pub(crate) const PROTOCOL_YIELD_TIMER: Duration =
    Duration::from_micros(PROTOCOL_YIELD_TIMER_US);
