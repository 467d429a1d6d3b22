//! Time and delay handling.
//!
//! The IEC protocol is timing sensitive at the microsecond level, so the
//! transfer primitives block the executor with [`block_until`] style spins
//! while a byte is on the wire.  Between bytes, and anywhere a device may
//! legitimately take a long time to respond, the driver yields instead so
//! the rest of the system keeps running.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

/// Blocks (without yielding) until the given [`Instant`].
#[inline(always)]
pub fn block_until(deadline: Instant) {
    while Instant::now() < deadline {}
}

/// Blocks (without yielding) for the given [`Duration`].
#[inline(always)]
pub fn block_for(duration: Duration) {
    block_until(Instant::now() + duration);
}

/// Blocks for the given number of microseconds.
macro_rules! block_us {
    ($us:expr) => {
        $crate::util::time::block_for(embassy_time::Duration::from_micros($us))
    };
}
pub(crate) use block_us;

/// The standard short IEC settle delay, 2us.
macro_rules! iec_delay {
    () => {
        $crate::util::time::block_us!(2)
    };
}
pub(crate) use iec_delay;

/// Yields to the executor for the given [`Duration`].
macro_rules! yield_for {
    ($duration:expr) => {
        embassy_time::Timer::after($duration).await
    };
}
pub(crate) use yield_for;

/// Yields to the executor for the given number of microseconds.
macro_rules! yield_us {
    ($us:expr) => {
        embassy_time::Timer::after_micros($us).await
    };
}
pub(crate) use yield_us;

/// Yields to the executor for the given number of milliseconds.
macro_rules! yield_ms {
    ($ms:expr) => {
        embassy_time::Timer::after_millis($ms).await
    };
}
pub(crate) use yield_ms;

/// IEC bus timing values.
///
/// The T_* values are from the C64 Programmer's Reference Guide, padded
/// where experience shows real drives need more margin.
#[allow(dead_code)]
pub(crate) mod iec {
    use embassy_time::Duration;

    /// How long to hold RESET asserted during a bus reset.
    pub const RESET_HOLD: Duration = Duration::from_millis(30);

    /// How long to wait for the bus to become free after a reset before
    /// giving up.
    pub const BUS_FREE_TIMEOUT: Duration = Duration::from_secs(2);

    /// How long to yield between bus free checks.
    pub const BUS_FREE_CHECK_YIELD: Duration = Duration::from_millis(1);

    /// How long to yield between checks when waiting for a listener to
    /// accept a byte.  Listeners hold DATA for as long as they need, so
    /// this wait is unbounded and the interval just bounds our latency.
    pub const LISTENER_WAIT_INTERVAL: Duration = Duration::from_micros(1);

    /// How long to wait for a talker to release CLOCK at the start of a
    /// byte.  Drives can be busy for a long time (directory searches,
    /// floppy seeks) before the first byte appears.
    pub const READ_CLK_START_TIMEOUT: Duration = Duration::from_secs(1);

    /// How long the talker has to re-assert CLOCK before the pause is
    /// taken as an EOI signal.
    pub const READ_CLK_TIMEOUT: Duration = Duration::from_micros(400);

    /// Stand-in for an unbounded wait.
    pub const FOREVER_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

    /// T_NE: non-EOI response time, in us.
    pub const IEC_T_NE: u64 = 40;

    /// T_S: bit setup time, in us.
    pub const IEC_T_S: u64 = 20;

    /// T_V: bit valid time, in us.
    pub const IEC_T_V: u64 = 20;

    /// T_R: frame to release of ATN, in us.
    pub const IEC_T_R: u64 = 20;

    /// T_BB: time between bytes, in us.
    pub const IEC_T_BB: u64 = 100;
}
