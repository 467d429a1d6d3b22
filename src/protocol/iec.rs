//! IEC bus abstraction and the low-level bus driver.
//!
//! The bus has four open-collector lines: DATA, CLOCK, ATN and RESET.
//! Asserting a line pulls it low; releasing it lets the pull-ups take it
//! high.  A line reads as asserted if any party on the bus is pulling it.
//!
//! [`BusLine`] is the seam to the hardware: one implementation per line,
//! supplied by the embedder.  [`IecBus`] groups the four lines and adds
//! mask based set/release/poll.  [`IecDriver`] layers the line-level
//! protocol on top: reset and bus-free negotiation, the handshake waits,
//! and EOI state.  Whole-byte and whole-buffer transfers live in the
//! `read` and `write` modules.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{with_timeout, Duration, Instant};

use super::driver::DriverError;
use crate::constants::PROTOCOL_YIELD_TIMER;
use crate::fmt::{debug, trace};
use crate::infra::watchdog::Watchdog;
use crate::util::time::iec::{
    BUS_FREE_CHECK_YIELD, BUS_FREE_TIMEOUT, FOREVER_TIMEOUT, LISTENER_WAIT_INTERVAL, RESET_HOLD,
};
use crate::util::time::{block_us, yield_for, yield_ms};

/// Logical line identifier for DATA, as used by the host-facing API.
pub const IEC_DATA: u8 = 0x01;

/// Logical line identifier for CLOCK.
pub const IEC_CLOCK: u8 = 0x02;

/// Logical line identifier for ATN.
pub const IEC_ATN: u8 = 0x04;

/// Logical line identifier for RESET.
pub const IEC_RESET: u8 = 0x08;

// Driver-internal line masks.  These happen to share values with the
// logical identifiers but are kept distinct so the host-facing encoding
// can change without touching the driver.
pub(crate) const IO_DATA: u8 = 0x01;
pub(crate) const IO_CLK: u8 = 0x02;
pub(crate) const IO_ATN: u8 = 0x04;
pub(crate) const IO_RESET: u8 = 0x08;

// Maps each combination of logical line bits to driver masks.  Indexed by
// the low four bits of the logical value.
const IEC2HW_TABLE: [u8; 16] = [
    0,
    IO_DATA,
    IO_CLK,
    IO_CLK | IO_DATA,
    IO_ATN,
    IO_ATN | IO_DATA,
    IO_ATN | IO_CLK,
    IO_ATN | IO_CLK | IO_DATA,
    IO_RESET,
    IO_RESET | IO_DATA,
    IO_RESET | IO_CLK,
    IO_RESET | IO_CLK | IO_DATA,
    IO_RESET | IO_ATN,
    IO_RESET | IO_ATN | IO_DATA,
    IO_RESET | IO_ATN | IO_CLK,
    IO_RESET | IO_ATN | IO_CLK | IO_DATA,
];

/// Converts a mask of logical line identifiers to driver line masks.
/// Bits outside the low four are ignored.
pub(crate) fn iec2hw(iec: u8) -> u8 {
    IEC2HW_TABLE[usize::from(iec & 0x0f)]
}

/// A single open-collector bus line, as driven and read by this device.
///
/// `set` pulls the line low (asserted), `release` stops driving it.
/// `get` reads the wire, so reports asserted if anyone is pulling the
/// line, not just us.
pub trait BusLine {
    /// Assert the line.
    fn set(&mut self);

    /// Stop driving the line.
    fn release(&mut self);

    /// Whether the line is asserted by any party.
    fn get(&self) -> bool;
}

/// The four lines of an IEC bus.
pub struct IecBus<L: BusLine> {
    clock: L,
    data: L,
    atn: L,
    reset: L,
}

impl<L: BusLine> IecBus<L> {
    /// Creates the bus and releases all four lines.
    pub fn new(clock: L, data: L, atn: L, reset: L) -> Self {
        let mut bus = Self {
            clock,
            data,
            atn,
            reset,
        };
        bus.release_lines(IO_DATA | IO_CLK | IO_ATN | IO_RESET);
        bus
    }

    #[inline(always)]
    pub fn set_data(&mut self) {
        self.data.set();
    }

    #[inline(always)]
    pub fn release_data(&mut self) {
        self.data.release();
    }

    #[inline(always)]
    pub fn get_data(&self) -> bool {
        self.data.get()
    }

    #[inline(always)]
    pub fn set_clock(&mut self) {
        self.clock.set();
    }

    #[inline(always)]
    pub fn release_clock(&mut self) {
        self.clock.release();
    }

    #[inline(always)]
    pub fn get_clock(&self) -> bool {
        self.clock.get()
    }

    #[inline(always)]
    pub fn set_atn(&mut self) {
        self.atn.set();
    }

    #[inline(always)]
    pub fn release_atn(&mut self) {
        self.atn.release();
    }

    #[inline(always)]
    pub fn get_atn(&self) -> bool {
        self.atn.get()
    }

    #[inline(always)]
    pub fn set_reset(&mut self) {
        self.reset.set();
    }

    #[inline(always)]
    pub fn release_reset(&mut self) {
        self.reset.release();
    }

    /// Asserts every line in the mask.
    pub fn set_lines(&mut self, mask: u8) {
        if mask & IO_DATA != 0 {
            self.data.set();
        }
        if mask & IO_CLK != 0 {
            self.clock.set();
        }
        if mask & IO_ATN != 0 {
            self.atn.set();
        }
        if mask & IO_RESET != 0 {
            self.reset.set();
        }
    }

    /// Releases every line in the mask.
    pub fn release_lines(&mut self, mask: u8) {
        if mask & IO_DATA != 0 {
            self.data.release();
        }
        if mask & IO_CLK != 0 {
            self.clock.release();
        }
        if mask & IO_ATN != 0 {
            self.atn.release();
        }
        if mask & IO_RESET != 0 {
            self.reset.release();
        }
    }

    /// Returns the mask of lines which are currently inactive (released).
    ///
    /// This is the polarity the handshake waits use, matching an open
    /// collector bus where a released line floats high.
    pub fn poll_pins(&self) -> u8 {
        let mut pins = 0;
        if !self.data.get() {
            pins |= IO_DATA;
        }
        if !self.clock.get() {
            pins |= IO_CLK;
        }
        if !self.atn.get() {
            pins |= IO_ATN;
        }
        if !self.reset.get() {
            pins |= IO_RESET;
        }
        pins
    }
}

/// The low-level IEC bus driver.
///
/// Owns the bus, the sticky EOI flag and the watchdog.  All state that
/// persists between transfers lives here.
pub struct IecDriver<L: BusLine, W: Watchdog> {
    pub(crate) bus: IecBus<L>,
    eoi: bool,
    watchdog: W,
}

impl<L: BusLine, W: Watchdog> IecDriver<L, W> {
    pub fn new(bus: IecBus<L>, watchdog: W) -> Self {
        Self {
            bus,
            eoi: false,
            watchdog,
        }
    }

    /// Whether the last read ended with the talker signalling EOI.
    pub fn get_eoi(&self) -> bool {
        self.eoi
    }

    /// Clears the sticky EOI flag.
    pub fn clear_eoi(&mut self) {
        self.eoi = false;
    }

    pub(crate) fn set_eoi(&mut self) {
        self.eoi = true;
    }

    #[inline(always)]
    pub(crate) fn feed_watchdog(&mut self) {
        self.watchdog.feed();
    }

    /// Resets the bus.
    ///
    /// Releases all lines we might be holding, pulses RESET for long
    /// enough that even slow drives restart, then waits for the bus to
    /// become free.  With `forever` set the bus-free wait never times
    /// out; otherwise it gives up after [`BUS_FREE_TIMEOUT`].
    pub async fn reset(&mut self, forever: bool) -> Result<(), DriverError> {
        debug!("Reset the IEC bus");
        self.clear_eoi();
        self.bus.release_lines(IO_DATA | IO_ATN | IO_CLK);

        // Drives need RESET held for tens of ms to fully restart.  20ms
        // is not enough for a 1541's motor to spin down.
        self.bus.set_reset();
        yield_ms!(RESET_HOLD.as_millis());
        self.bus.release_reset();

        self.wait_for_free_bus(forever).await
    }

    /// Waits for the bus to become free, by repeatedly probing it with
    /// ATN and seeing whether a drive answers.
    pub async fn wait_for_free_bus(&mut self, forever: bool) -> Result<(), DriverError> {
        let timeout = if forever {
            FOREVER_TIMEOUT
        } else {
            BUS_FREE_TIMEOUT
        };

        match with_timeout(timeout, self.check_bus_until_free()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                debug!("Timed out waiting for the bus to become free");
                Err(DriverError::Timeout)
            }
        }
    }

    async fn check_bus_until_free(&mut self) {
        loop {
            if self.check_if_bus_free() {
                return;
            }
            self.feed_watchdog();
            yield_for!(BUS_FREE_CHECK_YIELD);
        }
    }

    /// A single bus-free probe.  Blocks for roughly 300us.
    ///
    /// The bus counts as free once DATA is stable high and at least one
    /// drive answers an ATN toggle by pulsing DATA, then lets go again.
    fn check_if_bus_free(&mut self) -> bool {
        // Let go of everything and give the drive time to react.
        self.bus
            .release_lines(IO_ATN | IO_CLK | IO_DATA | IO_RESET);
        block_us!(50);

        // If DATA is held, the drive is not ready.
        if self.bus.get_data() {
            return false;
        }

        // DATA can glitch if it was stable for under ~40us before ATN
        // goes active, so require another 50us of quiet.
        block_us!(50);
        if self.bus.get_data() {
            return false;
        }

        // Assert ATN.  A powered drive answers almost immediately.
        self.bus.set_atn();
        block_us!(100);

        if !self.bus.get_data() {
            // No drive answered.
            self.bus.release_atn();
            return false;
        }

        // At least one drive reacted.  Check it releases DATA again once
        // ATN goes away.
        self.bus.release_atn();
        block_us!(100);
        !self.bus.get_data()
    }

    /// Spins for up to 2ms while the masked released-line bits equal
    /// `state`.  Returns true if they changed in time.
    ///
    /// This is the standard intra-byte handshake wait and deliberately
    /// does not yield.
    pub(crate) fn wait_timeout_2ms(&mut self, mask: u8, state: u8) -> bool {
        self.wait_timeout_block(mask, state, Duration::from_millis(2))
    }

    /// As [`Self::wait_timeout_2ms`] with a caller-supplied timeout.
    pub(crate) fn wait_timeout_block(&mut self, mask: u8, state: u8, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline && (self.bus.poll_pins() & mask) == state {}
        (self.bus.poll_pins() & mask) != state
    }

    /// Yielding variant of the handshake wait, for spots where the other
    /// party can legitimately take a long time.  Feeds the watchdog while
    /// waiting.
    pub(crate) async fn wait_timeout_yield(
        &mut self,
        mask: u8,
        state: u8,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        while (self.bus.poll_pins() & mask) == state {
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout);
            }
            self.feed_watchdog();
            yield_for!(PROTOCOL_YIELD_TIMER);
        }
        Ok(())
    }

    /// Releases CLOCK then waits for the listener to release DATA,
    /// signalling it is ready for the next byte.
    ///
    /// Deliberately unbounded: a listener is allowed to hold DATA for as
    /// long as it needs, for example while flushing a sector to disk.
    pub(crate) async fn wait_for_listener(&mut self) {
        self.bus.release_clock();
        while self.bus.get_data() {
            self.feed_watchdog();
            yield_for!(LISTENER_WAIT_INTERVAL);
        }
    }

    /// Waits until the given logical line reaches the given state:
    /// non-zero `state` waits for asserted, zero for released.
    pub async fn wait(&mut self, line: u8, state: u8) -> Result<(), DriverError> {
        let mask = iec2hw(line);
        trace!("Wait for line 0x{:02x} to reach state {}", line, state);

        // poll_pins reports released lines, so wait while the bit still
        // shows the opposite of the requested state.
        let hw_state = if state != 0 { mask } else { 0 };
        self.wait_timeout_yield(mask, hw_state, FOREVER_TIMEOUT).await
    }

    /// Returns the logical lines currently asserted on the bus.  RESET is
    /// not reported.
    pub fn poll(&self) -> u8 {
        let mut line = 0;
        if self.bus.get_data() {
            line |= IEC_DATA;
        }
        if self.bus.get_clock() {
            line |= IEC_CLOCK;
        }
        if self.bus.get_atn() {
            line |= IEC_ATN;
        }
        line
    }

    /// Asserts then releases the given logical lines.  The set is applied
    /// before the release.
    pub fn setrelease(&mut self, set: u8, release: u8) {
        trace!("Set 0x{:02x} release 0x{:02x}", set, release);
        self.bus.set_lines(iec2hw(set));
        self.bus.release_lines(iec2hw(release));
    }

    /// Driver-internal set/release taking IO_* masks.
    pub(crate) fn set_release(&mut self, set: u8, release: u8) {
        self.bus.set_lines(set);
        self.bus.release_lines(release);
    }
}
