//! Receives bytes from the IEC bus, with us as listener.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::driver::DriverError;
use super::iec::{BusLine, IecDriver, IO_CLK};
use crate::fmt::{debug, trace, warn};
use crate::infra::watchdog::Watchdog;
use crate::util::time::block_us;
use crate::util::time::iec::{READ_CLK_START_TIMEOUT, READ_CLK_TIMEOUT};

impl<L: BusLine, W: Watchdog> IecDriver<L, W> {
    /// Reads bytes from the bus into `buf`, assuming a device is already
    /// talking (i.e. after a talk handover).
    ///
    /// Stops at whichever comes first: the buffer is full, the talker
    /// signals EOI, or an error occurs.  The EOI flag is sticky - it
    /// survives the end of this call so a follow-up read returns zero
    /// bytes immediately, and is only cleared when a new write starts.
    ///
    /// On error the count of bytes successfully received before the
    /// failure is returned alongside the error; those bytes are valid.
    pub async fn raw_read(&mut self, buf: &mut [u8]) -> Result<usize, (DriverError, usize)> {
        trace!("Raw read: up to {} bytes", buf.len());
        let mut count = 0;

        while count < buf.len() {
            // A previous byte (or a previous read) may already have seen
            // EOI, in which case there is nothing more to come.
            if self.get_eoi() {
                debug!("Raw read: EOI already signalled, {} bytes", count);
                break;
            }

            // Wait for the talker to release CLOCK, announcing a byte.
            // This can take a while if the drive is busy, e.g. searching
            // a directory, hence the long yielding wait.
            if let Err(e) = self
                .wait_timeout_yield(IO_CLK, 0, READ_CLK_START_TIMEOUT)
                .await
            {
                debug!("Raw read: talker never announced a byte");
                return Err((e, count));
            }

            // Tell the talker we are ready.
            self.bus.release_data();

            // If the talker does not re-assert CLOCK promptly, the pause
            // is the EOI signal: acknowledge it with a DATA pulse.
            if !self.wait_timeout_block(IO_CLK, IO_CLK, READ_CLK_TIMEOUT) {
                debug!("Raw read: EOI signalled by talker");
                self.set_eoi();
                self.bus.set_data();
                block_us!(70);
                self.bus.release_data();
            }

            let byte = match self.receive_byte() {
                Ok(byte) => byte,
                Err(e) => {
                    warn!("Raw read: receive failed after {} bytes", count);
                    return Err((e, count));
                }
            };

            // Acknowledge the byte.
            self.bus.set_data();

            buf[count] = byte;
            count += 1;

            block_us!(50);
            self.feed_watchdog();
        }

        trace!("Raw read: {} bytes received", count);
        Ok(count)
    }

    /// Receives the eight bits of one byte, least significant first.
    ///
    /// The bit windows are only ~60us wide, so the whole byte is sampled
    /// inside a critical section to keep interrupt jitter out.
    fn receive_byte(&mut self) -> Result<u8, DriverError> {
        critical_section::with(|_| {
            // Wait for the talker to start the byte.
            if !self.wait_timeout_2ms(IO_CLK, IO_CLK) {
                debug!("Receive byte: talker did not start");
                return Err(DriverError::Timeout);
            }

            let mut byte = 0u8;
            for _ in 0..8 {
                // CLOCK released means the bit is valid on DATA.
                if !self.wait_timeout_2ms(IO_CLK, 0) {
                    return Err(DriverError::Timeout);
                }

                byte >>= 1;
                if !self.bus.get_data() {
                    byte |= 0x80;
                }

                // Wait for the talker to start the next bit.
                if !self.wait_timeout_2ms(IO_CLK, IO_CLK) {
                    return Err(DriverError::Timeout);
                }
            }
            Ok(byte)
        })
    }
}
