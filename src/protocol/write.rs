//! Sends bytes to the IEC bus, with us as talker.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use super::driver::DriverError;
use super::iec::{BusLine, IecDriver, IO_ATN, IO_CLK, IO_DATA};
use super::ProtocolFlags;
use crate::constants::PROTOCOL_YIELD_TIMER;
use crate::fmt::{debug, trace};
use crate::infra::watchdog::Watchdog;
use crate::util::time::iec::{IEC_T_BB, IEC_T_R, IEC_T_S, IEC_T_V};
use crate::util::time::{block_us, iec_delay, yield_for};

impl<L: BusLine, W: Watchdog> IecDriver<L, W> {
    /// Writes a buffer to the bus.
    ///
    /// Claims the bus (with ATN asserted too if requested), then sends
    /// each byte with the listener handshake.  The last byte of a
    /// non-ATN message is preceded by the elongated EOI turnaround.  On
    /// success, either releases ATN or performs the talk handover,
    /// depending on the flags.
    ///
    /// The write is all or nothing: any failure abandons the remaining
    /// bytes and returns an error, even if some bytes were accepted.
    /// Starting a write clears the sticky EOI flag from any earlier read.
    pub async fn raw_write(
        &mut self,
        buf: &[u8],
        flags: ProtocolFlags,
    ) -> Result<usize, DriverError> {
        trace!(
            "Raw write: {} bytes, atn {}, talk {}",
            buf.len(),
            flags.is_atn(),
            flags.is_talk()
        );
        self.clear_eoi();

        // Claim the bus.
        self.bus.release_data();
        if flags.is_atn() {
            self.bus.set_lines(IO_CLK | IO_ATN);
        } else {
            self.bus.set_lines(IO_CLK);
        }
        iec_delay!();

        // At least one device must respond by asserting DATA.
        if !self.wait_timeout_2ms(IO_DATA, IO_DATA) {
            debug!("Raw write: no devices present on the bus");
            self.bus.release_lines(IO_CLK | IO_ATN);
            return Err(DriverError::NoDevices);
        }

        let result = self.write_loop(buf, flags).await;
        self.terminate_write(result, flags).await?;
        Ok(buf.len())
    }

    async fn write_loop(&mut self, buf: &[u8], flags: ProtocolFlags) -> Result<(), DriverError> {
        for (ii, byte) in buf.iter().enumerate() {
            // Give the lines a moment to settle before checking the
            // listener is still there.
            block_us!(50);
            if !self.bus.get_data() {
                debug!("Raw write: device vanished before byte {}", ii);
                return Err(DriverError::NoDevice);
            }

            self.wait_for_listener().await;

            if ii == buf.len() - 1 && !flags.is_atn() {
                // Signal EOI before the final byte: leave CLOCK released
                // until the listener pulses DATA to acknowledge.
                self.wait_timeout_2ms(IO_DATA, IO_DATA);
                self.wait_timeout_2ms(IO_DATA, 0);
            }
            self.bus.set_clock();

            if !self.send_byte(*byte) {
                debug!("Raw write: byte {} not acknowledged", ii);
                return Err(DriverError::Io);
            }

            block_us!(IEC_T_BB);
            self.feed_watchdog();
        }
        Ok(())
    }

    /// Puts the bus into its post-write state.  On failure we just let go
    /// of the lines we were driving.
    async fn terminate_write(
        &mut self,
        result: Result<(), DriverError>,
        flags: ProtocolFlags,
    ) -> Result<(), DriverError> {
        match result {
            Ok(()) => {
                if flags.is_talk() {
                    // Talk handover: hand CLOCK to the device and wait,
                    // as listener, for it to take over as talker.
                    self.set_release(IO_DATA, IO_CLK | IO_ATN);
                    iec_delay!();
                    while !self.bus.get_clock() {
                        self.feed_watchdog();
                        yield_for!(PROTOCOL_YIELD_TIMER);
                    }
                } else {
                    self.bus.release_atn();
                }
                block_us!(100);
                Ok(())
            }
            Err(e) => {
                block_us!(IEC_T_R);
                self.bus.release_lines(IO_CLK | IO_ATN);
                Err(e)
            }
        }
    }

    /// Sends a single byte, least significant bit first.  Returns whether
    /// the listener acknowledged it.
    ///
    /// Timing critical, so blocking throughout.  Each bit is presented
    /// with CLOCK released for T_V; a released DATA line is a 1.
    fn send_byte(&mut self, byte: u8) -> bool {
        let mut data = byte;
        for _ in 0..8 {
            // Longer than the nominal T_S, for reliability with some
            // drives.
            block_us!(IEC_T_S + 50);

            if data & 1 == 0 {
                self.bus.set_data();
                iec_delay!();
            }

            // Clock the bit out.
            self.bus.release_clock();
            block_us!(IEC_T_V);
            self.set_release(IO_CLK, IO_DATA);

            data >>= 1;
        }

        // The listener has 2ms to assert DATA in acknowledgement.
        let ack = self.wait_timeout_2ms(IO_DATA, IO_DATA);
        if !ack {
            debug!("Send byte: no acknowledgement");
        }
        ack
    }
}
