//! A simulated IEC bus for exercising the protocol engine on the host.
//!
//! Each line is an open-collector wire modelled as an AtomicU8 with one
//! bit per party: bit 0 is the adapter (the code under test), bit 1 the
//! device at the other end.  A line reads as asserted if either party is
//! pulling it, which is exactly the wired-AND behaviour of the real bus.
//!
//! Device-side peers (listener, talker, ATN responder) run on plain
//! threads and spin-wait on the wires, reacting within microseconds like
//! drive hardware does.
//!
//! Both the peer and the engine spin against real-time windows (the 2ms
//! byte handshake, the 400us EOI detection), so the peer thread and the
//! test thread each need a CPU core to themselves.  On a single-core
//! host the peer cannot react in time and most tests fail with bus
//! timeouts rather than anything protocol related.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cbm_iec::{
    BusLine, HostTransport, IecBus, IecDriver, ProtocolHandler, Watchdog,
};

pub const DATA: usize = 0;
pub const CLOCK: usize = 1;
pub const ATN: usize = 2;
pub const RESET: usize = 3;

const ADAPTER_BIT: u8 = 0x01;
const DEVICE_BIT: u8 = 0x02;

/// How long a device-side peer waits for the adapter before giving up.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the listener waits for CLOCK to come back after signalling
/// readiness, before treating the pause as EOI.  Longer than the
/// engine's scheduling jitter, shorter than its 2ms EOI handshake
/// window.
const EOI_WATCH: Duration = Duration::from_micros(1500);

// The timing tests spin hard on several threads at once, so they take
// this lock to run one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Spins (without sleeping) for the given duration.  The bit windows on
/// the bus are tens of microseconds, well under OS sleep resolution.
pub fn spin_sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// The shared wires.
#[derive(Clone)]
pub struct SimBus {
    lines: Arc<[AtomicU8; 4]>,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            lines: Arc::new([
                AtomicU8::new(0),
                AtomicU8::new(0),
                AtomicU8::new(0),
                AtomicU8::new(0),
            ]),
        }
    }

    /// Whether any party is pulling the line.
    pub fn asserted(&self, line: usize) -> bool {
        self.lines[line].load(Ordering::SeqCst) != 0
    }

    /// The adapter's handle on one line.
    pub fn adapter_line(&self, line: usize) -> SimLine {
        SimLine {
            bus: self.clone(),
            line,
        }
    }

    /// A device-side handle on the whole bus.
    pub fn device(&self) -> SimDevice {
        SimDevice { bus: self.clone() }
    }
}

/// One line as driven by the adapter.
pub struct SimLine {
    bus: SimBus,
    line: usize,
}

impl BusLine for SimLine {
    fn set(&mut self) {
        self.bus.lines[self.line].fetch_or(ADAPTER_BIT, Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.bus.lines[self.line].fetch_and(!ADAPTER_BIT, Ordering::SeqCst);
    }

    fn get(&self) -> bool {
        self.bus.asserted(self.line)
    }
}

/// The device end of the bus.
pub struct SimDevice {
    bus: SimBus,
}

impl SimDevice {
    pub fn set(&self, line: usize) {
        self.bus.lines[line].fetch_or(DEVICE_BIT, Ordering::SeqCst);
    }

    pub fn release(&self, line: usize) {
        self.bus.lines[line].fetch_and(!DEVICE_BIT, Ordering::SeqCst);
    }

    pub fn asserted(&self, line: usize) -> bool {
        self.bus.asserted(line)
    }

    pub fn wait_asserted(&self, line: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.asserted(line))
    }

    pub fn wait_released(&self, line: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || !self.asserted(line))
    }

    fn wait_until(&self, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !cond() {
            if Instant::now() >= deadline {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }
}

/// Receives one byte as the device-side listener, after the adapter has
/// claimed the bus and we have answered on DATA.  Returns the byte and
/// whether the adapter signalled EOI before it.  Does not send the
/// acknowledgement; the caller does that (or deliberately doesn't).
pub fn device_recv_byte(dev: &SimDevice) -> Option<(u8, bool)> {
    // The adapter releases CLOCK when it is ready for us.
    if !dev.wait_released(CLOCK, PEER_TIMEOUT) {
        return None;
    }
    dev.release(DATA);

    // If CLOCK stays released past the watch window the adapter is
    // signalling EOI; acknowledge with a DATA pulse.
    let mut eoi = false;
    if !dev.wait_asserted(CLOCK, EOI_WATCH) {
        eoi = true;
        dev.set(DATA);
        spin_sleep(Duration::from_micros(70));
        dev.release(DATA);
        if !dev.wait_asserted(CLOCK, PEER_TIMEOUT) {
            return None;
        }
    }

    // Eight bits, least significant first.  Released DATA is a 1.
    let mut byte = 0u8;
    for bit in 0..8 {
        if !dev.wait_released(CLOCK, Duration::from_millis(10)) {
            return None;
        }
        if !dev.asserted(DATA) {
            byte |= 1 << bit;
        }
        if !dev.wait_asserted(CLOCK, Duration::from_millis(10)) {
            return None;
        }
    }
    Some((byte, eoi))
}

/// Sends one byte as the device-side talker.  With `eoi` set, leaves
/// CLOCK released past the EOI window first and waits for the adapter's
/// acknowledging DATA pulse.  Returns whether the adapter acknowledged
/// the byte.
pub fn device_send_byte(dev: &SimDevice, byte: u8, eoi: bool) -> bool {
    spin_sleep(Duration::from_micros(100));

    // Announce the byte and wait for the listener to be ready.
    dev.release(CLOCK);
    if !dev.wait_released(DATA, PEER_TIMEOUT) {
        return false;
    }

    if eoi {
        if !dev.wait_asserted(DATA, Duration::from_millis(10)) {
            return false;
        }
        if !dev.wait_released(DATA, Duration::from_millis(10)) {
            return false;
        }
    }

    // Assert CLOCK to start the byte.  For a plain byte this lands
    // inside the 400us non-EOI window.
    dev.set(CLOCK);
    spin_sleep(Duration::from_micros(50));

    for bit in 0..8 {
        if byte & (1 << bit) == 0 {
            dev.set(DATA);
        } else {
            dev.release(DATA);
        }
        spin_sleep(Duration::from_micros(10));
        dev.release(CLOCK);
        spin_sleep(Duration::from_micros(60));
        dev.set(CLOCK);
        dev.release(DATA);
        spin_sleep(Duration::from_micros(10));
    }

    // The listener acknowledges on DATA.
    dev.wait_asserted(DATA, Duration::from_millis(10))
}

/// Starts a byte as talker then abandons it two bits in, leaving CLOCK
/// asserted, like a drive dying mid-transfer.
pub fn device_die_mid_byte(dev: &SimDevice) {
    spin_sleep(Duration::from_micros(100));
    dev.release(CLOCK);
    if !dev.wait_released(DATA, PEER_TIMEOUT) {
        return;
    }
    dev.set(CLOCK);
    spin_sleep(Duration::from_micros(50));
    for _ in 0..2 {
        dev.release(DATA);
        spin_sleep(Duration::from_micros(10));
        dev.release(CLOCK);
        spin_sleep(Duration::from_micros(60));
        dev.set(CLOCK);
        spin_sleep(Duration::from_micros(10));
    }
}

/// A watchdog that counts its feeds.
#[derive(Clone, Default)]
pub struct CountingWatchdog(pub Arc<AtomicU32>);

impl CountingWatchdog {
    pub fn feeds(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Watchdog for CountingWatchdog {
    fn feed(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct TransportInner {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    fail_writes: bool,
}

/// A host transport backed by vectors, with a shared handle so tests can
/// stage inbound data and inspect what was drained.
#[derive(Clone, Default)]
pub struct VecTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl VecTransport {
    /// Stages data for the next `request_write` to pull.
    pub fn stage(&self, data: &[u8]) {
        self.inner.lock().unwrap().inbound = data.to_vec();
    }

    /// Everything the engine has drained to the host so far.
    pub fn drained(&self) -> Vec<u8> {
        self.inner.lock().unwrap().outbound.clone()
    }

    /// Makes outbound transfers fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }
}

impl HostTransport for VecTransport {
    fn write_block(&mut self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return false;
        }
        inner.outbound.extend_from_slice(data);
        true
    }

    fn read_block(&mut self, buf: &mut [u8]) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.inbound.len() < buf.len() {
            return false;
        }
        buf.copy_from_slice(&inner.inbound[..buf.len()]);
        true
    }
}

pub type SimHandler = ProtocolHandler<SimLine, CountingWatchdog, VecTransport>;

/// Builds an engine wired to the simulated bus, returning the shared
/// transport and watchdog handles alongside it.
pub fn build_handler(bus: &SimBus) -> (SimHandler, VecTransport, CountingWatchdog) {
    let iec_bus = IecBus::new(
        bus.adapter_line(CLOCK),
        bus.adapter_line(DATA),
        bus.adapter_line(ATN),
        bus.adapter_line(RESET),
    );
    let watchdog = CountingWatchdog::default();
    let driver = IecDriver::new(iec_bus, watchdog.clone());
    let transport = VecTransport::default();
    let handler = ProtocolHandler::new(driver, transport.clone());
    (handler, transport, watchdog)
}

/// What a listener script observed.
#[derive(Default)]
pub struct ListenerLog {
    pub bytes: Vec<u8>,
    pub eoi: Vec<bool>,
    pub ok: bool,
}

/// Spawns a device-side listener expecting `expected` bytes.
///
/// If `nak_after` is set, the byte at that index is received but never
/// acknowledged, simulating a device that dies mid-message.
pub fn spawn_listener(
    bus: &SimBus,
    expected: usize,
    nak_after: Option<usize>,
) -> JoinHandle<ListenerLog> {
    let dev = bus.device();
    thread::spawn(move || {
        let mut log = ListenerLog::default();

        // The adapter claims the bus by asserting CLOCK; answer on DATA.
        if !dev.wait_asserted(CLOCK, PEER_TIMEOUT) {
            return log;
        }
        dev.set(DATA);

        for ii in 0..expected {
            let Some((byte, eoi)) = device_recv_byte(&dev) else {
                return log;
            };
            log.bytes.push(byte);
            log.eoi.push(eoi);

            if nak_after == Some(ii) {
                // Withhold the acknowledgement and walk away.
                return log;
            }
            dev.set(DATA);
        }

        // Hold DATA through the frame-end gap, then let go.
        spin_sleep(Duration::from_millis(1));
        dev.release(DATA);
        log.ok = true;
        log
    })
}

/// How a talker script finishes its message.
#[derive(Clone, Copy, PartialEq)]
pub enum TalkerEnd {
    /// Signal EOI alongside the final byte, as a well-behaved drive
    /// does.
    EoiWithLastByte,

    /// Send every byte plainly, then announce one more, signal EOI and
    /// go silent without sending it.
    SilentEoi,

    /// Abandon the byte at this index two bits in, with CLOCK left
    /// asserted.
    DieMidByte(usize),
}

/// Spawns a device-side talker which sends `bytes` and then ends the
/// message per `end`.  Assumes the adapter already holds DATA as
/// listener (e.g. after a talk handover, or via set/release).
pub fn spawn_talker(bus: &SimBus, bytes: Vec<u8>, end: TalkerEnd) -> JoinHandle<()> {
    let dev = bus.device();
    thread::spawn(move || {
        // We hold CLOCK while idle.
        dev.set(CLOCK);
        if !dev.wait_asserted(DATA, PEER_TIMEOUT) {
            return;
        }

        let last = bytes.len().saturating_sub(1);
        for (ii, byte) in bytes.iter().enumerate() {
            if end == TalkerEnd::DieMidByte(ii) {
                device_die_mid_byte(&dev);
                return;
            }
            let eoi = end == TalkerEnd::EoiWithLastByte && ii == last;
            if !device_send_byte(&dev, *byte, eoi) {
                return;
            }
        }

        if end == TalkerEnd::SilentEoi {
            // Announce a byte but never re-assert CLOCK.  The adapter
            // acknowledges the EOI with a DATA pulse, after which we
            // stay silent and its byte handshake times out.
            spin_sleep(Duration::from_micros(100));
            dev.release(CLOCK);
            if !dev.wait_released(DATA, PEER_TIMEOUT) {
                return;
            }
            dev.wait_asserted(DATA, Duration::from_millis(10));
            dev.wait_released(DATA, Duration::from_millis(10));
        } else {
            dev.release(CLOCK);
        }
    })
}

/// Spawns a peer that mimics a drive's hardware ATN acknowledge: DATA
/// follows ATN until told to stop.
pub fn spawn_atn_responder(bus: &SimBus, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    let dev = bus.device();
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            if dev.asserted(ATN) {
                dev.set(DATA);
            } else {
                dev.release(DATA);
            }
            std::hint::spin_loop();
        }
        dev.release(DATA);
    })
}
