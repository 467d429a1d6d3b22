//! Watchdog integration.
//!
//! Several protocol waits are unbounded (a listener can hold DATA for as
//! long as it likes), so the driver feeds a watchdog from inside its long
//! loops rather than at the top of each operation.  Embedders plug in
//! their hardware watchdog through the [`Watchdog`] trait; hosts that
//! don't have one use [`NoopWatchdog`].

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

/// Fed by the protocol driver whenever it is alive inside a long or
/// unbounded wait.
pub trait Watchdog {
    /// Feed the watchdog.  Called frequently, so should be cheap.
    fn feed(&mut self);
}

/// A [`Watchdog`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&mut self) {}
}
