//! SENDME flow control
//!
//! Credit windows at two levels keep any hop from buffering without bound:
//!
//! 1. **Package window**: cells we may still send; decremented per DATA
//!    cell packaged, replenished by an incoming SENDME.
//! 2. **Deliver window**: cells the peer may still send us; decremented per
//!    DATA cell delivered. Each time cumulative delivery reaches a multiple
//!    of the increment we owe the peer one SENDME.
//!
//! Defaults: 1000 start / 100 increment per circuit (and per hop),
//! 500 / 50 per stream. Both values are configurable; tests shrink them.
//!
//! A sender with a non-positive package window must not emit DATA; a peer
//! that overruns our deliver window has broken the protocol.

use crate::error::{Error, Result};

/// Initial circuit-level window.
pub const CIRCUIT_WINDOW_START: u16 = 1000;

/// Circuit-level credit per SENDME.
pub const CIRCUIT_WINDOW_INCREMENT: u16 = 100;

/// Initial stream-level window.
pub const STREAM_WINDOW_START: u16 = 500;

/// Stream-level credit per SENDME.
pub const STREAM_WINDOW_INCREMENT: u16 = 50;

/// One credit window.
#[derive(Debug, Clone)]
pub struct Window {
    window: i32,
    start: i32,
    increment: i32,
}

impl Window {
    pub fn new(start: u16, increment: u16) -> Self {
        Self {
            window: i32::from(start),
            start: i32::from(start),
            increment: i32::from(increment),
        }
    }

    /// Current credit. May be observed for diagnostics and tests.
    pub fn current(&self) -> i32 {
        self.window
    }

    /// Whether a DATA cell may be packaged right now.
    pub fn can_package(&self) -> bool {
        self.window > 0
    }

    /// Account for one packaged DATA cell. Sending with no credit is a bug
    /// in our own scheduling, not the peer's.
    pub fn note_packaged(&mut self) -> Result<()> {
        if self.window <= 0 {
            return Err(Error::Internal("packaged a cell with window ≤ 0".into()));
        }
        self.window -= 1;
        Ok(())
    }

    /// Account for an incoming SENDME. Credit beyond the initial window
    /// means the peer is inflating it.
    pub fn note_sendme(&mut self) -> Result<()> {
        if self.window + self.increment > self.start {
            return Err(Error::Protocol("flow-control credit overflow".into()));
        }
        self.window += self.increment;
        Ok(())
    }

    /// Account for one delivered DATA cell. Returns `true` when a SENDME is
    /// now owed (the credit is folded back in immediately). A peer sending
    /// past the window has broken the protocol.
    pub fn note_delivered(&mut self) -> Result<bool> {
        if self.window <= 0 {
            return Err(Error::Protocol("deliver window exceeded".into()));
        }
        self.window -= 1;
        if self.window <= self.start - self.increment {
            self.window += self.increment;
            return Ok(true);
        }
        Ok(false)
    }
}

/// The two windows of a circuit (or of one hop on an origin circuit).
#[derive(Debug, Clone)]
pub struct CircuitWindows {
    pub package: Window,
    pub deliver: Window,
}

impl CircuitWindows {
    pub fn new(start: u16, increment: u16) -> Self {
        Self {
            package: Window::new(start, increment),
            deliver: Window::new(start, increment),
        }
    }
}

impl Default for CircuitWindows {
    fn default() -> Self {
        Self::new(CIRCUIT_WINDOW_START, CIRCUIT_WINDOW_INCREMENT)
    }
}

/// The two windows of a stream.
#[derive(Debug, Clone)]
pub struct StreamWindows {
    pub package: Window,
    pub deliver: Window,
}

impl StreamWindows {
    pub fn new(start: u16, increment: u16) -> Self {
        Self {
            package: Window::new(start, increment),
            deliver: Window::new(start, increment),
        }
    }
}

impl Default for StreamWindows {
    fn default() -> Self {
        Self::new(STREAM_WINDOW_START, STREAM_WINDOW_INCREMENT)
    }
}
