//! Byte-stream transports to the physical programmer.
//!
//! Every wire engine talks through the [`Transport`] trait: send, receive
//! with a deadline, drain stale input, and the couple of line controls
//! (baud, DTR/RTS) the serial protocols need. Concrete implementations
//! cover tty/COM serial ports, vendor HID interfaces, USB bulk endpoint
//! pairs, and the AVR-Doper report framing on top of HID.

use std::fmt::Debug;
use std::time::Duration;

use crate::{Error, Result};

pub mod doper;
pub mod hid;
pub mod serial;
pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

/// A blocking byte transport with explicit receive timeouts.
pub trait Transport: Debug {
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receives up to `buf.len()` bytes, at least one, within the current
    /// timeout.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Receives exactly `buf.len()` bytes or fails.
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::ShortReply {
                    expected: buf.len(),
                    got: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Discards any pending input.
    fn drain(&mut self) -> Result<()>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    fn set_baud(&mut self, _baud: u32) -> Result<()> {
        Err(Error::Unsupported("set_baud"))
    }

    fn set_dtr_rts(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    /// Fixed transfer unit for packetised transports (HID report or USB
    /// packet size); 0 for plain byte streams.
    fn max_transfer(&self) -> usize {
        0
    }
}

/// Default receive timeout for fast commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Extended timeout for erase and other long operations.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the serial transport named by `port` at `baud`.
pub fn open_serial(port: &str, baud: u32) -> Result<Box<dyn Transport>> {
    Ok(Box::new(serial::SerialTransport::open(port, baud)?))
}
