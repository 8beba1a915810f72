//! Serial port transport: POSIX tty and Win32 COM, 8N1.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use super::Transport;
use crate::{Error, Result};

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialTransport({:?})", self.port.name())
    }
}

impl SerialTransport {
    /// Opens `path` at `baud`, 8N1, with the default receive timeout.
    pub fn open(path: &str, baud: u32) -> Result<SerialTransport> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(super::DEFAULT_TIMEOUT)
            .open()?;
        log::debug!("opened serial port {} at {} baud", path, baud);
        Ok(SerialTransport { port })
    }

    /// Opens with two stop bits and even parity, as raw UPDI wants.
    pub fn open_updi(path: &str, baud: u32) -> Result<SerialTransport> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::Two)
            .timeout(super::DEFAULT_TIMEOUT)
            .open()?;
        log::debug!("opened UPDI serial port {} at {} baud", path, baud);
        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(0) => Err(Error::Timeout("serial read")),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::Timeout("serial read"))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn drain(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    fn set_dtr_rts(&mut self, enable: bool) -> Result<()> {
        self.port.write_data_terminal_ready(enable)?;
        self.port.write_request_to_send(enable)?;
        Ok(())
    }
}
