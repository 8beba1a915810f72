//! USB bulk transport (libusb via `rusb`).
//!
//! Used by the raw JTAGICE3 protocol: one OUT endpoint, one IN endpoint,
//! and an optional second IN endpoint carrying asynchronous events.

use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use super::Transport;
use crate::{Error, Result};

pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    ep_out: u8,
    ep_in: u8,
    ep_event: Option<u8>,
    max_xfer: usize,
    timeout: Duration,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UsbTransport(out={:#04x}, in={:#04x}, max_xfer={})",
            self.ep_out, self.ep_in, self.max_xfer
        )
    }
}

impl UsbTransport {
    /// Opens the first device matching `vid` and one of `pids` and claims
    /// interface 0.
    pub fn open(
        vid: u16,
        pids: &[u16],
        serial: Option<&str>,
        ep_out: u8,
        ep_in: u8,
        ep_event: Option<u8>,
    ) -> Result<UsbTransport> {
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != vid || !pids.contains(&desc.product_id()) {
                continue;
            }
            let mut handle = device.open()?;
            if let Some(wanted) = serial {
                let got = handle
                    .read_serial_number_string_ascii(&desc)
                    .unwrap_or_default();
                if got != wanted {
                    continue;
                }
            }
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(0)?;

            // Packet size of the IN endpoint decides the transfer unit.
            let mut max_xfer = 512usize;
            if let Ok(cfg) = device.active_config_descriptor() {
                for iface in cfg.interfaces() {
                    for desc in iface.descriptors() {
                        for ep in desc.endpoint_descriptors() {
                            if ep.address() == ep_in {
                                max_xfer = ep.max_packet_size() as usize;
                            }
                        }
                    }
                }
            }

            log::debug!(
                "opened USB device {:04x}:{:04x}, max transfer {}",
                vid,
                desc.product_id(),
                max_xfer
            );
            return Ok(UsbTransport {
                handle,
                ep_out,
                ep_in,
                ep_event,
                max_xfer,
                timeout: super::DEFAULT_TIMEOUT,
            });
        }
        Err(Error::Config(format!(
            "no USB device with VID {:04x} and PID in {:04x?} found",
            vid, pids
        )))
    }

    /// Reads one event frame, if the device has an event endpoint and a
    /// frame is waiting.
    pub fn recv_event(&mut self, buf: &mut [u8]) -> Result<usize> {
        let ep = self
            .ep_event
            .ok_or(Error::Unsupported("event endpoint"))?;
        Ok(self.handle.read_bulk(ep, buf, self.timeout)?)
    }
}

impl Transport for UsbTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self
                .handle
                .write_bulk(self.ep_out, &data[sent..], self.timeout)?;
        }
        // A transfer that fills the final packet needs a zero-length
        // packet so the device sees the end of the message.
        if !data.is_empty() && data.len() % self.max_xfer == 0 {
            self.handle.write_bulk(self.ep_out, &[], self.timeout)?;
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.handle.read_bulk(self.ep_in, buf, self.timeout) {
            Ok(0) => Err(Error::Timeout("USB bulk read")),
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Err(Error::Timeout("USB bulk read")),
            Err(e) => Err(e.into()),
        }
    }

    fn drain(&mut self) -> Result<()> {
        let mut scratch = vec![0u8; self.max_xfer];
        loop {
            match self
                .handle
                .read_bulk(self.ep_in, &mut scratch, Duration::from_millis(1))
            {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn max_transfer(&self) -> usize {
        self.max_xfer
    }
}
