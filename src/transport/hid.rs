//! USB HID transport for EDBG-class debuggers.
//!
//! These devices expose a vendor HID interface with fixed-size reports
//! (64 bytes, 512 on the faster kits) and no report ids on the wire; the
//! mandatory id byte on the host side is always zero.

use std::time::Duration;

use hidapi::{HidApi, HidDevice};

use super::Transport;
use crate::{Error, Result};

pub struct HidTransport {
    dev: HidDevice,
    report_size: usize,
    /// Devices with numbered reports (the AVR-Doper) put the report id in
    /// the payload themselves; everything else gets the mandatory zero id
    /// prefixed here.
    numbered_reports: bool,
    timeout: Duration,
}

impl std::fmt::Debug for HidTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HidTransport(report_size={})", self.report_size)
    }
}

impl HidTransport {
    /// Opens the first device matching `vid` and one of `pids`,
    /// optionally narrowed to a serial number.
    pub fn open(vid: u16, pids: &[u16], serial: Option<&str>) -> Result<HidTransport> {
        let api = HidApi::new()?;
        for info in api.device_list() {
            if info.vendor_id() != vid || !pids.contains(&info.product_id()) {
                continue;
            }
            if let Some(wanted) = serial {
                if info.serial_number() != Some(wanted) {
                    continue;
                }
            }
            let dev = info.open_device(&api)?;
            // The big kits (PowerDebugger, EDBG on 3.0 ports) use 512-byte
            // reports; everything else uses 64.
            let report_size = match info.usage_page() {
                0xff00..=0xffff if info.usage() == 0x02 => 512,
                _ => 64,
            };
            log::debug!(
                "opened HID device {:04x}:{:04x}, report size {}",
                vid,
                info.product_id(),
                report_size
            );
            return Ok(HidTransport {
                dev,
                report_size,
                numbered_reports: false,
                timeout: super::DEFAULT_TIMEOUT,
            });
        }
        Err(Error::Config(format!(
            "no HID device with VID {:04x} and PID in {:04x?} found",
            vid, pids
        )))
    }

    /// Opens a device whose reports are numbered and variable-sized; the
    /// caller supplies whole reports, id byte included.
    pub fn open_numbered(
        vid: u16,
        pids: &[u16],
        serial: Option<&str>,
        max_report: usize,
    ) -> Result<HidTransport> {
        let mut tr = Self::open(vid, pids, serial)?;
        tr.numbered_reports = true;
        tr.report_size = max_report;
        Ok(tr)
    }
}

impl Transport for HidTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.report_size {
            return Err(Error::Framing(format!(
                "HID write of {} bytes exceeds report size {}",
                data.len(),
                self.report_size
            )));
        }
        if self.numbered_reports {
            // The caller built the whole report, id byte and all.
            self.dev.write(data)?;
            return Ok(());
        }
        // Report id 0, then the payload padded to a full report.
        let mut report = vec![0u8; self.report_size + 1];
        report[1..=data.len()].copy_from_slice(data);
        self.dev.write(&report)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut report = vec![0u8; self.report_size];
        let ms = self.timeout.as_millis() as i32;
        let n = self.dev.read_timeout(&mut report, ms)?;
        if n == 0 {
            return Err(Error::Timeout("HID read"));
        }
        let take = n.min(buf.len());
        buf[..take].copy_from_slice(&report[..take]);
        Ok(take)
    }

    fn drain(&mut self) -> Result<()> {
        let mut report = vec![0u8; self.report_size];
        while let Ok(n) = self.dev.read_timeout(&mut report, 0) {
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn max_transfer(&self) -> usize {
        self.report_size
    }
}
