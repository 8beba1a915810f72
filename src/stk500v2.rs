//! STK500 protocol version 2.
//!
//! Messages ride in a framed envelope: start byte, sequence number,
//! big-endian length, token, body, and an XOR checksum over everything
//! before it. The same engine serves the AVR-Doper, whose frames travel
//! through HID reports instead of a serial port.

use crate::cache::PageCache;
use crate::part::{Memory, Part, ProgModes};
use crate::programmer::Programmer;
use crate::transport::{doper::DoperTransport, hid::HidTransport, open_serial, Transport};
use crate::utils::page_base;
use crate::{Error, Result};

pub const MESSAGE_START: u8 = 0x1b;
pub const TOKEN: u8 = 0x0e;

// Commands.
pub const CMD_SIGN_ON: u8 = 0x01;
pub const CMD_SET_PARAMETER: u8 = 0x02;
pub const CMD_GET_PARAMETER: u8 = 0x03;
pub const CMD_LOAD_ADDRESS: u8 = 0x06;
pub const CMD_ENTER_PROGMODE_ISP: u8 = 0x10;
pub const CMD_LEAVE_PROGMODE_ISP: u8 = 0x11;
pub const CMD_CHIP_ERASE_ISP: u8 = 0x12;
pub const CMD_PROGRAM_FLASH_ISP: u8 = 0x13;
pub const CMD_READ_FLASH_ISP: u8 = 0x14;
pub const CMD_PROGRAM_EEPROM_ISP: u8 = 0x15;
pub const CMD_READ_EEPROM_ISP: u8 = 0x16;
pub const CMD_PROGRAM_FUSE_ISP: u8 = 0x17;
pub const CMD_READ_FUSE_ISP: u8 = 0x18;
pub const CMD_PROGRAM_LOCK_ISP: u8 = 0x19;
pub const CMD_READ_LOCK_ISP: u8 = 0x1a;
pub const CMD_READ_SIGNATURE_ISP: u8 = 0x1b;
pub const CMD_READ_OSCCAL_ISP: u8 = 0x1c;
pub const CMD_SPI_MULTI: u8 = 0x1d;

// Status codes.
pub const STATUS_CMD_OK: u8 = 0x00;
pub const STATUS_CMD_TOUT: u8 = 0x80;
pub const STATUS_CMD_FAILED: u8 = 0xc0;

// Parameters.
pub const PARAM_VTARGET: u8 = 0x94;
pub const PARAM_SCK_DURATION: u8 = 0x98;

/// One SCK-duration unit of the v2 firmware.
const SCK_UNIT_S: f64 = 8.0e-6;

const DEFAULT_BAUD: u32 = 115_200;

/// AVR-Doper USB identity (an Objective Development V-USB device).
const DOPER_VID: u16 = 0x16c0;
const DOPER_PID: u16 = 0x05df;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Serial,
    DoperHid,
}

pub struct Stk500v2 {
    wire: Wire,
    tr: Option<Box<dyn Transport>>,
    seq: u8,
    flash_cache: PageCache,
    eeprom_cache: PageCache,
    sck_period: Option<f64>,
}

impl std::fmt::Debug for Stk500v2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stk500v2(wire={:?})", self.wire)
    }
}

impl Stk500v2 {
    pub fn new() -> Stk500v2 {
        Stk500v2 {
            wire: Wire::Serial,
            tr: None,
            seq: 0,
            flash_cache: PageCache::new(),
            eeprom_cache: PageCache::new(),
            sck_period: None,
        }
    }

    /// The AVR-Doper flavour: same protocol, HID report transport.
    pub fn avrdoper() -> Stk500v2 {
        Stk500v2 {
            wire: Wire::DoperHid,
            ..Stk500v2::new()
        }
    }

    fn tr(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.tr
            .as_mut()
            .ok_or(Error::Protocol("programmer not open".into()))
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Frames `body`, sends it, and returns the response body after
    /// checking sequence echo, checksum and command status.
    fn command(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let seq = self.next_seq();
        let mut frame = vec![
            MESSAGE_START,
            seq,
            (body.len() >> 8) as u8,
            body.len() as u8,
            TOKEN,
        ];
        frame.extend_from_slice(body);
        let cksum = frame.iter().fold(0u8, |a, b| a ^ b);
        frame.push(cksum);
        let tr = self.tr()?;
        tr.send(&frame)?;

        let mut head = [0u8; 5];
        tr.recv_exact(&mut head)?;
        if head[0] != MESSAGE_START || head[4] != TOKEN {
            return Err(Error::Framing("bad STK500v2 response envelope".into()));
        }
        if head[1] != seq {
            return Err(Error::Protocol(format!(
                "response sequence {} does not match request {}",
                head[1], seq
            )));
        }
        let len = ((head[2] as usize) << 8) | head[3] as usize;
        let mut resp = vec![0u8; len];
        tr.recv_exact(&mut resp)?;
        let mut cksum = [0u8; 1];
        tr.recv_exact(&mut cksum)?;
        let expect = head.iter().chain(resp.iter()).fold(0u8, |a, b| a ^ b);
        if cksum[0] != expect {
            return Err(Error::Framing("STK500v2 response checksum mismatch".into()));
        }
        if resp.len() < 2 {
            return Err(Error::ShortReply {
                expected: 2,
                got: resp.len(),
            });
        }
        if resp[0] != body[0] {
            return Err(Error::Protocol(format!(
                "response echoes command 0x{:02x}, sent 0x{:02x}",
                resp[0], body[0]
            )));
        }
        match resp[1] {
            STATUS_CMD_OK => Ok(resp),
            STATUS_CMD_TOUT => Err(Error::Timeout("STK500v2 command")),
            status => Err(Error::CommandFailed {
                engine: "stk500v2",
                command: body[0],
                status,
            }),
        }
    }

    fn load_address(&mut self, mem: &Memory, addr: u32) -> Result<()> {
        let mut unit_addr = if mem.is_flash() { addr / 2 } else { addr };
        if mem.ops.as_ref().map_or(false, |o| o.load_ext_addr.is_some()) {
            // The MSB flags extended addressing to the firmware.
            unit_addr |= 0x8000_0000;
        }
        self.command(&[
            CMD_LOAD_ADDRESS,
            (unit_addr >> 24) as u8,
            (unit_addr >> 16) as u8,
            (unit_addr >> 8) as u8,
            unit_addr as u8,
        ])?;
        Ok(())
    }

    fn instr_byte(op: Option<&crate::opcode::Opcode>, which: usize) -> u8 {
        op.map(|o| o.instr(0, 0)[which]).unwrap_or(0)
    }

    fn prog_page(&mut self, mem: &Memory, addr: u32, data: &[u8]) -> Result<()> {
        self.load_address(mem, addr)?;
        let (cmd, mode) = if mem.is_flash() {
            // Paged mode, commit the page after filling.
            (CMD_PROGRAM_FLASH_ISP, 0x81u8)
        } else {
            (CMD_PROGRAM_EEPROM_ISP, 0xc1u8)
        };
        let ops = mem.ops.as_ref();
        let mut body = vec![
            cmd,
            (data.len() >> 8) as u8,
            data.len() as u8,
            mode,
            10, // delay
            Self::instr_byte(ops.and_then(|o| o.load_lo.as_ref()).or_else(|| ops.and_then(|o| o.write.as_ref())), 0),
            Self::instr_byte(ops.and_then(|o| o.write_page.as_ref()), 0),
            Self::instr_byte(ops.and_then(|o| o.read_lo.as_ref()).or_else(|| ops.and_then(|o| o.read.as_ref())), 0),
            0xff, // poll value 1
            0xff, // poll value 2
        ];
        body.extend_from_slice(data);
        self.command(&body)?;
        Ok(())
    }

    fn read_page(&mut self, mem: &Memory, addr: u32, len: usize) -> Result<Vec<u8>> {
        self.load_address(mem, addr)?;
        let (cmd, read_op) = if mem.is_flash() {
            (
                CMD_READ_FLASH_ISP,
                Self::instr_byte(mem.ops.as_ref().and_then(|o| o.read_lo.as_ref()), 0),
            )
        } else {
            (
                CMD_READ_EEPROM_ISP,
                Self::instr_byte(mem.ops.as_ref().and_then(|o| o.read.as_ref()), 0),
            )
        };
        let resp = self.command(&[cmd, (len >> 8) as u8, len as u8, read_op])?;
        if resp.len() < 2 + len {
            return Err(Error::ShortReply {
                expected: 2 + len,
                got: resp.len(),
            });
        }
        Ok(resp[2..2 + len].to_vec())
    }

    /// Read one byte through the dedicated fuse/lock/signature commands.
    fn isp_read(&mut self, cmd: u8, instr: [u8; 4], ret_addr: u8) -> Result<u8> {
        let resp = self.command(&[cmd, ret_addr, instr[0], instr[1], instr[2], instr[3]])?;
        resp.get(2)
            .copied()
            .ok_or(Error::ShortReply {
                expected: 3,
                got: resp.len(),
            })
    }

    fn isp_write(&mut self, cmd: u8, instr: [u8; 4]) -> Result<()> {
        self.command(&[cmd, instr[0], instr[1], instr[2], instr[3]])?;
        Ok(())
    }
}

impl Default for Stk500v2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Programmer for Stk500v2 {
    fn id(&self) -> &'static str {
        match self.wire {
            Wire::Serial => "stk500v2",
            Wire::DoperHid => "avrdoper",
        }
    }

    fn prog_modes(&self) -> ProgModes {
        ProgModes::ISP | ProgModes::HV
    }

    fn open(&mut self, port: &str) -> Result<()> {
        match self.wire {
            Wire::Serial => {
                self.tr = Some(open_serial(port, DEFAULT_BAUD)?);
            }
            Wire::DoperHid => {
                let serial = port.strip_prefix("usb:").filter(|s| !s.is_empty());
                let hid = HidTransport::open_numbered(DOPER_VID, &[DOPER_PID], serial, 125)?;
                self.tr = Some(Box::new(DoperTransport::new(Box::new(hid))));
            }
        }
        self.tr()?.drain()?;
        let resp = self.command(&[CMD_SIGN_ON])?;
        if resp.len() > 3 {
            log::info!(
                "programmer signs on as {:?}",
                String::from_utf8_lossy(&resp[3..])
            );
        }
        Ok(())
    }

    fn close(&mut self) {
        self.tr = None;
        self.seq = 0;
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        if !part.prog_modes.contains(ProgModes::ISP) {
            return Err(Error::NoCommonMode);
        }
        self.program_enable(part)
    }

    fn display(&self, prefix: &str) {
        println!("{}Programmer type : {}", prefix, self.id());
    }

    fn disable(&mut self) -> Result<()> {
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
        // Pre/post delays of one millisecond each.
        self.command(&[CMD_LEAVE_PROGMODE_ISP, 1, 1]).map(|_| ())
    }

    fn program_enable(&mut self, part: &Part) -> Result<()> {
        let instr = part
            .pgm_enable
            .as_ref()
            .map(|o| o.instr(0, 0))
            .ok_or(Error::Unsupported("program_enable"))?;
        self.command(&[
            CMD_ENTER_PROGMODE_ISP,
            200,  // timeout ms
            100,  // stabilisation delay ms
            25,   // command execution delay ms
            32,   // synchronisation loops
            0,    // byte delay
            0x53, // poll value
            3,    // poll index
            instr[0],
            instr[1],
            instr[2],
            instr[3],
        ])?;
        Ok(())
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        let instr = part
            .chip_erase
            .as_ref()
            .map(|o| o.instr(0, 0))
            .ok_or(Error::Unsupported("chip_erase"))?;
        let delay_ms = (part.chip_erase_delay_us / 1000).max(1) as u8;
        self.command(&[
            CMD_CHIP_ERASE_ISP,
            delay_ms,
            0, // poll method: delay
            instr[0],
            instr[1],
            instr[2],
            instr[3],
        ])?;
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
        Ok(())
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let resp = self.command(&[CMD_SPI_MULTI, 4, 4, 0, cmd[0], cmd[1], cmd[2], cmd[3]])?;
        if resp.len() < 6 {
            return Err(Error::ShortReply {
                expected: 6,
                got: resp.len(),
            });
        }
        Ok([resp[2], resp[3], resp[4], resp[5]])
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        mem.check_range(addr, 1)?;
        if mem.is_flash() || mem.is_eeprom() {
            let page_size = mem.page_size.max(1);
            let cached = if mem.is_flash() {
                self.flash_cache.lookup(page_size, addr)
            } else {
                self.eeprom_cache.lookup(page_size, addr)
            };
            if let Some(v) = cached {
                return Ok(v);
            }
            let base = page_base(addr, page_size);
            let page = self.read_page(mem, base, page_size as usize)?;
            let value = page[(addr - base) as usize];
            if mem.is_flash() {
                self.flash_cache.fill(base, &page);
            } else {
                self.eeprom_cache.fill(base, &page);
            }
            return Ok(value);
        }
        let op = mem
            .ops
            .as_ref()
            .and_then(|o| o.read.as_ref())
            .ok_or_else(|| Error::UnsupportedMemory(mem.name.to_string()))?;
        let instr = op.instr(mem.logical(addr), 0);
        let cmd = if mem.is_fuse() {
            CMD_READ_FUSE_ISP
        } else if mem.is_lock() {
            CMD_READ_LOCK_ISP
        } else if mem.is_signature() {
            CMD_READ_SIGNATURE_ISP
        } else if mem.name == "calibration" {
            CMD_READ_OSCCAL_ISP
        } else {
            return Err(Error::UnsupportedMemory(mem.name.to_string()));
        };
        self.isp_read(cmd, instr, 4)
    }

    fn write_byte(&mut self, _part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        mem.check_range(addr, 1)?;
        if mem.is_readonly() {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        if mem.is_flash() {
            let page_size = mem.page_size.max(1);
            let base = page_base(addr, page_size);
            let mut page = self.read_page(mem, base, page_size as usize)?;
            page[(addr - base) as usize] = value;
            self.prog_page(mem, base, &page)?;
            self.flash_cache.invalidate_range(page_size, addr, 1);
            return Ok(());
        }
        if mem.is_eeprom() {
            self.prog_page(mem, addr, &[value])?;
            self.eeprom_cache
                .invalidate_range(mem.page_size.max(1), addr, 1);
            return Ok(());
        }
        let op = mem
            .ops
            .as_ref()
            .and_then(|o| o.write.as_ref())
            .ok_or_else(|| Error::UnsupportedMemory(mem.name.to_string()))?;
        let instr = op.instr(mem.logical(addr), value);
        let cmd = if mem.is_fuse() {
            CMD_PROGRAM_FUSE_ISP
        } else if mem.is_lock() {
            CMD_PROGRAM_LOCK_ISP
        } else {
            return Err(Error::UnsupportedMemory(mem.name.to_string()));
        };
        self.isp_write(cmd, instr)
    }

    fn paged_load(
        &mut self,
        _part: &Part,
        mem: &Memory,
        page_size: u32,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        mem.check_range(addr, buf.len() as u32)?;
        let step = page_size.max(1) as usize;
        let mut pos = 0usize;
        while pos < buf.len() {
            let chunk = (buf.len() - pos).min(step);
            let data = self.read_page(mem, addr + pos as u32, chunk)?;
            buf[pos..pos + chunk].copy_from_slice(&data);
            pos += chunk;
        }
        Ok(buf.len())
    }

    fn paged_write(
        &mut self,
        _part: &Part,
        mem: &Memory,
        page_size: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<usize> {
        mem.check_range(addr, data.len() as u32)?;
        let step = page_size.max(1) as usize;
        let mut pos = 0usize;
        while pos < data.len() {
            let end = (pos + step).min(data.len());
            self.prog_page(mem, addr + pos as u32, &data[pos..end])?;
            pos = end;
        }
        if mem.is_flash() {
            self.flash_cache
                .invalidate_range(page_size, addr, data.len() as u32);
        } else if mem.is_eeprom() {
            self.eeprom_cache
                .invalidate_range(page_size, addr, data.len() as u32);
        }
        Ok(data.len())
    }

    fn read_sig_bytes(&mut self, _part: &Part, mem: &Memory) -> Result<[u8; 3]> {
        let op = mem
            .ops
            .as_ref()
            .and_then(|o| o.read.as_ref())
            .ok_or_else(|| Error::UnsupportedMemory(mem.name.to_string()))?
            .clone();
        let mut sig = [0u8; 3];
        for (i, b) in sig.iter_mut().enumerate() {
            *b = self.isp_read(CMD_READ_SIGNATURE_ISP, op.instr(i as u32, 0), 4)?;
        }
        Ok(sig)
    }

    fn set_sck_period(&mut self, period_s: f64) -> Result<()> {
        let units = (period_s / SCK_UNIT_S).round().max(1.0).min(255.0) as u8;
        self.command(&[CMD_SET_PARAMETER, PARAM_SCK_DURATION, units])?;
        self.sck_period = Some(f64::from(units) * SCK_UNIT_S);
        Ok(())
    }

    fn get_sck_period(&self) -> Result<f64> {
        self.sck_period.ok_or(Error::Unsupported("get_sck_period"))
    }

    fn get_vtarget(&mut self) -> Result<f64> {
        let resp = self.command(&[CMD_GET_PARAMETER, PARAM_VTARGET])?;
        let value = resp.get(2).copied().ok_or(Error::ShortReply {
            expected: 3,
            got: resp.len(),
        })?;
        Ok(f64::from(value) / 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::locate;
    use crate::parts;
    use crate::transport::mock::MockTransport;

    fn frame(seq: u8, body: &[u8]) -> Vec<u8> {
        let mut f = vec![
            MESSAGE_START,
            seq,
            (body.len() >> 8) as u8,
            body.len() as u8,
            TOKEN,
        ];
        f.extend_from_slice(body);
        let cksum = f.iter().fold(0u8, |a, b| a ^ b);
        f.push(cksum);
        f
    }

    fn with_mock(mock: MockTransport) -> Stk500v2 {
        let mut pgm = Stk500v2::new();
        pgm.tr = Some(Box::new(mock));
        pgm
    }

    #[test]
    fn envelope_checksum_and_echo() {
        let mut mock = MockTransport::new();
        mock.expect(frame(1, &[CMD_SIGN_ON]), frame(1, &[CMD_SIGN_ON, STATUS_CMD_OK, 8]));
        let mut pgm = with_mock(mock);
        let resp = pgm.command(&[CMD_SIGN_ON]).unwrap();
        assert_eq!(resp[1], STATUS_CMD_OK);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut mock = MockTransport::new();
        let mut bad = frame(1, &[CMD_SIGN_ON, STATUS_CMD_OK]);
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        mock.expect(frame(1, &[CMD_SIGN_ON]), bad);
        let mut pgm = with_mock(mock);
        assert!(pgm.command(&[CMD_SIGN_ON]).is_err());
    }

    #[test]
    fn failed_status_is_reported() {
        let mut mock = MockTransport::new();
        mock.expect(
            frame(1, &[CMD_CHIP_ERASE_ISP, 9, 0, 0xac, 0x80, 0, 0]),
            frame(1, &[CMD_CHIP_ERASE_ISP, STATUS_CMD_FAILED]),
        );
        let mut pgm = with_mock(mock);
        let db = parts::builtin();
        let mut part = locate(&db, "ATtiny13").unwrap().clone();
        part.chip_erase_delay_us = 9000;
        assert!(pgm.chip_erase(&part).is_err());
    }

    #[test]
    fn spi_multi_tunnels_four_bytes() {
        let mut mock = MockTransport::new();
        mock.expect(
            frame(1, &[CMD_SPI_MULTI, 4, 4, 0, 0x30, 0x00, 0x00, 0x00]),
            frame(
                1,
                &[CMD_SPI_MULTI, STATUS_CMD_OK, 0x00, 0x30, 0x00, 0x1e, STATUS_CMD_OK],
            ),
        );
        let mut pgm = with_mock(mock);
        let reply = pgm.cmd(&[0x30, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(reply, [0x00, 0x30, 0x00, 0x1e]);
    }

    #[test]
    fn sequence_number_echo_is_enforced() {
        let mut mock = MockTransport::new();
        mock.expect(frame(1, &[CMD_SIGN_ON]), frame(7, &[CMD_SIGN_ON, STATUS_CMD_OK]));
        let mut pgm = with_mock(mock);
        assert!(pgm.command(&[CMD_SIGN_ON]).is_err());
    }
}
