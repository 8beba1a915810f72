//! XPRG sub-protocol: TPI programming nested inside JTAGICE3 frames.
//!
//! With `SCOPE_AVR_TPI` selected the payload is its own little command
//! set with big-endian addresses and its own error sentinel. The two
//! NVM register addresses of the target are parameters the dongle needs
//! before entering programming mode.

use crate::part::{Memory, Part};
use crate::utils::padded;
use crate::{Error, Result};

use super::constants::SCOPE_AVR_TPI;
use super::Jtag3;

// XPRG commands.
pub const XPRG_CMD_ENTER_PROGMODE: u8 = 0x01;
pub const XPRG_CMD_LEAVE_PROGMODE: u8 = 0x02;
pub const XPRG_CMD_ERASE: u8 = 0x03;
pub const XPRG_CMD_WRITE_MEM: u8 = 0x04;
pub const XPRG_CMD_READ_MEM: u8 = 0x05;
pub const XPRG_CMD_CRC: u8 = 0x06;
pub const XPRG_CMD_SET_PARAM: u8 = 0x07;

// XPRG error codes; OK is the success sentinel.
pub const XPRG_ERR_OK: u8 = 0x00;
pub const XPRG_ERR_FAILED: u8 = 0x01;
pub const XPRG_ERR_COLLISION: u8 = 0x02;
pub const XPRG_ERR_TIMEOUT: u8 = 0x03;

// Parameters.
pub const XPRG_PARAM_NVMBASE: u8 = 0x01;
pub const XPRG_PARAM_EEPPAGESIZE: u8 = 0x02;
pub const XPRG_PARAM_NVMCMD_ADDR: u8 = 0x03;
pub const XPRG_PARAM_NVMCSR_ADDR: u8 = 0x04;

// Memory types.
pub const XPRG_MEM_TYPE_APPL: u8 = 0x01;
pub const XPRG_MEM_TYPE_BOOT: u8 = 0x02;
pub const XPRG_MEM_TYPE_EEPROM: u8 = 0x03;
pub const XPRG_MEM_TYPE_FUSE: u8 = 0x04;
pub const XPRG_MEM_TYPE_LOCKBITS: u8 = 0x05;
pub const XPRG_MEM_TYPE_USERSIG: u8 = 0x06;
pub const XPRG_MEM_TYPE_FACTORY_CALIBRATION: u8 = 0x07;

// Erase kinds.
pub const XPRG_ERASE_CHIP: u8 = 0x01;
pub const XPRG_ERASE_APP: u8 = 0x02;
pub const XPRG_ERASE_APP_PAGE: u8 = 0x05;
pub const XPRG_ERASE_CONFIG: u8 = 0x09;

/// TPI NVM command/status register addresses on the tiny parts.
pub const TPI_NVMCMD_ADDR: u8 = 0x33;
pub const TPI_NVMCSR_ADDR: u8 = 0x32;

/// Page-mode byte for WRITE_MEM: erase then write the page.
const PAGEMODE_ERASE_WRITE: u8 = 0x03;

/// Runs one XPRG command; the reply echoes the command id followed by
/// the error code.
fn xprg(pgm: &mut Jtag3, payload: &[u8]) -> Result<Vec<u8>> {
    debug_assert_eq!(payload[0], SCOPE_AVR_TPI);
    let body = pgm.transact(payload)?;
    if body.len() < 3 || body[0] != SCOPE_AVR_TPI {
        return Err(Error::Framing("malformed XPRG response".into()));
    }
    if body[1] != payload[1] {
        return Err(Error::Protocol(format!(
            "XPRG response echoes command 0x{:02x}, sent 0x{:02x}",
            body[1], payload[1]
        )));
    }
    if body[2] != XPRG_ERR_OK {
        return Err(Error::CommandFailed {
            engine: "xprg",
            command: payload[1],
            status: body[2],
        });
    }
    Ok(body)
}

fn mem_type(mem: &Memory) -> u8 {
    if mem.is_fuse() {
        XPRG_MEM_TYPE_FUSE
    } else if mem.is_lock() {
        XPRG_MEM_TYPE_LOCKBITS
    } else {
        // Flash, the signature row and calibration all live in the plain
        // TPI address space.
        XPRG_MEM_TYPE_APPL
    }
}

pub fn initialize(pgm: &mut Jtag3, part: &Part) -> Result<()> {
    pgm.sign_on_avr()?;
    pgm.set_param(XPRG_PARAM_NVMCMD_ADDR, TPI_NVMCMD_ADDR)?;
    pgm.set_param(XPRG_PARAM_NVMCSR_ADDR, TPI_NVMCSR_ADDR)?;
    pgm.n_word_writes = part.n_word_writes;
    enter_progmode(pgm)
}

impl Jtag3 {
    fn set_param(&mut self, param: u8, value: u8) -> Result<()> {
        xprg(self, &[SCOPE_AVR_TPI, XPRG_CMD_SET_PARAM, param, value]).map(|_| ())
    }
}

pub fn enter_progmode(pgm: &mut Jtag3) -> Result<()> {
    xprg(pgm, &[SCOPE_AVR_TPI, XPRG_CMD_ENTER_PROGMODE]).map(|_| ())
}

pub fn leave_progmode(pgm: &mut Jtag3) -> Result<()> {
    xprg(pgm, &[SCOPE_AVR_TPI, XPRG_CMD_LEAVE_PROGMODE]).map(|_| ())
}

fn erase(pgm: &mut Jtag3, kind: u8, addr: u32) -> Result<()> {
    let mut payload = vec![SCOPE_AVR_TPI, XPRG_CMD_ERASE, kind];
    payload.extend_from_slice(&addr.to_be_bytes());
    xprg(pgm, &payload).map(|_| ())
}

pub fn chip_erase(pgm: &mut Jtag3, part: &Part) -> Result<()> {
    let flash = part.mem_or_err("flash")?;
    // The erase address must point into the flash space; its low bit set
    // selects the whole array.
    erase(pgm, XPRG_ERASE_CHIP, flash.offset | 1)
}

fn read_mem(pgm: &mut Jtag3, mtype: u8, addr: u32, len: u16) -> Result<Vec<u8>> {
    let mut payload = vec![SCOPE_AVR_TPI, XPRG_CMD_READ_MEM, mtype];
    payload.extend_from_slice(&addr.to_be_bytes());
    payload.extend_from_slice(&len.to_be_bytes());
    let body = xprg(pgm, &payload)?;
    if body.len() < 3 + len as usize {
        return Err(Error::ShortReply {
            expected: 3 + len as usize,
            got: body.len(),
        });
    }
    Ok(body[3..3 + len as usize].to_vec())
}

/// Writes one chunk. Flash data must arrive in whole write units of
/// `2 * n_word_writes` bytes; short chunks get their unused replica
/// slots padded with 0xFF.
fn write_mem(pgm: &mut Jtag3, mtype: u8, addr: u32, data: &[u8]) -> Result<()> {
    let unit = if mtype == XPRG_MEM_TYPE_APPL {
        2 * pgm.n_word_writes as usize
    } else {
        1
    };
    let len = (data.len() + unit - 1) / unit * unit;
    let chunk = padded(data, len, 0xff);
    let mut payload = vec![SCOPE_AVR_TPI, XPRG_CMD_WRITE_MEM, mtype, PAGEMODE_ERASE_WRITE];
    payload.extend_from_slice(&addr.to_be_bytes());
    payload.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
    payload.extend_from_slice(&chunk);
    xprg(pgm, &payload).map(|_| ())
}

pub fn read_byte(pgm: &mut Jtag3, _part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
    Ok(read_mem(pgm, mem_type(mem), mem.logical(addr), 1)?[0])
}

pub fn write_byte(pgm: &mut Jtag3, _part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
    if mem.is_fuse() {
        // The config byte is erased as a whole before rewriting.
        erase(pgm, XPRG_ERASE_CONFIG, mem.logical(addr))?;
    }
    write_mem(pgm, mem_type(mem), mem.logical(addr), &[value])
}

pub fn paged_load(
    pgm: &mut Jtag3,
    _part: &Part,
    mem: &Memory,
    page_size: u32,
    addr: u32,
    buf: &mut [u8],
) -> Result<usize> {
    let step = page_size.max(1) as usize;
    let mut pos = 0usize;
    while pos < buf.len() {
        let chunk = (buf.len() - pos).min(step);
        let data = read_mem(pgm, mem_type(mem), mem.logical(addr + pos as u32), chunk as u16)?;
        buf[pos..pos + chunk].copy_from_slice(&data);
        pos += chunk;
    }
    Ok(buf.len())
}

pub fn paged_write(
    pgm: &mut Jtag3,
    _part: &Part,
    mem: &Memory,
    page_size: u32,
    addr: u32,
    data: &[u8],
) -> Result<usize> {
    let step = page_size.max(1) as usize;
    let mut pos = 0usize;
    while pos < data.len() {
        let end = (pos + step).min(data.len());
        write_mem(pgm, mem_type(mem), mem.logical(addr + pos as u32), &data[pos..end])?;
        pos = end;
    }
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jtagice3::constants::TOKEN;
    use crate::jtagice3::edbg;
    use crate::transport::mock::MockTransport;

    fn edbg_rsp(raw: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 64];
        pkt[0] = edbg::VENDOR_AVR_RSP;
        pkt[1] = 0x11;
        pkt[2] = (raw.len() >> 8) as u8;
        pkt[3] = raw.len() as u8;
        pkt[4..4 + raw.len()].copy_from_slice(raw);
        pkt
    }

    fn edbg_cmd(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![TOKEN, 0x00, seq as u8, (seq >> 8) as u8];
        raw.extend_from_slice(payload);
        assert!(raw.len() <= 60);
        let mut pkt = vec![0u8; 64];
        pkt[0] = edbg::VENDOR_AVR_CMD;
        pkt[1] = 0x11;
        pkt[2] = (raw.len() >> 8) as u8;
        pkt[3] = raw.len() as u8;
        pkt[4..4 + raw.len()].copy_from_slice(&raw);
        pkt
    }

    fn rsp_frame(seq: u16, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![TOKEN, seq as u8, (seq >> 8) as u8];
        raw.extend_from_slice(body);
        raw
    }

    #[test]
    fn word_write_replication_pads_with_ff() {
        let mut pgm = Jtag3::tpi().over_edbg();
        pgm.n_word_writes = 2;
        let mut mock = MockTransport::new();

        // Two data bytes become one 4-byte write unit, tail-padded.
        let mut payload = vec![
            SCOPE_AVR_TPI,
            XPRG_CMD_WRITE_MEM,
            XPRG_MEM_TYPE_APPL,
            0x03,
        ];
        payload.extend_from_slice(&0x4010u32.to_be_bytes());
        payload.extend_from_slice(&4u16.to_be_bytes());
        payload.extend_from_slice(&[0x12, 0x34, 0xff, 0xff]);
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(
                1,
                &[SCOPE_AVR_TPI, XPRG_CMD_WRITE_MEM, XPRG_ERR_OK],
            )),
        );
        pgm.set_transport(Box::new(mock));
        write_mem(&mut pgm, XPRG_MEM_TYPE_APPL, 0x4010, &[0x12, 0x34]).unwrap();
    }

    #[test]
    fn read_mem_uses_big_endian_address() {
        let mut pgm = Jtag3::tpi().over_edbg();
        let mut mock = MockTransport::new();
        let mut payload = vec![SCOPE_AVR_TPI, XPRG_CMD_READ_MEM, XPRG_MEM_TYPE_APPL];
        payload.extend_from_slice(&[0x00, 0x00, 0x3f, 0xc0]);
        payload.extend_from_slice(&[0x00, 0x03]);
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(
                1,
                &[SCOPE_AVR_TPI, XPRG_CMD_READ_MEM, XPRG_ERR_OK, 0x1e, 0x90, 0x03],
            )),
        );
        pgm.set_transport(Box::new(mock));
        let data = read_mem(&mut pgm, XPRG_MEM_TYPE_APPL, 0x3fc0, 3).unwrap();
        assert_eq!(data, vec![0x1e, 0x90, 0x03]);
    }

    #[test]
    fn xprg_error_code_fails_the_call() {
        let mut pgm = Jtag3::tpi().over_edbg();
        let mut mock = MockTransport::new();
        let payload = [SCOPE_AVR_TPI, XPRG_CMD_ENTER_PROGMODE];
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(
                1,
                &[SCOPE_AVR_TPI, XPRG_CMD_ENTER_PROGMODE, XPRG_ERR_FAILED],
            )),
        );
        pgm.set_transport(Box::new(mock));
        assert!(enter_progmode(&mut pgm).is_err());
    }
}
