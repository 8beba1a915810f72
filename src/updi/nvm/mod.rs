//! NVM controller drivers, one per controller generation.
//!
//! The UPDI session records which generation the target carries (read out
//! of the SIB) and every NVM operation dispatches through the matching
//! driver. The five generations differ in command numbering, in whether a
//! page buffer exists, and in which memory backs the user row; the facade
//! keeps those differences out of the session code.

use std::time::{Duration, Instant};

use super::link::UpdiLink;
use super::readwrite;
use crate::{Error, Result};

pub mod v0;
pub mod v2;
pub mod v3;
pub mod v4;
pub mod v5;

/// NVM controller generation, as advertised in the SIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmVersion {
    /// tinyAVR-0/1/2, megaAVR-0.
    V0,
    /// AVR-DA/DB/DD, no page buffer.
    V2,
    /// AVR-EA.
    V3,
    /// AVR-DU, shifted command register, split app/boot commands.
    V4,
    /// AVR-EB.
    V5,
}

impl NvmVersion {
    /// Decodes the ASCII version digit from the SIB.
    pub fn from_sib_char(c: u8) -> Option<NvmVersion> {
        match c {
            b'0' => Some(NvmVersion::V0),
            b'2' => Some(NvmVersion::V2),
            b'3' => Some(NvmVersion::V3),
            b'4' => Some(NvmVersion::V4),
            b'5' => Some(NvmVersion::V5),
            _ => None,
        }
    }
}

/// Word or byte data pushes; flash takes words, everything else bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Word,
    Byte,
}

/// What the per-version drivers need: the link, the controller base, and
/// the address width of this part.
pub struct NvmCtx<'a> {
    pub link: &'a mut UpdiLink,
    pub nvm_base: u32,
    pub wide: bool,
}

impl std::fmt::Debug for NvmCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NvmCtx(base=0x{:04x}, wide={})", self.nvm_base, self.wide)
    }
}

impl<'a> NvmCtx<'a> {
    pub fn new(link: &'a mut UpdiLink, nvm_base: u32, wide: bool) -> Self {
        NvmCtx {
            link,
            nvm_base,
            wide,
        }
    }

    pub(super) fn reg_write(&mut self, offset: u32, value: u8) -> Result<()> {
        readwrite::write_byte(self.link, self.nvm_base + offset, self.wide, value)
    }

    pub(super) fn reg_read(&mut self, offset: u32) -> Result<u8> {
        readwrite::read_byte(self.link, self.nvm_base + offset, self.wide)
    }
}

/// Busy-wait limit shared by every generation.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls the controller status register until both busy flags clear.
/// A set write-error bit fails immediately; so does the 10 s deadline.
pub(super) fn busy_wait(
    ctx: &mut NvmCtx<'_>,
    status_offset: u32,
    error_mask: u8,
    busy_mask: u8,
) -> Result<()> {
    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        let status = ctx.reg_read(status_offset)?;
        if status & error_mask != 0 {
            return Err(Error::Protocol(format!(
                "NVM controller reports write error (status 0x{:02x})",
                status
            )));
        }
        if status & busy_mask == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("NVM controller ready"));
        }
    }
}

macro_rules! dispatch {
    ($v:expr, $func:ident ( $($arg:expr),* )) => {
        match $v {
            NvmVersion::V0 => v0::$func($($arg),*),
            NvmVersion::V2 => v2::$func($($arg),*),
            NvmVersion::V3 => v3::$func($($arg),*),
            NvmVersion::V4 => v4::$func($($arg),*),
            NvmVersion::V5 => v5::$func($($arg),*),
        }
    };
}

pub fn chip_erase(ctx: &mut NvmCtx<'_>, v: NvmVersion) -> Result<()> {
    dispatch!(v, chip_erase(ctx))
}

pub fn erase_flash_page(ctx: &mut NvmCtx<'_>, v: NvmVersion, addr: u32) -> Result<()> {
    dispatch!(v, erase_flash_page(ctx, addr))
}

pub fn erase_eeprom(ctx: &mut NvmCtx<'_>, v: NvmVersion) -> Result<()> {
    dispatch!(v, erase_eeprom(ctx))
}

pub fn erase_user_row(ctx: &mut NvmCtx<'_>, v: NvmVersion, addr: u32, size: u32) -> Result<()> {
    dispatch!(v, erase_user_row(ctx, addr, size))
}

pub fn write_flash(
    ctx: &mut NvmCtx<'_>,
    v: NvmVersion,
    addr: u32,
    data: &[u8],
    access: Access,
    boot_section: bool,
) -> Result<()> {
    dispatch!(v, write_flash(ctx, addr, data, access, boot_section))
}

pub fn write_user_row(ctx: &mut NvmCtx<'_>, v: NvmVersion, addr: u32, data: &[u8]) -> Result<()> {
    dispatch!(v, write_user_row(ctx, addr, data))
}

pub fn write_eeprom(ctx: &mut NvmCtx<'_>, v: NvmVersion, addr: u32, data: &[u8]) -> Result<()> {
    dispatch!(v, write_eeprom(ctx, addr, data))
}

pub fn write_fuse(ctx: &mut NvmCtx<'_>, v: NvmVersion, addr: u32, value: u8) -> Result<()> {
    dispatch!(v, write_fuse(ctx, addr, value))
}

pub fn wait_ready(ctx: &mut NvmCtx<'_>, v: NvmVersion) -> Result<()> {
    dispatch!(v, wait_ready(ctx))
}

/// Issues a raw controller command, for the terminal's benefit.
pub fn command(ctx: &mut NvmCtx<'_>, v: NvmVersion, cmd: u8) -> Result<()> {
    dispatch!(v, command(ctx, cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sib_digit_decodes() {
        assert_eq!(NvmVersion::from_sib_char(b'0'), Some(NvmVersion::V0));
        assert_eq!(NvmVersion::from_sib_char(b'2'), Some(NvmVersion::V2));
        assert_eq!(NvmVersion::from_sib_char(b'5'), Some(NvmVersion::V5));
        assert_eq!(NvmVersion::from_sib_char(b'1'), None);
        assert_eq!(NvmVersion::from_sib_char(b'x'), None);
    }
}
