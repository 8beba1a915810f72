//! NVM controller generation 2: AVR-DA/DB/DD.
//!
//! No page buffer. The controller is armed with a command, the data is
//! pushed straight at the memory address, and the command register must
//! be cleared with NOCMD afterwards. The user row is flash-backed, and
//! fuses are written through the EEPROM path.

use super::{busy_wait, Access, NvmCtx};
use crate::updi::readwrite;
use crate::Result;

pub const CTRLA: u32 = 0x00;
pub const STATUS: u32 = 0x02;

// CTRLA commands.
pub const CMD_NOCMD: u8 = 0x00;
pub const CMD_FLASH_WRITE: u8 = 0x02;
pub const CMD_FLASH_PAGE_ERASE: u8 = 0x08;
pub const CMD_EEPROM_ERASE_WRITE: u8 = 0x13;
pub const CMD_CHIP_ERASE: u8 = 0x20;
pub const CMD_EEPROM_CHIP_ERASE: u8 = 0x30;

pub const STATUS_FLASH_BUSY: u8 = 1 << 0;
pub const STATUS_EEPROM_BUSY: u8 = 1 << 1;
pub const STATUS_WRITE_ERROR: u8 = 1 << 2;

pub fn wait_ready(ctx: &mut NvmCtx<'_>) -> Result<()> {
    busy_wait(
        ctx,
        STATUS,
        STATUS_WRITE_ERROR,
        STATUS_FLASH_BUSY | STATUS_EEPROM_BUSY,
    )
}

pub fn command(ctx: &mut NvmCtx<'_>, cmd: u8) -> Result<()> {
    ctx.reg_write(CTRLA, cmd)
}

pub fn chip_erase(ctx: &mut NvmCtx<'_>) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_CHIP_ERASE)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn erase_flash_page(ctx: &mut NvmCtx<'_>, addr: u32) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_FLASH_PAGE_ERASE)?;
    let wide = ctx.wide;
    readwrite::write_byte(ctx.link, addr, wide, 0xff)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn erase_eeprom(ctx: &mut NvmCtx<'_>) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_EEPROM_CHIP_ERASE)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

/// Flash-backed user row: erase its page the flash way.
pub fn erase_user_row(ctx: &mut NvmCtx<'_>, addr: u32, _size: u32) -> Result<()> {
    erase_flash_page(ctx, addr)
}

pub fn write_flash(
    ctx: &mut NvmCtx<'_>,
    addr: u32,
    data: &[u8],
    access: Access,
    _boot_section: bool,
) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_FLASH_WRITE)?;
    let wide = ctx.wide;
    match access {
        Access::Word => readwrite::write_data_words(ctx.link, addr, wide, data)?,
        Access::Byte => readwrite::write_data(ctx.link, addr, wide, data)?,
    }
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn write_user_row(ctx: &mut NvmCtx<'_>, addr: u32, data: &[u8]) -> Result<()> {
    write_flash(ctx, addr, data, Access::Byte, false)
}

pub fn write_eeprom(ctx: &mut NvmCtx<'_>, addr: u32, data: &[u8]) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_EEPROM_ERASE_WRITE)?;
    let wide = ctx.wide;
    readwrite::write_data(ctx.link, addr, wide, data)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn write_fuse(ctx: &mut NvmCtx<'_>, addr: u32, value: u8) -> Result<()> {
    write_eeprom(ctx, addr, &[value])
}
