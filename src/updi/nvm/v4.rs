//! NVM controller generation 4: AVR-DU.
//!
//! Same page-buffer discipline as generation 3, but the command register
//! moved to CTRLB, the flash page erase and write commands are split per
//! section (application vs boot), and the part carries a separate boot
//! row that is programmed like a flash page with erase-write.

use super::{busy_wait, Access, NvmCtx};
use crate::updi::readwrite;
use crate::Result;

pub const CTRLA: u32 = 0x00;
/// The command register of this generation.
pub const CTRLB: u32 = 0x01;
pub const STATUS: u32 = 0x02;

// CTRLB commands.
pub const CMD_NOCMD: u8 = 0x00;
pub const CMD_FLASH_PAGE_WRITE_APP: u8 = 0x04;
pub const CMD_FLASH_PAGE_ERASE_WRITE: u8 = 0x05;
pub const CMD_FLASH_PAGE_WRITE_BOOT: u8 = 0x06;
pub const CMD_FLASH_PAGE_ERASE_APP: u8 = 0x08;
pub const CMD_FLASH_PAGE_ERASE_BOOT: u8 = 0x0a;
pub const CMD_FLASH_PAGE_BUFFER_CLR: u8 = 0x0f;
pub const CMD_EEPROM_PAGE_ERASE_WRITE: u8 = 0x15;
pub const CMD_CHIP_ERASE: u8 = 0x20;
pub const CMD_EEPROM_ERASE: u8 = 0x30;

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
    ctx.reg_write(CTRLB, cmd)
}

pub fn chip_erase(ctx: &mut NvmCtx<'_>) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_CHIP_ERASE)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn erase_flash_page(ctx: &mut NvmCtx<'_>, addr: u32) -> Result<()> {
    wait_ready(ctx)?;
    let wide = ctx.wide;
    readwrite::write_byte(ctx.link, addr, wide, 0xff)?;
    command(ctx, CMD_FLASH_PAGE_ERASE_APP)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn erase_eeprom(ctx: &mut NvmCtx<'_>) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_EEPROM_ERASE)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

/// The user row (and the boot row) are flash pages with erase-write.
pub fn erase_user_row(ctx: &mut NvmCtx<'_>, addr: u32, size: u32) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_FLASH_PAGE_BUFFER_CLR)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)?;
    let wide = ctx.wide;
    for i in 0..size {
        readwrite::write_byte(ctx.link, addr + i, wide, 0xff)?;
    }
    command(ctx, CMD_FLASH_PAGE_ERASE_WRITE)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn write_flash(
    ctx: &mut NvmCtx<'_>,
    addr: u32,
    data: &[u8],
    access: Access,
    boot_section: bool,
) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_FLASH_PAGE_BUFFER_CLR)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)?;
    let wide = ctx.wide;
    match access {
        Access::Word => readwrite::write_data_words(ctx.link, addr, wide, data)?,
        Access::Byte => readwrite::write_data(ctx.link, addr, wide, data)?,
    }
    let cmd = if boot_section {
        CMD_FLASH_PAGE_WRITE_BOOT
    } else {
        CMD_FLASH_PAGE_WRITE_APP
    };
    command(ctx, cmd)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn write_user_row(ctx: &mut NvmCtx<'_>, addr: u32, data: &[u8]) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_FLASH_PAGE_BUFFER_CLR)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)?;
    let wide = ctx.wide;
    readwrite::write_data(ctx.link, addr, wide, data)?;
    command(ctx, CMD_FLASH_PAGE_ERASE_WRITE)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn write_eeprom(ctx: &mut NvmCtx<'_>, addr: u32, data: &[u8]) -> Result<()> {
    wait_ready(ctx)?;
    let wide = ctx.wide;
    readwrite::write_data(ctx.link, addr, wide, data)?;
    command(ctx, CMD_EEPROM_PAGE_ERASE_WRITE)?;
    wait_ready(ctx)?;
    command(ctx, CMD_NOCMD)
}

pub fn write_fuse(ctx: &mut NvmCtx<'_>, addr: u32, value: u8) -> Result<()> {
    write_eeprom(ctx, addr, &[value])
}
