//! NVM controller generation 0: tinyAVR-0/1/2 and megaAVR-0.
//!
//! Page-buffer based. Flash pages are filled with word writes after a
//! buffer clear, then committed with a page-write command. Fuses go
//! through the dedicated address/data registers, and the user row is
//! backed by the EEPROM machinery.

use super::{busy_wait, Access, NvmCtx};
use crate::updi::readwrite;
use crate::Result;

// Register offsets from the controller base.
pub const CTRLA: u32 = 0x00;
pub const STATUS: u32 = 0x02;
pub const DATA_LO: u32 = 0x06;
pub const DATA_HI: u32 = 0x07;
pub const ADDR_LO: u32 = 0x08;
pub const ADDR_HI: u32 = 0x09;

// CTRLA commands.
pub const CMD_WRITE_PAGE: u8 = 0x01;
pub const CMD_ERASE_PAGE: u8 = 0x02;
pub const CMD_ERASE_WRITE_PAGE: u8 = 0x03;
pub const CMD_PAGE_BUFFER_CLR: u8 = 0x04;
pub const CMD_CHIP_ERASE: u8 = 0x05;
pub const CMD_EEPROM_ERASE: u8 = 0x06;
pub const CMD_WRITE_FUSE: u8 = 0x07;

// STATUS bits.
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
    wait_ready(ctx)
}

/// Page erase wants the address latched by a dummy write to the page.
pub fn erase_flash_page(ctx: &mut NvmCtx<'_>, addr: u32) -> Result<()> {
    wait_ready(ctx)?;
    let wide = ctx.wide;
    readwrite::write_byte(ctx.link, addr, wide, 0xff)?;
    command(ctx, CMD_ERASE_PAGE)?;
    wait_ready(ctx)
}

pub fn erase_eeprom(ctx: &mut NvmCtx<'_>) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_EEPROM_ERASE)?;
    wait_ready(ctx)
}

/// The user row is EEPROM-backed: dummy-write every byte, then erase the
/// page.
pub fn erase_user_row(ctx: &mut NvmCtx<'_>, addr: u32, size: u32) -> Result<()> {
    wait_ready(ctx)?;
    let wide = ctx.wide;
    for i in 0..size {
        readwrite::write_byte(ctx.link, addr + i, wide, 0xff)?;
    }
    command(ctx, CMD_ERASE_PAGE)?;
    wait_ready(ctx)
}

pub fn write_flash(
    ctx: &mut NvmCtx<'_>,
    addr: u32,
    data: &[u8],
    access: Access,
    _boot_section: bool,
) -> Result<()> {
    wait_ready(ctx)?;
    command(ctx, CMD_PAGE_BUFFER_CLR)?;
    wait_ready(ctx)?;
    let wide = ctx.wide;
    match access {
        Access::Word => readwrite::write_data_words(ctx.link, addr, wide, data)?,
        Access::Byte => readwrite::write_data(ctx.link, addr, wide, data)?,
    }
    command(ctx, CMD_WRITE_PAGE)?;
    wait_ready(ctx)
}

pub fn write_user_row(ctx: &mut NvmCtx<'_>, addr: u32, data: &[u8]) -> Result<()> {
    write_eeprom(ctx, addr, data)
}

/// EEPROM writes fill the page buffer byte-wise and commit with
/// erase-write.
pub fn write_eeprom(ctx: &mut NvmCtx<'_>, addr: u32, data: &[u8]) -> Result<()> {
    wait_ready(ctx)?;
    let wide = ctx.wide;
    readwrite::write_data(ctx.link, addr, wide, data)?;
    command(ctx, CMD_ERASE_WRITE_PAGE)?;
    wait_ready(ctx)
}

/// Fuses use the dedicated ADDR/DATA register pair.
pub fn write_fuse(ctx: &mut NvmCtx<'_>, addr: u32, value: u8) -> Result<()> {
    wait_ready(ctx)?;
    ctx.reg_write(ADDR_LO, addr as u8)?;
    ctx.reg_write(ADDR_HI, (addr >> 8) as u8)?;
    ctx.reg_write(DATA_LO, value)?;
    command(ctx, CMD_WRITE_FUSE)?;
    wait_ready(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::updi::link::UpdiLink;

    fn echo(cmd: &[u8], extra: &[u8]) -> Vec<u8> {
        let mut reply = cmd.to_vec();
        reply.extend_from_slice(extra);
        reply
    }

    /// A generation-0 flash page write is: ready, buffer clear, ready,
    /// word pushes, page write, ready.
    #[test]
    fn flash_page_write_sequence() {
        let status_poll = [0x55u8, 0x04, 0x02, 0x10];
        let ctrla_sts = [0x55u8, 0x44, 0x00, 0x10];

        let mut mock = MockTransport::new();
        // wait_ready at entry
        mock.expect(status_poll.to_vec(), echo(&status_poll, &[0x00]));
        // page buffer clear
        mock.expect(ctrla_sts.to_vec(), echo(&ctrla_sts, &[0x40]));
        mock.expect(vec![CMD_PAGE_BUFFER_CLR], vec![CMD_PAGE_BUFFER_CLR, 0x40]);
        // wait_ready after the clear
        mock.expect(status_poll.to_vec(), echo(&status_poll, &[0x00]));
        // pointer, repeat, two word pushes
        let st_ptr = [0x55u8, 0x69, 0x00, 0x80];
        mock.expect(st_ptr.to_vec(), echo(&st_ptr, &[0x40]));
        mock.expect(vec![0x55, 0xa0, 0x01], vec![0x55, 0xa0, 0x01]);
        mock.expect(vec![0x55, 0x65], vec![0x55, 0x65]);
        mock.expect(vec![0xaa, 0xaa], vec![0xaa, 0xaa, 0x40]);
        mock.expect(vec![0xaa, 0xaa], vec![0xaa, 0xaa, 0x40]);
        // page write command
        mock.expect(ctrla_sts.to_vec(), echo(&ctrla_sts, &[0x40]));
        mock.expect(vec![CMD_WRITE_PAGE], vec![CMD_WRITE_PAGE, 0x40]);
        // final wait_ready
        mock.expect(status_poll.to_vec(), echo(&status_poll, &[0x00]));

        let mut link = UpdiLink::new(Box::new(mock), 115_200);
        let mut ctx = NvmCtx::new(&mut link, 0x1000, false);
        write_flash(&mut ctx, 0x8000, &[0xaa; 4], Access::Word, false).unwrap();
    }

    /// The fuse path goes through the dedicated ADDR/DATA registers.
    #[test]
    fn fuse_write_sequence() {
        let status_poll = [0x55u8, 0x04, 0x02, 0x10];
        let mut mock = MockTransport::new();
        mock.expect(status_poll.to_vec(), echo(&status_poll, &[0x00]));
        // ADDR_LO = 0x85
        let sts_addr_lo = [0x55u8, 0x44, 0x08, 0x10];
        mock.expect(sts_addr_lo.to_vec(), echo(&sts_addr_lo, &[0x40]));
        mock.expect(vec![0x85], vec![0x85, 0x40]);
        // ADDR_HI = 0x12
        let sts_addr_hi = [0x55u8, 0x44, 0x09, 0x10];
        mock.expect(sts_addr_hi.to_vec(), echo(&sts_addr_hi, &[0x40]));
        mock.expect(vec![0x12], vec![0x12, 0x40]);
        // DATA_LO = 0x00
        let sts_data_lo = [0x55u8, 0x44, 0x06, 0x10];
        mock.expect(sts_data_lo.to_vec(), echo(&sts_data_lo, &[0x40]));
        mock.expect(vec![0x00], vec![0x00, 0x40]);
        // WFU command
        let ctrla_sts = [0x55u8, 0x44, 0x00, 0x10];
        mock.expect(ctrla_sts.to_vec(), echo(&ctrla_sts, &[0x40]));
        mock.expect(vec![CMD_WRITE_FUSE], vec![CMD_WRITE_FUSE, 0x40]);
        mock.expect(status_poll.to_vec(), echo(&status_poll, &[0x00]));

        let mut link = UpdiLink::new(Box::new(mock), 115_200);
        let mut ctx = NvmCtx::new(&mut link, 0x1000, false);
        write_fuse(&mut ctx, 0x1285, 0x00).unwrap();
    }
}
