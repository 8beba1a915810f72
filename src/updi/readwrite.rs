//! Block read/write helpers on top of the UPDI link.
//!
//! REP counts are 8-bit, so blocks are moved in runs of at most 256 units
//! (bytes or words). Word runs are used for flash, byte runs for
//! everything else.

use super::link::UpdiLink;
use crate::Result;

/// Units of one pointer access run.
const MAX_REP: usize = 256;

pub fn read_byte(link: &mut UpdiLink, addr: u32, wide: bool) -> Result<u8> {
    link.ld8(addr, wide)
}

pub fn write_byte(link: &mut UpdiLink, addr: u32, wide: bool, value: u8) -> Result<()> {
    link.st8(addr, wide, value)
}

/// Reads `buf.len()` bytes starting at `addr`.
pub fn read_data(link: &mut UpdiLink, addr: u32, wide: bool, buf: &mut [u8]) -> Result<()> {
    let mut pos = 0usize;
    while pos < buf.len() {
        let run = (buf.len() - pos).min(MAX_REP);
        link.st_ptr(addr + pos as u32, wide)?;
        if run > 1 {
            link.repeat(run as u16)?;
        }
        link.ld_ptr_inc(&mut buf[pos..pos + run])?;
        pos += run;
    }
    Ok(())
}

/// Writes `data` byte-wise starting at `addr`.
pub fn write_data(link: &mut UpdiLink, addr: u32, wide: bool, data: &[u8]) -> Result<()> {
    let mut pos = 0usize;
    while pos < data.len() {
        let run = (data.len() - pos).min(MAX_REP);
        link.st_ptr(addr + pos as u32, wide)?;
        if run > 1 {
            link.repeat(run as u16)?;
        }
        link.st_ptr_inc(&data[pos..pos + run])?;
        pos += run;
    }
    Ok(())
}

/// Writes `data` as little-endian words starting at the word-aligned
/// `addr`. The NVM controllers require word pushes for flash.
pub fn write_data_words(link: &mut UpdiLink, addr: u32, wide: bool, data: &[u8]) -> Result<()> {
    debug_assert_eq!(addr % 2, 0);
    debug_assert_eq!(data.len() % 2, 0);
    let mut pos = 0usize;
    while pos < data.len() {
        let run = (data.len() - pos).min(MAX_REP * 2) / 2;
        link.st_ptr(addr + pos as u32, wide)?;
        if run > 1 {
            link.repeat(run as u16)?;
        }
        link.st_ptr_inc16(&data[pos..pos + run * 2])?;
        pos += run * 2;
    }
    Ok(())
}
