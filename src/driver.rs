//! The memory-oriented driver loop.
//!
//! Everything here talks to the [`Programmer`] contract only: bring a
//! session up, erase, read, write, verify, and recover from the one
//! recoverable failure (a locked device) by erasing and retrying. The
//! CLI binary is a thin shell around these functions.

use crate::part::{Memory, Part};
use crate::programmer::{negotiate_mode, Programmer};
use crate::{Error, Result};

/// Session options the caller threads through from its command line.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub port: String,
    /// Accept mode ambiguity and signature mismatches.
    pub force: bool,
    /// Never run an implicit chip erase, even to unlock.
    pub no_erase: bool,
    pub extparams: Vec<String>,
}

/// Brings the full session up: extended parameters, mode negotiation,
/// transport, wire session, signature check.
pub fn connect(pgm: &mut dyn Programmer, part: &Part, opts: &Options) -> Result<()> {
    pgm.parse_extparams(&opts.extparams)?;
    let mode = negotiate_mode(part, pgm.prog_modes(), opts.force)?;
    log::debug!("programming {} via {:?}", part.name, mode);

    pgm.setup()?;
    pgm.open(&opts.port)?;
    pgm.initialize(part)?;
    pgm.enable(part)?;

    match verify_signature(pgm, part) {
        Ok(()) => {}
        Err(Error::SignatureMismatch { expected, got }) if opts.force => {
            log::warn!(
                "signature mismatch (expected {:02x?}, got {:02x?}), continuing anyway",
                expected,
                got
            );
        }
        Err(e) => {
            shutdown(pgm);
            return Err(e);
        }
    }
    Ok(())
}

/// Tears the session down in reverse order; errors on the way out are
/// logged, not propagated.
pub fn shutdown(pgm: &mut dyn Programmer) {
    if let Err(e) = pgm.disable() {
        log::warn!("disable failed: {}", e);
    }
    pgm.close();
    pgm.teardown();
}

/// Reads the three signature bytes and cross-checks the part record.
pub fn verify_signature(pgm: &mut dyn Programmer, part: &Part) -> Result<()> {
    let mem = match part.mem("signature") {
        Some(m) => m,
        // A part without a readable signature is taken at its word.
        None => return Ok(()),
    };
    let got = match pgm.read_sig_bytes(part, mem) {
        Ok(sig) => sig,
        Err(Error::Unsupported(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    if got != part.signature {
        return Err(Error::SignatureMismatch {
            expected: part.signature,
            got,
        });
    }
    log::info!(
        "device signature = {:02x} {:02x} {:02x} ({})",
        got[0],
        got[1],
        got[2],
        part.name
    );
    Ok(())
}

fn resolve<'a>(part: &'a Part, memname: &str) -> Result<&'a Memory> {
    part.mem_or_err(memname)
}

/// Reads `len` bytes at `addr` of the named memory, paged where the
/// memory is paged.
pub fn read_region(
    pgm: &mut dyn Programmer,
    part: &Part,
    memname: &str,
    addr: u32,
    len: u32,
) -> Result<Vec<u8>> {
    let mem = resolve(part, memname)?;
    mem.check_range(addr, len)?;
    let mut buf = vec![0u8; len as usize];
    if mem.is_paged() {
        pgm.paged_load(part, mem, mem.read_size.max(1), addr, &mut buf)?;
    } else {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = pgm.read_byte(part, mem, addr + i as u32)?;
        }
    }
    Ok(buf)
}

fn write_region_once(
    pgm: &mut dyn Programmer,
    part: &Part,
    mem: &Memory,
    addr: u32,
    data: &[u8],
) -> Result<usize> {
    if mem.is_paged() {
        pgm.paged_write(part, mem, mem.page_size, addr, data)
    } else {
        for (i, v) in data.iter().enumerate() {
            pgm.write_byte(part, mem, addr + i as u32, *v)?;
        }
        Ok(data.len())
    }
}

/// Writes `data` to the named memory. A locked device is erased and the
/// write retried once, unless `no_erase` forbids it.
pub fn write_region(
    pgm: &mut dyn Programmer,
    part: &Part,
    memname: &str,
    addr: u32,
    data: &[u8],
    no_erase: bool,
) -> Result<usize> {
    let mem = resolve(part, memname)?;
    mem.check_range(addr, data.len() as u32)?;
    match write_region_once(pgm, part, mem, addr, data) {
        Ok(n) => Ok(n),
        Err(e) if e.is_chip_locked() && !no_erase => {
            log::warn!("device is locked; erasing chip and retrying");
            pgm.chip_erase(part)?;
            write_region_once(pgm, part, mem, addr, data)
        }
        Err(e) => Err(e),
    }
}

/// Reads the region back and compares it against `expected`, honouring
/// the per-address bitmask. Returns the number of bytes verified.
pub fn verify_region(
    pgm: &mut dyn Programmer,
    part: &Part,
    memname: &str,
    addr: u32,
    expected: &[u8],
) -> Result<usize> {
    let mem = resolve(part, memname)?;
    let got = read_region(pgm, part, memname, addr, expected.len() as u32)?;
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        if g & mem.bitmask != e & mem.bitmask {
            return Err(Error::Protocol(format!(
                "verification error at {} address 0x{:04x}: expected 0x{:02x}, read 0x{:02x}",
                mem.name,
                addr + i as u32,
                e,
                g
            )));
        }
    }
    Ok(expected.len())
}

/// Reads one fuse byte by memory name ("fuse0", "fuses" with offset...).
pub fn read_fuse(pgm: &mut dyn Programmer, part: &Part, name: &str, addr: u32) -> Result<u8> {
    let mem = resolve(part, name)?;
    if !mem.is_fuse() && !mem.is_lock() {
        return Err(Error::Config(format!("{} is not a fuse memory", name)));
    }
    pgm.read_byte(part, mem, addr)
}

/// Writes one fuse byte and reads it back.
pub fn write_fuse(
    pgm: &mut dyn Programmer,
    part: &Part,
    name: &str,
    addr: u32,
    value: u8,
    no_erase: bool,
) -> Result<()> {
    let mem = resolve(part, name)?;
    if !mem.is_fuse() && !mem.is_lock() {
        return Err(Error::Config(format!("{} is not a fuse memory", name)));
    }
    match pgm.write_byte(part, mem, addr, value) {
        Ok(()) => {}
        Err(e) if e.is_chip_locked() && !no_erase => {
            log::warn!("device is locked; erasing chip and retrying");
            pgm.chip_erase(part)?;
            pgm.write_byte(part, mem, addr, value)?;
        }
        Err(e) => return Err(e),
    }
    let back = pgm.read_byte(part, mem, addr)?;
    if back & mem.bitmask != value & mem.bitmask {
        return Err(Error::Protocol(format!(
            "fuse {} readback 0x{:02x} does not match 0x{:02x}",
            name, back, value
        )));
    }
    Ok(())
}

/// Resets the target by bouncing the programming session.
pub fn reset_target(pgm: &mut dyn Programmer, part: &Part) -> Result<()> {
    pgm.disable()?;
    pgm.enable(part)?;
    pgm.program_enable(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dryrun::Dryrun;
    use crate::part::locate;
    use crate::parts;

    fn session(part_name: &str) -> (Dryrun, Part) {
        let db = parts::builtin();
        let part = locate(&db, part_name).unwrap().clone();
        let mut pgm = Dryrun::new();
        let opts = Options {
            port: "dryrun".to_string(),
            ..Options::default()
        };
        connect(&mut pgm, &part, &opts).unwrap();
        (pgm, part)
    }

    #[test]
    fn end_to_end_flash_cycle() {
        let (mut pgm, part) = session("ATmega328P");
        pgm.chip_erase(&part).unwrap();

        let data: Vec<u8> = (0..256).map(|i| i as u8).collect();
        write_region(&mut pgm, &part, "flash", 0, &data, false).unwrap();
        let back = read_region(&mut pgm, &part, "flash", 0, 256).unwrap();
        assert_eq!(back, data);
        assert_eq!(
            verify_region(&mut pgm, &part, "flash", 0, &data).unwrap(),
            256
        );
    }

    #[test]
    fn verify_catches_a_flip() {
        let (mut pgm, part) = session("ATmega328P");
        pgm.chip_erase(&part).unwrap();
        write_region(&mut pgm, &part, "flash", 0, &[0x12, 0x34], false).unwrap();
        let err = verify_region(&mut pgm, &part, "flash", 0, &[0x12, 0x35]).unwrap_err();
        assert!(format!("{}", err).contains("0x0001"));
    }

    #[test]
    fn fuse_write_reads_back() {
        let (mut pgm, part) = session("ATtiny3216");
        write_fuse(&mut pgm, &part, "fuse0", 0, 0x00, false).unwrap();
        assert_eq!(read_fuse(&mut pgm, &part, "fuses", 0).unwrap(), 0x00);
        assert_eq!(read_fuse(&mut pgm, &part, "fuse0", 0).unwrap(), 0x00);
    }

    #[test]
    fn fuse_helpers_reject_non_fuse_memories() {
        let (mut pgm, part) = session("ATmega328P");
        assert!(read_fuse(&mut pgm, &part, "flash", 0).is_err());
    }

    #[test]
    fn signature_mismatch_blocks_connect() {
        let db = parts::builtin();
        let mut part = locate(&db, "ATmega328P").unwrap().clone();
        let mut pgm = Dryrun::new();
        pgm.initialize(&part).unwrap();
        // Claim a different signature in the record than the image has.
        part.signature = [0x1e, 0x95, 0x0f];
        let err = verify_signature(&mut pgm, &part).unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch { .. }));
    }

    /// A programmer that refuses writes until the chip is erased, like a
    /// locked target would.
    #[derive(Debug)]
    struct Locked {
        inner: Dryrun,
        locked: bool,
    }

    impl Programmer for Locked {
        fn id(&self) -> &'static str {
            "locked"
        }
        fn prog_modes(&self) -> crate::ProgModes {
            self.inner.prog_modes()
        }
        fn open(&mut self, port: &str) -> Result<()> {
            self.inner.open(port)
        }
        fn close(&mut self) {
            self.inner.close()
        }
        fn initialize(&mut self, part: &Part) -> Result<()> {
            self.inner.initialize(part)
        }
        fn program_enable(&mut self, part: &Part) -> Result<()> {
            self.inner.program_enable(part)
        }
        fn chip_erase(&mut self, part: &Part) -> Result<()> {
            self.locked = false;
            self.inner.chip_erase(part)
        }
        fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
            self.inner.read_byte(part, mem, addr)
        }
        fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, v: u8) -> Result<()> {
            if self.locked {
                return Err(Error::ChipLocked);
            }
            self.inner.write_byte(part, mem, addr, v)
        }
        fn paged_load(
            &mut self,
            part: &Part,
            mem: &Memory,
            page_size: u32,
            addr: u32,
            buf: &mut [u8],
        ) -> Result<usize> {
            self.inner.paged_load(part, mem, page_size, addr, buf)
        }
        fn paged_write(
            &mut self,
            part: &Part,
            mem: &Memory,
            page_size: u32,
            addr: u32,
            data: &[u8],
        ) -> Result<usize> {
            if self.locked {
                return Err(Error::ChipLocked);
            }
            self.inner.paged_write(part, mem, page_size, addr, data)
        }
    }

    #[test]
    fn locked_device_is_erased_and_retried() {
        let db = parts::builtin();
        let part = locate(&db, "ATmega328P").unwrap().clone();
        let mut pgm = Locked {
            inner: Dryrun::new(),
            locked: true,
        };
        pgm.initialize(&part).unwrap();

        let n = write_region(&mut pgm, &part, "flash", 0, &[0xaa; 16], false).unwrap();
        assert_eq!(n, 16);
        assert!(!pgm.locked);
        let back = read_region(&mut pgm, &part, "flash", 0, 16).unwrap();
        assert_eq!(back, vec![0xaa; 16]);
    }

    #[test]
    fn locked_device_respects_no_erase() {
        let db = parts::builtin();
        let part = locate(&db, "ATmega328P").unwrap().clone();
        let mut pgm = Locked {
            inner: Dryrun::new(),
            locked: true,
        };
        pgm.initialize(&part).unwrap();
        let err = write_region(&mut pgm, &part, "flash", 0, &[0xaa; 16], true).unwrap_err();
        assert!(err.is_chip_locked());
        assert!(pgm.locked);
    }
}
