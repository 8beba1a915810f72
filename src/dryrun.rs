//! The dryrun backend: a programmer with the target in host memory.
//!
//! It mirrors the part record into owned byte buffers and enforces the
//! semantics real silicon would: NOR programming on flash (writes can
//! only clear bits), plain overwrite on EEPROM and user rows, rejection
//! of read-only rows, and propagation between memories that alias the
//! same bytes (flash/application/boot/apptable, fuses/fuseN). It doubles
//! as the oracle the driver-loop tests run against.

use std::collections::HashMap;

use crate::part::{Memory, Part, ProgModes};
use crate::programmer::Programmer;
use crate::utils::page_base;
use crate::{Error, Result};

/// Bytes of flash the bootloader personality guards, unless overridden.
const DEFAULT_BOOT_GUARD: u32 = 512;

#[derive(Debug)]
struct Image {
    part: Part,
    bufs: HashMap<&'static str, Vec<u8>>,
}

/// Tiny deterministic generator for the `random` personality.
#[derive(Debug)]
struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u8 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x as u8
    }
}

#[derive(Debug)]
pub struct Dryrun {
    image: Option<Image>,
    random: bool,
    boot_guard: Option<u32>,
}

impl Dryrun {
    pub fn new() -> Dryrun {
        Dryrun {
            image: None,
            random: false,
            boot_guard: None,
        }
    }

    fn image(&mut self) -> Result<&mut Image> {
        self.image
            .as_mut()
            .ok_or(Error::Protocol("dryrun not initialized".into()))
    }

    fn seed(image: &mut Image, random: bool) {
        for mem in &image.part.mem {
            let fill = mem.initval.unwrap_or(0xff);
            let mut buf = vec![fill; mem.size as usize];
            if mem.is_signature() {
                let len = buf.len().min(3);
                buf.copy_from_slice(&image.part.signature[..len]);
            } else if mem.name == "sigrow" {
                // Device id leads the row, noise follows.
                let mut gen = XorShift(0x5151_0000 ^ u32::from(image.part.signature[2]));
                for b in buf.iter_mut() {
                    *b = gen.next();
                }
                for (i, s) in image.part.signature.iter().enumerate() {
                    if i < buf.len() {
                        buf[i] = *s;
                    }
                }
            } else if mem.name == "calibration" || mem.name.starts_with("osccal") {
                for b in buf.iter_mut() {
                    *b = 0xa7;
                }
            } else if random && mem.is_flash() && mem.name == "flash" {
                let banner = b"dryrun image \xff";
                let mut gen = XorShift(0x2007_1105);
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = if i < banner.len() {
                        banner[i]
                    } else {
                        gen.next()
                    };
                }
            }
            image.bufs.insert(mem.name, buf);
        }
        // Make the overlapping views agree with their owners: the flash
        // aliases read through to flash, fuseN through to fuses.
        let names: Vec<&'static str> = image.part.mem.iter().map(|m| m.name).collect();
        for name in names {
            let mem = image.part.mem(name).unwrap().clone();
            if mem.name == "flash" || mem.name == "fuses" {
                continue;
            }
            if mem.is_flash() || mem.is_fuse() {
                let buf = image.bufs[mem.name].clone();
                for (i, v) in buf.iter().enumerate() {
                    Self::propagate(image, &mem, i as u32, *v);
                }
            }
        }
    }

    /// Copies a byte written at `mem[addr]` into every same-class memory
    /// whose range covers the same logical address.
    fn propagate(image: &mut Image, mem: &Memory, addr: u32, value: u8) {
        let logical = mem.logical(addr);
        let siblings: Vec<(&'static str, u32)> = image
            .part
            .mem
            .iter()
            .filter(|m| m.name != mem.name)
            .filter(|m| {
                (mem.is_flash() && m.is_flash()) || (mem.is_fuse() && m.is_fuse())
            })
            .filter(|m| m.contains_logical(logical))
            .map(|m| (m.name, logical - m.offset))
            .collect();
        for (name, off) in siblings {
            if let Some(buf) = image.bufs.get_mut(name) {
                buf[off as usize] = value;
            }
        }
    }

    fn store(image: &mut Image, mem: &Memory, addr: u32, value: u8) {
        let stored = (value & mem.bitmask) | !mem.bitmask;
        if let Some(buf) = image.bufs.get_mut(mem.name) {
            buf[addr as usize] = stored;
        }
        Self::propagate(image, mem, addr, stored);
    }

    fn guard_violation(&self, mem: &Memory, addr: u32) -> bool {
        match (self.boot_guard, self.image.as_ref()) {
            (Some(guard), Some(image)) => {
                if !mem.is_flash() {
                    return false;
                }
                let flash = match image.part.mem("flash") {
                    Some(f) => f,
                    None => return false,
                };
                mem.logical(addr) >= flash.offset + flash.size - guard
            }
            _ => false,
        }
    }

    fn eesave_active(image: &Image) -> bool {
        let eesave = match image.part.eesave {
            Some(e) => e,
            None => return false,
        };
        let buf = match image.bufs.get(eesave.mem) {
            Some(b) => b,
            None => return false,
        };
        let bit_set = buf
            .get(eesave.addr as usize)
            .map_or(false, |b| b & eesave.mask != 0);
        bit_set == eesave.preserve_when_set
    }
}

impl Default for Dryrun {
    fn default() -> Self {
        Self::new()
    }
}

impl Programmer for Dryrun {
    fn id(&self) -> &'static str {
        "dryrun"
    }

    fn prog_modes(&self) -> ProgModes {
        // The oracle accepts every part.
        ProgModes::all()
    }

    fn open(&mut self, _port: &str) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn initialize(&mut self, part: &Part) -> Result<()> {
        let mut image = Image {
            part: part.clone(),
            bufs: HashMap::new(),
        };
        Self::seed(&mut image, self.random);
        self.image = Some(image);
        Ok(())
    }

    fn display(&self, prefix: &str) {
        println!("{}Programmer type : dryrun", prefix);
        if let Some(image) = &self.image {
            println!("{}Emulated part   : {}", prefix, image.part.name);
        }
    }

    fn program_enable(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    fn chip_erase(&mut self, _part: &Part) -> Result<()> {
        let image = self.image()?;
        let keep_eeprom = Self::eesave_active(image);
        let mems: Vec<Memory> = image.part.mem.clone();
        for mem in &mems {
            let erase = mem.is_flash()
                || mem.is_lock()
                || mem.is_boot_row()
                || (mem.is_eeprom() && !keep_eeprom);
            if erase {
                if let Some(buf) = image.bufs.get_mut(mem.name) {
                    for b in buf.iter_mut() {
                        *b = 0xff;
                    }
                }
            }
        }
        Ok(())
    }

    /// ISP instructions are echoed back, which is what a well-behaved
    /// target does on the wire.
    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        Ok(*cmd)
    }

    fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        mem.check_range(addr, 1)?;
        if matches!(mem.name, "io" | "sram") && self.boot_guard.is_some() {
            if let Some(image) = &self.image {
                if !image.part.is_avr8x() {
                    return Err(Error::UnsupportedMemory(mem.name.to_string()));
                }
            }
        }
        let image = self.image()?;
        image
            .bufs
            .get(mem.name)
            .and_then(|b| b.get(addr as usize).copied())
            .ok_or_else(|| Error::NoSuchMemory {
                part: image.part.name.to_string(),
                mem: mem.name.to_string(),
            })
    }

    fn write_byte(&mut self, _part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        mem.check_range(addr, 1)?;
        if self.guard_violation(mem, addr) {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        let image = self.image()?;
        let current = image
            .bufs
            .get(mem.name)
            .and_then(|b| b.get(addr as usize).copied())
            .ok_or_else(|| Error::NoSuchMemory {
                part: image.part.name.to_string(),
                mem: mem.name.to_string(),
            })?;
        if mem.is_readonly() {
            // Writing back what is already there is tolerated, anything
            // else is not.
            if ((value & mem.bitmask) | !mem.bitmask) == current {
                return Ok(());
            }
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        let effective = if mem.is_flash() {
            // NOR array: programming can only clear bits.
            current & value
        } else {
            value
        };
        Self::store(image, mem, addr, effective);
        Ok(())
    }

    fn paged_load(
        &mut self,
        part: &Part,
        mem: &Memory,
        _page_size: u32,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        mem.check_range(addr, buf.len() as u32)?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_byte(part, mem, addr + i as u32)?;
        }
        Ok(buf.len())
    }

    fn paged_write(
        &mut self,
        part: &Part,
        mem: &Memory,
        _page_size: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<usize> {
        mem.check_range(addr, data.len() as u32)?;
        for (i, v) in data.iter().enumerate() {
            self.write_byte(part, mem, addr + i as u32, *v)?;
        }
        Ok(data.len())
    }

    fn page_erase(&mut self, _part: &Part, mem: &Memory, addr: u32) -> Result<()> {
        mem.check_range(addr, 1)?;
        let base = page_base(addr, mem.page_size.max(1));
        let len = mem.page_size.max(1).min(mem.size - base);
        let image = self.image()?;
        for i in 0..len {
            Self::store(image, mem, base + i, 0xff);
        }
        Ok(())
    }

    fn read_sib(&mut self, _part: &Part) -> Result<String> {
        let image = self.image()?;
        if !image.part.is_avr8x() {
            return Err(Error::Unsupported("read_sib"));
        }
        Ok("dryrun  P:0D:0-3M2 (00.00B00.0)".to_string())
    }

    fn read_chip_rev(&mut self, _part: &Part) -> Result<u8> {
        let image = self.image()?;
        if !(image.part.is_avr8x() || image.part.is_xmega()) {
            return Err(Error::Unsupported("read_chip_rev"));
        }
        Ok(0x01)
    }

    fn parse_extparams(&mut self, params: &[String]) -> Result<()> {
        for p in params {
            if p == "random" {
                self.random = true;
            } else if p == "bootloader" {
                self.boot_guard = Some(DEFAULT_BOOT_GUARD);
            } else if let Some(size) = p.strip_prefix("bootloader=") {
                let n = size
                    .parse()
                    .map_err(|_| Error::Config(format!("bad bootloader size {:?}", size)))?;
                self.boot_guard = Some(n);
            } else {
                return Err(Error::Config(format!(
                    "unknown extended parameter {:?} for dryrun",
                    p
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::locate;
    use crate::parts;

    fn boot(part_name: &str) -> (Dryrun, Part) {
        let db = parts::builtin();
        let part = locate(&db, part_name).unwrap().clone();
        let mut pgm = Dryrun::new();
        pgm.open("dryrun").unwrap();
        pgm.initialize(&part).unwrap();
        (pgm, part)
    }

    #[test]
    fn flash_round_trip_and_signature() {
        let (mut pgm, part) = boot("ATmega328P");
        pgm.chip_erase(&part).unwrap();

        let flash = part.mem("flash").unwrap();
        let data: Vec<u8> = (0..256).map(|i| i as u8).collect();
        pgm.paged_write(&part, flash, 128, 0, &data).unwrap();

        let mut back = vec![0u8; 256];
        pgm.paged_load(&part, flash, 128, 0, &mut back).unwrap();
        assert_eq!(back, data);

        let sig = part.mem("signature").unwrap();
        assert_eq!(pgm.read_byte(&part, sig, 0).unwrap(), 0x1e);
        assert_eq!(pgm.read_byte(&part, sig, 1).unwrap(), 0x95);
        assert_eq!(pgm.read_byte(&part, sig, 2).unwrap(), 0x14);
    }

    #[test]
    fn fuse_alias_propagation() {
        let (mut pgm, part) = boot("ATtiny3216");
        let fuse0 = part.mem("fuse0").unwrap();
        pgm.write_byte(&part, fuse0, 0, 0x00).unwrap();

        let fuses = part.mem("fuses").unwrap();
        assert_eq!(pgm.read_byte(&part, fuses, 0).unwrap(), 0x00);
        assert_eq!(pgm.read_byte(&part, fuse0, 0).unwrap(), 0x00);

        // And the other direction.
        pgm.write_byte(&part, fuses, 5, 0x55).unwrap();
        let fuse5 = part.mem("fuse5").unwrap();
        assert_eq!(pgm.read_byte(&part, fuse5, 0).unwrap(), 0x55);
    }

    #[test]
    fn flash_aliases_share_bytes() {
        let (mut pgm, part) = boot("ATxmega128A4U");
        pgm.chip_erase(&part).unwrap();
        let boot_mem = part.mem("boot").unwrap();
        pgm.write_byte(&part, boot_mem, 0, 0x42).unwrap();

        let flash = part.mem("flash").unwrap();
        assert_eq!(pgm.read_byte(&part, flash, 0x20000).unwrap(), 0x42);
    }

    #[test]
    fn nor_semantics_on_flash() {
        let (mut pgm, part) = boot("ATmega328P");
        pgm.chip_erase(&part).unwrap();
        let flash = part.mem("flash").unwrap();
        pgm.write_byte(&part, flash, 10, 0xf0).unwrap();
        // A second program without erase can only clear more bits.
        pgm.write_byte(&part, flash, 10, 0x0f).unwrap();
        assert_eq!(pgm.read_byte(&part, flash, 10).unwrap(), 0x00);
    }

    #[test]
    fn chip_erase_is_idempotent_and_obeys_eesave() {
        let (mut pgm, part) = boot("ATmega328P");
        let flash = part.mem("flash").unwrap();
        let eeprom = part.mem("eeprom").unwrap();
        pgm.chip_erase(&part).unwrap();
        pgm.write_byte(&part, flash, 0, 0x00).unwrap();
        pgm.write_byte(&part, eeprom, 0, 0x12).unwrap();

        // EESAVE unprogrammed (bit set): EEPROM is wiped with the flash.
        pgm.chip_erase(&part).unwrap();
        pgm.chip_erase(&part).unwrap();
        assert_eq!(pgm.read_byte(&part, flash, 0).unwrap(), 0xff);
        assert_eq!(pgm.read_byte(&part, eeprom, 0).unwrap(), 0xff);

        // Program EESAVE (clear the bit); now EEPROM survives.
        let hfuse = part.mem("fuse1").unwrap();
        let v = pgm.read_byte(&part, hfuse, 0).unwrap();
        pgm.write_byte(&part, hfuse, 0, v & !0x08).unwrap();
        pgm.write_byte(&part, eeprom, 0, 0x34).unwrap();
        pgm.chip_erase(&part).unwrap();
        assert_eq!(pgm.read_byte(&part, eeprom, 0).unwrap(), 0x34);
        assert_eq!(pgm.read_byte(&part, flash, 0).unwrap(), 0xff);
    }

    #[test]
    fn readonly_rows_reject_changes_but_allow_identical_writes() {
        let (mut pgm, part) = boot("ATmega328P");
        let sig = part.mem("signature").unwrap();
        let current = pgm.read_byte(&part, sig, 0).unwrap();
        assert!(pgm.write_byte(&part, sig, 0, current).is_ok());
        assert!(pgm.write_byte(&part, sig, 0, current ^ 0xff).is_err());
    }

    #[test]
    fn isp_commands_echo() {
        let (mut pgm, _part) = boot("ATtiny13");
        let reply = pgm.cmd(&[0xac, 0x80, 0x00, 0x00]).unwrap();
        assert_eq!(reply[1], 0x80);
    }

    #[test]
    fn bootloader_personality_guards_top_of_flash() {
        let db = parts::builtin();
        let part = locate(&db, "ATmega328P").unwrap().clone();
        let mut pgm = Dryrun::new();
        pgm.parse_extparams(&["bootloader=512".to_string()]).unwrap();
        pgm.open("dryrun").unwrap();
        pgm.initialize(&part).unwrap();

        let flash = part.mem("flash").unwrap();
        assert!(pgm.write_byte(&part, flash, 32768 - 1, 0x00).is_err());
        assert!(pgm.write_byte(&part, flash, 0, 0x00).is_ok());

        // And io/sram reads are refused on a classic part in this role.
        let io = part.mem("io").unwrap();
        assert!(matches!(
            pgm.read_byte(&part, io, 0),
            Err(Error::UnsupportedMemory(_))
        ));
    }

    #[test]
    fn random_personality_is_deterministic_noise() {
        let db = parts::builtin();
        let part = locate(&db, "ATmega328P").unwrap().clone();
        let mut a = Dryrun::new();
        a.parse_extparams(&["random".to_string()]).unwrap();
        a.open("dryrun").unwrap();
        a.initialize(&part).unwrap();
        let mut b = Dryrun::new();
        b.parse_extparams(&["random".to_string()]).unwrap();
        b.open("dryrun").unwrap();
        b.initialize(&part).unwrap();

        let flash = part.mem("flash").unwrap();
        let mut pa = vec![0u8; 64];
        let mut pb = vec![0u8; 64];
        a.paged_load(&part, flash, 128, 0, &mut pa).unwrap();
        b.paged_load(&part, flash, 128, 0, &mut pb).unwrap();
        assert_eq!(pa, pb);
        // Not all 0xFF: the image actually contains something.
        assert!(pa.iter().any(|&x| x != 0xff));
    }
}
