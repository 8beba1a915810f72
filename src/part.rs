//! Part and memory descriptors.
//!
//! One [`Part`] describes one MCU family member: its signature, the
//! programming modes its pins expose, the controller base addresses the
//! wire engines need, and an ordered list of [`Memory`] records. The
//! catalogue in [`crate::parts`] builds these at startup; afterwards they
//! are read-only and may be shared freely.

use bitflags::bitflags;

use crate::opcode::Opcode;
use crate::updi::nvm::NvmVersion;

bitflags! {
    /// The set of programming modes a part or a programmer supports.
    pub struct ProgModes: u16 {
        const ISP        = 1 << 0;
        const JTAG       = 1 << 1;
        /// JTAG with the XMEGA command set.
        const JTAG_XMEGA = 1 << 2;
        const PDI        = 1 << 3;
        const UPDI       = 1 << 4;
        const DEBUGWIRE  = 1 << 5;
        const TPI        = 1 << 6;
        const AWIRE      = 1 << 7;
        /// High-voltage (parallel or serial) programming.
        const HV         = 1 << 8;
    }
}

/// The ISP opcode templates attached to one memory of a classic part.
///
/// Flash is word-organised on the wire, so it carries separate low/high
/// templates; everything else reads and writes whole bytes.
#[derive(Debug, Clone, Default)]
pub struct IspOps {
    pub read: Option<Opcode>,
    pub write: Option<Opcode>,
    pub read_lo: Option<Opcode>,
    pub read_hi: Option<Opcode>,
    pub load_lo: Option<Opcode>,
    pub load_hi: Option<Opcode>,
    pub write_page: Option<Opcode>,
    pub load_ext_addr: Option<Opcode>,
}

/// One on-chip memory of a [`Part`].
#[derive(Debug, Clone)]
pub struct Memory {
    pub name: &'static str,
    /// Total size in bytes.
    pub size: u32,
    /// Programming page size in bytes; 0 or 1 for byte-programmed memories.
    pub page_size: u32,
    /// Preferred read chunk size; defaults to `page_size`.
    pub read_size: u32,
    /// Logical base address in the part's address space.
    pub offset: u32,
    /// Factory value, where one is defined (fuses mostly).
    pub initval: Option<u8>,
    pub readonly: bool,
    /// Bits that actually exist at each address; reads of undefined bits
    /// float high on real silicon.
    pub bitmask: u8,
    /// ISP opcode templates, present on classic parts only.
    pub ops: Option<IspOps>,
}

impl Memory {
    /// True for the memories that alias the flash array: `flash`, `boot`,
    /// `application` and `apptable`.
    pub fn is_flash(&self) -> bool {
        matches!(self.name, "flash" | "boot" | "application" | "apptable")
    }

    /// True for `fuses` and for `fuseN` with a single hex digit N.
    pub fn is_fuse(&self) -> bool {
        if self.name == "fuses" {
            return true;
        }
        let mut chars = self.name.chars();
        self.name.len() == 5
            && self.name.starts_with("fuse")
            && chars.nth(4).map_or(false, |c| c.is_ascii_hexdigit())
    }

    pub fn is_eeprom(&self) -> bool {
        self.name == "eeprom"
    }

    pub fn is_lock(&self) -> bool {
        self.name == "lock"
    }

    pub fn is_user_row(&self) -> bool {
        matches!(self.name, "usersig" | "userrow")
    }

    pub fn is_boot_row(&self) -> bool {
        self.name == "bootrow"
    }

    pub fn is_signature(&self) -> bool {
        self.name == "signature"
    }

    /// Read-only if flagged so, or if the name denotes a factory row.
    pub fn is_readonly(&self) -> bool {
        self.readonly
            || matches!(
                self.name,
                "signature" | "sigrow" | "calibration" | "prodsig" | "sernum" | "tempsense" | "sib"
            )
            || self.name.starts_with("osccal")
            || self.name.starts_with("osc16err")
            || self.name.starts_with("osc20err")
    }

    /// True if `page_size` makes paged access meaningful.
    pub fn is_paged(&self) -> bool {
        self.page_size > 1
    }

    /// Checks that `[addr, addr + len)` lies inside this memory.
    pub fn check_range(&self, addr: u32, len: u32) -> crate::Result<()> {
        if u64::from(addr) + u64::from(len) > u64::from(self.size) {
            return Err(crate::Error::AddressOutOfRange {
                mem: self.name.to_string(),
                addr,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Logical address of byte `addr` of this memory.
    pub fn logical(&self, addr: u32) -> u32 {
        self.offset + addr
    }

    /// True if the logical address `l` falls inside this memory.
    pub fn contains_logical(&self, l: u32) -> bool {
        l >= self.offset && l < self.offset + self.size
    }
}

/// Where in a fuse the EEPROM-save bit lives, and which polarity preserves
/// EEPROM across a chip erase. Classic parts preserve on a programmed (0)
/// bit, UPDI parts on a set (1) bit.
#[derive(Debug, Clone, Copy)]
pub struct EesaveFuse {
    pub mem: &'static str,
    pub addr: u32,
    pub mask: u8,
    pub preserve_when_set: bool,
}

/// Descriptor for one MCU family member.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: &'static str,
    pub signature: [u8; 3],
    pub prog_modes: ProgModes,
    pub n_interrupts: u8,
    pub regfile_addr: u16,
    pub ocd_rev: u8,
    /// NVM controller base address (AVR8X).
    pub nvm_base: u16,
    /// MCUCTRL base address (AVR8X).
    pub mcu_base: u16,
    pub ocd_base: u16,
    pub syscfg_offset: u16,
    /// High-voltage UPDI pulse variant, for parts that support it.
    pub hvupdi_variant: Option<u8>,
    pub chip_erase_delay_us: u32,
    /// NVM controller generation, UPDI parts only.
    pub nvm_version: Option<NvmVersion>,
    /// TPI parts that require each word write replicated 2 or 4 times.
    pub n_word_writes: u8,
    pub eesave: Option<EesaveFuse>,
    /// ISP program-enable instruction (classic parts).
    pub pgm_enable: Option<Opcode>,
    /// ISP chip-erase instruction (classic parts).
    pub chip_erase: Option<Opcode>,
    /// First byte address of the boot section, where flash is split.
    pub boot_start: Option<u32>,
    /// DFU bootloader product id, for FLIP-capable parts.
    pub usbpid: Option<u16>,
    pub mem: Vec<Memory>,
}

impl Part {
    /// Looks up a memory by name, case-insensitively.
    pub fn mem(&self, name: &str) -> Option<&Memory> {
        self.mem.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Like [`Part::mem`], but produces the contract error directly.
    pub fn mem_or_err(&self, name: &str) -> crate::Result<&Memory> {
        self.mem(name).ok_or_else(|| crate::Error::NoSuchMemory {
            part: self.name.to_string(),
            mem: name.to_string(),
        })
    }

    /// The first memory satisfying `pred`, used when marshalling device
    /// descriptors that want "the" flash or "the" EEPROM.
    pub fn first_mem(&self, pred: impl Fn(&Memory) -> bool) -> Option<&Memory> {
        self.mem.iter().find(|m| pred(m))
    }

    pub fn is_avr8x(&self) -> bool {
        self.prog_modes.intersects(ProgModes::UPDI)
    }

    pub fn is_xmega(&self) -> bool {
        self.prog_modes.intersects(ProgModes::PDI | ProgModes::JTAG_XMEGA)
    }

    /// 24-bit addressing is needed once the address space outgrows 64 KiB.
    pub fn needs_24bit_addr(&self) -> bool {
        self.mem
            .iter()
            .any(|m| u64::from(m.offset) + u64::from(m.size) > 0x1_0000)
    }
}

/// Finds a part by name in `parts`, case-insensitively.
pub fn locate<'a>(parts: &'a [Part], name: &str) -> Option<&'a Part> {
    parts.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Finds the part carrying `signature` among those programmable in `mode`.
///
/// Signatures are unique within one programming mode, so the first hit is
/// the only hit.
pub fn by_signature<'a>(parts: &'a [Part], signature: &[u8; 3], mode: ProgModes) -> Option<&'a Part> {
    parts
        .iter()
        .find(|p| p.signature == *signature && p.prog_modes.intersects(mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts;

    #[test]
    fn memory_classification() {
        let m = |name| Memory {
            name,
            size: 16,
            page_size: 1,
            read_size: 1,
            offset: 0,
            initval: None,
            readonly: false,
            bitmask: 0xff,
            ops: None,
        };
        assert!(m("flash").is_flash());
        assert!(m("apptable").is_flash());
        assert!(!m("eeprom").is_flash());
        assert!(m("fuses").is_fuse());
        assert!(m("fuse0").is_fuse());
        assert!(m("fuse8").is_fuse());
        assert!(!m("fusex").is_fuse());
        assert!(!m("fusible").is_fuse());
        assert!(m("sigrow").is_readonly());
        assert!(m("osccal16").is_readonly());
        assert!(!m("usersig").is_readonly());
    }

    #[test]
    fn range_check() {
        let m = Memory {
            name: "eeprom",
            size: 256,
            page_size: 4,
            read_size: 4,
            offset: 0x1400,
            initval: None,
            readonly: false,
            bitmask: 0xff,
            ops: None,
        };
        assert!(m.check_range(0, 256).is_ok());
        assert!(m.check_range(255, 1).is_ok());
        assert!(m.check_range(255, 2).is_err());
        assert!(m.check_range(0x1_0000, 1).is_err());
    }

    #[test]
    fn lookup_by_name_and_signature() {
        let db = parts::builtin();
        let p = locate(&db, "atmega328p").unwrap();
        assert_eq!(p.name, "ATmega328P");
        let by_sig = by_signature(&db, &p.signature, ProgModes::ISP).unwrap();
        assert_eq!(by_sig.name, p.name);
        assert!(locate(&db, "no-such-part").is_none());
    }

    #[test]
    fn signatures_unique_per_mode() {
        let db = parts::builtin();
        for (i, a) in db.iter().enumerate() {
            for b in db.iter().skip(i + 1) {
                if a.prog_modes.intersects(b.prog_modes) {
                    assert_ne!(a.signature, b.signature, "{} vs {}", a.name, b.name);
                }
            }
        }
    }
}
