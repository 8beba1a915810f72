//! Device-descriptor marshalling.
//!
//! Before programming starts the dongle wants to know the target's memory
//! geometry. Three scope-specific layouts exist: classic megaAVR (JTAG
//! and debugWIRE), XMEGA (PDI), and AVR8X (UPDI). All fields are
//! little-endian and are filled from the first matching memory of the
//! part record.

use crate::part::Part;
use crate::{Error, Result};

fn mem_geometry(part: &Part, name: &str) -> (u32, u32, u32) {
    part.mem(name)
        .map(|m| (m.size, m.page_size, m.offset))
        .unwrap_or((0, 0, 0))
}

/// Classic megaAVR layout, used for JTAG and debugWIRE connections.
pub fn mega(part: &Part) -> Vec<u8> {
    let (flash_size, flash_page, _) = mem_geometry(part, "flash");
    let (eeprom_size, eeprom_page, _) = mem_geometry(part, "eeprom");
    let (sram_size, _, sram_start) = mem_geometry(part, "sram");

    let mut d = Vec::with_capacity(32);
    d.extend_from_slice(&(flash_page as u16).to_le_bytes());
    d.extend_from_slice(&flash_size.to_le_bytes());
    // Base of the boot section; zero when the part has no bootloader
    // support.
    d.extend_from_slice(&part.boot_start.unwrap_or(0).to_le_bytes());
    d.push(eeprom_page as u8);
    d.extend_from_slice(&(eeprom_size as u16).to_le_bytes());
    d.extend_from_slice(&(sram_start as u16).to_le_bytes());
    d.extend_from_slice(&(sram_size as u16).to_le_bytes());
    d.push(part.ocd_rev);
    d.push(part.n_interrupts);
    // Full-page bitstreams are always allowed on the parts we carry.
    d.push(1);
    d
}

/// XMEGA layout for PDI connections: the section base addresses plus the
/// two page sizes.
pub fn xmega(part: &Part) -> Vec<u8> {
    let (appl_size, flash_page, appl_base) = mem_geometry(part, "application");
    let (boot_size, _, boot_base) = mem_geometry(part, "boot");
    let (eeprom_size, eeprom_page, eeprom_base) = mem_geometry(part, "eeprom");
    let (_, _, fuse_base) = mem_geometry(part, "fuses");
    let (_, _, lock_base) = mem_geometry(part, "lock");
    let (usersig_size, _, usersig_base) = mem_geometry(part, "usersig");

    let mut d = Vec::with_capacity(48);
    d.extend_from_slice(&appl_base.to_le_bytes());
    d.extend_from_slice(&boot_base.to_le_bytes());
    d.extend_from_slice(&eeprom_base.to_le_bytes());
    d.extend_from_slice(&fuse_base.to_le_bytes());
    d.extend_from_slice(&lock_base.to_le_bytes());
    d.extend_from_slice(&usersig_base.to_le_bytes());
    d.extend_from_slice(&appl_size.to_le_bytes());
    d.extend_from_slice(&(boot_size as u16).to_le_bytes());
    d.extend_from_slice(&(flash_page as u16).to_le_bytes());
    d.extend_from_slice(&(eeprom_size as u16).to_le_bytes());
    d.push(eeprom_page as u8);
    d.extend_from_slice(&(usersig_size as u16).to_le_bytes());
    d.extend_from_slice(&part.nvm_base.to_le_bytes());
    d.extend_from_slice(&part.mcu_base.to_le_bytes());
    d
}

/// AVR8X layout for UPDI connections. Carries the controller bases, the
/// syscfg offset, the measurement dividers and whether the part needs
/// 24-bit addressing.
pub fn updi(part: &Part) -> Result<Vec<u8>> {
    let flash = part
        .first_mem(|m| m.name == "flash")
        .ok_or_else(|| Error::NoSuchMemory {
            part: part.name.to_string(),
            mem: "flash".to_string(),
        })?;
    let (eeprom_size, eeprom_page, eeprom_base) = mem_geometry(part, "eeprom");
    let (fuse_size, _, fuse_base) = mem_geometry(part, "fuses");
    let (_, _, lock_base) = mem_geometry(part, "lock");
    let (_, _, sigrow_base) = mem_geometry(part, "sigrow");
    let (userrow_size, _, userrow_base) = mem_geometry(part, "userrow");

    let mut d = Vec::with_capacity(48);
    d.extend_from_slice(&flash.offset.to_le_bytes());
    d.extend_from_slice(&flash.size.to_le_bytes());
    d.extend_from_slice(&(flash.page_size as u16).to_le_bytes());
    d.extend_from_slice(&(eeprom_base as u16).to_le_bytes());
    d.extend_from_slice(&(eeprom_size as u16).to_le_bytes());
    d.push(eeprom_page as u8);
    d.extend_from_slice(&(fuse_base as u16).to_le_bytes());
    d.push(fuse_size as u8);
    d.extend_from_slice(&(lock_base as u16).to_le_bytes());
    d.extend_from_slice(&(sigrow_base as u16).to_le_bytes());
    d.extend_from_slice(&(userrow_base as u16).to_le_bytes());
    d.push(userrow_size as u8);
    d.extend_from_slice(&part.nvm_base.to_le_bytes());
    d.extend_from_slice(&part.ocd_base.to_le_bytes());
    d.extend_from_slice(&part.syscfg_offset.to_le_bytes());
    // Voltage divider pair for the Vtarget ADC path.
    d.extend_from_slice(&100u16.to_le_bytes());
    d.extend_from_slice(&100u16.to_le_bytes());
    // Address mode: 0 for 16-bit parts, 1 for the 24-bit ones.
    d.push(if part.needs_24bit_addr() { 1 } else { 0 });
    d.push(part.hvupdi_variant.unwrap_or(0));
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::locate;
    use crate::parts;

    #[test]
    fn mega_descriptor_geometry() {
        let db = parts::builtin();
        let p = locate(&db, "ATmega328P").unwrap();
        let d = mega(p);
        assert_eq!(u16::from_le_bytes([d[0], d[1]]), 128);
        assert_eq!(u32::from_le_bytes([d[2], d[3], d[4], d[5]]), 32768);
    }

    #[test]
    fn updi_descriptor_addressing_mode() {
        let db = parts::builtin();
        let tiny = updi(locate(&db, "ATtiny3216").unwrap()).unwrap();
        let dx = updi(locate(&db, "AVR128DA48").unwrap()).unwrap();
        // The address-mode flag is the second-to-last byte.
        assert_eq!(tiny[tiny.len() - 2], 0);
        assert_eq!(dx[dx.len() - 2], 1);
    }

    #[test]
    fn xmega_descriptor_boot_base() {
        let db = parts::builtin();
        let p = locate(&db, "ATxmega128A4U").unwrap();
        let d = xmega(p);
        assert_eq!(u32::from_le_bytes([d[4], d[5], d[6], d[7]]), 0x20000);
    }
}
