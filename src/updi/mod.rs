//! The UPDI stack: link layer, session state machine, block helpers and
//! the NVM controller drivers, plus the `serialupdi` backend that drives
//! all of it through a plain serial adapter.

pub mod constants;
pub mod link;
pub mod nvm;
pub mod readwrite;

use std::time::{Duration, Instant};

use crate::cache::PageCache;
use crate::part::{Memory, Part, ProgModes};
use crate::programmer::Programmer;
use crate::transport::serial::SerialTransport;
use crate::utils::{page_base, padded};
use crate::{Error, Result};

use constants::*;
use link::UpdiLink;
use nvm::{Access, NvmCtx, NvmVersion};

/// Where the session believes the target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    /// The link answers.
    Normal,
    /// The UPDI interface is enabled.
    Enabled,
    /// NVM programming is open.
    NvmProg,
    /// The chip-erase key went through; the device is unlocked and blank.
    Unlocked,
}

/// Decoded System Information Block.
#[derive(Debug, Clone)]
pub struct SibInfo {
    pub family: String,
    pub nvm_version: u8,
    pub ocd_version: u8,
    pub pdi_rev: u8,
    raw: [u8; 32],
}

impl SibInfo {
    /// Field layout: family in the first seven bytes, "P:<n>" at 8,
    /// "D:<n>" at 11, oscillator and revision data behind that.
    pub fn parse(raw: [u8; 32]) -> SibInfo {
        let family = String::from_utf8_lossy(&raw[0..7]).trim().to_string();
        SibInfo {
            family,
            nvm_version: raw[10],
            ocd_version: raw[13],
            pdi_rev: raw[19],
            raw,
        }
    }

    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.raw)
            .trim_end_matches('\0')
            .to_string()
    }
}

const DEFAULT_BAUD: u32 = 115_200;

/// Raw UPDI through a serial adapter: TX and RX tied together on the
/// target's UPDI pin.
pub struct SerialUpdi {
    link: Option<UpdiLink>,
    state: DeviceState,
    nvm_version: Option<NvmVersion>,
    wide: bool,
    sib: Option<SibInfo>,
    flash_cache: PageCache,
    eeprom_cache: PageCache,
}

impl std::fmt::Debug for SerialUpdi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialUpdi(state={:?})", self.state)
    }
}

impl SerialUpdi {
    pub fn new() -> SerialUpdi {
        SerialUpdi {
            link: None,
            state: DeviceState::Unknown,
            nvm_version: None,
            wide: false,
            sib: None,
            flash_cache: PageCache::new(),
            eeprom_cache: PageCache::new(),
        }
    }

    fn link(&mut self) -> Result<&mut UpdiLink> {
        self.link
            .as_mut()
            .ok_or(Error::Protocol("UPDI link not open".into()))
    }

    fn nvm_version(&self) -> Result<NvmVersion> {
        self.nvm_version
            .ok_or_else(|| Error::Protocol("NVM version not known yet".into()))
    }

    fn sys_status(&mut self) -> Result<u8> {
        self.link()?.ldcs(ASI_SYS_STATUS)
    }

    fn in_prog_mode(&mut self) -> Result<bool> {
        Ok(self.sys_status()? & SYS_STATUS_NVMPROG != 0)
    }

    fn reset_target(&mut self) -> Result<()> {
        let link = self.link()?;
        link.stcs(ASI_RESET_REQ, RESET_REQ_VALUE)?;
        link.stcs(ASI_RESET_REQ, 0x00)?;
        Ok(())
    }

    fn wait_sys_status(&mut self, mask: u8, set: bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let status = self.sys_status()?;
            if (status & mask != 0) == set {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("UPDI system status"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Idempotently opens NVM programming. Fails with the soft chip-locked
    /// error on a locked device, so the driver can erase and retry.
    fn enter_progmode(&mut self) -> Result<()> {
        if self.in_prog_mode()? {
            self.state = DeviceState::NvmProg;
            return Ok(());
        }
        if self.sys_status()? & SYS_STATUS_LOCKSTATUS != 0 {
            return Err(Error::ChipLocked);
        }
        let link = self.link()?;
        link.key(&KEY_NVMPROG)?;
        let key_status = link.ldcs(ASI_KEY_STATUS)?;
        if key_status & KEY_STATUS_NVMPROG == 0 {
            return Err(Error::Protocol(format!(
                "NVMPROG key not accepted (key status 0x{:02x})",
                key_status
            )));
        }
        self.reset_target()?;
        self.wait_sys_status(SYS_STATUS_NVMPROG, true)?;
        self.state = DeviceState::NvmProg;
        Ok(())
    }

    /// Erases and unlocks a locked device with the chip-erase key.
    fn unlock(&mut self) -> Result<()> {
        let link = self.link()?;
        link.key(&KEY_CHIPERASE)?;
        let key_status = link.ldcs(ASI_KEY_STATUS)?;
        if key_status & KEY_STATUS_CHIPERASE == 0 {
            return Err(Error::Protocol(format!(
                "chip-erase key not accepted (key status 0x{:02x})",
                key_status
            )));
        }
        self.reset_target()?;
        self.wait_sys_status(SYS_STATUS_LOCKSTATUS, false)?;
        self.state = DeviceState::Unlocked;
        log::info!("device unlocked by chip erase");
        Ok(())
    }

    fn ctx(&mut self, part: &Part) -> Result<(NvmCtx<'_>, NvmVersion)> {
        let version = self.nvm_version()?;
        let wide = self.wide;
        let nvm_base = u32::from(part.nvm_base);
        let link = self
            .link
            .as_mut()
            .ok_or(Error::Protocol("UPDI link not open".into()))?;
        Ok((NvmCtx::new(link, nvm_base, wide), version))
    }

    fn in_boot_section(part: &Part, logical: u32) -> bool {
        part.boot_start.map_or(false, |b| logical >= b)
    }

    /// Read-modify-write for single bytes of page-organised memories.
    fn rewrite_page_with(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        let page_size = mem.page_size;
        let base = page_base(addr, page_size);
        let mut page = vec![0u8; page_size as usize];
        let wide = self.wide;
        {
            let link = self.link()?;
            readwrite::read_data(link, mem.logical(base), wide, &mut page)?;
        }
        page[(addr - base) as usize] = value;
        self.write_page(part, mem, base, &page, true)
    }

    /// Pushes one page. `erase_first` is only set on the byte-granular
    /// read-modify-write path; bulk writes expect erased cells already.
    fn write_page(
        &mut self,
        part: &Part,
        mem: &Memory,
        addr: u32,
        data: &[u8],
        erase_first: bool,
    ) -> Result<()> {
        let logical = mem.logical(addr);
        let boot = Self::in_boot_section(part, logical);
        let (mut ctx, version) = self.ctx(part)?;
        if mem.is_flash() || mem.is_boot_row() {
            if erase_first {
                nvm::erase_flash_page(&mut ctx, version, logical)?;
            }
            nvm::write_flash(&mut ctx, version, logical, data, Access::Word, boot)?;
        } else if mem.is_user_row() {
            nvm::write_user_row(&mut ctx, version, logical, data)?;
        } else if mem.is_eeprom() {
            nvm::write_eeprom(&mut ctx, version, logical, data)?;
        } else {
            return Err(Error::UnsupportedMemory(mem.name.to_string()));
        }
        Ok(())
    }
}

impl Default for SerialUpdi {
    fn default() -> Self {
        Self::new()
    }
}

impl Programmer for SerialUpdi {
    fn id(&self) -> &'static str {
        "serialupdi"
    }

    fn prog_modes(&self) -> ProgModes {
        ProgModes::UPDI
    }

    fn open(&mut self, port: &str) -> Result<()> {
        // "path" or "path:baud".
        let (path, baud) = match port.rsplit_once(':') {
            Some((p, b)) if b.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (p, b.parse().unwrap_or(DEFAULT_BAUD))
            }
            _ => (port, DEFAULT_BAUD),
        };
        let tr = SerialTransport::open_updi(path, baud)?;
        self.link = Some(UpdiLink::new(Box::new(tr), baud));
        Ok(())
    }

    fn close(&mut self) {
        self.link = None;
        self.state = DeviceState::Unknown;
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        self.wide = part.needs_24bit_addr();
        {
            let link = self.link()?;
            if link.init().is_err() {
                // Nobody home; a double break resets the interface state
                // machine and we try once more.
                link.send_double_break()?;
                link.init()?;
            }
        }
        self.state = DeviceState::Enabled;

        let sib = SibInfo::parse(self.link()?.sib()?);
        log::info!("SIB: {:?} (family {})", sib.as_str(), sib.family);
        let from_sib = NvmVersion::from_sib_char(sib.nvm_version);
        self.nvm_version = from_sib.or(part.nvm_version);
        if let (Some(got), Some(want)) = (from_sib, part.nvm_version) {
            if got != want {
                log::warn!(
                    "SIB reports NVM generation {:?}, part record says {:?}",
                    got,
                    want
                );
            }
        }
        self.sib = Some(sib);

        match self.enter_progmode() {
            Ok(()) => Ok(()),
            Err(Error::ChipLocked) => {
                // Leave the session usable so chip_erase can unlock.
                log::warn!("device is locked; only chip erase will work");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn display(&self, prefix: &str) {
        println!("{}Programmer type : {}", prefix, self.id());
        if let Some(sib) = &self.sib {
            println!("{}Target family   : {}", prefix, sib.family);
            println!("{}NVM version     : {}", prefix, sib.nvm_version as char);
            println!("{}OCD version     : {}", prefix, sib.ocd_version as char);
        }
    }

    fn enable(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            // Reset out of programming mode, then hand the pin back.
            link.stcs(ASI_RESET_REQ, RESET_REQ_VALUE)?;
            link.stcs(ASI_RESET_REQ, 0x00)?;
            link.stcs(CS_CTRLB, CTRLB_UPDIDIS)?;
        }
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
        self.state = DeviceState::Normal;
        Ok(())
    }

    fn program_enable(&mut self, _part: &Part) -> Result<()> {
        self.enter_progmode()
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        let locked = self.sys_status()? & SYS_STATUS_LOCKSTATUS != 0;
        if locked {
            self.unlock()?;
        } else {
            let (mut ctx, version) = self.ctx(part)?;
            nvm::chip_erase(&mut ctx, version)?;
        }
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
        // A full erase drops programming mode on some parts; re-assert.
        self.enter_progmode()
    }

    fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        mem.check_range(addr, 1)?;
        if mem.name == "sib" {
            // The SIB is not memory-mapped; it comes from the key
            // interface and is cached for the session.
            if self.sib.is_none() {
                let sib = SibInfo::parse(self.link()?.sib()?);
                self.sib = Some(sib);
            }
            return Ok(self.sib.as_ref().unwrap().raw[addr as usize % 32]);
        }
        if !self.in_prog_mode()? {
            self.enter_progmode()?;
        }
        let cached = if mem.is_flash() {
            self.flash_cache.lookup(mem.page_size, addr)
        } else if mem.is_eeprom() {
            self.eeprom_cache.lookup(mem.page_size, addr)
        } else {
            None
        };
        if let Some(v) = cached {
            return Ok(v);
        }
        if mem.is_flash() || mem.is_eeprom() {
            let page_size = mem.page_size;
            let base = page_base(addr, page_size);
            let mut page = vec![0u8; page_size as usize];
            let wide = self.wide;
            let logical = mem.logical(base);
            readwrite::read_data(self.link()?, logical, wide, &mut page)?;
            let value = page[(addr - base) as usize];
            let cache = if mem.is_flash() {
                &mut self.flash_cache
            } else {
                &mut self.eeprom_cache
            };
            cache.fill(base, &page);
            return Ok(value);
        }
        let wide = self.wide;
        let logical = mem.logical(addr);
        readwrite::read_byte(self.link()?, logical, wide)
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        mem.check_range(addr, 1)?;
        if mem.is_readonly() {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        if !self.in_prog_mode()? {
            self.enter_progmode()?;
        }
        let logical = mem.logical(addr);
        if mem.is_fuse() || mem.is_lock() {
            let (mut ctx, version) = self.ctx(part)?;
            nvm::write_fuse(&mut ctx, version, logical, value)?;
        } else if mem.is_eeprom() {
            let (mut ctx, version) = self.ctx(part)?;
            nvm::write_eeprom(&mut ctx, version, logical, &[value])?;
            self.eeprom_cache.invalidate_range(mem.page_size, addr, 1);
        } else if mem.is_flash() || mem.is_user_row() || mem.is_boot_row() {
            self.rewrite_page_with(part, mem, addr, value)?;
            self.flash_cache.invalidate_range(mem.page_size, addr, 1);
        } else {
            let wide = self.wide;
            readwrite::write_byte(self.link()?, logical, wide, value)?;
        }
        Ok(())
    }

    fn paged_load(
        &mut self,
        _part: &Part,
        mem: &Memory,
        page_size: u32,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        mem.check_range(addr, buf.len() as u32)?;
        if !self.in_prog_mode()? {
            self.enter_progmode()?;
        }
        let wide = self.wide;
        let mut pos = 0usize;
        while pos < buf.len() {
            let chunk = (buf.len() - pos).min(page_size.max(1) as usize);
            let logical = mem.logical(addr + pos as u32);
            readwrite::read_data(self.link()?, logical, wide, &mut buf[pos..pos + chunk])?;
            pos += chunk;
        }
        Ok(buf.len())
    }

    fn paged_write(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<usize> {
        mem.check_range(addr, data.len() as u32)?;
        if mem.is_readonly() {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        if !self.in_prog_mode()? {
            self.enter_progmode()?;
        }
        if mem.is_fuse() {
            for (i, v) in data.iter().enumerate() {
                let logical = mem.logical(addr + i as u32);
                let (mut ctx, version) = self.ctx(part)?;
                nvm::write_fuse(&mut ctx, version, logical, *v)?;
            }
            return Ok(data.len());
        }
        let step = page_size.max(1) as usize;
        let mut pos = 0usize;
        while pos < data.len() {
            let end = (pos + step).min(data.len());
            let chunk = padded(&data[pos..end], step, 0xff);
            self.write_page(part, mem, addr + pos as u32, &chunk, false)?;
            pos = end;
        }
        if mem.is_flash() {
            self.flash_cache
                .invalidate_range(page_size, addr, data.len() as u32);
        } else if mem.is_eeprom() {
            self.eeprom_cache
                .invalidate_range(page_size, addr, data.len() as u32);
        }
        Ok(data.len())
    }

    fn page_erase(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<()> {
        mem.check_range(addr, 1)?;
        if !self.in_prog_mode()? {
            self.enter_progmode()?;
        }
        let logical = mem.logical(page_base(addr, mem.page_size));
        let (mut ctx, version) = self.ctx(part)?;
        if mem.is_flash() || mem.is_boot_row() {
            nvm::erase_flash_page(&mut ctx, version, logical)?;
        } else if mem.is_user_row() {
            nvm::erase_user_row(&mut ctx, version, logical, mem.size)?;
        } else if mem.is_eeprom() {
            nvm::erase_eeprom(&mut ctx, version)?;
        } else {
            return Err(Error::UnsupportedMemory(mem.name.to_string()));
        }
        if mem.is_flash() {
            self.flash_cache.invalidate_range(mem.page_size, addr, 1);
        } else if mem.is_eeprom() {
            self.eeprom_cache.invalidate();
        }
        Ok(())
    }

    fn read_sib(&mut self, _part: &Part) -> Result<String> {
        if let Some(sib) = &self.sib {
            return Ok(sib.as_str());
        }
        let sib = SibInfo::parse(self.link()?.sib()?);
        let s = sib.as_str();
        self.sib = Some(sib);
        Ok(s)
    }

    fn read_chip_rev(&mut self, part: &Part) -> Result<u8> {
        let wide = self.wide;
        let addr = u32::from(part.syscfg_offset) + 1;
        readwrite::read_byte(self.link()?, addr, wide)
    }

    fn term_keep_alive(&mut self, _part: &Part) -> Result<()> {
        self.sys_status().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sib_fields_decode() {
        let mut raw = [b' '; 32];
        raw[..7].copy_from_slice(b"tinyAVR");
        raw[8..11].copy_from_slice(b"P:0");
        raw[11..14].copy_from_slice(b"D:1");
        raw[19] = b'3';
        let sib = SibInfo::parse(raw);
        assert_eq!(sib.family, "tinyAVR");
        assert_eq!(sib.nvm_version, b'0');
        assert_eq!(sib.ocd_version, b'1');
        assert_eq!(sib.pdi_rev, b'3');
        assert_eq!(NvmVersion::from_sib_char(sib.nvm_version), Some(NvmVersion::V0));
    }

    #[test]
    fn port_spec_with_baud() {
        // rsplit_once keeps Windows COM names intact and peels a numeric
        // suffix off.
        let (path, baud) = match "/dev/ttyUSB0:230400".rsplit_once(':') {
            Some((p, b)) if b.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (p, b.parse().unwrap())
            }
            _ => ("/dev/ttyUSB0:230400", DEFAULT_BAUD),
        };
        assert_eq!(path, "/dev/ttyUSB0");
        assert_eq!(baud, 230400);
    }
}
