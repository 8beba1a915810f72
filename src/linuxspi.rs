//! Bit-clocked ISP through the Linux spidev interface, with a sysfs GPIO
//! driving the target's reset line.
//!
//! Every ISP operation is one 4-byte SPI transfer built from the part's
//! opcode templates; reset is held low for the whole session, the way a
//! dedicated dongle would hold it.

use std::time::Duration;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Pin, Spidev};

use crate::cache::PageCache;
use crate::opcode::Opcode;
use crate::part::{Memory, Part, ProgModes};
use crate::programmer::Programmer;
use crate::utils::page_base;
use crate::{Error, Result};

const DEFAULT_SPEED_HZ: u32 = 200_000;
const DEFAULT_RESET_PIN: u64 = 8;

/// Slow-to-wake targets get this many program-enable attempts, with a
/// reset pulse between them.
const PGM_ENABLE_RETRIES: u32 = 65;

fn gpio_err<E: std::fmt::Debug>(e: E) -> Error {
    Error::Protocol(format!("GPIO error: {:?}", e))
}

pub struct LinuxSpi {
    spi: Option<Spidev>,
    reset: Option<Pin>,
    speed_hz: u32,
    flash_cache: PageCache,
    eeprom_cache: PageCache,
}

impl std::fmt::Debug for LinuxSpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LinuxSpi(speed={} Hz)", self.speed_hz)
    }
}

impl LinuxSpi {
    pub fn new() -> LinuxSpi {
        LinuxSpi {
            spi: None,
            reset: None,
            speed_hz: DEFAULT_SPEED_HZ,
            flash_cache: PageCache::new(),
            eeprom_cache: PageCache::new(),
        }
    }

    fn spi(&mut self) -> Result<&mut Spidev> {
        self.spi
            .as_mut()
            .ok_or(Error::Protocol("SPI device not open".into()))
    }

    fn transfer4(&mut self, instr: [u8; 4]) -> Result<[u8; 4]> {
        let mut buf = instr;
        self.spi()?
            .transfer(&mut buf)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(buf)
    }

    fn reset_pulse(&mut self) -> Result<()> {
        if let Some(pin) = self.reset.as_mut() {
            pin.set_high().map_err(gpio_err)?;
            std::thread::sleep(Duration::from_micros(100));
            pin.set_low().map_err(gpio_err)?;
            // Reset recovery before the next command.
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    fn op<'a>(
        mem: &'a Memory,
        pick: impl Fn(&'a crate::part::IspOps) -> Option<&'a Opcode>,
    ) -> Result<&'a Opcode> {
        mem.ops
            .as_ref()
            .and_then(pick)
            .ok_or_else(|| Error::UnsupportedMemory(mem.name.to_string()))
    }

    /// Flash is word-addressed with separate low/high templates; the
    /// low bit of the byte address picks the half.
    fn read_flash_byte(&mut self, mem: &Memory, addr: u32) -> Result<u8> {
        let word = addr / 2;
        let op = if addr & 1 == 0 {
            Self::op(mem, |o| o.read_lo.as_ref())?
        } else {
            Self::op(mem, |o| o.read_hi.as_ref())?
        }
        .clone();
        let reply = self.transfer4(op.instr(word, 0))?;
        Ok(op.output(&reply))
    }

    fn plain_read(&mut self, mem: &Memory, addr: u32) -> Result<u8> {
        let op = Self::op(mem, |o| o.read.as_ref())?.clone();
        let reply = self.transfer4(op.instr(mem.logical(addr), 0))?;
        Ok(op.output(&reply))
    }

    fn write_flash_page(&mut self, mem: &Memory, base: u32, data: &[u8]) -> Result<()> {
        let load_lo = Self::op(mem, |o| o.load_lo.as_ref())?.clone();
        let load_hi = Self::op(mem, |o| o.load_hi.as_ref())?.clone();
        let commit = Self::op(mem, |o| o.write_page.as_ref())?.clone();
        for (i, v) in data.iter().enumerate() {
            let addr = base + i as u32;
            let word = (addr % mem.page_size) / 2;
            let op = if addr & 1 == 0 { &load_lo } else { &load_hi };
            self.transfer4(op.instr(word, *v))?;
        }
        self.transfer4(commit.instr(base / 2, 0))?;
        // Page write time.
        std::thread::sleep(Duration::from_millis(5));
        Ok(())
    }
}

impl Default for LinuxSpi {
    fn default() -> Self {
        Self::new()
    }
}

impl Programmer for LinuxSpi {
    fn id(&self) -> &'static str {
        "linuxspi"
    }

    fn prog_modes(&self) -> ProgModes {
        ProgModes::ISP
    }

    fn open(&mut self, port: &str) -> Result<()> {
        // "/dev/spidev0.0" or "/dev/spidev0.0:<gpio>".
        let (path, pin_no) = match port.rsplit_once(':') {
            Some((p, g)) if g.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (p, g.parse().unwrap_or(DEFAULT_RESET_PIN))
            }
            _ => (port, DEFAULT_RESET_PIN),
        };
        let mut spi = Spidev::open(path)?;
        let mut options = SpidevOptions::new();
        options.mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS);
        options.max_speed_hz(self.speed_hz);
        spi.configure(&options)?;

        let reset = Pin::new(pin_no);
        reset.export().map_err(gpio_err)?;
        reset.set_direction(Direction::Out).map_err(gpio_err)?;
        let mut reset_pin = reset;
        // Hold the target in reset for the whole session.
        reset_pin.set_low().map_err(gpio_err)?;
        std::thread::sleep(Duration::from_millis(20));

        log::debug!("opened {} with reset on GPIO {}", path, pin_no);
        self.spi = Some(spi);
        self.reset = Some(reset_pin);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(pin) = self.reset.as_mut() {
            // Release the target.
            let _ = pin.set_high();
            let _ = pin.unexport();
        }
        self.spi = None;
        self.reset = None;
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        if !part.prog_modes.contains(ProgModes::ISP) {
            return Err(Error::NoCommonMode);
        }
        self.program_enable(part)
    }

    fn display(&self, prefix: &str) {
        println!("{}Programmer type : linuxspi", prefix);
        println!("{}SPI clock       : {} Hz", prefix, self.speed_hz);
    }

    fn program_enable(&mut self, part: &Part) -> Result<()> {
        let op = part
            .pgm_enable
            .as_ref()
            .ok_or(Error::Unsupported("program_enable"))?
            .clone();
        let instr = op.instr(0, 0);
        for attempt in 0..PGM_ENABLE_RETRIES {
            let reply = self.transfer4(instr)?;
            // The target echoes the second command byte one slot later
            // once it is awake and listening.
            if reply[2] == instr[1] {
                return Ok(());
            }
            log::debug!("program enable attempt {} out of sync", attempt + 1);
            self.reset_pulse()?;
        }
        Err(Error::NoTargetPower)
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        let op = part
            .chip_erase
            .as_ref()
            .ok_or(Error::Unsupported("chip_erase"))?
            .clone();
        self.transfer4(op.instr(0, 0))?;
        std::thread::sleep(Duration::from_micros(u64::from(part.chip_erase_delay_us)));
        self.reset_pulse()?;
        self.program_enable(part)?;
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
        Ok(())
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        self.transfer4(*cmd)
    }

    fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        mem.check_range(addr, 1)?;
        let page_size = mem.page_size.max(1);
        let cached = if mem.is_flash() {
            self.flash_cache.lookup(page_size, addr)
        } else if mem.is_eeprom() {
            self.eeprom_cache.lookup(page_size, addr)
        } else {
            None
        };
        if let Some(v) = cached {
            return Ok(v);
        }
        if mem.is_flash() {
            // Fill the cache page-wise; single bytes would crawl.
            let base = page_base(addr, page_size);
            let mut page = vec![0u8; page_size as usize];
            for (i, b) in page.iter_mut().enumerate() {
                *b = self.read_flash_byte(mem, base + i as u32)?;
            }
            let value = page[(addr - base) as usize];
            self.flash_cache.fill(base, &page);
            return Ok(value);
        }
        if mem.is_eeprom() {
            let base = page_base(addr, page_size);
            let mut page = vec![0u8; page_size as usize];
            for (i, b) in page.iter_mut().enumerate() {
                *b = self.plain_read(mem, base + i as u32)?;
            }
            let value = page[(addr - base) as usize];
            self.eeprom_cache.fill(base, &page);
            return Ok(value);
        }
        self.plain_read(mem, addr)
    }

    fn write_byte(&mut self, _part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        mem.check_range(addr, 1)?;
        if mem.is_readonly() {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        if mem.is_flash() {
            let page_size = mem.page_size.max(1);
            let base = page_base(addr, page_size);
            let mut page = vec![0u8; page_size as usize];
            for (i, b) in page.iter_mut().enumerate() {
                *b = self.read_flash_byte(mem, base + i as u32)?;
            }
            page[(addr - base) as usize] = value;
            self.write_flash_page(mem, base, &page)?;
            self.flash_cache.invalidate_range(page_size, addr, 1);
            return Ok(());
        }
        let op = Self::op(mem, |o| o.write.as_ref())?.clone();
        self.transfer4(op.instr(mem.logical(addr), value))?;
        std::thread::sleep(Duration::from_millis(10));
        if mem.is_eeprom() {
            self.eeprom_cache
                .invalidate_range(mem.page_size.max(1), addr, 1);
        }
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
        page_size: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<usize> {
        mem.check_range(addr, data.len() as u32)?;
        if mem.is_flash() {
            let step = page_size.max(1) as usize;
            let mut pos = 0usize;
            while pos < data.len() {
                let end = (pos + step).min(data.len());
                let chunk = crate::utils::padded(&data[pos..end], step, 0xff);
                self.write_flash_page(mem, addr + pos as u32, &chunk)?;
                pos = end;
            }
            self.flash_cache
                .invalidate_range(page_size, addr, data.len() as u32);
            return Ok(data.len());
        }
        for (i, v) in data.iter().enumerate() {
            self.write_byte(part, mem, addr + i as u32, *v)?;
        }
        Ok(data.len())
    }

    fn set_sck_period(&mut self, period_s: f64) -> Result<()> {
        self.speed_hz = (1.0 / period_s).max(1_000.0).min(8_000_000.0) as u32;
        if let Some(spi) = self.spi.as_mut() {
            let mut options = SpidevOptions::new();
            options.max_speed_hz(self.speed_hz);
            spi.configure(&options)?;
        }
        Ok(())
    }

    fn get_sck_period(&self) -> Result<f64> {
        Ok(1.0 / f64::from(self.speed_hz))
    }
}
