//! FLIP v2: the DFU-based factory bootloader of the USB-equipped parts.
//!
//! Standard USB DFU 1.1 requests carry a six-byte command header that
//! selects memory units and 64 KiB pages and starts reads, writes, erases
//! and application start. Writes obey a padding rule of their own: the
//! first USB packet holds only the command header, and the data begins at
//! packet offset `bMaxPacketSize0 + (offset mod bMaxPacketSize0)`.

use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::part::{Memory, Part, ProgModes};
use crate::programmer::Programmer;
use crate::{Error, Result};

// DFU 1.1 request codes.
pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_UPLOAD: u8 = 0x02;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;

// (bStatus << 8 | bState) pairs.
pub const STATUS_OK: u16 = 0x0000;
pub const STATUS_STALL: u16 = 0x0f0a;
pub const STATUS_MEM_UNKNOWN: u16 = 0x030a;
pub const STATUS_MEM_PROTECTED: u16 = 0x0300;
pub const STATUS_OUTOFRANGE: u16 = 0x080a;
pub const STATUS_BLANK_FAIL: u16 = 0x0500;
pub const STATUS_ERASE_ONGOING: u16 = 0x0904;

// Command groups.
const GRP_DOWNLOAD: u8 = 0x01;
const GRP_UPLOAD: u8 = 0x03;
const GRP_EXEC: u8 = 0x04;
const GRP_SELECT: u8 = 0x06;

// Commands within their groups.
const CMD_PROG_START: u8 = 0x00;
const CMD_READ_MEMORY: u8 = 0x00;
const CMD_CHIP_ERASE: u8 = 0x00;
const CMD_START_APP: u8 = 0x03;
const CMD_SELECT_MEMORY: u8 = 0x03;

// Memory units.
pub const UNIT_FLASH: u8 = 0x00;
pub const UNIT_EEPROM: u8 = 0x01;
pub const UNIT_SECURITY: u8 = 0x02;
pub const UNIT_CONFIGURATION: u8 = 0x03;
pub const UNIT_BOOTLOADER: u8 = 0x04;
pub const UNIT_SIGNATURE: u8 = 0x05;
pub const UNIT_USER: u8 = 0x06;
pub const UNIT_INT_RAM: u8 = 0x07;
pub const UNIT_EXT_MEM_CS0: u8 = 0x08;
pub const UNIT_EXT_MEM_DF: u8 = 0x10;

const READ_CHUNK: usize = 1024;
const WRITE_CHUNK: usize = 2048;

const USB_VID_ATMEL: u16 = 0x03eb;

/// Decoded GETSTATUS reply.
#[derive(Debug, Clone, Copy)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: u32,
    pub state: u8,
    pub string_index: u8,
}

impl DfuStatus {
    /// The 16-bit pair the FLIP taxonomy is keyed on.
    pub fn pair(&self) -> u16 {
        (u16::from(self.status) << 8) | u16::from(self.state)
    }
}

fn status_error(pair: u16) -> Error {
    match pair {
        STATUS_MEM_PROTECTED => Error::ChipLocked,
        STATUS_MEM_UNKNOWN => Error::UnsupportedMemory("memory unit".into()),
        STATUS_OUTOFRANGE => Error::Protocol("FLIP: address out of range".into()),
        STATUS_BLANK_FAIL => Error::Protocol("FLIP: blank check failed".into()),
        STATUS_STALL => Error::Protocol("FLIP: request stalled".into()),
        other => Error::Protocol(format!("FLIP: status pair 0x{:04x}", other)),
    }
}

/// The DFU control-endpoint surface, separated out so the engine can be
/// exercised without hardware.
pub trait DfuLink: std::fmt::Debug {
    fn dnload(&mut self, data: &[u8]) -> Result<()>;
    fn upload(&mut self, len: usize) -> Result<Vec<u8>>;
    fn get_status(&mut self) -> Result<DfuStatus>;
    fn clr_status(&mut self) -> Result<()>;
    fn max_packet_size0(&self) -> u16;
}

pub struct UsbDfu {
    handle: DeviceHandle<GlobalContext>,
    interface: u16,
    max_ps0: u16,
    timeout: Duration,
}

impl std::fmt::Debug for UsbDfu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UsbDfu(bMaxPacketSize0={})", self.max_ps0)
    }
}

impl UsbDfu {
    pub fn open(pid: u16, serial: Option<&str>) -> Result<UsbDfu> {
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != USB_VID_ATMEL || desc.product_id() != pid {
                continue;
            }
            let mut handle = device.open()?;
            if let Some(wanted) = serial {
                let got = handle
                    .read_serial_number_string_ascii(&desc)
                    .unwrap_or_default();
                if got != wanted {
                    continue;
                }
            }
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(0)?;
            return Ok(UsbDfu {
                handle,
                interface: 0,
                max_ps0: u16::from(desc.max_packet_size()),
                timeout: Duration::from_secs(5),
            });
        }
        Err(Error::Config(format!(
            "no DFU device {:04x}:{:04x} found",
            USB_VID_ATMEL, pid
        )))
    }
}

// bmRequestType: class request to the interface.
const REQ_OUT: u8 = 0x21;
const REQ_IN: u8 = 0xa1;

impl DfuLink for UsbDfu {
    fn dnload(&mut self, data: &[u8]) -> Result<()> {
        self.handle
            .write_control(REQ_OUT, DFU_DNLOAD, 0, self.interface, data, self.timeout)?;
        Ok(())
    }

    fn upload(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self
            .handle
            .read_control(REQ_IN, DFU_UPLOAD, 0, self.interface, &mut buf, self.timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn get_status(&mut self) -> Result<DfuStatus> {
        let mut buf = [0u8; 6];
        let n = self.handle.read_control(
            REQ_IN,
            DFU_GETSTATUS,
            0,
            self.interface,
            &mut buf,
            self.timeout,
        )?;
        if n < 6 {
            return Err(Error::ShortReply {
                expected: 6,
                got: n,
            });
        }
        Ok(DfuStatus {
            status: buf[0],
            poll_timeout: u32::from(buf[1]) | u32::from(buf[2]) << 8 | u32::from(buf[3]) << 16,
            state: buf[4],
            string_index: buf[5],
        })
    }

    fn clr_status(&mut self) -> Result<()> {
        self.handle
            .write_control(REQ_OUT, DFU_CLRSTATUS, 0, self.interface, &[], self.timeout)?;
        Ok(())
    }

    fn max_packet_size0(&self) -> u16 {
        self.max_ps0
    }
}

/// One six-byte FLIP command.
#[derive(Debug, Clone, Copy)]
struct Flip2Cmd {
    group_id: u8,
    cmd_id: u8,
    args: [u8; 4],
}

impl Flip2Cmd {
    fn bytes(&self) -> [u8; 6] {
        [
            self.group_id,
            self.cmd_id,
            self.args[0],
            self.args[1],
            self.args[2],
            self.args[3],
        ]
    }
}

fn unit_for(mem: &Memory) -> Result<u8> {
    let unit = if mem.is_flash() {
        UNIT_FLASH
    } else if mem.is_eeprom() {
        UNIT_EEPROM
    } else if mem.is_signature() {
        UNIT_SIGNATURE
    } else if mem.is_user_row() {
        UNIT_USER
    } else if mem.is_lock() {
        UNIT_SECURITY
    } else if mem.is_fuse() {
        UNIT_CONFIGURATION
    } else {
        match mem.name {
            "bootloader" => UNIT_BOOTLOADER,
            "sram" => UNIT_INT_RAM,
            _ => return Err(Error::UnsupportedMemory(mem.name.to_string())),
        }
    };
    Ok(unit)
}

pub struct Flip2 {
    dfu: Option<Box<dyn DfuLink>>,
    serial: Option<String>,
    unit: Option<u8>,
    page: Option<u16>,
    sig: Option<[u8; 3]>,
    boot_version: Option<[u8; 2]>,
}

impl std::fmt::Debug for Flip2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flip2(unit={:?}, page={:?})", self.unit, self.page)
    }
}

impl Flip2 {
    pub fn new() -> Flip2 {
        Flip2 {
            dfu: None,
            serial: None,
            unit: None,
            page: None,
            sig: None,
            boot_version: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_link(link: Box<dyn DfuLink>) -> Flip2 {
        let mut f = Flip2::new();
        f.dfu = Some(link);
        f
    }

    fn dfu(&mut self) -> Result<&mut Box<dyn DfuLink>> {
        self.dfu
            .as_mut()
            .ok_or(Error::Protocol("FLIP device not open".into()))
    }

    fn check_status(&mut self) -> Result<()> {
        let status = self.dfu()?.get_status()?;
        let pair = status.pair();
        if pair != STATUS_OK {
            let _ = self.dfu()?.clr_status();
            return Err(status_error(pair));
        }
        Ok(())
    }

    fn run_cmd(&mut self, cmd: Flip2Cmd) -> Result<()> {
        self.dfu()?.dnload(&cmd.bytes())?;
        self.check_status()
    }

    fn select_unit(&mut self, unit: u8) -> Result<()> {
        if self.unit == Some(unit) {
            return Ok(());
        }
        self.run_cmd(Flip2Cmd {
            group_id: GRP_SELECT,
            cmd_id: CMD_SELECT_MEMORY,
            args: [0x00, unit, 0x00, 0x00],
        })?;
        self.unit = Some(unit);
        // A unit switch invalidates the page selection.
        self.page = None;
        Ok(())
    }

    fn select_page(&mut self, page: u16) -> Result<()> {
        if self.page == Some(page) {
            return Ok(());
        }
        self.run_cmd(Flip2Cmd {
            group_id: GRP_SELECT,
            cmd_id: CMD_SELECT_MEMORY,
            args: [0x01, (page >> 8) as u8, page as u8, 0x00],
        })?;
        self.page = Some(page);
        Ok(())
    }

    /// Splits `[addr, addr+len)` so no piece crosses a 64 KiB page.
    fn pieces(addr: u32, len: usize, max: usize) -> Vec<(u32, usize)> {
        let mut out = Vec::new();
        let mut pos = addr;
        let mut remaining = len;
        while remaining > 0 {
            let to_page_end = 0x1_0000 - (pos as usize & 0xffff);
            let n = remaining.min(max).min(to_page_end);
            out.push((pos, n));
            pos += n as u32;
            remaining -= n;
        }
        out
    }

    fn read_memory(&mut self, unit: u8, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.select_unit(unit)?;
        let mut filled = 0usize;
        for (pos, n) in Self::pieces(addr, buf.len(), READ_CHUNK) {
            self.select_page((pos >> 16) as u16)?;
            let off = pos as u16;
            let end = off + (n as u16 - 1);
            self.dfu()?.dnload(
                &Flip2Cmd {
                    group_id: GRP_UPLOAD,
                    cmd_id: CMD_READ_MEMORY,
                    args: [(off >> 8) as u8, off as u8, (end >> 8) as u8, end as u8],
                }
                .bytes(),
            )?;
            let data = self.dfu()?.upload(n)?;
            if data.len() < n {
                return Err(Error::ShortReply {
                    expected: n,
                    got: data.len(),
                });
            }
            buf[filled..filled + n].copy_from_slice(&data[..n]);
            filled += n;
        }
        Ok(())
    }

    /// Writes one piece that already fits a single 64 KiB page.
    ///
    /// The padding rule: the first USB packet carries only the six
    /// command bytes, zero-filled to `bMaxPacketSize0`; the data starts
    /// at offset `bMaxPacketSize0 + (offset mod bMaxPacketSize0)` of the
    /// transfer, every padding byte zero.
    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.len() > WRITE_CHUNK {
            return Err(Error::Config(format!(
                "erite block too large ({} > {})",
                data.len(),
                WRITE_CHUNK
            )));
        }
        self.select_page((addr >> 16) as u16)?;
        let off = addr as u16;
        let end = off + (data.len() as u16 - 1);
        let ps0 = self.dfu()?.max_packet_size0() as usize;

        let data_start = ps0 + (off as usize % ps0);
        let mut buf = vec![0u8; data_start + data.len()];
        buf[..6].copy_from_slice(
            &Flip2Cmd {
                group_id: GRP_DOWNLOAD,
                cmd_id: CMD_PROG_START,
                args: [(off >> 8) as u8, off as u8, (end >> 8) as u8, end as u8],
            }
            .bytes(),
        );
        buf[data_start..].copy_from_slice(data);
        self.dfu()?.dnload(&buf)?;
        self.check_status()
    }

    fn write_memory(&mut self, unit: u8, addr: u32, data: &[u8]) -> Result<()> {
        self.select_unit(unit)?;
        let mut written = 0usize;
        for (pos, n) in Self::pieces(addr, data.len(), WRITE_CHUNK) {
            self.write_block(pos, &data[written..written + n])?;
            written += n;
        }
        Ok(())
    }

    fn chip_erase_inner(&mut self) -> Result<()> {
        self.dfu()?.dnload(
            &Flip2Cmd {
                group_id: GRP_EXEC,
                cmd_id: CMD_CHIP_ERASE,
                args: [0xff, 0x00, 0x00, 0x00],
            }
            .bytes(),
        )?;
        loop {
            let status = self.dfu()?.get_status()?;
            match status.pair() {
                STATUS_OK => return Ok(()),
                STATUS_ERASE_ONGOING => continue,
                pair => {
                    let _ = self.dfu()?.clr_status();
                    return Err(status_error(pair));
                }
            }
        }
    }

    /// The first download enqueues the jump, the second triggers it.
    fn start_app(&mut self) -> Result<()> {
        let cmd = Flip2Cmd {
            group_id: GRP_EXEC,
            cmd_id: CMD_START_APP,
            args: [0x00, 0x00, 0x00, 0x00],
        };
        self.dfu()?.dnload(&cmd.bytes())?;
        self.dfu()?.dnload(&cmd.bytes())?;
        Ok(())
    }
}

impl Default for Flip2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Programmer for Flip2 {
    fn id(&self) -> &'static str {
        "flip2"
    }

    fn prog_modes(&self) -> ProgModes {
        ProgModes::PDI
    }

    fn open(&mut self, port: &str) -> Result<()> {
        // The PID comes from the part record, so the device is opened in
        // initialize(); remember the requested serial for then.
        self.serial = port
            .strip_prefix("usb:")
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(())
    }

    fn close(&mut self) {
        if self.dfu.is_some() {
            let _ = self.start_app();
        }
        self.dfu = None;
        self.unit = None;
        self.page = None;
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        if self.dfu.is_none() {
            let pid = part.usbpid.ok_or_else(|| {
                Error::Config(format!("part {} has no DFU bootloader PID", part.name))
            })?;
            let link = UsbDfu::open(pid, self.serial.as_deref())?;
            self.dfu = Some(Box::new(link));
        }
        let mut sig = [0u8; 3];
        self.read_memory(UNIT_SIGNATURE, 0, &mut sig)?;
        self.sig = Some(sig);
        let mut ver = [0u8; 2];
        if self.read_memory(UNIT_BOOTLOADER, 0, &mut ver).is_ok() {
            self.boot_version = Some(ver);
        }
        Ok(())
    }

    fn display(&self, prefix: &str) {
        println!("{}Programmer type : {}", prefix, self.id());
        if let Some(v) = self.boot_version {
            println!("{}Bootloader      : FLIP v{}.{}", prefix, v[0], v[1]);
        }
        if let Some(sig) = self.sig {
            println!(
                "{}Device signature: {:02x} {:02x} {:02x}",
                prefix, sig[0], sig[1], sig[2]
            );
        }
    }

    fn program_enable(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    fn chip_erase(&mut self, _part: &Part) -> Result<()> {
        self.chip_erase_inner()
    }

    fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        mem.check_range(addr, 1)?;
        if mem.is_signature() {
            if let Some(sig) = self.sig {
                return Ok(sig[addr as usize % 3]);
            }
        }
        let unit = unit_for(mem)?;
        let mut buf = [0u8; 1];
        self.read_memory(unit, mem.logical(addr), &mut buf)?;
        Ok(buf[0])
    }

    fn write_byte(&mut self, _part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        mem.check_range(addr, 1)?;
        if mem.is_readonly() {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        let unit = unit_for(mem)?;
        self.write_memory(unit, mem.logical(addr), &[value])
    }

    fn paged_load(
        &mut self,
        _part: &Part,
        mem: &Memory,
        _page_size: u32,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        mem.check_range(addr, buf.len() as u32)?;
        let unit = unit_for(mem)?;
        self.read_memory(unit, mem.logical(addr), buf)?;
        Ok(buf.len())
    }

    fn paged_write(
        &mut self,
        _part: &Part,
        mem: &Memory,
        _page_size: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<usize> {
        mem.check_range(addr, data.len() as u32)?;
        if mem.is_readonly() {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        let unit = unit_for(mem)?;
        self.write_memory(unit, mem.logical(addr), data)?;
        Ok(data.len())
    }

    fn read_sig_bytes(&mut self, _part: &Part, _mem: &Memory) -> Result<[u8; 3]> {
        if let Some(sig) = self.sig {
            return Ok(sig);
        }
        let mut sig = [0u8; 3];
        self.read_memory(UNIT_SIGNATURE, 0, &mut sig)?;
        self.sig = Some(sig);
        Ok(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct MockDfuState {
        dnloads: Vec<Vec<u8>>,
        uploads: VecDeque<Vec<u8>>,
        statuses: VecDeque<DfuStatus>,
        clears: u32,
    }

    #[derive(Debug)]
    struct MockDfu {
        state: Rc<RefCell<MockDfuState>>,
        ps0: u16,
    }

    fn ok_status() -> DfuStatus {
        DfuStatus {
            status: 0,
            poll_timeout: 0,
            state: 0,
            string_index: 0,
        }
    }

    fn pair_status(pair: u16) -> DfuStatus {
        DfuStatus {
            status: (pair >> 8) as u8,
            poll_timeout: 0,
            state: pair as u8,
            string_index: 0,
        }
    }

    impl DfuLink for MockDfu {
        fn dnload(&mut self, data: &[u8]) -> Result<()> {
            self.state.borrow_mut().dnloads.push(data.to_vec());
            Ok(())
        }

        fn upload(&mut self, len: usize) -> Result<Vec<u8>> {
            let mut s = self.state.borrow_mut();
            Ok(s.uploads.pop_front().unwrap_or_else(|| vec![0xff; len]))
        }

        fn get_status(&mut self) -> Result<DfuStatus> {
            let mut s = self.state.borrow_mut();
            Ok(s.statuses.pop_front().unwrap_or_else(ok_status))
        }

        fn clr_status(&mut self) -> Result<()> {
            self.state.borrow_mut().clears += 1;
            Ok(())
        }

        fn max_packet_size0(&self) -> u16 {
            self.ps0
        }
    }

    fn rig(ps0: u16) -> (Flip2, Rc<RefCell<MockDfuState>>) {
        let state = Rc::new(RefCell::new(MockDfuState::default()));
        let link = MockDfu {
            state: Rc::clone(&state),
            ps0,
        };
        (Flip2::with_link(Box::new(link)), state)
    }

    #[test]
    fn write_padding_puts_data_at_ps0_plus_offset_mod_ps0() {
        let (mut flip, state) = rig(64);
        flip.unit = Some(UNIT_FLASH);
        flip.page = Some(0);
        flip.write_block(0x1234, &[0xaa, 0xbb]).unwrap();

        let s = state.borrow();
        let buf = s.dnloads.last().unwrap();
        // 64 + (0x1234 % 64) = 64 + 0x34 = 116.
        assert_eq!(buf.len(), 116 + 2);
        assert_eq!(buf[0], GRP_DOWNLOAD);
        assert_eq!(buf[1], CMD_PROG_START);
        assert_eq!(&buf[2..6], &[0x12, 0x34, 0x12, 0x35]);
        assert!(buf[6..116].iter().all(|&b| b == 0));
        assert_eq!(&buf[116..], &[0xaa, 0xbb]);
    }

    #[test]
    fn oversized_write_block_keeps_the_historical_message() {
        let (mut flip, _) = rig(64);
        flip.unit = Some(UNIT_FLASH);
        flip.page = Some(0);
        let err = flip.write_block(0, &vec![0u8; WRITE_CHUNK + 1]).unwrap_err();
        assert!(format!("{}", err).contains("erite block too large"));
    }

    #[test]
    fn chunks_reselect_page_at_64k_boundary() {
        let (mut flip, state) = rig(64);
        // 4 KiB write straddling the 64 KiB line.
        let data = vec![0x55u8; 4096];
        flip.write_memory(UNIT_FLASH, 0x0001_0000 - 2048, &data).unwrap();

        let s = state.borrow();
        // Two SELECT unit/page downloads plus two data downloads at least;
        // find the page selects.
        let selects: Vec<&Vec<u8>> = s
            .dnloads
            .iter()
            .filter(|d| d.len() == 6 && d[0] == GRP_SELECT && d[2] == 0x01)
            .collect();
        assert_eq!(selects.len(), 2);
        assert_eq!(&selects[0][3..5], &[0x00, 0x00]);
        assert_eq!(&selects[1][3..5], &[0x00, 0x01]);
    }

    #[test]
    fn chip_erase_polls_through_erase_ongoing() {
        let (mut flip, state) = rig(64);
        {
            let mut s = state.borrow_mut();
            s.statuses.push_back(pair_status(STATUS_ERASE_ONGOING));
            s.statuses.push_back(pair_status(STATUS_ERASE_ONGOING));
            s.statuses.push_back(ok_status());
        }
        flip.chip_erase_inner().unwrap();
        let s = state.borrow();
        assert_eq!(s.dnloads.len(), 1);
        assert_eq!(s.dnloads[0][..2], [GRP_EXEC, CMD_CHIP_ERASE]);
    }

    #[test]
    fn chip_erase_fatal_status_clears_and_fails() {
        let (mut flip, state) = rig(64);
        state
            .borrow_mut()
            .statuses
            .push_back(pair_status(STATUS_MEM_PROTECTED));
        let err = flip.chip_erase_inner().unwrap_err();
        assert!(err.is_chip_locked());
        assert_eq!(state.borrow().clears, 1);
    }

    #[test]
    fn start_app_downloads_the_command_twice() {
        let (mut flip, state) = rig(64);
        flip.start_app().unwrap();
        let s = state.borrow();
        assert_eq!(s.dnloads.len(), 2);
        assert_eq!(s.dnloads[0], s.dnloads[1]);
        assert_eq!(s.dnloads[0][..2], [GRP_EXEC, CMD_START_APP]);
    }

    #[test]
    fn unit_selection_is_cached_until_it_changes() {
        let (mut flip, state) = rig(64);
        flip.select_unit(UNIT_FLASH).unwrap();
        flip.select_unit(UNIT_FLASH).unwrap();
        flip.select_unit(UNIT_EEPROM).unwrap();
        let s = state.borrow();
        assert_eq!(s.dnloads.len(), 2);
        assert_eq!(s.dnloads[0][2..4], [0x00, UNIT_FLASH]);
        assert_eq!(s.dnloads[1][2..4], [0x00, UNIT_EEPROM]);
    }
}
