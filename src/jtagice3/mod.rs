//! The JTAGICE3 engine.
//!
//! One command vocabulary drives JTAG, PDI, UPDI, debugWIRE and TPI
//! targets. Frames are sequence-numbered; CMSIS-DAP class dongles
//! (Atmel-ICE, EDBG kits, PICkit4, SNAP) additionally wrap every frame in
//! the EDBG vendor fragmentation of [`edbg`].

pub mod constants;
pub mod descriptor;
pub mod edbg;
pub mod tpi;

use crate::cache::PageCache;
use crate::part::{Memory, Part, ProgModes};
use crate::programmer::{ExtraFeatures, Programmer};
use crate::transport::{hid::HidTransport, usb::UsbTransport, Transport, LONG_TIMEOUT};
use crate::utils::{page_base, padded, u16_from_le, HexSlice};
use crate::{Error, Result};

use constants::*;

/// Wire connection between the dongle and the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conn {
    Jtag,
    Pdi,
    Updi,
    DebugWire,
    Tpi,
    Isp,
}

impl Conn {
    fn parm3_connection(self) -> u8 {
        match self {
            Conn::Jtag => PARM3_CONN_JTAG,
            Conn::Pdi => PARM3_CONN_PDI,
            Conn::Updi => PARM3_CONN_UPDI,
            Conn::DebugWire => PARM3_CONN_DW,
            Conn::Tpi => PARM3_CONN_JTAG,
            Conn::Isp => PARM3_CONN_ISP,
        }
    }

    fn parm3_arch(self, part: &Part) -> u8 {
        match self {
            Conn::Updi => PARM3_ARCH_UPDI,
            Conn::Pdi => PARM3_ARCH_XMEGA,
            Conn::DebugWire => PARM3_ARCH_TINY,
            Conn::Jtag if part.is_xmega() => PARM3_ARCH_XMEGA,
            _ => PARM3_ARCH_MEGA,
        }
    }

    fn prog_modes(self) -> ProgModes {
        match self {
            Conn::Jtag => ProgModes::JTAG | ProgModes::JTAG_XMEGA,
            Conn::Pdi => ProgModes::PDI,
            Conn::Updi => ProgModes::UPDI,
            Conn::DebugWire => ProgModes::DEBUGWIRE,
            Conn::Tpi => ProgModes::TPI,
            Conn::Isp => ProgModes::ISP,
        }
    }
}

/// How many non-matching frames the receive loop will skip per command.
const MAX_SKIPPED_FRAMES: u32 = 16;

pub struct Jtag3 {
    id: &'static str,
    conn: Conn,
    edbg: bool,
    pic_family: bool,
    tr: Option<Box<dyn Transport>>,
    seq: u16,
    flash_cache: PageCache,
    eeprom_cache: PageCache,
    boot_start: u32,
    sig_cache: Option<[u8; 3]>,
    sib: Option<Vec<u8>>,
    sck_period: Option<f64>,
    hvupdi: bool,
    mode_switch: bool,
    in_progmode: bool,
    /// (hardware, firmware major, firmware minor), read at sign-on.
    version: Option<(u8, u16, u16)>,
    /// TPI word-write replication, copied from the part at initialise.
    pub(crate) n_word_writes: u8,
}

impl std::fmt::Debug for Jtag3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Jtag3({}, conn={:?}, edbg={})", self.id, self.conn, self.edbg)
    }
}

impl Jtag3 {
    fn with_conn(id: &'static str, conn: Conn) -> Jtag3 {
        Jtag3 {
            id,
            conn,
            edbg: false,
            pic_family: false,
            tr: None,
            seq: 0,
            flash_cache: PageCache::new(),
            eeprom_cache: PageCache::new(),
            boot_start: 0,
            sig_cache: None,
            sib: None,
            sck_period: None,
            hvupdi: false,
            mode_switch: false,
            in_progmode: false,
            version: None,
            n_word_writes: 1,
        }
    }

    pub fn jtag() -> Jtag3 {
        Jtag3::with_conn("jtagice3", Conn::Jtag)
    }

    pub fn pdi() -> Jtag3 {
        Jtag3::with_conn("jtagice3_pdi", Conn::Pdi)
    }

    pub fn updi() -> Jtag3 {
        Jtag3::with_conn("jtagice3_updi", Conn::Updi)
    }

    pub fn debugwire() -> Jtag3 {
        Jtag3::with_conn("jtagice3_dw", Conn::DebugWire)
    }

    pub fn isp() -> Jtag3 {
        Jtag3::with_conn("jtagice3_isp", Conn::Isp)
    }

    pub fn tpi() -> Jtag3 {
        Jtag3::with_conn("jtagice3_tpi", Conn::Tpi)
    }

    /// Switches the engine onto the EDBG/CMSIS-DAP framing.
    pub fn over_edbg(mut self) -> Jtag3 {
        self.edbg = true;
        self
    }

    /// Marks the dongle as a PIC-family kit that may need a mode switch.
    pub fn pic_family(mut self) -> Jtag3 {
        self.pic_family = true;
        self
    }

    #[cfg(test)]
    pub(crate) fn set_transport(&mut self, tr: Box<dyn Transport>) {
        self.tr = Some(tr);
    }

    fn tr(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.tr
            .as_mut()
            .ok_or(Error::Protocol("programmer not open".into()))
    }

    /// Next command sequence number; 0xFFFF belongs to event frames and
    /// is skipped.
    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == EVENT_SEQ {
            self.seq = 0;
        }
        self.seq
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let edbg = self.edbg;
        let tr = self.tr()?;
        if edbg {
            edbg::send_frame(tr.as_mut(), raw)
        } else {
            tr.send(raw)
        }
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        let edbg = self.edbg;
        let tr = self.tr()?;
        if edbg {
            edbg::recv_frame(tr.as_mut())
        } else {
            // Bulk frames span transfers until a short one ends them.
            let max = tr.max_transfer().max(64);
            let mut frame = Vec::new();
            loop {
                let mut chunk = vec![0u8; max];
                let n = tr.recv(&mut chunk)?;
                frame.extend_from_slice(&chunk[..n]);
                if n < max {
                    return Ok(frame);
                }
            }
        }
    }

    /// One raw request/response round-trip without status interpretation.
    /// Event frames (sequence 0xFFFF) and stale responses are logged and
    /// discarded.
    pub(crate) fn transact(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let seq = self.next_seq();
        let mut frame = vec![TOKEN, 0x00, seq as u8, (seq >> 8) as u8];
        frame.extend_from_slice(payload);
        log::trace!("jtag3 send seq {}: {:?}", seq, HexSlice(payload));
        self.send_raw(&frame)?;

        for _ in 0..MAX_SKIPPED_FRAMES {
            let resp = self.recv_raw()?;
            if resp.len() < 5 || resp[0] != TOKEN {
                return Err(Error::Framing(format!(
                    "malformed response frame {:?}",
                    HexSlice(&resp)
                )));
            }
            let rseq = u16_from_le(&resp[1..3]);
            if rseq == EVENT_SEQ {
                log::debug!("event frame: {:?}", HexSlice(&resp[3..]));
                continue;
            }
            if rseq != seq {
                log::debug!("discarding frame with sequence {} (want {})", rseq, seq);
                continue;
            }
            let body = resp[3..].to_vec();
            log::trace!("jtag3 recv seq {}: {:?}", rseq, HexSlice(&body));
            return Ok(body);
        }
        Err(Error::Protocol("no matching response frame".into()))
    }

    /// A round-trip with the usual RSP3 status discipline applied.
    pub(crate) fn command(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let body = self.transact(payload)?;
        self.check_status(payload, body)
    }

    fn check_status(&self, cmd: &[u8], body: Vec<u8>) -> Result<Vec<u8>> {
        if body.len() < 2 {
            return Err(Error::ShortReply {
                expected: 2,
                got: body.len(),
            });
        }
        match body[1] {
            RSP3_OK | RSP3_INFO | RSP3_PC | RSP3_DATA => Ok(body),
            RSP3_FAILED => {
                let code = body.get(2).copied().unwrap_or(0xff);
                Err(failure_error("jtagice3", cmd[1], code))
            }
            other => Err(Error::Protocol(format!(
                "unexpected response status 0x{:02x}",
                other
            ))),
        }
    }

    fn set_parameter(&mut self, scope: u8, section: u8, addr: u8, data: &[u8]) -> Result<()> {
        let mut payload = vec![scope, CMD3_SET_PARAMETER, 0x00, section, addr, data.len() as u8];
        payload.extend_from_slice(data);
        self.command(&payload).map(|_| ())
    }

    fn get_parameter(&mut self, scope: u8, section: u8, addr: u8, len: u8) -> Result<Vec<u8>> {
        let body = self.command(&[scope, CMD3_GET_PARAMETER, 0x00, section, addr, len])?;
        Self::data_bytes(&body, len as usize)
    }

    /// Data responses carry one pad byte between the status and the data.
    fn data_bytes(body: &[u8], len: usize) -> Result<Vec<u8>> {
        if body.len() < 3 + len {
            return Err(Error::ShortReply {
                expected: 3 + len,
                got: body.len(),
            });
        }
        Ok(body[3..3 + len].to_vec())
    }

    fn sign_on_general(&mut self) -> Result<()> {
        self.command(&[SCOPE_GENERAL, CMD3_SIGN_ON, 0x00])?;
        let hw = self.get_parameter(SCOPE_GENERAL, 0x00, PARM3_HW_VER, 1)?;
        let fw_major = self.get_parameter(SCOPE_GENERAL, 0x00, PARM3_FW_MAJOR, 2)?;
        let fw_minor = self.get_parameter(SCOPE_GENERAL, 0x00, PARM3_FW_MINOR, 2)?;
        self.version = Some((hw[0], u16_from_le(&fw_major), u16_from_le(&fw_minor)));
        Ok(())
    }

    /// AVR-scope sign-on. If nothing answers, one retry goes out with the
    /// apply-external-reset flag; a second failure is fatal.
    fn sign_on_avr(&mut self) -> Result<()> {
        for apply_reset in &[0u8, 1u8] {
            match self.command(&[SCOPE_AVR, CMD3_SIGN_ON, 0x00, *apply_reset]) {
                Ok(body) => {
                    if body[1] == RSP3_DATA && body.len() > 3 {
                        // UPDI targets answer with a SIB prefix.
                        self.sib = Some(body[3..].to_vec());
                    }
                    return Ok(());
                }
                Err(e) => {
                    if *apply_reset == 1 {
                        return Err(e);
                    }
                    log::warn!("sign-on got no answer ({}); retrying with external reset", e);
                }
            }
        }
        unreachable!()
    }

    fn mtype(&self, part: &Part, mem: &Memory, logical: u32) -> u8 {
        if mem.is_flash() {
            if part.is_xmega() {
                if logical >= self.boot_start {
                    return MTYPE_BOOT_FLASH;
                }
                return MTYPE_APPL_FLASH;
            }
            return MTYPE_FLASH_PAGE;
        }
        match mem.name {
            "eeprom" => {
                if self.conn == Conn::DebugWire {
                    MTYPE_EEPROM
                } else {
                    MTYPE_EEPROM_PAGE
                }
            }
            "lock" => MTYPE_LOCK_BITS,
            "signature" => MTYPE_SIGN_JTAG,
            "calibration" => MTYPE_OSCCAL_BYTE,
            "usersig" | "userrow" | "bootrow" => MTYPE_USERSIG,
            "sigrow" | "prodsig" | "tempsense" => MTYPE_PRODSIG,
            "sram" | "io" => MTYPE_SRAM,
            "sib" => MTYPE_SIB,
            _ if mem.is_fuse() => MTYPE_FUSE_BITS,
            _ => MTYPE_SRAM,
        }
    }

    fn read_memory(&mut self, mtype: u8, addr: u32, len: u32) -> Result<Vec<u8>> {
        let mut payload = vec![SCOPE_AVR, CMD3_READ_MEMORY, 0x00, mtype];
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(&len.to_le_bytes());
        let body = self.command(&payload)?;
        Self::data_bytes(&body, len as usize)
    }

    fn write_memory(&mut self, mtype: u8, addr: u32, data: &[u8]) -> Result<()> {
        let mut payload = vec![SCOPE_AVR, CMD3_WRITE_MEMORY, 0x00, mtype];
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.push(0x00);
        payload.extend_from_slice(data);
        self.command(&payload).map(|_| ())
    }

    fn erase_memory(&mut self, kind: u8, addr: u32) -> Result<()> {
        let mut payload = vec![SCOPE_AVR, CMD3_ERASE_MEMORY, 0x00, kind];
        payload.extend_from_slice(&addr.to_le_bytes());
        let long = self.tr()?.set_timeout(LONG_TIMEOUT);
        let result = self.command(&payload).map(|_| ());
        if long.is_ok() {
            let _ = self
                .tr()?
                .set_timeout(crate::transport::DEFAULT_TIMEOUT);
        }
        result
    }

    fn enter_progmode(&mut self) -> Result<()> {
        if self.in_progmode {
            return Ok(());
        }
        self.command(&[SCOPE_AVR, CMD3_ENTER_PROGMODE, 0x00])?;
        self.in_progmode = true;
        Ok(())
    }

    fn leave_progmode(&mut self) -> Result<()> {
        if !self.in_progmode {
            return Ok(());
        }
        self.command(&[SCOPE_AVR, CMD3_LEAVE_PROGMODE, 0x00])?;
        self.in_progmode = false;
        Ok(())
    }

    /// Asks a PIC-family kit to switch its personality to AVR mode. The
    /// firmware re-enumerates afterwards, so the user must re-plug.
    fn request_mode_switch(&mut self) -> Result<()> {
        self.command(&[SCOPE_EDBG, 0x01, 0x00, 0x07])?;
        Err(Error::Config(
            "programmer switched to AVR mode; unplug, replug and retry".into(),
        ))
    }

    fn erase_kind_for(&self, part: &Part, mem: &Memory, logical: u32) -> Result<u8> {
        if mem.is_flash() {
            if part.is_xmega() || part.is_avr8x() {
                if logical >= self.boot_start && part.boot_start.is_some() {
                    return Ok(ERASE_BOOT_PAGE);
                }
                return Ok(ERASE_APP_PAGE);
            }
            return Err(Error::Unsupported("page_erase"));
        }
        if mem.is_eeprom() && (part.is_xmega() || part.is_avr8x()) {
            return Ok(ERASE_EEPROM_PAGE);
        }
        if mem.is_user_row() {
            return Ok(ERASE_USERSIG);
        }
        Err(Error::Unsupported("page_erase"))
    }
}

impl Programmer for Jtag3 {
    fn id(&self) -> &'static str {
        self.id
    }

    fn prog_modes(&self) -> ProgModes {
        self.conn.prog_modes()
    }

    fn extra_features(&self) -> ExtraFeatures {
        let mut f = ExtraFeatures::VTARG_READ;
        if self.pic_family {
            f |= ExtraFeatures::HVUPDI;
        }
        f
    }

    fn open(&mut self, port: &str) -> Result<()> {
        let serial = port.strip_prefix("usb:").filter(|s| !s.is_empty());
        if self.edbg {
            let mut pids = vec![
                USB_PID_ATMELICE,
                USB_PID_POWERDEBUGGER,
                USB_PID_EDBG,
                USB_PID_MEDBG,
                USB_PID_PICKIT4,
                USB_PID_SNAP,
            ];
            if self.pic_family {
                // Kits still in PIC mode enumerate under other PIDs; we
                // open them only to switch or to tell the user what to do.
                pids.push(USB_PID_PICKIT4_PIC_MODE);
                pids.push(USB_PID_SNAP_PIC_MODE);
            }
            let tr = HidTransport::open(USB_VID_ATMEL, &pids, serial)?;
            self.tr = Some(Box::new(tr));
        } else {
            let tr = UsbTransport::open(
                USB_VID_ATMEL,
                &[USB_PID_JTAGICE3],
                serial,
                USB_EP_OUT,
                USB_EP_IN,
                Some(USB_EP_EVENT),
            )?;
            self.tr = Some(Box::new(tr));
        }
        if self.edbg {
            let tr = self.tr()?;
            edbg::prepare(tr.as_mut())?;
        }
        match self.sign_on_general() {
            Ok(()) => Ok(()),
            Err(e) if self.pic_family && self.mode_switch => {
                log::warn!("sign-on failed ({}); attempting PIC-mode switch", e);
                self.request_mode_switch()
            }
            Err(e) if self.pic_family => Err(Error::Config(format!(
                "{} (kit may be in PIC mode; pass -x modeswitch to convert it)",
                e
            ))),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        if self.tr.is_some() {
            let _ = self.command(&[SCOPE_GENERAL, CMD3_SIGN_OFF, 0x00]);
        }
        self.tr = None;
        self.in_progmode = false;
        self.seq = 0;
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        if !part.prog_modes.intersects(self.conn.prog_modes()) {
            return Err(Error::NoCommonMode);
        }
        self.boot_start = part.boot_start.unwrap_or(u32::MAX);
        self.n_word_writes = part.n_word_writes;
        self.sig_cache = None;

        if self.conn == Conn::Tpi {
            return tpi::initialize(self, part);
        }

        if self.hvupdi && self.conn == Conn::Updi {
            if part.hvupdi_variant.is_none() {
                return Err(Error::Config(format!(
                    "{} does not support high-voltage UPDI",
                    part.name
                )));
            }
            log::info!("high-voltage UPDI enable pulse requested");
        }

        let arch = self.conn.parm3_arch(part);
        self.set_parameter(SCOPE_AVR, 0x00, PARM3_ARCH, &[arch])?;
        self.set_parameter(SCOPE_AVR, 0x00, PARM3_SESS_PURPOSE, &[PARM3_SESS_PROGRAMMING])?;
        self.set_parameter(
            SCOPE_AVR,
            0x01,
            PARM3_CONNECTION,
            &[self.conn.parm3_connection()],
        )?;
        if let Some(period) = self.sck_period {
            let khz = ((1.0 / period) / 1000.0) as u16;
            let parm = match (self.conn, part.is_xmega()) {
                (Conn::Jtag, true) => PARM3_CLK_JTAG_XMEGA,
                (Conn::Jtag, false) => PARM3_CLK_MEGA_PROG,
                _ => PARM3_CLK_PDI_UPDI,
            };
            self.set_parameter(SCOPE_AVR, 0x01, parm, &khz.to_le_bytes())?;
        }

        self.sign_on_avr()?;

        let desc = match self.conn.parm3_arch(part) {
            PARM3_ARCH_UPDI => descriptor::updi(part)?,
            PARM3_ARCH_XMEGA => descriptor::xmega(part),
            _ => descriptor::mega(part),
        };
        self.set_parameter(SCOPE_AVR, 0x02, PARM3_DEVICEDESC, &desc)?;

        self.enter_progmode()
    }

    fn display(&self, prefix: &str) {
        println!("{}Programmer type : {}", prefix, self.id);
        println!("{}Connection      : {:?}", prefix, self.conn);
        if let Some((hw, major, minor)) = self.version {
            println!("{}Hardware        : rev {}", prefix, hw);
            println!("{}Firmware        : {}.{}", prefix, major, minor);
        }
    }

    fn enable(&mut self, _part: &Part) -> Result<()> {
        self.enter_progmode()
    }

    fn disable(&mut self) -> Result<()> {
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
        if self.conn == Conn::Tpi {
            return tpi::leave_progmode(self);
        }
        self.leave_progmode()
    }

    fn program_enable(&mut self, _part: &Part) -> Result<()> {
        if self.conn == Conn::Tpi {
            return tpi::enter_progmode(self);
        }
        self.enter_progmode()
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        if self.conn == Conn::Tpi {
            return tpi::chip_erase(self, part);
        }
        if self.conn == Conn::DebugWire {
            return Err(Error::Unsupported("chip_erase on debugWIRE"));
        }
        self.erase_memory(ERASE_CHIP, 0)?;
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
        Ok(())
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        mem.check_range(addr, 1)?;
        if self.conn == Conn::Tpi {
            return tpi::read_byte(self, part, mem, addr);
        }
        if mem.is_signature() {
            let sig = self.read_sig_bytes(part, mem)?;
            return Ok(sig[addr as usize % 3]);
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
        if (mem.is_flash() || mem.is_eeprom()) && mem.is_paged() {
            let base = page_base(addr, mem.page_size);
            let logical = mem.logical(base);
            let mtype = self.mtype(part, mem, logical);
            let page = self.read_memory(mtype, logical, mem.page_size)?;
            let value = page[(addr - base) as usize];
            if mem.is_flash() {
                self.flash_cache.fill(base, &page);
            } else {
                self.eeprom_cache.fill(base, &page);
            }
            return Ok(value);
        }
        let logical = mem.logical(addr);
        let mtype = self.mtype(part, mem, logical);
        Ok(self.read_memory(mtype, logical, 1)?[0])
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        mem.check_range(addr, 1)?;
        if mem.is_readonly() {
            return Err(Error::WriteProtected(mem.name.to_string()));
        }
        if self.conn == Conn::Tpi {
            return tpi::write_byte(self, part, mem, addr, value);
        }
        let logical = mem.logical(addr);
        let mtype = self.mtype(part, mem, logical);
        if mem.is_flash() && mem.is_paged() {
            // Flash wants whole pages; read-modify-write the page.
            let base = page_base(addr, mem.page_size);
            let page_logical = mem.logical(base);
            let mut page = self.read_memory(mtype, page_logical, mem.page_size)?;
            page[(addr - base) as usize] = value;
            self.write_memory(mtype, page_logical, &page)?;
            self.flash_cache.invalidate_range(mem.page_size, addr, 1);
            return Ok(());
        }
        self.write_memory(mtype, logical, &[value])?;
        if mem.is_eeprom() {
            self.eeprom_cache.invalidate_range(mem.page_size, addr, 1);
        }
        Ok(())
    }

    fn paged_load(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: u32,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        mem.check_range(addr, buf.len() as u32)?;
        if self.conn == Conn::Tpi {
            return tpi::paged_load(self, part, mem, page_size, addr, buf);
        }
        let step = page_size.max(1) as usize;
        let mut pos = 0usize;
        while pos < buf.len() {
            let chunk = (buf.len() - pos).min(step);
            let logical = mem.logical(addr + pos as u32);
            let mtype = self.mtype(part, mem, logical);
            let data = self.read_memory(mtype, logical, chunk as u32)?;
            buf[pos..pos + chunk].copy_from_slice(&data);
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
        if self.conn == Conn::Tpi {
            return tpi::paged_write(self, part, mem, page_size, addr, data);
        }
        if mem.is_eeprom() && self.conn == Conn::DebugWire {
            // debugWIRE EEPROM has no paged write; go byte by byte.
            for (i, v) in data.iter().enumerate() {
                self.write_memory(MTYPE_EEPROM, mem.logical(addr + i as u32), &[*v])?;
            }
            self.eeprom_cache
                .invalidate_range(page_size, addr, data.len() as u32);
            return Ok(data.len());
        }
        let step = page_size.max(1) as usize;
        let mut pos = 0usize;
        while pos < data.len() {
            let end = (pos + step).min(data.len());
            let logical = mem.logical(addr + pos as u32);
            let mtype = self.mtype(part, mem, logical);
            if mem.is_flash() {
                // The dongle wants full pages; pad short tails with 0xFF.
                let chunk = padded(&data[pos..end], step, 0xff);
                self.write_memory(mtype, logical, &chunk)?;
            } else {
                self.write_memory(mtype, logical, &data[pos..end])?;
            }
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
        let logical = mem.logical(page_base(addr, mem.page_size.max(1)));
        let kind = self.erase_kind_for(part, mem, logical)?;
        self.erase_memory(kind, logical)?;
        if mem.is_flash() {
            self.flash_cache.invalidate_range(mem.page_size, addr, 1);
        } else if mem.is_eeprom() {
            self.eeprom_cache.invalidate_range(mem.page_size, addr, 1);
        }
        Ok(())
    }

    fn read_sig_bytes(&mut self, part: &Part, mem: &Memory) -> Result<[u8; 3]> {
        if let Some(sig) = self.sig_cache {
            return Ok(sig);
        }
        let sig = if self.conn == Conn::Tpi {
            let mut buf = [0u8; 3];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = tpi::read_byte(self, part, mem, i as u32)?;
            }
            buf
        } else {
            let data = self.read_memory(MTYPE_SIGN_JTAG, mem.offset, 3)?;
            [data[0], data[1], data[2]]
        };
        self.sig_cache = Some(sig);
        Ok(sig)
    }

    fn read_sib(&mut self, _part: &Part) -> Result<String> {
        if self.conn != Conn::Updi {
            return Err(Error::Unsupported("read_sib"));
        }
        if self.sib.is_none() {
            self.sib = Some(self.read_memory(MTYPE_SIB, 0, 32)?);
        }
        let sib = self.sib.as_ref().unwrap();
        Ok(String::from_utf8_lossy(sib)
            .trim_end_matches('\0')
            .to_string())
    }

    fn read_chip_rev(&mut self, part: &Part) -> Result<u8> {
        if !(part.is_avr8x() || part.is_xmega()) {
            return Err(Error::Unsupported("read_chip_rev"));
        }
        let addr = u32::from(part.syscfg_offset) + 1;
        Ok(self.read_memory(MTYPE_SRAM, addr, 1)?[0])
    }

    fn set_sck_period(&mut self, period_s: f64) -> Result<()> {
        self.sck_period = Some(period_s);
        Ok(())
    }

    fn get_sck_period(&self) -> Result<f64> {
        self.sck_period.ok_or(Error::Unsupported("get_sck_period"))
    }

    fn get_vtarget(&mut self) -> Result<f64> {
        let mv = self.get_parameter(SCOPE_GENERAL, 0x01, PARM3_VTARGET, 2)?;
        Ok(f64::from(u16_from_le(&mv)) / 1000.0)
    }

    fn parse_extparams(&mut self, params: &[String]) -> Result<()> {
        for p in params {
            match p.as_str() {
                "hvupdi" => self.hvupdi = true,
                "modeswitch" | "mode-switch" => self.mode_switch = true,
                other => {
                    return Err(Error::Config(format!(
                        "unknown extended parameter {:?} for {}",
                        other, self.id
                    )))
                }
            }
        }
        Ok(())
    }

    fn term_keep_alive(&mut self, _part: &Part) -> Result<()> {
        self.get_parameter(SCOPE_GENERAL, 0x00, PARM3_HW_VER, 1)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    /// Wraps a raw JTAGICE3 frame into one EDBG response fragment.
    fn edbg_rsp(raw: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 64];
        pkt[0] = edbg::VENDOR_AVR_RSP;
        pkt[1] = 0x11;
        pkt[2] = (raw.len() >> 8) as u8;
        pkt[3] = raw.len() as u8;
        pkt[4..4 + raw.len()].copy_from_slice(raw);
        pkt
    }

    /// Wraps an outbound payload into the EDBG request packet(s) the
    /// engine is expected to send for sequence number `seq`.
    fn edbg_cmd(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![TOKEN, 0x00, seq as u8, (seq >> 8) as u8];
        raw.extend_from_slice(payload);
        assert!(raw.len() <= 60);
        let mut pkt = vec![0u8; 64];
        pkt[0] = edbg::VENDOR_AVR_CMD;
        pkt[1] = 0x11;
        pkt[2] = (raw.len() >> 8) as u8;
        pkt[3] = raw.len() as u8;
        pkt[4..4 + raw.len()].copy_from_slice(&raw);
        pkt
    }

    fn rsp_frame(seq: u16, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![TOKEN, seq as u8, (seq >> 8) as u8];
        raw.extend_from_slice(body);
        raw
    }

    fn rig() -> Jtag3 {
        Jtag3::updi().over_edbg()
    }

    #[test]
    fn sequence_numbers_are_distinct_and_skip_event_seq() {
        let mut pgm = rig();
        let mut seen = std::collections::HashSet::new();
        pgm.seq = 0xfffd;
        for _ in 0..4 {
            let s = pgm.next_seq();
            assert_ne!(s, EVENT_SEQ);
            assert!(seen.insert(s), "sequence {} reused", s);
        }
        // 0xfffe is followed by 0x0000: 0xffff stays reserved.
        assert!(seen.contains(&0xfffe));
        assert!(seen.contains(&0x0000));
    }

    #[test]
    fn command_round_trip_with_ok_status() {
        let mut pgm = rig();
        let mut mock = MockTransport::new();
        let payload = [SCOPE_GENERAL, CMD3_SIGN_ON, 0x00];
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(1, &[SCOPE_GENERAL, RSP3_OK])),
        );
        pgm.set_transport(Box::new(mock));
        let body = pgm.command(&payload).unwrap();
        assert_eq!(body[1], RSP3_OK);
    }

    #[test]
    fn sign_on_avr_stores_sib_prefix_from_data_response() {
        let mut pgm = rig();
        let mut mock = MockTransport::new();
        let payload = [SCOPE_AVR, CMD3_SIGN_ON, 0x00, 0x00];
        let mut body = vec![SCOPE_AVR, RSP3_DATA, 0x00];
        body.extend_from_slice(b"tiny");
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        mock.expect(vec![edbg::VENDOR_AVR_RSP], edbg_rsp(&rsp_frame(1, &body)));
        pgm.set_transport(Box::new(mock));
        pgm.sign_on_avr().unwrap();
        assert_eq!(pgm.sib.as_deref(), Some(&b"tiny"[..]));
    }

    #[test]
    fn event_frames_are_skipped_until_the_matching_reply() {
        let mut pgm = rig();
        let mut mock = MockTransport::new();
        let payload = [SCOPE_AVR, CMD3_ENTER_PROGMODE, 0x00];
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        // First poll delivers an event frame (sequence 0xFFFF), the second
        // one the real answer.
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(EVENT_SEQ, &[SCOPE_AVR, 0x40, 0x01])),
        );
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(1, &[SCOPE_AVR, RSP3_OK])),
        );
        pgm.set_transport(Box::new(mock));
        pgm.enter_progmode().unwrap();
    }

    #[test]
    fn failed_status_maps_to_taxonomy() {
        let mut pgm = rig();
        let mut mock = MockTransport::new();
        let payload = [SCOPE_AVR, CMD3_ENTER_PROGMODE, 0x00];
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(1, &[SCOPE_AVR, RSP3_FAILED, RSP3_FAIL_OCD_LOCKED])),
        );
        pgm.set_transport(Box::new(mock));
        let err = pgm.enter_progmode().unwrap_err();
        assert!(err.is_chip_locked());
    }

    #[test]
    fn get_parameter_returns_little_endian_payload() {
        let mut pgm = rig();
        let mut mock = MockTransport::new();
        let payload = [
            SCOPE_GENERAL,
            CMD3_GET_PARAMETER,
            0x00,
            0x00,
            PARM3_FW_MAJOR,
            2,
        ];
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(1, &[SCOPE_GENERAL, RSP3_DATA, 0x00, 0x03, 0x00])),
        );
        pgm.set_transport(Box::new(mock));
        let fw = pgm
            .get_parameter(SCOPE_GENERAL, 0x00, PARM3_FW_MAJOR, 2)
            .unwrap();
        assert_eq!(u16_from_le(&fw), 3);
    }

    #[test]
    fn read_memory_checks_reply_length() {
        let mut pgm = rig();
        let mut mock = MockTransport::new();
        let mut payload = vec![SCOPE_AVR, CMD3_READ_MEMORY, 0x00, MTYPE_FLASH_PAGE];
        payload.extend_from_slice(&0x8000u32.to_le_bytes());
        payload.extend_from_slice(&4u32.to_le_bytes());
        mock.expect(edbg_cmd(1, &payload), Vec::new());
        // Claims RSP3_DATA but carries only two data bytes.
        mock.expect(
            vec![edbg::VENDOR_AVR_RSP],
            edbg_rsp(&rsp_frame(1, &[SCOPE_AVR, RSP3_DATA, 0x00, 0xaa, 0xbb])),
        );
        pgm.set_transport(Box::new(mock));
        assert!(pgm.read_memory(MTYPE_FLASH_PAGE, 0x8000, 4).is_err());
    }
}
