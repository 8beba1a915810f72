//! The programmer abstraction.
//!
//! Every dongle backend implements [`Programmer`], a memory-oriented
//! contract the driver layer calls without knowing which wire protocol is
//! underneath. Backends are looked up by identifier in the [`backends`]
//! registry; several identifiers may alias one backend with different
//! connection types baked in.

use bitflags::bitflags;

use crate::part::{Memory, Part, ProgModes};
use crate::{Error, Result};

bitflags! {
    /// Optional capabilities a backend can advertise beyond the memory
    /// contract.
    pub struct ExtraFeatures: u8 {
        const VTARG_READ   = 1 << 0;
        const VTARG_ADJ    = 1 << 1;
        const VTARG_SWITCH = 1 << 2;
        /// The SUFFER debug register of some Microchip kits.
        const SUFFER       = 1 << 3;
        /// Can generate the high-voltage UPDI enable pulse.
        const HVUPDI       = 1 << 4;
    }
}

/// The uniform memory-oriented interface all backends implement.
///
/// Lifecycle: construct (registry) → [`setup`] → [`open`] → [`initialize`]
/// → any sequence of memory operations → [`disable`] → [`close`] →
/// [`teardown`]. Operations that a backend cannot perform at all return
/// [`Error::Unsupported`]; operations a given memory class cannot satisfy
/// return [`Error::UnsupportedMemory`].
///
/// [`setup`]: Programmer::setup
/// [`open`]: Programmer::open
/// [`initialize`]: Programmer::initialize
/// [`disable`]: Programmer::disable
/// [`close`]: Programmer::close
/// [`teardown`]: Programmer::teardown
pub trait Programmer {
    /// The backend type string, e.g. `"jtagice3_updi"`.
    fn id(&self) -> &'static str;

    /// Programming modes this backend can drive.
    fn prog_modes(&self) -> ProgModes;

    fn extra_features(&self) -> ExtraFeatures {
        ExtraFeatures::empty()
    }

    /// One-time per-run state allocation.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases everything `setup` allocated.
    fn teardown(&mut self) {}

    /// Binds the transport. `port` is backend-specific: a tty path, `usb`,
    /// or `usb:<serial>`.
    fn open(&mut self, port: &str) -> Result<()>;

    fn close(&mut self);

    /// Establishes the wire session with the target.
    fn initialize(&mut self, part: &Part) -> Result<()>;

    /// Prints identity, firmware and voltage information under `prefix`.
    fn display(&self, prefix: &str) {
        println!("{}Programmer type : {}", prefix, self.id());
    }

    /// Prepares the target for memory access; paired with [`Programmer::disable`].
    fn enable(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        Ok(())
    }

    fn program_enable(&mut self, part: &Part) -> Result<()>;

    fn chip_erase(&mut self, part: &Part) -> Result<()>;

    /// Tunnels one raw 4-byte ISP instruction, where the wire allows it.
    fn cmd(&mut self, _cmd: &[u8; 4]) -> Result<[u8; 4]> {
        Err(Error::Unsupported("cmd"))
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8>;

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()>;

    /// Reads `buf.len()` bytes starting at `addr`, in `page_size` chunks.
    fn paged_load(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: u32,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<usize>;

    /// Writes `data` starting at `addr`, in `page_size` chunks. Backends
    /// pad short trailing pages themselves where the wire demands it.
    fn paged_write(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: u32,
        addr: u32,
        data: &[u8],
    ) -> Result<usize>;

    fn page_erase(&mut self, _part: &Part, _mem: &Memory, _addr: u32) -> Result<()> {
        Err(Error::Unsupported("page_erase"))
    }

    /// Reads the three signature bytes. The default goes byte by byte.
    fn read_sig_bytes(&mut self, part: &Part, mem: &Memory) -> Result<[u8; 3]> {
        let mut sig = [0u8; 3];
        for (i, b) in sig.iter_mut().enumerate() {
            *b = self.read_byte(part, mem, i as u32)?;
        }
        Ok(sig)
    }

    /// Reads the System Information Block of a UPDI part.
    fn read_sib(&mut self, _part: &Part) -> Result<String> {
        Err(Error::Unsupported("read_sib"))
    }

    /// Reads the silicon revision of an AVR8X part.
    fn read_chip_rev(&mut self, _part: &Part) -> Result<u8> {
        Err(Error::Unsupported("read_chip_rev"))
    }

    fn set_sck_period(&mut self, _period_s: f64) -> Result<()> {
        Err(Error::Unsupported("set_sck_period"))
    }

    fn get_sck_period(&self) -> Result<f64> {
        Err(Error::Unsupported("get_sck_period"))
    }

    fn set_vtarget(&mut self, _v: f64) -> Result<()> {
        Err(Error::Unsupported("set_vtarget"))
    }

    fn get_vtarget(&mut self) -> Result<f64> {
        Err(Error::Unsupported("get_vtarget"))
    }

    /// Consumes `-x key[=value]` extended parameters.
    fn parse_extparams(&mut self, params: &[String]) -> Result<()> {
        if params.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "programmer {} takes no extended parameters (got {:?})",
                self.id(),
                params
            )))
        }
    }

    /// Called periodically by interactive frontends to keep the wire
    /// session from timing out.
    fn term_keep_alive(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Programmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Programmer({})", self.id())
    }
}

fn lowest_mode(modes: ProgModes) -> ProgModes {
    ProgModes::from_bits_truncate(modes.bits() & modes.bits().wrapping_neg())
}

/// Picks the programming mode for a part/programmer pair.
///
/// The intersection of the two mode sets must resolve to exactly one
/// mode. High-voltage programming never wins a tie (it is a last-resort
/// mode the user selects deliberately), and a programmer that declares
/// every mode imposes no constraint at all, so the part's first mode is
/// taken. Any remaining ambiguity fails unless `force` accepts the
/// first candidate.
pub fn negotiate_mode(part: &Part, pgm_modes: ProgModes, force: bool) -> Result<ProgModes> {
    let common = part.prog_modes & pgm_modes;
    if common.is_empty() {
        return Err(Error::NoCommonMode);
    }
    if pgm_modes == ProgModes::all() {
        let preferred = part.prog_modes & !ProgModes::HV;
        let pick = if preferred.is_empty() { part.prog_modes } else { preferred };
        return Ok(lowest_mode(pick));
    }
    let preferred = common & !ProgModes::HV;
    let candidates = if preferred.is_empty() { common } else { preferred };
    if candidates.bits().count_ones() == 1 || force {
        return Ok(lowest_mode(candidates));
    }
    Err(Error::AmbiguousMode)
}

/// One registry entry: a backend type plus the identifiers that select it.
pub struct Backend {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub desc: &'static str,
    pub new: fn() -> Box<dyn Programmer>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name).finish()
    }
}

fn mk_dryrun() -> Box<dyn Programmer> {
    Box::new(crate::dryrun::Dryrun::new())
}

fn mk_serialupdi() -> Box<dyn Programmer> {
    Box::new(crate::updi::SerialUpdi::new())
}

fn mk_flip2() -> Box<dyn Programmer> {
    Box::new(crate::flip2::Flip2::new())
}

fn mk_stk500() -> Box<dyn Programmer> {
    Box::new(crate::stk500::Stk500::new())
}

fn mk_stk500v2() -> Box<dyn Programmer> {
    Box::new(crate::stk500v2::Stk500v2::new())
}

fn mk_avrdoper() -> Box<dyn Programmer> {
    Box::new(crate::stk500v2::Stk500v2::avrdoper())
}

fn mk_jtag3() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::jtag())
}

fn mk_jtag3_pdi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::pdi())
}

fn mk_jtag3_updi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::updi())
}

fn mk_jtag3_dw() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::debugwire())
}

fn mk_jtag3_isp() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::isp())
}

fn mk_jtag3_tpi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::tpi())
}

fn mk_atmelice() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::jtag().over_edbg())
}

fn mk_atmelice_pdi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::pdi().over_edbg())
}

fn mk_atmelice_updi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::updi().over_edbg())
}

fn mk_atmelice_isp() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::isp().over_edbg())
}

fn mk_pickit4_updi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::updi().over_edbg().pic_family())
}

fn mk_snap_updi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::updi().over_edbg().pic_family())
}

fn mk_xplainedmini_updi() -> Box<dyn Programmer> {
    Box::new(crate::jtagice3::Jtag3::updi().over_edbg())
}

#[cfg(target_os = "linux")]
fn mk_linuxspi() -> Box<dyn Programmer> {
    Box::new(crate::linuxspi::LinuxSpi::new())
}

/// The built-in backend registry.
pub fn backends() -> Vec<Backend> {
    let mut list = vec![
        Backend {
            name: "dryrun",
            aliases: &["dryrun", "dry"],
            desc: "In-memory oracle, no hardware required",
            new: mk_dryrun,
        },
        Backend {
            name: "serialupdi",
            aliases: &["serialupdi"],
            desc: "Raw UPDI over a serial adapter",
            new: mk_serialupdi,
        },
        Backend {
            name: "flip2",
            aliases: &["flip2"],
            desc: "FLIP v2 DFU bootloader",
            new: mk_flip2,
        },
        Backend {
            name: "stk500v1",
            aliases: &["stk500", "stk500v1"],
            desc: "STK500 protocol version 1",
            new: mk_stk500,
        },
        Backend {
            name: "stk500v2",
            aliases: &["stk500v2"],
            desc: "STK500 protocol version 2",
            new: mk_stk500v2,
        },
        Backend {
            name: "avrdoper",
            aliases: &["avrdoper"],
            desc: "AVR-Doper, STK500v2 over HID",
            new: mk_avrdoper,
        },
        Backend {
            name: "jtagice3",
            aliases: &["jtag3", "jtagice3"],
            desc: "JTAGICE3 over USB bulk, JTAG connection",
            new: mk_jtag3,
        },
        Backend {
            name: "jtagice3_pdi",
            aliases: &["jtag3pdi"],
            desc: "JTAGICE3 over USB bulk, PDI connection",
            new: mk_jtag3_pdi,
        },
        Backend {
            name: "jtagice3_updi",
            aliases: &["jtag3updi"],
            desc: "JTAGICE3 over USB bulk, UPDI connection",
            new: mk_jtag3_updi,
        },
        Backend {
            name: "jtagice3_dw",
            aliases: &["jtag3dw"],
            desc: "JTAGICE3 over USB bulk, debugWIRE connection",
            new: mk_jtag3_dw,
        },
        Backend {
            name: "jtagice3_isp",
            aliases: &["jtag3isp"],
            desc: "JTAGICE3 over USB bulk, ISP connection",
            new: mk_jtag3_isp,
        },
        Backend {
            name: "jtagice3_tpi",
            aliases: &["jtag3tpi"],
            desc: "JTAGICE3 over USB bulk, TPI connection",
            new: mk_jtag3_tpi,
        },
        Backend {
            name: "atmelice",
            aliases: &["atmelice", "atmelice_jtag"],
            desc: "Atmel-ICE (EDBG), JTAG connection",
            new: mk_atmelice,
        },
        Backend {
            name: "atmelice_pdi",
            aliases: &["atmelice_pdi"],
            desc: "Atmel-ICE (EDBG), PDI connection",
            new: mk_atmelice_pdi,
        },
        Backend {
            name: "atmelice_updi",
            aliases: &["atmelice_updi"],
            desc: "Atmel-ICE (EDBG), UPDI connection",
            new: mk_atmelice_updi,
        },
        Backend {
            name: "atmelice_isp",
            aliases: &["atmelice_isp"],
            desc: "Atmel-ICE (EDBG), ISP connection",
            new: mk_atmelice_isp,
        },
        Backend {
            name: "pickit4_updi",
            aliases: &["pickit4_updi"],
            desc: "PICkit4 (EDBG), UPDI connection",
            new: mk_pickit4_updi,
        },
        Backend {
            name: "snap_updi",
            aliases: &["snap_updi"],
            desc: "MPLAB SNAP (EDBG), UPDI connection",
            new: mk_snap_updi,
        },
        Backend {
            name: "xplainedmini_updi",
            aliases: &["xplainedmini_updi"],
            desc: "Xplained Mini kit (EDBG), UPDI connection",
            new: mk_xplainedmini_updi,
        },
    ];
    #[cfg(target_os = "linux")]
    list.push(Backend {
        name: "linuxspi",
        aliases: &["linuxspi"],
        desc: "Bit-clocked ISP over spidev and a GPIO reset line",
        new: mk_linuxspi,
    });
    list
}

/// Instantiates the backend registered under `id`.
pub fn by_id(id: &str) -> Result<Box<dyn Programmer>> {
    for b in backends() {
        if b.aliases.iter().any(|a| a.eq_ignore_ascii_case(id)) {
            return Ok((b.new)());
        }
    }
    Err(Error::UnknownProgrammer(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts;

    #[test]
    fn negotiation_single_mode() {
        let db = parts::builtin();
        let t3216 = crate::part::locate(&db, "attiny3216").unwrap();
        let mode = negotiate_mode(t3216, ProgModes::UPDI, false).unwrap();
        assert_eq!(mode, ProgModes::UPDI);
    }

    #[test]
    fn negotiation_rejects_disjoint_sets() {
        let db = parts::builtin();
        let t3216 = crate::part::locate(&db, "attiny3216").unwrap();
        assert!(matches!(
            negotiate_mode(t3216, ProgModes::ISP, false),
            Err(Error::NoCommonMode)
        ));
    }

    #[test]
    fn negotiation_ambiguity_needs_force() {
        let db = parts::builtin();
        // ATtiny13 speaks both ISP and debugWIRE.
        let t13 = crate::part::locate(&db, "attiny13").unwrap();
        let both = ProgModes::ISP | ProgModes::DEBUGWIRE;
        assert!(matches!(
            negotiate_mode(t13, both, false),
            Err(Error::AmbiguousMode)
        ));
        let forced = negotiate_mode(t13, both, true).unwrap();
        assert_eq!(forced.bits().count_ones(), 1);
    }

    #[test]
    fn negotiation_hv_never_wins_a_tie() {
        let db = parts::builtin();
        // The stk500 engines offer ISP and HV; ISP must win outright.
        let m328 = crate::part::locate(&db, "atmega328p").unwrap();
        let mode = negotiate_mode(m328, ProgModes::ISP | ProgModes::HV, false).unwrap();
        assert_eq!(mode, ProgModes::ISP);
    }

    #[test]
    fn negotiation_with_an_unconstrained_programmer() {
        let db = parts::builtin();
        // The oracle claims every mode; the part's first real mode wins.
        let m328 = crate::part::locate(&db, "atmega328p").unwrap();
        let mode = negotiate_mode(m328, ProgModes::all(), false).unwrap();
        assert_eq!(mode, ProgModes::ISP);
    }

    #[test]
    fn registry_resolves_aliases() {
        assert_eq!(by_id("dry").unwrap().id(), "dryrun");
        assert_eq!(by_id("JTAG3UPDI").unwrap().id(), "jtagice3_updi");
        assert!(by_id("warp-drive").is_err());
    }
}
