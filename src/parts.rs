//! The built-in part catalogue.
//!
//! One entry per supported MCU, with the memories, base addresses and (for
//! ISP parts) opcode templates the wire engines need. The records are
//! built once and then treated as read-only.

use crate::opcode::op;
use crate::part::{EesaveFuse, IspOps, Memory, Part, ProgModes};
use crate::updi::nvm::NvmVersion;

fn mem(name: &'static str, size: u32, page_size: u32, offset: u32) -> Memory {
    Memory {
        name,
        size,
        page_size,
        read_size: page_size.max(1),
        offset,
        initval: None,
        readonly: false,
        bitmask: 0xff,
        ops: None,
    }
}

fn romem(name: &'static str, size: u32, offset: u32) -> Memory {
    Memory {
        readonly: true,
        ..mem(name, size, 1, offset)
    }
}

fn with_ops(m: Memory, ops: IspOps) -> Memory {
    Memory {
        ops: Some(ops),
        ..m
    }
}

fn base(name: &'static str, signature: [u8; 3], prog_modes: ProgModes) -> Part {
    Part {
        name,
        signature,
        prog_modes,
        n_interrupts: 0,
        regfile_addr: 0,
        ocd_rev: 0,
        nvm_base: 0,
        mcu_base: 0,
        ocd_base: 0,
        syscfg_offset: 0,
        hvupdi_variant: None,
        chip_erase_delay_us: 9000,
        nvm_version: None,
        n_word_writes: 1,
        eesave: None,
        pgm_enable: None,
        chip_erase: None,
        boot_start: None,
        usbpid: None,
        mem: Vec::new(),
    }
}

const PGM_ENABLE: &str =
    "1 0 1 0  1 1 0 0  0 1 0 1  0 0 1 1  x x x x  x x x x  x x x x  x x x x";
const CHIP_ERASE: &str =
    "1 0 1 0  1 1 0 0  1 0 0 x  x x x x  x x x x  x x x x  x x x x  x x x x";

fn classic_fuse_ops(index: u8) -> IspOps {
    // Read 0x50/0x58 with the second byte selecting the fuse, write
    // 0xAC 0xA0/0xA8/0xA4.
    let (read, write) = match index {
        0 => (
            "0 1 0 1  0 0 0 0  0 0 0 0  0 0 0 0  x x x x  x x x x  o o o o  o o o o",
            "1 0 1 0  1 1 0 0  1 0 1 0  0 0 0 0  x x x x  x x x x  i i i i  i i i i",
        ),
        1 => (
            "0 1 0 1  1 0 0 0  0 0 0 0  1 0 0 0  x x x x  x x x x  o o o o  o o o o",
            "1 0 1 0  1 1 0 0  1 0 1 0  1 0 0 0  x x x x  x x x x  i i i i  i i i i",
        ),
        _ => (
            "0 1 0 1  0 0 0 0  0 0 0 0  1 0 0 0  x x x x  x x x x  o o o o  o o o o",
            "1 0 1 0  1 1 0 0  1 0 1 0  0 1 0 0  x x x x  x x x x  i i i i  i i i i",
        ),
    };
    IspOps {
        read: Some(op(read)),
        write: Some(op(write)),
        ..IspOps::default()
    }
}

fn classic_lock_ops() -> IspOps {
    IspOps {
        read: Some(op(
            "0 1 0 1  1 0 0 0  0 0 0 0  0 0 0 0  x x x x  x x x x  x x o o  o o o o",
        )),
        write: Some(op(
            "1 0 1 0  1 1 0 0  1 1 1 0  0 0 0 0  x x x x  x x x x  1 1 i i  i i i i",
        )),
        ..IspOps::default()
    }
}

fn classic_signature_ops() -> IspOps {
    IspOps {
        read: Some(op(
            "0 0 1 1  0 0 0 0  0 0 0 x  x x x x  x x x x  x x a1 a0  o o o o  o o o o",
        )),
        ..IspOps::default()
    }
}

fn classic_calibration_ops() -> IspOps {
    IspOps {
        read: Some(op(
            "0 0 1 1  1 0 0 0  0 0 0 x  x x x x  x x x x  x x x x  o o o o  o o o o",
        )),
        ..IspOps::default()
    }
}

/// ATmega328P: the classic ISP/debugWIRE workhorse.
fn atmega328p() -> Part {
    let flash_ops = IspOps {
        read_lo: Some(op(
            "0 0 1 0  0 0 0 0  x x a13 a12  a11 a10 a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        read_hi: Some(op(
            "0 0 1 0  1 0 0 0  x x a13 a12  a11 a10 a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        load_lo: Some(op(
            "0 1 0 0  0 0 0 0  x x x x  x x x x  x x a5 a4  a3 a2 a1 a0  i i i i  i i i i",
        )),
        load_hi: Some(op(
            "0 1 0 0  1 0 0 0  x x x x  x x x x  x x a5 a4  a3 a2 a1 a0  i i i i  i i i i",
        )),
        write_page: Some(op(
            "0 1 0 0  1 1 0 0  x x a13 a12  a11 a10 a9 a8  a7 a6 x x  x x x x  x x x x  x x x x",
        )),
        ..IspOps::default()
    };
    let eeprom_ops = IspOps {
        read: Some(op(
            "1 0 1 0  0 0 0 0  x x x x  x x a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        write: Some(op(
            "1 1 0 0  0 0 0 0  x x x x  x x a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  i i i i  i i i i",
        )),
        ..IspOps::default()
    };

    let mut p = base(
        "ATmega328P",
        [0x1e, 0x95, 0x14],
        ProgModes::ISP | ProgModes::DEBUGWIRE | ProgModes::HV,
    );
    p.n_interrupts = 26;
    p.ocd_rev = 1;
    p.chip_erase_delay_us = 9000;
    p.pgm_enable = Some(op(PGM_ENABLE));
    p.chip_erase = Some(op(CHIP_ERASE));
    p.eesave = Some(EesaveFuse {
        mem: "fuse1",
        addr: 0,
        mask: 0x08,
        preserve_when_set: false,
    });
    p.mem = vec![
        with_ops(mem("flash", 32768, 128, 0), flash_ops),
        with_ops(mem("eeprom", 1024, 4, 0), eeprom_ops),
        mem("fuses", 3, 1, 0),
        Memory {
            initval: Some(0x62),
            ..with_ops(mem("fuse0", 1, 1, 0), classic_fuse_ops(0))
        },
        Memory {
            initval: Some(0xd9),
            ..with_ops(mem("fuse1", 1, 1, 1), classic_fuse_ops(1))
        },
        Memory {
            initval: Some(0xff),
            bitmask: 0x07,
            ..with_ops(mem("fuse2", 1, 1, 2), classic_fuse_ops(2))
        },
        Memory {
            bitmask: 0x3f,
            ..with_ops(mem("lock", 1, 1, 0), classic_lock_ops())
        },
        with_ops(romem("signature", 3, 0), classic_signature_ops()),
        with_ops(romem("calibration", 1, 0), classic_calibration_ops()),
        mem("io", 224, 1, 0x20),
        mem("sram", 2048, 1, 0x100),
    ];
    p
}

/// ATtiny13: the small classic part the debugWIRE engines are exercised
/// against.
fn attiny13() -> Part {
    let flash_ops = IspOps {
        read_lo: Some(op(
            "0 0 1 0  0 0 0 0  x x x x  x x x a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        read_hi: Some(op(
            "0 0 1 0  1 0 0 0  x x x x  x x x a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        load_lo: Some(op(
            "0 1 0 0  0 0 0 0  x x x x  x x x x  x x x x  a3 a2 a1 a0  i i i i  i i i i",
        )),
        load_hi: Some(op(
            "0 1 0 0  1 0 0 0  x x x x  x x x x  x x x x  a3 a2 a1 a0  i i i i  i i i i",
        )),
        write_page: Some(op(
            "0 1 0 0  1 1 0 0  x x x x  x x x a8  a7 a6 a5 a4  x x x x  x x x x  x x x x",
        )),
        ..IspOps::default()
    };
    let eeprom_ops = IspOps {
        read: Some(op(
            "1 0 1 0  0 0 0 0  x x x x  x x x x  x x a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        write: Some(op(
            "1 1 0 0  0 0 0 0  x x x x  x x x x  x x a5 a4  a3 a2 a1 a0  i i i i  i i i i",
        )),
        ..IspOps::default()
    };

    let mut p = base(
        "ATtiny13",
        [0x1e, 0x90, 0x07],
        ProgModes::ISP | ProgModes::DEBUGWIRE | ProgModes::HV,
    );
    p.n_interrupts = 10;
    p.ocd_rev = 1;
    p.pgm_enable = Some(op(PGM_ENABLE));
    p.chip_erase = Some(op(CHIP_ERASE));
    p.mem = vec![
        with_ops(mem("flash", 1024, 32, 0), flash_ops),
        with_ops(mem("eeprom", 64, 1, 0), eeprom_ops),
        mem("fuses", 2, 1, 0),
        Memory {
            initval: Some(0x6a),
            ..with_ops(mem("fuse0", 1, 1, 0), classic_fuse_ops(0))
        },
        Memory {
            initval: Some(0xff),
            bitmask: 0x1f,
            ..with_ops(mem("fuse1", 1, 1, 1), classic_fuse_ops(1))
        },
        Memory {
            bitmask: 0x03,
            ..with_ops(mem("lock", 1, 1, 0), classic_lock_ops())
        },
        with_ops(romem("signature", 3, 0), classic_signature_ops()),
        with_ops(romem("calibration", 1, 0), classic_calibration_ops()),
    ];
    p
}

/// ATmega2560: classic ISP part above the 64 KiB word-address boundary.
fn atmega2560() -> Part {
    let flash_ops = IspOps {
        read_lo: Some(op(
            "0 0 1 0  0 0 0 0  a15 a14 a13 a12  a11 a10 a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        read_hi: Some(op(
            "0 0 1 0  1 0 0 0  a15 a14 a13 a12  a11 a10 a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        load_lo: Some(op(
            "0 1 0 0  0 0 0 0  x x x x  x x x x  x a6 a5 a4  a3 a2 a1 a0  i i i i  i i i i",
        )),
        load_hi: Some(op(
            "0 1 0 0  1 0 0 0  x x x x  x x x x  x a6 a5 a4  a3 a2 a1 a0  i i i i  i i i i",
        )),
        write_page: Some(op(
            "0 1 0 0  1 1 0 0  a15 a14 a13 a12  a11 a10 a9 a8  a7 x x x  x x x x  x x x x  x x x x",
        )),
        load_ext_addr: Some(op(
            "0 1 0 0  1 1 0 1  0 0 0 0  0 0 0 0  x x x x  x x x a16  x x x x  x x x x",
        )),
        ..IspOps::default()
    };
    let eeprom_ops = IspOps {
        read: Some(op(
            "1 0 1 0  0 0 0 0  x x x x  a11 a10 a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )),
        write: Some(op(
            "1 1 0 0  0 0 0 0  x x x x  a11 a10 a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  i i i i  i i i i",
        )),
        ..IspOps::default()
    };

    let mut p = base(
        "ATmega2560",
        [0x1e, 0x98, 0x01],
        ProgModes::ISP | ProgModes::JTAG | ProgModes::HV,
    );
    p.n_interrupts = 57;
    p.ocd_rev = 3;
    p.pgm_enable = Some(op(PGM_ENABLE));
    p.chip_erase = Some(op(CHIP_ERASE));
    p.eesave = Some(EesaveFuse {
        mem: "fuse1",
        addr: 0,
        mask: 0x08,
        preserve_when_set: false,
    });
    p.mem = vec![
        with_ops(mem("flash", 262144, 256, 0), flash_ops),
        with_ops(mem("eeprom", 4096, 8, 0), eeprom_ops),
        mem("fuses", 3, 1, 0),
        with_ops(mem("fuse0", 1, 1, 0), classic_fuse_ops(0)),
        with_ops(mem("fuse1", 1, 1, 1), classic_fuse_ops(1)),
        with_ops(mem("fuse2", 1, 1, 2), classic_fuse_ops(2)),
        with_ops(mem("lock", 1, 1, 0), classic_lock_ops()),
        with_ops(romem("signature", 3, 0), classic_signature_ops()),
        with_ops(romem("calibration", 1, 0), classic_calibration_ops()),
    ];
    p
}

/// ATtiny10: TPI, single word write.
fn attiny10() -> Part {
    let mut p = base("ATtiny10", [0x1e, 0x90, 0x03], ProgModes::TPI | ProgModes::HV);
    p.n_interrupts = 10;
    p.mem = vec![
        mem("flash", 1024, 16, 0x4000),
        mem("fuses", 1, 1, 0x3f40),
        mem("lock", 1, 1, 0x3f00),
        romem("signature", 3, 0x3fc0),
        romem("calibration", 1, 0x3f80),
        mem("io", 64, 1, 0x0000),
        mem("sram", 32, 1, 0x0040),
    ];
    p
}

/// ATtiny104: TPI with the double word-write quirk.
fn attiny104() -> Part {
    let mut p = base("ATtiny104", [0x1e, 0x90, 0x0b], ProgModes::TPI | ProgModes::HV);
    p.n_interrupts = 16;
    p.n_word_writes = 2;
    p.mem = vec![
        mem("flash", 1024, 16, 0x4000),
        mem("fuses", 1, 1, 0x3f40),
        mem("lock", 1, 1, 0x3f00),
        romem("signature", 3, 0x3fc0),
        romem("calibration", 1, 0x3f80),
    ];
    p
}

/// ATxmega128A4U: PDI part with split flash and a FLIP v2 bootloader.
fn atxmega128a4u() -> Part {
    let mut p = base(
        "ATxmega128A4U",
        [0x1e, 0x97, 0x46],
        ProgModes::PDI | ProgModes::JTAG_XMEGA,
    );
    p.n_interrupts = 127;
    p.nvm_base = 0x01c0;
    p.mcu_base = 0x0090;
    p.boot_start = Some(0x20000);
    p.usbpid = Some(0x2fde);
    p.chip_erase_delay_us = 55000;
    p.mem = vec![
        // Flash owns the array; application/apptable/boot alias it.
        mem("flash", 0x22000, 512, 0),
        mem("application", 0x20000, 512, 0),
        mem("apptable", 0x2000, 512, 0x1e000),
        mem("boot", 0x2000, 512, 0x20000),
        mem("eeprom", 2048, 32, 0),
        mem("fuses", 6, 1, 0),
        mem("fuse0", 1, 1, 0),
        mem("fuse1", 1, 1, 1),
        mem("fuse2", 1, 1, 2),
        mem("fuse4", 1, 1, 4),
        mem("fuse5", 1, 1, 5),
        mem("lock", 1, 1, 0),
        romem("signature", 3, 0),
        mem("usersig", 512, 512, 0),
    ];
    p
}

fn updi_tiny_mem(flash_size: u32, flash_page: u32, eeprom_size: u32) -> Vec<Memory> {
    vec![
        mem("flash", flash_size, flash_page, 0x8000),
        mem("eeprom", eeprom_size, 64, 0x1400),
        mem("fuses", 9, 1, 0x1280),
        Memory { initval: Some(0x00), ..mem("fuse0", 1, 1, 0x1280) },
        Memory { initval: Some(0x00), ..mem("fuse1", 1, 1, 0x1281) },
        Memory { initval: Some(0x02), ..mem("fuse2", 1, 1, 0x1282) },
        mem("fuse4", 1, 1, 0x1284),
        Memory { initval: Some(0xf6), ..mem("fuse5", 1, 1, 0x1285) },
        Memory { initval: Some(0x07), ..mem("fuse6", 1, 1, 0x1286) },
        Memory { initval: Some(0x00), ..mem("fuse7", 1, 1, 0x1287) },
        Memory { initval: Some(0x00), ..mem("fuse8", 1, 1, 0x1288) },
        mem("lock", 1, 1, 0x128a),
        romem("sigrow", 64, 0x1100),
        romem("signature", 3, 0x1100),
        romem("tempsense", 2, 0x1120),
        mem("userrow", 32, 32, 0x1300),
        romem("sib", 32, 0),
        mem("sram", 2048, 1, 0x3800),
    ]
}

/// ATtiny3216: tinyAVR-1, NVM controller version 0.
fn attiny3216() -> Part {
    let mut p = base("ATtiny3216", [0x1e, 0x95, 0x21], ProgModes::UPDI);
    p.n_interrupts = 31;
    p.nvm_base = 0x1000;
    p.mcu_base = 0x0800;
    p.ocd_base = 0x0f80;
    p.syscfg_offset = 0x0f00;
    p.hvupdi_variant = Some(0);
    p.nvm_version = Some(NvmVersion::V0);
    p.eesave = Some(EesaveFuse {
        mem: "fuse5",
        addr: 0,
        mask: 0x01,
        preserve_when_set: true,
    });
    p.mem = updi_tiny_mem(32768, 128, 256);
    p
}

/// ATmega4809: megaAVR-0, NVM controller version 0.
fn atmega4809() -> Part {
    let mut p = base("ATmega4809", [0x1e, 0x96, 0x51], ProgModes::UPDI);
    p.n_interrupts = 40;
    p.nvm_base = 0x1000;
    p.mcu_base = 0x0800;
    p.ocd_base = 0x0f80;
    p.syscfg_offset = 0x0f00;
    p.nvm_version = Some(NvmVersion::V0);
    p.eesave = Some(EesaveFuse {
        mem: "fuse5",
        addr: 0,
        mask: 0x01,
        preserve_when_set: true,
    });
    p.mem = vec![
        mem("flash", 49152, 128, 0x4000),
        mem("eeprom", 256, 64, 0x1400),
        mem("fuses", 9, 1, 0x1280),
        Memory { initval: Some(0x00), ..mem("fuse0", 1, 1, 0x1280) },
        Memory { initval: Some(0x00), ..mem("fuse1", 1, 1, 0x1281) },
        Memory { initval: Some(0x02), ..mem("fuse2", 1, 1, 0x1282) },
        mem("fuse5", 1, 1, 0x1285),
        mem("fuse6", 1, 1, 0x1286),
        mem("fuse7", 1, 1, 0x1287),
        mem("fuse8", 1, 1, 0x1288),
        mem("lock", 1, 1, 0x128a),
        romem("sigrow", 64, 0x1100),
        romem("signature", 3, 0x1100),
        mem("userrow", 64, 64, 0x1300),
        romem("sib", 32, 0),
        mem("sram", 6144, 1, 0x2800),
    ];
    p
}

fn updi_dx_mem(flash_size: u32, flash_page: u32, userrow_size: u32) -> Vec<Memory> {
    vec![
        mem("flash", flash_size, flash_page, 0x80_0000),
        mem("eeprom", 512, 1, 0x1400),
        mem("fuses", 16, 1, 0x1050),
        mem("fuse0", 1, 1, 0x1050),
        mem("fuse1", 1, 1, 0x1051),
        mem("fuse2", 1, 1, 0x1052),
        mem("fuse5", 1, 1, 0x1055),
        mem("fuse6", 1, 1, 0x1056),
        mem("fuse7", 1, 1, 0x1057),
        mem("fuse8", 1, 1, 0x1058),
        mem("lock", 4, 1, 0x1040),
        romem("sigrow", 32, 0x1100),
        romem("signature", 3, 0x1100),
        mem("userrow", userrow_size, userrow_size, 0x1080),
        romem("sib", 32, 0),
    ]
}

/// AVR128DA48: AVR-Dx, NVM controller version 2.
fn avr128da48() -> Part {
    let mut p = base("AVR128DA48", [0x1e, 0x97, 0x06], ProgModes::UPDI);
    p.n_interrupts = 64;
    p.nvm_base = 0x1000;
    p.mcu_base = 0x0800;
    p.ocd_base = 0x0f80;
    p.syscfg_offset = 0x0f00;
    p.hvupdi_variant = Some(1);
    p.nvm_version = Some(NvmVersion::V2);
    p.eesave = Some(EesaveFuse {
        mem: "fuse5",
        addr: 0,
        mask: 0x01,
        preserve_when_set: true,
    });
    p.mem = updi_dx_mem(131072, 512, 32);
    p
}

/// AVR64EA48: AVR-Ex, NVM controller version 3.
fn avr64ea48() -> Part {
    let mut p = base("AVR64EA48", [0x1e, 0x96, 0x3c], ProgModes::UPDI);
    p.n_interrupts = 61;
    p.nvm_base = 0x1000;
    p.mcu_base = 0x0800;
    p.ocd_base = 0x0f80;
    p.syscfg_offset = 0x0f00;
    p.hvupdi_variant = Some(1);
    p.nvm_version = Some(NvmVersion::V3);
    p.eesave = Some(EesaveFuse {
        mem: "fuse5",
        addr: 0,
        mask: 0x01,
        preserve_when_set: true,
    });
    let mut m = updi_dx_mem(65536, 128, 64);
    // EA-series EEPROM is page-organised again.
    for e in m.iter_mut().filter(|e| e.name == "eeprom") {
        e.page_size = 8;
        e.read_size = 8;
    }
    p.mem = m;
    p
}

/// AVR16DU14: AVR-DU, NVM controller version 4, separate boot row.
fn avr16du14() -> Part {
    let mut p = base("AVR16DU14", [0x1e, 0x94, 0x28], ProgModes::UPDI);
    p.n_interrupts = 44;
    p.nvm_base = 0x1000;
    p.mcu_base = 0x0800;
    p.ocd_base = 0x0f80;
    p.syscfg_offset = 0x0f00;
    p.nvm_version = Some(NvmVersion::V4);
    p.boot_start = Some(0x0);
    p.eesave = Some(EesaveFuse {
        mem: "fuse5",
        addr: 0,
        mask: 0x01,
        preserve_when_set: true,
    });
    let mut m = updi_dx_mem(16384, 64, 64);
    for e in m.iter_mut().filter(|e| e.name == "flash") {
        e.offset = 0x8000;
    }
    m.push(mem("bootrow", 64, 64, 0x1200));
    p.mem = m;
    p
}

/// AVR16EB32: AVR-Ex, NVM controller version 5.
fn avr16eb32() -> Part {
    let mut p = base("AVR16EB32", [0x1e, 0x94, 0x2a], ProgModes::UPDI);
    p.n_interrupts = 46;
    p.nvm_base = 0x1000;
    p.mcu_base = 0x0800;
    p.ocd_base = 0x0f80;
    p.syscfg_offset = 0x0f00;
    p.nvm_version = Some(NvmVersion::V5);
    p.eesave = Some(EesaveFuse {
        mem: "fuse5",
        addr: 0,
        mask: 0x01,
        preserve_when_set: true,
    });
    let mut m = updi_dx_mem(16384, 64, 64);
    for e in m.iter_mut().filter(|e| e.name == "flash") {
        e.offset = 0x8000;
    }
    for e in m.iter_mut().filter(|e| e.name == "eeprom") {
        e.page_size = 8;
        e.read_size = 8;
    }
    m.push(mem("bootrow", 64, 64, 0x1200));
    p.mem = m;
    p
}

/// Builds the full catalogue.
pub fn builtin() -> Vec<Part> {
    vec![
        atmega328p(),
        attiny13(),
        atmega2560(),
        attiny10(),
        attiny104(),
        atxmega128a4u(),
        attiny3216(),
        atmega4809(),
        avr128da48(),
        avr64ea48(),
        avr16du14(),
        avr16eb32(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part;

    #[test]
    fn catalogue_is_well_formed() {
        for p in builtin() {
            assert!(!p.mem.is_empty(), "{} has no memories", p.name);
            assert!(p.mem("signature").is_some(), "{} has no signature", p.name);
            for m in &p.mem {
                if m.is_paged() {
                    assert!(
                        m.page_size.is_power_of_two(),
                        "{} {} page size {}",
                        p.name,
                        m.name,
                        m.page_size
                    );
                    assert_eq!(m.size % m.page_size, 0, "{} {}", p.name, m.name);
                }
            }
        }
    }

    #[test]
    fn updi_parts_have_nvm_versions() {
        for p in builtin() {
            assert_eq!(
                p.prog_modes.contains(crate::ProgModes::UPDI),
                p.nvm_version.is_some(),
                "{}",
                p.name
            );
        }
    }

    #[test]
    fn classic_parts_carry_isp_ops() {
        let db = builtin();
        let m328 = part::locate(&db, "ATmega328P").unwrap();
        assert!(m328.pgm_enable.is_some());
        assert!(m328.chip_erase.is_some());
        let flash = m328.mem("flash").unwrap();
        let ops = flash.ops.as_ref().unwrap();
        assert!(ops.read_lo.is_some() && ops.read_hi.is_some());
        assert!(ops.write_page.is_some());
    }

    #[test]
    fn chip_erase_matches_isp_vocabulary() {
        let db = builtin();
        let t13 = part::locate(&db, "ATtiny13").unwrap();
        let erase = t13.chip_erase.as_ref().unwrap();
        assert_eq!(erase.instr(0, 0), [0xac, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn big_flash_parts_need_wide_addresses() {
        let db = builtin();
        assert!(part::locate(&db, "ATmega2560").unwrap().needs_24bit_addr());
        assert!(part::locate(&db, "AVR128DA48").unwrap().needs_24bit_addr());
        assert!(!part::locate(&db, "ATtiny13").unwrap().needs_24bit_addr());
    }
}
