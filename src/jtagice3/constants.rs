//! JTAGICE3 protocol vocabulary: scopes, commands, responses, parameters
//! and memory types.

/// Frame token opening every command and response.
pub const TOKEN: u8 = 0x0e;

/// Sequence number reserved for asynchronous event frames.
pub const EVENT_SEQ: u16 = 0xffff;

// Scope selector, the first payload byte.
pub const SCOPE_INFO: u8 = 0x00;
pub const SCOPE_GENERAL: u8 = 0x01;
pub const SCOPE_AVR_ISP: u8 = 0x11;
pub const SCOPE_AVR: u8 = 0x12;
pub const SCOPE_AVR_TPI: u8 = 0x14;
pub const SCOPE_EDBG: u8 = 0x20;

// General-scope commands.
pub const CMD3_SET_PARAMETER: u8 = 0x01;
pub const CMD3_GET_PARAMETER: u8 = 0x02;
pub const CMD3_SIGN_ON: u8 = 0x10;
pub const CMD3_SIGN_OFF: u8 = 0x11;

// AVR-scope commands.
pub const CMD3_ENTER_PROGMODE: u8 = 0x15;
pub const CMD3_LEAVE_PROGMODE: u8 = 0x16;
pub const CMD3_ERASE_MEMORY: u8 = 0x20;
pub const CMD3_READ_MEMORY: u8 = 0x21;
pub const CMD3_WRITE_MEMORY: u8 = 0x23;

// Responses.
pub const RSP3_OK: u8 = 0x80;
pub const RSP3_INFO: u8 = 0x81;
pub const RSP3_PC: u8 = 0x83;
pub const RSP3_DATA: u8 = 0x84;
pub const RSP3_FAILED: u8 = 0xa0;

// Failure sub-codes carried after RSP3_FAILED.
pub const RSP3_FAIL_DEBUGWIRE: u8 = 0x10;
pub const RSP3_FAIL_PDI: u8 = 0x1b;
pub const RSP3_FAIL_NO_ANSWER: u8 = 0x20;
pub const RSP3_FAIL_NO_TARGET_POWER: u8 = 0x22;
pub const RSP3_FAIL_WRONG_MODE: u8 = 0x32;
pub const RSP3_FAIL_UNSUPP_MEMORY: u8 = 0x34;
pub const RSP3_FAIL_WRONG_LENGTH: u8 = 0x35;
pub const RSP3_FAIL_CRC_FAILURE: u8 = 0x43;
pub const RSP3_FAIL_OCD_LOCKED: u8 = 0x44;
pub const RSP3_FAIL_NOT_UNDERSTOOD: u8 = 0x91;

// Parameter sections and addresses.
pub const PARM3_HW_VER: u8 = 0x00;
pub const PARM3_FW_MAJOR: u8 = 0x01;
pub const PARM3_FW_MINOR: u8 = 0x02;
pub const PARM3_FW_RELEASE: u8 = 0x03;
/// General scope, section 1: target voltage in millivolts, two bytes.
pub const PARM3_VTARGET: u8 = 0x00;

/// AVR scope, section 0.
pub const PARM3_ARCH: u8 = 0x00;
pub const PARM3_SESS_PURPOSE: u8 = 0x01;
/// AVR scope, section 1.
pub const PARM3_CONNECTION: u8 = 0x00;
pub const PARM3_JTAG_DAISY: u8 = 0x01;
pub const PARM3_CLK_MEGA_PROG: u8 = 0x20;
pub const PARM3_CLK_JTAG_XMEGA: u8 = 0x30;
pub const PARM3_CLK_PDI_UPDI: u8 = 0x31;
/// AVR scope, section 2: the marshalled device descriptor.
pub const PARM3_DEVICEDESC: u8 = 0x00;

// PARM3_ARCH values.
pub const PARM3_ARCH_TINY: u8 = 0x01;
pub const PARM3_ARCH_MEGA: u8 = 0x02;
pub const PARM3_ARCH_XMEGA: u8 = 0x03;
pub const PARM3_ARCH_UPDI: u8 = 0x05;

// PARM3_SESS_PURPOSE values.
pub const PARM3_SESS_PROGRAMMING: u8 = 0x01;

// PARM3_CONNECTION values.
pub const PARM3_CONN_ISP: u8 = 0x01;
pub const PARM3_CONN_JTAG: u8 = 0x04;
pub const PARM3_CONN_DW: u8 = 0x05;
pub const PARM3_CONN_PDI: u8 = 0x06;
pub const PARM3_CONN_UPDI: u8 = 0x08;

// Memory types.
pub const MTYPE_SRAM: u8 = 0x20;
pub const MTYPE_EEPROM: u8 = 0x22;
pub const MTYPE_SPM: u8 = 0xa0;
pub const MTYPE_FLASH_PAGE: u8 = 0xb0;
pub const MTYPE_EEPROM_PAGE: u8 = 0xb1;
pub const MTYPE_FUSE_BITS: u8 = 0xb2;
pub const MTYPE_LOCK_BITS: u8 = 0xb3;
pub const MTYPE_SIGN_JTAG: u8 = 0xb4;
pub const MTYPE_OSCCAL_BYTE: u8 = 0xb5;
pub const MTYPE_APPL_FLASH: u8 = 0xc0;
pub const MTYPE_BOOT_FLASH: u8 = 0xc1;
pub const MTYPE_USERSIG: u8 = 0xc5;
pub const MTYPE_PRODSIG: u8 = 0xc6;
pub const MTYPE_SIB: u8 = 0xd3;

// Erase kinds for CMD3_ERASE_MEMORY.
pub const ERASE_CHIP: u8 = 0x00;
pub const ERASE_APP: u8 = 0x01;
pub const ERASE_BOOT: u8 = 0x02;
pub const ERASE_EEPROM: u8 = 0x03;
pub const ERASE_APP_PAGE: u8 = 0x04;
pub const ERASE_BOOT_PAGE: u8 = 0x05;
pub const ERASE_EEPROM_PAGE: u8 = 0x06;
pub const ERASE_USERSIG: u8 = 0x07;

// USB identity.
pub const USB_VID_ATMEL: u16 = 0x03eb;
pub const USB_PID_JTAGICE3: u16 = 0x2110;
pub const USB_PID_ATMELICE: u16 = 0x2141;
pub const USB_PID_POWERDEBUGGER: u16 = 0x2144;
pub const USB_PID_EDBG: u16 = 0x2111;
pub const USB_PID_MEDBG: u16 = 0x2145;
pub const USB_PID_PICKIT4: u16 = 0x2177;
pub const USB_PID_SNAP: u16 = 0x2180;

/// PIDs the SNAP presents while still in PIC mode.
pub const USB_PID_SNAP_PIC_MODE: u16 = 0x9018;
/// PIDs the PICkit4 presents while still in PIC mode.
pub const USB_PID_PICKIT4_PIC_MODE: u16 = 0x9012;

pub const USB_EP_OUT: u8 = 0x01;
pub const USB_EP_IN: u8 = 0x82;
pub const USB_EP_EVENT: u8 = 0x83;

/// Turns a failure sub-code into the crate error taxonomy.
pub fn failure_error(engine: &'static str, command: u8, code: u8) -> crate::Error {
    match code {
        RSP3_FAIL_OCD_LOCKED => crate::Error::ChipLocked,
        RSP3_FAIL_NO_TARGET_POWER => crate::Error::NoTargetPower,
        RSP3_FAIL_WRONG_MODE => crate::Error::WrongMode,
        RSP3_FAIL_UNSUPP_MEMORY => {
            crate::Error::UnsupportedMemory(format!("mtype for command 0x{:02x}", command))
        }
        _ => crate::Error::CommandFailed {
            engine,
            command,
            status: code,
        },
    }
}
