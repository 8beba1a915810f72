use thiserror::Error;

/// Alias for a `Result` with the crate-wide error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type used by this library.
///
/// This can encapsulate a transport (serial, HID, USB) error, and adds the
/// wire-protocol, target and contract errors on top of that. A locked
/// target is deliberately its own variant: it is the one failure the driver
/// layer may recover from by running a chip erase first.
#[derive(Debug, Error)]
pub enum Error {
    // --- transport ---
    /// Byte-level I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port layer reported an error.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A USB bulk or control transfer failed.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// A HID report transfer failed.
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    /// No reply arrived within the receive timeout.
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    /// A reply arrived but was shorter than the protocol requires.
    #[error("short reply: expected {expected} bytes, got {got}")]
    ShortReply { expected: usize, got: usize },

    /// The on-wire framing did not match the protocol.
    #[error("framing error: {0}")]
    Framing(String),

    // --- protocol ---
    /// The programmer answered, but with something the protocol forbids.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The programmer rejected a command with an explicit status code.
    #[error("{engine}: command 0x{command:02x} failed, status 0x{status:02x}")]
    CommandFailed {
        engine: &'static str,
        command: u8,
        status: u8,
    },

    // --- target ---
    /// The device is locked. Recoverable: erase the chip, then retry.
    #[error("device is locked; chip erase required to unlock")]
    ChipLocked,

    /// The programmer sees no supply voltage on the target.
    #[error("no target power detected")]
    NoTargetPower,

    /// The session is not in the right mode for this operation.
    #[error("wrong mode for this operation")]
    WrongMode,

    /// The connection in use cannot reach this memory.
    #[error("memory {0:?} is not accessible over this connection")]
    UnsupportedMemory(String),

    // --- contract (detected before any wire traffic) ---
    #[error("address 0x{addr:x} out of range for {mem:?} (size 0x{size:x})")]
    AddressOutOfRange { mem: String, addr: u32, size: u32 },

    #[error("part {part} has no memory named {mem:?}")]
    NoSuchMemory { part: String, mem: String },

    #[error("memory {0:?} is read-only")]
    WriteProtected(String),

    // --- configuration ---
    #[error("unknown part {0:?}")]
    UnknownPart(String),

    #[error("unknown programmer {0:?}")]
    UnknownProgrammer(String),

    #[error("programmer and part have no programming mode in common")]
    NoCommonMode,

    #[error("programmer and part share more than one programming mode; pick one or pass --force")]
    AmbiguousMode,

    /// Target signature does not match the part record.
    #[error("signature mismatch: expected {expected:02x?}, device reads {got:02x?}")]
    SignatureMismatch { expected: [u8; 3], got: [u8; 3] },

    /// Catch-all for bad user-supplied configuration values.
    #[error("{0}")]
    Config(String),

    /// The backend does not implement this operation at all.
    #[error("operation {0:?} not supported by this programmer")]
    Unsupported(&'static str),
}

impl Error {
    /// True for the soft failure that a chip erase is allowed to clear.
    pub fn is_chip_locked(&self) -> bool {
        matches!(self, Error::ChipLocked)
    }

    /// Process exit code for the CLI: 1 generic, 2 locked, 3 unsupported.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ChipLocked => 2,
            Error::Unsupported(_) | Error::UnsupportedMemory(_) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::ChipLocked.exit_code(), 2);
        assert_eq!(Error::Unsupported("page_erase").exit_code(), 3);
        assert_eq!(Error::NoCommonMode.exit_code(), 1);
        assert_eq!(Error::Timeout("sign-on").exit_code(), 1);
    }

    #[test]
    fn chip_locked_is_soft() {
        assert!(Error::ChipLocked.is_chip_locked());
        assert!(!Error::NoTargetPower.is_chip_locked());
    }
}
