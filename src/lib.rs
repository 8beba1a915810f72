//! A host-side driver for the on-chip memories of AVR microcontrollers.
//!
//! This crate talks to the flash, EEPROM, fuse, lock and signature memories
//! of classic AVR and modern AVR8X parts through a number of programmer
//! dongles: JTAGICE3-class debuggers (including their EDBG/CMSIS-DAP
//! incarnations), raw serial UPDI adapters, FLIP v2 DFU bootloaders,
//! STK500v1/v2 boxes, AVR-Doper, and plain spidev ISP wiring on Linux.
//!
//! All backends present the same memory-oriented [`Programmer`] interface,
//! so the driver layer and the bundled `avrmem-util` binary do not care
//! which wire protocol is underneath.
//!
//! Contributions are welcome!
//!
//! [`Programmer`]: programmer/trait.Programmer.html

#![doc(html_root_url = "https://docs.rs/avr-memory/0.2.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod cache;
mod error;
mod utils;

pub mod driver;
pub mod dryrun;
pub mod flip2;
pub mod jtagice3;
#[cfg(target_os = "linux")]
pub mod linuxspi;
pub mod opcode;
pub mod part;
pub mod parts;
pub mod programmer;
pub mod stk500;
pub mod stk500v2;
pub mod transport;
pub mod updi;

pub use crate::error::{Error, Result};
pub use crate::part::{Memory, Part, ProgModes};
pub use crate::programmer::{ExtraFeatures, Programmer};
