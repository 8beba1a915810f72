//! ISP opcode templates for classic parts.
//!
//! Every memory operation on an ISP-programmed part is one 32-bit SPI
//! instruction. The constant bits come from the datasheet; the variable
//! bits are tagged in a 32-token template ("0", "1", "x", "a13", "i",
//! "o") and filled in per call: address bits from the logical address,
//! input bits from the data byte, output bits extracted from the reply.
//!
//! Bit 31 of the template is the first bit on the wire (MSB of the first
//! instruction byte).

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bit {
    Zero,
    One,
    /// Don't care; transmitted as 0.
    Ignore,
    /// Copy of address bit `n`.
    Addr(u8),
    /// Input data bit `n`.
    Input(u8),
    /// Output data bit `n` in the reply.
    Output(u8),
}

/// A parsed 32-bit opcode template.
#[derive(Clone, PartialEq, Eq)]
pub struct Opcode {
    /// Index 0 is template bit 31, the first bit transmitted.
    bits: [Bit; 32],
}

impl std::fmt::Debug for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opcode({:02x?})", self.instr(0, 0))
    }
}

impl Opcode {
    /// Parses a whitespace-separated 32-token template.
    ///
    /// Bare `i` and `o` tokens are numbered by position: the first one seen
    /// is bit 7 of the data byte, the last one bit 0.
    pub fn parse(template: &str) -> Result<Opcode> {
        let tokens: Vec<&str> = template.split_whitespace().collect();
        if tokens.len() != 32 {
            return Err(Error::Config(format!(
                "opcode template has {} bits, expected 32",
                tokens.len()
            )));
        }
        let mut bits = [Bit::Ignore; 32];
        let mut next_in = 8u8;
        let mut next_out = 8u8;
        for (i, tok) in tokens.iter().enumerate() {
            bits[i] = match *tok {
                "0" => Bit::Zero,
                "1" => Bit::One,
                "x" => Bit::Ignore,
                "i" => {
                    next_in -= 1;
                    Bit::Input(next_in)
                }
                "o" => {
                    next_out -= 1;
                    Bit::Output(next_out)
                }
                t if t.starts_with('a') => {
                    let n: u8 = t[1..]
                        .parse()
                        .map_err(|_| Error::Config(format!("bad address bit {:?}", t)))?;
                    if n > 31 {
                        return Err(Error::Config(format!("address bit {} out of range", n)));
                    }
                    Bit::Addr(n)
                }
                t => return Err(Error::Config(format!("bad opcode template token {:?}", t))),
            };
        }
        Ok(Opcode { bits })
    }

    /// Expands the template into the four instruction bytes for `addr` and
    /// `data`. Don't-care bits transmit as 0.
    pub fn instr(&self, addr: u32, data: u8) -> [u8; 4] {
        let mut out = [0u8; 4];
        for (i, bit) in self.bits.iter().enumerate() {
            let set = match *bit {
                Bit::One => true,
                Bit::Zero | Bit::Ignore | Bit::Output(_) => false,
                Bit::Addr(n) => addr & (1 << n) != 0,
                Bit::Input(n) => data & (1 << n) != 0,
            };
            if set {
                out[i / 8] |= 0x80 >> (i % 8);
            }
        }
        out
    }

    /// Recovers the output byte from a four-byte reply by reversing the
    /// template.
    pub fn output(&self, reply: &[u8; 4]) -> u8 {
        let mut data = 0u8;
        for (i, bit) in self.bits.iter().enumerate() {
            if let Bit::Output(n) = *bit {
                if reply[i / 8] & (0x80 >> (i % 8)) != 0 {
                    data |= 1 << n;
                }
            }
        }
        data
    }

    /// The address bits this template consumes, as a mask over the logical
    /// address.
    pub fn addr_mask(&self) -> u32 {
        self.bits.iter().fold(0, |m, b| match *b {
            Bit::Addr(n) => m | (1 << n),
            _ => m,
        })
    }
}

/// Convenience for the catalogue: parse or panic. Templates are compiled-in
/// constants, so a parse failure is a programming error.
pub fn op(template: &str) -> Opcode {
    Opcode::parse(template).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_erase_expands_to_ac80() {
        // Chip erase is all constant bits; don't-cares transmit as zero.
        let op = Opcode::parse(
            "1 0 1 0  1 1 0 0  1 0 0 x  x x x x  x x x x  x x x x  x x x x  x x x x",
        )
        .unwrap();
        assert_eq!(op.instr(0, 0), [0xac, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn program_enable_expands_to_ac53() {
        let op = Opcode::parse(
            "1 0 1 0  1 1 0 0  0 1 0 1  0 0 1 1  x x x x  x x x x  x x x x  x x x x",
        )
        .unwrap();
        assert_eq!(op.instr(0, 0), [0xac, 0x53, 0x00, 0x00]);
    }

    #[test]
    fn address_bits_land_in_place() {
        // Flash read-low for a 16K-word part: a13..a0, output byte last.
        let op = Opcode::parse(
            "0 0 1 0  0 0 0 0  x x a13 a12  a11 a10 a9 a8  a7 a6 a5 a4  a3 a2 a1 a0  o o o o  o o o o",
        )
        .unwrap();
        assert_eq!(op.instr(0x1234, 0), [0x20, 0x12, 0x34, 0x00]);
        assert_eq!(op.addr_mask(), 0x3fff);
    }

    #[test]
    fn input_bits_fill_msb_first() {
        let op = Opcode::parse(
            "1 1 0 0  0 0 0 0  x x x x  x x x x  x x x x  x x x x  i i i i  i i i i",
        )
        .unwrap();
        assert_eq!(op.instr(0, 0xa5), [0xc0, 0x00, 0x00, 0xa5]);
    }

    #[test]
    fn output_extraction_reverses_input_placement() {
        let op = Opcode::parse(
            "0 0 1 1  0 0 0 0  x x x x  x x x x  x x x x  x x x x  o o o o  o o o o",
        )
        .unwrap();
        assert_eq!(op.output(&[0x30, 0x00, 0x00, 0x5a]), 0x5a);
    }

    #[test]
    fn rejects_short_and_bad_templates() {
        assert!(Opcode::parse("0 1 x").is_err());
        assert!(Opcode::parse(&"z ".repeat(32)).is_err());
        assert!(Opcode::parse(&"a99 ".repeat(32)).is_err());
    }
}
