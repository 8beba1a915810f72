//! UPDI link layer.
//!
//! One wire, 8E2 UART, and every byte the host sends is read back as an
//! echo before the target's answer arrives. The primitives here hide the
//! echo discipline and expose the instruction set: LDCS/STCS for the
//! control/status space, LDS/STS for direct memory access, pointer
//! loads/stores with REP for blocks, and KEY for the activation magic.

use crate::transport::Transport;
use crate::{Error, Result};

use super::constants::*;

pub struct UpdiLink {
    tr: Box<dyn Transport>,
    baud: u32,
}

impl std::fmt::Debug for UpdiLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpdiLink({} baud)", self.baud)
    }
}

impl UpdiLink {
    pub fn new(tr: Box<dyn Transport>, baud: u32) -> UpdiLink {
        UpdiLink { tr, baud }
    }

    /// Sends `data` and consumes the echo, verifying it byte for byte. A
    /// corrupted echo means a collision on the wire.
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.tr.send(data)?;
        let mut echo = vec![0u8; data.len()];
        self.tr.recv_exact(&mut echo)?;
        if echo != data {
            return Err(Error::Framing("UPDI echo mismatch (bus collision?)".into()));
        }
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.tr.recv_exact(buf)
    }

    fn recv_ack(&mut self) -> Result<()> {
        let mut ack = [0u8; 1];
        self.tr.recv_exact(&mut ack)?;
        if ack[0] != PHY_ACK {
            return Err(Error::Protocol(format!(
                "expected UPDI ACK, got 0x{:02x}",
                ack[0]
            )));
        }
        Ok(())
    }

    /// Sends a double BREAK: two 0x00 frames at a crawl baud rate so the
    /// low period outlasts any target-side frame in flight.
    pub fn send_double_break(&mut self) -> Result<()> {
        self.tr.set_baud(BREAK_BAUD)?;
        self.tr.send(&[0x00, 0x00])?;
        // The break reads back as garbage; throw it away.
        let mut scratch = [0u8; 2];
        let _ = self.tr.recv(&mut scratch);
        self.tr.drain()?;
        self.tr.set_baud(self.baud)?;
        Ok(())
    }

    /// Brings the physical layer up: inter-byte delay on, collision
    /// detection off, then a STATUSA read to see whether anyone is there.
    pub fn init(&mut self) -> Result<()> {
        self.stcs(CS_CTRLB, CTRLB_CCDETDIS)?;
        self.stcs(CS_CTRLA, CTRLA_IBDLY)?;
        if self.ldcs(CS_STATUSA)? == 0 {
            return Err(Error::Protocol("no answer from UPDI interface".into()));
        }
        Ok(())
    }

    pub fn ldcs(&mut self, reg: u8) -> Result<u8> {
        self.send(&[PHY_SYNC, OP_LDCS | (reg & 0x0f)])?;
        let mut val = [0u8; 1];
        self.recv_exact(&mut val)?;
        Ok(val[0])
    }

    pub fn stcs(&mut self, reg: u8, value: u8) -> Result<()> {
        self.send(&[PHY_SYNC, OP_STCS | (reg & 0x0f), value])
    }

    fn addr_bytes(addr: u32, wide: bool) -> ([u8; 3], usize, u8) {
        if wide {
            (
                [addr as u8, (addr >> 8) as u8, (addr >> 16) as u8],
                3,
                ADDR_24,
            )
        } else {
            ([addr as u8, (addr >> 8) as u8, 0], 2, ADDR_16)
        }
    }

    /// Direct byte load (LDS).
    pub fn ld8(&mut self, addr: u32, wide: bool) -> Result<u8> {
        let (bytes, n, sz) = Self::addr_bytes(addr, wide);
        let mut cmd = vec![PHY_SYNC, OP_LDS | sz | DATA_8];
        cmd.extend_from_slice(&bytes[..n]);
        self.send(&cmd)?;
        let mut val = [0u8; 1];
        self.recv_exact(&mut val)?;
        Ok(val[0])
    }

    /// Direct byte store (STS); the address and the data are each ACKed.
    pub fn st8(&mut self, addr: u32, wide: bool, value: u8) -> Result<()> {
        let (bytes, n, sz) = Self::addr_bytes(addr, wide);
        let mut cmd = vec![PHY_SYNC, OP_STS | sz | DATA_8];
        cmd.extend_from_slice(&bytes[..n]);
        self.send(&cmd)?;
        self.recv_ack()?;
        self.send(&[value])?;
        self.recv_ack()
    }

    /// Loads the address pointer. The pointer width rides in the data-size
    /// field of the instruction.
    pub fn st_ptr(&mut self, addr: u32, wide: bool) -> Result<()> {
        let width = if wide { DATA_24 } else { DATA_16 };
        let mut cmd = vec![PHY_SYNC, OP_ST | PTR_ADDRESS | width, addr as u8, (addr >> 8) as u8];
        if wide {
            cmd.push((addr >> 16) as u8);
        }
        self.send(&cmd)?;
        self.recv_ack()
    }

    /// Repeat count for the next pointer access; `count` is the number of
    /// units, 1..=256.
    pub fn repeat(&mut self, count: u16) -> Result<()> {
        debug_assert!(count >= 1 && count <= 256);
        self.send(&[PHY_SYNC, OP_REPEAT | DATA_8, (count - 1) as u8])
    }

    /// Block load through the pointer with post-increment.
    pub fn ld_ptr_inc(&mut self, buf: &mut [u8]) -> Result<()> {
        self.send(&[PHY_SYNC, OP_LD | PTR_INC | DATA_8])?;
        self.recv_exact(buf)
    }

    /// Block store through the pointer, byte units, each unit ACKed.
    pub fn st_ptr_inc(&mut self, data: &[u8]) -> Result<()> {
        self.send(&[PHY_SYNC, OP_ST | PTR_INC | DATA_8])?;
        for b in data {
            self.send(&[*b])?;
            self.recv_ack()?;
        }
        Ok(())
    }

    /// Block store through the pointer, word units, little-endian pairs,
    /// one ACK per word.
    pub fn st_ptr_inc16(&mut self, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() % 2, 0);
        self.send(&[PHY_SYNC, OP_ST | PTR_INC | DATA_16])?;
        for w in data.chunks(2) {
            self.send(w)?;
            self.recv_ack()?;
        }
        Ok(())
    }

    /// Sends a 64-bit activation key.
    pub fn key(&mut self, key: &[u8; 8]) -> Result<()> {
        let mut cmd = vec![PHY_SYNC, OP_KEY | KEY_SEND_64];
        cmd.extend_from_slice(key);
        self.send(&cmd)
    }

    /// Requests the 32-byte System Information Block.
    pub fn sib(&mut self) -> Result<[u8; 32]> {
        self.send(&[PHY_SYNC, OP_KEY | KEY_SIB_32])?;
        let mut sib = [0u8; 32];
        self.recv_exact(&mut sib)?;
        Ok(sib)
    }

    pub fn drain(&mut self) -> Result<()> {
        self.tr.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn echo(cmd: &[u8], extra: &[u8]) -> Vec<u8> {
        let mut reply = cmd.to_vec();
        reply.extend_from_slice(extra);
        reply
    }

    #[test]
    fn ldcs_sends_sync_and_reads_value() {
        let mut mock = MockTransport::new();
        let cmd = [PHY_SYNC, OP_LDCS | CS_STATUSA];
        mock.expect(cmd.to_vec(), echo(&cmd, &[0x30]));
        let mut link = UpdiLink::new(Box::new(mock), 115_200);
        assert_eq!(link.ldcs(CS_STATUSA).unwrap(), 0x30);
    }

    #[test]
    fn st8_expects_two_acks() {
        let mut mock = MockTransport::new();
        let cmd = [PHY_SYNC, OP_STS | ADDR_16 | DATA_8, 0x00, 0x10];
        mock.expect(cmd.to_vec(), echo(&cmd, &[PHY_ACK]));
        mock.expect(vec![0xa5], echo(&[0xa5], &[PHY_ACK]));
        let mut link = UpdiLink::new(Box::new(mock), 115_200);
        link.st8(0x1000, false, 0xa5).unwrap();
    }

    #[test]
    fn st8_rejects_missing_ack() {
        let mut mock = MockTransport::new();
        let cmd = [PHY_SYNC, OP_STS | ADDR_16 | DATA_8, 0x00, 0x10];
        mock.expect(cmd.to_vec(), echo(&cmd, &[0x00]));
        let mut link = UpdiLink::new(Box::new(mock), 115_200);
        assert!(link.st8(0x1000, false, 0xa5).is_err());
    }

    #[test]
    fn echo_mismatch_is_a_collision() {
        let mut mock = MockTransport::new();
        let cmd = [PHY_SYNC, OP_LDCS | CS_STATUSA];
        mock.expect(cmd.to_vec(), vec![PHY_SYNC, 0xff, 0x30]);
        let mut link = UpdiLink::new(Box::new(mock), 115_200);
        assert!(link.ldcs(CS_STATUSA).is_err());
    }

    #[test]
    fn wide_addresses_use_24_bit_form() {
        let mut mock = MockTransport::new();
        let cmd = [PHY_SYNC, OP_LDS | ADDR_24 | DATA_8, 0x56, 0x34, 0x12];
        mock.expect(cmd.to_vec(), echo(&cmd, &[0x77]));
        let mut link = UpdiLink::new(Box::new(mock), 115_200);
        assert_eq!(link.ld8(0x123456, true).unwrap(), 0x77);
    }
}
