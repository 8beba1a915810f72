//! EDBG vendor framing for CMSIS-DAP class dongles.
//!
//! The raw JTAGICE3 frame rides inside vendor reports: each fragment is
//! `[vendor-cmd][ (index<<4) | total ][lenBE16][payload…]`, padded so that
//! every USB transfer is exactly the report size. Responses are polled
//! with an AVR_RSP request; a zero status byte means nothing is ready
//! yet.

use std::time::Duration;

use crate::transport::Transport;
use crate::utils::HexSlice;
use crate::{Error, Result};

pub const VENDOR_AVR_CMD: u8 = 0x80;
pub const VENDOR_AVR_RSP: u8 = 0x81;
pub const VENDOR_AVR_EVT: u8 = 0x82;

// CMSIS-DAP plumbing used while bringing the session up.
pub const DAP_CMD_LED: u8 = 0x01;
pub const DAP_CMD_CONNECT: u8 = 0x02;
pub const DAP_CONNECT_SWD: u8 = 0x01;

/// How often the response poll is retried before giving up.
const POLL_RETRIES: u32 = 50;

/// CMSIS-DAP connect plus an LED blink, the handshake the firmware wants
/// before it talks JTAGICE3.
pub fn prepare(tr: &mut dyn Transport) -> Result<()> {
    tr.send(&[DAP_CMD_CONNECT, DAP_CONNECT_SWD])?;
    let mut resp = [0u8; 2];
    tr.recv_exact(&mut resp)?;
    if resp[0] != DAP_CMD_CONNECT || resp[1] == 0 {
        return Err(Error::Protocol(format!(
            "CMSIS-DAP connect refused: {:?}",
            HexSlice(resp)
        )));
    }
    tr.send(&[DAP_CMD_LED, 0x00, 0x01])?;
    let mut led = [0u8; 2];
    tr.recv_exact(&mut led)?;
    Ok(())
}

/// Sends one raw JTAGICE3 frame, fragmented to the transport's transfer
/// unit. The four vendor header bytes ride in every fragment, so the
/// first USB packet spends eight bytes on headers (vendor plus envelope)
/// and later ones four.
pub fn send_frame(tr: &mut dyn Transport, raw: &[u8]) -> Result<()> {
    let max = tr.max_transfer().max(16);
    let chunk_len = max - 4;
    let total = (raw.len() + chunk_len - 1) / chunk_len;
    if total > 15 {
        return Err(Error::Framing(format!(
            "frame of {} bytes needs {} fragments, limit is 15",
            raw.len(),
            total
        )));
    }
    for (index, chunk) in raw.chunks(chunk_len).enumerate() {
        let mut packet = vec![0u8; max];
        packet[0] = VENDOR_AVR_CMD;
        packet[1] = (((index + 1) as u8) << 4) | total as u8;
        packet[2] = (chunk.len() >> 8) as u8;
        packet[3] = chunk.len() as u8;
        packet[4..4 + chunk.len()].copy_from_slice(chunk);
        tr.send(&packet)?;
    }
    Ok(())
}

/// Polls for and reassembles one response frame.
///
/// Fragment indices are 1-based and must arrive in order; the total
/// must be identical in every fragment or the transaction is abandoned.
pub fn recv_frame(tr: &mut dyn Transport) -> Result<Vec<u8>> {
    let max = tr.max_transfer().max(16);
    let mut assembled = Vec::new();
    let mut expect_index = 1u8;
    let mut expect_total = 0u8;

    loop {
        let mut polls = 0;
        let mut packet = vec![0u8; max];
        let n = loop {
            tr.send(&[VENDOR_AVR_RSP])?;
            let n = tr.recv(&mut packet)?;
            if n >= 1 && packet[0] == VENDOR_AVR_RSP && n >= 2 && packet[1] != 0 {
                break n;
            }
            polls += 1;
            if polls > POLL_RETRIES {
                return Err(Error::Timeout("EDBG response"));
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        if n < 4 {
            return Err(Error::ShortReply {
                expected: 4,
                got: n,
            });
        }
        let index = packet[1] >> 4;
        let total = packet[1] & 0x0f;
        if expect_total == 0 {
            expect_total = total;
        } else if total != expect_total {
            return Err(Error::Framing("Inconsistent # of fragments".into()));
        }
        if index != expect_index {
            return Err(Error::Framing(format!(
                "EDBG fragment {} arrived, expected {}",
                index, expect_index
            )));
        }
        let this_len = ((packet[2] as usize) << 8) | packet[3] as usize;
        if 4 + this_len > n {
            return Err(Error::ShortReply {
                expected: 4 + this_len,
                got: n,
            });
        }
        // Drop the four header bytes so the caller gets one contiguous
        // buffer.
        assembled.extend_from_slice(&packet[4..4 + this_len]);
        if index == total {
            return Ok(assembled);
        }
        expect_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn fragment(index: u8, total: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 64];
        pkt[0] = VENDOR_AVR_RSP;
        pkt[1] = (index << 4) | total;
        pkt[2] = (payload.len() >> 8) as u8;
        pkt[3] = payload.len() as u8;
        pkt[4..4 + payload.len()].copy_from_slice(payload);
        pkt
    }

    #[test]
    fn send_pads_every_transfer_to_max() {
        let mut mock = MockTransport::new();
        let raw = vec![0x11u8; 100];
        // 100 bytes over 60-byte chunks: fragments of 60 and 40.
        let mut p1 = vec![0u8; 64];
        p1[0] = VENDOR_AVR_CMD;
        p1[1] = 0x12;
        p1[2] = 0;
        p1[3] = 60;
        p1[4..64].copy_from_slice(&raw[..60]);
        let mut p2 = vec![0u8; 64];
        p2[0] = VENDOR_AVR_CMD;
        p2[1] = 0x22;
        p2[2] = 0;
        p2[3] = 40;
        p2[4..44].copy_from_slice(&raw[60..]);
        mock.expect(p1, Vec::new());
        mock.expect(p2, Vec::new());
        send_frame(&mut mock, &raw).unwrap();
        assert!(mock.done());
    }

    #[test]
    fn receive_reassembles_in_order() {
        let mut mock = MockTransport::new();
        let part1 = vec![0xaau8; 60];
        let part2 = vec![0xbbu8; 13];
        mock.expect(vec![VENDOR_AVR_RSP], fragment(1, 2, &part1));
        mock.expect(vec![VENDOR_AVR_RSP], fragment(2, 2, &part2));
        let frame = recv_frame(&mut mock).unwrap();
        assert_eq!(frame.len(), 73);
        assert_eq!(&frame[..60], &part1[..]);
        assert_eq!(&frame[60..], &part2[..]);
    }

    #[test]
    fn receive_polls_through_empty_status() {
        let mut mock = MockTransport::new();
        // First poll: nothing ready (status byte zero).
        mock.expect(vec![VENDOR_AVR_RSP], vec![VENDOR_AVR_RSP, 0x00]);
        mock.expect(vec![VENDOR_AVR_RSP], fragment(1, 1, &[0x0e, 1, 0, 0x12, 0x80]));
        let frame = recv_frame(&mut mock).unwrap();
        assert_eq!(frame, vec![0x0e, 1, 0, 0x12, 0x80]);
    }

    #[test]
    fn fragment_total_mismatch_aborts() {
        let mut mock = MockTransport::new();
        mock.expect(vec![VENDOR_AVR_RSP], fragment(1, 2, &[0x01]));
        mock.expect(vec![VENDOR_AVR_RSP], fragment(2, 3, &[0x02]));
        let err = recv_frame(&mut mock).unwrap_err();
        assert!(format!("{}", err).contains("Inconsistent # of fragments"));
    }

    #[test]
    fn out_of_order_fragment_aborts() {
        let mut mock = MockTransport::new();
        mock.expect(vec![VENDOR_AVR_RSP], fragment(2, 2, &[0x01]));
        assert!(recv_frame(&mut mock).is_err());
    }
}
