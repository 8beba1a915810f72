//! AVR-Doper framing: a serial byte stream tunnelled through HID reports.
//!
//! The Doper defines four report sizes and picks the smallest one that
//! fits the chunk at hand. Each report is `[report-id][chunk-length]
//! [payload…]`, zero-padded to the report size; received reports may be
//! partially filled and are reassembled into a byte stream here.

use std::collections::VecDeque;
use std::time::Duration;

use super::Transport;
use crate::{Error, Result};

/// Report payload capacities are the report size minus the two header
/// bytes.
const REPORT_SIZES: [usize; 4] = [13, 29, 61, 125];

/// Report id for each size; 1-based index into [`REPORT_SIZES`].
fn report_id(size: usize) -> u8 {
    (REPORT_SIZES.iter().position(|&s| s == size).unwrap() + 1) as u8
}

/// Picks the smallest report that carries `len` payload bytes, or the
/// largest one for oversized chunks (which are then split).
fn pick_report(len: usize) -> usize {
    REPORT_SIZES
        .iter()
        .copied()
        .find(|&s| s - 2 >= len)
        .unwrap_or(REPORT_SIZES[3])
}

pub struct DoperTransport {
    inner: Box<dyn Transport>,
    rx: VecDeque<u8>,
}

impl std::fmt::Debug for DoperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DoperTransport({} buffered)", self.rx.len())
    }
}

impl DoperTransport {
    /// Wraps a HID (or scripted) transport in Doper framing.
    pub fn new(inner: Box<dyn Transport>) -> DoperTransport {
        DoperTransport {
            inner,
            rx: VecDeque::new(),
        }
    }

    fn refill(&mut self) -> Result<()> {
        let mut report = [0u8; 126];
        let n = self.inner.recv(&mut report)?;
        if n < 2 {
            return Err(Error::Framing("Doper report shorter than its header".into()));
        }
        let id = report[0] as usize;
        if id == 0 || id > REPORT_SIZES.len() {
            return Err(Error::Framing(format!("bad Doper report id {}", report[0])));
        }
        let len = report[1] as usize;
        if len > REPORT_SIZES[id - 1] - 2 || 2 + len > n {
            return Err(Error::Framing(format!(
                "Doper report id {} claims {} payload bytes",
                id, len
            )));
        }
        self.rx.extend(&report[2..2 + len]);
        Ok(())
    }
}

impl Transport for DoperTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(REPORT_SIZES[3] - 2) {
            let size = pick_report(chunk.len());
            let mut report = vec![0u8; size];
            report[0] = report_id(size);
            report[1] = chunk.len() as u8;
            report[2..2 + chunk.len()].copy_from_slice(chunk);
            self.inner.send(&report)?;
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.rx.is_empty() {
            self.refill()?;
        }
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn drain(&mut self) -> Result<()> {
        self.rx.clear();
        self.inner.drain()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.inner.set_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn report_selection() {
        assert_eq!(pick_report(0), 13);
        assert_eq!(pick_report(11), 13);
        assert_eq!(pick_report(12), 29);
        assert_eq!(pick_report(59), 61);
        assert_eq!(pick_report(60), 125);
        assert_eq!(pick_report(500), 125);
    }

    #[test]
    fn short_write_uses_smallest_report() {
        let mut mock = MockTransport::new();
        let mut expected = vec![0u8; 13];
        expected[0] = 1;
        expected[1] = 3;
        expected[2..5].copy_from_slice(&[0xaa, 0xbb, 0xcc]);
        mock.expect(expected, Vec::new());

        let mut doper = DoperTransport::new(Box::new(mock));
        doper.send(&[0xaa, 0xbb, 0xcc]).unwrap();
    }

    #[test]
    fn receive_reassembles_partial_reports() {
        let mut mock = MockTransport::new();
        // Two partially-filled reports carrying 2 + 3 bytes.
        let mut r1 = vec![0u8; 13];
        r1[0] = 1;
        r1[1] = 2;
        r1[2..4].copy_from_slice(&[0x01, 0x02]);
        let mut r2 = vec![0u8; 13];
        r2[0] = 1;
        r2[1] = 3;
        r2[2..5].copy_from_slice(&[0x03, 0x04, 0x05]);
        mock.push_input(r1);
        mock.push_input(r2);

        let mut doper = DoperTransport::new(Box::new(mock));
        let mut buf = [0u8; 5];
        doper.recv_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn rejects_bad_report_id() {
        let mut mock = MockTransport::new();
        mock.push_input(vec![9u8, 1, 0xaa]);
        let mut doper = DoperTransport::new(Box::new(mock));
        let mut buf = [0u8; 1];
        assert!(doper.recv(&mut buf).is_err());
    }
}
