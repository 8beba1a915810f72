//! Scripted transport for engine tests.
//!
//! A script is an ordered list of expected writes; each write, once
//! matched, queues its canned reply into the receive buffer. Input can
//! also be queued directly to model unsolicited traffic such as event
//! frames.

use std::collections::VecDeque;
use std::time::Duration;

use super::Transport;
use crate::utils::HexSlice;
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct MockTransport {
    script: VecDeque<(Vec<u8>, Vec<u8>)>,
    rx: VecDeque<u8>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    /// Queues an expected write and the reply it triggers.
    pub fn expect(&mut self, write: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>) {
        self.script.push_back((write.into(), reply.into()));
    }

    /// Queues input that arrives without a matching write.
    pub fn push_input(&mut self, data: impl Into<Vec<u8>>) {
        self.rx.extend(data.into());
    }

    /// True once every scripted exchange has happened.
    pub fn done(&self) -> bool {
        self.script.is_empty()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let (expected, reply) = self
            .script
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected write: {:?}", HexSlice(data)));
        assert_eq!(
            data,
            &expected[..],
            "write mismatch: got {:?}, expected {:?}",
            HexSlice(data),
            HexSlice(&expected)
        );
        self.rx.extend(reply);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.rx.is_empty() {
            return Err(Error::Timeout("mock read"));
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
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn set_baud(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }

    fn max_transfer(&self) -> usize {
        64
    }
}
