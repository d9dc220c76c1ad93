//! In-memory `Transport` double for exercising the command and device
//! layers without real hardware. Test-only: queues up canned raw frames to
//! hand back from `receive`, and records every frame handed to `send` so a
//! test can assert on exactly what went out on the wire.

use std::time::Duration;

use crate::error::{ErrorKind, Result};
use crate::transport::Transport;

pub struct MockTransport {
    pub sent: Vec<Vec<u8>>,
    replies: Vec<Vec<u8>>,
}

impl MockTransport {
    pub fn new(replies: Vec<Vec<u8>>) -> Self {
        Self {
            sent: Vec::new(),
            replies,
        }
    }
}

impl Transport for MockTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    fn receive(&mut self, out: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.replies.is_empty() {
            return Err(ErrorKind::Timeout);
        }
        let reply = self.replies.remove(0);
        if reply.len() > out.len() {
            return Err(ErrorKind::ProtocolError);
        }
        out[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }

    fn abort(&self) {}

    fn close(&mut self) {}
}

/// Build a normal chip-to-host response frame for `response_code` with the
/// given payload, the same shape `frame::encode` produces.
pub fn response_frame(response_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![response_code];
    body.extend_from_slice(payload);
    let mut out = Vec::new();
    crate::frame::encode(crate::frame::CHIP_TO_HOST, &body, &mut out).unwrap();
    out
}
