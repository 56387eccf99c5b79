// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection output buffer ring
//!
//! A fixed, power-of-two count of equally sized buffers. The packet
//! builder fills the writer buffer (several coalesced packets may share
//! one buffer, which becomes one datagram); the tasklet drains the reader
//! side through the transport and resets each buffer after a successful
//! send. Packets of different connections never share a buffer.

use crate::config::TX_BUF_SZ;

#[derive(Debug)]
pub struct TxBuf {
    data: Vec<u8>,
    len: usize,
}

impl TxBuf {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The unwritten tail of the buffer
    #[inline]
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    #[inline]
    pub fn room(&self) -> usize {
        self.data.len() - self.len
    }

    /// Commits `len` bytes written into `space()`
    #[inline]
    pub fn commit(&mut self, len: usize) {
        debug_assert!(self.len + len <= self.data.len());
        self.len += len;
    }

    #[inline]
    pub fn contents(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    fn reset(&mut self) {
        self.len = 0;
    }
}

#[derive(Debug)]
pub struct TxBufferRing {
    bufs: Vec<TxBuf>,
    wbuf: usize,
    rbuf: usize,
}

impl TxBufferRing {
    pub fn new(count: usize) -> Self {
        assert!(count.is_power_of_two());
        Self {
            bufs: (0..count).map(|_| TxBuf::new(TX_BUF_SZ)).collect(),
            wbuf: 0,
            rbuf: 0,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.bufs.len() - 1
    }

    /// The buffer the builder is currently writing
    #[inline]
    pub fn wbuf(&mut self) -> &mut TxBuf {
        let index = self.wbuf;
        &mut self.bufs[index]
    }

    /// Rotates the writer to the next buffer
    ///
    /// Returns `false` when the ring is full: the next slot still holds
    /// an unsent datagram.
    pub fn advance_wbuf(&mut self) -> bool {
        let next = (self.wbuf + 1) & self.mask();
        if next == self.rbuf && !self.bufs[self.rbuf].is_empty() {
            return false;
        }
        if !self.bufs[next].is_empty() {
            return false;
        }
        self.wbuf = next;
        true
    }

    /// The next unsent datagram, if any
    pub fn rbuf(&self) -> Option<&[u8]> {
        let buf = &self.bufs[self.rbuf];
        if buf.is_empty() {
            None
        } else {
            Some(buf.contents())
        }
    }

    /// Releases the reader buffer after a successful send
    pub fn release_rbuf(&mut self) {
        let index = self.rbuf;
        self.bufs[index].reset();
        if index != self.wbuf {
            self.rbuf = (index + 1) & self.mask();
        }
    }

    /// True when every buffer has been drained
    pub fn is_drained(&self) -> bool {
        self.bufs.iter().all(TxBuf::is_empty)
    }

    /// Finish the current writer buffer so it becomes visible to the
    /// reader even when not full
    pub fn flush_wbuf(&mut self) {
        if !self.bufs[self.wbuf].is_empty() {
            self.advance_wbuf();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(datagrams: &[&[u8]]) -> TxBufferRing {
        let mut ring = TxBufferRing::new(4);
        for datagram in datagrams {
            let buf = ring.wbuf();
            buf.space()[..datagram.len()].copy_from_slice(datagram);
            buf.commit(datagram.len());
            ring.advance_wbuf();
        }
        ring
    }

    #[test]
    fn write_then_drain() {
        let mut ring = ring_with(&[b"one", b"two"]);
        assert_eq!(ring.rbuf(), Some(&b"one"[..]));
        ring.release_rbuf();
        assert_eq!(ring.rbuf(), Some(&b"two"[..]));
        ring.release_rbuf();
        assert_eq!(ring.rbuf(), None);
        assert!(ring.is_drained());
    }

    #[test]
    fn ring_refuses_to_overrun_reader() {
        let mut ring = TxBufferRing::new(2);
        for _ in 0..2 {
            let buf = ring.wbuf();
            buf.space()[0] = 1;
            buf.commit(1);
            if !ring.advance_wbuf() {
                break;
            }
        }
        // both slots hold unsent data; the writer must stall
        assert!(!ring.advance_wbuf());
        ring.release_rbuf();
        assert!(ring.rbuf().is_some());
    }

    #[test]
    fn coalesced_packets_share_a_buffer() {
        let mut ring = TxBufferRing::new(4);
        let buf = ring.wbuf();
        buf.space()[..3].copy_from_slice(b"abc");
        buf.commit(3);
        buf.space()[..3].copy_from_slice(b"def");
        buf.commit(3);
        ring.flush_wbuf();
        assert_eq!(ring.rbuf(), Some(&b"abcdef"[..]));
    }
}
