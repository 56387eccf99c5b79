// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The outbound CRYPTO byte stream of one encryption level
//!
//! Bytes emitted by the TLS provider are appended into a chain of
//! fixed-size buffers. The packet builder consumes them at the stream's
//! send offset; a CRYPTO frame never crosses a buffer boundary, which
//! bounds frame payloads to 16 KiB without extra copies.

/// Buffers are 16 KiB, the TLS record ceiling
pub const CRYPTO_BUF_SHIFT: usize = 14;
pub const CRYPTO_BUF_SZ: usize = 1 << CRYPTO_BUF_SHIFT;

/// The most CRYPTO bytes allowed in flight per connection
pub const CRYPTO_IN_FLIGHT_MAX: usize = 4096;

#[derive(Debug, Default)]
pub struct CryptoTxStream {
    bufs: Vec<Vec<u8>>,
    /// Total bytes appended to the stream
    size: u64,
    /// Offset of the next byte to hand to the packet builder
    offset: u64,
}

impl CryptoTxStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends provider output, splitting it across buffer boundaries
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let buf = match self.bufs.last_mut() {
                Some(buf) if buf.len() < CRYPTO_BUF_SZ => buf,
                _ => {
                    self.bufs.push(Vec::with_capacity(CRYPTO_BUF_SZ));
                    self.bufs.last_mut().expect("just pushed")
                }
            };
            let room = CRYPTO_BUF_SZ - buf.len();
            let take = room.min(data.len());
            buf.extend_from_slice(&data[..take]);
            self.size += take as u64;
            data = &data[take..];
        }
    }

    /// The stream offset the next built CRYPTO frame starts at
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes appended but not yet handed to the builder
    #[inline]
    pub fn pending(&self) -> u64 {
        self.size - self.offset
    }

    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.pending() == 0
    }

    /// The contiguous bytes available at `offset`, bounded by the
    /// containing buffer
    pub fn chunk_at(&self, offset: u64) -> &[u8] {
        debug_assert!(offset <= self.size);
        let index = (offset >> CRYPTO_BUF_SHIFT) as usize;
        let within = (offset & (CRYPTO_BUF_SZ as u64 - 1)) as usize;
        match self.bufs.get(index) {
            Some(buf) if within < buf.len() => &buf[within..],
            _ => &[],
        }
    }

    /// Marks `len` bytes at the send offset as handed to the builder
    #[inline]
    pub fn advance(&mut self, len: usize) {
        self.offset += len as u64;
        debug_assert!(self.offset <= self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume() {
        let mut stream = CryptoTxStream::new();
        stream.append(b"hello ");
        stream.append(b"world");
        assert_eq!(stream.pending(), 11);
        assert_eq!(stream.chunk_at(0), b"hello world");

        stream.advance(6);
        assert_eq!(stream.offset(), 6);
        assert_eq!(stream.chunk_at(stream.offset()), b"world");
        stream.advance(5);
        assert!(stream.is_consumed());
        assert!(stream.chunk_at(stream.offset()).is_empty());
    }

    #[test]
    fn chunks_never_cross_buffer_boundaries() {
        let mut stream = CryptoTxStream::new();
        stream.append(&vec![0xaa; CRYPTO_BUF_SZ - 3]);
        stream.append(&[0xbb; 8]);

        // the second append fills the first buffer and spills the rest
        let chunk = stream.chunk_at(stream.offset());
        assert_eq!(chunk.len(), CRYPTO_BUF_SZ);
        assert_eq!(&chunk[CRYPTO_BUF_SZ - 3..], &[0xbb, 0xbb, 0xbb]);

        stream.advance(chunk.len());
        assert_eq!(stream.chunk_at(stream.offset()), &[0xbb; 5]);
    }

    #[test]
    fn stream_preserves_bytes() {
        bolero::check!()
            .with_type::<Vec<Vec<u8>>>()
            .for_each(|chunks| {
                let mut stream = CryptoTxStream::new();
                let mut expected = Vec::new();
                for chunk in chunks {
                    stream.append(chunk);
                    expected.extend_from_slice(chunk);
                }

                let mut drained = Vec::new();
                while !stream.is_consumed() {
                    let chunk = stream.chunk_at(stream.offset());
                    assert!(!chunk.is_empty());
                    let take = chunk.len();
                    drained.extend_from_slice(chunk);
                    stream.advance(take);
                }
                assert_eq!(drained, expected);
            });
    }

    #[test]
    fn boundary_math() {
        let mut stream = CryptoTxStream::new();
        stream.append(&vec![1; CRYPTO_BUF_SZ]);
        stream.append(&vec![2; 10]);
        assert_eq!(stream.chunk_at(CRYPTO_BUF_SZ as u64 - 1), &[1]);
        assert_eq!(stream.chunk_at(CRYPTO_BUF_SZ as u64), &[2; 10]);
    }
}
