// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The internal HTTP representation exchanged with the upper stream
//! layer
//!
//! Only the block shapes the mux touches are modeled: a start line,
//! headers, data, trailers and an end-of-message marker. Data blocks
//! keep their payload in `Bytes` so the emission path can move a whole
//! block without copying it.

use crate::hpack::Header;
use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Block {
    /// Request start line, split into the HTTP/2 pseudo-header parts
    ReqStart {
        method: Vec<u8>,
        scheme: Vec<u8>,
        authority: Vec<u8>,
        path: Vec<u8>,
    },
    /// Response start line
    ResStart { status: u16 },
    Header(Header),
    Data(Bytes),
    Trailer(Header),
    /// End of message
    Eom,
}

/// An HTTP message as a block sequence
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    blocks: VecDeque<Block>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push_back(block);
    }

    pub fn front(&self) -> Option<&Block> {
        self.blocks.front()
    }

    pub fn pop(&mut self) -> Option<Block> {
        self.blocks.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Total payload bytes across data blocks
    pub fn data_len(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| match block {
                Block::Data(data) => data.len(),
                _ => 0,
            })
            .sum()
    }

    /// The zero-copy hook: when the message currently holds exactly one
    /// data block (optionally followed by EOM), take it whole
    pub fn take_single_data_block(&mut self) -> Option<(Bytes, bool)> {
        match (self.blocks.front(), self.blocks.len()) {
            (Some(Block::Data(_)), 1) => {
                let Some(Block::Data(data)) = self.blocks.pop_front() else {
                    unreachable!()
                };
                Some((data, false))
            }
            (Some(Block::Data(_)), 2) if matches!(self.blocks.get(1), Some(Block::Eom)) => {
                let Some(Block::Data(data)) = self.blocks.pop_front() else {
                    unreachable!()
                };
                self.blocks.pop_front();
                Some((data, true))
            }
            _ => None,
        }
    }
}

impl Extend<Block> for Message {
    fn extend<T: IntoIterator<Item = Block>>(&mut self, iter: T) {
        self.blocks.extend(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_block_is_taken_whole() {
        let mut message = Message::new();
        message.push(Block::Data(Bytes::from_static(b"payload")));
        let (data, eom) = message.take_single_data_block().unwrap();
        assert_eq!(data, Bytes::from_static(b"payload"));
        assert!(!eom);
        assert!(message.is_empty());
    }

    #[test]
    fn data_plus_eom_is_taken_whole() {
        let mut message = Message::new();
        message.push(Block::Data(Bytes::from_static(b"payload")));
        message.push(Block::Eom);
        let (_, eom) = message.take_single_data_block().unwrap();
        assert!(eom);
        assert!(message.is_empty());
    }

    #[test]
    fn mixed_blocks_are_not_taken() {
        let mut message = Message::new();
        message.push(Block::ResStart { status: 200 });
        message.push(Block::Data(Bytes::from_static(b"payload")));
        assert!(message.take_single_data_block().is_none());
        assert_eq!(message.len(), 2);
        assert_eq!(message.data_len(), 7);
    }
}
