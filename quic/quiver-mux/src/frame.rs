// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The 9-byte frame header codec and wire constants

use quiver_codec::{DecoderBuffer, DecoderBufferResult, Encoder, EncoderValue};

/// `{len[24], type[8], flags[8], sid[31]}`
pub const FRAME_HEADER_LEN: usize = 9;

/// The connection preface every client opens with
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FT_DATA: u8 = 0x0;
pub const FT_HEADERS: u8 = 0x1;
pub const FT_PRIORITY: u8 = 0x2;
pub const FT_RST_STREAM: u8 = 0x3;
pub const FT_SETTINGS: u8 = 0x4;
pub const FT_PUSH_PROMISE: u8 = 0x5;
pub const FT_PING: u8 = 0x6;
pub const FT_GOAWAY: u8 = 0x7;
pub const FT_WINDOW_UPDATE: u8 = 0x8;
pub const FT_CONTINUATION: u8 = 0x9;

// frame flags; meaning depends on the frame type
pub const FL_END_STREAM: u8 = 0x01;
pub const FL_ACK: u8 = 0x01;
pub const FL_END_HEADERS: u8 = 0x04;
pub const FL_PADDED: u8 = 0x08;
pub const FL_PRIORITY: u8 = 0x20;

// settings identifiers
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// The default connection receive window; only WINDOW_UPDATE enlarges it
pub const INITIAL_WINDOW_SIZE: i32 = 65_535;

/// Largest legal window: 2^31 - 1
pub const MAX_WINDOW_SIZE: i32 = i32::MAX;

/// Pretend increment advertised once to open the connection window from
/// 65535 to the maximum
pub const INITIAL_WINDOW_INCREMENT: u32 = (MAX_WINDOW_SIZE - INITIAL_WINDOW_SIZE) as u32;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub len: u32,
    pub ty: u8,
    pub flags: u8,
    pub sid: i32,
}

impl FrameHeader {
    pub fn decode(buffer: DecoderBuffer<'_>) -> DecoderBufferResult<'_, Self> {
        let (bytes, buffer) = buffer.decode_slice(FRAME_HEADER_LEN)?;
        let len = u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]);
        let ty = bytes[3];
        let flags = bytes[4];
        let sid = (u32::from(bytes[5]) << 24
            | u32::from(bytes[6]) << 16
            | u32::from(bytes[7]) << 8
            | u32::from(bytes[8])) as i32
            & 0x7fff_ffff;
        Ok((Self { len, ty, flags, sid }, buffer))
    }
}

impl EncoderValue for FrameHeader {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        debug_assert!(self.len <= 0x00ff_ffff);
        encoder.encode(&((self.len >> 16) as u8));
        encoder.encode(&((self.len >> 8) as u8));
        encoder.encode(&(self.len as u8));
        encoder.encode(&self.ty);
        encoder.encode(&self.flags);
        encoder.encode(&(self.sid as u32 & 0x7fff_ffff));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_codec::EncoderBuffer;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            len: 0x01_0203,
            ty: FT_HEADERS,
            flags: FL_END_HEADERS | FL_END_STREAM,
            sid: 0x7fff_fffe,
        };

        let mut data = [0u8; FRAME_HEADER_LEN];
        let mut encoder = EncoderBuffer::new(&mut data);
        encoder.encode(&header);
        assert_eq!(encoder.len(), FRAME_HEADER_LEN);

        let (decoded, rest) = FrameHeader::decode(DecoderBuffer::new(&data)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, header);
    }

    #[test]
    fn reserved_sid_bit_is_masked() {
        let data = [0, 0, 0, FT_DATA, 0, 0x80, 0, 0, 1];
        let (decoded, _) = FrameHeader::decode(DecoderBuffer::new(&data)).unwrap();
        assert_eq!(decoded.sid, 1);
    }
}
