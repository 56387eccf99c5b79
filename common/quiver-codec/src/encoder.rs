// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, NetworkEndian};

/// A sink wire values can be encoded into
pub trait Encoder: Sized {
    /// Encode the given `EncoderValue` into the buffer
    #[inline]
    fn encode<T: EncoderValue>(&mut self, value: &T) {
        value.encode(self)
    }

    /// Encode the given `EncoderValue` with a prefix of `Len`
    #[inline]
    fn encode_with_len_prefix<Len, T: EncoderValue>(&mut self, value: &T)
    where
        Len: TryFrom<usize> + EncoderValue,
        Len::Error: core::fmt::Debug,
    {
        let len = Len::try_from(value.encoding_size()).expect("length prefix out of range");
        self.encode(&len);
        self.encode(value);
    }

    /// Calls `write` with a slice of `len` bytes at the current write position
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, write: F);

    /// Copies the slice into the buffer
    fn write_slice(&mut self, slice: &[u8]);

    /// Repeatedly write a byte `value` for a given `count`
    fn write_repeated(&mut self, count: usize, value: u8);

    /// Returns the total buffer capacity
    fn capacity(&self) -> usize;

    /// Returns the number of bytes written to the buffer
    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of available bytes in the buffer
    #[inline]
    fn remaining_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }
}

/// A value which can be encoded into an [`Encoder`]
pub trait EncoderValue: Sized {
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// The number of bytes `encode` will write
    #[inline]
    fn encoding_size(&self) -> usize {
        let mut counter = LenCounter::default();
        self.encode(&mut counter);
        counter.0
    }
}

/// An [`Encoder`] that only counts written bytes
#[derive(Debug, Default)]
pub struct LenCounter(usize);

impl Encoder for LenCounter {
    #[inline]
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, _write: F) {
        self.0 += len;
    }

    #[inline]
    fn write_slice(&mut self, slice: &[u8]) {
        self.0 += slice.len();
    }

    #[inline]
    fn write_repeated(&mut self, count: usize, _value: u8) {
        self.0 += count;
    }

    #[inline]
    fn capacity(&self) -> usize {
        usize::MAX
    }

    #[inline]
    fn len(&self) -> usize {
        self.0
    }
}

/// An [`Encoder`] over a mutable byte slice
///
/// Writing past the end of the slice panics, the same contract as the
/// slice indexing it wraps. Callers are expected to check
/// `remaining_capacity` before committing a value whose size is not
/// statically known.
#[derive(Debug)]
pub struct EncoderBuffer<'a> {
    bytes: &'a mut [u8],
    position: usize,
}

impl<'a> EncoderBuffer<'a> {
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Sets the write position of the buffer
    #[inline]
    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.bytes.len());
        self.position = position;
    }

    /// Splits off the used and unused parts of the buffer
    #[inline]
    pub fn split_mut(self) -> (&'a mut [u8], &'a mut [u8]) {
        self.bytes.split_at_mut(self.position)
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.position]
    }
}

impl Encoder for EncoderBuffer<'_> {
    #[inline]
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, write: F) {
        let end = self.position + len;
        write(&mut self.bytes[self.position..end]);
        self.position = end;
    }

    #[inline]
    fn write_slice(&mut self, slice: &[u8]) {
        self.write_sized(slice.len(), |bytes| bytes.copy_from_slice(slice));
    }

    #[inline]
    fn write_repeated(&mut self, count: usize, value: u8) {
        self.write_sized(count, |bytes| {
            for byte in bytes.iter_mut() {
                *byte = value;
            }
        });
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    fn len(&self) -> usize {
        self.position
    }
}

macro_rules! encoder_int {
    ($ty:ident, $len:expr, $write:ident) => {
        impl EncoderValue for $ty {
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                encoder.write_sized($len, |bytes| NetworkEndian::$write(bytes, *self));
            }
        }
    };
}

impl EncoderValue for u8 {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_sized(1, |bytes| bytes[0] = *self);
    }
}

encoder_int!(u16, 2, write_u16);
encoder_int!(u32, 4, write_u32);
encoder_int!(u64, 8, write_u64);

impl EncoderValue for &[u8] {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self);
    }
}

impl<T: EncoderValue> EncoderValue for &T {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        (*self).encode(encoder)
    }
}
