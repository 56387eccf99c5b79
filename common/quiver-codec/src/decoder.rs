// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

/// Errors that can occur while decoding a buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderError {
    /// The buffer did not contain enough bytes for the requested value
    UnexpectedEof(usize),
    /// The buffer contained bytes after the value was decoded
    UnexpectedBytes(usize),
    /// A length prefix exceeded what the platform can address
    LengthCapacityExceeded,
    /// A decoded value violated an invariant of its type
    InvariantViolation(&'static str),
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnexpectedEof(len) => write!(f, "unexpected eof: {len}"),
            Self::UnexpectedBytes(len) => write!(f, "unexpected bytes: {len}"),
            Self::LengthCapacityExceeded => write!(f, "length prefix exceeded capacity"),
            Self::InvariantViolation(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecoderError {}

pub type DecoderBufferResult<'a, T> = Result<(T, DecoderBuffer<'a>), DecoderError>;

/// A value which can be decoded from a [`DecoderBuffer`]
pub trait DecoderValue<'a>: Sized {
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self>;
}

/// A value whose decoding depends on an out-of-band parameter, e.g. a
/// frame tag that has already been consumed from the buffer.
pub trait DecoderParameterizedValue<'a>: Sized {
    type Parameter;

    fn decode_parameterized(
        parameter: Self::Parameter,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self>;
}

/// An immutable view over a byte slice
///
/// All operations are panic-free: any read past the end of the slice
/// returns [`DecoderError::UnexpectedEof`]. Decoding splits the buffer,
/// returning the value together with the remaining bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

impl fmt::Debug for DecoderBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DecoderBuffer(len={})", self.bytes.len())
    }
}

impl<'a> DecoderBuffer<'a> {
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn ensure_len(&self, len: usize) -> Result<(), DecoderError> {
        if self.bytes.len() < len {
            Err(DecoderError::UnexpectedEof(len))
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn ensure_empty(&self) -> Result<(), DecoderError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::UnexpectedBytes(self.bytes.len()))
        }
    }

    /// Peek at the byte at `index` without consuming anything
    #[inline]
    pub fn peek_byte(&self, index: usize) -> Result<u8, DecoderError> {
        self.bytes
            .get(index)
            .copied()
            .ok_or(DecoderError::UnexpectedEof(index + 1))
    }

    /// Split off the first `count` bytes as a slice
    #[inline]
    pub fn decode_slice(self, count: usize) -> DecoderBufferResult<'a, &'a [u8]> {
        self.ensure_len(count)?;
        let (slice, remaining) = self.bytes.split_at(count);
        Ok((slice, Self::new(remaining)))
    }

    /// Skip the first `count` bytes
    #[inline]
    pub fn skip(self, count: usize) -> Result<Self, DecoderError> {
        let (_, remaining) = self.decode_slice(count)?;
        Ok(remaining)
    }

    /// Decode a value of type `T`, splitting it from the buffer
    #[inline]
    pub fn decode<T: DecoderValue<'a>>(self) -> DecoderBufferResult<'a, T> {
        T::decode(self)
    }

    /// Decode a parameterized value of type `T`
    #[inline]
    pub fn decode_parameterized<T: DecoderParameterizedValue<'a>>(
        self,
        parameter: T::Parameter,
    ) -> DecoderBufferResult<'a, T> {
        T::decode_parameterized(parameter, self)
    }

    /// Decode a slice prefixed by a length of type `Length`
    #[inline]
    pub fn decode_slice_with_len_prefix<Length>(self) -> DecoderBufferResult<'a, &'a [u8]>
    where
        Length: DecoderValue<'a> + TryInto<usize>,
    {
        let (len, buffer) = self.decode::<Length>()?;
        let len = len
            .try_into()
            .map_err(|_| DecoderError::LengthCapacityExceeded)?;
        buffer.decode_slice(len)
    }

    /// Consume the view, returning the underlying slice
    #[inline]
    pub fn into_less_safe_slice(self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> From<&'a [u8]> for DecoderBuffer<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

macro_rules! decoder_int {
    ($ty:ident, $len:expr, $read:ident) => {
        impl<'a> DecoderValue<'a> for $ty {
            #[inline]
            fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
                let (slice, buffer) = buffer.decode_slice($len)?;
                Ok((NetworkEndian::$read(slice), buffer))
            }
        }
    };
}

impl<'a> DecoderValue<'a> for u8 {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let value = buffer.peek_byte(0)?;
        let buffer = buffer.skip(1)?;
        Ok((value, buffer))
    }
}

decoder_int!(u16, 2, read_u16);
decoder_int!(u32, 4, read_u32);
decoder_int!(u64, 8, read_u64);

impl<'a> DecoderValue<'a> for &'a [u8] {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let len = buffer.len();
        buffer.decode_slice(len)
    }
}

impl<'a> DecoderValue<'a> for DecoderBuffer<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        Ok((buffer, DecoderBuffer::new(&[])))
    }
}

/// Implements [`DecoderValue`] with the `(value, rest)` splitting style
///
/// ```ignore
/// decoder_value!(
///     impl<'a> MyType {
///         fn decode(buffer: Buffer) -> Result<Self> {
///             let (field, buffer) = buffer.decode()?;
///             Ok((MyType { field }, buffer))
///         }
///     }
/// );
/// ```
#[macro_export]
macro_rules! decoder_value {
    (impl<$lt:lifetime $(, $generic:ident)*> $ty:ty {
        fn decode($buffer:ident: Buffer) -> Result<Self> $impl:block
    }) => {
        impl<$lt $(, $generic: $crate::DecoderValue<$lt>)*> $crate::DecoderValue<$lt> for $ty {
            #[inline]
            fn decode(
                $buffer: $crate::DecoderBuffer<$lt>,
            ) -> $crate::DecoderBufferResult<$lt, Self> $impl
        }
    };
}

/// Implements [`DecoderParameterizedValue`] in the same style
#[macro_export]
macro_rules! decoder_parameterized_value {
    (impl<$lt:lifetime $(, $generic:ident)*> $ty:ty {
        fn decode($param:ident: $param_ty:ty, $buffer:ident: Buffer) -> Result<Self> $impl:block
    }) => {
        impl<$lt $(, $generic: $crate::DecoderValue<$lt>)*> $crate::DecoderParameterizedValue<$lt>
            for $ty
        {
            type Parameter = $param_ty;

            #[inline]
            fn decode_parameterized(
                $param: $param_ty,
                $buffer: $crate::DecoderBuffer<$lt>,
            ) -> $crate::DecoderBufferResult<$lt, Self> $impl
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_ints() {
        let data = [0, 1, 2, 3, 4, 5, 6];
        let buffer = DecoderBuffer::new(&data);

        let (value, buffer) = buffer.decode::<u8>().unwrap();
        assert_eq!(value, 0);

        let (value, buffer) = buffer.decode::<u16>().unwrap();
        assert_eq!(value, 258);

        let (value, buffer) = buffer.decode::<u32>().unwrap();
        assert_eq!(value, 50_595_078);

        assert!(buffer.is_empty());
        assert!(buffer.decode::<u8>().is_err());
    }

    #[test]
    fn arbitrary_input_never_panics() {
        bolero::check!().with_type::<Vec<u8>>().for_each(|data| {
            let buffer = DecoderBuffer::new(data);
            let _ = buffer.decode::<u64>();
            let _ = buffer.decode_slice_with_len_prefix::<u8>();
            let _ = buffer.peek_byte(3);
        });
    }

    #[test]
    fn len_prefix() {
        let data = [5, 0, 1, 2, 3, 4];
        let buffer = DecoderBuffer::new(&data);
        let (slice, buffer) = buffer.decode_slice_with_len_prefix::<u8>().unwrap();
        assert_eq!(slice, [0u8, 1, 2, 3, 4]);
        assert!(buffer.is_empty());

        let data = [6, 0, 1, 2, 3, 4];
        let buffer = DecoderBuffer::new(&data);
        assert!(buffer.decode_slice_with_len_prefix::<u8>().is_err());
    }
}
