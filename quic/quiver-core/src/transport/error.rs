// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use core::fmt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#20
//# QUIC error codes are 62-bit unsigned integers.

/// A connection-fatal transport error
///
/// Carried in CONNECTION_CLOSE (type 0x1c) together with the frame type
/// that provoked it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Error {
    pub code: VarInt,
    /// The frame type that triggered the error, 0 when unknown
    pub frame_type: VarInt,
    pub reason: &'static str,
}

macro_rules! impl_errors {
    ($($(#[doc = $doc:expr])* $name:ident = $code:expr),* $(,)?) => {
        impl Error {
            $(
                $(#[doc = $doc])*
                pub const $name: Self = Self::new(VarInt::from_u8($code));
            )*

            pub fn description(&self) -> Option<&'static str> {
                match self.code.as_u64() {
                    $(
                        $code => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }
    };
}

impl_errors! {
    /// An endpoint uses this with CONNECTION_CLOSE to signal that the
    /// connection is being closed abruptly in the absence of any error
    NO_ERROR = 0x0,
    /// The endpoint encountered an internal error and cannot continue
    INTERNAL_ERROR = 0x1,
    /// The server is currently busy and does not accept any new connections
    CONNECTION_REFUSED = 0x2,
    /// An endpoint received more data than it permitted in its advertised
    /// data limits
    FLOW_CONTROL_ERROR = 0x3,
    /// An endpoint received a frame for a stream identifier that exceeded
    /// its advertised stream limit for the corresponding stream type
    STREAM_LIMIT_ERROR = 0x4,
    /// An endpoint received a frame for a stream that was not in a state
    /// that permitted that frame
    STREAM_STATE_ERROR = 0x5,
    /// An endpoint received a STREAM frame containing data that exceeded
    /// the previously established final size
    FINAL_SIZE_ERROR = 0x6,
    /// An endpoint received a frame that was badly formatted
    FRAME_ENCODING_ERROR = 0x7,
    /// An endpoint received transport parameters that were badly formatted,
    /// included an invalid value, or omitted a mandatory parameter
    TRANSPORT_PARAMETER_ERROR = 0x8,
    /// The number of connection IDs provided by the peer exceeds the
    /// advertised active_connection_id_limit
    CONNECTION_ID_LIMIT_ERROR = 0x9,
    /// An endpoint detected an error with protocol compliance that was not
    /// covered by more specific error codes
    PROTOCOL_VIOLATION = 0xa,
    /// A server received a client Initial that contained an invalid Token
    INVALID_TOKEN = 0xb,
    /// The application or application protocol caused the connection to be
    /// closed
    APPLICATION_ERROR = 0xc,
    /// An endpoint has received more data in CRYPTO frames than it can
    /// buffer
    CRYPTO_BUFFER_EXCEEDED = 0xd,
    /// An endpoint detected errors in performing key updates
    KEY_UPDATE_ERROR = 0xe,
    /// An endpoint has reached the confidentiality or integrity limit for
    /// the AEAD algorithm used by the given connection
    AEAD_LIMIT_REACHED = 0xf,
}

impl Error {
    #[inline]
    pub const fn new(code: VarInt) -> Self {
        Self {
            code,
            frame_type: VarInt::ZERO,
            reason: "",
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = frame_type;
        self
    }

    /// TLS alerts map into the 0x100-0x1ff code space
    #[inline]
    pub fn crypto_error(alert: u8) -> Self {
        Self::new(VarInt::from_u16(0x100 | u16::from(alert)))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(description) = self.description() {
            write!(f, "{description}")?;
        } else {
            write!(f, "error {}", self.code)?;
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<quiver_codec::DecoderError> for Error {
    #[inline]
    fn from(_: quiver_codec::DecoderError) -> Self {
        Self::FRAME_ENCODING_ERROR.with_reason("malformed frame")
    }
}

impl From<crate::crypto::Error> for Error {
    #[inline]
    fn from(error: crate::crypto::Error) -> Self {
        Self::INTERNAL_ERROR.with_reason(error.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions() {
        assert_eq!(Error::NO_ERROR.description(), Some("NO_ERROR"));
        assert_eq!(Error::AEAD_LIMIT_REACHED.description(), Some("AEAD_LIMIT_REACHED"));
        assert_eq!(Error::crypto_error(80).description(), None);
    }

    #[test]
    fn crypto_error_space() {
        assert_eq!(Error::crypto_error(0).code.as_u64(), 0x100);
        assert_eq!(Error::crypto_error(0xff).code.as_u64(), 0x1ff);
    }
}
