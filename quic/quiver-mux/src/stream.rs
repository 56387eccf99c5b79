// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream state
//!
//! The stream's primary FSM is a plain enum; transient blocked-by
//! reasons and one-shot latched events live in two small bitsets, and
//! invalid compositions are rejected at each operation boundary.

use crate::{error::ErrorCode, htx};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StreamState {
    #[default]
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    /// An error must still be signalled with RST_STREAM
    Error,
    Closed,
}

/// Transient blocked-by reasons; cleared when the cause goes away
pub mod blocked {
    /// Waiting for mux buffer allocation
    pub const MUX_MALLOC: u8 = 0x01;
    /// Waiting for room in the mux buffer (send list)
    pub const MUX_ROOM: u8 = 0x02;
    /// Blocked by the connection send window (fctl list)
    pub const MUX_FCTL: u8 = 0x04;
    /// Blocked by the stream send window (blocked list)
    pub const STREAM_FCTL: u8 = 0x08;
}

/// One-shot latched events
pub mod event {
    pub const ES_RCVD: u16 = 0x0001;
    pub const ES_SENT: u16 = 0x0002;
    pub const RST_RCVD: u16 = 0x0004;
    pub const RST_SENT: u16 = 0x0008;
    pub const HEADERS_SENT: u16 = 0x0010;
    pub const HEADERS_RCVD: u16 = 0x0020;
    pub const KILL_CONN: u16 = 0x0040;
    pub const OUTGOING_DATA: u16 = 0x0080;
    /// Body length governed by content-length
    pub const DATA_CLEN: u16 = 0x0100;
}

/// How a stream error is surfaced to the upper layer
///
/// While decoded input is still waiting to be consumed the error only
/// pends; it becomes terminal once everything was delivered. Idempotent
/// close on either state is safe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorState {
    None,
    /// Data remains to deliver before the error is reported
    Pending,
    /// The error is observable; nothing is left to read
    Terminal,
}

/// Which of the connection's queues the stream currently occupies
///
/// A stream is in at most one queue at any time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Queue {
    #[default]
    None,
    /// Waiting to send (room in the mux buffer)
    Send,
    /// Blocked on the connection window
    Fctl,
    /// Blocked on the stream window
    Blocked,
}

#[derive(Debug, Default)]
pub struct MuxStream {
    pub id: i32,
    pub state: StreamState,
    pub blocked: u8,
    pub events: u16,
    /// Send window delta; effective window is `miw + sws`
    pub sws: i32,
    pub errcode: ErrorCode,
    pub status: u16,
    /// Remaining expected body bytes under content-length
    pub body_len: Option<u64>,
    /// Decoded inbound message for the upper layer
    pub rxbuf: htx::Message,
    pub queue: Queue,
}

impl MuxStream {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    #[inline]
    pub fn has_event(&self, event: u16) -> bool {
        self.events & event != 0
    }

    #[inline]
    pub fn latch(&mut self, event: u16) {
        self.events |= event;
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.blocked != 0
    }

    /// A peer frame closed its sending direction
    pub fn on_recv_es(&mut self) {
        self.latch(event::ES_RCVD);
        self.state = match self.state {
            StreamState::Open | StreamState::Idle => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// We closed our sending direction
    pub fn on_send_es(&mut self) {
        self.latch(event::ES_SENT);
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    pub fn on_recv_rst(&mut self, errcode: ErrorCode) {
        self.latch(event::RST_RCVD);
        self.errcode = errcode;
        self.state = StreamState::Closed;
    }

    pub fn on_send_rst(&mut self) {
        self.latch(event::RST_SENT);
        self.state = StreamState::Closed;
    }

    /// Flags a stream error that still needs an RST_STREAM on the wire
    pub fn set_error(&mut self, errcode: ErrorCode) {
        if self.state != StreamState::Closed {
            self.errcode = errcode;
            self.state = StreamState::Error;
        }
    }

    /// The error as the upper layer must observe it
    pub fn error_state(&self) -> ErrorState {
        let errored = self.errcode != ErrorCode::NoError
            || matches!(self.state, StreamState::Error)
            || self.has_event(event::RST_RCVD);
        match (errored, self.rxbuf.is_empty()) {
            (false, _) => ErrorState::None,
            (true, false) => ErrorState::Pending,
            (true, true) => ErrorState::Terminal,
        }
    }

    /// Account received DATA against content-length, when one governs
    pub fn account_body(&mut self, len: u64) -> Result<(), ErrorCode> {
        if let Some(remaining) = self.body_len {
            let remaining = remaining.checked_sub(len).ok_or(ErrorCode::ProtocolError)?;
            self.body_len = Some(remaining);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn es_both_directions_closes() {
        let mut stream = MuxStream::new(1);
        stream.state = StreamState::Open;
        stream.on_recv_es();
        assert_eq!(stream.state, StreamState::HalfClosedRemote);
        stream.on_send_es();
        assert_eq!(stream.state, StreamState::Closed);
        assert!(stream.has_event(event::ES_RCVD));
        assert!(stream.has_event(event::ES_SENT));
    }

    #[test]
    fn rst_is_terminal() {
        let mut stream = MuxStream::new(1);
        stream.state = StreamState::Open;
        stream.on_recv_rst(ErrorCode::Cancel);
        assert_eq!(stream.state, StreamState::Closed);
        assert_eq!(stream.errcode, ErrorCode::Cancel);

        // a later error must not resurrect the stream
        stream.set_error(ErrorCode::ProtocolError);
        assert_eq!(stream.state, StreamState::Closed);
        assert_eq!(stream.errcode, ErrorCode::Cancel);
    }

    #[test]
    fn errors_pend_until_input_is_drained() {
        let mut stream = MuxStream::new(1);
        assert_eq!(stream.error_state(), ErrorState::None);

        stream.rxbuf.push(htx::Block::Eom);
        stream.on_recv_rst(ErrorCode::Cancel);
        assert_eq!(stream.error_state(), ErrorState::Pending);

        stream.rxbuf.pop();
        assert_eq!(stream.error_state(), ErrorState::Terminal);
        // observing the error twice is harmless
        assert_eq!(stream.error_state(), ErrorState::Terminal);
    }

    #[test]
    fn content_length_overrun_is_rejected() {
        let mut stream = MuxStream::new(1);
        stream.body_len = Some(10);
        stream.latch(event::DATA_CLEN);
        assert!(stream.account_body(6).is_ok());
        assert!(stream.account_body(4).is_ok());
        assert_eq!(stream.account_body(1), Err(ErrorCode::ProtocolError));
    }
}
