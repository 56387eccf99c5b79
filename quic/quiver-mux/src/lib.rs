// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The HTTP/2-style framing multiplexer layered above the transport
//!
//! One mux connection rides the transport's application byte stream: a
//! frame demuxer state machine, per-stream state machines, flow control,
//! HPACK-coded header blocks (through the [`hpack::HeaderCodec`]
//! contract) and HTX exchange with the upper stream layer.

pub mod config;
pub mod connection;
pub mod demux_buf;
pub mod error;
pub mod frame;
pub mod hpack;
pub mod htx;
pub mod stream;

pub use config::Config;
pub use connection::MuxConn;
pub use error::ErrorCode;
