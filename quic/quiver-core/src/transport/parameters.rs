// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{connection::id::ConnectionId, endpoint, transport::Error, varint::VarInt};
use quiver_codec::{DecoderBuffer, Encoder, EncoderBuffer, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#18.2
//# Those transport parameters that are identified as integers use a
//# variable-length integer encoding; see Section 16.

/// The TLS extension carrying the transport parameters
pub const TLS_EXTENSION: u16 = 0xffa5;

pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

const ID_ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0;
const ID_IDLE_TIMEOUT: u64 = 1;
const ID_STATELESS_RESET_TOKEN: u64 = 2;
const ID_MAX_PACKET_SIZE: u64 = 3;
const ID_INITIAL_MAX_DATA: u64 = 4;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 5;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 6;
const ID_INITIAL_MAX_STREAM_DATA_UNI: u64 = 7;
const ID_INITIAL_MAX_STREAMS_BIDI: u64 = 8;
const ID_INITIAL_MAX_STREAMS_UNI: u64 = 9;
const ID_ACK_DELAY_EXPONENT: u64 = 10;
const ID_MAX_ACK_DELAY: u64 = 11;
const ID_DISABLE_ACTIVE_MIGRATION: u64 = 12;
const ID_PREFERRED_ADDRESS: u64 = 13;
const ID_ACTIVE_CONNECTION_ID_LIMIT: u64 = 14;

const DEFAULT_MAX_PACKET_SIZE: u64 = 65527;
const MIN_MAX_PACKET_SIZE: u64 = 1200;
const DEFAULT_ACK_DELAY_EXPONENT: u64 = 3;
const ACK_DELAY_EXPONENT_LIMIT: u64 = 20;
const DEFAULT_MAX_ACK_DELAY: u64 = 25;
const MAX_ACK_DELAY_LIMIT: u64 = 1 << 14;
const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4_address: [u8; 4],
    pub ipv4_port: u16,
    pub ipv6_address: [u8; 16],
    pub ipv6_port: u16,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; STATELESS_RESET_TOKEN_LEN],
}

/// A peer's (or our own) transport parameters; immutable once the
/// handshake has completed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    /// Server only
    pub original_destination_connection_id: Option<ConnectionId>,
    pub idle_timeout: VarInt,
    /// Server only
    pub stateless_reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>,
    pub max_packet_size: VarInt,
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub ack_delay_exponent: VarInt,
    pub max_ack_delay: VarInt,
    pub disable_active_migration: bool,
    /// Server only
    pub preferred_address: Option<PreferredAddress>,
    pub active_connection_id_limit: VarInt,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            idle_timeout: VarInt::ZERO,
            stateless_reset_token: None,
            max_packet_size: VarInt::new(DEFAULT_MAX_PACKET_SIZE).expect("constant"),
            initial_max_data: VarInt::ZERO,
            initial_max_stream_data_bidi_local: VarInt::ZERO,
            initial_max_stream_data_bidi_remote: VarInt::ZERO,
            initial_max_stream_data_uni: VarInt::ZERO,
            initial_max_streams_bidi: VarInt::ZERO,
            initial_max_streams_uni: VarInt::ZERO,
            ack_delay_exponent: VarInt::new(DEFAULT_ACK_DELAY_EXPONENT).expect("constant"),
            max_ack_delay: VarInt::new(DEFAULT_MAX_ACK_DELAY).expect("constant"),
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: VarInt::new(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT)
                .expect("constant"),
        }
    }
}

fn put<E: Encoder, V: EncoderValue>(encoder: &mut E, id: u64, value: &V) {
    encoder.encode(&VarInt::new(id).expect("parameter ids are small"));
    encoder.encode(&VarInt::new(value.encoding_size() as u64).expect("parameter fits"));
    encoder.encode(value);
}

impl TransportParameters {
    /// Encodes the parameters into `out`, returning the number of bytes
    /// written
    ///
    /// Server-only parameters are suppressed for clients.
    pub fn encode(&self, out: &mut [u8], local_endpoint: endpoint::Type) -> usize {
        let mut encoder = EncoderBuffer::new(out);
        let is_server = local_endpoint.is_server();

        if is_server {
            if let Some(cid) = &self.original_destination_connection_id {
                put(&mut encoder, ID_ORIGINAL_DESTINATION_CONNECTION_ID, cid);
            }
            if let Some(token) = &self.stateless_reset_token {
                put(&mut encoder, ID_STATELESS_RESET_TOKEN, &&token[..]);
            }
            if let Some(preferred) = &self.preferred_address {
                put(&mut encoder, ID_PREFERRED_ADDRESS, preferred);
            }
        }

        if self.idle_timeout != VarInt::ZERO {
            put(&mut encoder, ID_IDLE_TIMEOUT, &self.idle_timeout);
        }
        if self.max_packet_size != DEFAULT_MAX_PACKET_SIZE {
            put(&mut encoder, ID_MAX_PACKET_SIZE, &self.max_packet_size);
        }
        if self.initial_max_data != VarInt::ZERO {
            put(&mut encoder, ID_INITIAL_MAX_DATA, &self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != VarInt::ZERO {
            put(
                &mut encoder,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                &self.initial_max_stream_data_bidi_local,
            );
        }
        if self.initial_max_stream_data_bidi_remote != VarInt::ZERO {
            put(
                &mut encoder,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                &self.initial_max_stream_data_bidi_remote,
            );
        }
        if self.initial_max_stream_data_uni != VarInt::ZERO {
            put(
                &mut encoder,
                ID_INITIAL_MAX_STREAM_DATA_UNI,
                &self.initial_max_stream_data_uni,
            );
        }
        if self.initial_max_streams_bidi != VarInt::ZERO {
            put(&mut encoder, ID_INITIAL_MAX_STREAMS_BIDI, &self.initial_max_streams_bidi);
        }
        if self.initial_max_streams_uni != VarInt::ZERO {
            put(&mut encoder, ID_INITIAL_MAX_STREAMS_UNI, &self.initial_max_streams_uni);
        }
        if self.ack_delay_exponent != DEFAULT_ACK_DELAY_EXPONENT {
            put(&mut encoder, ID_ACK_DELAY_EXPONENT, &self.ack_delay_exponent);
        }
        if self.max_ack_delay != DEFAULT_MAX_ACK_DELAY {
            put(&mut encoder, ID_MAX_ACK_DELAY, &self.max_ack_delay);
        }
        if self.disable_active_migration {
            let empty: &[u8] = &[];
            put(&mut encoder, ID_DISABLE_ACTIVE_MIGRATION, &empty);
        }
        if self.active_connection_id_limit != DEFAULT_ACTIVE_CONNECTION_ID_LIMIT {
            put(
                &mut encoder,
                ID_ACTIVE_CONNECTION_ID_LIMIT,
                &self.active_connection_id_limit,
            );
        }

        encoder.len()
    }

    /// Decodes parameters received from `peer_endpoint`
    ///
    //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#18.2
    //# A client MUST NOT include an original connection ID, a stateless
    //# reset token, or a preferred address.  A server MUST treat receipt
    //# of any of these transport parameters as a connection error of type
    //# TRANSPORT_PARAMETER_ERROR.
    pub fn decode(data: &[u8], peer_endpoint: endpoint::Type) -> Result<Self, Error> {
        const TP_ERROR: Error = Error::TRANSPORT_PARAMETER_ERROR;
        let mut params = Self::default();
        let mut buffer = DecoderBuffer::new(data);

        while !buffer.is_empty() {
            let (id, rest) = buffer.decode::<VarInt>().map_err(|_| TP_ERROR)?;
            let (value, rest) = rest
                .decode_slice_with_len_prefix::<VarInt>()
                .map_err(|_| TP_ERROR)?;
            buffer = rest;

            let server_only = matches!(
                id.as_u64(),
                ID_ORIGINAL_DESTINATION_CONNECTION_ID
                    | ID_STATELESS_RESET_TOKEN
                    | ID_PREFERRED_ADDRESS
            );
            if server_only && peer_endpoint.is_client() {
                return Err(TP_ERROR.with_reason("server-only parameter from client"));
            }

            let varint_value = || -> Result<VarInt, Error> {
                let buffer = DecoderBuffer::new(value);
                let (value, rest) = buffer.decode::<VarInt>().map_err(|_| TP_ERROR)?;
                rest.ensure_empty().map_err(|_| TP_ERROR)?;
                Ok(value)
            };

            match id.as_u64() {
                ID_ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id =
                        Some(ConnectionId::try_from_slice(value).map_err(|_| TP_ERROR)?);
                }
                ID_IDLE_TIMEOUT => params.idle_timeout = varint_value()?,
                ID_STATELESS_RESET_TOKEN => {
                    params.stateless_reset_token =
                        Some(value.try_into().map_err(|_| TP_ERROR)?);
                }
                ID_MAX_PACKET_SIZE => {
                    let value = varint_value()?;
                    if value < MIN_MAX_PACKET_SIZE {
                        return Err(TP_ERROR.with_reason("max_packet_size below 1200"));
                    }
                    params.max_packet_size = value;
                }
                ID_INITIAL_MAX_DATA => params.initial_max_data = varint_value()?,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = varint_value()?;
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = varint_value()?;
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = varint_value()?;
                }
                ID_INITIAL_MAX_STREAMS_BIDI => params.initial_max_streams_bidi = varint_value()?,
                ID_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = varint_value()?,
                ID_ACK_DELAY_EXPONENT => {
                    let value = varint_value()?;
                    if value > ACK_DELAY_EXPONENT_LIMIT {
                        return Err(TP_ERROR.with_reason("ack_delay_exponent above 20"));
                    }
                    params.ack_delay_exponent = value;
                }
                ID_MAX_ACK_DELAY => {
                    let value = varint_value()?;
                    if value.as_u64() >= MAX_ACK_DELAY_LIMIT {
                        return Err(TP_ERROR.with_reason("max_ack_delay out of range"));
                    }
                    params.max_ack_delay = value;
                }
                ID_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(TP_ERROR.with_reason("unexpected value for flag"));
                    }
                    params.disable_active_migration = true;
                }
                ID_PREFERRED_ADDRESS => {
                    let buffer = DecoderBuffer::new(value);
                    let (preferred, rest) = decode_preferred_address(buffer)?;
                    rest.ensure_empty().map_err(|_| TP_ERROR)?;
                    params.preferred_address = Some(preferred);
                }
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = varint_value()?;
                }
                // unknown parameters are skipped
                _ => {}
            }
        }

        Ok(params)
    }
}

impl EncoderValue for PreferredAddress {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(&self.ipv4_address);
        encoder.encode(&self.ipv4_port);
        encoder.write_slice(&self.ipv6_address);
        encoder.encode(&self.ipv6_port);
        encoder.encode(&(self.connection_id.len() as u8));
        encoder.encode(&self.connection_id);
        encoder.write_slice(&self.stateless_reset_token);
    }
}

fn decode_preferred_address(
    buffer: DecoderBuffer<'_>,
) -> Result<(PreferredAddress, DecoderBuffer<'_>), Error> {
    const TP_ERROR: Error = Error::TRANSPORT_PARAMETER_ERROR;
    let (ipv4_address, buffer) = buffer.decode_slice(4).map_err(|_| TP_ERROR)?;
    let (ipv4_port, buffer) = buffer.decode::<u16>().map_err(|_| TP_ERROR)?;
    let (ipv6_address, buffer) = buffer.decode_slice(16).map_err(|_| TP_ERROR)?;
    let (ipv6_port, buffer) = buffer.decode::<u16>().map_err(|_| TP_ERROR)?;
    let (cid, buffer) = buffer
        .decode_slice_with_len_prefix::<u8>()
        .map_err(|_| TP_ERROR)?;
    let connection_id = ConnectionId::try_from_slice(cid).map_err(|_| TP_ERROR)?;
    let (token, buffer) = buffer
        .decode_slice(STATELESS_RESET_TOKEN_LEN)
        .map_err(|_| TP_ERROR)?;

    Ok((
        PreferredAddress {
            ipv4_address: ipv4_address.try_into().expect("length checked"),
            ipv4_port,
            ipv6_address: ipv6_address.try_into().expect("length checked"),
            ipv6_port,
            connection_id,
            stateless_reset_token: token.try_into().expect("length checked"),
        },
        buffer,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Type;

    #[test]
    fn round_trip_server_params() {
        let mut params = TransportParameters {
            original_destination_connection_id: Some(
                ConnectionId::try_from_slice(&[1, 2, 3, 4]).unwrap(),
            ),
            idle_timeout: VarInt::from_u32(30_000),
            stateless_reset_token: Some([9; 16]),
            initial_max_data: VarInt::from_u32(1 << 20),
            initial_max_streams_bidi: VarInt::from_u8(100),
            active_connection_id_limit: VarInt::from_u8(4),
            disable_active_migration: true,
            ..Default::default()
        };

        let mut out = [0u8; 256];
        let len = params.encode(&mut out, Type::Server);
        let decoded = TransportParameters::decode(&out[..len], Type::Server).unwrap();
        assert_eq!(decoded, params);

        // the same record encoded by a client must drop server-only fields
        let len = params.encode(&mut out, Type::Client);
        let decoded = TransportParameters::decode(&out[..len], Type::Client).unwrap();
        params.original_destination_connection_id = None;
        params.stateless_reset_token = None;
        assert_eq!(decoded, params);
    }

    #[test]
    fn server_only_param_from_client_is_an_error() {
        let params = TransportParameters {
            stateless_reset_token: Some([9; 16]),
            ..Default::default()
        };
        let mut out = [0u8; 256];
        let len = params.encode(&mut out, Type::Server);

        let error = TransportParameters::decode(&out[..len], Type::Client).unwrap_err();
        assert_eq!(error.code, Error::TRANSPORT_PARAMETER_ERROR.code);
    }

    #[test]
    fn bounds_are_enforced() {
        // ack_delay_exponent = 21
        let data = [10u8, 1, 21];
        assert!(TransportParameters::decode(&data, Type::Client).is_err());

        // max_packet_size = 1199
        let mut out = [0u8; 16];
        let mut encoder = EncoderBuffer::new(&mut out);
        put(&mut encoder, ID_MAX_PACKET_SIZE, &VarInt::from_u16(1199));
        let len = encoder.len();
        assert!(TransportParameters::decode(&out[..len], Type::Client).is_err());
    }

    #[test]
    fn unknown_parameters_are_skipped() {
        // id 0x33 (unknown), length 2, bytes; then idle_timeout 60
        let data = [0x33, 2, 0xaa, 0xbb, 1, 1, 60];
        let params = TransportParameters::decode(&data, Type::Client).unwrap();
        assert_eq!(params.idle_timeout, VarInt::from_u8(60));
    }

    #[test]
    fn preferred_address_round_trip() {
        let params = TransportParameters {
            preferred_address: Some(PreferredAddress {
                ipv4_address: [192, 0, 2, 1],
                ipv4_port: 4433,
                ipv6_address: [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
                ipv6_port: 4433,
                connection_id: ConnectionId::try_from_slice(&[5; 8]).unwrap(),
                stateless_reset_token: [3; 16],
            }),
            ..Default::default()
        };

        let mut out = [0u8; 256];
        let len = params.encode(&mut out, Type::Server);
        let decoded = TransportParameters::decode(&out[..len], Type::Server).unwrap();
        assert_eq!(decoded, params);
    }
}
