//! Control-plane message envelope.
//!
//! Every frame payload is a typed envelope: a 2-byte big-endian message
//! type followed by the protobuf-encoded body. The message vocabulary lives
//! in [`messages`]; this module provides the envelope itself.

pub mod messages;

use bytes::Bytes;

/// Errors raised while wrapping or unwrapping envelopes.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The 2-byte type prefix did not name a known message.
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// The payload was shorter than the envelope header.
    #[error("message envelope truncated")]
    Truncated,

    /// The body failed to decode as the expected message.
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

/// Message types carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)] // the names are the documentation
pub enum MessageType {
    ClientRegistrationRequest = 1,
    ClientRegistrationResponse = 2,
    ClientValidationRequest = 3,
    ClientValidationResponse = 4,
    StartVaultRequest = 5,
    StartVaultResponse = 6,
    StopVaultRequest = 7,
    StopVaultResponse = 8,
    UpdateIntervalRequest = 9,
    UpdateIntervalResponse = 10,
    VaultIdentityRequest = 11,
    VaultIdentityResponse = 12,
    VaultJoinedNetwork = 13,
    VaultJoinedNetworkAck = 14,
    VaultJoinConfirmation = 15,
    VaultJoinConfirmationAck = 16,
    VaultShutdownRequest = 17,
    VaultShutdownResponse = 18,
    NewVersionAvailable = 19,
    NewVersionAvailableAck = 20,
}

impl MessageType {
    /// Parses the wire representation.
    #[must_use]
    pub const fn from_wire(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::ClientRegistrationRequest,
            2 => Self::ClientRegistrationResponse,
            3 => Self::ClientValidationRequest,
            4 => Self::ClientValidationResponse,
            5 => Self::StartVaultRequest,
            6 => Self::StartVaultResponse,
            7 => Self::StopVaultRequest,
            8 => Self::StopVaultResponse,
            9 => Self::UpdateIntervalRequest,
            10 => Self::UpdateIntervalResponse,
            11 => Self::VaultIdentityRequest,
            12 => Self::VaultIdentityResponse,
            13 => Self::VaultJoinedNetwork,
            14 => Self::VaultJoinedNetworkAck,
            15 => Self::VaultJoinConfirmation,
            16 => Self::VaultJoinConfirmationAck,
            17 => Self::VaultShutdownRequest,
            18 => Self::VaultShutdownResponse,
            19 => Self::NewVersionAvailable,
            20 => Self::NewVersionAvailableAck,
            _ => return None,
        })
    }

    /// The wire representation.
    #[must_use]
    pub const fn wire(self) -> u16 {
        self as u16
    }
}

/// Wraps a body into a typed envelope ready for framing.
#[must_use]
pub fn wrap_message(message_type: MessageType, body: &impl prost::Message) -> Bytes {
    let mut buf = Vec::with_capacity(2 + body.encoded_len());
    buf.extend_from_slice(&message_type.wire().to_be_bytes());
    body.encode(&mut buf).expect("encoding into a Vec cannot fail");
    Bytes::from(buf)
}

/// Splits an envelope into its message type and body.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] for payloads shorter than the header
/// and [`WireError::UnknownMessageType`] for unrecognized type values.
pub fn unwrap_message(frame: &Bytes) -> Result<(MessageType, Bytes), WireError> {
    if frame.len() < 2 {
        return Err(WireError::Truncated);
    }
    let value = u16::from_be_bytes([frame[0], frame[1]]);
    let message_type = MessageType::from_wire(value).ok_or(WireError::UnknownMessageType(value))?;
    Ok((message_type, frame.slice(2..)))
}

/// Decodes an envelope body into a concrete message.
///
/// # Errors
///
/// Returns [`WireError::Decode`] when the bytes are not a valid encoding.
pub fn decode_body<M: prost::Message + Default>(body: &[u8]) -> Result<M, WireError> {
    M::decode(body).map_err(WireError::from)
}
