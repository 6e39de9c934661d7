//! Sealing and opening wire envelopes.
//!
//! [seal] builds a [WireMessage] from a payload: when a session secret is
//! present the payload is AES-encrypted with a fresh nonce, and for
//! message types that demand authenticity it is first wrapped as
//! [SignedMessageData]. [open] is the inverse and verifies the signature
//! wrapper against the sender's public key.

use std::convert::TryInto as _;

use crate::crypto::{self, KeyPair, SignedMessageData, AES_NONCE_SIZE};
use crate::error::{ProtocolError, SecurityError};
use crate::guid::Guid;
use crate::serializer::{Serializer, SerializerError};

use super::wire::{MessageType, WireMessage};

/// Errors raised while sealing or opening an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Serializer(#[from] SerializerError),
}

impl From<crypto::CryptoError> for EnvelopeError {
    fn from(error: crypto::CryptoError) -> Self {
        EnvelopeError::Security(SecurityError::from(error))
    }
}

impl From<EnvelopeError> for crate::error::RemotingError {
    fn from(error: EnvelopeError) -> Self {
        match error {
            EnvelopeError::Protocol(e) => e.into(),
            EnvelopeError::Security(e) => e.into(),
            EnvelopeError::Serializer(e) => e.into(),
        }
    }
}

/// Build a wire envelope around `payload`.
///
/// `signing_key` only takes effect for [MessageType::requires_signature]
/// messages; `shared_secret` enables the AES layer.
pub fn seal(
    serializer: Serializer,
    message_type: MessageType,
    payload: Vec<u8>,
    shared_secret: Option<&Guid>,
    signing_key: Option<&KeyPair>,
    unique_call_key: Option<Guid>,
    error: bool,
) -> Result<WireMessage, EnvelopeError> {
    let payload = match signing_key {
        Some(key_pair) if message_type.requires_signature() => {
            let signed = crypto::sign_data(payload, key_pair)?;
            serializer.to_bytes("signed message data", &signed)?
        }
        _ => payload,
    };

    let (iv, data) = match shared_secret {
        Some(secret) => crypto::encrypt_payload(secret, &payload)?,
        None => (Vec::new(), payload),
    };

    Ok(WireMessage {
        message_type,
        data,
        iv,
        unique_call_key,
        error,
    })
}

/// Recover the payload of a wire envelope.
///
/// With a shared secret the data is AES-decrypted; the nonce length must
/// match the cipher. For message types that demand authenticity and a
/// known sender key, the signature wrapper is verified and stripped.
pub fn open(
    serializer: Serializer,
    message: &WireMessage,
    shared_secret: Option<&Guid>,
    senders_public_key: Option<&[u8]>,
) -> Result<Vec<u8>, EnvelopeError> {
    let payload = match shared_secret {
        Some(secret) => {
            let nonce: &[u8; AES_NONCE_SIZE] =
                message.iv.as_slice().try_into().map_err(|_| {
                    ProtocolError::InvalidIvLength {
                        len: message.iv.len(),
                        expected: AES_NONCE_SIZE,
                    }
                })?;
            crypto::decrypt_payload(secret, nonce, &message.data)
                .map_err(|_| SecurityError::DecryptFailed)?
        }
        None => message.data.clone(),
    };

    match senders_public_key {
        Some(key_der) if message.message_type.requires_signature() => {
            let signed: SignedMessageData =
                serializer.from_bytes("signed message data", &payload)?;
            crypto::verify_data(&signed, key_der)
                .map_err(|_| SecurityError::SignatureMismatch)?;
            Ok(signed.message_raw_data)
        }
        _ => Ok(payload),
    }
}
