//! Ciphertext envelope wire format (opaque to the transport and server).
//!
//! Handshake: `[0x01][33: sender identity][33: sender ephemeral]`
//!            `[4: signed pre-key id LE][4: one-time pre-key id LE][payload]`
//! Regular:   `[0x02][payload]`
//!
//! A one-time pre-key id of `0xFFFF_FFFF` means the fetched bundle carried
//! no one-time key.

use crate::engine::PUBLIC_KEY_LEN;
use crate::error::CryptoError;

pub const MSG_TYPE_HANDSHAKE: u8 = 0x01;
pub const MSG_TYPE_REGULAR: u8 = 0x02;

const KEY_ID_LEN: usize = 4;
const NO_OTP_SENTINEL: u32 = 0xFFFF_FFFF;
const HANDSHAKE_HEADER_LEN: usize = 1 + 2 * PUBLIC_KEY_LEN + 2 * KEY_ID_LEN;

/// A parsed handshake envelope: the initiator's public material plus the
/// first ratchet payload.
#[derive(Debug, Clone)]
pub struct HandshakeEnvelope {
    pub sender_identity: Vec<u8>,
    pub sender_ephemeral: Vec<u8>,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ParsedEnvelope {
    Handshake(HandshakeEnvelope),
    Regular { payload: Vec<u8> },
}

/// Cheap discriminator check for routing without a full parse.
pub fn is_handshake(envelope: &[u8]) -> bool {
    envelope.first() == Some(&MSG_TYPE_HANDSHAKE)
}

pub fn build_handshake(
    sender_identity: &[u8],
    sender_ephemeral: &[u8],
    signed_prekey_id: u32,
    one_time_prekey_id: Option<u32>,
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sender_identity.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::Envelope(format!(
            "sender identity key must be {PUBLIC_KEY_LEN} bytes, got {}",
            sender_identity.len()
        )));
    }
    if sender_ephemeral.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::Envelope(format!(
            "sender ephemeral key must be {PUBLIC_KEY_LEN} bytes, got {}",
            sender_ephemeral.len()
        )));
    }

    let otp_id = one_time_prekey_id.unwrap_or(NO_OTP_SENTINEL);
    let mut buf = Vec::with_capacity(HANDSHAKE_HEADER_LEN + payload.len());
    buf.push(MSG_TYPE_HANDSHAKE);
    buf.extend_from_slice(sender_identity);
    buf.extend_from_slice(sender_ephemeral);
    buf.extend_from_slice(&signed_prekey_id.to_le_bytes());
    buf.extend_from_slice(&otp_id.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub fn build_regular(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(MSG_TYPE_REGULAR);
    buf.extend_from_slice(payload);
    buf
}

pub fn parse(envelope: &[u8]) -> Result<ParsedEnvelope, CryptoError> {
    let Some(&msg_type) = envelope.first() else {
        return Err(CryptoError::Envelope("empty envelope".into()));
    };

    match msg_type {
        MSG_TYPE_REGULAR => Ok(ParsedEnvelope::Regular {
            payload: envelope[1..].to_vec(),
        }),
        MSG_TYPE_HANDSHAKE => {
            if envelope.len() < HANDSHAKE_HEADER_LEN {
                return Err(CryptoError::Envelope(format!(
                    "handshake envelope too short: {} < {HANDSHAKE_HEADER_LEN}",
                    envelope.len()
                )));
            }
            let mut offset = 1;
            let sender_identity = envelope[offset..offset + PUBLIC_KEY_LEN].to_vec();
            offset += PUBLIC_KEY_LEN;
            let sender_ephemeral = envelope[offset..offset + PUBLIC_KEY_LEN].to_vec();
            offset += PUBLIC_KEY_LEN;
            let signed_prekey_id = read_key_id(envelope, offset)?;
            offset += KEY_ID_LEN;
            let otp_id = read_key_id(envelope, offset)?;
            offset += KEY_ID_LEN;

            Ok(ParsedEnvelope::Handshake(HandshakeEnvelope {
                sender_identity,
                sender_ephemeral,
                signed_prekey_id,
                one_time_prekey_id: (otp_id != NO_OTP_SENTINEL).then_some(otp_id),
                payload: envelope[offset..].to_vec(),
            }))
        }
        other => Err(CryptoError::Envelope(format!(
            "unknown message type 0x{other:02x}"
        ))),
    }
}

fn read_key_id(envelope: &[u8], offset: usize) -> Result<u32, CryptoError> {
    let bytes: [u8; KEY_ID_LEN] = envelope[offset..offset + KEY_ID_LEN]
        .try_into()
        .map_err(|_| CryptoError::Envelope("truncated key id".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let envelope = build_handshake(&[1; 33], &[2; 33], 1, Some(42), b"payload").unwrap();
        assert!(is_handshake(&envelope));

        let ParsedEnvelope::Handshake(hs) = parse(&envelope).unwrap() else {
            panic!("expected handshake");
        };
        assert_eq!(hs.sender_identity, vec![1; 33]);
        assert_eq!(hs.sender_ephemeral, vec![2; 33]);
        assert_eq!(hs.signed_prekey_id, 1);
        assert_eq!(hs.one_time_prekey_id, Some(42));
        assert_eq!(hs.payload, b"payload");
    }

    #[test]
    fn handshake_without_one_time_key_uses_sentinel() {
        let envelope = build_handshake(&[1; 33], &[2; 33], 1, None, b"x").unwrap();
        let ParsedEnvelope::Handshake(hs) = parse(&envelope).unwrap() else {
            panic!("expected handshake");
        };
        assert_eq!(hs.one_time_prekey_id, None);
    }

    #[test]
    fn regular_roundtrip() {
        let envelope = build_regular(b"ciphertext");
        assert!(!is_handshake(&envelope));

        let ParsedEnvelope::Regular { payload } = parse(&envelope).unwrap() else {
            panic!("expected regular");
        };
        assert_eq!(payload, b"ciphertext");
    }

    #[test]
    fn rejects_empty_and_unknown() {
        assert!(parse(&[]).is_err());
        assert!(parse(&[0x7f, 1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_truncated_handshake() {
        let envelope = build_handshake(&[1; 33], &[2; 33], 1, None, b"").unwrap();
        assert!(parse(&envelope[..envelope.len() - 5]).is_err());
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(build_handshake(&[1; 32], &[2; 33], 1, None, b"").is_err());
        assert!(build_handshake(&[1; 33], &[2; 34], 1, None, b"").is_err());
    }
}
