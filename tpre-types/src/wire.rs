//! Canonical wire envelope.
//!
//! Every top-level protocol message travels inside the same frame:
//!
//! ```text
//! | version (2) | kind (2) | payload length (4) | payload | sig length (2) | signature |
//! ```
//!
//! All integers are network byte order. The payload is the CBOR encoding of
//! the typed message for the given [`MessageKind`]; cryptographic objects
//! inside the payload use their library serialization and are treated as
//! opaque byte vectors here. The signature tail, when present, covers the
//! header and payload bytes exactly as they appear on the wire, so receivers
//! verify what they received rather than what they re-serialized.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use umbral_pre::{PublicKey, Signature, Signer};

/// Wire protocol version carried in every frame.
pub const WIRE_VERSION: (u8, u8) = (1, 0);

/// Upper bound on the payload length a receiver will buffer.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Exhaustive table of top-level message kinds.
///
/// The numeric values are part of the wire format; new kinds are appended,
/// existing values never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// A peer announcing itself during a metadata exchange.
    NodeMetadataRequest = 1,
    /// The exchange reply: responder identity plus fleet announcement.
    NodeMetadataResponse = 2,
    /// A worker's static identity block.
    PublicInformation = 3,
    /// A retriever asking for capsule re-encryption.
    ReencryptionRequest = 4,
    /// The ordered capsule fragments answering a re-encryption request.
    ReencryptionResponse = 5,
    /// A delegator delivering an encrypted kfrag to a worker.
    EnactmentRequest = 6,
    /// The worker-signed receipt for a delivered kfrag.
    EnactmentReceipt = 7,
}

impl MessageKind {
    /// Decodes a wire value into a kind.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::NodeMetadataRequest),
            2 => Some(Self::NodeMetadataResponse),
            3 => Some(Self::PublicInformation),
            4 => Some(Self::ReencryptionRequest),
            5 => Some(Self::ReencryptionResponse),
            6 => Some(Self::EnactmentRequest),
            7 => Some(Self::EnactmentReceipt),
            _ => None,
        }
    }
}

/// Errors produced while framing or unframing envelopes.
///
/// These are connection-fatal protocol errors: a receiver drops the exchange
/// and the sender retries with a fresh frame if it cares.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame ended before the announced length.
    #[error("frame truncated (have {have} bytes, need {need})")]
    Truncated {
        /// Bytes available.
        have: usize,
        /// Bytes the header announced.
        need: usize,
    },
    /// The frame's major version does not match ours.
    #[error("unsupported protocol version {major}.{minor}")]
    VersionMismatch {
        /// Major version found on the wire.
        major: u8,
        /// Minor version found on the wire.
        minor: u8,
    },
    /// The kind value is not in the codec table.
    #[error("unknown message kind {0}")]
    UnknownKind(u16),
    /// The announced payload length exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload of {0} bytes exceeds limit")]
    Oversized(usize),
    /// A well-formed envelope carried the wrong kind for this endpoint.
    #[error("unexpected message kind {got:?}, expected {expected:?}")]
    UnexpectedKind {
        /// Kind required by the caller.
        expected: MessageKind,
        /// Kind found in the envelope.
        got: MessageKind,
    },
    /// The payload did not decode as the expected message type.
    #[error("payload decode failed: {0}")]
    Codec(String),
    /// The endpoint requires a signature and the envelope has none.
    #[error("envelope is not signed")]
    MissingSignature,
    /// The signature tail did not verify under the expected key.
    #[error("envelope signature verification failed")]
    InvalidSignature,
}

/// A framed protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    kind: MessageKind,
    payload: Vec<u8>,
    signature: Option<Vec<u8>>,
}

impl Envelope {
    /// Frames `msg` without a signature tail.
    pub fn seal<T: Serialize>(kind: MessageKind, msg: &T) -> Self {
        let mut payload = Vec::new();
        ciborium::into_writer(msg, &mut payload).expect("protocol messages always serialize");
        Self {
            kind,
            payload,
            signature: None,
        }
    }

    /// Frames `msg` and signs the header and payload bytes with `signer`.
    pub fn seal_signed<T: Serialize>(kind: MessageKind, msg: &T, signer: &Signer) -> Self {
        let mut envelope = Self::seal(kind, msg);
        let signature = signer.sign(&envelope.signed_bytes());
        let mut signature_bytes = Vec::new();
        ciborium::into_writer(&signature, &mut signature_bytes)
            .expect("signatures always serialize");
        envelope.signature = Some(signature_bytes);
        envelope
    }

    /// The message kind of this envelope.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Whether a signature tail is attached.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// The exact bytes the signature tail covers.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(WIRE_VERSION.0);
        buf.push(WIRE_VERSION.1);
        buf.extend_from_slice(&(self.kind as u16).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Verifies the signature tail under `pk`.
    pub fn verify(&self, pk: &PublicKey) -> Result<(), WireError> {
        let signature_bytes = self.signature.as_ref().ok_or(WireError::MissingSignature)?;
        let signature: Signature = ciborium::from_reader(signature_bytes.as_slice())
            .map_err(|_| WireError::InvalidSignature)?;
        if signature.verify(pk, &self.signed_bytes()) {
            Ok(())
        } else {
            Err(WireError::InvalidSignature)
        }
    }

    /// Decodes the payload as the message type of `expected`.
    pub fn open<T: DeserializeOwned>(&self, expected: MessageKind) -> Result<T, WireError> {
        if self.kind != expected {
            return Err(WireError::UnexpectedKind {
                expected,
                got: self.kind,
            });
        }
        ciborium::from_reader(self.payload.as_slice())
            .map_err(|err| WireError::Codec(err.to_string()))
    }

    /// Verifies the signature tail under `pk`, then decodes the payload.
    pub fn open_signed<T: DeserializeOwned>(
        &self,
        expected: MessageKind,
        pk: &PublicKey,
    ) -> Result<T, WireError> {
        self.verify(pk)?;
        self.open(expected)
    }

    /// Serializes the envelope into its wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let signature = self.signature.as_deref().unwrap_or(&[]);
        let mut buf = self.signed_bytes();
        buf.reserve(2 + signature.len());
        buf.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        buf.extend_from_slice(signature);
        buf
    }

    /// Parses a wire frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                have: bytes.len(),
                need: HEADER_LEN,
            });
        }
        let (major, minor) = (bytes[0], bytes[1]);
        if major != WIRE_VERSION.0 {
            return Err(WireError::VersionMismatch { major, minor });
        }
        let kind_value = u16::from_be_bytes([bytes[2], bytes[3]]);
        let kind = MessageKind::from_u16(kind_value).ok_or(WireError::UnknownKind(kind_value))?;
        let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::Oversized(payload_len));
        }
        let need = HEADER_LEN + payload_len + 2;
        if bytes.len() < need {
            return Err(WireError::Truncated {
                have: bytes.len(),
                need,
            });
        }
        let payload = bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
        let sig_offset = HEADER_LEN + payload_len;
        let sig_len = u16::from_be_bytes([bytes[sig_offset], bytes[sig_offset + 1]]) as usize;
        let sig_end = sig_offset + 2 + sig_len;
        if bytes.len() < sig_end {
            return Err(WireError::Truncated {
                have: bytes.len(),
                need: sig_end,
            });
        }
        let signature = if sig_len == 0 {
            None
        } else {
            Some(bytes[sig_offset + 2..sig_end].to_vec())
        };
        Ok(Self {
            kind,
            payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        value: u32,
        tag: String,
    }

    fn probe() -> Probe {
        Probe {
            value: 7,
            tag: "probe".to_owned(),
        }
    }

    #[test]
    fn unsigned_frame_decodes() {
        let envelope = Envelope::seal(MessageKind::PublicInformation, &probe());
        let decoded = Envelope::decode(&envelope.encode()).expect("well-formed frame");
        assert_eq!(decoded, envelope);
        let msg: Probe = decoded.open(MessageKind::PublicInformation).expect("opens");
        assert_eq!(msg, probe());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let envelope = Envelope::seal(MessageKind::PublicInformation, &probe());
        let err = envelope
            .open::<Probe>(MessageKind::ReencryptionRequest)
            .expect_err("wrong kind");
        assert!(matches!(err, WireError::UnexpectedKind { .. }));
    }

    #[test]
    fn version_major_mismatch_is_rejected() {
        let mut bytes = Envelope::seal(MessageKind::PublicInformation, &probe()).encode();
        bytes[0] = WIRE_VERSION.0 + 1;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(WireError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = Envelope::seal(MessageKind::PublicInformation, &probe()).encode();
        bytes[2] = 0xff;
        bytes[3] = 0xff;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(WireError::UnknownKind(0xffff))
        ));
    }

    #[test]
    fn length_lie_is_rejected() {
        let mut bytes = Envelope::seal(MessageKind::PublicInformation, &probe()).encode();
        // claim a payload longer than the frame
        bytes[7] = bytes[7].wrapping_add(40);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn signature_covers_payload() {
        let sk = umbral_pre::SecretKey::random();
        let signer = Signer::new(sk.clone());
        let envelope = Envelope::seal_signed(MessageKind::ReencryptionRequest, &probe(), &signer);
        let mut decoded = Envelope::decode(&envelope.encode()).expect("well-formed");
        decoded
            .verify(&signer.verifying_key())
            .expect("signature holds");

        // flip one payload byte: the tail must no longer verify
        decoded.payload[0] ^= 0x01;
        assert!(matches!(
            decoded.verify(&signer.verifying_key()),
            Err(WireError::InvalidSignature)
        ));

        // and the right payload must not verify under another key
        let other = umbral_pre::SecretKey::random().public_key();
        let envelope = Envelope::decode(&envelope.encode()).expect("well-formed");
        assert!(matches!(
            envelope.verify(&other),
            Err(WireError::InvalidSignature)
        ));
    }

    #[test]
    fn unsigned_frame_fails_signed_open() {
        let envelope = Envelope::seal(MessageKind::ReencryptionRequest, &probe());
        let pk = umbral_pre::SecretKey::random().public_key();
        assert!(matches!(
            envelope.open_signed::<Probe>(MessageKind::ReencryptionRequest, &pk),
            Err(WireError::MissingSignature)
        ));
    }
}
