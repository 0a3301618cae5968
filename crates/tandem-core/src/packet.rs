//! The unit of wire exchange and its correlation id.

use crate::error::{ServiceError, TandemResult};
use ciborium::Value;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 128-bit random identifier placed on a request and echoed on its response.
///
/// Generated with version-4 UUID bits set; travels as a 16-byte CBOR byte
/// string and displays in canonical hyphenated form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId([u8; 16]);

impl CorrelationId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes: [u8; 16] = rand::thread_rng().gen();
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

impl Serialize for CorrelationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = CorrelationId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("16 bytes of correlation id")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                let bytes: [u8; 16] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(CorrelationId(bytes))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = [0u8; 16];
                for (i, slot) in bytes.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(CorrelationId(bytes))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

/// A single logical message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_exit: bool,
    /// Opaque application value: a request, a response, or a [`ServiceError`].
    pub payload: Value,
}

impl Packet {
    /// A request with a fresh correlation id.
    pub fn request(payload: Value) -> Self {
        Self {
            correlation_id: CorrelationId::random(),
            is_error: false,
            is_exit: false,
            payload,
        }
    }

    /// A successful response to the request carrying `correlation_id`.
    pub fn response(correlation_id: CorrelationId, payload: Value) -> Self {
        Self {
            correlation_id,
            is_error: false,
            is_exit: false,
            payload,
        }
    }

    /// A failed response; the error becomes the payload.
    pub fn error(correlation_id: CorrelationId, error: &ServiceError) -> TandemResult<Self> {
        Ok(Self {
            correlation_id,
            is_error: true,
            is_exit: false,
            payload: encode_payload(error)?,
        })
    }

    /// First half of the exit handshake, sent by the client.
    pub fn exit() -> Self {
        Self {
            correlation_id: CorrelationId::random(),
            is_error: false,
            is_exit: true,
            payload: Value::Null,
        }
    }

    /// Server acknowledgment of an exit packet.
    pub fn exit_ack(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            is_error: false,
            is_exit: true,
            payload: Value::Null,
        }
    }

    /// Decode the payload into a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> TandemResult<T> {
        Ok(self.payload.deserialized()?)
    }
}

/// Convert a typed value into a packet payload.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> TandemResult<Value> {
    Ok(Value::serialized(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_ids_are_distinct_v4() {
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::random()).collect();
        assert_eq!(ids.len(), 1000);
        for id in ids.iter().take(10) {
            assert_eq!(id.as_bytes()[6] >> 4, 4);
            assert_eq!(id.as_bytes()[8] >> 6, 0b10);
        }
    }

    #[test]
    fn display_is_hyphenated_hex() {
        let id = CorrelationId::from_bytes([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0x4d, 0xef, 0x80, 0x01, 0x02, 0x03, 0x04, 0x05,
            0x06, 0x07,
        ]);
        assert_eq!(id.to_string(), "01234567-89ab-4def-8001-020304050607");
    }

    #[test]
    fn error_packet_carries_service_error() {
        let err = ServiceError::new("StreamingError", "stream abc not found");
        let id = CorrelationId::random();
        let packet = Packet::error(id, &err).unwrap();
        assert!(packet.is_error);
        assert_eq!(packet.correlation_id, id);
        let decoded: ServiceError = packet.decode_payload().unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn exit_ack_echoes_id() {
        let exit = Packet::exit();
        let ack = Packet::exit_ack(exit.correlation_id);
        assert!(exit.is_exit && ack.is_exit);
        assert_eq!(exit.correlation_id, ack.correlation_id);
        assert_eq!(ack.payload, Value::Null);
    }

    #[test]
    fn id_survives_value_conversion() {
        let id = CorrelationId::random();
        let value = encode_payload(&id).unwrap();
        assert!(matches!(value, Value::Bytes(ref b) if b.len() == 16));
        let back: CorrelationId = value.deserialized().unwrap();
        assert_eq!(back, id);
    }
}
