//! Confluent wire format for Avro payloads:
//! `[0x00][schema id: 4 bytes big-endian][avro binary datum]`.

use apache_avro::Schema;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::CodecError;

pub const MAGIC_BYTE: u8 = 0x00;

const HEADER_LEN: usize = 5;

/// A schema together with the id the registry assigned it.
#[derive(Debug, Clone)]
pub struct RegisteredSchema {
    subject: String,
    id: u32,
    schema: Schema,
}

impl RegisteredSchema {
    pub fn new(subject: impl Into<String>, id: u32, schema: Schema) -> Self {
        Self {
            subject: subject.into(),
            id,
            schema,
        }
    }

    pub fn id(&self) -> u32 { self.id }

    /// Validate `value` against the schema and frame it.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let value = apache_avro::to_value(value)?;
        if !value.validate(&self.schema) {
            return Err(CodecError::SchemaMismatch {
                schema: self.subject.clone(),
            });
        }

        let datum = apache_avro::to_avro_datum(&self.schema, value)?;
        Ok(frame(self.id, &datum))
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        decode_avro(&self.schema, payload).map(|(_, value)| value)
    }
}

pub fn parse_schema(json: &str) -> Result<Schema, CodecError> { Ok(Schema::parse_str(json)?) }

fn frame(id: u32, datum: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + datum.len());
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(datum);
    out
}

/// Split a framed payload into schema id and datum.
pub fn unframe(payload: &[u8]) -> Result<(u32, &[u8]), CodecError> {
    if payload.len() < HEADER_LEN {
        return Err(CodecError::Framing("payload shorter than header"));
    }
    if payload[0] != MAGIC_BYTE {
        return Err(CodecError::Framing("unknown magic byte"));
    }

    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((id, &payload[HEADER_LEN..]))
}

/// Decode a framed payload written with `writer_schema`.
pub fn decode_avro<T: DeserializeOwned>(writer_schema: &Schema, payload: &[u8]) -> Result<(u32, T), CodecError> {
    let (id, mut datum) = unframe(payload)?;
    let value = apache_avro::from_avro_datum(writer_schema, &mut datum, None)?;
    Ok((id, apache_avro::from_value(&value)?))
}

/// Values published without a value schema are sent as JSON.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> { Ok(serde_json::to_vec(value)?) }

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Key {
        timestamp: i64,
    }

    const KEY_SCHEMA: &str = r#"{
        "type": "record",
        "name": "key",
        "namespace": "com.cta",
        "fields": [{"name": "timestamp", "type": "long"}]
    }"#;

    fn key_schema() -> RegisteredSchema { RegisteredSchema::new("stations-key", 0x0102_0304, parse_schema(KEY_SCHEMA).unwrap()) }

    #[test]
    fn encoded_payload_starts_with_magic_byte_and_big_endian_id() {
        let payload = key_schema().encode(&Key { timestamp: 1 }).unwrap();

        assert_eq!(&payload[..5], &[0x00, 0x01, 0x02, 0x03, 0x04]);
        // zig-zag encoded long 1
        assert_eq!(&payload[5..], &[0x02]);
    }

    #[test]
    fn decode_reads_back_the_record() {
        let schema = key_schema();
        let payload = schema.encode(&Key { timestamp: 1_700_000_000_000 }).unwrap();

        let key: Key = schema.decode(&payload).unwrap();
        assert_eq!(key.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn value_not_matching_schema_is_rejected() {
        #[derive(Serialize)]
        struct Wrong {
            id: String,
        }

        let err = key_schema()
            .encode(&Wrong { id: "x".to_string() })
            .unwrap_err();
        assert!(matches!(err, CodecError::SchemaMismatch { ref schema } if schema == "stations-key"));
    }

    #[test]
    fn unframe_rejects_foreign_payloads() {
        assert!(matches!(unframe(&[0x00, 0x01]), Err(CodecError::Framing(_))));
        assert!(matches!(
            unframe(b"{\"json\": true}"),
            Err(CodecError::Framing("unknown magic byte"))
        ));
    }
}
