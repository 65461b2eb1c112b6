//! Binary self-describing codec used for every value stored in the KV store.
//!
//! Every record is wrapped in an [`Envelope`] that pins down the codec
//! version up front, so a future migration can dispatch on it before
//! `bincode`-decoding the payload. `bincode`'s fixed-width, field-order
//! encoding is deterministic - identical inputs always yield identical
//! bytes - which `index_repo` idempotence and byte-equality checks in
//! tests both depend on.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

const CODEC_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    payload: Vec<u8>,
}

/// Encode a value into the versioned binary envelope.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let envelope = Envelope {
        version: CODEC_VERSION,
        payload,
    };
    Ok(bincode::serialize(&envelope)?)
}

/// Decode a value previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: Envelope = bincode::deserialize(bytes)?;
    if envelope.version != CODEC_VERSION {
        return Err(Error::Corrupt(format!(
            "unsupported codec version {} (expected {CODEC_VERSION})",
            envelope.version
        )));
    }
    Ok(bincode::deserialize(&envelope.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trips() {
        let sample = Sample {
            name: "nano".into(),
            count: 7,
        };
        let bytes = encode(&sample).unwrap();
        let decoded: Sample = decode(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn is_deterministic() {
        let sample = Sample {
            name: "nano".into(),
            count: 7,
        };
        assert_eq!(encode(&sample).unwrap(), encode(&sample).unwrap());
    }

    #[test]
    fn rejects_future_version() {
        let envelope = Envelope {
            version: CODEC_VERSION + 1,
            payload: bincode::serialize(&Sample {
                name: "x".into(),
                count: 1,
            })
            .unwrap(),
        };
        let bytes = bincode::serialize(&envelope).unwrap();
        let result: Result<Sample> = decode(&bytes);
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }
}
