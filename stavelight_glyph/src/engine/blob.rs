// Versioned model blobs.
//
// Layout (all integers little-endian):
//
//   0..4    magic  b"SLGM"
//   4..6    format version (u16)
//   6       backend tag (u8)
//   7..11   CRC32 of the payload
//   11..    bincode payload
//
// The payload is the backend's own serde model. bincode stores `f64` bit
// patterns verbatim, so a loaded engine classifies exactly like the engine
// that saved it. The layout on disk is otherwise the caller's business; this
// module only produces and checks bytes.

use crate::shape::Shape;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

const MAGIC: [u8; 4] = *b"SLGM";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 11;

/// Which backend wrote a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendTag {
    Network = 1,
    Linear = 2,
}

impl BackendTag {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(BackendTag::Network),
            2 => Some(BackendTag::Linear),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model blob truncated ({0} bytes)")]
    Truncated(usize),
    #[error("not a model blob (bad magic)")]
    BadMagic,
    #[error("unsupported model format version {0}")]
    UnsupportedVersion(u16),
    #[error("model blob written by backend {found}, expected {expected:?}")]
    WrongBackend { expected: BackendTag, found: u8 },
    #[error("model blob checksum mismatch")]
    Checksum,
    #[error("model codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("model vocabulary {found:?} does not match {expected:?}")]
    Vocabulary {
        expected: Vec<Shape>,
        found: Vec<Shape>,
    },
    #[error("model expects {found} inputs, descriptor has {expected}")]
    InputSize { expected: usize, found: usize },
    #[error("malformed model: {0}")]
    Malformed(&'static str),
}

pub(crate) fn encode<T: Serialize>(tag: BackendTag, payload: &T) -> Result<Vec<u8>, ModelError> {
    let body = bincode::serialize(payload)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(tag as u8);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub(crate) fn decode<T: DeserializeOwned>(expected: BackendTag, bytes: &[u8]) -> Result<T, ModelError> {
    if bytes.len() < HEADER_LEN {
        return Err(ModelError::Truncated(bytes.len()));
    }
    if bytes[0..4] != MAGIC {
        return Err(ModelError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(ModelError::UnsupportedVersion(version));
    }
    if BackendTag::from_byte(bytes[6]) != Some(expected) {
        return Err(ModelError::WrongBackend {
            expected,
            found: bytes[6],
        });
    }
    let crc = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
    let body = &bytes[HEADER_LEN..];
    if crc32fast::hash(body) != crc {
        return Err(ModelError::Checksum);
    }
    Ok(bincode::deserialize(body)?)
}

/// Reject a model trained against another shape vocabulary.
pub(crate) fn check_vocabulary(found: &[Shape]) -> Result<(), ModelError> {
    if found != Shape::TRAINABLE {
        return Err(ModelError::Vocabulary {
            expected: Shape::TRAINABLE.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bits() {
        let values = vec![0.1f64, -3.5e-300, f64::MAX, 1.0 / 3.0];
        let bytes = encode(BackendTag::Network, &values).unwrap();
        let back: Vec<f64> = decode(BackendTag::Network, &bytes).unwrap();
        let a: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        let b: Vec<u64> = back.iter().map(|v| v.to_bits()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_backend() {
        let bytes = encode(BackendTag::Linear, &1u32).unwrap();
        let err = decode::<u32>(BackendTag::Network, &bytes).unwrap_err();
        assert!(matches!(err, ModelError::WrongBackend { found: 2, .. }));
    }

    #[test]
    fn rejects_corruption() {
        let mut bytes = encode(BackendTag::Network, &vec![1.0f64; 8]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode::<Vec<f64>>(BackendTag::Network, &bytes),
            Err(ModelError::Checksum)
        ));
    }

    #[test]
    fn rejects_bad_header() {
        assert!(matches!(
            decode::<u32>(BackendTag::Network, b"SLG"),
            Err(ModelError::Truncated(3))
        ));
        let mut bytes = encode(BackendTag::Network, &1u32).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode::<u32>(BackendTag::Network, &bytes),
            Err(ModelError::BadMagic)
        ));
        let mut bytes = encode(BackendTag::Network, &1u32).unwrap();
        bytes[4] = 9;
        assert!(matches!(
            decode::<u32>(BackendTag::Network, &bytes),
            Err(ModelError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn vocabulary_check() {
        assert!(check_vocabulary(&Shape::TRAINABLE).is_ok());
        assert!(check_vocabulary(&[Shape::Dot]).is_err());
    }
}
