//! # MessagePack Framing
//!
//! Thin wrapper around `rmpv` exposing the two framing modes used on the wire.
//!
//! ## Modes
//!
//! - **Single**: one value to one blob. Trailing bytes after the value are an
//!   error, so a blob is either exactly one value or garbage.
//! - **Multiple**: discrete values concatenated back-to-back with no length
//!   prefix and no framing between items. Decoding parses repeatedly until the
//!   buffer is exhausted. This is *not* a MessagePack array; the concatenation
//!   of two multiple-mode buffers is itself a valid multiple-mode buffer.
//!
//! Recursive work over these blobs (nested record encode/decode) is bounded
//! by [`MAX_DEPTH`].

use std::io::Cursor;

use rmpv::Value;
use thiserror::Error;

/// The deepest value nesting followed before giving up. Nested record blobs
/// are opaque to MessagePack itself, so this bound is enforced by the layers
/// that recurse into them.
pub const MAX_DEPTH: usize = 64;

/// Failures in the serialization layer itself.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A value could not be written out.
    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmpv::encode::Error),
    /// The buffer did not parse as MessagePack (truncated or corrupt).
    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmpv::decode::Error),
    /// Single mode only: the buffer held bytes beyond the first value.
    #[error("trailing bytes after value ({0} left over)")]
    TrailingBytes(usize),
    /// Nesting deeper than the safety limit.
    #[error("nesting exceeds {max} levels", max = MAX_DEPTH)]
    DepthLimit,
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encodes one value as one blob.
pub fn encode_one(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)?;
    Ok(buf)
}

/// Decodes exactly one value from the buffer.
pub fn decode_one(bytes: &[u8]) -> Result<Value> {
    let mut cursor = Cursor::new(bytes);
    let value = rmpv::decode::read_value(&mut cursor)?;
    let rest = bytes.len() - cursor.position() as usize;
    if rest > 0 {
        return Err(CodecError::TrailingBytes(rest));
    }
    Ok(value)
}

/// Encodes a sequence of values back-to-back into one buffer.
pub fn encode_multi(values: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for value in values {
        rmpv::encode::write_value(&mut buf, value)?;
    }
    Ok(buf)
}

/// Decodes values until the buffer is exhausted.
///
/// An empty buffer decodes to an empty sequence. A buffer ending mid-value is
/// an error; values already parsed are discarded.
pub fn decode_multi(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut cursor = Cursor::new(bytes);
    let mut values = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        values.push(rmpv::decode::read_value(&mut cursor)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_round_trips_one_value() {
        let value = Value::Array(vec![
            Value::from(42),
            Value::from("hello"),
            Value::from(true),
        ]);
        let bytes = encode_one(&value).unwrap();
        assert_eq!(decode_one(&bytes).unwrap(), value);
    }

    #[test]
    fn single_rejects_trailing_bytes() {
        let mut bytes = encode_one(&Value::from(1)).unwrap();
        bytes.extend_from_slice(&encode_one(&Value::from(2)).unwrap());
        assert!(matches!(
            decode_one(&bytes),
            Err(CodecError::TrailingBytes(_))
        ));
    }

    #[test]
    fn multi_is_concatenation_of_singles() {
        let values = vec![Value::from(7), Value::from("x"), Value::Nil];
        let multi = encode_multi(&values).unwrap();

        let mut concat = Vec::new();
        for value in &values {
            concat.extend_from_slice(&encode_one(value).unwrap());
        }
        assert_eq!(multi, concat);
        assert_eq!(decode_multi(&multi).unwrap(), values);
    }

    #[test]
    fn multi_differs_from_array_encoding() {
        let values = vec![Value::from(1), Value::from(2)];
        let multi = encode_multi(&values).unwrap();
        let as_array = encode_one(&Value::Array(values)).unwrap();
        assert_ne!(multi, as_array);
        // The array is one value; the multi buffer is two.
        assert_eq!(decode_multi(&as_array).unwrap().len(), 1);
        assert_eq!(decode_multi(&multi).unwrap().len(), 2);
    }

    #[test]
    fn multi_empty_buffer_is_empty_sequence() {
        assert!(decode_multi(&[]).unwrap().is_empty());
    }

    #[test]
    fn multi_truncated_tail_is_an_error() {
        let mut bytes = encode_multi(&[Value::from(1), Value::from("world")]).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(decode_multi(&bytes).is_err());
    }
}
