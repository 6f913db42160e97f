//! # Envelopes and Tagged Messages
//!
//! The outermost framing exchanged with the core, and the tagged messages
//! carried inside envelope payloads. Everything here uses multiple-mode
//! framing: discrete values back-to-back, never wrapped in an array.
//!
//! ## Layout
//!
//! - Inbound envelope: `packageId, headers, payload, socketId`
//! - Outbound envelope: `0, packageId, {}, payload`
//! - Invoke (tag 1): `1, moduleId, handlerId, cookies, body`
//! - State push (tag 2): `2, packageId, moduleId, recordBytes`
//! - Set-cookie (tag 3): `3, name, value, maxAgeSeconds, isPrivate`
//!
//! Inbound tags other than 1 belong to the peer's other products and decode
//! to [`Message::Other`]; dropping them is the caller's business, not an
//! error here.

use std::collections::HashMap;

use rmpv::Value as Wire;
use thiserror::Error;

use crate::codec;
use crate::codec::CodecError;

pub const TAG_INVOKE: u64 = 1;
pub const TAG_STATE_PUSH: u64 = 2;
pub const TAG_SET_COOKIE: u64 = 3;

/// Structural failures in envelope or message framing.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The frame held the wrong number of items.
    #[error("{context}: expected {expected} items, got {got}")]
    Arity {
        context: &'static str,
        expected: usize,
        got: usize,
    },
    /// An item had an unexpected MessagePack kind.
    #[error("{context}: unexpected value kind")]
    Kind { context: &'static str },
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

// ============================================================================
//  ENVELOPES
// ============================================================================

/// One inbound frame from the core.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub package_id: u32,
    pub headers: HashMap<String, String>,
    /// Encoded inner message; see [`Message::decode`].
    pub payload: Vec<u8>,
    /// Identifies the originating connection; echoed back on sends.
    pub socket_id: String,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let items = codec::decode_multi(bytes)?;
        let [package_id, headers, payload, socket_id]: [Wire; 4] =
            items.try_into().map_err(|items: Vec<Wire>| {
                EnvelopeError::Arity {
                    context: "envelope",
                    expected: 4,
                    got: items.len(),
                }
            })?;
        Ok(Self {
            package_id: expect_u32(&package_id, "envelope package id")?,
            headers: expect_string_map(headers, "envelope headers")?,
            payload: expect_bin(payload, "envelope payload")?,
            socket_id: expect_str(socket_id, "envelope socket id")?,
        })
    }

    /// Frames an already-encoded payload for the outbound direction.
    pub fn wrap(package_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(codec::encode_multi(&[
            Wire::from(0u32),
            Wire::from(package_id),
            Wire::Map(Vec::new()),
            Wire::Binary(payload.to_vec()),
        ])?)
    }
}

// ============================================================================
//  INBOUND MESSAGES
// ============================================================================

/// A handler invocation (tag 1).
#[derive(Debug, Clone, PartialEq)]
pub struct Invoke {
    pub module_id: u32,
    pub handler_id: u32,
    pub cookies: HashMap<String, String>,
    /// Encoded request record; `None` for body-less invocations.
    pub body: Option<Vec<u8>>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Invoke(Invoke),
    /// A tag this runtime does not consume.
    Other(u64),
}

impl Message {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let items = codec::decode_multi(bytes)?;
        let tag = match items.first() {
            Some(item) => item.as_u64().ok_or(EnvelopeError::Kind {
                context: "message tag",
            })?,
            None => {
                return Err(EnvelopeError::Arity {
                    context: "message",
                    expected: 1,
                    got: 0,
                });
            }
        };
        if tag != TAG_INVOKE {
            return Ok(Self::Other(tag));
        }

        let [_tag, module_id, handler_id, cookies, body]: [Wire; 5] =
            items.try_into().map_err(|items: Vec<Wire>| {
                EnvelopeError::Arity {
                    context: "invoke",
                    expected: 5,
                    got: items.len(),
                }
            })?;
        Ok(Self::Invoke(Invoke {
            module_id: expect_u32(&module_id, "invoke module id")?,
            handler_id: expect_u32(&handler_id, "invoke handler id")?,
            cookies: expect_string_map(cookies, "invoke cookies")?,
            body: match body {
                Wire::Nil => None,
                Wire::Binary(bytes) => Some(bytes),
                _ => {
                    return Err(EnvelopeError::Kind {
                        context: "invoke body",
                    });
                }
            },
        }))
    }
}

// ============================================================================
//  OUTBOUND MESSAGES
// ============================================================================

/// Encoder for a state push (tag 2).
pub struct StatePush<'a> {
    pub package_id: u32,
    pub module_id: u32,
    /// The encoded state record.
    pub record: &'a [u8],
}

impl StatePush<'_> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec::encode_multi(&[
            Wire::from(TAG_STATE_PUSH),
            Wire::from(self.package_id),
            Wire::from(self.module_id),
            Wire::Binary(self.record.to_vec()),
        ])?)
    }
}

/// Encoder for a set-cookie instruction (tag 3).
pub struct SetCookie<'a> {
    pub name: &'a str,
    pub value: &'a str,
    /// `0` means a session cookie.
    pub max_age_seconds: u32,
    pub private: bool,
}

impl SetCookie<'_> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec::encode_multi(&[
            Wire::from(TAG_SET_COOKIE),
            Wire::from(self.name),
            Wire::from(self.value),
            Wire::from(self.max_age_seconds),
            Wire::from(self.private),
        ])?)
    }
}

// ============================================================================
//  ITEM HELPERS
// ============================================================================

fn expect_u32(value: &Wire, context: &'static str) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(EnvelopeError::Kind { context })
}

fn expect_bin(value: Wire, context: &'static str) -> Result<Vec<u8>> {
    match value {
        Wire::Binary(bytes) => Ok(bytes),
        _ => Err(EnvelopeError::Kind { context }),
    }
}

fn expect_str(value: Wire, context: &'static str) -> Result<String> {
    match value {
        Wire::String(s) => s.into_str().ok_or(EnvelopeError::Kind { context }),
        _ => Err(EnvelopeError::Kind { context }),
    }
}

fn expect_string_map(value: Wire, context: &'static str) -> Result<HashMap<String, String>> {
    let Wire::Map(pairs) = value else {
        return Err(EnvelopeError::Kind { context });
    };
    let mut map = HashMap::with_capacity(pairs.len());
    for (key, val) in pairs {
        let (Wire::String(key), Wire::String(val)) = (key, val) else {
            return Err(EnvelopeError::Kind { context });
        };
        match (key.into_str(), val.into_str()) {
            (Some(key), Some(val)) => {
                map.insert(key, val);
            }
            _ => return Err(EnvelopeError::Kind { context }),
        }
    }
    Ok(map)
}
