//! # Dynamic Records
//!
//! A [`Record`] is a schema-bound, insertion-ordered collection of field
//! values. It is the unit that crosses the wire: handler request bodies and
//! module state pushes are both records.
//!
//! ## Philosophy
//!
//! - **Strict**: a value either matches the field's declared type exactly or
//!   it is rejected. There is no coercion, no stringification, no truncation.
//!   [`Record::set`] reports the exact reason; wire decoding skips rejected
//!   fields and keeps going.
//! - **Schema-checked by construction**: every stored entry passed validation
//!   on the way in, so encoding never has to re-check and cannot fail on a
//!   type error.
//!
//! ## Invariants
//!
//! - Entry order is insertion order; overwriting a field keeps its position.
//! - `Scalar::Int` is `i32`, so range enforcement is a conversion concern at
//!   the wire and JSON boundaries, not a validation concern here.
//! - Nested records are validated against the reference target schema by
//!   identity (schema id and package id), not by shape.
//! - Recursion over nested records is bounded by [`MAX_DEPTH`] in both
//!   directions. Reference targets resolve lazily, so a self-referential
//!   schema is legal metadata and payload bytes control the nesting depth;
//!   past the limit, decode and encode abort instead of recursing further.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rmpv::Value as Wire;
use serde_json::Value as Json;
use thiserror::Error;

use crate::codec;
use crate::codec::CodecError;
use crate::codec::MAX_DEPTH;
use crate::schema::BasicType;
use crate::schema::Field;
use crate::schema::Schema;
use crate::schema::SchemaRegistry;
use crate::schema::TypeTag;

// ============================================================================
//  VALUES
// ============================================================================

/// A single field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Str(String),
    Int(i32),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Record(Record),
}

impl Scalar {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "int32",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Bytes(_) => "bytes",
            Self::Record(_) => "record",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self { Self::Str(v.to_string()) }
}
impl From<String> for Scalar {
    fn from(v: String) -> Self { Self::Str(v) }
}
impl From<i32> for Scalar {
    fn from(v: i32) -> Self { Self::Int(v) }
}
impl From<f64> for Scalar {
    fn from(v: f64) -> Self { Self::Float(v) }
}
impl From<bool> for Scalar {
    fn from(v: bool) -> Self { Self::Bool(v) }
}
impl From<Vec<u8>> for Scalar {
    fn from(v: Vec<u8>) -> Self { Self::Bytes(v) }
}
impl From<Record> for Scalar {
    fn from(v: Record) -> Self { Self::Record(v) }
}

/// A field slot: one scalar, or an array of scalars.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    One(Scalar),
    Many(Vec<Scalar>),
}

impl Value {
    pub fn one(scalar: impl Into<Scalar>) -> Self {
        Self::One(scalar.into())
    }

    pub fn many<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Scalar>,
    {
        Self::Many(items.into_iter().map(Into::into).collect())
    }

    pub fn as_one(&self) -> Option<&Scalar> {
        match self {
            Self::One(scalar) => Some(scalar),
            _ => None,
        }
    }

    pub fn as_many(&self) -> Option<&[Scalar]> {
        match self {
            Self::Many(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Self::One(v.into()) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Self::One(v.into()) }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self { Self::One(v.into()) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Self::One(v.into()) }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self { Self::One(v.into()) }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Self::One(v.into()) }
}
impl From<Record> for Value {
    fn from(v: Record) -> Self { Self::One(v.into()) }
}
impl From<Scalar> for Value {
    fn from(v: Scalar) -> Self { Self::One(v) }
}

// ============================================================================
//  ERRORS
// ============================================================================

/// Why [`Record::set`] refused a value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetError {
    /// The name is not a field of the schema.
    #[error("field `{0}` is not in the schema")]
    UnknownField(String),
    /// The field is declared as an array; a single value was given.
    #[error("field `{0}` is an array field; a single value was given")]
    ExpectedArray(String),
    /// The field holds a single value; an array was given.
    #[error("field `{0}` is a single-value field; an array was given")]
    ExpectedSingle(String),
    /// The value's type does not match the field's declared type.
    #[error("field `{field}` expects {expected}, got {got}")]
    WrongType {
        field: String,
        expected: String,
        got: &'static str,
    },
    /// A nested record is bound to a different schema than the field targets.
    #[error("field `{field}` expects a record of `{expected}`, got schema {got}")]
    WrongSchema {
        field: String,
        expected: String,
        got: String,
    },
    /// The field references a schema key that is not in the registry.
    #[error("field `{field}`: reference target `{target}` is not registered")]
    UnresolvedTarget { field: String, target: String },
}

/// Why [`Record::decode`] gave up on a payload.
///
/// Per-field validation misses are not here: a wire value that fails the
/// strict type check is skipped and decoding continues. These errors are the
/// structural ones that make the rest of the payload unreadable.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A field id slot held something other than an unsigned integer.
    #[error("field id slot holds a non-integer value")]
    MalformedFieldId,
    /// The payload named a field id the schema does not define.
    #[error("field id {0} is not in the schema")]
    UnknownFieldId(u64),
    /// The payload ended after a field id, before its value.
    #[error("field id {0} has no value item")]
    DanglingFieldId(u64),
    /// A reference-typed field held something other than the expected nested
    /// blob (or array of blobs).
    #[error("field `{0}`: payload shape does not match the declared type")]
    WrongShape(String),
    /// The field references a schema key that is not in the registry.
    #[error("field `{field}`: reference target `{target}` is not registered")]
    UnresolvedTarget { field: String, target: String },
    /// Nested records more than [`MAX_DEPTH`] levels deep. The payload
    /// controls the nesting, so the recursion has to stop somewhere short of
    /// the stack.
    #[error("record nesting exceeds {max} levels", max = MAX_DEPTH)]
    DepthLimit,
}

// ============================================================================
//  RECORDS
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    field_id: u32,
    name: String,
    value: Value,
}

/// A schema-bound dynamic record.
#[derive(Clone)]
pub struct Record {
    schema: Arc<Schema>,
    registry: Arc<SchemaRegistry>,
    entries: Vec<Entry>,
}

impl Record {
    pub fn new(schema: Arc<Schema>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            registry,
            entries: Vec::new(),
        }
    }

    /// Looks up a schema by any registry key and binds an empty record to it.
    pub fn named(registry: &Arc<SchemaRegistry>, key: &str) -> Option<Self> {
        let schema = registry.get(key)?.clone();
        Some(Self::new(schema, Arc::clone(registry)))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    // ------------------------------------------------------------------
    // map surface
    // ------------------------------------------------------------------

    /// Validates and stores a value. On rejection the record is unchanged.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), SetError> {
        let value = value.into();
        let schema = Arc::clone(&self.schema);
        let field = schema
            .field_by_name(name)
            .ok_or_else(|| SetError::UnknownField(name.to_string()))?;
        self.check(field, &value)?;
        self.insert(field.id, name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.value)
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name)
    }

    /// Removes a stored value, returning it if the field was set.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|entry| entry.name == name)?;
        Some(self.entries.remove(idx).value)
    }

    /// Names of the set fields, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ------------------------------------------------------------------
    // wire surface
    // ------------------------------------------------------------------

    /// Encodes the record as a flat pair sequence in multiple mode:
    /// `[field_id, value, field_id, value, ...]`. Nested records become
    /// opaque binary blobs; arrays of records become arrays of blobs.
    /// Nesting past [`MAX_DEPTH`] levels is a [`CodecError::DepthLimit`].
    pub fn encode(&self) -> codec::Result<Vec<u8>> {
        self.encode_at_depth(0)
    }

    fn encode_at_depth(&self, depth: usize) -> codec::Result<Vec<u8>> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthLimit);
        }
        let mut items: Vec<Wire> = Vec::with_capacity(self.entries.len() * 2);
        for entry in &self.entries {
            items.push(Wire::from(entry.field_id));
            items.push(encode_value(&entry.value, depth)?);
        }
        codec::encode_multi(&items)
    }

    /// Decodes a flat pair sequence into this record.
    ///
    /// Fields already set keep their values unless the payload overwrites
    /// them. Wire values that fail the strict type check are skipped; the
    /// structural failures in [`DecodeError`] abort and leave the record
    /// partially updated.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        self.decode_at_depth(bytes, 0)
    }

    fn decode_at_depth(&mut self, bytes: &[u8], depth: usize) -> Result<(), DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::DepthLimit);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let items = codec::decode_multi(bytes)?;
        let schema = Arc::clone(&self.schema);
        let mut iter = items.into_iter();
        while let Some(id_item) = iter.next() {
            let raw_id = id_item.as_u64().ok_or(DecodeError::MalformedFieldId)?;
            let field = u32::try_from(raw_id)
                .ok()
                .and_then(|id| schema.field_by_id(id))
                .ok_or(DecodeError::UnknownFieldId(raw_id))?;
            let raw = iter.next().ok_or(DecodeError::DanglingFieldId(raw_id))?;
            if let Some(value) = self.value_from_wire(field, raw, depth)? {
                // set can still refuse edge values (e.g. a NaN float); those
                // fields stay unset, matching the skip semantics above.
                let _ = self.set(&field.name, value);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // plain-object surface
    // ------------------------------------------------------------------

    /// Imports fields from a JSON object. Returns `false` (and does nothing)
    /// if the input is not an object. Unknown keys and values that fail the
    /// strict check are skipped. Bytes fields take base64 strings.
    pub fn from_object(&mut self, object: &Json) -> bool {
        let Json::Object(map) = object else {
            return false;
        };
        let schema = Arc::clone(&self.schema);
        for (key, raw) in map {
            let Some(field) = schema.field_by_name(key) else {
                continue;
            };
            let Some(value) = self.value_from_json(field, raw) else {
                continue;
            };
            let _ = self.set(key, value);
        }
        true
    }

    /// Exports the set fields as a JSON object, nested records included.
    /// Bytes become base64 strings; non-finite floats have no JSON form and
    /// become null.
    pub fn to_object(&self) -> Json {
        let mut map = serde_json::Map::with_capacity(self.entries.len());
        for entry in &self.entries {
            map.insert(entry.name.clone(), value_to_json(&entry.value));
        }
        Json::Object(map)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn insert(&mut self, field_id: u32, name: &str, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.name == name) {
            entry.value = value;
        } else {
            self.entries.push(Entry {
                field_id,
                name: name.to_string(),
                value,
            });
        }
    }

    fn check(&self, field: &Field, value: &Value) -> Result<(), SetError> {
        let scalars: &[Scalar] = match (field.is_array, value) {
            (true, Value::Many(items)) => items,
            (false, Value::One(one)) => std::slice::from_ref(one),
            (true, Value::One(_)) => return Err(SetError::ExpectedArray(field.name.clone())),
            (false, Value::Many(_)) => return Err(SetError::ExpectedSingle(field.name.clone())),
        };
        match &field.ty {
            TypeTag::Basic(basic) => {
                for scalar in scalars {
                    check_basic(&field.name, *basic, scalar)?;
                }
            }
            TypeTag::Reference(target) => {
                let target_schema =
                    self.registry
                        .get(target)
                        .ok_or_else(|| SetError::UnresolvedTarget {
                            field: field.name.clone(),
                            target: target.clone(),
                        })?;
                for scalar in scalars {
                    let Scalar::Record(record) = scalar else {
                        return Err(SetError::WrongType {
                            field: field.name.clone(),
                            expected: field.ty.to_string(),
                            got: scalar.kind(),
                        });
                    };
                    if record.schema.id != target_schema.id
                        || record.schema.package_id != target_schema.package_id
                    {
                        return Err(SetError::WrongSchema {
                            field: field.name.clone(),
                            expected: target.clone(),
                            got: format!(
                                "{}-{}",
                                record.schema.package_id, record.schema.id
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Converts one wire value for one field. `Ok(None)` means the value
    /// failed the strict check and the field should be skipped.
    fn value_from_wire(
        &self,
        field: &Field,
        raw: Wire,
        depth: usize,
    ) -> Result<Option<Value>, DecodeError> {
        match &field.ty {
            TypeTag::Basic(basic) => {
                if field.is_array {
                    let Wire::Array(items) = raw else {
                        return Ok(None);
                    };
                    let mut scalars = Vec::with_capacity(items.len());
                    for item in items {
                        match scalar_from_wire(*basic, item) {
                            Some(scalar) => scalars.push(scalar),
                            // One bad item rejects the whole array.
                            None => return Ok(None),
                        }
                    }
                    Ok(Some(Value::Many(scalars)))
                } else {
                    Ok(scalar_from_wire(*basic, raw).map(Value::One))
                }
            }
            TypeTag::Reference(target) => {
                let target_schema = self.registry.get(target).cloned().ok_or_else(|| {
                    DecodeError::UnresolvedTarget {
                        field: field.name.clone(),
                        target: target.clone(),
                    }
                })?;
                if field.is_array {
                    let Wire::Array(items) = raw else {
                        return Err(DecodeError::WrongShape(field.name.clone()));
                    };
                    let mut scalars = Vec::with_capacity(items.len());
                    for item in items {
                        scalars.push(Scalar::Record(self.nested_from_wire(
                            &target_schema,
                            item,
                            field,
                            depth,
                        )?));
                    }
                    Ok(Some(Value::Many(scalars)))
                } else {
                    let record = self.nested_from_wire(&target_schema, raw, field, depth)?;
                    Ok(Some(Value::One(Scalar::Record(record))))
                }
            }
        }
    }

    fn nested_from_wire(
        &self,
        target: &Arc<Schema>,
        raw: Wire,
        field: &Field,
        depth: usize,
    ) -> Result<Record, DecodeError> {
        let Wire::Binary(bytes) = raw else {
            return Err(DecodeError::WrongShape(field.name.clone()));
        };
        let mut record = Record::new(Arc::clone(target), Arc::clone(&self.registry));
        record.decode_at_depth(&bytes, depth + 1)?;
        Ok(record)
    }

    /// Converts one JSON value for one field, `None` on any miss.
    fn value_from_json(&self, field: &Field, raw: &Json) -> Option<Value> {
        match &field.ty {
            TypeTag::Basic(basic) => {
                if field.is_array {
                    let Json::Array(items) = raw else {
                        return None;
                    };
                    items
                        .iter()
                        .map(|item| scalar_from_json(*basic, item))
                        .collect::<Option<Vec<_>>>()
                        .map(Value::Many)
                } else {
                    scalar_from_json(*basic, raw).map(Value::One)
                }
            }
            TypeTag::Reference(target) => {
                let target_schema = self.registry.get(target)?.clone();
                if field.is_array {
                    let Json::Array(items) = raw else {
                        return None;
                    };
                    let mut scalars = Vec::with_capacity(items.len());
                    for item in items {
                        scalars.push(Scalar::Record(self.nested_from_json(&target_schema, item)?));
                    }
                    Some(Value::Many(scalars))
                } else {
                    Some(Value::One(Scalar::Record(
                        self.nested_from_json(&target_schema, raw)?,
                    )))
                }
            }
        }
    }

    fn nested_from_json(&self, target: &Arc<Schema>, raw: &Json) -> Option<Record> {
        if !raw.is_object() {
            return None;
        }
        let mut record = Record::new(Arc::clone(target), Arc::clone(&self.registry));
        record.from_object(raw);
        Some(record)
    }
}

impl PartialEq for Record {
    /// Structural equality: same schema identity, same entries in the same
    /// order.
    fn eq(&self, other: &Self) -> bool {
        self.schema.id == other.schema.id
            && self.schema.package_id == other.schema.package_id
            && self.entries == other.entries
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field(
                "schema",
                &format_args!("{}-{}", self.schema.package_id, self.schema.id),
            )
            .field("entries", &self.entries)
            .finish()
    }
}

// ============================================================================
//  CONVERSIONS
// ============================================================================

fn check_basic(field: &str, basic: BasicType, scalar: &Scalar) -> Result<(), SetError> {
    let mismatch = |got: &'static str| SetError::WrongType {
        field: field.to_string(),
        expected: basic.name().to_string(),
        got,
    };
    match (basic, scalar) {
        (BasicType::Str, Scalar::Str(_))
        | (BasicType::Int, Scalar::Int(_))
        | (BasicType::Bool, Scalar::Bool(_))
        | (BasicType::Bytes, Scalar::Bytes(_)) => Ok(()),
        (BasicType::Float, Scalar::Float(v)) => {
            if v.is_nan() {
                Err(mismatch("NaN"))
            } else {
                Ok(())
            }
        }
        _ => Err(mismatch(scalar.kind())),
    }
}

fn encode_value(value: &Value, depth: usize) -> codec::Result<Wire> {
    match value {
        Value::One(scalar) => encode_scalar(scalar, depth),
        Value::Many(items) => Ok(Wire::Array(
            items
                .iter()
                .map(|scalar| encode_scalar(scalar, depth))
                .collect::<codec::Result<Vec<_>>>()?,
        )),
    }
}

fn encode_scalar(scalar: &Scalar, depth: usize) -> codec::Result<Wire> {
    Ok(match scalar {
        Scalar::Str(v) => Wire::from(v.as_str()),
        Scalar::Int(v) => Wire::from(*v),
        Scalar::Float(v) => Wire::F64(*v),
        Scalar::Bool(v) => Wire::from(*v),
        Scalar::Bytes(v) => Wire::Binary(v.clone()),
        Scalar::Record(record) => Wire::Binary(record.encode_at_depth(depth + 1)?),
    })
}

fn scalar_from_wire(basic: BasicType, raw: Wire) -> Option<Scalar> {
    match (basic, raw) {
        (BasicType::Str, Wire::String(s)) => s.into_str().map(Scalar::Str),
        (BasicType::Int, Wire::Integer(n)) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Scalar::Int),
        (BasicType::Float, Wire::F64(v)) => Some(Scalar::Float(v)),
        (BasicType::Float, Wire::F32(v)) => Some(Scalar::Float(f64::from(v))),
        // Integers are valid floats on the wire; compact encoders use them.
        (BasicType::Float, Wire::Integer(n)) => match n.as_i64() {
            Some(v) => Some(Scalar::Float(v as f64)),
            None => n.as_u64().map(|v| Scalar::Float(v as f64)),
        },
        (BasicType::Bool, Wire::Boolean(v)) => Some(Scalar::Bool(v)),
        (BasicType::Bytes, Wire::Binary(v)) => Some(Scalar::Bytes(v)),
        _ => None,
    }
}

fn scalar_from_json(basic: BasicType, raw: &Json) -> Option<Scalar> {
    match basic {
        BasicType::Str => raw.as_str().map(|v| Scalar::Str(v.to_string())),
        BasicType::Int => raw
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Scalar::Int),
        BasicType::Float => raw.as_f64().map(Scalar::Float),
        BasicType::Bool => raw.as_bool().map(Scalar::Bool),
        BasicType::Bytes => raw
            .as_str()
            .and_then(|v| BASE64.decode(v).ok())
            .map(Scalar::Bytes),
    }
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::One(scalar) => scalar_to_json(scalar),
        Value::Many(items) => Json::Array(items.iter().map(scalar_to_json).collect()),
    }
}

fn scalar_to_json(scalar: &Scalar) -> Json {
    match scalar {
        Scalar::Str(v) => Json::String(v.clone()),
        Scalar::Int(v) => Json::from(*v),
        Scalar::Float(v) => serde_json::Number::from_f64(*v)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Scalar::Bool(v) => Json::Bool(*v),
        Scalar::Bytes(v) => Json::String(BASE64.encode(v)),
        Scalar::Record(record) => record.to_object(),
    }
}
