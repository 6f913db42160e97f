//! # Schema Registry
//!
//! Resolves the flat metadata tables into an immutable, multiply-keyed map of
//! [`Schema`]s. Built exactly once, right after the handshake, and shared
//! behind `Arc` for the life of the process.
//!
//! ## Keys
//!
//! Every schema is reachable under several aliases, all pointing at the same
//! `Arc<Schema>`:
//!
//! - dotted name keys like `chat.Room.send` (the package prefix is dropped
//!   for the main package, id 0),
//! - `model-{pkg}-{module}-{model}` for model bindings,
//! - `hfn-{pkg}-{module}-{hfn}` for handler request bindings,
//! - `{pkg}-{schema}` for the raw schema row.
//!
//! ## Invariants
//!
//! - The build is fail-fast: unknown type tags, dangling owner rows, and a
//!   schema claimed as both a state shape and a request shape all abort.
//! - A schema's `module_id` is set only by an empty-named model row, which
//!   marks it as the module's state shape.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::metadata::MetadataSnapshot;
use crate::metadata::ModuleRow;
use crate::metadata::PackageRow;

/// Fatal problems found while resolving the metadata tables.
#[derive(Debug, Error)]
pub enum SchemaBuildError {
    /// A field carried a single-character tag outside the basic set.
    #[error("schema {package_id}-{schema_id}: field `{field}` has unknown type tag `{tag}`")]
    UnknownTypeTag {
        package_id: u32,
        schema_id: u32,
        field: String,
        tag: String,
    },
    /// A schema row was claimed as both a module state shape and a handler
    /// request shape.
    #[error("schema {package_id}-{schema_id} is bound as both a state shape and a request shape")]
    BoundTwice { package_id: u32, schema_id: u32 },
    /// A binding row named a package that is not in the snapshot.
    #[error("{referent} points at missing package {package_id}")]
    DanglingPackage { package_id: u32, referent: String },
    /// A binding row named a module that is not in the snapshot.
    #[error("{referent} points at missing module {package_id}-{module_id}")]
    DanglingModule {
        package_id: u32,
        module_id: u32,
        referent: String,
    },
}

pub type Result<T> = std::result::Result<T, SchemaBuildError>;

// ============================================================================
//  TYPE TAGS
// ============================================================================

/// The five basic field types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BasicType {
    Str,
    Int,
    Float,
    Bool,
    Bytes,
}

impl BasicType {
    /// Maps a single-character wire tag to its type.
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            's' => Some(Self::Str),
            'i' => Some(Self::Int),
            'f' => Some(Self::Float),
            'b' => Some(Self::Bool),
            't' => Some(Self::Bytes),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Int => "int32",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A field's declared type: basic, or a reference to another schema by key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Basic(BasicType),
    /// The target schema's dotted name key, resolved through the registry at
    /// validation time.
    Reference(String),
}

impl TypeTag {
    /// Parses a raw wire tag. One character selects a basic type; anything
    /// longer is a reference key. Empty or unknown single tags are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(tag), None) => BasicType::from_tag(tag).map(Self::Basic),
            (Some(_), Some(_)) => Some(Self::Reference(raw.to_string())),
            (None, _) => None,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic(basic) => basic.fmt(f),
            Self::Reference(key) => write!(f, "record `{}`", key),
        }
    }
}

// ============================================================================
//  SCHEMAS
// ============================================================================

/// One field of a schema.
#[derive(Clone, Debug)]
pub struct Field {
    pub id: u32,
    pub name: String,
    pub ty: TypeTag,
    pub is_array: bool,
    pub package_id: u32,
    pub schema_id: u32,
}

/// An immutable field table, looked up by field name or by field id.
#[derive(Debug)]
pub struct Schema {
    pub id: u32,
    pub package_id: u32,
    /// Set iff an empty-named model row binds this schema to a module as its
    /// state shape.
    pub module_id: Option<u32>,
    /// Set iff a handler row binds this schema as its request shape.
    pub handler_id: Option<u32>,
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
}

impl Schema {
    fn new(id: u32, package_id: u32) -> Self {
        Self {
            id,
            package_id,
            module_id: None,
            handler_id: None,
            fields: Vec::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    fn push_field(&mut self, field: Field) {
        let idx = self.fields.len();
        self.by_name.insert(field.name.clone(), idx);
        self.by_id.insert(field.id, idx);
        self.fields.push(field);
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|idx| &self.fields[*idx])
    }

    pub fn field_by_id(&self, id: u32) -> Option<&Field> {
        self.by_id.get(&id).map(|idx| &self.fields[*idx])
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// True when this schema is some module's state shape.
    pub fn is_state(&self) -> bool {
        self.module_id.is_some()
    }
}

// ============================================================================
//  REGISTRY
// ============================================================================

/// All schemas of the deployment, keyed by every alias they answer to.
#[derive(Debug)]
pub struct SchemaRegistry {
    entries: HashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// Resolves a snapshot into a registry. Call once after the handshake.
    pub fn build(snapshot: &MetadataSnapshot) -> Result<Self> {
        let mut entries: HashMap<String, Arc<Schema>> = HashMap::new();

        for row in &snapshot.schemas {
            let mut schema = Schema::new(row.id, row.package_id);
            for field_row in snapshot.fields_of(row.package_id, row.id) {
                let ty = TypeTag::parse(&field_row.t).ok_or_else(|| {
                    SchemaBuildError::UnknownTypeTag {
                        package_id: row.package_id,
                        schema_id: row.id,
                        field: field_row.name.clone(),
                        tag: field_row.t.clone(),
                    }
                })?;
                schema.push_field(Field {
                    id: field_row.id,
                    name: field_row.name.clone(),
                    ty,
                    is_array: field_row.is_array,
                    package_id: field_row.package_id,
                    schema_id: field_row.schema_id,
                });
            }

            let mut aliases: Vec<String> = Vec::new();

            if let Some(model) = snapshot.model_for_schema(row.package_id, row.id) {
                let referent = format!("model {} (package {})", model.id, model.package_id);
                let (package, module) =
                    resolve_owner(snapshot, model.package_id, model.module_id, &referent)?;
                let leaf = if model.name.is_empty() {
                    schema.module_id = Some(model.module_id);
                    "State"
                } else {
                    model.name.as_str()
                };
                aliases.push(name_key(package, module, leaf));
                aliases.push(model_alias(model.package_id, model.module_id, model.id));
            }

            if let Some(handler) = snapshot.handler_for_schema(row.package_id, row.id) {
                if schema.module_id.is_some() {
                    return Err(SchemaBuildError::BoundTwice {
                        package_id: row.package_id,
                        schema_id: row.id,
                    });
                }
                let referent = format!("handler {} (package {})", handler.id, handler.package_id);
                let (package, module) =
                    resolve_owner(snapshot, handler.package_id, handler.module_id, &referent)?;
                schema.handler_id = Some(handler.id);
                aliases.push(name_key(package, module, &handler.name));
                aliases.push(handler_alias(
                    handler.package_id,
                    handler.module_id,
                    handler.id,
                ));
            }

            aliases.push(id_alias(row.package_id, row.id));

            let schema = Arc::new(schema);
            for alias in aliases {
                entries.insert(alias, Arc::clone(&schema));
            }
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Schema>> {
        self.entries.get(key)
    }

    /// The request shape of one handler, by its id triple.
    pub fn request_schema(
        &self,
        package_id: u32,
        module_id: u32,
        handler_id: u32,
    ) -> Option<&Arc<Schema>> {
        self.get(&handler_alias(package_id, module_id, handler_id))
    }

    /// Number of registered keys, aliases included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn resolve_owner<'a>(
    snapshot: &'a MetadataSnapshot,
    package_id: u32,
    module_id: u32,
    referent: &str,
) -> Result<(&'a PackageRow, &'a ModuleRow)> {
    let package = snapshot
        .package(package_id)
        .ok_or_else(|| SchemaBuildError::DanglingPackage {
            package_id,
            referent: referent.to_string(),
        })?;
    let module =
        snapshot
            .module(package_id, module_id)
            .ok_or_else(|| SchemaBuildError::DanglingModule {
                package_id,
                module_id,
                referent: referent.to_string(),
            })?;
    Ok((package, module))
}

/// Dotted name key. The main package (id 0) contributes no prefix.
fn name_key(package: &PackageRow, module: &ModuleRow, leaf: &str) -> String {
    if package.id == 0 {
        format!("{}.{}", module.name, leaf)
    } else {
        format!("{}.{}.{}", package.name, module.name, leaf)
    }
}

fn model_alias(package_id: u32, module_id: u32, model_id: u32) -> String {
    format!("model-{}-{}-{}", package_id, module_id, model_id)
}

fn handler_alias(package_id: u32, module_id: u32, handler_id: u32) -> String {
    format!("hfn-{}-{}-{}", package_id, module_id, handler_id)
}

fn id_alias(package_id: u32, schema_id: u32) -> String {
    format!("{}-{}", package_id, schema_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_tags_parse() {
        assert_eq!(TypeTag::parse("s"), Some(TypeTag::Basic(BasicType::Str)));
        assert_eq!(TypeTag::parse("i"), Some(TypeTag::Basic(BasicType::Int)));
        assert_eq!(TypeTag::parse("f"), Some(TypeTag::Basic(BasicType::Float)));
        assert_eq!(TypeTag::parse("b"), Some(TypeTag::Basic(BasicType::Bool)));
        assert_eq!(TypeTag::parse("t"), Some(TypeTag::Basic(BasicType::Bytes)));
    }

    #[test]
    fn longer_tags_are_references() {
        assert_eq!(
            TypeTag::parse("chat.Room.State"),
            Some(TypeTag::Reference("chat.Room.State".into()))
        );
        // Two chars is already a reference, even if it starts with a basic tag.
        assert_eq!(TypeTag::parse("ss"), Some(TypeTag::Reference("ss".into())));
    }

    #[test]
    fn unknown_and_empty_tags_are_rejected() {
        assert_eq!(TypeTag::parse("x"), None);
        assert_eq!(TypeTag::parse(""), None);
    }
}
