//! # Handshake Metadata
//!
//! The first exchange with the core: the runtime sends an [`InitRequest`]
//! describing itself and receives back a [`MetadataSnapshot`], the full flat
//! description of every package, module, model, handler, rpc, schema, and
//! field known to the deployment.
//!
//! Rows arrive as parallel tables keyed by scoped ids. Resolution into an
//! actual schema graph happens in [`crate::schema`]; this module only carries
//! the bytes faithfully. Field names here are wire names and must not change.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Failures in the handshake serialization.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The init request could not be encoded.
    #[error("init request encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// The snapshot bytes did not match the expected table layout.
    #[error("metadata snapshot decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

// ============================================================================
//  INIT REQUEST
// ============================================================================

/// The opening message of the handshake, encoded as a string-keyed map.
#[derive(Debug, Clone, Serialize)]
pub struct InitRequest {
    /// Run in development mode (richer diagnostics on the core side).
    pub dev: bool,
    /// Listen address override, if the embedder picked one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    /// Identifies this runtime flavor and version to the core.
    pub sdk: String,
    /// Path to an on-disk deployment config, when not served by the peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hfn_config_path: Option<String>,
    /// Names of the locally registered packages, main package as `""`.
    pub pkg_names: Vec<String>,
}

impl InitRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

// ============================================================================
//  SNAPSHOT TABLES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRow {
    pub id: u32,
    pub name: String,
    #[serde(rename = "fullName")]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRow {
    pub id: u32,
    pub name: String,
    pub package_id: u32,
}

/// A named data shape inside a module. A row whose `name` is empty marks the
/// module's state model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRow {
    pub id: u32,
    pub name: String,
    pub schema_id: u32,
    pub package_id: u32,
    pub module_id: u32,
}

/// A handler the peer believes the module exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRow {
    pub id: u32,
    pub name: String,
    pub schema_id: u32,
    pub package_id: u32,
    pub module_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRow {
    pub id: u32,
    pub name: String,
    pub req_schema_id: u32,
    pub res_schema_id: u32,
    pub package_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRow {
    pub id: u32,
    pub package_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRow {
    pub id: u32,
    pub name: String,
    /// Type tag: one char for a basic type, a longer string for a reference
    /// to another schema's name key.
    pub t: String,
    pub is_array: bool,
    pub package_id: u32,
    pub schema_id: u32,
}

/// Everything the peer knows about the deployment, as flat row tables.
///
/// Ids are scoped: a schema id is unique within its package, a module id
/// within its package, and so on. Cross-table references therefore always
/// carry the owning `package_id` alongside the local id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    #[serde(default)]
    pub upstream_id: String,
    pub packages: Vec<PackageRow>,
    pub modules: Vec<ModuleRow>,
    pub models: Vec<ModelRow>,
    pub hfns: Vec<HandlerRow>,
    pub rpcs: Vec<RpcRow>,
    pub schemas: Vec<SchemaRow>,
    pub fields: Vec<FieldRow>,
}

impl MetadataSnapshot {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encodes the snapshot the way a core would send it (string-keyed maps).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn package(&self, id: u32) -> Option<&PackageRow> {
        self.packages.iter().find(|row| row.id == id)
    }

    pub fn module(&self, package_id: u32, id: u32) -> Option<&ModuleRow> {
        self.modules
            .iter()
            .find(|row| row.id == id && row.package_id == package_id)
    }

    /// The model row bound to a schema, if any.
    pub fn model_for_schema(&self, package_id: u32, schema_id: u32) -> Option<&ModelRow> {
        self.models
            .iter()
            .find(|row| row.schema_id == schema_id && row.package_id == package_id)
    }

    /// The handler row bound to a schema, if any.
    pub fn handler_for_schema(&self, package_id: u32, schema_id: u32) -> Option<&HandlerRow> {
        self.hfns
            .iter()
            .find(|row| row.schema_id == schema_id && row.package_id == package_id)
    }

    /// Fields of one schema, in table order.
    pub fn fields_of(&self, package_id: u32, schema_id: u32) -> impl Iterator<Item = &FieldRow> {
        self.fields
            .iter()
            .filter(move |row| row.schema_id == schema_id && row.package_id == package_id)
    }
}

// ============================================================================
//  SNAPSHOT BUILDER
// ============================================================================

/// Fluent construction of a [`MetadataSnapshot`].
///
/// Embedders use this to describe a deployment programmatically, and the test
/// suite uses it to stand up cores without a live peer.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    upstream_id: String,
    packages: Vec<PackageRow>,
    modules: Vec<ModuleRow>,
    models: Vec<ModelRow>,
    hfns: Vec<HandlerRow>,
    rpcs: Vec<RpcRow>,
    schemas: Vec<SchemaRow>,
    fields: Vec<FieldRow>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upstream_id(mut self, id: impl Into<String>) -> Self {
        self.upstream_id = id.into();
        self
    }

    /// Adds a package row. The main package has id `0` and the empty name.
    pub fn package(mut self, id: u32, name: impl Into<String>) -> Self {
        self.packages.push(PackageRow {
            id,
            name: name.into(),
            full_name: None,
        });
        self
    }

    pub fn module(mut self, package_id: u32, id: u32, name: impl Into<String>) -> Self {
        self.modules.push(ModuleRow {
            id,
            name: name.into(),
            package_id,
        });
        self
    }

    pub fn schema(mut self, package_id: u32, id: u32) -> Self {
        self.schemas.push(SchemaRow { id, package_id });
        self
    }

    pub fn field(
        mut self,
        package_id: u32,
        schema_id: u32,
        id: u32,
        name: impl Into<String>,
        t: impl Into<String>,
        is_array: bool,
    ) -> Self {
        self.fields.push(FieldRow {
            id,
            name: name.into(),
            t: t.into(),
            is_array,
            package_id,
            schema_id,
        });
        self
    }

    /// Binds a schema to a module as its state model (the empty model name).
    pub fn state_model(mut self, package_id: u32, module_id: u32, id: u32, schema_id: u32) -> Self {
        self.models.push(ModelRow {
            id,
            name: String::new(),
            schema_id,
            package_id,
            module_id,
        });
        self
    }

    /// Binds a schema to a module as a named model.
    pub fn model(
        mut self,
        package_id: u32,
        module_id: u32,
        id: u32,
        name: impl Into<String>,
        schema_id: u32,
    ) -> Self {
        self.models.push(ModelRow {
            id,
            name: name.into(),
            schema_id,
            package_id,
            module_id,
        });
        self
    }

    /// Declares a handler and binds a schema as its request shape.
    pub fn handler(
        mut self,
        package_id: u32,
        module_id: u32,
        id: u32,
        name: impl Into<String>,
        schema_id: u32,
    ) -> Self {
        self.hfns.push(HandlerRow {
            id,
            name: name.into(),
            schema_id,
            package_id,
            module_id,
        });
        self
    }

    pub fn rpc(
        mut self,
        package_id: u32,
        id: u32,
        name: impl Into<String>,
        req_schema_id: u32,
        res_schema_id: u32,
    ) -> Self {
        self.rpcs.push(RpcRow {
            id,
            name: name.into(),
            req_schema_id,
            res_schema_id,
            package_id,
        });
        self
    }

    pub fn build(self) -> MetadataSnapshot {
        MetadataSnapshot {
            upstream_id: self.upstream_id,
            packages: self.packages,
            modules: self.modules,
            models: self.models,
            hfns: self.hfns,
            rpcs: self.rpcs,
            schemas: self.schemas,
            fields: self.fields,
        }
    }
}
