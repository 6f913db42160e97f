//! # Handler Registry
//!
//! Resolves which handlers are live for this process. The peer's metadata
//! snapshot says what the deployment *declares*; the local packages say what
//! this process *implements*; the registry is their intersection, keyed by
//! the `(package, module, handler)` id triple that invoke frames carry.
//!
//! Anything declared but not implemented here is another process's problem
//! and is skipped quietly. Anything implemented but not declared never
//! becomes addressable. A declared-and-implemented handler whose request
//! schema is missing from the schema registry is a build error: dispatching
//! to it could only ever produce garbage records.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use hypharpc::metadata::MetadataSnapshot;
use hypharpc::schema::Schema;
use hypharpc::schema::SchemaRegistry;

use crate::hooks::Hooks;
use crate::module::Handler;
use crate::module::Package;

// ============================================================================
//  ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    /// A registered handler has no request schema in the schema registry.
    #[error("handler `{name}` ({key}) has no request schema")]
    MissingRequestSchema { key: HandlerKey, name: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ============================================================================
//  KEYS & ENTRIES
// ============================================================================

/// The id triple an invoke frame addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub package_id: u32,
    pub module_id: u32,
    pub handler_id: u32,
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.package_id, self.module_id, self.handler_id)
    }
}

/// One live handler: the callable, the shape of its request, and the hooks
/// of the package it came from.
pub struct HandlerEntry {
    pub(crate) handler: Handler,
    pub(crate) request_schema: Arc<Schema>,
    pub(crate) hooks: Arc<Hooks>,
}

impl HandlerEntry {
    pub fn request_schema(&self) -> &Arc<Schema> {
        &self.request_schema
    }
}

// ============================================================================
//  THE REGISTRY
// ============================================================================

pub struct HandlerRegistry {
    entries: HashMap<HandlerKey, HandlerEntry>,
}

impl HandlerRegistry {
    /// Intersects the local packages with the peer's snapshot.
    ///
    /// Packages match by exact name, modules by lowercased name, handlers by
    /// exact method name. Fails fast if a matched handler's request schema
    /// is not in `schemas`.
    pub fn build(
        packages: Vec<Package>,
        snapshot: &MetadataSnapshot,
        schemas: &SchemaRegistry,
    ) -> Result<Self> {
        let mut entries = HashMap::new();
        for package in packages {
            let Some(package_row) = snapshot.packages.iter().find(|row| row.name == package.name)
            else {
                debug!(package = %package.name, "package not in peer metadata, skipping");
                continue;
            };
            let hooks = Arc::new(package.hooks);
            for module_row in snapshot
                .modules
                .iter()
                .filter(|row| row.package_id == package_row.id)
            {
                let Some(module) = package.modules.get(&module_row.name.to_lowercase()) else {
                    debug!(
                        package = %package.name,
                        module = %module_row.name,
                        "module not implemented locally, skipping"
                    );
                    continue;
                };
                for handler_row in snapshot.hfns.iter().filter(|row| {
                    row.package_id == package_row.id && row.module_id == module_row.id
                }) {
                    let Some(handler) = module.handlers.get(&handler_row.name) else {
                        continue;
                    };
                    let key = HandlerKey {
                        package_id: package_row.id,
                        module_id: module_row.id,
                        handler_id: handler_row.id,
                    };
                    let request_schema = schemas
                        .request_schema(key.package_id, key.module_id, key.handler_id)
                        .cloned()
                        .ok_or_else(|| RegistryError::MissingRequestSchema {
                            key,
                            name: handler_row.name.clone(),
                        })?;
                    debug!(%key, handler = %handler_row.name, "registered handler");
                    entries.insert(
                        key,
                        HandlerEntry {
                            handler: Arc::clone(handler),
                            request_schema,
                            hooks: Arc::clone(&hooks),
                        },
                    );
                }
            }
        }
        Ok(Self { entries })
    }

    pub(crate) fn get(&self, key: &HandlerKey) -> Option<&HandlerEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
