//! # HyphaRPC
//!
//! The wire layer of the Hypha runtime: MessagePack framing, handshake
//! metadata, the schema registry, and schema-bound dynamic records.
//!
//! ## Architecture
//!
//! Everything flows from the [`metadata::MetadataSnapshot`] delivered by the
//! core during the handshake. [`schema::SchemaRegistry::build`] resolves it
//! once into an immutable alias map of `Arc<Schema>`s, and every
//! [`model::Record`] validates against those schemas from then on. The codec
//! and envelope modules know nothing about schemas; they move framed values.

pub mod codec;
pub mod envelope;
pub mod metadata;
pub mod model;
pub mod schema;
