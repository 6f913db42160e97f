//! # HyphaRun
//!
//! The runtime half of the SDK: registration, the metadata handshake, and
//! the dispatch loop that turns inbound frames into handler calls.
//!
//! A process registers [`module::Package`]s, hands the runtime a
//! [`conduit::Conduit`] to the native core, and calls [`runtime::run`]. The
//! runtime handshakes, intersects what the core's deployment declares with
//! what the process implements, and then loops: decode a frame, find the
//! handler, decode the request record, run the hooks and the handler.
//!
//! ## Architecture
//!
//! - [`conduit`]: the trait the native core is seen through.
//! - [`module`]: packages, modules, and handler tables.
//! - [`hooks`]: package-level middleware.
//! - [`registry`]: the declared-implemented intersection, keyed by id triple.
//! - [`context`]: what a handler gets, and its ways back out.
//! - [`runtime`]: startup and the dispatch loop.
//! - [`mock_conduit`]: in-process cores for tests and demos.
//!
//! Wire formats, schemas, and records live one crate down, in `hypharpc`.

pub mod conduit;
pub mod context;
pub mod hooks;
pub mod mock_conduit;
pub mod module;
pub mod registry;
pub mod runtime;

#[cfg(test)]
mod tests;
