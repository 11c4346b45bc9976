//! Git LFS batch API.
//!
//! Implements the negotiation half of the large-file protocol: clients POST
//! a batch of `{oid, size}` descriptors and get back, per object, either a
//! pre-signed transfer action against the object store or a per-object
//! error. Payload bytes never pass through this server.

pub mod batch;

pub use batch::{BatchError, BatchRequest, BatchResponse, LfsHandler, Operation};
