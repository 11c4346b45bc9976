//! HTTP layer.
//!
//! The axum-based server surface: smart HTTP protocol endpoints backed by
//! the external git executable, the LFS batch endpoint backed by the object
//! store, plus health and metrics. Compression, transparent request
//! decompression, and access logging wrap this router from `main`; nothing
//! in here inspects content encodings itself.

pub mod handler;
pub mod pktline;
