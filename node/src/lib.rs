//! Library surface of the mesh node binary, so integration tests can
//! mount the same router against in-process nodes.

pub mod server;
