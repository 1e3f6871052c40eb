//! Core data models for the tus upload server.
//!
//! These types describe uploads and the protocol vocabulary around them
//! (metadata, extensions, checksums). They carry no I/O; storage backends
//! persist them and handlers render them into headers.

pub mod checksum;
pub mod extension;
pub mod metadata;
pub mod upload;
