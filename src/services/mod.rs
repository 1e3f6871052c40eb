//! Upload storage: the backend contract and its implementations.

pub mod file_store;
pub mod locks;
pub mod memory_store;
pub mod store;
