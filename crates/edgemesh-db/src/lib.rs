//! Embedded SQLite store for the EdgeMesh coordinator.
//!
//! This crate owns the schema and the raw query layer. Higher-level
//! coordination rules (leasing, retries, job status derivation) live in
//! `edgemesh-core`; nothing outside that crate should talk to the store.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
