#![forbid(unsafe_code)]

//! Shared building blocks for the Tubely backend: runtime configuration, the
//! video metadata store, bearer-token security and on-disk asset storage.

pub mod assets;
pub mod config;
pub mod metadata;
pub mod security;
