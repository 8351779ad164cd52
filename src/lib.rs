#![forbid(unsafe_code)]

//! Shared library behind the cliptube binaries: timeline export pipeline,
//! metadata persistence, object storage and runtime configuration.

pub mod config;
pub mod error;
pub mod export;
pub mod filter_graph;
pub mod metadata;
pub mod probe;
pub mod process;
pub mod publish;
pub mod security;
pub mod storage;
pub mod timeline;
