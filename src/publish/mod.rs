// file: src/publish/mod.rs
// version: 1.0.0
// guid: 1b6e9d2a-8c4f-4e31-b7a5-3d0f2e1c9b8a

//! Publishing to a local public image tree

pub mod staging;
pub mod storage;

pub use staging::StagingDir;
pub use storage::{PublicStorage, DEFAULT_PROVIDER, STAGE_PUBLIC};
